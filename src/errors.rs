use std::time::Duration;

/// Errors returned while rendering call templates
#[derive(thiserror::Error, Debug, displaydoc::Display)]
pub enum TemplateError {
    /// Template could not be compiled: {source}
    Syntax {
        /// The underlying template engine error
        source: minijinja::Error,
    },
    /// Rendered metadata is not a flat JSON object of strings: {source}
    MetadataJson {
        /// The underlying parse error
        source: serde_json::Error,
    },
}

/// Errors thrown when a rendered metadata entry can't be sent as gRPC metadata
#[derive(thiserror::Error, Debug, displaydoc::Display)]
pub enum InvalidMetadataError {
    /// Invalid metadata key '{key}': {source}
    InvalidKey {
        /// The invalid key
        key: String,
        /// The source error from tonic
        source: tonic::metadata::errors::InvalidMetadataKey,
    },
    /// Invalid metadata value for key '{key}': {source}
    InvalidValue {
        /// The key
        key: String,
        /// The source error from tonic
        source: tonic::metadata::errors::InvalidMetadataValue,
    },
}

/// Failures recorded on a [crate::CallResult] which don't come with a gRPC status attached
#[derive(thiserror::Error, Debug, displaydoc::Display, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Transport failed before a response arrived: {0}
    Transport(String),
    /// Response body failed: {0}
    Body(String),
    /// No terminal event arrived within {age:?} of the call being tagged
    Abandoned {
        /// How long the record had been live when it was evicted
        age: Duration,
    },
}

/// The identifier source could not produce random bytes: {0}
#[derive(thiserror::Error, Debug, displaydoc::Display)]
pub struct IdSourceError(pub String);
