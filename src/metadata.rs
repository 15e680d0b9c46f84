use crate::errors::InvalidMetadataError;
use std::{collections::HashMap, str::FromStr};
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};

/// Insert rendered call metadata into outgoing request metadata, replacing any existing values
/// for the same keys. Nothing is inserted if any entry is invalid.
pub fn apply_metadata(
    rendered: &HashMap<String, String>,
    metadata: &mut MetadataMap,
) -> Result<(), InvalidMetadataError> {
    let mut parsed = Vec::with_capacity(rendered.len());
    for (k, v) in rendered {
        let key = match AsciiMetadataKey::from_str(k) {
            Ok(key) => key,
            Err(source) => {
                return Err(InvalidMetadataError::InvalidKey {
                    key: k.clone(),
                    source,
                });
            }
        };
        let value = match AsciiMetadataValue::from_str(v) {
            Ok(value) => value,
            Err(source) => {
                return Err(InvalidMetadataError::InvalidValue {
                    key: k.clone(),
                    source,
                });
            }
        };
        parsed.push((key, value));
    }
    for (key, value) in parsed {
        metadata.insert(key, value);
    }
    Ok(())
}
