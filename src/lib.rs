//! Per-call instrumentation and payload templating for gRPC load generation.
//!
//! Two pieces are provided:
//!
//! * [CallDataGenerator] builds a [CallContext] for every call a worker is about to issue and
//!   renders the request payload and metadata templates against it.
//! * [CallStatsHandler] is told about every lifecycle event of every call by the transport (see
//!   [StatsLayer] for wiring it into a tonic channel), times each phase and emits one
//!   [CallResult] per completed call to whoever is aggregating them.

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[macro_use]
extern crate tracing;

mod call_template;
mod errors;
mod ids;
mod metadata;
pub mod stats;
pub mod telemetry;

pub use call_template::{
    CallContext, CallDataGenerator, MethodDescriptor, MethodDescriptorBuilder, MethodInfo,
};
pub use errors::{CallError, IdSourceError, InvalidMetadataError, TemplateError};
pub use ids::{IdSource, OsIdSource, SeededIdSource};
pub use metadata::apply_metadata;
pub use stats::{
    BoxError, CallResult, CallResults, CallStatsHandler, CorrelationToken, ResultsBuffer,
    RpcStats, RpcTagInfo, StatsHandler, StatsHandlerOptions, StatsHandlerOptionsBuilder,
    StatsLayer, TimingRecord,
};
pub use telemetry::telemetry_init;
