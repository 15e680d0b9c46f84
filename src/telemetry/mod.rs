use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// If set, used instead of `RUST_LOG` to filter log output
pub const LOG_FILTER_ENV_VAR: &str = "GRPCANNON_LOG";
static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Initialize tracing subscribers and output. The library will not call this itself, it exists
/// here so that load generators and tests have an easy way to initialize logging.
///
/// Filtering follows the standard [EnvFilter] syntax, read from [LOG_FILTER_ENV_VAR] if set, else
/// from `RUST_LOG`, else everything at `info` and above is shown. Calling this more than once, or
/// after some other subscriber was installed, does nothing.
pub fn telemetry_init() {
    TRACING_INIT.get_or_init(|| {
        let filter_layer = EnvFilter::try_from_env(LOG_FILTER_ENV_VAR)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::registry()
            .with(filter_layer)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init();
    });
}
