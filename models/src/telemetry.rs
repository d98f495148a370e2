//! Project-wide logging and tracing initialization.
use opentelemetry_sdk::propagation::TraceContextPropagator;
use snafu::ResultExt;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, EnvFilter, Registry};

const TRACING_FILTER_DIRECTIVE_ENV_VAR: &str = "TRACING_FILTER_DIRECTIVE";

/// Install the global tracing subscriber: JSON log lines filtered at INFO for
/// production and DEBUG everywhere else, overridable through
/// `TRACING_FILTER_DIRECTIVE`. When distributed tracing is enabled the W3C
/// trace-context propagator is installed as well; the agent behaves
/// identically either way.
pub fn init_telemetry(runtime_env: &str, enable_tracing: bool) -> Result<()> {
    if enable_tracing {
        opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
    }

    let default_directive = if runtime_env == "prod" {
        LevelFilter::INFO
    } else {
        LevelFilter::DEBUG
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_directive.into())
        .with_env_var(TRACING_FILTER_DIRECTIVE_ENV_VAR)
        .from_env_lossy();

    let subscriber = Registry::default()
        .with(env_filter)
        .with(fmt::layer().json());

    tracing::subscriber::set_global_default(subscriber).context(error::TracingConfigurationSnafu)?;

    Ok(())
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum TelemetryConfigError {
        #[snafu(display("Error configuring tracing: '{}'", source))]
        TracingConfiguration {
            source: tracing::subscriber::SetGlobalDefaultError,
        },
    }
}

type Result<T> = std::result::Result<T, TelemetryConfigError>;
pub use error::TelemetryConfigError;
