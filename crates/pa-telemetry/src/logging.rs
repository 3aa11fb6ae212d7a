use tracing_subscriber::{fmt, EnvFilter};

/// Output format for [`init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Human
        }
    }
}

/// `RUST_LOG` if set, else `default_level`, else `info` when `default_level`
/// is not a valid directive.
pub fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Later calls are no-ops, which keeps tests
/// that each initialise logging from panicking.
pub fn init(service_name: &str, default_level: &str, format: LogFormat) {
    let filter = build_filter(default_level);
    let installed = match format {
        LogFormat::Human => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .is_ok(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(true)
            .try_init()
            .is_ok(),
    };
    if installed {
        tracing::info!(service = service_name, ?format, "logging initialised");
    }
}

pub fn init_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Human);
}

/// JSON lines, one event per line.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogFormat::Json);
}
