use {
    crate::error::SetupError,
    tracing_subscriber::{fmt::format::FmtSpan, EnvFilter},
};

/// Installs a fmt subscriber filtered by `level`, e.g.
/// `WARN,notify_client=DEBUG`. Meant for binaries and tests; the library
/// itself only emits events.
pub fn init(level: &str) -> Result<(), SetupError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(std::env::var("ANSI_LOGS").is_ok())
        .try_init()
        .map_err(|e| SetupError::Logging(e.to_string()))
}
