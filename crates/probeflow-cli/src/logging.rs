use tracing_subscriber::EnvFilter;

/// Install the tracing subscriber for the CLI.
///
/// `RUST_LOG` wins when set; otherwise the `--log-level` flag supplies the
/// default filter. Worker output is line-oriented, so the compact format
/// keeps one event per line.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
