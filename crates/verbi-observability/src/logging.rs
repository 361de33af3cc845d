use tracing_subscriber::EnvFilter;

/// Console diagnostics on stderr. `VERBI_LOG` takes an env-filter directive
/// (e.g. `debug`, `verbi_engine=trace`); the default is `default_level`.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_env("VERBI_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
