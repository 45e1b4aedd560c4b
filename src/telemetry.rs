use tracing_subscriber::EnvFilter;

/// Maps the service's `LOG_LEVEL` values onto tracing directives.
fn level_directive(log_level: Option<&str>) -> &'static str {
    match log_level.map(str::to_ascii_lowercase).as_deref() {
        Some("debug") => "debug",
        Some("warning") | Some("warn") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

/// Installs the fmt subscriber. `RUST_LOG` takes precedence over `LOG_LEVEL`.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").ok();
        EnvFilter::new(level_directive(level.as_deref()))
    });
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
