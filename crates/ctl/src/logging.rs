use tracing_subscriber::EnvFilter;

/// Plain stderr logging with `RUST_LOG` override, `info` by default.
/// Supervised services get their stderr redirected to
/// `<data_root>/logs/<service>.log` by the watchdog, so one sink suffices.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();
}
