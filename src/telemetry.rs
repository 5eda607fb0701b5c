use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "configvault=info";

/// Install a global `fmt` subscriber filtered by `RUST_LOG`
/// (`configvault=info` when unset).
///
/// Returns `false` if a global subscriber was already installed, so test
/// binaries can call it from every test.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
