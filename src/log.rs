use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();
}
