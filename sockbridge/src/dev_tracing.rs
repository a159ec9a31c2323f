/// Development helper: initialize tracing subscriber when `RUST_LOG` is set.
///
/// Tests and demos can call `sockbridge::dev_tracing::init_tracing()` to see
/// reactor and socket lifecycle logs, e.g. `RUST_LOG=sockbridge=trace`. This
/// is a no-op when `RUST_LOG` is not set or when a global subscriber is
/// already installed. The engine itself never installs a subscriber.
pub fn init_tracing() {
    use std::env;

    if env::var("RUST_LOG").is_ok() {
        // Best-effort: several tests in one binary may race to install it
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_thread_names(true)
            .try_init();
    }
}
