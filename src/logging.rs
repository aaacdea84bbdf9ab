//! Tracing setup helper for embedding applications and tests.

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Configure and install a global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise everything is `warn` except this
/// crate at the given level. Repeated calls are no-ops.
pub fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,trawl={level}")));

    let subscriber = FmtSubscriber::builder()
        .with_target(true)
        .with_env_filter(filter)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
