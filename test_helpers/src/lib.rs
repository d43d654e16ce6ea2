//! Helpers shared by the workspace's tests: opt-in log output and bounded
//! polling for asserting on asynchronous worker effects.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_docs)]

use std::sync::Once;
use std::time::{Duration, Instant};

static START_LOGGING: Once = Once::new();

/// Start tracing output for a test if the `RUST_LOG` environment variable
/// is set; a no-op otherwise.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Unconditionally start tracing output for a test, honouring the
/// `RUST_LOG` filter syntax. Safe to call from every test; the subscriber
/// installs once per process.
pub fn start_logging() {
    START_LOGGING.call_once(|| {
        tracing_log::LogTracer::init().expect("log forwarding installs once");
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();
        observability_deps::tracing::subscriber::set_global_default(subscriber)
            .expect("tracing subscriber installs once");
    });
}

/// Poll `condition` until it holds or `timeout` elapses. Returns the final
/// observation, so `assert!(wait_for(..))` reads as "eventually true".
pub fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_observes_late_conditions() {
        let started = Instant::now();
        assert!(wait_for(
            || started.elapsed() > Duration::from_millis(20),
            Duration::from_secs(5),
        ));
    }

    #[test]
    fn wait_for_gives_up() {
        assert!(!wait_for(|| false, Duration::from_millis(30)));
    }
}
