//! Subscriber setup for applications embedding the build engine.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a global `fmt` subscriber. `RUST_LOG` takes precedence,
/// otherwise `verbosity` picks the level: 0 is `warn`, 1 `info`, 2 `debug`,
/// anything above `trace`.
///
/// Calling it twice is harmless, the second subscriber is ignored.
pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kiln={level}")));

    let layer = fmt::layer().with_target(false).without_time();

    if tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("a global subscriber is already installed");
    }
}
