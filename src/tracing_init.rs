//! Sets up the process-wide `tracing` subscriber. This is a library, so
//! nothing in the engine calls this implicitly — a global subscriber
//! install is a side effect only the binary consuming this crate should
//! choose to trigger.

use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// - Creates a subscriber for tokio-console if built with
///   `--cfg tokio_unstable` and `use_tokio_console` is true.
/// - Creates a formatting subscriber for stdout.
/// - Filters using `RUST_LOG` if set; otherwise filters using
///   `verbose`:
///     - 0: error
///     - 1: warn
///     - 2: info
///     - 3: debug
///     - 4 and above: trace
pub fn init_tracing(verbose: u8, use_tokio_console: bool) {
    let registry = tracing_subscriber::registry();

    let console_layer = if cfg!(tokio_unstable) && use_tokio_console {
        Some(console_subscriber::spawn())
    } else {
        None
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::from(match verbose {
            0 => "error",
            1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        })
    });
    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(env_filter);

    registry.with(console_layer).with(fmt_layer).init();
}
