//! Console logging setup.

use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Filter used when neither `BEATLIGHT_LOG` nor `RUST_LOG` is set.
pub fn default_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Installs the global subscriber.
///
/// The filter comes from `BEATLIGHT_LOG`, then `RUST_LOG`, then the
/// verbosity default. Chain threads are named, so thread names are shown.
pub fn init_logging(verbosity: u8) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_env("BEATLIGHT_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbosity)));

    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_names(true)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init()?;
    Ok(())
}
