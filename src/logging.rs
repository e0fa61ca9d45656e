// 📝 Logging setup for the binary
//
// The library only emits `tracing` events; installing a subscriber is left
// to the caller. Logs go to stderr so a JSON report on stdout stays clean.

use crate::config::LogFormat;
use crate::error::{Result, VaultError};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `RUST_LOG` wins over the default level when set.
pub fn build_filter(verbose: bool) -> EnvFilter {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy()
}

pub fn init_logging(format: LogFormat, verbose: bool) -> Result<()> {
    let filter = build_filter(verbose);
    let fmt_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let installed = match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .try_init(),
    };

    installed.map_err(|e| VaultError::Config(format!("failed to install logger: {}", e)))
}
