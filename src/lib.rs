use color_eyre::eyre::{eyre, WrapErr};
pub use color_eyre::eyre::{Error, Result};
use tracing_subscriber::EnvFilter;

use crate::cli::LogFormat;

pub mod cli;

pub mod config;

pub mod mqtt;

pub mod shutdown;

pub mod store;

/// Install error reporting and the tracing subscriber.
///
/// `RUST_LOG` always wins; otherwise `debug_mode` from the config file decides
/// whether the broker's own spans log at debug or info.
pub fn bootstrap(log_format: LogFormat, debug_mode: bool) -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        // Don't die if the file doesn't exist.
        if !e.not_found() {
            return Err(e).wrap_err("error reading `.env` file");
        }
    }

    // Enables capturing backtraces on stable and adds color codes.
    color_eyre::install()?;

    let filter = if std::env::var(EnvFilter::DEFAULT_ENV).is_ok() {
        EnvFilter::from_default_env()
    } else if debug_mode {
        EnvFilter::new("info,heronmq=debug")
    } else {
        EnvFilter::new("info")
    };

    let builder = tracing_subscriber::fmt::fmt().with_env_filter(filter);

    match log_format {
        // These all result in different typestate
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| eyre!(e))?;

    Ok(())
}
