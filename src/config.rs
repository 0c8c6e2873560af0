//! Broker configuration, loaded once at startup from a JSON file.
//!
//! A missing file is not silently defaulted: a template is written in its
//! place and startup fails with a diagnostic, so an operator never runs a
//! broker on config they didn't write.

use std::path::Path;
use std::time::Duration;
use std::{fs, io};

use color_eyre::eyre::{bail, WrapErr};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub app_name: String,
    /// TCP port the MQTT listener binds on.
    pub app_port: u16,
    /// Selects the default log level when `RUST_LOG` is unset.
    pub debug_mode: bool,
    pub database: DatabaseConfig,
}

/// Settings for the durable document store.
///
/// The embedded store only consumes `database` (the data directory) and the
/// timeouts; the endpoint, credential and pool fields are part of the store
/// contract for networked deployments and are validated but otherwise unused
/// by the file backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Database name; doubles as the data directory of the file backend.
    pub database: String,
    pub use_tls: bool,
    pub connect_timeout: String,
    pub socket_timeout: String,
    pub connect_idle_timeout: String,
    pub operation_timeout: String,
    pub heartbeat: String,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            app_name: "heronmq".into(),
            app_port: 1883,
            debug_mode: false,
            database: DatabaseConfig {
                host: "127.0.0.1".into(),
                port: 27017,
                username: String::new(),
                password: String::new(),
                database: "heronmq".into(),
                use_tls: false,
                connect_timeout: "10s".into(),
                socket_timeout: "30s".into(),
                connect_idle_timeout: "5m".into(),
                operation_timeout: "5s".into(),
                heartbeat: "10s".into(),
                min_pool_size: 2,
                max_pool_size: 16,
            },
        }
    }
}

impl AppConfig {
    /// Read the config from `path`.
    ///
    /// If the file does not exist, a commented template is written there and
    /// an error is returned telling the operator to edit it and retry.
    pub fn load(path: &Path) -> crate::Result<AppConfig> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                write_template(path)?;
                bail!(
                    "configuration file {} does not exist; \
                     a template has been written there, edit it and start again",
                    path.display()
                );
            }
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("error reading config from {}", path.display()));
            }
        };

        let config: AppConfig = serde_json::from_str(&contents)
            .wrap_err_with(|| format!("{} is not valid configuration JSON", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.database.database.is_empty() {
            bail!("database.database must not be empty");
        }

        if self.database.min_pool_size > self.database.max_pool_size {
            bail!(
                "database.min_pool_size ({}) exceeds database.max_pool_size ({})",
                self.database.min_pool_size,
                self.database.max_pool_size
            );
        }

        // Surface bad duration strings at startup instead of first use.
        for (name, value) in [
            ("connect_timeout", &self.database.connect_timeout),
            ("socket_timeout", &self.database.socket_timeout),
            ("connect_idle_timeout", &self.database.connect_idle_timeout),
            ("operation_timeout", &self.database.operation_timeout),
            ("heartbeat", &self.database.heartbeat),
        ] {
            parse_duration(value).wrap_err_with(|| format!("database.{name} is invalid"))?;
        }

        Ok(())
    }

    /// Per-call deadline for durable store operations.
    pub fn operation_timeout(&self) -> Duration {
        // Checked by `validate()`.
        parse_duration(&self.database.operation_timeout).expect("validated at load")
    }
}

fn write_template(path: &Path) -> crate::Result<()> {
    let template = serde_json::to_string_pretty(&AppConfig::default())
        .expect("default config always serializes");

    fs::write(path, template)
        .wrap_err_with(|| format!("error writing config template to {}", path.display()))
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DurationParseError {
    #[error("duration `{0}` has no unit suffix (expected s, m, h or d)")]
    MissingUnit(String),
    #[error("duration `{0}` has a non-numeric magnitude")]
    BadMagnitude(String),
}

/// Parse a human-readable duration such as `10s`, `5m`, `1h` or `2d`.
pub fn parse_duration(value: &str) -> Result<Duration, DurationParseError> {
    let value = value.trim().to_ascii_lowercase();

    let (magnitude, unit_seconds) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped, 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped, 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped, 60 * 60)
    } else if let Some(stripped) = value.strip_suffix('d') {
        (stripped, 24 * 60 * 60)
    } else {
        return Err(DurationParseError::MissingUnit(value));
    };

    let magnitude: u64 = magnitude
        .parse()
        .map_err(|_| DurationParseError::BadMagnitude(value.clone()))?;

    Ok(Duration::from_secs(magnitude * unit_seconds))
}
