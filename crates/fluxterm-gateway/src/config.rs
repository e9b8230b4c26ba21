//! Gateway tunables.
//!
//! Everything has a default, so an empty or missing file is a valid
//! configuration. CLI flags are applied on top in `main`.

use std::path::Path;
use std::time::Duration;

use fluxterm_xmodem::TransferConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub session: SessionSettings,
    pub transport: TransportSettings,
    pub transfer: TransferSettings,
    pub origin: OriginSettings,
}

/// Per-connection pump timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub ping_interval_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub outbound_capacity: usize,
    pub read_buffer_size: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ping_interval_secs: 54,
            read_timeout_secs: 60,
            write_timeout_secs: 10,
            outbound_capacity: 256,
            read_buffer_size: 1024,
        }
    }
}

impl SessionSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Poll interval for serial and remote-shell reads.
    pub serial_read_timeout_ms: u64,
    /// Remote-shell output chunks buffered before pushes start waiting.
    pub push_capacity: usize,
    /// How long a push waits for room before the chunk is dropped.
    pub push_timeout_ms: u64,
    pub shell_read_buffer: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            serial_read_timeout_ms: 100,
            push_capacity: 256,
            push_timeout_ms: 1000,
            shell_read_buffer: 32 * 1024,
        }
    }
}

impl TransportSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_read_timeout_ms)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub handshake_timeout_secs: u64,
    pub response_timeout_secs: u64,
    pub start_interval_secs: u64,
    pub max_retries: u32,
}

impl Default for TransferSettings {
    fn default() -> Self {
        let d = TransferConfig::default();
        Self {
            handshake_timeout_secs: d.handshake_timeout.as_secs(),
            response_timeout_secs: d.response_timeout.as_secs(),
            start_interval_secs: d.start_interval.as_secs(),
            max_retries: d.max_retries,
        }
    }
}

impl TransferSettings {
    pub fn engine_config(&self) -> TransferConfig {
        TransferConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            start_interval: Duration::from_secs(self.start_interval_secs),
            start_attempts: self.max_retries,
            max_retries: self.max_retries,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OriginSettings {
    pub allowed: Vec<String>,
    pub allow_any: bool,
}

impl GatewayConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: GatewayConfig = toml::from_str(input)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.session.outbound_capacity == 0 || self.transport.push_capacity == 0 {
            return Err(ConfigError::Invalid("queue capacities must be positive".into()));
        }
        if self.session.ping_interval_secs == 0 || self.session.read_timeout_secs == 0 {
            return Err(ConfigError::Invalid("session timings must be positive".into()));
        }
        if self.session.ping_interval_secs >= self.session.read_timeout_secs {
            return Err(ConfigError::Invalid(
                "ping_interval_secs must be shorter than read_timeout_secs".into(),
            ));
        }
        if self.transfer.max_retries == 0 {
            return Err(ConfigError::Invalid("transfer.max_retries must be positive".into()));
        }
        Ok(())
    }
}
