use anyhow::Context;
use pipeline::AcquisitionConfig;
use rt_client::ClientConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_LOG_FILTER: &str = "rt_daemon=info,pipeline=info,rt_client=info";

/// Configuration for the daemon
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Acquisition server address, alias and timeouts
    pub client: ClientConfig,
    /// Ring buffer and worker settings
    pub acquisition: AcquisitionConfig,
    /// Connector to select after connecting; the server's active one if unset
    pub connector: Option<i32>,
    /// Samples per block to request; the server's current size if unset
    pub buffer_size: Option<i32>,
    /// Tracing filter used when RUST_LOG is not set
    pub log_filter: String,
    /// Seconds between status lines
    pub status_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            acquisition: AcquisitionConfig::default(),
            connector: None,
            buffer_size: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            status_interval_secs: 5,
        }
    }
}

impl DaemonConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.acquisition.validate()?;
        if let Some(size) = self.buffer_size {
            anyhow::ensure!(size > 0, "buffer_size must be positive, got {}", size);
        }
        anyhow::ensure!(self.status_interval_secs > 0, "status_interval_secs must be positive");
        Ok(())
    }
}

/// Loads the daemon configuration. Without a path the defaults are used.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<DaemonConfig> {
    let Some(path) = path else {
        return Ok(DaemonConfig::default());
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read configuration file at '{}'", path.display()))?;
    let config: DaemonConfig = serde_json::from_str(&contents)
        .with_context(|| format!("Could not parse configuration file at '{}'", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in '{}'", path.display()))?;
    Ok(config)
}
