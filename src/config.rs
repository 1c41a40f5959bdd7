use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ControllerError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub admin_port: Option<u16>,
    pub replication_factor: usize,
    pub timeout_ms: u64,
    pub rebalance_period_secs: u64,
}

fn default_bind_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl Config {
    pub fn new(port: u16, replication_factor: usize, timeout_ms: u64, rebalance_period_secs: u64) -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port,
            admin_port: None,
            replication_factor,
            timeout_ms,
            rebalance_period_secs,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| ControllerError::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication_factor < 1 {
            return Err(ControllerError::InvalidConfig(
                "replication factor must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ControllerError::InvalidConfig("timeout must be positive".to_string()));
        }
        if self.rebalance_period_secs == 0 {
            return Err(ControllerError::InvalidConfig(
                "rebalance period must be positive".to_string(),
            ));
        }
        if self.admin_port.is_some() && self.admin_port == Some(self.port) {
            return Err(ControllerError::InvalidConfig(
                "admin port must differ from the controller port".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_ip, self.port)
    }
}

impl From<Config> for api::Config {
    fn from(config: Config) -> Self {
        api::Config {
            bind_ip: config.bind_ip,
            port: config.port,
            admin_port: config.admin_port,
            replication_factor: config.replication_factor,
            timeout_ms: config.timeout_ms,
        }
    }
}

impl From<Config> for rebalance::Config {
    fn from(config: Config) -> Self {
        rebalance::Config {
            replication_factor: config.replication_factor,
            timeout_ms: config.timeout_ms,
            rebalance_period_ms: config.rebalance_period_secs * 1000,
        }
    }
}
