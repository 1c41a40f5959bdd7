mod admin;
mod error;
mod handlers;
mod link;
mod server;
mod session;

pub use admin::router as admin_router;
pub use error::{ApiError, ApiResult};
pub use handlers::AppState;
pub use link::DstoreLink;
pub use server::Server;

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bind_ip: IpAddr,
    pub port: u16,
    pub admin_port: Option<u16>,
    pub replication_factor: usize,
    pub timeout_ms: u64,
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_ip, self.port)
    }

    pub fn admin_address(&self) -> Option<String> {
        self.admin_port.map(|port| format!("{}:{}", self.bind_ip, port))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
