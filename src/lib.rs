pub mod config;
pub mod controller;
pub mod error;

pub use config::Config;
pub use controller::Controller;
pub use error::{ControllerError, Result};

// Re-export key types from workspace crates
pub use api;
pub use index;
pub use network;
pub use rebalance;
