use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use index::{EventSink, Index, TracingEventSink};
use rebalance::Rebalancer;

use crate::config::Config;
use crate::error::{ControllerError, Result};

/// Wires the index, the rebalancer and the request server together and runs
/// them until one of them stops.
pub struct Controller {
    config: Config,
    rebalancer: Arc<Rebalancer>,
    server: Arc<api::Server>,
}

impl Controller {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_events(config, Arc::new(TracingEventSink))
    }

    pub fn with_events(config: Config, events: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;
        info!(
            "Initializing controller on {} (replication factor {})",
            config.bind_address(),
            config.replication_factor
        );

        let index = Arc::new(Index::new(config.replication_factor, events.clone()));
        let rebalancer = Arc::new(Rebalancer::new(
            config.clone().into(),
            index.clone(),
            events.clone(),
        ));
        let server = Arc::new(api::Server::new(
            config.clone().into(),
            index.clone(),
            rebalancer.clone(),
            events,
        ));

        Ok(Self {
            config,
            rebalancer,
            server,
        })
    }

    pub async fn start(self) -> Result<()> {
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            error!("Failed to bind to {}: {}", addr, e);
            ControllerError::Io(e)
        })?;
        self.run(listener).await
    }

    /// Serves on an already bound listener.
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        info!("Controller listening on {}", listener.local_addr()?);

        let server_task = {
            let server = self.server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        let rebalance_task = {
            let rebalancer = self.rebalancer.clone();
            tokio::spawn(async move { rebalancer.start().await })
        };

        let admin_task = self.config.admin_port.map(|_| {
            let server = self.server.clone();
            tokio::spawn(async move { server.start_admin().await })
        });
        let admin = async move {
            match admin_task {
                Some(task) => task.await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = server_task => {
                error!("Request server stopped: {:?}", result);
                result.map_err(|e| ControllerError::Task(e.to_string()))??;
            }
            result = rebalance_task => {
                error!("Rebalancer stopped: {:?}", result);
                result.map_err(|e| ControllerError::Task(e.to_string()))??;
            }
            result = admin => {
                error!("Admin server stopped: {:?}", result);
                result.map_err(|e| ControllerError::Task(e.to_string()))??;
            }
        }

        Err(ControllerError::Task("controller task exited".to_string()))
    }
}
