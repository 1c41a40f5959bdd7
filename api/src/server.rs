use std::sync::Arc;

use tokio::net::TcpListener;

use index::{EventSink, Index};
use rebalance::Rebalancer;

use crate::handlers::AppState;
use crate::{admin, session, ApiError, ApiResult};

pub struct Server {
    config: crate::Config,
    app_state: Arc<AppState>,
}

impl Server {
    pub fn new(
        config: crate::Config,
        index: Arc<Index>,
        rebalancer: Arc<Rebalancer>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let app_state = Arc::new(AppState {
            config: config.clone(),
            index,
            rebalancer,
            events,
        });

        Self { config, app_state }
    }

    /// Accepts connections forever, one task per connection.
    pub async fn serve(&self, listener: TcpListener) -> ApiResult<()> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| ApiError::InternalError(format!("Accept failed: {}", e)))?;

            let state = self.app_state.clone();
            tokio::spawn(async move {
                if let Err(e) = session::run_connection(state, stream).await {
                    tracing::warn!("Connection from {} ended: {}", peer, e);
                }
            });
        }
    }

    pub async fn start_admin(&self) -> ApiResult<()> {
        let addr = self
            .config
            .admin_address()
            .ok_or_else(|| ApiError::InternalError("No admin port configured".to_string()))?;
        tracing::info!("Starting admin API on {}", addr);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ApiError::InternalError(format!("Failed to bind to {}: {}", addr, e)))?;

        axum::serve(listener, admin::router(self.app_state.clone()))
            .await
            .map_err(|e| ApiError::InternalError(format!("Admin server error: {}", e)))?;

        Ok(())
    }
}
