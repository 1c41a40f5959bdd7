use std::sync::Arc;

use index::{EventSink, Index, OperationState};
use network::{ConnectionHandle, FileEntry, Message};
use rebalance::Rebalancer;

use crate::{ApiError, ApiResult, Config};

pub struct AppState {
    pub config: Config,
    pub index: Arc<Index>,
    pub rebalancer: Arc<Rebalancer>,
    pub events: Arc<dyn EventSink>,
}

/// Runs one client request to completion and returns the final reply.
/// Intermediate lines (`STORE_TO`) are sent directly on `client`.
pub async fn dispatch(state: &AppState, client: &ConnectionHandle, request: Message) -> ApiResult<Message> {
    match request {
        Message::Store { filename, size } => store(state, client, &filename, size).await,
        Message::Load { filename } => load(state, client, &filename, false).await,
        Message::Reload { filename } => load(state, client, &filename, true).await,
        Message::Remove { filename } => remove(state, &filename).await,
        Message::List => list(state).await,
        other => Err(ApiError::InvalidMessage(format!(
            "{} is not a client request",
            other.command()
        ))),
    }
}

pub async fn store(state: &AppState, client: &ConnectionHandle, filename: &str, size: u64) -> ApiResult<Message> {
    let _permit = state.index.operation_permit().await;

    let ports = state.index.begin_store(filename, size).await?;
    // The reservation stands even if the client has gone; it times out.
    if let Err(e) = client.send(&Message::StoreTo { ports }) {
        tracing::debug!("Could not send STORE_TO for {}: {}", filename, e);
    }

    state
        .index
        .await_state(filename, OperationState::StoreAckReceived, state.config.timeout())
        .await?;
    Ok(Message::StoreComplete)
}

pub async fn load(state: &AppState, client: &ConnectionHandle, filename: &str, is_retry: bool) -> ApiResult<Message> {
    let _permit = state.index.operation_permit().await;

    let target = state
        .index
        .resolve_load_target(client.id(), filename, is_retry)
        .await?;
    Ok(Message::LoadFrom {
        port: target.port,
        size: target.size,
    })
}

pub async fn remove(state: &AppState, filename: &str) -> ApiResult<Message> {
    let _permit = state.index.operation_permit().await;

    let ports = state.index.begin_remove(filename).await?;
    for port in ports {
        let sent = match state.index.link_for(port).await {
            Some(link) => link.remove_file(filename).map_err(|e| e.to_string()),
            None => Err("node is gone".to_string()),
        };
        // The missing acknowledgment will time the operation out.
        if let Err(reason) = sent {
            tracing::warn!("Could not ask node {} to remove {}: {}", port, filename, reason);
        }
    }

    state
        .index
        .await_state(filename, OperationState::RemoveAckReceived, state.config.timeout())
        .await?;
    Ok(Message::RemoveComplete)
}

pub async fn list(state: &AppState) -> ApiResult<Message> {
    let _permit = state.index.operation_permit().await;

    let files = state.index.list_files().await?;
    Ok(Message::Listing {
        entries: files
            .into_iter()
            .map(|(filename, size)| FileEntry::new(filename, size))
            .collect(),
    })
}
