use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use index::{ClusterEvent, Port};
use network::{Connection, ConnectionHandle, Message, MessageReader, NetworkError};

use crate::handlers::{dispatch, AppState};
use crate::link::DstoreLink;
use crate::{ApiError, ApiResult};

/// Serves one accepted connection until the peer goes away. The first message
/// decides whether the peer is a storage node or a client.
pub async fn run_connection(state: Arc<AppState>, stream: TcpStream) -> ApiResult<()> {
    let (handle, mut reader) = Connection::spawn(stream)?;

    let Some(first) = next_request(&state, &handle, &mut reader).await? else {
        return Ok(());
    };

    match first {
        Message::JoinDstore { port } => run_dstore(state, handle, reader, port).await,
        other => run_client(state, handle, reader, other).await,
    }
}

/// Next well-formed message; malformed lines are reported and skipped.
async fn next_request(
    state: &AppState,
    handle: &ConnectionHandle,
    reader: &mut MessageReader,
) -> ApiResult<Option<Message>> {
    loop {
        match reader.next_message().await {
            None => return Ok(None),
            Some(Ok(message)) => return Ok(Some(message)),
            Some(Err(NetworkError::InvalidMessage(reason))) => reject(state, handle, reason),
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

fn reject(state: &AppState, handle: &ConnectionHandle, reason: String) {
    state.events.emit(ClusterEvent::InvalidMessage {
        peer: handle.peer().to_string(),
        reason,
    });
}

async fn run_client(
    state: Arc<AppState>,
    handle: ConnectionHandle,
    mut reader: MessageReader,
    first: Message,
) -> ApiResult<()> {
    tracing::debug!("Client session {} from {}", handle.id(), handle.peer());

    let result: ApiResult<()> = async {
        let mut request = Some(first);
        while let Some(message) = request {
            respond(&state, &handle, message).await?;
            request = next_request(&state, &handle, &mut reader).await?;
        }
        Ok(())
    }
    .await;

    state.index.forget_client(handle.id()).await;
    tracing::debug!("Client session {} closed", handle.id());
    result
}

async fn respond(state: &AppState, handle: &ConnectionHandle, request: Message) -> ApiResult<()> {
    let command = request.command();

    match dispatch(state, handle, request).await {
        Ok(reply) => handle.send(&reply)?,
        Err(ApiError::InvalidMessage(reason)) => reject(state, handle, reason),
        Err(e) => match e.reply() {
            Some(reply) => {
                tracing::debug!("{} from {} failed: {}", command, handle.peer(), e);
                handle.send(&reply)?;
            }
            None => tracing::warn!("{} from {} failed without reply: {}", command, handle.peer(), e),
        },
    }
    Ok(())
}

async fn run_dstore(
    state: Arc<AppState>,
    handle: ConnectionHandle,
    mut reader: MessageReader,
    port: Port,
) -> ApiResult<()> {
    let (link, replies) = DstoreLink::new(port, handle.clone());

    if let Err(e) = state.index.register_node(port, handle.id(), Arc::new(link)).await {
        let e = ApiError::from(e);
        if let Some(reply) = e.reply() {
            handle.send(&reply)?;
        }
        return Err(e);
    }

    handle.send(&Message::JoinAck)?;
    state.rebalancer.trigger();

    let result: ApiResult<()> = async {
        while let Some(message) = next_request(&state, &handle, &mut reader).await? {
            route_node_message(&state, &handle, port, &replies, message).await;
        }
        Ok(())
    }
    .await;

    state.index.remove_node(handle.id()).await;
    result
}

async fn route_node_message(
    state: &AppState,
    handle: &ConnectionHandle,
    port: Port,
    replies: &mpsc::UnboundedSender<Message>,
    message: Message,
) {
    match message {
        Message::StoreAck { filename } => state.index.ack_store(port, &filename).await,
        Message::RemoveAck { filename }
        | Message::ErrorFileDoesNotExist {
            filename: Some(filename),
        } => state.index.ack_remove(port, &filename).await,
        // A node with no files may answer with a bare "LIST".
        Message::List => forward(replies, Message::Listing { entries: Vec::new() }),
        reply @ (Message::Listing { .. } | Message::RebalanceComplete { .. }) => forward(replies, reply),
        other => reject(
            state,
            handle,
            format!("{} is not a storage node message", other.command()),
        ),
    }
}

fn forward(replies: &mpsc::UnboundedSender<Message>, reply: Message) {
    if replies.send(reply).is_err() {
        tracing::debug!("Dropping node reply: link is gone");
    }
}
