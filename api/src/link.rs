use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use index::{LinkError, NodeInstruction, NodeLink, Placement, Port};
use network::{ConnectionHandle, FileEntry, Message, RebalanceSend};

/// [`NodeLink`] over a storage node's controller connection.
///
/// The node's session forwards `LIST` and `REBALANCE_COMPLETE` replies into
/// `replies`. Requests are serialised, and a request only accepts a reply that
/// answers it; anything else is a leftover from an earlier timed-out request.
pub struct DstoreLink {
    port: Port,
    connection: ConnectionHandle,
    replies: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl DstoreLink {
    pub fn new(port: Port, connection: ConnectionHandle) -> (Self, mpsc::UnboundedSender<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Self {
            port,
            connection,
            replies: Mutex::new(rx),
        };
        (link, tx)
    }

    async fn request<T>(
        &self,
        message: &Message,
        timeout: Duration,
        accept: impl Fn(&Message) -> Option<T> + Send,
    ) -> Result<T, LinkError> {
        let mut replies = self.replies.lock().await;

        // Replies to requests that already timed out.
        while let Ok(stale) = replies.try_recv() {
            tracing::debug!("Discarding stale reply from node {}: {}", self.port, stale);
        }

        self.connection
            .send(message)
            .map_err(|_| LinkError::Disconnected)?;

        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, replies.recv()).await {
                Err(_) => return Err(LinkError::Timeout(timeout)),
                Ok(None) => return Err(LinkError::Disconnected),
                Ok(Some(reply)) => match accept(&reply) {
                    Some(answer) => return Ok(answer),
                    None => tracing::debug!(
                        "Discarding reply from node {} that does not answer {}: {}",
                        self.port,
                        message.command(),
                        reply
                    ),
                },
            }
        }
    }
}

/// True if `entries` is what the node holds after carrying out `instruction`:
/// removed files are gone and files it only sent are still there.
fn carried_out(instruction: &NodeInstruction, entries: &[FileEntry]) -> bool {
    let held: BTreeSet<&str> = entries.iter().map(|e| e.filename.as_str()).collect();
    let removed = instruction.removals.iter().all(|f| !held.contains(f.as_str()));
    let kept = instruction
        .sends
        .iter()
        .filter(|send| !instruction.removals.contains(&send.filename))
        .all(|send| held.contains(send.filename.as_str()));
    removed && kept
}

#[async_trait]
impl NodeLink for DstoreLink {
    async fn list_files(&self, timeout: Duration) -> Result<Placement, LinkError> {
        self.request(&Message::List, timeout, |reply| match reply {
            Message::Listing { entries } => Some(
                entries
                    .iter()
                    .map(|entry| (entry.filename.clone(), entry.size))
                    .collect(),
            ),
            _ => None,
        })
        .await
    }

    async fn rebalance(&self, instruction: &NodeInstruction, timeout: Duration) -> Result<(), LinkError> {
        let message = Message::Rebalance {
            sends: instruction
                .sends
                .iter()
                .map(|send| RebalanceSend {
                    filename: send.filename.clone(),
                    size: send.size,
                    destinations: send.destinations.clone(),
                })
                .collect(),
            removals: instruction.removals.clone(),
        };

        self.request(&message, timeout, |reply| match reply {
            Message::RebalanceComplete { entries } if carried_out(instruction, entries) => Some(()),
            _ => None,
        })
        .await
    }

    fn remove_file(&self, filename: &str) -> Result<(), LinkError> {
        self.connection
            .send(&Message::Remove {
                filename: filename.to_string(),
            })
            .map_err(|_| LinkError::Disconnected)
    }
}
