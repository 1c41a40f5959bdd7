#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use replistore::index::{ClusterEvent, Placement, Port, RecordingEventSink};
use replistore::network::{Connection, ConnectionHandle, FileEntry, Message, MessageReader};
use replistore::{Config, Controller};

pub const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Every fake node's disk, keyed by the node's port.
pub type Disks = Arc<Mutex<BTreeMap<Port, Placement>>>;

/// A controller on an ephemeral port with a recording event sink.
pub struct TestCluster {
    pub addr: SocketAddr,
    pub events: Arc<RecordingEventSink>,
    pub disks: Disks,
    task: JoinHandle<()>,
}

impl TestCluster {
    pub async fn start(replication_factor: usize, timeout_ms: u64) -> Self {
        let mut config = Config::new(0, replication_factor, timeout_ms, 3600);
        config.bind_ip = "127.0.0.1".parse().unwrap();

        let events = Arc::new(RecordingEventSink::new());
        let controller = Controller::with_events(config, events.clone()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = controller.run(listener).await;
        });

        let cluster = Self {
            addr,
            events,
            disks: Arc::new(Mutex::new(BTreeMap::new())),
            task,
        };
        // The rebalancer's first pass runs at startup and finds no nodes.
        assert!(cluster.wait_for(|c| c.passes() > 0).await);
        cluster
    }

    /// Joins a node and waits for the rebalance pass its join triggers.
    pub async fn join(&self, port: Port) -> FakeDstore {
        let before = self.passes();
        let node = FakeDstore::connect(self.addr, port, self.disks.clone()).await;
        assert_eq!(node.join_reply, Message::JoinAck);
        assert!(self.wait_for(|c| c.passes() > before).await);
        node
    }

    /// Number of finished rebalance passes, whatever their outcome.
    pub fn passes(&self) -> usize {
        self.events
            .events()
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    ClusterEvent::RebalanceSkipped { .. }
                        | ClusterEvent::RebalanceNotNeeded
                        | ClusterEvent::RebalanceCompleted { .. }
                        | ClusterEvent::RebalanceFailed { .. }
                )
            })
            .count()
    }

    pub async fn client(&self) -> TestClient {
        TestClient::connect(self.addr).await
    }

    pub fn disk(&self, port: Port) -> Placement {
        self.disks.lock().unwrap().get(&port).cloned().unwrap_or_default()
    }

    /// Polls until `condition` holds or the reply timeout passes.
    pub async fn wait_for(&self, mut condition: impl FnMut(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + REPLY_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition(self)
    }

    pub fn saw(&self, event: &ClusterEvent) -> bool {
        self.events.contains(event)
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A storage node that keeps its files in the shared `Disks` map. It answers
/// LIST, REMOVE and REBALANCE on its own; store acknowledgments are sent by
/// the test through [`FakeDstore::store`].
pub struct FakeDstore {
    pub port: Port,
    pub join_reply: Message,
    handle: ConnectionHandle,
    disks: Disks,
    task: Option<JoinHandle<()>>,
}

impl FakeDstore {
    pub async fn connect(addr: SocketAddr, port: Port, disks: Disks) -> Self {
        let (handle, mut reader) = Connection::connect(addr).await.unwrap();
        handle.send(&Message::JoinDstore { port }).unwrap();
        let join_reply = reader.next_message_timeout(REPLY_TIMEOUT).await.unwrap().unwrap();

        let task = (join_reply == Message::JoinAck).then(|| {
            disks.lock().unwrap().entry(port).or_default();
            let handle = handle.clone();
            let disks = disks.clone();
            tokio::spawn(Self::serve(port, handle, reader, disks))
        });

        Self {
            port,
            join_reply,
            handle,
            disks,
            task,
        }
    }

    async fn serve(port: Port, handle: ConnectionHandle, mut reader: MessageReader, disks: Disks) {
        while let Some(Ok(message)) = reader.next_message().await {
            let reply = match message {
                Message::List => {
                    let files = disks.lock().unwrap().get(&port).cloned().unwrap_or_default();
                    Message::Listing {
                        entries: files
                            .into_iter()
                            .map(|(filename, size)| FileEntry::new(filename, size))
                            .collect(),
                    }
                }
                Message::Remove { filename } => {
                    let removed = disks
                        .lock()
                        .unwrap()
                        .get_mut(&port)
                        .and_then(|files| files.remove(&filename));
                    match removed {
                        Some(_) => Message::RemoveAck { filename },
                        None => Message::ErrorFileDoesNotExist {
                            filename: Some(filename),
                        },
                    }
                }
                Message::Rebalance { sends, removals } => {
                    let mut disks = disks.lock().unwrap();
                    for send in sends {
                        for dest in send.destinations {
                            disks.entry(dest).or_default().insert(send.filename.clone(), send.size);
                        }
                    }
                    let own = disks.entry(port).or_default();
                    for filename in removals {
                        own.remove(&filename);
                    }
                    Message::RebalanceComplete {
                        entries: own
                            .iter()
                            .map(|(filename, size)| FileEntry::new(filename.clone(), *size))
                            .collect(),
                    }
                }
                _ => continue,
            };
            if handle.send(&reply).is_err() {
                break;
            }
        }
    }

    /// Writes the file to this node's disk and acknowledges it.
    pub fn store(&self, filename: &str, size: u64) {
        self.disks
            .lock()
            .unwrap()
            .entry(self.port)
            .or_default()
            .insert(filename.to_string(), size);
        self.handle
            .send(&Message::StoreAck {
                filename: filename.to_string(),
            })
            .unwrap();
    }

    /// Writes raw bytes on the node's controller connection.
    pub fn send_raw(&self, data: &'static [u8]) {
        self.handle.send_bytes(Bytes::from_static(data)).unwrap();
    }

    /// Drops the connection, as a crashed node would.
    pub fn disconnect(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for FakeDstore {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub struct TestClient {
    handle: ConnectionHandle,
    reader: MessageReader,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (handle, reader) = Connection::connect(addr).await.unwrap();
        Self { handle, reader }
    }

    pub fn send(&self, message: Message) {
        self.handle.send(&message).unwrap();
    }

    pub async fn receive(&mut self) -> Message {
        self.reader
            .next_message_timeout(REPLY_TIMEOUT)
            .await
            .unwrap()
            .expect("controller closed the connection")
    }

    pub async fn request(&mut self, message: Message) -> Message {
        self.send(message);
        self.receive().await
    }

    /// True if nothing arrives within `window`.
    pub async fn stays_silent(&mut self, window: Duration) -> bool {
        self.reader.next_message_timeout(window).await.is_err()
    }
}

pub fn store(filename: &str, size: u64) -> Message {
    Message::Store {
        filename: filename.to_string(),
        size,
    }
}

pub fn load(filename: &str) -> Message {
    Message::Load {
        filename: filename.to_string(),
    }
}

pub fn reload(filename: &str) -> Message {
    Message::Reload {
        filename: filename.to_string(),
    }
}

pub fn remove(filename: &str) -> Message {
    Message::Remove {
        filename: filename.to_string(),
    }
}
