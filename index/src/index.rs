use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::Instant;
use uuid::Uuid;

use crate::events::{ClusterEvent, EventSink};
use crate::link::NodeLink;
use crate::types::*;
use crate::{IndexError, Result};

/// Authoritative record of cluster membership, file placement and per-file
/// operation state.
///
/// All state sits behind one coarse lock. Waiters park on `changed`, which is
/// signalled after every state transition, so no caller ever holds the lock
/// while blocked.
pub struct Index {
    replication_factor: usize,
    state: RwLock<IndexState>,
    changed: Notify,
    gate: RwLock<()>,
    events: Arc<dyn EventSink>,
}

#[derive(Default)]
struct IndexState {
    // Registration order; it breaks every placement tie.
    nodes: Vec<StorageNode>,
    pending: HashMap<String, PendingOperation>,
    load_attempts: HashMap<Uuid, HashMap<String, HashSet<Port>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperationKind {
    Store,
    Remove,
}

struct PendingOperation {
    kind: OperationKind,
    nodes: Vec<Port>,
}

impl IndexState {
    fn node(&self, port: Port) -> Option<&StorageNode> {
        self.nodes.iter().find(|n| n.port == port)
    }

    fn node_mut(&mut self, port: Port) -> Option<&mut StorageNode> {
        self.nodes.iter_mut().find(|n| n.port == port)
    }

    fn ensure_enough_nodes(&self, required: usize) -> Result<()> {
        if self.nodes.len() < required {
            return Err(IndexError::InsufficientNodes {
                current: self.nodes.len(),
                required,
            });
        }
        Ok(())
    }

    fn is_known(&self, filename: &str) -> bool {
        self.pending.contains_key(filename) || self.nodes.iter().any(|n| n.files.contains_key(filename))
    }

    /// Holders of a file that is durably stored everywhere it lives, in
    /// registration order. Empty if the file is absent or any replica is busy.
    fn settled_holders(&self, filename: &str) -> Vec<(Port, u64)> {
        if self.pending.contains_key(filename) {
            return Vec::new();
        }

        let mut holders = Vec::new();
        for node in &self.nodes {
            if let Some(record) = node.files.get(filename) {
                if !record.state.is_idle() {
                    return Vec::new();
                }
                holders.push((node.port, record.size));
            }
        }
        holders
    }

    fn expected_nodes(&self, filename: &str) -> Vec<Port> {
        match self.pending.get(filename) {
            Some(op) => op.nodes.clone(),
            None => self
                .nodes
                .iter()
                .filter(|n| n.files.contains_key(filename))
                .map(|n| n.port)
                .collect(),
        }
    }

    fn reached(&self, filename: &str, target: OperationState) -> bool {
        let expected = self.expected_nodes(filename);
        !expected.is_empty()
            && expected.iter().all(|port| {
                self.node(*port)
                    .and_then(|n| n.files.get(filename))
                    .map(|r| r.state == target)
                    .unwrap_or(false)
            })
    }

    fn settle(&mut self, filename: &str, target: OperationState) {
        self.pending.remove(filename);
        match target {
            OperationState::StoreAckReceived => {
                for node in &mut self.nodes {
                    if let Some(record) = node.files.get_mut(filename) {
                        if record.state == OperationState::StoreAckReceived {
                            record.state = OperationState::Idle;
                        }
                    }
                }
            }
            OperationState::RemoveAckReceived => self.drop_records(filename),
            _ => {}
        }
    }

    fn drop_records(&mut self, filename: &str) {
        for node in &mut self.nodes {
            node.files.remove(filename);
        }
    }

    fn advance(&mut self, port: Port, filename: &str, from: OperationState, to: OperationState) -> bool {
        match self.node_mut(port).and_then(|n| n.files.get_mut(filename)) {
            Some(record) if record.state == from && from.can_advance_to(to) => {
                record.state = to;
                true
            }
            _ => false,
        }
    }
}

impl Index {
    pub fn new(replication_factor: usize, events: Arc<dyn EventSink>) -> Self {
        Self {
            replication_factor,
            state: RwLock::new(IndexState::default()),
            changed: Notify::new(),
            gate: RwLock::new(()),
            events,
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    pub async fn node_count(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    pub async fn register_node(&self, port: Port, connection: Uuid, link: Arc<dyn NodeLink>) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if state.node(port).is_some() {
                drop(state);
                self.events.emit(ClusterEvent::NodeRejected { port });
                return Err(IndexError::PortInUse(port));
            }
            state.nodes.push(StorageNode::new(port, connection, link));
        }

        self.events.emit(ClusterEvent::NodeJoined { port });
        Ok(())
    }

    pub async fn remove_node(&self, connection: Uuid) {
        let removed = {
            let mut state = self.state.write().await;
            let position = state.nodes.iter().position(|n| n.connection == connection);
            position.map(|i| state.nodes.remove(i))
        };

        if let Some(node) = removed {
            self.changed.notify_waiters();
            tracing::debug!(
                "Dropped {} file records held by node {}",
                node.file_count(),
                node.port
            );
            self.events.emit(ClusterEvent::NodeLeft { port: node.port });
        }
    }

    /// Every known file with its size, whatever its operation state.
    pub async fn list_files(&self) -> Result<Placement> {
        let state = self.state.read().await;
        state.ensure_enough_nodes(self.replication_factor)?;

        let mut files = Placement::new();
        for node in &state.nodes {
            for record in node.files.values() {
                files.entry(record.filename.clone()).or_insert(record.size);
            }
        }
        Ok(files)
    }

    pub async fn known_files(&self) -> BTreeSet<String> {
        let state = self.state.read().await;
        let mut files: BTreeSet<String> = state.pending.keys().cloned().collect();
        for node in &state.nodes {
            files.extend(node.files.keys().cloned());
        }
        files
    }

    /// Reserves the R least-loaded nodes for a new file.
    pub async fn begin_store(&self, filename: &str, size: u64) -> Result<Vec<Port>> {
        let ports = {
            let mut state = self.state.write().await;
            state.ensure_enough_nodes(self.replication_factor)?;
            if state.is_known(filename) {
                return Err(IndexError::FileAlreadyExists(filename.to_string()));
            }

            let mut by_load: Vec<(usize, usize)> = state
                .nodes
                .iter()
                .enumerate()
                .map(|(i, n)| (n.file_count(), i))
                .collect();
            by_load.sort();

            let mut ports = Vec::with_capacity(self.replication_factor);
            for (_, i) in by_load.into_iter().take(self.replication_factor) {
                let node = &mut state.nodes[i];
                node.files.insert(
                    filename.to_string(),
                    FileRecord::new(filename, size, OperationState::StoreInProgress),
                );
                ports.push(node.port);
            }

            state.pending.insert(
                filename.to_string(),
                PendingOperation {
                    kind: OperationKind::Store,
                    nodes: ports.clone(),
                },
            );
            ports
        };

        self.events.emit(ClusterEvent::StoreStarted {
            filename: filename.to_string(),
            nodes: ports.clone(),
        });
        Ok(ports)
    }

    pub async fn ack_store(&self, port: Port, filename: &str) {
        self.acknowledge(
            port,
            filename,
            OperationState::StoreInProgress,
            OperationState::StoreAckReceived,
        )
        .await
    }

    pub async fn begin_remove(&self, filename: &str) -> Result<Vec<Port>> {
        let ports = {
            let mut state = self.state.write().await;
            state.ensure_enough_nodes(self.replication_factor)?;

            let holders = state.settled_holders(filename);
            if holders.is_empty() {
                return Err(IndexError::FileNotFound(filename.to_string()));
            }

            let ports: Vec<Port> = holders.into_iter().map(|(port, _)| port).collect();
            for port in &ports {
                state.advance(*port, filename, OperationState::Idle, OperationState::RemoveInProgress);
            }
            state.pending.insert(
                filename.to_string(),
                PendingOperation {
                    kind: OperationKind::Remove,
                    nodes: ports.clone(),
                },
            );
            ports
        };

        self.events.emit(ClusterEvent::RemoveStarted {
            filename: filename.to_string(),
            nodes: ports.clone(),
        });
        Ok(ports)
    }

    pub async fn ack_remove(&self, port: Port, filename: &str) {
        self.acknowledge(
            port,
            filename,
            OperationState::RemoveInProgress,
            OperationState::RemoveAckReceived,
        )
        .await
    }

    async fn acknowledge(&self, port: Port, filename: &str, from: OperationState, to: OperationState) {
        let advanced = self.state.write().await.advance(port, filename, from, to);

        if advanced {
            self.changed.notify_waiters();
        } else {
            self.events.emit(ClusterEvent::AckIgnored {
                port,
                filename: filename.to_string(),
            });
        }
    }

    /// Blocks until every replica of the file's current operation has reached
    /// `target`, then finalises it. On timeout the operation is rolled back and
    /// every record of the file is dropped.
    pub async fn await_state(&self, filename: &str, target: OperationState, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_settle(filename, target).await {
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.expire(filename, target).await;
            }
        }
    }

    async fn try_settle(&self, filename: &str, target: OperationState) -> bool {
        let kind = {
            let mut state = self.state.write().await;
            if !state.reached(filename, target) {
                return false;
            }
            let kind = state.pending.get(filename).map(|op| op.kind);
            state.settle(filename, target);
            kind
        };

        self.changed.notify_waiters();
        match kind {
            Some(OperationKind::Store) => self.events.emit(ClusterEvent::StoreCompleted {
                filename: filename.to_string(),
            }),
            Some(OperationKind::Remove) => self.events.emit(ClusterEvent::RemoveCompleted {
                filename: filename.to_string(),
            }),
            None => {}
        }
        true
    }

    async fn expire(&self, filename: &str, target: OperationState) -> Result<()> {
        // The last acknowledgment may have landed just as the deadline passed.
        if self.try_settle(filename, target).await {
            return Ok(());
        }

        let kind = {
            let mut state = self.state.write().await;
            let kind = state.pending.remove(filename).map(|op| op.kind);
            state.drop_records(filename);
            kind
        };

        self.changed.notify_waiters();
        match kind {
            Some(OperationKind::Store) => self.events.emit(ClusterEvent::StoreRolledBack {
                filename: filename.to_string(),
            }),
            Some(OperationKind::Remove) => self.events.emit(ClusterEvent::RemoveTimedOut {
                filename: filename.to_string(),
            }),
            None => {}
        }
        Err(IndexError::OperationTimedOut(filename.to_string()))
    }

    /// Picks the replica a client should load from. A retry never returns a
    /// node already handed to the same client for the same file.
    pub async fn resolve_load_target(&self, client: Uuid, filename: &str, is_retry: bool) -> Result<LoadTarget> {
        let mut state = self.state.write().await;
        state.ensure_enough_nodes(self.replication_factor)?;

        let holders = state.settled_holders(filename);
        if holders.is_empty() {
            return Err(IndexError::FileNotFound(filename.to_string()));
        }

        let tried = state
            .load_attempts
            .entry(client)
            .or_default()
            .entry(filename.to_string())
            .or_default();
        if !is_retry {
            tried.clear();
        }

        match holders.into_iter().find(|(port, _)| !tried.contains(port)) {
            Some((port, size)) => {
                tried.insert(port);
                Ok(LoadTarget { port, size })
            }
            None => {
                drop(state);
                self.events.emit(ClusterEvent::LoadExhausted {
                    filename: filename.to_string(),
                });
                Err(IndexError::NoViableNode(filename.to_string()))
            }
        }
    }

    pub async fn forget_client(&self, client: Uuid) {
        self.state.write().await.load_attempts.remove(&client);
    }

    pub async fn file_size(&self, filename: &str) -> Result<u64> {
        let state = self.state.read().await;
        state
            .nodes
            .iter()
            .find_map(|n| n.files.get(filename))
            .map(|r| r.size)
            .ok_or_else(|| IndexError::FileNotFound(filename.to_string()))
    }

    pub async fn link_for(&self, port: Port) -> Option<Arc<dyn NodeLink>> {
        self.state.read().await.node(port).map(|n| n.link())
    }

    /// Registered nodes and their links, in registration order.
    pub async fn node_links(&self) -> Vec<(Port, Arc<dyn NodeLink>)> {
        let state = self.state.read().await;
        state.nodes.iter().map(|n| (n.port, n.link())).collect()
    }

    /// Replaces the settled placement of each listed node. Records with an
    /// operation in flight and nodes not listed are left alone.
    pub async fn apply_distribution(&self, placements: &[(Port, Placement)]) {
        {
            let mut state = self.state.write().await;
            for (port, files) in placements {
                let Some(node) = state.node_mut(*port) else {
                    tracing::debug!("Node {} left before its placement was applied", port);
                    continue;
                };
                node.files.retain(|_, record| !record.state.is_idle());
                for (filename, size) in files {
                    node.files
                        .entry(filename.clone())
                        .or_insert_with(|| FileRecord::new(filename.clone(), *size, OperationState::Idle));
                }
            }
        }
        self.changed.notify_waiters();
    }

    /// Shared permit held by a client operation for its whole duration.
    pub async fn operation_permit(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Exclusive permit held by a rebalance pass; waits for in-flight client
    /// operations and holds back new ones.
    pub async fn exclusive_permit(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    pub async fn cluster_view(&self) -> ClusterView {
        let state = self.state.read().await;

        let nodes = state
            .nodes
            .iter()
            .map(|n| NodeSummary {
                port: n.port,
                file_count: n.file_count(),
                joined_at: n.joined_at,
            })
            .collect();

        let mut files: BTreeMap<String, FileSummary> = BTreeMap::new();
        for node in &state.nodes {
            for record in node.files.values() {
                files
                    .entry(record.filename.clone())
                    .or_insert_with(|| FileSummary {
                        filename: record.filename.clone(),
                        size: record.size,
                        replicas: Vec::new(),
                    })
                    .replicas
                    .push(ReplicaSummary {
                        port: node.port,
                        state: record.state,
                    });
            }
        }

        ClusterView {
            replication_factor: self.replication_factor,
            nodes,
            files: files.into_values().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;
    use crate::link::LinkError;
    use async_trait::async_trait;

    struct NullLink;

    #[async_trait]
    impl NodeLink for NullLink {
        async fn list_files(&self, _timeout: Duration) -> std::result::Result<Placement, LinkError> {
            Ok(Placement::new())
        }

        async fn rebalance(
            &self,
            _instruction: &NodeInstruction,
            _timeout: Duration,
        ) -> std::result::Result<(), LinkError> {
            Ok(())
        }

        fn remove_file(&self, _filename: &str) -> std::result::Result<(), LinkError> {
            Ok(())
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(200);

    async fn index_with_nodes(r: usize, ports: &[Port]) -> (Arc<Index>, Arc<RecordingEventSink>, Vec<Uuid>) {
        let events = Arc::new(RecordingEventSink::new());
        let index = Arc::new(Index::new(r, events.clone()));
        let mut connections = Vec::new();
        for port in ports {
            let connection = Uuid::new_v4();
            index.register_node(*port, connection, Arc::new(NullLink)).await.unwrap();
            connections.push(connection);
        }
        (index, events, connections)
    }

    async fn store(index: &Index, filename: &str, size: u64) -> Vec<Port> {
        let ports = index.begin_store(filename, size).await.unwrap();
        for port in &ports {
            index.ack_store(*port, filename).await;
        }
        index
            .await_state(filename, OperationState::StoreAckReceived, TIMEOUT)
            .await
            .unwrap();
        ports
    }

    #[tokio::test]
    async fn duplicate_port_is_rejected() {
        let (index, events, _) = index_with_nodes(1, &[4000]).await;
        let result = index.register_node(4000, Uuid::new_v4(), Arc::new(NullLink)).await;
        assert_eq!(result, Err(IndexError::PortInUse(4000)));
        assert_eq!(index.node_count().await, 1);
        assert!(events.contains(&ClusterEvent::NodeRejected { port: 4000 }));
    }

    #[tokio::test]
    async fn remove_node_is_idempotent() {
        let (index, _, connections) = index_with_nodes(1, &[4000, 4001]).await;
        index.remove_node(connections[0]).await;
        index.remove_node(connections[0]).await;
        assert_eq!(index.node_count().await, 1);

        // The port is free again once its node has gone.
        index.register_node(4000, Uuid::new_v4(), Arc::new(NullLink)).await.unwrap();
    }

    #[tokio::test]
    async fn store_needs_r_nodes_and_leaves_nothing_behind() {
        let (index, _, _) = index_with_nodes(3, &[4000, 4001]).await;
        let result = index.begin_store("a.txt", 10).await;
        assert_eq!(
            result,
            Err(IndexError::InsufficientNodes {
                current: 2,
                required: 3
            })
        );
        assert!(index.known_files().await.is_empty());
        assert!(matches!(
            index.list_files().await,
            Err(IndexError::InsufficientNodes { .. })
        ));
    }

    #[tokio::test]
    async fn store_picks_least_loaded_nodes_in_registration_order() {
        let (index, _, _) = index_with_nodes(2, &[4000, 4001, 4002]).await;

        assert_eq!(store(&index, "a.txt", 10).await, vec![4000, 4001]);
        assert_eq!(store(&index, "b.txt", 10).await, vec![4002, 4000]);
        assert_eq!(store(&index, "c.txt", 10).await, vec![4001, 4002]);
    }

    #[tokio::test]
    async fn completed_store_is_listed_and_loadable() {
        let (index, events, _) = index_with_nodes(2, &[4000, 4001, 4002]).await;
        store(&index, "x.txt", 100).await;

        let files = index.list_files().await.unwrap();
        assert_eq!(files.get("x.txt"), Some(&100));
        let target = index.resolve_load_target(Uuid::new_v4(), "x.txt", false).await.unwrap();
        assert_eq!(target, LoadTarget { port: 4000, size: 100 });
        assert!(events.contains(&ClusterEvent::StoreCompleted {
            filename: "x.txt".to_string()
        }));
    }

    #[tokio::test]
    async fn existing_file_cannot_be_stored_again() {
        let (index, _, _) = index_with_nodes(2, &[4000, 4001, 4002]).await;
        store(&index, "x.txt", 100).await;

        assert_eq!(
            index.begin_store("x.txt", 5).await,
            Err(IndexError::FileAlreadyExists("x.txt".to_string()))
        );
        assert_eq!(index.file_size("x.txt").await, Ok(100));

        // A store still in flight also blocks the name.
        index.begin_store("y.txt", 1).await.unwrap();
        assert_eq!(
            index.begin_store("y.txt", 1).await,
            Err(IndexError::FileAlreadyExists("y.txt".to_string()))
        );
    }

    #[tokio::test]
    async fn unacknowledged_store_rolls_back() {
        let (index, events, _) = index_with_nodes(2, &[4000, 4001]).await;
        let ports = index.begin_store("x.txt", 100).await.unwrap();
        index.ack_store(ports[0], "x.txt").await;

        let result = index
            .await_state("x.txt", OperationState::StoreAckReceived, Duration::from_millis(50))
            .await;
        assert_eq!(result, Err(IndexError::OperationTimedOut("x.txt".to_string())));
        assert!(index.known_files().await.is_empty());
        assert!(events.contains(&ClusterEvent::StoreRolledBack {
            filename: "x.txt".to_string()
        }));

        // The name is free again.
        index.begin_store("x.txt", 100).await.unwrap();
    }

    #[tokio::test]
    async fn acks_arriving_while_waiting_complete_the_store() {
        let (index, _, _) = index_with_nodes(2, &[4000, 4001]).await;
        let ports = index.begin_store("x.txt", 100).await.unwrap();

        let waiter = {
            let index = index.clone();
            tokio::spawn(async move {
                index
                    .await_state("x.txt", OperationState::StoreAckReceived, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Out of order on purpose; matching is by node and filename.
        index.ack_store(ports[1], "x.txt").await;
        index.ack_store(ports[0], "x.txt").await;

        assert_eq!(waiter.await.unwrap(), Ok(()));
        let view = index.cluster_view().await;
        assert!(view.files[0]
            .replicas
            .iter()
            .all(|r| r.state == OperationState::Idle));
    }

    #[tokio::test]
    async fn losing_a_reserved_node_makes_the_store_time_out() {
        let (index, _, connections) = index_with_nodes(2, &[4000, 4001, 4002]).await;
        let ports = index.begin_store("x.txt", 100).await.unwrap();
        index.ack_store(ports[0], "x.txt").await;
        index.remove_node(connections[1]).await;

        let result = index
            .await_state("x.txt", OperationState::StoreAckReceived, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(IndexError::OperationTimedOut(_))));
        assert!(index.known_files().await.is_empty());
    }

    #[tokio::test]
    async fn late_and_duplicate_acks_are_ignored() {
        let (index, events, _) = index_with_nodes(2, &[4000, 4001]).await;
        index.ack_store(4000, "ghost.txt").await;
        assert!(events.contains(&ClusterEvent::AckIgnored {
            port: 4000,
            filename: "ghost.txt".to_string()
        }));

        store(&index, "x.txt", 1).await;
        index.ack_store(4000, "x.txt").await;
        let view = index.cluster_view().await;
        assert!(view.files[0].replicas.iter().all(|r| r.state.is_idle()));
    }

    #[tokio::test]
    async fn remove_of_missing_file_fails() {
        let (index, _, _) = index_with_nodes(2, &[4000, 4001]).await;
        assert_eq!(
            index.begin_remove("nope.txt").await,
            Err(IndexError::FileNotFound("nope.txt".to_string()))
        );
    }

    #[tokio::test]
    async fn acknowledged_remove_deletes_every_record() {
        let (index, events, _) = index_with_nodes(2, &[4000, 4001, 4002]).await;
        store(&index, "x.txt", 100).await;

        let ports = index.begin_remove("x.txt").await.unwrap();
        assert_eq!(ports, vec![4000, 4001]);
        for port in &ports {
            index.ack_remove(*port, "x.txt").await;
        }
        index
            .await_state("x.txt", OperationState::RemoveAckReceived, TIMEOUT)
            .await
            .unwrap();

        assert!(index.list_files().await.unwrap().is_empty());
        assert!(events.contains(&ClusterEvent::RemoveCompleted {
            filename: "x.txt".to_string()
        }));
    }

    #[tokio::test]
    async fn timed_out_remove_still_drops_the_file() {
        let (index, _, _) = index_with_nodes(2, &[4000, 4001]).await;
        store(&index, "x.txt", 100).await;
        index.begin_remove("x.txt").await.unwrap();
        index.ack_remove(4000, "x.txt").await;

        let result = index
            .await_state("x.txt", OperationState::RemoveAckReceived, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(IndexError::OperationTimedOut(_))));
        assert!(index.known_files().await.is_empty());
    }

    #[tokio::test]
    async fn busy_files_are_invisible_to_load_and_remove() {
        let (index, _, _) = index_with_nodes(2, &[4000, 4001]).await;
        index.begin_store("x.txt", 100).await.unwrap();

        assert_eq!(
            index.begin_remove("x.txt").await,
            Err(IndexError::FileNotFound("x.txt".to_string()))
        );
        assert_eq!(
            index.resolve_load_target(Uuid::new_v4(), "x.txt", false).await,
            Err(IndexError::FileNotFound("x.txt".to_string()))
        );
        // Listing shows files whatever their state.
        assert!(index.list_files().await.unwrap().contains_key("x.txt"));
    }

    #[tokio::test]
    async fn reload_walks_each_replica_once() {
        let (index, events, _) = index_with_nodes(3, &[4000, 4001, 4002, 4003]).await;
        store(&index, "x.txt", 100).await;
        let client = Uuid::new_v4();

        let mut seen = Vec::new();
        seen.push(index.resolve_load_target(client, "x.txt", false).await.unwrap().port);
        seen.push(index.resolve_load_target(client, "x.txt", true).await.unwrap().port);
        seen.push(index.resolve_load_target(client, "x.txt", true).await.unwrap().port);
        assert_eq!(seen, vec![4000, 4001, 4002]);

        assert_eq!(
            index.resolve_load_target(client, "x.txt", true).await,
            Err(IndexError::NoViableNode("x.txt".to_string()))
        );
        assert!(events.contains(&ClusterEvent::LoadExhausted {
            filename: "x.txt".to_string()
        }));

        // A fresh load starts over; other clients are unaffected.
        assert_eq!(index.resolve_load_target(client, "x.txt", false).await.unwrap().port, 4000);
        assert_eq!(
            index.resolve_load_target(Uuid::new_v4(), "x.txt", true).await.unwrap().port,
            4000
        );
    }

    #[tokio::test]
    async fn forgetting_a_client_resets_its_attempts() {
        let (index, _, _) = index_with_nodes(1, &[4000]).await;
        store(&index, "x.txt", 1).await;
        let client = Uuid::new_v4();

        index.resolve_load_target(client, "x.txt", false).await.unwrap();
        assert!(index.resolve_load_target(client, "x.txt", true).await.is_err());

        index.forget_client(client).await;
        assert_eq!(index.resolve_load_target(client, "x.txt", true).await.unwrap().port, 4000);
    }

    #[tokio::test]
    async fn file_size_of_unknown_file_fails() {
        let (index, _, _) = index_with_nodes(1, &[4000]).await;
        assert_eq!(
            index.file_size("x.txt").await,
            Err(IndexError::FileNotFound("x.txt".to_string()))
        );
    }

    #[tokio::test]
    async fn applied_distribution_replaces_only_settled_records() {
        let (index, _, _) = index_with_nodes(1, &[4000, 4001]).await;
        store(&index, "a.txt", 1).await;
        index.begin_store("busy.txt", 2).await.unwrap();

        let mut moved = Placement::new();
        moved.insert("a.txt".to_string(), 1);
        index
            .apply_distribution(&[(4000, Placement::new()), (4001, moved), (4999, Placement::new())])
            .await;

        let view = index.cluster_view().await;
        let a = view.files.iter().find(|f| f.filename == "a.txt").unwrap();
        assert_eq!(a.replicas.len(), 1);
        assert_eq!(a.replicas[0].port, 4001);
        let busy = view.files.iter().find(|f| f.filename == "busy.txt").unwrap();
        assert_eq!(busy.replicas[0].state, OperationState::StoreInProgress);
    }

    #[tokio::test]
    async fn exclusive_permit_waits_for_operations() {
        let (index, _, _) = index_with_nodes(1, &[4000]).await;
        let permit = index.operation_permit().await;

        let pending = {
            let index = index.clone();
            tokio::spawn(async move {
                let _exclusive = index.exclusive_permit().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        drop(permit);
        pending.await.unwrap();
    }
}
