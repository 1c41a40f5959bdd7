use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use index::{Placement, Port};

/// Which files each node holds, with nodes kept in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    nodes: Vec<(Port, Placement)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceReport {
    pub under_replicated: Vec<String>,
    pub over_replicated: Vec<String>,
    pub bounds: (usize, usize),
    pub out_of_range: Vec<Port>,
}

impl BalanceReport {
    pub fn is_balanced(&self) -> bool {
        self.under_replicated.is_empty() && self.over_replicated.is_empty() && self.out_of_range.is_empty()
    }
}

impl Distribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nodes(nodes: Vec<(Port, Placement)>) -> Self {
        Self { nodes }
    }

    /// Adds a node after those already present, or replaces its placement.
    pub fn insert_node(&mut self, port: Port, placement: Placement) {
        match self.nodes.iter_mut().find(|(p, _)| *p == port) {
            Some((_, existing)) => *existing = placement,
            None => self.nodes.push((port, placement)),
        }
    }

    pub fn nodes(&self) -> &[(Port, Placement)] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn placement(&self, port: Port) -> Option<&Placement> {
        self.nodes.iter().find(|(p, _)| *p == port).map(|(_, placement)| placement)
    }

    /// Every distinct file with the first size reported for it.
    pub fn files(&self) -> BTreeMap<String, u64> {
        let mut files = BTreeMap::new();
        for (_, placement) in &self.nodes {
            for (filename, size) in placement {
                files.entry(filename.clone()).or_insert(*size);
            }
        }
        files
    }

    pub fn replica_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for (_, placement) in &self.nodes {
            for filename in placement.keys() {
                *counts.entry(filename.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// The `[floor(R*F/N), ceil(R*F/N)]` range every node's file count should
    /// fall into.
    pub fn spread_bounds(&self, replication_factor: usize) -> (usize, usize) {
        let n = self.nodes.len();
        if n == 0 {
            return (0, 0);
        }
        let total = replication_factor * self.files().len();
        (total / n, total.div_ceil(n))
    }

    pub fn evaluate(&self, replication_factor: usize) -> BalanceReport {
        let mut under_replicated = Vec::new();
        let mut over_replicated = Vec::new();
        for (filename, count) in self.replica_counts() {
            if count < replication_factor {
                under_replicated.push(filename);
            } else if count > replication_factor {
                over_replicated.push(filename);
            }
        }

        let bounds = self.spread_bounds(replication_factor);
        let out_of_range = self
            .nodes
            .iter()
            .filter(|(_, placement)| placement.len() < bounds.0 || placement.len() > bounds.1)
            .map(|(port, _)| *port)
            .collect();

        BalanceReport {
            under_replicated,
            over_replicated,
            bounds,
            out_of_range,
        }
    }

    /// Drops every file not in `known` and returns what was dropped, per node.
    pub fn retain_known(&mut self, known: &BTreeSet<String>) -> BTreeMap<Port, Vec<String>> {
        let mut orphans = BTreeMap::new();
        for (port, placement) in &mut self.nodes {
            let unknown: Vec<String> = placement
                .keys()
                .filter(|filename| !known.contains(*filename))
                .cloned()
                .collect();
            for filename in &unknown {
                placement.remove(filename);
            }
            if !unknown.is_empty() {
                orphans.insert(*port, unknown);
            }
        }
        orphans
    }
}
