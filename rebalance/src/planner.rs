use std::collections::{BTreeMap, BTreeSet};

use index::{NodeInstruction, Placement, Port, SendInstruction};

use crate::distribution::Distribution;

/// Per-node instructions for one pass, and the distribution they produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalancePlan {
    instructions: BTreeMap<Port, NodeInstruction>,
    target: Distribution,
}

impl RebalancePlan {
    pub fn instructions(&self) -> &BTreeMap<Port, NodeInstruction> {
        &self.instructions
    }

    pub fn target(&self) -> &Distribution {
        &self.target
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn send_count(&self) -> usize {
        self.instructions.values().map(|i| i.sends.len()).sum()
    }

    pub fn removal_count(&self) -> usize {
        self.instructions.values().map(|i| i.removals.len()).sum()
    }
}

/// Works out the moves that bring a distribution to exactly R replicas per
/// file and an even spread across nodes.
///
/// Nodes are addressed by position, which is registration order. `physical`
/// is what each node reported; `holdings` is what it will hold once the plan
/// has run. A node only ever sends a file it physically holds, so a file that
/// moves twice within a pass is re-routed at its original source.
pub struct Planner {
    replication_factor: usize,
    ports: Vec<Port>,
    sizes: BTreeMap<String, u64>,
    physical: Vec<BTreeSet<String>>,
    holdings: Vec<BTreeSet<String>>,
    sends: BTreeMap<usize, BTreeMap<String, BTreeSet<usize>>>,
    removals: BTreeMap<usize, BTreeSet<String>>,
}

impl Planner {
    pub fn new(distribution: &Distribution, replication_factor: usize) -> Self {
        let ports = distribution.nodes().iter().map(|(port, _)| *port).collect();
        let physical: Vec<BTreeSet<String>> = distribution
            .nodes()
            .iter()
            .map(|(_, placement)| placement.keys().cloned().collect())
            .collect();

        Self {
            replication_factor,
            ports,
            sizes: distribution.files(),
            holdings: physical.clone(),
            physical,
            sends: BTreeMap::new(),
            removals: BTreeMap::new(),
        }
    }

    /// Files to delete outright on some node, regardless of placement.
    pub fn with_orphans(mut self, orphans: &BTreeMap<Port, Vec<String>>) -> Self {
        for (port, filenames) in orphans {
            if let Some(i) = self.ports.iter().position(|p| p == port) {
                self.removals.entry(i).or_default().extend(filenames.iter().cloned());
            }
        }
        self
    }

    pub fn plan(mut self) -> RebalancePlan {
        self.fix_replication();
        self.even_out();
        self.finish()
    }

    fn fix_replication(&mut self) {
        let filenames: Vec<String> = self.sizes.keys().cloned().collect();

        for filename in filenames {
            let holders: Vec<usize> = (0..self.ports.len())
                .filter(|&i| self.holdings[i].contains(&filename))
                .collect();

            if holders.len() < self.replication_factor {
                let mut receivers: Vec<usize> = (0..self.ports.len())
                    .filter(|&i| !self.holdings[i].contains(&filename))
                    .collect();
                receivers.sort_by_key(|&i| (self.holdings[i].len(), i));

                for i in receivers.into_iter().take(self.replication_factor - holders.len()) {
                    self.add_to(i, &filename);
                }
            } else if holders.len() > self.replication_factor {
                let mut donors = holders.clone();
                donors.sort_by_key(|&i| (std::cmp::Reverse(self.holdings[i].len()), i));

                for i in donors.into_iter().take(holders.len() - self.replication_factor) {
                    self.remove_from(i, &filename);
                }
            }
        }
    }

    fn even_out(&mut self) {
        while let Some((from, to)) = self.extremes() {
            if self.holdings[from].len() < self.holdings[to].len() + 2 {
                break;
            }

            let candidate = self.holdings[from]
                .iter()
                .find(|f| !self.holdings[to].contains(*f))
                .cloned();
            let Some(filename) = candidate else {
                break;
            };

            self.remove_from(from, &filename);
            self.add_to(to, &filename);
        }
    }

    /// Most-loaded and least-loaded node, ties going to the earlier node.
    fn extremes(&self) -> Option<(usize, usize)> {
        let count = |i: &usize| self.holdings[*i].len();
        let most = (0..self.ports.len()).min_by_key(|i| (std::cmp::Reverse(count(i)), *i))?;
        let least = (0..self.ports.len()).min_by_key(|i| (count(i), *i))?;
        Some((most, least))
    }

    fn add_to(&mut self, node: usize, filename: &str) {
        self.holdings[node].insert(filename.to_string());

        if self.physical[node].contains(filename) {
            if let Some(removals) = self.removals.get_mut(&node) {
                removals.remove(filename);
            }
            return;
        }

        let source = (0..self.ports.len()).find(|&i| self.physical[i].contains(filename));
        if let Some(source) = source {
            self.sends
                .entry(source)
                .or_default()
                .entry(filename.to_string())
                .or_default()
                .insert(node);
        }
    }

    fn remove_from(&mut self, node: usize, filename: &str) {
        self.holdings[node].remove(filename);

        if self.physical[node].contains(filename) {
            self.removals.entry(node).or_default().insert(filename.to_string());
            return;
        }

        for files in self.sends.values_mut() {
            if let Some(destinations) = files.get_mut(filename) {
                destinations.remove(&node);
                if destinations.is_empty() {
                    files.remove(filename);
                }
            }
        }
    }

    fn finish(self) -> RebalancePlan {
        let mut instructions = BTreeMap::new();

        for (i, port) in self.ports.iter().enumerate() {
            let sends: Vec<SendInstruction> = self
                .sends
                .get(&i)
                .into_iter()
                .flatten()
                .map(|(filename, destinations)| SendInstruction {
                    filename: filename.clone(),
                    size: self.sizes.get(filename).copied().unwrap_or_default(),
                    destinations: destinations.iter().map(|d| self.ports[*d]).collect(),
                })
                .collect();
            let removals: Vec<String> = self
                .removals
                .get(&i)
                .into_iter()
                .flatten()
                .cloned()
                .collect();

            let instruction = NodeInstruction { sends, removals };
            if !instruction.is_empty() {
                instructions.insert(*port, instruction);
            }
        }

        let target = Distribution::from_nodes(
            self.ports
                .iter()
                .zip(&self.holdings)
                .map(|(port, files)| {
                    let placement: Placement = files
                        .iter()
                        .map(|f| (f.clone(), self.sizes.get(f).copied().unwrap_or_default()))
                        .collect();
                    (*port, placement)
                })
                .collect(),
        );

        RebalancePlan { instructions, target }
    }
}
