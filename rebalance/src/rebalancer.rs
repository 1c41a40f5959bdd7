use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;

use index::{ClusterEvent, EventSink, Index, NodeLink, Port};

use crate::distribution::Distribution;
use crate::planner::{Planner, RebalancePlan};
use crate::{Config, PassOutcome, RebalanceError, Result};

/// Background worker that keeps every file on R nodes and the file count of
/// every node within one of the others.
pub struct Rebalancer {
    config: Config,
    index: Arc<Index>,
    events: Arc<dyn EventSink>,
    trigger: Notify,
    pass_lock: Mutex<()>,
}

impl Rebalancer {
    pub fn new(config: Config, index: Arc<Index>, events: Arc<dyn EventSink>) -> Self {
        Self {
            config,
            index,
            events,
            trigger: Notify::new(),
            pass_lock: Mutex::new(()),
        }
    }

    /// Requests a pass as soon as the worker is free. Requests made while a
    /// pass is running collapse into a single follow-up pass.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        tracing::info!(
            "Starting rebalancer: every {:?}, replication factor {}",
            self.config.rebalance_period(),
            self.config.replication_factor
        );

        let mut interval = tokio::time::interval(self.config.rebalance_period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.trigger.notified() => {
                    tracing::debug!("Rebalance triggered");
                }
            }

            match self.run_pass().await {
                Ok(outcome) => tracing::debug!("Rebalance pass finished: {:?}", outcome),
                Err(e) => tracing::warn!("Rebalance pass aborted: {}", e),
            }
        }
    }

    pub async fn run_pass(&self) -> Result<PassOutcome> {
        let Ok(_pass) = self.pass_lock.try_lock() else {
            return Ok(PassOutcome::AlreadyRunning);
        };
        let _gate = self.index.exclusive_permit().await;

        let required = self.config.replication_factor;
        let links = self.index.node_links().await;
        if links.len() < required {
            return Ok(self.skip(format!("{} nodes registered, {} required", links.len(), required)));
        }

        let mut distribution = self.collect_reports(&links).await;
        if distribution.node_count() < required {
            return Ok(self.skip(format!(
                "{} of {} nodes answered LIST, {} required",
                distribution.node_count(),
                links.len(),
                required
            )));
        }

        let known = self.index.known_files().await;
        let orphans = distribution.retain_known(&known);

        let report = distribution.evaluate(required);
        if report.is_balanced() && orphans.is_empty() {
            self.events.emit(ClusterEvent::RebalanceNotNeeded);
            return Ok(PassOutcome::Balanced);
        }
        tracing::debug!(
            "Rebalancing: {} under-replicated, {} over-replicated, {} nodes outside {:?}, {} nodes with orphans",
            report.under_replicated.len(),
            report.over_replicated.len(),
            report.out_of_range.len(),
            report.bounds,
            orphans.len()
        );

        let plan = Planner::new(&distribution, required).with_orphans(&orphans).plan();

        let links: BTreeMap<Port, Arc<dyn NodeLink>> = links.into_iter().collect();
        if let Err(e) = self.execute(&plan, &links).await {
            self.events.emit(ClusterEvent::RebalanceFailed { reason: e.to_string() });
            return Err(e);
        }

        self.index.apply_distribution(plan.target().nodes()).await;

        let (sends, removals) = (plan.send_count(), plan.removal_count());
        self.events.emit(ClusterEvent::RebalanceCompleted { sends, removals });
        Ok(PassOutcome::Rebalanced { sends, removals })
    }

    fn skip(&self, reason: String) -> PassOutcome {
        self.events.emit(ClusterEvent::RebalanceSkipped { reason: reason.clone() });
        PassOutcome::Skipped { reason }
    }

    async fn collect_reports(&self, links: &[(Port, Arc<dyn NodeLink>)]) -> Distribution {
        let timeout = self.config.timeout();
        let reports = join_all(links.iter().map(|(port, link)| async move {
            (*port, link.list_files(timeout).await)
        }))
        .await;

        let mut distribution = Distribution::new();
        for (port, report) in reports {
            match report {
                Ok(placement) => distribution.insert_node(port, placement),
                Err(e) => tracing::warn!("Node {} left out of this pass: {}", port, e),
            }
        }
        distribution
    }

    async fn execute(&self, plan: &RebalancePlan, links: &BTreeMap<Port, Arc<dyn NodeLink>>) -> Result<()> {
        let timeout = self.config.timeout();

        let mut calls = Vec::with_capacity(plan.instructions().len());
        for (port, instruction) in plan.instructions() {
            let link = links.get(port).cloned().ok_or_else(|| {
                RebalanceError::RebalanceFailed(format!("no link to node {}", port))
            })?;
            calls.push(async move { (*port, link.rebalance(instruction, timeout).await) });
        }

        for (port, result) in join_all(calls).await {
            result.map_err(|source| RebalanceError::Link { port, source })?;
        }
        Ok(())
    }
}
