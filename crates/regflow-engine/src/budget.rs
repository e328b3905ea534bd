//! Shared resource budget
//!
//! Every running node holds a lease on part of the budget. A node whose hint
//! does not fit the remaining capacity stays queued until earlier leases are
//! dropped. Dropping a lease wakes every run waiting on the budget, including
//! runs of embedded graphs that share it.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::config::SchedulerConfig;
use crate::types::ResourceHint;

#[derive(Debug, Default)]
struct Usage {
    memory_gb: f64,
    threads: usize,
    nodes: usize,
    releases: u64,
}

/// Memory/thread accounting shared by a run and its embedded subgraphs
#[derive(Debug)]
pub struct ResourceBudget {
    max_memory_gb: f64,
    max_threads: usize,
    max_nodes: Option<usize>,
    usage: Mutex<Usage>,
    released: Notify,
}

impl ResourceBudget {
    /// Create a budget with the config's ceilings
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            max_memory_gb: config.max_memory_gb,
            max_threads: config.max_threads,
            max_nodes: config.max_concurrent_nodes,
            usage: Mutex::new(Usage::default()),
            released: Notify::new(),
        }
    }

    /// Clamp a hint so it can always be admitted on an idle budget
    pub fn clamp(&self, hint: &ResourceHint) -> ResourceHint {
        let clamped = hint.clamped(self.max_memory_gb, self.max_threads);
        if clamped != *hint {
            log::warn!(
                "Clamping hint {:.1} GB / {} threads to ceiling {:.1} GB / {} threads",
                hint.approx_memory_gb,
                hint.approx_threads,
                self.max_memory_gb,
                self.max_threads
            );
        }
        clamped
    }

    /// Try to reserve capacity for a node
    ///
    /// `None` as hint means unconstrained: only the node-count cap applies.
    /// Returns `None` if the reservation does not fit right now.
    pub fn try_acquire(self: &Arc<Self>, hint: Option<&ResourceHint>) -> Option<BudgetLease> {
        let claim = hint.map(|h| self.clamp(h));
        let mut usage = self.usage.lock();

        if let Some(max_nodes) = self.max_nodes {
            if usage.nodes >= max_nodes {
                return None;
            }
        }

        if let Some(claim) = &claim {
            // A small epsilon avoids float noise rejecting an exact fit
            if usage.memory_gb + claim.approx_memory_gb > self.max_memory_gb + 1e-9 {
                return None;
            }
            if usage.threads + claim.approx_threads > self.max_threads {
                return None;
            }
            usage.memory_gb += claim.approx_memory_gb;
            usage.threads += claim.approx_threads;
        }
        usage.nodes += 1;

        Some(BudgetLease {
            budget: Arc::clone(self),
            claim,
        })
    }

    /// Memory currently claimed
    pub fn memory_in_use(&self) -> f64 {
        self.usage.lock().memory_gb
    }

    /// Threads currently claimed
    pub fn threads_in_use(&self) -> usize {
        self.usage.lock().threads
    }

    /// Nodes currently holding a lease
    pub fn nodes_in_flight(&self) -> usize {
        self.usage.lock().nodes
    }

    /// Number of leases dropped so far
    pub fn release_count(&self) -> u64 {
        self.usage.lock().releases
    }

    /// Resolves on the next lease drop
    ///
    /// Call `enable` on the pinned future before checking capacity so a
    /// release in between is not missed.
    pub fn released(&self) -> Notified<'_> {
        self.released.notified()
    }

    fn release(&self, claim: Option<&ResourceHint>) {
        {
            let mut usage = self.usage.lock();
            if let Some(claim) = claim {
                usage.memory_gb = (usage.memory_gb - claim.approx_memory_gb).max(0.0);
                usage.threads = usage.threads.saturating_sub(claim.approx_threads);
            }
            usage.nodes = usage.nodes.saturating_sub(1);
            usage.releases += 1;
        }
        self.released.notify_waiters();
    }
}

/// Reservation released on drop
#[derive(Debug)]
pub struct BudgetLease {
    budget: Arc<ResourceBudget>,
    claim: Option<ResourceHint>,
}

impl BudgetLease {
    /// The (clamped) reservation held by this lease
    pub fn claim(&self) -> Option<&ResourceHint> {
        self.claim.as_ref()
    }
}

impl Drop for BudgetLease {
    fn drop(&mut self) {
        self.budget.release(self.claim.as_ref());
    }
}
