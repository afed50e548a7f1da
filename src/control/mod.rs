//! Rule controllers and the coordinator that commits them.
//!
//! Each backend adapter (ipset, iptables, TLS hostset files) owns a queue
//! of pending operations and implements [`ModuleController`]. Enqueueing
//! emits a [`RuleAdded`] notification through a [`RuleNotifier`]; the
//! [`RuleChain`] coordinator debounces those notifications and asks every
//! controller, in a fixed order, to commit its queue.

pub mod chain;
pub mod hostset;
pub mod ipset;
pub mod iptables;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

pub use chain::{ChainSettings, ChainSnapshot, ChainState, ModuleSnapshot, RuleChain};
pub use hostset::{HostsetAction, HostsetFileController, Protocol, TlsModule};
pub use ipset::SetBatchController;
pub use iptables::{IpFamily, IptablesController, IptablesRule, RuleOperation, Table};

/// Notification emitted on every enqueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleAdded {
    /// Name of the controller that queued the rule
    pub module: String,
    /// Opaque description of what was queued
    pub rule: String,
}

/// Receiving half of the notification channel, consumed by the coordinator
pub type RuleEvents = mpsc::UnboundedReceiver<RuleAdded>;

/// Sending half of the notification channel, held by a controller.
///
/// The channel is unbounded so that enqueueing never blocks or fails;
/// coalescing happens on the receiving end.
#[derive(Debug, Clone)]
pub struct RuleNotifier {
    module: String,
    tx: Option<mpsc::UnboundedSender<RuleAdded>>,
}

impl RuleNotifier {
    /// Create a notifier for `module` sending into `tx`
    pub fn new(module: impl Into<String>, tx: mpsc::UnboundedSender<RuleAdded>) -> Self {
        Self {
            module: module.into(),
            tx: Some(tx),
        }
    }

    /// A notifier that delivers nowhere (standalone controllers, tests)
    pub fn detached(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            tx: None,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Emit a `RuleAdded` notification for an already queued rule.
    pub fn notify(&self, rule: impl Into<String>) {
        let event = RuleAdded {
            module: self.module.clone(),
            rule: rule.into(),
        };
        if let Some(tx) = &self.tx {
            // The coordinator being gone only means nobody commits anymore
            if tx.send(event).is_err() {
                debug!("Rule notification from {} dropped, coordinator stopped", self.module);
            }
        }
    }
}

/// Create the notification channel shared by controllers and the coordinator
pub fn rule_channel() -> (mpsc::UnboundedSender<RuleAdded>, RuleEvents) {
    mpsc::unbounded_channel()
}

/// Outcome of one controller commit
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    /// Operations taken from the queue
    pub queued: usize,
    /// Operations handed to the OS and accepted
    pub applied: usize,
    /// Operations dropped before reaching the OS (stale references, inactive sets)
    pub dropped: usize,
    /// Operations the OS rejected or that were abandoned after a failure
    pub failed: usize,
}

impl CommitReport {
    pub fn is_empty(&self) -> bool {
        self.queued == 0
    }
}

impl fmt::Display for CommitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queued={} applied={} dropped={} failed={}",
            self.queued, self.applied, self.dropped, self.failed
        )
    }
}

/// Shared contract of every backend adapter driven by [`RuleChain`].
///
/// Enqueue methods are backend specific and live on the concrete types;
/// the coordinator only needs to commit, count and discard.
#[async_trait]
pub trait ModuleController: Send + Sync {
    /// Controller name used in logs and state snapshots
    fn name(&self) -> &str;

    /// Commit everything queued so far.
    ///
    /// The queue is swapped out before any I/O, so rules queued while the
    /// commit runs belong to the next cycle. Per-operation failures are
    /// absorbed into the report; `Err` means the whole commit failed.
    async fn process_rules(&self, from_initialization: bool) -> Result<CommitReport>;

    /// Number of operations waiting for the next commit
    fn queued_rule_count(&self) -> usize;

    /// Discard the queue without committing
    fn flush(&self);
}
