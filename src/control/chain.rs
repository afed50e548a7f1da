//! Rule-batching coordinator.
//!
//! `RuleChain` listens for [`RuleAdded`] notifications, debounces them and
//! then asks every controller, in list order, to commit its queue. A
//! one-time initializing mode lets the baseline setup script run before
//! any incremental rule is committed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ModuleController, RuleAdded, RuleEvents};
use crate::cmd_abstraction::{execute_with_timeout, privileged, CommandExecutor};
use crate::config::ControlConfig;
use crate::error::ControlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainState {
    Idle,
    Queuing,
    Processing,
    Initializing,
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainState::Idle => "idle",
            ChainState::Queuing => "queuing",
            ChainState::Processing => "processing",
            ChainState::Initializing => "initializing",
        };
        f.write_str(name)
    }
}

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct ChainSettings {
    /// Quiet period after the last notification before a commit
    pub debounce: Duration,
    pub use_sudo: bool,
    /// Idempotent baseline script run by `start_initialization`
    pub setup_script: PathBuf,
    pub setup_timeout: Duration,
}

impl ChainSettings {
    pub fn from_config(config: &ControlConfig) -> Self {
        Self {
            debounce: config.debounce_window(),
            use_sudo: config.use_sudo,
            setup_script: config.setup_script.clone(),
            setup_timeout: config.setup_timeout(),
        }
    }
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self::from_config(&ControlConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleSnapshot {
    pub name: String,
    pub queued_rules: usize,
}

/// Point-in-time view returned by [`RuleChain::get_state`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainSnapshot {
    pub state: ChainState,
    /// Sum over all controllers
    pub queued_rules: usize,
    pub timer_armed: bool,
    /// End of the last completed processing cycle
    pub last_cycle: Option<DateTime<Utc>>,
    pub modules: Vec<ModuleSnapshot>,
}

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Shared {
    state: ChainState,
    // Only Some while queuing
    timer: Option<Timer>,
    generation: u64,
    last_cycle: Option<DateTime<Utc>>,
}

struct Inner {
    modules: Vec<Arc<dyn ModuleController>>,
    settings: ChainSettings,
    executor: Arc<dyn CommandExecutor>,
    shared: Mutex<Shared>,
    // Serialises processing cycles and initialization
    cycle: tokio::sync::Mutex<()>,
}

/// The coordinator. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct RuleChain {
    inner: Arc<Inner>,
}

impl RuleChain {
    /// Build a coordinator over `modules`, committed in the given order.
    ///
    /// `executor` runs the setup script.
    pub fn new(
        modules: Vec<Arc<dyn ModuleController>>,
        settings: ChainSettings,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                modules,
                settings,
                executor,
                shared: Mutex::new(Shared {
                    state: ChainState::Idle,
                    timer: None,
                    generation: 0,
                    last_cycle: None,
                }),
                cycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Consume notifications until every sender is dropped
    pub fn spawn_listener(&self, mut events: RuleEvents) -> JoinHandle<()> {
        let chain = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                chain.on_rule_added(&event);
            }
            debug!("Rule notification channel closed");
        })
    }

    /// React to one notification: arm or refresh the debounce timer.
    ///
    /// Ignored while processing or initializing; rules queued meanwhile
    /// are picked up by the post-cycle queue check.
    pub fn on_rule_added(&self, event: &RuleAdded) {
        let mut shared = self.inner.shared();
        match shared.state {
            ChainState::Idle => {
                debug!("Rule added by {}, start queuing", event.module);
                shared.state = ChainState::Queuing;
                Inner::arm_timer(&self.inner, &mut shared);
            }
            ChainState::Queuing => {
                debug!("Rule added by {}, refresh timer", event.module);
                Inner::arm_timer(&self.inner, &mut shared);
            }
            ChainState::Processing | ChainState::Initializing => {
                debug!("Rule added by {} while {}, deferred", event.module, shared.state);
            }
        }
    }

    /// Enter initializing mode, run the setup script and discard queued rules.
    ///
    /// A failing or timed out script is returned as `SetupFailure`; the
    /// chain stays in initializing mode.
    pub async fn start_initialization(&self) -> Result<(), ControlError> {
        let _cycle = self.inner.cycle.lock().await;
        {
            let mut shared = self.inner.shared();
            shared.state = ChainState::Initializing;
            shared.cancel_timer();
        }

        info!("Start initializing rule chain");
        self.inner.run_setup_script().await?;

        for module in &self.inner.modules {
            module.flush();
        }
        info!("Setup script finished, queued rules discarded");
        Ok(())
    }

    /// Leave initializing mode by running one processing cycle
    pub async fn finish_initialization(&self) -> Result<(), ControlError> {
        let _cycle = self.inner.cycle.lock().await;
        let state = self.inner.shared().state;
        if state != ChainState::Initializing {
            return Err(ControlError::IllegalState(format!(
                "finish_initialization called while {}",
                state
            )));
        }

        info!("Finish initializing rule chain");
        Inner::run_cycle(&self.inner).await;
        Ok(())
    }

    /// Cancel any pending timer and commit right away
    pub async fn force_flush(&self) {
        let _cycle = self.inner.cycle.lock().await;
        info!("Forced flush of rule chain");
        Inner::run_cycle(&self.inner).await;
    }

    /// Cancel the timer and discard every controller's queue
    pub fn flush(&self) {
        let mut shared = self.inner.shared();
        shared.cancel_timer();
        for module in &self.inner.modules {
            module.flush();
        }
        if shared.state == ChainState::Queuing {
            shared.state = ChainState::Idle;
        }
        info!("Rule chain flushed, state={}", shared.state);
    }

    pub fn get_state(&self) -> ChainSnapshot {
        let shared = self.inner.shared();
        let modules: Vec<ModuleSnapshot> = self
            .inner
            .modules
            .iter()
            .map(|m| ModuleSnapshot {
                name: m.name().to_string(),
                queued_rules: m.queued_rule_count(),
            })
            .collect();

        ChainSnapshot {
            state: shared.state,
            queued_rules: modules.iter().map(|m| m.queued_rules).sum(),
            timer_armed: shared.timer.is_some(),
            last_cycle: shared.last_cycle,
            modules,
        }
    }
}

impl Shared {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re)start the debounce timer
    fn arm_timer(this: &Arc<Inner>, shared: &mut Shared) {
        shared.cancel_timer();
        shared.generation += 1;
        let generation = shared.generation;
        let window = this.settings.debounce;
        let inner = Arc::clone(this);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            Inner::on_timer(&inner, generation).await;
        });
        shared.timer = Some(Timer { generation, handle });
    }

    async fn on_timer(this: &Arc<Inner>, generation: u64) {
        let _cycle = this.cycle.lock().await;
        {
            let mut shared = this.shared();
            let current = shared.timer.as_ref().map(|t| t.generation);
            if current != Some(generation) || shared.state != ChainState::Queuing {
                debug!("Stale debounce timer {} ignored", generation);
                return;
            }
            // Detach instead of aborting, this task runs the cycle
            shared.timer = None;
        }
        debug!("Debounce window elapsed");
        Inner::run_cycle(this).await;
    }

    /// One processing cycle. Caller holds the cycle lock.
    async fn run_cycle(this: &Arc<Inner>) {
        let from_initialization = {
            let mut shared = this.shared();
            let from_initialization = shared.state == ChainState::Initializing;
            shared.cancel_timer();
            shared.state = ChainState::Processing;
            from_initialization
        };

        info!("Processing rules (from initialization: {})", from_initialization);
        for module in &this.modules {
            match module.process_rules(from_initialization).await {
                Ok(report) if report.is_empty() => {
                    debug!("{}: nothing to commit", module.name());
                }
                Ok(report) if report.failed > 0 => {
                    warn!("{} committed with failures: {}", module.name(), report);
                }
                Ok(report) => {
                    info!("{} committed: {}", module.name(), report);
                }
                Err(e) => {
                    error!("Error processing rules for {}: {:#}", module.name(), e);
                }
            }
        }

        let pending: usize = this.modules.iter().map(|m| m.queued_rule_count()).sum();
        let mut shared = this.shared();
        shared.last_cycle = Some(Utc::now());
        if pending > 0 {
            info!("{} rules queued during processing, back to queuing", pending);
            shared.state = ChainState::Queuing;
            Inner::arm_timer(this, &mut shared);
        } else {
            shared.state = ChainState::Idle;
        }
    }

    async fn run_setup_script(&self) -> Result<(), ControlError> {
        let script = self.settings.setup_script.to_string_lossy();
        let (cmd, args) = privileged(self.settings.use_sudo, &script, &[]);
        info!("Running setup script {}", script);

        let output = execute_with_timeout(
            self.executor.as_ref(),
            &cmd,
            &args,
            self.settings.setup_timeout,
        )
        .await
        .map_err(|e| ControlError::SetupFailure(format!("{:#}", e)))?;

        if !output.success {
            let reason = match output.code {
                Some(code) => format!("{} exited with {}: {}", script, code, output.stderr.trim()),
                None => format!("{} terminated by signal", script),
            };
            return Err(ControlError::SetupFailure(reason));
        }
        Ok(())
    }
}
