//! `blockctl run`: drive the rule chain from directives on stdin.

use anyhow::{Context, Result};
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cmd_abstraction::{CommandExecutor, RealCommandExecutor};
use crate::config::ControlConfig;
use crate::control::hostset::MODULE_NAME as HOSTSET_MODULE;
use crate::control::ipset::{IpsetSettings, MODULE_NAME as IPSET_MODULE};
use crate::control::iptables::{IptablesSettings, MODULE_NAME as IPTABLES_MODULE};
use crate::control::{
    rule_channel, ChainSettings, HostsetFileController, IptablesController, ModuleController,
    RuleChain, RuleNotifier, SetBatchController,
};
use crate::directive::Directive;
use crate::fs_abstraction::{FileSystem, RealFileSystem};
use crate::lock::LockGuard;
use crate::signal::shutdown_signal;

/// Controllers wired to one coordinator
pub struct Daemon {
    pub chain: RuleChain,
    pub ipset: Arc<SetBatchController>,
    /// `None` when `iptables.enabled` is off
    pub iptables: Option<Arc<IptablesController>>,
    pub hostset: Arc<HostsetFileController>,
    listener: JoinHandle<()>,
}

impl Daemon {
    /// Build the controllers in commit order and start the notification listener
    pub fn build(
        config: &ControlConfig,
        executor: Arc<dyn CommandExecutor>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        let (tx, rx) = rule_channel();

        let ipset = Arc::new(SetBatchController::new(
            IpsetSettings::from_config(config),
            Arc::clone(&executor),
            RuleNotifier::new(IPSET_MODULE, tx.clone()),
        ));
        let iptables = config.iptables.enabled.then(|| {
            Arc::new(IptablesController::new(
                IptablesSettings::from_config(config),
                Arc::clone(&executor),
                RuleNotifier::new(IPTABLES_MODULE, tx.clone()),
            ))
        });
        let hostset = Arc::new(HostsetFileController::from_config(
            config,
            fs,
            RuleNotifier::new(HOSTSET_MODULE, tx),
        ));

        let mut modules: Vec<Arc<dyn ModuleController>> = vec![ipset.clone() as Arc<dyn ModuleController>];
        if let Some(iptables) = &iptables {
            modules.push(iptables.clone());
        }
        modules.push(hostset.clone());

        let chain = RuleChain::new(modules, ChainSettings::from_config(config), executor);
        let listener = chain.spawn_listener(rx);

        Self {
            chain,
            ipset,
            iptables,
            hostset,
            listener,
        }
    }

    /// Apply one directive. Invalid payloads are returned to the caller.
    pub async fn handle<W: Write>(&self, directive: Directive, out: &mut W) -> Result<()> {
        match directive {
            Directive::Ipset(line) => self.ipset.add_rule(line)?,
            Directive::Iptables(rule) => match &self.iptables {
                Some(iptables) => iptables.add_rule(rule)?,
                None => warn!("iptables controller disabled, ignoring {}", rule),
            },
            Directive::Hostset {
                action,
                set,
                domain,
            } => self.hostset.add_rule(&set, action, &domain)?,
            Directive::HostsetFlush(set) => self.hostset.flush_hostset(&set)?,
            Directive::HostsetActivate { set, protocol } => {
                self.hostset.activate_hostset(&set, protocol)
            }
            Directive::State => {
                let snapshot = serde_json::to_string(&self.chain.get_state())?;
                writeln!(out, "{}", snapshot)?;
                out.flush()?;
            }
            Directive::Force => self.chain.force_flush().await,
            Directive::Discard => self.chain.flush(),
        }
        Ok(())
    }

    /// Read directives until end of input or until `shutdown` resolves.
    ///
    /// A rejected line is logged and skipped.
    pub async fn serve<R, W, F>(&self, input: R, out: &mut W, shutdown: F) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
        F: Future<Output = ()>,
    {
        let mut lines = input.lines();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read directive")? else {
                        debug!("End of directive input");
                        break;
                    };
                    match Directive::parse_line(&line) {
                        Ok(Some(directive)) => {
                            if let Err(e) = self.handle(directive, out).await {
                                warn!("Rejected '{}': {:#}", line.trim(), e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("{}", e),
                    }
                }
            }
        }
        Ok(())
    }

    /// Commit what is still queued and stop listening
    pub async fn shutdown(self) {
        self.chain.force_flush().await;
        self.listener.abort();
    }
}

/// Running as root is required unless commands go through sudo
fn check_root() -> Result<()> {
    // SAFETY: geteuid() has no preconditions and never fails.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!(
            "This operation requires root privileges. Run as root or set use_sudo: true in the config."
        )
    }
    Ok(())
}

pub async fn run(config_path: &Path) -> Result<()> {
    let config = ControlConfig::load_or_default(config_path)?;

    if !config.use_sudo {
        check_root()?;
    }
    let _lock = LockGuard::acquire(&config.lock_file)?;

    let daemon = Daemon::build(
        &config,
        Arc::new(RealCommandExecutor::new()),
        Arc::new(RealFileSystem),
    );

    daemon.chain.start_initialization().await?;
    daemon.chain.finish_initialization().await?;
    info!("Rule chain ready, reading directives from stdin");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = std::io::stdout();
    let result = daemon.serve(stdin, &mut stdout, shutdown_signal()).await;

    daemon.shutdown().await;
    info!("blockctl stopped");
    result
}
