//! Packet-filter rule controller (iptables).
//!
//! Queued rule operations are merged into a fresh `iptables-save` dump and
//! the resulting tables are loaded back with a single `iptables-restore`
//! per address family. If the restore is rejected, the queued rules of that
//! family are executed one by one instead.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info};

use super::{CommitReport, ModuleController, RuleNotifier};
use crate::cmd_abstraction::{execute_with_timeout, privileged, CommandExecutor};
use crate::config::ControlConfig;
use crate::error::ControlError;

pub const MODULE_NAME: &str = "iptables";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub const ALL: [IpFamily; 2] = [IpFamily::V4, IpFamily::V6];

    fn cli(self) -> &'static str {
        match self {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        }
    }

    fn save_cli(self) -> &'static str {
        match self {
            IpFamily::V4 => "iptables-save",
            IpFamily::V6 => "ip6tables-save",
        }
    }

    fn restore_cli(self) -> &'static str {
        match self {
            IpFamily::V4 => "iptables-restore",
            IpFamily::V6 => "ip6tables-restore",
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => f.write_str("v4"),
            IpFamily::V6 => f.write_str("v6"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Filter,
    Nat,
    Mangle,
    Raw,
}

impl Table {
    pub const ALL: [Table; 4] = [Table::Filter, Table::Nat, Table::Mangle, Table::Raw];

    pub fn as_str(self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Mangle => "mangle",
            Table::Raw => "raw",
        }
    }
}

impl FromStr for Table {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ControlError::InvalidArgument(format!("unsupported table '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOperation {
    /// `-N`
    NewChain,
    /// `-X`
    DeleteChain,
    /// `-F`
    FlushChain,
    /// `-A`
    Append,
    /// `-I`
    Insert,
    /// `-D`
    Delete,
}

impl RuleOperation {
    pub fn flag(self) -> &'static str {
        match self {
            RuleOperation::NewChain => "-N",
            RuleOperation::DeleteChain => "-X",
            RuleOperation::FlushChain => "-F",
            RuleOperation::Append => "-A",
            RuleOperation::Insert => "-I",
            RuleOperation::Delete => "-D",
        }
    }
}

impl FromStr for RuleOperation {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "-N" => Ok(RuleOperation::NewChain),
            "-X" => Ok(RuleOperation::DeleteChain),
            "-F" => Ok(RuleOperation::FlushChain),
            "-A" => Ok(RuleOperation::Append),
            "-I" => Ok(RuleOperation::Insert),
            "-D" => Ok(RuleOperation::Delete),
            other => Err(ControlError::InvalidArgument(format!(
                "unsupported iptables operation '{}'",
                other
            ))),
        }
    }
}

/// One queued iptables operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesRule {
    pub family: IpFamily,
    pub table: Table,
    pub operation: RuleOperation,
    pub chain: String,
    /// Match and target arguments after the chain name
    pub args: Vec<String>,
}

impl IptablesRule {
    pub fn new(operation: RuleOperation, chain: impl Into<String>) -> Self {
        Self {
            family: IpFamily::V4,
            table: Table::Filter,
            operation,
            chain: chain.into(),
            args: Vec::new(),
        }
    }

    pub fn family(mut self, family: IpFamily) -> Self {
        self.family = family;
        self
    }

    pub fn table(mut self, table: Table) -> Self {
        self.table = table;
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Chain and arguments without the operation, as stored in a dump
    pub fn essential(&self) -> String {
        if self.args.is_empty() {
            self.chain.clone()
        } else {
            format!("{} {}", self.chain, self.args.join(" "))
        }
    }
}

impl FromStr for IptablesRule {
    type Err = ControlError;

    /// Parse `[-4|-6] [-t <table>] <op> <chain> [args...]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace().peekable();
        let mut family = IpFamily::V4;
        let mut table = Table::Filter;

        loop {
            match tokens.peek().copied() {
                Some("-4") => {
                    family = IpFamily::V4;
                    tokens.next();
                }
                Some("-6") => {
                    family = IpFamily::V6;
                    tokens.next();
                }
                Some("-t") => {
                    tokens.next();
                    let name = tokens.next().ok_or_else(|| {
                        ControlError::InvalidArgument(format!("missing table name in '{}'", s))
                    })?;
                    table = name.parse()?;
                }
                _ => break,
            }
        }

        let operation: RuleOperation = tokens
            .next()
            .ok_or_else(|| ControlError::InvalidArgument(format!("missing operation in '{}'", s)))?
            .parse()?;
        let chain = tokens
            .next()
            .ok_or_else(|| ControlError::InvalidArgument(format!("missing chain in '{}'", s)))?;

        Ok(IptablesRule::new(operation, chain)
            .family(family)
            .table(table)
            .args(tokens))
    }
}

impl fmt::Display for IptablesRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "-{} -t {} {} {}",
            if self.family == IpFamily::V4 { "4" } else { "6" },
            self.table.as_str(),
            self.operation.flag(),
            self.essential()
        )
    }
}

/// Chains and ordered rules of one table.
///
/// Deleted rules become `None` so indices stay stable while merging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TableState {
    chains: BTreeMap<String, String>,
    rules: Vec<Option<String>>,
}

type Ruleset = BTreeMap<Table, TableState>;

/// Settings of the packet-filter adapter
#[derive(Debug, Clone)]
pub struct IptablesSettings {
    pub use_sudo: bool,
    pub command_timeout: Duration,
}

impl IptablesSettings {
    pub fn from_config(config: &ControlConfig) -> Self {
        Self {
            use_sudo: config.use_sudo,
            command_timeout: config.iptables_timeout(),
        }
    }
}

impl Default for IptablesSettings {
    fn default() -> Self {
        Self::from_config(&ControlConfig::default())
    }
}

pub struct IptablesController {
    notifier: RuleNotifier,
    executor: Arc<dyn CommandExecutor>,
    settings: IptablesSettings,
    queue: Mutex<Vec<IptablesRule>>,
}

impl IptablesController {
    pub fn new(
        settings: IptablesSettings,
        executor: Arc<dyn CommandExecutor>,
        notifier: RuleNotifier,
    ) -> Self {
        Self {
            notifier,
            executor,
            settings,
            queue: Mutex::new(Vec::new()),
        }
    }

    fn queue(&self) -> MutexGuard<'_, Vec<IptablesRule>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_rule(&self, rule: IptablesRule) -> Result<(), ControlError> {
        if rule.chain.is_empty() || rule.essential().contains(['\n', '\r']) {
            return Err(ControlError::InvalidArgument(format!(
                "invalid iptables rule {:?}",
                rule.essential()
            )));
        }
        let payload = rule.to_string();
        self.queue().push(rule);
        self.notifier.notify(payload);
        Ok(())
    }

    /// Dump and parse the current ruleset of `family`
    async fn dump(&self, family: IpFamily) -> Result<Ruleset> {
        debug!("Dumping current {} ruleset", family);
        let (cmd, args) = privileged(self.settings.use_sudo, family.save_cli(), &[]);
        let output = execute_with_timeout(self.executor.as_ref(), &cmd, &args, self.settings.command_timeout)
            .await
            .with_context(|| format!("Error dumping current iptables {}", family))?;
        if !output.success {
            anyhow::bail!("Error dumping current iptables {}: {}", family, output.stderr.trim());
        }
        Ok(parse_save_output(&output.stdout))
    }

    async fn restore(&self, family: IpFamily, content: &str) -> Result<()> {
        let (cmd, args) = privileged(self.settings.use_sudo, family.restore_cli(), &[]);
        debug!("{} bytes={}", cmd, content.len());
        let output = tokio::time::timeout(
            self.settings.command_timeout,
            self.executor.execute_with_stdin(&cmd, &args, content),
        )
        .await
        .with_context(|| format!("{} timed out", family.restore_cli()))??;
        if !output.success {
            anyhow::bail!("{} failed: {}", family.restore_cli(), output.stderr.trim());
        }
        Ok(())
    }

    /// Fallback when a restore is rejected: run each rule on its own
    async fn exec_individually(&self, rules: &[IptablesRule], report: &mut CommitReport) {
        for rule in rules {
            let mut args = vec!["-w", "-t", rule.table.as_str(), rule.operation.flag(), rule.chain.as_str()];
            args.extend(rule.args.iter().map(String::as_str));
            let (cmd, args) = privileged(self.settings.use_sudo, rule.family.cli(), &args);

            match execute_with_timeout(self.executor.as_ref(), &cmd, &args, self.settings.command_timeout).await {
                Ok(output) if output.success => report.applied += 1,
                Ok(output) => {
                    error!("Failed to execute individual rule {}: {}", rule, output.stderr.trim());
                    report.failed += 1;
                }
                Err(e) => {
                    error!("Failed to execute individual rule {}: {:#}", rule, e);
                    report.failed += 1;
                }
            }
        }
    }
}

#[async_trait]
impl ModuleController for IptablesController {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    async fn process_rules(&self, _from_initialization: bool) -> Result<CommitReport> {
        // New requests go to the next round
        let queued = std::mem::take(&mut *self.queue());
        if queued.is_empty() {
            return Ok(CommitReport::default());
        }

        let mut report = CommitReport {
            queued: queued.len(),
            ..Default::default()
        };

        for family in IpFamily::ALL {
            let rules: Vec<IptablesRule> = queued.iter().filter(|r| r.family == family).cloned().collect();
            if rules.is_empty() {
                continue;
            }

            let mut ruleset = self.dump(family).await?;
            let mut changed = false;
            for table in Table::ALL {
                let state = ruleset.entry(table).or_default();
                let table_rules: Vec<&IptablesRule> = rules.iter().filter(|r| r.table == table).collect();
                changed |= merge_queued(state, &table_rules);
            }

            if !changed {
                debug!("No changes for {}, skipping iptables restore", family);
                report.applied += rules.len();
                continue;
            }

            info!("Restoring iptables {} queue={}", family, rules.len());
            match self.restore(family, &render_restore(&ruleset)).await {
                Ok(()) => {
                    info!("iptables {} restored successfully", family);
                    report.applied += rules.len();
                }
                Err(e) => {
                    error!("Error restoring iptables {}: {:#}, executing queued commands individually", family, e);
                    self.exec_individually(&rules, &mut report).await;
                }
            }
        }

        Ok(report)
    }

    fn queued_rule_count(&self) -> usize {
        self.queue().len()
    }

    fn flush(&self) {
        self.queue().clear();
    }
}

/// Parse `iptables-save` output into per-table chains and rules.
///
/// Tables other than filter/nat/mangle/raw are skipped.
fn parse_save_output(output: &str) -> Ruleset {
    let mut ruleset = Ruleset::new();
    let mut current: Option<Table> = None;

    for line in output.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix('*') {
            current = match name.parse::<Table>() {
                Ok(table) => {
                    ruleset.insert(table, TableState::default());
                    Some(table)
                }
                Err(_) => {
                    debug!("Skipping unsupported table: {}", name);
                    None
                }
            };
            continue;
        }

        if line == "COMMIT" {
            current = None;
            continue;
        }

        let Some(state) = current.and_then(|t| ruleset.get_mut(&t)) else {
            continue;
        };

        if let Some(rest) = line.strip_prefix(':') {
            // ":CHAIN POLICY [pkts:bytes]"
            let name = rest.split(' ').next().unwrap_or(rest);
            state.chains.insert(name.to_string(), line.to_string());
        } else if let Some(name) = line.strip_prefix("-N ") {
            state.chains.insert(name.to_string(), format!(":{} - [0:0]", name));
        } else if let Some(essential) = line.strip_prefix("-A ") {
            state.rules.push(Some(essential.to_string()));
        } else if let Some(essential) = line.strip_prefix("-I ") {
            state.rules.insert(0, Some(essential.to_string()));
        }
    }

    ruleset
}

/// Apply queued operations to a table dump. Returns whether anything changed.
fn merge_queued(state: &mut TableState, queued: &[&IptablesRule]) -> bool {
    let mut changed = false;

    for rule in queued {
        let essential = rule.essential();
        debug!("Merging queued rule: {} {}", rule.operation.flag(), essential);

        match rule.operation {
            RuleOperation::NewChain => {
                if !state.chains.contains_key(&rule.chain) {
                    state
                        .chains
                        .insert(rule.chain.clone(), format!(":{} - [0:0]", rule.chain));
                    changed = true;
                }
            }
            RuleOperation::DeleteChain | RuleOperation::FlushChain => {
                if !state.chains.contains_key(&rule.chain) {
                    continue;
                }
                let prefix = format!("{} ", rule.chain);
                for slot in state.rules.iter_mut() {
                    let in_chain = slot
                        .as_deref()
                        .is_some_and(|r| r == rule.chain || r.starts_with(&prefix));
                    if in_chain {
                        *slot = None;
                        changed = true;
                    }
                }
                if rule.operation == RuleOperation::DeleteChain {
                    state.chains.remove(&rule.chain);
                    changed = true;
                }
            }
            RuleOperation::Append | RuleOperation::Insert => {
                if state.rules.iter().flatten().any(|r| *r == essential) {
                    continue;
                }
                if rule.operation == RuleOperation::Insert {
                    state.rules.insert(0, Some(essential));
                } else {
                    state.rules.push(Some(essential));
                }
                changed = true;
            }
            RuleOperation::Delete => {
                if let Some(slot) = state
                    .rules
                    .iter_mut()
                    .find(|slot| slot.as_deref() == Some(essential.as_str()))
                {
                    *slot = None;
                    changed = true;
                }
            }
        }
    }

    changed
}

/// Render a ruleset in `iptables-restore` format
fn render_restore(ruleset: &Ruleset) -> String {
    let mut lines = Vec::new();
    for table in Table::ALL {
        let Some(state) = ruleset.get(&table) else {
            continue;
        };
        let mut table_lines: Vec<String> = state.chains.values().cloned().collect();
        table_lines.extend(state.rules.iter().flatten().map(|r| format!("-A {}", r)));
        if table_lines.is_empty() {
            continue;
        }
        lines.push(format!("*{}", table.as_str()));
        lines.extend(table_lines);
        lines.push("COMMIT".to_string());
    }
    let mut content = lines.join("\n");
    content.push('\n');
    content
}
