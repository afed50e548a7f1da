//! Set-membership batch committer (ipset).
//!
//! Queues `ipset restore` lines and applies them in size-capped batches.
//! Before every commit the current set names are listed again and lines
//! referencing sets that no longer exist are dropped, so a set destroyed
//! by another actor between enqueue and commit does not void the batch.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{CommitReport, ModuleController, RuleNotifier};
use crate::cmd_abstraction::{execute_with_timeout, privileged, CommandExecutor};
use crate::config::ControlConfig;
use crate::error::ControlError;

pub const MODULE_NAME: &str = "ipset";

/// Flags accepted between the operation and the set name
const RESTORE_FLAGS: &[&str] = &["-!", "-exist"];

/// A restore line broken into the parts the filter cares about
#[derive(Debug, Clone, PartialEq, Eq)]
struct SetLine<'a> {
    op: &'a str,
    set: &'a str,
    arg: Option<&'a str>,
}

impl<'a> SetLine<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let mut tokens = line
            .split_whitespace()
            .filter(|t| !RESTORE_FLAGS.contains(t));
        let op = tokens.next()?;
        let set = tokens.next()?;
        Some(Self {
            op,
            set,
            arg: tokens.next(),
        })
    }
}

/// Settings of the set-engine adapter
#[derive(Debug, Clone)]
pub struct IpsetSettings {
    pub binary: String,
    pub use_sudo: bool,
    pub max_batch_size: usize,
    pub max_retries: usize,
    pub list_timeout: Duration,
    /// Per submission; a stalled restore abandons the rest of its batch
    pub restore_timeout: Duration,
}

impl IpsetSettings {
    pub fn from_config(config: &ControlConfig) -> Self {
        Self {
            binary: config.ipset.binary.clone(),
            use_sudo: config.use_sudo,
            max_batch_size: config.ipset.max_batch_size.max(1),
            max_retries: config.ipset.max_retries.max(1),
            list_timeout: config.ipset_list_timeout(),
            restore_timeout: config.ipset_restore_timeout(),
        }
    }
}

impl Default for IpsetSettings {
    fn default() -> Self {
        Self::from_config(&ControlConfig::default())
    }
}

/// Accumulates set mutations and commits them through `ipset restore`
pub struct SetBatchController {
    notifier: RuleNotifier,
    executor: Arc<dyn CommandExecutor>,
    settings: IpsetSettings,
    queue: Mutex<Vec<String>>,
}

impl SetBatchController {
    pub fn new(
        settings: IpsetSettings,
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

    fn queue(&self) -> MutexGuard<'_, Vec<String>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue one restore line, e.g. `add -! blocked_ip_set 1.2.3.4`.
    pub fn add_rule(&self, line: impl Into<String>) -> Result<(), ControlError> {
        self.add_rules([line.into()])
    }

    /// Queue several restore lines with a single notification.
    ///
    /// Either every line is queued or, if one is malformed, none is.
    pub fn add_rules<I, S>(&self, lines: I) -> Result<(), ControlError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        if lines.is_empty() {
            return Err(ControlError::InvalidArgument(
                "ipset rule requires at least one line".to_string(),
            ));
        }
        for line in &lines {
            validate_line(line)?;
        }

        let payload = lines.join("\n");
        self.queue().extend(lines);
        self.notifier.notify(payload);
        Ok(())
    }

    /// Ask the set engine which sets currently exist.
    ///
    /// Errors degrade to an empty snapshot: every reference to an existing
    /// set is then dropped rather than submitted blind.
    async fn list_existing_sets(&self) -> HashSet<String> {
        let (cmd, args) = privileged(self.settings.use_sudo, &self.settings.binary, &["list", "-name"]);
        match execute_with_timeout(self.executor.as_ref(), &cmd, &args, self.settings.list_timeout).await {
            Ok(output) if output.success => {
                let names: HashSet<String> = output
                    .stdout
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect();
                debug!("Found {} existing ipset names", names.len());
                names
            }
            Ok(output) => {
                error!("Error listing current ipset names: {}", output.stderr.trim());
                HashSet::new()
            }
            Err(e) => {
                error!("Error listing current ipset names: {:#}", e);
                HashSet::new()
            }
        }
    }

    /// Submit one batch, retrying the tail after a reported failing line.
    async fn apply_batch(&self, mut batch: &[String], number: usize, total: usize, report: &mut CommitReport) {
        let (cmd, args) = privileged(self.settings.use_sudo, &self.settings.binary, &["restore", "-!"]);
        let mut retries = 0;

        while !batch.is_empty() && retries < self.settings.max_retries {
            info!(
                "Processing batch {}/{} ({} operations, retry {})",
                number,
                total,
                batch.len(),
                retries
            );
            let mut input = batch.join("\n");
            input.push('\n');
            debug!("{}", input);

            let submitted = tokio::time::timeout(
                self.settings.restore_timeout,
                self.executor.execute_with_stdin(&cmd, &args, &input),
            )
            .await;
            let output = match submitted {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    error!("Failed to run ipset restore for batch {}: {:#}", number, e);
                    report.failed += batch.len();
                    return;
                }
                Err(_) => {
                    error!(
                        "ipset restore timed out after {:?} for batch {}, skipping {} operations",
                        self.settings.restore_timeout,
                        number,
                        batch.len()
                    );
                    report.failed += batch.len();
                    return;
                }
            };

            if output.success {
                report.applied += batch.len();
                return;
            }

            match parse_error_line(&output.stderr) {
                Some(line) if line >= 1 && line <= batch.len() => {
                    error!(
                        "ipset restore failed at line {} in batch {}: {}",
                        line,
                        number,
                        batch[line - 1]
                    );
                    // The engine applies lines in order and stops at the first error
                    report.applied += line - 1;
                    report.failed += 1;
                    batch = &batch[line..];
                    retries += 1;
                }
                _ => {
                    error!(
                        "Error processing ipset operations (batch {}): {}",
                        number,
                        output.stderr.trim()
                    );
                    error!("Failed to parse error line number, skipping batch");
                    report.failed += batch.len();
                    return;
                }
            }
        }

        if !batch.is_empty() {
            error!(
                "Max retries ({}) reached for batch {}, skipping {} remaining operations",
                self.settings.max_retries,
                number,
                batch.len()
            );
            report.failed += batch.len();
        }
    }
}

#[async_trait]
impl ModuleController for SetBatchController {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    async fn process_rules(&self, _from_initialization: bool) -> Result<CommitReport> {
        // The setup script is trusted for the initial baseline, so an
        // initialization commit is handled like any other
        let ops = std::mem::take(&mut *self.queue());
        if ops.is_empty() {
            return Ok(CommitReport::default());
        }

        info!("Processing {} ipset operations via ipset restore", ops.len());
        let mut report = CommitReport {
            queued: ops.len(),
            ..Default::default()
        };

        let mut existing = self.list_existing_sets().await;
        let ops = filter_operations(ops, &mut existing);
        report.dropped = report.queued - ops.len();

        let total = ops.len().div_ceil(self.settings.max_batch_size);
        for (i, batch) in ops.chunks(self.settings.max_batch_size).enumerate() {
            self.apply_batch(batch, i + 1, total, &mut report).await;
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

/// Reject lines that would corrupt the restore script
fn validate_line(line: &str) -> Result<(), ControlError> {
    if line.trim().is_empty() {
        return Err(ControlError::InvalidArgument("empty ipset line".to_string()));
    }
    if line.contains(['\n', '\r']) {
        return Err(ControlError::InvalidArgument(format!(
            "ipset line must be a single line: {:?}",
            line
        )));
    }
    Ok(())
}

/// Drop operations that reference sets missing from `existing`.
///
/// `existing` is updated as lines are accepted, so later lines see the
/// effect of earlier `create`, `rename` and `destroy` lines of the batch.
fn filter_operations(ops: Vec<String>, existing: &mut HashSet<String>) -> Vec<String> {
    ops.into_iter()
        .filter(|line| {
            let Some(parsed) = SetLine::parse(line) else {
                warn!("Unparsable ipset line, dropping {}", line);
                return false;
            };
            match parsed.op {
                "create" => {
                    existing.insert(parsed.set.to_string());
                    true
                }
                "flush" => existing.contains(parsed.set),
                "add" | "del" => {
                    if existing.contains(parsed.set) {
                        true
                    } else {
                        warn!("{} not found, dropping {}", parsed.set, line);
                        false
                    }
                }
                "rename" => match parsed.arg {
                    Some(new_name) if existing.remove(parsed.set) => {
                        existing.insert(new_name.to_string());
                        true
                    }
                    _ => {
                        warn!("{} not found, dropping {}", parsed.set, line);
                        false
                    }
                },
                "swap" => match parsed.arg {
                    Some(other) if existing.contains(parsed.set) && existing.contains(other) => true,
                    _ => {
                        warn!(
                            "{} or {} not found, dropping {}",
                            parsed.set,
                            parsed.arg.unwrap_or("?"),
                            line
                        );
                        false
                    }
                },
                "destroy" => existing.remove(parsed.set),
                _ => {
                    warn!("Unsupported ipset operation, dropping {}", line);
                    false
                }
            }
        })
        .collect()
}

/// Extract the 1-indexed line number from `Error in line <N>:`.
///
/// e.g. "ipset v7.15: Error in line 1022: The set with the given name does not exist"
fn parse_error_line(stderr: &str) -> Option<usize> {
    const MARKER: &str = "error in line ";
    let lower = stderr.to_ascii_lowercase();
    lower.match_indices(MARKER).find_map(|(idx, _)| {
        let after = &lower[idx + MARKER.len()..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 || !after[digits..].starts_with(':') {
            return None;
        }
        after[..digits].parse().ok()
    })
}
