//! Kernel TLS hostset file writer.
//!
//! The `xt_tls` (TCP) and `xt_udp_tls` (UDP) kernel modules expose one
//! pseudo-file per hostset under `<base>/<module>/hostset/<name>`. Writing
//! `+domain` adds a domain, `-domain` removes it and `/` flushes the set.
//! A file only exists while an iptables rule references the hostset, so
//! every commit re-probes the directories and skips inactive sets.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

use super::{CommitReport, ModuleController, RuleNotifier};
use crate::config::ControlConfig;
use crate::error::ControlError;
use crate::fs_abstraction::FileSystem;

pub const MODULE_NAME: &str = "tlsset";

const HOSTSET_FOLDER: &str = "hostset";

/// Payload written to flush a hostset
const FLUSH_SENTINEL: &str = "/";

/// Kernel module implementing SNI matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TlsModule {
    Tcp,
    Udp,
}

impl TlsModule {
    pub const ALL: [TlsModule; 2] = [TlsModule::Tcp, TlsModule::Udp];

    /// Kernel module name, also the directory under the base path
    pub fn kernel_name(self) -> &'static str {
        match self {
            TlsModule::Tcp => "xt_tls",
            TlsModule::Udp => "xt_udp_tls",
        }
    }

    fn protocol_name(self) -> &'static str {
        match self {
            TlsModule::Tcp => "tcp",
            TlsModule::Udp => "udp",
        }
    }

    pub fn protocol(self) -> Protocol {
        match self {
            TlsModule::Tcp => Protocol::Tcp,
            TlsModule::Udp => Protocol::Udp,
        }
    }
}

impl fmt::Display for TlsModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kernel_name())
    }
}

/// Protocol filter; `Any` matches both modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    Tcp,
    Udp,
    #[default]
    Any,
}

impl Protocol {
    fn matches(self, module: TlsModule) -> bool {
        self == Protocol::Any || self == module.protocol()
    }
}

impl FromStr for Protocol {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Protocol::Any),
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(ControlError::InvalidArgument(format!(
                "unknown protocol '{}', expected tcp or udp",
                other
            ))),
        }
    }
}

/// Membership change for one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostsetAction {
    Add,
    Remove,
}

impl HostsetAction {
    fn payload(self, domain: &str) -> String {
        match self {
            HostsetAction::Add => format!("+{}", domain),
            HostsetAction::Remove => format!("-{}", domain),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            HostsetAction::Add => "add",
            HostsetAction::Remove => "rm",
        }
    }
}

impl FromStr for HostsetAction {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(HostsetAction::Add),
            "rm" => Ok(HostsetAction::Remove),
            other => Err(ControlError::InvalidArgument(format!(
                "unknown hostset action '{}', expected add or rm",
                other
            ))),
        }
    }
}

/// Which kernel modules the platform ships
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformSupport {
    pub tcp: bool,
    pub udp: bool,
}

impl PlatformSupport {
    pub fn supports(&self, module: TlsModule) -> bool {
        match module {
            TlsModule::Tcp => self.tcp,
            TlsModule::Udp => self.udp,
        }
    }
}

/// Per module, per hostset ordered payloads
type HostsetQueue = BTreeMap<TlsModule, BTreeMap<String, Vec<String>>>;

#[derive(Debug, Default)]
struct HostsetState {
    queued: HostsetQueue,
    /// Sets found by the last directory probe
    probed: BTreeMap<TlsModule, HashSet<String>>,
    /// Sets a collaborator declared active
    declared: BTreeMap<TlsModule, HashSet<String>>,
}

impl HostsetState {
    fn is_active(&self, set: &str, module: TlsModule) -> bool {
        let contains = |m: &BTreeMap<TlsModule, HashSet<String>>| {
            m.get(&module).is_some_and(|sets| sets.contains(set))
        };
        contains(&self.probed) || contains(&self.declared)
    }

    fn queue_write(&mut self, module: TlsModule, set: &str, payload: String) {
        self.queued
            .entry(module)
            .or_default()
            .entry(set.to_string())
            .or_default()
            .push(payload);
    }
}

/// Mirrors domain membership into the kernel TLS hostset files
pub struct HostsetFileController {
    notifier: RuleNotifier,
    fs: Arc<dyn FileSystem>,
    base_path: PathBuf,
    platform: PlatformSupport,
    state: Mutex<HostsetState>,
}

impl HostsetFileController {
    pub fn new(
        base_path: impl Into<PathBuf>,
        platform: PlatformSupport,
        fs: Arc<dyn FileSystem>,
        notifier: RuleNotifier,
    ) -> Self {
        Self {
            notifier,
            fs,
            base_path: base_path.into(),
            platform,
            state: Mutex::new(HostsetState::default()),
        }
    }

    pub fn from_config(config: &ControlConfig, fs: Arc<dyn FileSystem>, notifier: RuleNotifier) -> Self {
        let platform = PlatformSupport {
            tcp: config.hostset.tcp_supported,
            udp: config.hostset.udp_supported,
        };
        Self::new(config.hostset.base_path.clone(), platform, fs, notifier)
    }

    fn state(&self) -> MutexGuard<'_, HostsetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Modules a write should go to, given the protocol filter, platform
    /// support and (when `hostset` is given) activation.
    pub fn modules_to_update(&self, protocol: Protocol, hostset: Option<&str>) -> Vec<TlsModule> {
        let state = self.state();
        TlsModule::ALL
            .into_iter()
            .filter(|m| protocol.matches(*m) && self.platform.supports(*m))
            .filter(|m| hostset.map_or(true, |set| state.is_active(set, *m)))
            .collect()
    }

    /// Modules for a `domain[,protocol:start-end]` entry.
    ///
    /// An unknown protocol matches no module.
    pub fn modules_for_domain(&self, domain: &str, hostset: &str) -> Vec<TlsModule> {
        if domain.is_empty() {
            return Vec::new();
        }
        match domain_protocol(domain) {
            Ok(protocol) => self.modules_to_update(protocol, Some(hostset)),
            Err(e) => {
                warn!("{}, domain {} matches no TLS module", e, domain);
                Vec::new()
            }
        }
    }

    /// Queue `+domain` or `-domain` for every applicable module.
    pub fn add_rule(&self, hostset: &str, action: HostsetAction, domain: &str) -> Result<(), ControlError> {
        validate_hostset_name(hostset)?;
        validate_domain(domain)?;
        debug!("Queue hostset rule: {} {} {}", hostset, action.as_str(), domain);

        let modules = self.modules_for_domain(domain, hostset);
        {
            let mut state = self.state();
            for module in modules {
                state.queue_write(module, hostset, action.payload(domain));
            }
        }

        self.notifier
            .notify(format!("{}:{}:{}", action.as_str(), hostset, domain));
        Ok(())
    }

    /// Replace whatever is queued for `hostset` with a single flush.
    pub fn flush_hostset(&self, hostset: &str) -> Result<(), ControlError> {
        validate_hostset_name(hostset)?;

        let modules = self.modules_to_update(Protocol::Any, Some(hostset));
        {
            let mut state = self.state();
            for module in modules {
                state
                    .queued
                    .entry(module)
                    .or_default()
                    .insert(hostset.to_string(), vec![FLUSH_SENTINEL.to_string()]);
            }
        }

        self.notifier.notify(format!("flush:{}", hostset));
        Ok(())
    }

    /// Record that `hostset` should be active. Does not touch the kernel.
    pub fn activate_hostset(&self, hostset: &str, protocol: Protocol) {
        let mut state = self.state();
        for module in TlsModule::ALL {
            if protocol.matches(module) {
                state.declared.entry(module).or_default().insert(hostset.to_string());
            }
        }
    }

    /// Whether `hostset` is active for `protocol` (`Any`: for either module)
    pub fn is_set_active(&self, hostset: &str, protocol: Protocol) -> bool {
        let state = self.state();
        TlsModule::ALL
            .into_iter()
            .filter(|m| protocol.matches(*m))
            .any(|m| state.is_active(hostset, m))
    }

    /// Probe the hostset directories of every supported module and replace
    /// the previous probe snapshot with what is found.
    pub async fn refresh_active_hostsets(&self) {
        for module in TlsModule::ALL {
            if !self.platform.supports(module) {
                continue;
            }
            let dir = self.base_path.join(module.kernel_name()).join(HOSTSET_FOLDER);
            let found: HashSet<String> = match self.fs.list_dir(&dir).await {
                Ok(entries) => entries.into_iter().collect(),
                Err(e) => {
                    error!("Failed to read TLS hostset folder {}: {}", dir.display(), e);
                    HashSet::new()
                }
            };
            debug!("{} active hostsets for {}", found.len(), module);
            self.state().probed.insert(module, found);
        }
    }

    fn hostset_path(&self, module: TlsModule, hostset: &str) -> PathBuf {
        self.base_path
            .join(module.kernel_name())
            .join(HOSTSET_FOLDER)
            .join(hostset)
    }
}

#[async_trait]
impl ModuleController for HostsetFileController {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    async fn process_rules(&self, _from_initialization: bool) -> Result<CommitReport> {
        if self.queued_rule_count() == 0 {
            return Ok(CommitReport::default());
        }

        // Hostset files are created by the iptables rules committed just before
        self.refresh_active_hostsets().await;

        let (queued, probed) = {
            let mut state = self.state();
            (std::mem::take(&mut state.queued), state.probed.clone())
        };

        let mut report = CommitReport {
            queued: count_queued(&queued),
            ..Default::default()
        };

        for (module, sets) in queued {
            for (set, ops) in sets {
                if ops.is_empty() {
                    continue;
                }
                let active = probed.get(&module).is_some_and(|s| s.contains(&set));
                if !active {
                    warn!("Skip inactive TLS set {} {}, {} entries", module.protocol_name(), set, ops.len());
                    report.dropped += ops.len();
                    continue;
                }

                let path = self.hostset_path(module, &set);
                debug!("Writing TLS set {} {}, {} entries", module.protocol_name(), set, ops.len());
                for op in ops {
                    match self.fs.append(&path, op.as_bytes()).await {
                        Ok(()) => report.applied += 1,
                        Err(e) => {
                            error!("Failed to write TLS hostset {} {}: {}", path.display(), op, e);
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    fn queued_rule_count(&self) -> usize {
        count_queued(&self.state().queued)
    }

    fn flush(&self) {
        self.state().queued.clear();
    }
}

fn count_queued(queue: &HostsetQueue) -> usize {
    queue.values().flat_map(|sets| sets.values()).map(Vec::len).sum()
}

/// Protocol part of `domain[,protocol:start-end]`
fn domain_protocol(domain: &str) -> Result<Protocol, ControlError> {
    match domain.split(',').nth(1) {
        Some(spec) => spec.split(':').next().unwrap_or("").parse(),
        None => Ok(Protocol::Any),
    }
}

/// Check `host[,[tcp|udp]:start-end]`.
///
/// The host part is free-form but is written as a single line.
fn validate_domain(domain: &str) -> Result<(), ControlError> {
    let invalid = || ControlError::InvalidArgument(format!("invalid domain {:?}", domain));

    let (host, spec) = match domain.split_once(',') {
        Some((host, spec)) => (host, Some(spec)),
        None => (domain, None),
    };
    if host.is_empty() || domain.contains(['\n', '\r']) {
        return Err(invalid());
    }

    if let Some(spec) = spec {
        let (protocol, ports) = spec.split_once(':').ok_or_else(invalid)?;
        protocol.parse::<Protocol>()?;
        let (start, end) = ports.split_once('-').ok_or_else(invalid)?;
        let is_number = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if !is_number(start) || !is_number(end) {
            return Err(invalid());
        }
    }
    Ok(())
}

/// A hostset name becomes a path component under the kernel directory
fn validate_hostset_name(name: &str) -> Result<(), ControlError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\0', '\n', '\r'])
    {
        return Err(ControlError::InvalidArgument(format!(
            "invalid hostset name {:?}",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::rule_channel;
    use crate::fs_abstraction::{MockFileSystem, RealFileSystem};
    use std::path::Path;
    use tempfile::TempDir;

    const BOTH: PlatformSupport = PlatformSupport { tcp: true, udp: true };

    fn controller(fs: MockFileSystem, platform: PlatformSupport) -> HostsetFileController {
        HostsetFileController::new("/proc/net", platform, Arc::new(fs), RuleNotifier::detached(MODULE_NAME))
    }

    /// Kernel-like directory tree with the given hostset files per module
    fn kernel_tree(tcp_sets: &[&str], udp_sets: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (module, sets) in [("xt_tls", tcp_sets), ("xt_udp_tls", udp_sets)] {
            let folder = dir.path().join(module).join(HOSTSET_FOLDER);
            std::fs::create_dir_all(&folder).unwrap();
            for set in sets {
                std::fs::write(folder.join(set), b"").unwrap();
            }
        }
        dir
    }

    fn read(dir: &TempDir, module: &str, set: &str) -> String {
        std::fs::read_to_string(dir.path().join(module).join(HOSTSET_FOLDER).join(set)).unwrap()
    }

    #[test]
    fn test_domain_protocol() {
        assert_eq!(domain_protocol("example.com").unwrap(), Protocol::Any);
        assert_eq!(domain_protocol("example.com,tcp:443-443").unwrap(), Protocol::Tcp);
        assert_eq!(domain_protocol("example.com,udp:443-443").unwrap(), Protocol::Udp);
        assert_eq!(domain_protocol("example.com,:80-90").unwrap(), Protocol::Any);
        assert!(domain_protocol("example.com,sctp:1-2").is_err());
    }

    #[test]
    fn test_action_from_str() {
        assert_eq!("add".parse::<HostsetAction>().unwrap(), HostsetAction::Add);
        assert_eq!("rm".parse::<HostsetAction>().unwrap(), HostsetAction::Remove);
        assert!("del".parse::<HostsetAction>().is_err());
    }

    #[test]
    fn test_validate_hostset_name() {
        assert!(validate_hostset_name("c_bd_games_tls_hostset").is_ok());
        assert!(validate_hostset_name("").is_err());
        assert!(validate_hostset_name("..").is_err());
        assert!(validate_hostset_name("../../etc/passwd").is_err());
    }

    #[test]
    fn test_modules_respect_platform_support() {
        let ctl = controller(MockFileSystem::new(), PlatformSupport { tcp: true, udp: false });
        assert_eq!(ctl.modules_to_update(Protocol::Any, None), vec![TlsModule::Tcp]);
        assert!(ctl.modules_to_update(Protocol::Udp, None).is_empty());
    }

    #[test]
    fn test_modules_for_domain_follows_activation_and_protocol() {
        let ctl = controller(MockFileSystem::new(), BOTH);
        assert!(ctl.modules_for_domain("a.com", "games").is_empty());

        ctl.activate_hostset("games", Protocol::Any);
        assert_eq!(ctl.modules_for_domain("a.com", "games"), vec![TlsModule::Tcp, TlsModule::Udp]);
        assert_eq!(ctl.modules_for_domain("a.com,udp:443-443", "games"), vec![TlsModule::Udp]);
        assert!(ctl.modules_for_domain("", "games").is_empty());
    }

    #[test]
    fn test_activation_per_protocol() {
        let ctl = controller(MockFileSystem::new(), BOTH);
        ctl.activate_hostset("video", Protocol::Tcp);
        assert!(ctl.is_set_active("video", Protocol::Tcp));
        assert!(!ctl.is_set_active("video", Protocol::Udp));
        assert!(ctl.is_set_active("video", Protocol::Any));
        assert_eq!(ctl.modules_for_domain("a.com", "video"), vec![TlsModule::Tcp]);
    }

    #[test]
    fn test_add_rule_queues_payloads_and_notifies() {
        let (tx, mut rx) = rule_channel();
        let ctl = HostsetFileController::new(
            "/proc/net",
            BOTH,
            Arc::new(MockFileSystem::new()),
            RuleNotifier::new(MODULE_NAME, tx),
        );
        ctl.activate_hostset("games", Protocol::Any);

        ctl.add_rule("games", HostsetAction::Add, "a.com").unwrap();
        ctl.add_rule("games", HostsetAction::Remove, "b.com,tcp:443-443").unwrap();

        // a.com for both modules, b.com for tcp only
        assert_eq!(ctl.queued_rule_count(), 3);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.module, "tlsset");
        assert_eq!(event.rule, "add:games:a.com");
        assert_eq!(rx.try_recv().unwrap().rule, "rm:games:b.com,tcp:443-443");
    }

    #[test]
    fn test_add_rule_for_inactive_set_still_notifies() {
        let (tx, mut rx) = rule_channel();
        let ctl = HostsetFileController::new(
            "/proc/net",
            BOTH,
            Arc::new(MockFileSystem::new()),
            RuleNotifier::new(MODULE_NAME, tx),
        );
        ctl.add_rule("unknown", HostsetAction::Add, "a.com").unwrap();
        assert_eq!(ctl.queued_rule_count(), 0);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_add_rule_rejects_bad_input() {
        let ctl = controller(MockFileSystem::new(), BOTH);
        assert!(ctl.add_rule("", HostsetAction::Add, "a.com").is_err());
        assert!(ctl.add_rule("games/../x", HostsetAction::Add, "a.com").is_err());
        assert!(ctl.add_rule("games", HostsetAction::Add, "").is_err());
        assert!(ctl.add_rule("games", HostsetAction::Add, "a.com\n+b.com").is_err());
    }

    #[test]
    fn test_validate_domain() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("example.com,tcp:443-443").is_ok());
        assert!(validate_domain("example.com,udp:1-65535").is_ok());
        assert!(validate_domain("example.com,:80-90").is_ok());

        assert!(validate_domain(",tcp:443-443").is_err());
        assert!(validate_domain("example.com,").is_err());
        assert!(validate_domain("example.com,tcp").is_err());
        assert!(validate_domain("example.com,tcp:443").is_err());
        assert!(validate_domain("example.com,tcp:-443").is_err());
        assert!(validate_domain("example.com,tcp:443-").is_err());
        assert!(validate_domain("example.com,tcp:1-2,udp:3-4").is_err());
    }

    #[test]
    fn test_malformed_domain_is_neither_queued_nor_announced() {
        let (tx, mut rx) = rule_channel();
        let ctl = HostsetFileController::new(
            "/proc/net",
            BOTH,
            Arc::new(MockFileSystem::new()),
            RuleNotifier::new(MODULE_NAME, tx),
        );
        ctl.activate_hostset("games", Protocol::Any);

        for domain in ["a.com,sctp:1-2", "a.com,tcp:abc"] {
            let err = ctl.add_rule("games", HostsetAction::Add, domain).unwrap_err();
            assert!(matches!(err, ControlError::InvalidArgument(_)), "{}: {:?}", domain, err);
        }
        assert_eq!(ctl.queued_rule_count(), 0);
        assert!(rx.try_recv().is_err());

        ctl.add_rule("games", HostsetAction::Add, "a.com,tcp:443-443").unwrap();
        assert_eq!(ctl.queued_rule_count(), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_flush_hostset_replaces_queue() {
        let ctl = controller(MockFileSystem::new(), BOTH);
        ctl.activate_hostset("games", Protocol::Any);
        ctl.add_rule("games", HostsetAction::Add, "a.com").unwrap();
        ctl.add_rule("games", HostsetAction::Add, "b.com").unwrap();
        assert_eq!(ctl.queued_rule_count(), 4);

        ctl.flush_hostset("games").unwrap();
        assert_eq!(ctl.queued_rule_count(), 2);

        let state = ctl.state();
        for module in TlsModule::ALL {
            assert_eq!(state.queued[&module]["games"], vec!["/".to_string()]);
        }
    }

    #[test]
    fn test_flush_discards_everything() {
        let ctl = controller(MockFileSystem::new(), BOTH);
        ctl.activate_hostset("games", Protocol::Any);
        ctl.add_rule("games", HostsetAction::Add, "a.com").unwrap();
        ctl.flush();
        assert_eq!(ctl.queued_rule_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_queue_writes_nothing() {
        let mut fs = MockFileSystem::new();
        fs.expect_list_dir().times(0);
        fs.expect_append().times(0);

        let report = controller(fs, BOTH).process_rules(false).await.unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_inactive_set_is_never_written() {
        let mut fs = MockFileSystem::new();
        fs.expect_list_dir()
            .withf(|p| p == Path::new("/proc/net/xt_tls/hostset"))
            .returning(|_| Ok(vec!["other".to_string()]));
        fs.expect_append().times(0);

        let ctl = controller(fs, PlatformSupport { tcp: true, udp: false });
        // Declared intent routes the write at add time
        ctl.activate_hostset("games", Protocol::Tcp);
        ctl.add_rule("games", HostsetAction::Add, "a.com").unwrap();

        let report = ctl.process_rules(false).await.unwrap();
        assert_eq!(report.queued, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.applied, 0);
    }

    #[tokio::test]
    async fn test_active_set_gets_one_append_per_payload_in_order() {
        let dir = kernel_tree(&["games"], &[]);
        let ctl = HostsetFileController::new(
            dir.path(),
            PlatformSupport { tcp: true, udp: false },
            Arc::new(RealFileSystem),
            RuleNotifier::detached(MODULE_NAME),
        );
        ctl.refresh_active_hostsets().await;

        ctl.add_rule("games", HostsetAction::Add, "a.com").unwrap();
        ctl.add_rule("games", HostsetAction::Remove, "b.com").unwrap();
        ctl.add_rule("games", HostsetAction::Add, "c.com").unwrap();

        let report = ctl.process_rules(false).await.unwrap();
        assert_eq!(report.applied, 3);
        assert_eq!(read(&dir, "xt_tls", "games"), "+a.com-b.com+c.com");
        assert_eq!(ctl.queued_rule_count(), 0);
    }

    #[tokio::test]
    async fn test_probe_replaces_previous_snapshot() {
        let dir = kernel_tree(&["games"], &[]);
        let ctl = HostsetFileController::new(
            dir.path(),
            PlatformSupport { tcp: true, udp: false },
            Arc::new(RealFileSystem),
            RuleNotifier::detached(MODULE_NAME),
        );
        ctl.refresh_active_hostsets().await;
        assert!(ctl.is_set_active("games", Protocol::Tcp));

        std::fs::remove_file(dir.path().join("xt_tls/hostset/games")).unwrap();
        ctl.refresh_active_hostsets().await;
        assert!(!ctl.is_set_active("games", Protocol::Tcp));
    }

    #[tokio::test]
    async fn test_set_active_for_one_module_only() {
        let dir = kernel_tree(&["games"], &[]);
        let ctl = HostsetFileController::new(
            dir.path(),
            BOTH,
            Arc::new(RealFileSystem),
            RuleNotifier::detached(MODULE_NAME),
        );
        ctl.activate_hostset("games", Protocol::Any);
        ctl.add_rule("games", HostsetAction::Add, "a.com").unwrap();
        assert_eq!(ctl.queued_rule_count(), 2);

        let report = ctl.process_rules(false).await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(read(&dir, "xt_tls", "games"), "+a.com");
    }

    #[tokio::test]
    async fn test_flush_sentinel_written() {
        let dir = kernel_tree(&["games"], &["games"]);
        let ctl = HostsetFileController::new(
            dir.path(),
            BOTH,
            Arc::new(RealFileSystem),
            RuleNotifier::detached(MODULE_NAME),
        );
        ctl.refresh_active_hostsets().await;
        ctl.add_rule("games", HostsetAction::Add, "a.com").unwrap();
        ctl.flush_hostset("games").unwrap();
        ctl.add_rule("games", HostsetAction::Add, "b.com").unwrap();

        ctl.process_rules(false).await.unwrap();
        assert_eq!(read(&dir, "xt_tls", "games"), "/+b.com");
        assert_eq!(read(&dir, "xt_udp_tls", "games"), "/+b.com");
    }

    #[tokio::test]
    async fn test_write_failure_does_not_abort_remaining_lines() {
        let mut fs = MockFileSystem::new();
        fs.expect_list_dir().returning(|_| Ok(vec!["games".to_string()]));
        fs.expect_append()
            .withf(|_, c| c == b"+bad.com")
            .times(1)
            .returning(|_, _| Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "rejected")));
        fs.expect_append()
            .withf(|_, c| c != b"+bad.com")
            .times(2)
            .returning(|_, _| Ok(()));

        let ctl = controller(fs, PlatformSupport { tcp: true, udp: false });
        ctl.refresh_active_hostsets().await;
        for domain in ["a.com", "bad.com", "c.com"] {
            ctl.add_rule("games", HostsetAction::Add, domain).unwrap();
        }

        let report = ctl.process_rules(false).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_missing_directory_means_no_active_sets() {
        let mut fs = MockFileSystem::new();
        fs.expect_list_dir()
            .returning(|_| Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no module")));

        let ctl = controller(fs, PlatformSupport { tcp: true, udp: false });
        ctl.refresh_active_hostsets().await;
        assert!(!ctl.is_set_active("games", Protocol::Any));
    }
}
