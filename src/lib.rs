//! # blockctl - coordinated firewall rule commits for Linux gateways
//!
//! Many producers queue heterogeneous firewall operations (ipset
//! membership, iptables rules, kernel TLS hostset domains); one coordinator
//! debounces them and commits every backend in a fixed order, tolerating
//! partial failure in each.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        blockctl                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap)                                                 │
//! │    └── Commands: run, validate, version                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Config (serde_yaml)                                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RuleChain (debounce timer, idle/queuing/processing/init)   │
//! │    ├── SetBatchController     ipset restore batches         │
//! │    ├── IptablesController     iptables-save/restore merge   │
//! │    └── HostsetFileController  /proc/net/xt_tls hostsets     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CommandExecutor / FileSystem (mockable OS boundary)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use blockctl::cmd_abstraction::RealCommandExecutor;
//! use blockctl::commands::run::Daemon;
//! use blockctl::config::ControlConfig;
//! use blockctl::fs_abstraction::RealFileSystem;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ControlConfig::load("/etc/blockctl/config.yaml")?;
//!     let daemon = Daemon::build(
//!         &config,
//!         Arc::new(RealCommandExecutor::new()),
//!         Arc::new(RealFileSystem),
//!     );
//!
//!     daemon.chain.start_initialization().await?;
//!     daemon.chain.finish_initialization().await?;
//!
//!     daemon.ipset.add_rule("add blocked 203.0.113.7")?;
//!     daemon.chain.force_flush().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - External command execution (mockable)
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`control`] - Rule controllers and the `RuleChain` coordinator
//! - [`directive`] - Directive language read by `blockctl run`
//! - [`error`] - Typed errors surfaced to callers
//! - [`fs_abstraction`] - Filesystem access (mockable)
//! - [`lock`] - File locking for concurrent execution prevention
//! - [`signal`] - Graceful shutdown signal handling

pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod control;
pub mod directive;
pub mod error;
pub mod fs_abstraction;
pub mod lock;
pub mod signal;

pub use cli::{Cli, Commands};
pub use config::ControlConfig;
pub use control::{ChainState, RuleChain};
pub use error::ControlError;
