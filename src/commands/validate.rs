//! `blockctl validate`: check the configuration file.

use anyhow::Result;
use std::path::Path;

use crate::config::ControlConfig;

pub fn run(config_path: &Path) -> Result<()> {
    let config = ControlConfig::load(config_path)?;

    println!("Configuration OK: {}", config_path.display());
    println!("  debounce:      {:?}", config.debounce_window());
    println!(
        "  setup script:  {} (timeout {:?})",
        config.setup_script.display(),
        config.setup_timeout()
    );
    println!(
        "  ipset:         {} (batch {}, retries {})",
        config.ipset.binary, config.ipset.max_batch_size, config.ipset.max_retries
    );
    println!(
        "  iptables:      {}",
        if config.iptables.enabled { "enabled" } else { "disabled" }
    );
    println!(
        "  hostset:       {} (tcp: {}, udp: {})",
        config.hostset.base_path.display(),
        config.hostset.tcp_supported,
        config.hostset.udp_supported
    );
    Ok(())
}
