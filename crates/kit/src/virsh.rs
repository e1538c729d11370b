//! virsh integration
//!
//! Thin wrappers around the `virsh` domain-management tool. Every state
//! observation is a point-in-time snapshot; the hypervisor daemon owns the
//! authoritative state and may change it between calls. Destructive
//! operations therefore treat "already gone" as success.

use std::process::Command;

use color_eyre::eyre::{eyre, Result};
use tracing::debug;

use crate::command_run::{tail_utf8, CommandRunExt};

/// Snapshot of a domain's state as reported by the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    /// No domain of that name is defined
    Absent,
    /// Defined and running
    Running,
    /// Defined but not running (shut off, paused, crashed, ...)
    Stopped,
}

/// Query and lifecycle operations against the hypervisor.
///
/// Implemented by [`Virsh`] for real use and by recording mocks in tests.
pub trait Hypervisor {
    /// Snapshot of the named domain's state.
    fn domain_state(&self, name: &str) -> Result<DomainState>;

    /// Force-stop the domain. Succeeds if it is already stopped or absent.
    fn destroy(&self, name: &str) -> Result<()>;

    /// Undefine the domain, removing its storage and firmware state.
    /// Succeeds if the domain is already gone.
    fn undefine(&self, name: &str) -> Result<()>;

    /// Raw guest-agent interface address listing, or `None` when the agent
    /// is not (yet) responding.
    fn agent_addresses(&self, name: &str) -> Result<Option<String>>;

    /// Raw DHCP lease table of the default network, or `None` when it
    /// cannot be queried.
    fn default_net_leases(&self) -> Result<Option<String>>;
}

/// `virsh`-backed [`Hypervisor`] implementation
#[derive(Debug, Clone, Default)]
pub struct Virsh {
    connect: Option<String>,
}

impl Virsh {
    pub fn new(connect: Option<String>) -> Self {
        Self { connect }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("virsh");
        if let Some(uri) = &self.connect {
            cmd.arg("-c").arg(uri);
        }
        cmd
    }
}

/// Classify `virsh domstate` stdout.
pub(crate) fn parse_domstate(stdout: &str) -> DomainState {
    if stdout.trim().to_lowercase().contains("running") {
        DomainState::Running
    } else {
        DomainState::Stopped
    }
}

/// True when virsh stderr indicates the domain does not exist.
pub(crate) fn is_domain_missing(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("failed to get domain") || stderr.contains("domain not found")
}

impl Hypervisor for Virsh {
    fn domain_state(&self, name: &str) -> Result<DomainState> {
        let output = self.command().args(["domstate", name]).output()?;
        if !output.status.success() {
            let stderr = tail_utf8(&output.stderr, 1024);
            if is_domain_missing(&stderr) {
                return Ok(DomainState::Absent);
            }
            return Err(eyre!("virsh domstate {name} failed: {stderr}"));
        }
        Ok(parse_domstate(&String::from_utf8_lossy(&output.stdout)))
    }

    fn destroy(&self, name: &str) -> Result<()> {
        // Stopping an already-stopped or absent domain is not an error.
        let output = self.command().args(["destroy", name]).output()?;
        if !output.status.success() {
            debug!(
                "virsh destroy {name}: {}",
                tail_utf8(&output.stderr, 1024)
            );
        }
        Ok(())
    }

    fn undefine(&self, name: &str) -> Result<()> {
        let output = self
            .command()
            .args(["undefine", name, "--remove-all-storage", "--nvram"])
            .output()?;
        if !output.status.success() {
            let stderr = tail_utf8(&output.stderr, 1024);
            if is_domain_missing(&stderr) {
                debug!("virsh undefine {name}: domain already gone");
                return Ok(());
            }
            return Err(eyre!("virsh undefine {name} failed: {stderr}"));
        }
        Ok(())
    }

    fn agent_addresses(&self, name: &str) -> Result<Option<String>> {
        self.command()
            .args(["domifaddr", name, "--source", "agent"])
            .run_get_string_optional()
    }

    fn default_net_leases(&self) -> Result<Option<String>> {
        self.command()
            .args(["net-dhcp-leases", "default"])
            .run_get_string_optional()
    }
}
