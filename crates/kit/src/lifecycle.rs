//! Session-driven lifecycle reconciliation
//!
//! Given a persisted session, decide what to do with the domain it names:
//! show its address, rebuild it, or stop. The decision table keys on a
//! single point-in-time state snapshot taken at the start; deletion never
//! re-queries state, it just issues tolerant teardown commands.

use color_eyre::eyre::{eyre, Context, Result};
use tracing::debug;

use crate::config::Config;
use crate::prompt::Prompt;
use crate::session::Session;
use crate::virsh::{DomainState, Hypervisor};
use crate::wait::{self, WaitPolicy};

/// Outcome of reconciling an existing session against the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The domain must be (re)provisioned from scratch
    Provision,
    /// Nothing left to do this run
    Done,
}

/// Tear down the domain and its on-disk artifacts.
///
/// Destroy and undefine tolerate a missing or stopped domain, so this is
/// safe to call from any observed state without re-querying.
pub fn delete_domain(hv: &dyn Hypervisor, cfg: &Config, vm_name: &str) -> Result<()> {
    hv.destroy(vm_name)?;
    hv.undefine(vm_name)?;

    let overlay = cfg.overlay_path(vm_name);
    if overlay.is_file() {
        std::fs::remove_file(&overlay).with_context(|| format!("Failed to remove {overlay}"))?;
        println!("Removed overlay image {overlay}.");
    }
    let seed = cfg.seed_iso_path(vm_name);
    if seed.is_file() {
        std::fs::remove_file(&seed).with_context(|| format!("Failed to remove {seed}"))?;
        println!("Removed seed ISO {seed}.");
    }
    Ok(())
}

fn offer_rebuild(
    hv: &dyn Hypervisor,
    prompt: &mut dyn Prompt,
    cfg: &Config,
    vm_name: &str,
) -> Result<bool> {
    if prompt.confirm(&format!("Delete and rebuild VM '{vm_name}'?"), false)? {
        delete_domain(hv, cfg, vm_name)?;
        return Ok(true);
    }
    Ok(false)
}

/// Reconcile a persisted session against the domain's current state.
///
/// Running domains get their address offered first; a declined or failed
/// lookup degrades to the rebuild offer. A stopped domain whose rebuild is
/// declined is a dead end: the tool will not start foreign-configured
/// domains, so there is nothing useful left to do.
pub fn reconcile(
    hv: &dyn Hypervisor,
    prompt: &mut dyn Prompt,
    cfg: &Config,
    session: &Session,
    address_policy: WaitPolicy,
) -> Result<Reconciled> {
    let vm_name = &session.vm_name;
    match hv.domain_state(vm_name)? {
        DomainState::Absent => {
            println!("VM '{vm_name}' is not defined, provisioning it.");
            Ok(Reconciled::Provision)
        }
        DomainState::Running => {
            println!("VM '{vm_name}' is already running.");
            if prompt.confirm("Show its IP address?", true)? {
                match wait::resolve_ip(hv, vm_name, address_policy) {
                    Ok(ip) => {
                        wait::print_ssh_command(&session.username, &ip);
                        return Ok(Reconciled::Done);
                    }
                    Err(err) => {
                        debug!("address lookup failed: {err:#}");
                        println!("Could not resolve an IP address for '{vm_name}'.");
                    }
                }
            }
            if offer_rebuild(hv, prompt, cfg, vm_name)? {
                Ok(Reconciled::Provision)
            } else {
                println!("Leaving VM '{vm_name}' as it is.");
                Ok(Reconciled::Done)
            }
        }
        DomainState::Stopped => {
            println!("VM '{vm_name}' exists but is not running.");
            if offer_rebuild(hv, prompt, cfg, vm_name)? {
                Ok(Reconciled::Provision)
            } else {
                Err(eyre!(
                    "VM '{vm_name}' is stopped and was not rebuilt; start or remove it manually"
                ))
            }
        }
    }
}
