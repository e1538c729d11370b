//! Bounded polling for domain boot and address assignment
//!
//! Two-phase wait: first for the domain to report "running", then for an
//! IPv4 address via the guest agent with a DHCP-lease fallback. Both loops
//! use a fixed interval and a hard attempt cap; exhaustion is fatal and
//! reported distinctly from command failures so the operator can tell
//! "broken" from "slow".

use std::time::Duration;

use color_eyre::Result;
use indicatif::ProgressBar;
use tracing::debug;

use crate::virsh::{DomainState, Hypervisor};

/// Fixed retry budget for a polling loop
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl WaitPolicy {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Budget for the domain to reach "running": 1s cadence, 120 attempts.
    pub const fn running() -> Self {
        Self::new(Duration::from_secs(1), 120)
    }

    /// Budget for an address to appear: 1s cadence, 60 attempts.
    pub const fn address() -> Self {
        Self::new(Duration::from_secs(1), 60)
    }

    /// Zero-delay budget for tests.
    #[cfg(test)]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(Duration::ZERO, max_attempts)
    }
}

/// A bounded wait that ran out of attempts
#[derive(Debug, thiserror::Error)]
#[error("gave up waiting for {what} after {attempts} attempts")]
pub struct WaitExhausted {
    pub what: &'static str,
    pub attempts: u32,
}

/// Poll `test_fn` until it yields a value or the policy's budget runs out.
fn poll_until<T>(
    what: &'static str,
    policy: WaitPolicy,
    mut test_fn: impl FnMut() -> Result<Option<T>>,
) -> Result<T> {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(120));
    for attempt in 1..=policy.max_attempts {
        pb.set_message(format!("Waiting for {} (attempt {})", what, attempt));
        if let Some(value) = test_fn()? {
            pb.finish_and_clear();
            debug!("{what} ready after {attempt} attempts");
            return Ok(value);
        }
        std::thread::sleep(policy.interval);
    }
    pb.finish_and_clear();
    Err(WaitExhausted {
        what,
        attempts: policy.max_attempts,
    }
    .into())
}

/// Wait until the domain reports "running".
pub fn wait_for_running(hv: &dyn Hypervisor, name: &str, policy: WaitPolicy) -> Result<()> {
    poll_until("domain to start", policy, || {
        Ok((hv.domain_state(name)? == DomainState::Running).then_some(()))
    })
}

/// Extract an IPv4 address from `virsh domifaddr --source agent` output.
///
/// Lines look like:
/// ` enp1s0   52:54:00:aa:bb:cc   ipv4   192.168.122.50/24`
pub(crate) fn parse_agent_addresses(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        if !line.to_lowercase().contains("ipv4") {
            continue;
        }
        if let Some(token) = line.split_whitespace().nth(3) {
            if let Some(ip) = token.split('/').next() {
                if !ip.is_empty() {
                    return Some(ip.to_string());
                }
            }
        }
    }
    None
}

/// Extract an IPv4 address from `virsh net-dhcp-leases default` output.
///
/// Accepts any line mentioning the VM name or an ipv4 lease and picks the
/// first dotted-quad token carrying a prefix length.
pub(crate) fn parse_lease_addresses(stdout: &str, vm_name: &str) -> Option<String> {
    for line in stdout.lines() {
        if !(line.contains(vm_name) || line.to_lowercase().contains("ipv4")) {
            continue;
        }
        for token in line.split_whitespace() {
            if token.matches('.').count() == 3 && token.contains('/') {
                if let Some(ip) = token.split('/').next() {
                    return Some(ip.to_string());
                }
            }
        }
    }
    None
}

/// Resolve the domain's IPv4 address.
///
/// Each attempt first asks the in-guest agent, then falls back to scanning
/// the default network's DHCP leases. Returns the first address found
/// without validating reachability.
pub fn resolve_ip(hv: &dyn Hypervisor, name: &str, policy: WaitPolicy) -> Result<String> {
    poll_until("an IPv4 address", policy, || {
        if let Some(out) = hv.agent_addresses(name)? {
            if let Some(ip) = parse_agent_addresses(&out) {
                return Ok(Some(ip));
            }
        }
        if let Some(out) = hv.default_net_leases()? {
            if let Some(ip) = parse_lease_addresses(&out, name) {
                return Ok(Some(ip));
            }
        }
        Ok(None)
    })
}

/// Print the SSH connection line for a resolved address.
pub fn print_ssh_command(username: &str, ip: &str) {
    println!("\n=== SSH connection ===");
    println!("ssh {}@{}", username, ip);
    println!("======================\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::Result;
    use std::cell::RefCell;

    const AGENT_OUTPUT: &str = "\
 Name       MAC address          Protocol     Address
-------------------------------------------------------------------------------
 lo         00:00:00:00:00:00    ipv4         127.0.0.1/8
 enp1s0     52:54:00:aa:bb:cc    ipv4         192.168.122.50/24
";

    const LEASE_OUTPUT: &str = "\
 Expiry Time           MAC address         Protocol   IP address          Hostname   Client ID
-----------------------------------------------------------------------------------------------
 2025-01-01 12:00:00   52:54:00:aa:bb:cc   ipv4       192.168.122.73/24   debian13   -
";

    #[test]
    fn test_parse_agent_addresses_first_ipv4_line_wins() {
        let out = AGENT_OUTPUT.lines().skip(2).collect::<Vec<_>>().join("\n");
        assert_eq!(parse_agent_addresses(&out).as_deref(), Some("127.0.0.1"));
        assert_eq!(
            parse_agent_addresses(" enp1s0  52:54:00:aa:bb:cc  ipv4  192.168.122.50/24")
                .as_deref(),
            Some("192.168.122.50")
        );
    }

    #[test]
    fn test_parse_agent_addresses_no_ipv4() {
        assert!(parse_agent_addresses("").is_none());
        assert!(parse_agent_addresses(" enp1s0  52:54  ipv6  fe80::1/64\n").is_none());
    }

    #[test]
    fn test_parse_lease_addresses_by_name() {
        assert_eq!(
            parse_lease_addresses(LEASE_OUTPUT, "debian13").as_deref(),
            Some("192.168.122.73")
        );
    }

    #[test]
    fn test_parse_lease_addresses_no_match() {
        let out = " 2025-01-01 12:00:00   52:54:00:aa:bb:cc   -   -   other   -\n";
        assert!(parse_lease_addresses(out, "debian13").is_none());
    }

    /// Hypervisor mock whose agent query never answers and whose lease
    /// table appears on a configurable attempt.
    struct FlakyLeases {
        calls: RefCell<u32>,
        ready_on: u32,
    }

    impl Hypervisor for FlakyLeases {
        fn domain_state(&self, _name: &str) -> Result<DomainState> {
            Ok(DomainState::Running)
        }
        fn destroy(&self, _name: &str) -> Result<()> {
            unreachable!()
        }
        fn undefine(&self, _name: &str) -> Result<()> {
            unreachable!()
        }
        fn agent_addresses(&self, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }
        fn default_net_leases(&self) -> Result<Option<String>> {
            let mut calls = self.calls.borrow_mut();
            *calls += 1;
            if *calls >= self.ready_on {
                Ok(Some(LEASE_OUTPUT.to_string()))
            } else {
                Ok(Some(String::new()))
            }
        }
    }

    #[test]
    fn test_resolve_ip_lease_fallback_on_fifth_attempt() {
        let hv = FlakyLeases {
            calls: RefCell::new(0),
            ready_on: 5,
        };
        let ip = resolve_ip(&hv, "debian13", WaitPolicy::immediate(60)).unwrap();
        assert_eq!(ip, "192.168.122.73");
        // Stops at the attempt that produced the address.
        assert_eq!(*hv.calls.borrow(), 5);
    }

    #[test]
    fn test_resolve_ip_exhaustion_is_distinct_error() {
        let hv = FlakyLeases {
            calls: RefCell::new(0),
            ready_on: u32::MAX,
        };
        let err = resolve_ip(&hv, "debian13", WaitPolicy::immediate(3)).unwrap_err();
        let wait_err = err.downcast_ref::<WaitExhausted>().expect("WaitExhausted");
        assert_eq!(wait_err.attempts, 3);
    }

    #[test]
    fn test_default_policies() {
        assert_eq!(WaitPolicy::running().max_attempts, 120);
        assert_eq!(WaitPolicy::address().max_attempts, 60);
        assert_eq!(WaitPolicy::running().interval, Duration::from_secs(1));
    }
}
