//! Host network interface probing.
//!
//! The hypervisor creates each instance's TAP device when the VM starts and
//! tears it down on exit; the pool never owns a link. All we need is to
//! observe when a TAP has registered so the packet filter can be applied to
//! a device that exists.

use std::path::Path;
use std::time::Duration;

/// A bounded polling budget: at most `attempts` probes, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    /// Maximum number of probes.
    pub attempts: u32,
    /// Delay between probes.
    pub interval: Duration,
}

impl PollBudget {
    /// Creates a budget.
    #[must_use]
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

impl Default for PollBudget {
    /// 100 probes, 100 ms apart (roughly ten seconds).
    fn default() -> Self {
        Self::new(100, Duration::from_millis(100))
    }
}

/// Returns true when the named link exists.
///
/// Link presence is read from `/sys/class/net`, which is cheaper than a
/// netlink dump and needs no capabilities.
#[must_use]
pub fn interface_exists(name: &str) -> bool {
    Path::new("/sys/class/net").join(name).exists()
}

/// Waits for the named interface to appear, up to the budget.
///
/// Returns whether the interface was seen. The wait itself never fails: a VM
/// whose TAP is slow to register still gets its firewall rules, and the
/// caller proceeds either way.
pub async fn wait_for_interface(name: &str, budget: PollBudget) -> bool {
    for attempt in 0..budget.attempts {
        if interface_exists(name) {
            tracing::debug!(device = name, attempt, "interface appeared");
            return true;
        }
        tokio::time::sleep(budget.interval).await;
    }

    let seen = interface_exists(name);
    if !seen {
        tracing::warn!(device = name, "interface did not appear within budget");
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budget_is_ten_seconds() {
        let budget = PollBudget::default();
        assert_eq!(budget.attempts, 100);
        assert_eq!(budget.interval, Duration::from_millis(100));
    }

    #[test]
    fn loopback_exists() {
        assert!(interface_exists("lo"));
    }

    #[tokio::test]
    async fn wait_returns_immediately_for_existing_interface() {
        assert!(wait_for_interface("lo", PollBudget::default()).await);
    }

    #[tokio::test]
    async fn wait_gives_up_after_budget() {
        let budget = PollBudget::new(3, Duration::from_millis(1));
        assert!(!wait_for_interface("no-such-device-0", budget).await);
    }
}
