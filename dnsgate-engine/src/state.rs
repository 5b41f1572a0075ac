//! Per-VM rule bookkeeping.
//!
//! The engine, not the backend, owns rule lifetime: a handle records the
//! opaque backend id together with the expiry the TTL dictates. Handles
//! exist only while the VM is Active, and at most one per (vm, address)
//! pair; a repeat resolution extends the existing handle instead of
//! creating a second one.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use dnsgate_core::VmId;
use dnsgate_firewall::RuleId;

/// A live firewall permission, owned exclusively by the policy engine.
#[derive(Clone, Debug)]
pub struct FirewallRuleHandle {
    pub vm_id: VmId,
    pub address: IpAddr,
    pub backend_rule_id: RuleId,
    /// Unix timestamp (seconds) past which the sweep removes the rule.
    pub expires_at: u64,
    /// In-memory refreshes since installation.
    pub refresh_count: u32,
}

/// Rule state shared between a VM's consumer task and the engine's
/// diagnostic surface. Only the consumer task mutates `rules`; the engine
/// reads snapshots.
#[derive(Default)]
pub(crate) struct VmShared {
    pub(crate) rules: Mutex<HashMap<IpAddr, FirewallRuleHandle>>,
    degraded: AtomicBool,
}

impl VmShared {
    /// Marks the VM fail-closed: no further rule installs.
    pub(crate) fn set_degraded(&self) {
        self.degraded.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Address → expiry snapshot for diagnostics, sorted by address.
    pub(crate) fn snapshot(&self) -> Vec<(IpAddr, u64)> {
        let mut entries: Vec<_> = self
            .rules
            .lock()
            .values()
            .map(|h| (h.address, h.expires_at))
            .collect();
        entries.sort();
        entries
    }
}
