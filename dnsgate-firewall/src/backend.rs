//! The backend contract the policy engine programs against.

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use ipnetwork::IpNetwork;

use dnsgate_core::VmId;

use crate::error::FirewallError;

/// Opaque, backend-private rule identity.
///
/// The engine stores and returns these tokens verbatim; only the backend
/// that minted an id can interpret it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RuleId(String);

impl RuleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kernel-facing firewall mutations, namespaced per VM.
///
/// Backends are stateless apart from the kernel tables themselves: rule
/// expiry is tracked exclusively by the policy engine. All operations are
/// idempotent; calls may block on kernel tooling and are bounded by the
/// backend's configured timeout.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Whether this backend can express rules for the address family.
    fn supports(&self, _address: IpAddr) -> bool {
        true
    }

    /// Installs an egress allow rule for `address` in the VM's rule group.
    ///
    /// The engine never calls this twice for a live `(vm, address)` pair;
    /// a backend finding an existing kernel entry reuses it rather than
    /// creating a duplicate.
    async fn install_rule(&self, vm_id: &VmId, address: IpAddr) -> Result<RuleId, FirewallError>;

    /// Removes a previously installed rule. Removing an id that no longer
    /// exists is a no-op.
    async fn remove_rule(&self, rule_id: &RuleId) -> Result<(), FirewallError>;

    /// Lists the VM's currently installed dynamic rules, as the kernel
    /// sees them. Baseline rules are not reported.
    async fn list_active(&self, vm_id: &VmId) -> Result<Vec<(IpAddr, RuleId)>, FirewallError>;

    /// Bulk-removes everything in the VM's rule group, baseline included.
    /// Flushing a VM with no rules is a no-op.
    async fn flush_vm(&self, vm_id: &VmId) -> Result<(), FirewallError>;

    /// Installs the profile's lifetime CIDR rules for the VM. These are
    /// not TTL-swept and are only removed by [`Self::flush_vm`].
    async fn install_baseline(
        &self,
        vm_id: &VmId,
        networks: &[IpNetwork],
    ) -> Result<(), FirewallError>;
}
