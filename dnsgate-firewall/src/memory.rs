//! In-process backend.
//!
//! Implements the full contract against a HashMap instead of kernel
//! tables. The engine test suite drives it directly (call recording,
//! failure injection, simulated kernel divergence) and the CLI exposes it
//! as `--backend memory` for dry runs.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use parking_lot::Mutex;

use dnsgate_core::VmId;

use crate::backend::{FirewallBackend, RuleId};
use crate::error::FirewallError;

/// One observed backend invocation, for test assertions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendCall {
    Install { vm_id: VmId, address: IpAddr },
    Remove { rule_id: RuleId },
    Flush { vm_id: VmId },
    Baseline { vm_id: VmId, networks: usize },
}

#[derive(Default)]
struct State {
    rules: HashMap<RuleId, (VmId, IpAddr)>,
    baselines: HashMap<VmId, Vec<IpNetwork>>,
    next_id: u64,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    calls: Mutex<Vec<BackendCall>>,
    fail_installs: AtomicBool,
    fail_removes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent installs fail, to exercise the degraded path.
    pub fn set_fail_installs(&self, fail: bool) {
        self.fail_installs.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent removes fail, to exercise background remove retry.
    pub fn set_fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Everything the engine has asked of this backend, in order.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// Addresses currently allowed for the VM, as the "kernel" sees them.
    pub fn installed_addrs(&self, vm_id: &VmId) -> Vec<IpAddr> {
        self.state
            .lock()
            .rules
            .values()
            .filter(|(vm, _)| vm == vm_id)
            .map(|(_, addr)| *addr)
            .collect()
    }

    /// Baseline networks installed for the VM.
    pub fn baseline_networks(&self, vm_id: &VmId) -> Vec<IpNetwork> {
        self.state
            .lock()
            .baselines
            .get(vm_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Plants a rule behind the engine's back (a kernel stray).
    pub fn inject_rule(&self, vm_id: &VmId, address: IpAddr) -> RuleId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = RuleId::new(format!("mem-{}", state.next_id));
        state.rules.insert(id.clone(), (vm_id.clone(), address));
        id
    }

    /// Wipes the VM's rules without telling anyone, as a backend restart
    /// would.
    pub fn clear_rules(&self, vm_id: &VmId) {
        self.state.lock().rules.retain(|_, (vm, _)| vm != vm_id);
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl FirewallBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn install_rule(&self, vm_id: &VmId, address: IpAddr) -> Result<RuleId, FirewallError> {
        self.record(BackendCall::Install {
            vm_id: vm_id.clone(),
            address,
        });
        if self.fail_installs.load(Ordering::SeqCst) {
            return Err(FirewallError::CommandFailed {
                context: format!("allowing {address} for VM '{vm_id}'"),
                stderr: "injected failure".to_string(),
            });
        }
        let mut state = self.state.lock();
        // Reuse an existing entry rather than minting a duplicate.
        if let Some((id, _)) = state
            .rules
            .iter()
            .find(|(_, (vm, addr))| vm == vm_id && *addr == address)
        {
            return Ok(id.clone());
        }
        state.next_id += 1;
        let id = RuleId::new(format!("mem-{}", state.next_id));
        state.rules.insert(id.clone(), (vm_id.clone(), address));
        Ok(id)
    }

    async fn remove_rule(&self, rule_id: &RuleId) -> Result<(), FirewallError> {
        self.record(BackendCall::Remove {
            rule_id: rule_id.clone(),
        });
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(FirewallError::CommandFailed {
                context: format!("removing rule {rule_id}"),
                stderr: "injected failure".to_string(),
            });
        }
        // Removing a vanished rule is a no-op.
        self.state.lock().rules.remove(rule_id);
        Ok(())
    }

    async fn list_active(&self, vm_id: &VmId) -> Result<Vec<(IpAddr, RuleId)>, FirewallError> {
        Ok(self
            .state
            .lock()
            .rules
            .iter()
            .filter(|(_, (vm, _))| vm == vm_id)
            .map(|(id, (_, addr))| (*addr, id.clone()))
            .collect())
    }

    async fn flush_vm(&self, vm_id: &VmId) -> Result<(), FirewallError> {
        self.record(BackendCall::Flush {
            vm_id: vm_id.clone(),
        });
        let mut state = self.state.lock();
        state.rules.retain(|_, (vm, _)| vm != vm_id);
        state.baselines.remove(vm_id);
        Ok(())
    }

    async fn install_baseline(
        &self,
        vm_id: &VmId,
        networks: &[IpNetwork],
    ) -> Result<(), FirewallError> {
        self.record(BackendCall::Baseline {
            vm_id: vm_id.clone(),
            networks: networks.len(),
        });
        self.state
            .lock()
            .baselines
            .insert(vm_id.clone(), networks.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test]
    async fn install_reuses_existing_entry() {
        let backend = MemoryBackend::new();
        let vm = VmId::from("v1");
        let a = backend.install_rule(&vm, addr(1)).await.unwrap();
        let b = backend.install_rule(&vm, addr(1)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.installed_addrs(&vm).len(), 1);
    }

    #[tokio::test]
    async fn double_remove_is_a_noop() {
        let backend = MemoryBackend::new();
        let vm = VmId::from("v1");
        let id = backend.install_rule(&vm, addr(1)).await.unwrap();
        backend.remove_rule(&id).await.unwrap();
        backend.remove_rule(&id).await.unwrap();
        assert!(backend.installed_addrs(&vm).is_empty());
    }

    #[tokio::test]
    async fn double_flush_is_a_noop() {
        let backend = MemoryBackend::new();
        let vm = VmId::from("v1");
        backend.install_rule(&vm, addr(1)).await.unwrap();
        backend.flush_vm(&vm).await.unwrap();
        backend.flush_vm(&vm).await.unwrap();
        assert!(backend.installed_addrs(&vm).is_empty());
    }

    #[tokio::test]
    async fn flush_is_scoped_to_one_vm() {
        let backend = MemoryBackend::new();
        backend.install_rule(&"v1".into(), addr(1)).await.unwrap();
        backend.install_rule(&"v2".into(), addr(2)).await.unwrap();
        backend.flush_vm(&"v1".into()).await.unwrap();
        assert!(backend.installed_addrs(&"v1".into()).is_empty());
        assert_eq!(backend.installed_addrs(&"v2".into()).len(), 1);
    }
}
