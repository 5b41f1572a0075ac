//! The policy engine's control surface.
//!
//! The VM Lifecycle Manager drives a VM through
//! `arm → activate → drain`; each call returns only once the transition
//! and its mandatory side effects (subscription setup, baseline install,
//! flush) are complete. Consumer tasks do the per-resolution work; this
//! type owns the per-VM entries and the legality of transitions.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use dnsgate_config::{EngineConfig, VmPolicy};
use dnsgate_core::{Clock, EventsHub, LifecycleEvent, LifecyclePhase, ResolutionEvent, VmId};
use dnsgate_firewall::FirewallBackend;
use dnsgate_telemetry::MetricsRecorder;

use crate::error::EngineError;
use crate::retry::with_backoff;
use crate::state::VmShared;
use crate::task::{self, TaskCommand, VmTaskContext};

/// Outcome of one reconciliation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Kernel rules matching an in-memory handle.
    pub confirmed: usize,
    /// Kernel strays removed (no in-memory handle).
    pub removed: usize,
    /// In-memory handles reinstalled (no kernel rule).
    pub reinstalled: usize,
}

enum VmEntry {
    Armed {
        policy: Arc<VmPolicy>,
        rx: broadcast::Receiver<ResolutionEvent>,
    },
    Active {
        shared: Arc<VmShared>,
        shutdown: watch::Sender<bool>,
        commands: mpsc::Sender<TaskCommand>,
        join: JoinHandle<()>,
    },
    /// Flush failed mid-drain; the record survives so a later drain can
    /// finish the job.
    Draining,
}

impl VmEntry {
    fn phase(&self) -> LifecyclePhase {
        match self {
            VmEntry::Armed { .. } => LifecyclePhase::Armed,
            VmEntry::Active { .. } => LifecyclePhase::Active,
            VmEntry::Draining => LifecyclePhase::Draining,
        }
    }
}

/// The Network Policy Engine.
pub struct PolicyEngine {
    backend: Arc<dyn FirewallBackend>,
    hub: Arc<EventsHub>,
    clock: Arc<dyn Clock>,
    metrics: MetricsRecorder,
    config: EngineConfig,
    vms: tokio::sync::Mutex<HashMap<VmId, VmEntry>>,
}

impl PolicyEngine {
    pub fn new(
        backend: Arc<dyn FirewallBackend>,
        hub: Arc<EventsHub>,
        clock: Arc<dyn Clock>,
        metrics: MetricsRecorder,
        config: EngineConfig,
    ) -> Self {
        info!(backend = backend.name(), sweep = config.sweep_interval_secs,
              "policy engine initialized");
        Self {
            backend,
            hub,
            clock,
            metrics,
            config,
            vms: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Loads the VM's allow-list and subscribes to its resolution stream.
    /// No firewall rules are installed yet.
    #[instrument(skip(self, policy), fields(vm_id = %vm_id))]
    pub async fn arm(&self, vm_id: VmId, policy: Arc<VmPolicy>) -> Result<(), EngineError> {
        if policy.is_empty() {
            return Err(EngineError::EmptyPolicy(vm_id));
        }
        let mut vms = self.vms.lock().await;
        if let Some(entry) = vms.get(&vm_id) {
            return Err(EngineError::InvalidTransition {
                vm_id,
                phase: entry.phase(),
                action: "arm",
            });
        }
        let rx = self.hub.subscribe(&vm_id);
        vms.insert(vm_id.clone(), VmEntry::Armed { policy, rx });
        self.publish_phase(vm_id, LifecyclePhase::Armed);
        Ok(())
    }

    /// Starts consuming resolution events for an armed VM.
    ///
    /// Side effects before the consumer starts: kernel strays from any
    /// previous life of this VM id are removed (the in-memory record,
    /// empty at this point, is authoritative) and the profile's baseline
    /// CIDR rules are installed.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn activate(&self, vm_id: &VmId) -> Result<(), EngineError> {
        let mut vms = self.vms.lock().await;
        let (policy, rx) = match vms.remove(vm_id) {
            Some(VmEntry::Armed { policy, rx }) => (policy, rx),
            Some(other) => {
                let phase = other.phase();
                vms.insert(vm_id.clone(), other);
                return Err(EngineError::InvalidTransition {
                    vm_id: vm_id.clone(),
                    phase,
                    action: "activate",
                });
            }
            None => return Err(EngineError::UnknownVm(vm_id.clone())),
        };

        match self.prepare_backend(vm_id, &policy).await {
            Ok(()) => {}
            Err(error) => {
                // Not transitioned: the VM stays armed and the failure
                // surfaces to the lifecycle manager.
                vms.insert(vm_id.clone(), VmEntry::Armed { policy, rx });
                return Err(error);
            }
        }

        let shared = Arc::new(VmShared::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::channel(8);
        let join = tokio::spawn(task::run(VmTaskContext {
            vm_id: vm_id.clone(),
            rx,
            shared: Arc::clone(&shared),
            backend: Arc::clone(&self.backend),
            clock: Arc::clone(&self.clock),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
            shutdown: shutdown_rx,
            commands: command_rx,
        }));
        vms.insert(
            vm_id.clone(),
            VmEntry::Active {
                shared,
                shutdown: shutdown_tx,
                commands: command_tx,
                join,
            },
        );
        self.publish_phase(vm_id.clone(), LifecyclePhase::Active);
        Ok(())
    }

    /// Stops intake and the sweep, flushes every remaining rule, and
    /// deletes the VM's record. Idempotent: draining an unknown or
    /// already-drained VM is a no-op, and a repeat signal (stop followed
    /// by destroy) cannot double-flush into an error.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn drain(&self, vm_id: &VmId) -> Result<(), EngineError> {
        let mut vms = self.vms.lock().await;
        match vms.remove(vm_id) {
            None => Ok(()),
            Some(VmEntry::Armed { .. }) => {
                self.hub.remove_vm(vm_id);
                self.flush_or_park(&mut vms, vm_id).await
            }
            Some(VmEntry::Draining) => self.flush_or_park(&mut vms, vm_id).await,
            Some(VmEntry::Active {
                shared,
                shutdown,
                commands,
                join,
            }) => {
                self.publish_phase(vm_id.clone(), LifecyclePhase::Draining);

                // Cancel intake and sweep before any flush begins, so no
                // rule can be installed after this point.
                let _ = shutdown.send(true);
                drop(commands);
                if let Err(error) = join.await {
                    warn!(vm_id = %vm_id, %error, "consumer task ended abnormally");
                }
                self.hub.remove_vm(vm_id);

                let remaining = shared.snapshot().len() as u64;
                let result = self.flush_or_park(&mut vms, vm_id).await;
                if result.is_ok() {
                    self.metrics.rules_removed.inc_by(remaining);
                }
                result
            }
        }
    }

    /// Immediate drain, for the operational surface.
    pub async fn purge(&self, vm_id: &VmId) -> Result<(), EngineError> {
        info!(vm_id = %vm_id, "forced purge requested");
        self.drain(vm_id).await
    }

    /// Current address → expiry mapping, for diagnostics.
    pub async fn list_active_rules(&self, vm_id: &VmId) -> Result<Vec<(IpAddr, u64)>, EngineError> {
        let vms = self.vms.lock().await;
        match vms.get(vm_id) {
            None => Err(EngineError::UnknownVm(vm_id.clone())),
            Some(VmEntry::Active { shared, .. }) => Ok(shared.snapshot()),
            Some(_) => Ok(Vec::new()),
        }
    }

    /// The VM's current lifecycle phase; unknown VMs are Inactive.
    pub async fn phase(&self, vm_id: &VmId) -> LifecyclePhase {
        self.vms
            .lock()
            .await
            .get(vm_id)
            .map(VmEntry::phase)
            .unwrap_or(LifecyclePhase::Inactive)
    }

    /// Whether the VM's policy has failed closed.
    pub async fn is_degraded(&self, vm_id: &VmId) -> bool {
        match self.vms.lock().await.get(vm_id) {
            Some(VmEntry::Active { shared, .. }) => shared.is_degraded(),
            _ => false,
        }
    }

    /// Re-aligns the VM's kernel rules with the in-memory record, e.g.
    /// after a backend restart. Runs inside the VM's serial consumer loop.
    pub async fn reconcile(&self, vm_id: &VmId) -> Result<ReconcileReport, EngineError> {
        let commands = {
            let vms = self.vms.lock().await;
            match vms.get(vm_id) {
                Some(VmEntry::Active { commands, .. }) => commands.clone(),
                Some(entry) => {
                    return Err(EngineError::InvalidTransition {
                        vm_id: vm_id.clone(),
                        phase: entry.phase(),
                        action: "reconcile",
                    })
                }
                None => return Err(EngineError::UnknownVm(vm_id.clone())),
            }
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(TaskCommand::Reconcile(reply_tx))
            .await
            .map_err(|_| EngineError::UnknownVm(vm_id.clone()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::UnknownVm(vm_id.clone()))?
    }

    /// Stray removal plus baseline install, before the consumer starts.
    async fn prepare_backend(&self, vm_id: &VmId, policy: &VmPolicy) -> Result<(), EngineError> {
        let strays = self.backend.list_active(vm_id).await?;
        if !strays.is_empty() {
            warn!(vm_id = %vm_id, count = strays.len(),
                  "removing leftover backend rules from a previous life");
            for (_, rule_id) in strays {
                self.backend.remove_rule(&rule_id).await?;
            }
        }
        self.backend
            .install_baseline(vm_id, policy.networks())
            .await?;
        Ok(())
    }

    /// Flushes the VM's rule group; on persistent failure the record is
    /// parked as Draining so a later drain retries instead of leaking
    /// kernel rules.
    async fn flush_or_park(
        &self,
        vms: &mut HashMap<VmId, VmEntry>,
        vm_id: &VmId,
    ) -> Result<(), EngineError> {
        let flushed = with_backoff(&self.config.retry, "flushing VM rule group", || {
            self.backend.flush_vm(vm_id)
        })
        .await;
        match flushed {
            Ok(()) => {
                self.publish_phase(vm_id.clone(), LifecyclePhase::Inactive);
                info!(vm_id = %vm_id, "VM policy drained");
                Ok(())
            }
            Err(error) => {
                self.metrics.backend_failures.inc();
                vms.insert(vm_id.clone(), VmEntry::Draining);
                Err(error.into())
            }
        }
    }

    fn publish_phase(&self, vm_id: VmId, phase: LifecyclePhase) {
        self.hub.publish_lifecycle(LifecycleEvent {
            vm_id,
            phase,
            at: self.clock.now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use dnsgate_config::{PolicyStore, ProfileConfig};
    use dnsgate_core::VirtualClock;
    use dnsgate_firewall::MemoryBackend;

    use super::*;

    fn test_policy(domains: &[&str], networks: &[&str]) -> Arc<VmPolicy> {
        let mut profiles = HashMap::new();
        profiles.insert(
            "p".to_string(),
            ProfileConfig {
                domains: domains.iter().map(|d| d.to_string()).collect(),
                networks: networks.iter().map(|n| n.parse().unwrap()).collect(),
            },
        );
        PolicyStore::from_profiles(&profiles)
            .unwrap()
            .policy_for("p")
            .unwrap()
    }

    fn engine_with(backend: Arc<MemoryBackend>) -> PolicyEngine {
        PolicyEngine::new(
            backend,
            Arc::new(EventsHub::new(64).unwrap()),
            Arc::new(VirtualClock::new(1_000)),
            MetricsRecorder::new(),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn arm_rejects_an_empty_policy() {
        let engine = engine_with(Arc::new(MemoryBackend::new()));
        assert!(matches!(
            engine.arm("v1".into(), test_policy(&[], &[])).await,
            Err(EngineError::EmptyPolicy(_))
        ));
    }

    #[tokio::test]
    async fn arm_twice_is_rejected() {
        let engine = engine_with(Arc::new(MemoryBackend::new()));
        let policy = test_policy(&["example.com"], &[]);
        engine.arm("v1".into(), Arc::clone(&policy)).await.unwrap();
        assert!(matches!(
            engine.arm("v1".into(), policy).await,
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn activate_requires_armed() {
        let engine = engine_with(Arc::new(MemoryBackend::new()));
        assert!(matches!(
            engine.activate(&"ghost".into()).await,
            Err(EngineError::UnknownVm(_))
        ));

        let policy = test_policy(&["example.com"], &[]);
        engine.arm("v1".into(), policy).await.unwrap();
        engine.activate(&"v1".into()).await.unwrap();
        assert!(matches!(
            engine.activate(&"v1".into()).await,
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn activate_installs_baseline_networks() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine_with(Arc::clone(&backend));
        let policy = test_policy(&["example.com"], &["192.168.10.0/24"]);
        engine.arm("v1".into(), policy).await.unwrap();
        engine.activate(&"v1".into()).await.unwrap();
        assert_eq!(backend.baseline_networks(&"v1".into()).len(), 1);
        assert_eq!(engine.phase(&"v1".into()).await, LifecyclePhase::Active);
    }

    #[tokio::test]
    async fn activate_removes_strays_from_a_previous_life() {
        let backend = Arc::new(MemoryBackend::new());
        backend.inject_rule(&"v1".into(), "10.0.0.9".parse().unwrap());
        let engine = engine_with(Arc::clone(&backend));
        engine
            .arm("v1".into(), test_policy(&["example.com"], &[]))
            .await
            .unwrap();
        engine.activate(&"v1".into()).await.unwrap();
        assert!(backend.installed_addrs(&"v1".into()).is_empty());
    }

    #[tokio::test]
    async fn drain_is_idempotent() {
        let engine = engine_with(Arc::new(MemoryBackend::new()));
        engine.drain(&"never-existed".into()).await.unwrap();

        engine
            .arm("v1".into(), test_policy(&["example.com"], &[]))
            .await
            .unwrap();
        engine.activate(&"v1".into()).await.unwrap();
        engine.drain(&"v1".into()).await.unwrap();
        engine.drain(&"v1".into()).await.unwrap();
        assert_eq!(engine.phase(&"v1".into()).await, LifecyclePhase::Inactive);
    }

    #[tokio::test]
    async fn armed_vm_reports_no_rules() {
        let engine = engine_with(Arc::new(MemoryBackend::new()));
        engine
            .arm("v1".into(), test_policy(&["example.com"], &[]))
            .await
            .unwrap();
        assert!(engine.list_active_rules(&"v1".into()).await.unwrap().is_empty());
        assert!(matches!(
            engine.list_active_rules(&"ghost".into()).await,
            Err(EngineError::UnknownVm(_))
        ));
    }
}
