//! The per-VM consumer loop.
//!
//! Resolution intake, the expiry sweep, and reconciliation commands all
//! execute as steps of this one loop, one at a time. Backend calls are
//! awaited inline: they may stall this VM (bounded by the backend timeout)
//! but never another VM's loop.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use dnsgate_config::EngineConfig;
use dnsgate_core::{Clock, ResolutionEvent, VmId};
use dnsgate_firewall::{FirewallBackend, RuleId};
use dnsgate_telemetry::MetricsRecorder;

use crate::engine::ReconcileReport;
use crate::error::EngineError;
use crate::retry::with_backoff;
use crate::state::{FirewallRuleHandle, VmShared};

pub(crate) enum TaskCommand {
    Reconcile(oneshot::Sender<Result<ReconcileReport, EngineError>>),
}

pub(crate) struct VmTaskContext {
    pub vm_id: VmId,
    pub rx: broadcast::Receiver<ResolutionEvent>,
    pub shared: Arc<VmShared>,
    pub backend: Arc<dyn FirewallBackend>,
    pub clock: Arc<dyn Clock>,
    pub metrics: MetricsRecorder,
    pub config: EngineConfig,
    pub shutdown: watch::Receiver<bool>,
    pub commands: mpsc::Receiver<TaskCommand>,
}

pub(crate) async fn run(mut ctx: VmTaskContext) {
    let mut sweep = interval(Duration::from_secs(ctx.config.sweep_interval_secs));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Rules whose backend removal failed; retried every sweep until gone.
    // Keyed by address so a re-grant can cancel its stale removal.
    let mut pending_removals: Vec<(IpAddr, RuleId)> = Vec::new();
    let mut intake_open = true;

    debug!(vm_id = %ctx.vm_id, "policy consumer started");
    loop {
        tokio::select! {
            biased;

            _ = ctx.shutdown.changed() => break,

            Some(command) = ctx.commands.recv() => match command {
                TaskCommand::Reconcile(reply) => {
                    let report = reconcile(&ctx, &mut pending_removals).await;
                    let _ = reply.send(report);
                }
            },

            event = ctx.rx.recv(), if intake_open => match event {
                Ok(event) => handle_resolution(&ctx, event, &mut pending_removals).await,
                Err(RecvError::Lagged(n)) => {
                    ctx.metrics.events_dropped.inc_by(n);
                    warn!(vm_id = %ctx.vm_id, dropped = n,
                          "intake queue overflowed, oldest events dropped");
                }
                Err(RecvError::Closed) => {
                    // No new grants from here on; existing rules still
                    // expire on schedule.
                    warn!(vm_id = %ctx.vm_id, "resolution stream closed while active");
                    intake_open = false;
                }
            },

            _ = sweep.tick() => {
                sweep_expired(&ctx, &mut pending_removals).await;
            }
        }
    }
    debug!(vm_id = %ctx.vm_id, "policy consumer stopped");
}

/// Core install/refresh step for one resolution.
async fn handle_resolution(
    ctx: &VmTaskContext,
    event: ResolutionEvent,
    pending_removals: &mut Vec<(IpAddr, RuleId)>,
) {
    let new_expiry =
        event.observed_at + u64::from(event.ttl_seconds) + ctx.config.expiry_grace_secs;

    // Refresh is in-memory only: backend rules are not TTL-aware.
    {
        let mut rules = ctx.shared.rules.lock();
        if let Some(handle) = rules.get_mut(&event.resolved_address) {
            handle.expires_at = handle.expires_at.max(new_expiry);
            handle.refresh_count += 1;
            debug!(vm_id = %ctx.vm_id, address = %event.resolved_address,
                   expires_at = handle.expires_at, "allow rule refreshed");
            return;
        }
    }

    if ctx.shared.is_degraded() {
        warn!(vm_id = %ctx.vm_id, address = %event.resolved_address,
              "VM policy degraded, refusing to install new rule");
        return;
    }
    if !ctx.backend.supports(event.resolved_address) {
        debug!(vm_id = %ctx.vm_id, address = %event.resolved_address,
               "address family unsupported by backend, skipped");
        return;
    }

    let context = format!("installing rule for {}", event.resolved_address);
    let installed = with_backoff(&ctx.config.retry, &context, || {
        ctx.backend.install_rule(&ctx.vm_id, event.resolved_address)
    })
    .await;

    match installed {
        Ok(rule_id) => {
            // The backend may have reused the kernel entry a queued stale
            // removal still points at; cancel it or the retry would delete
            // the rule just granted.
            let before = pending_removals.len();
            pending_removals.retain(|(addr, _)| *addr != event.resolved_address);
            if pending_removals.len() < before {
                debug!(vm_id = %ctx.vm_id, address = %event.resolved_address,
                       "stale queued removal cancelled by re-grant");
            }
            ctx.metrics.rules_installed.inc();
            info!(vm_id = %ctx.vm_id, domain = %event.domain,
                  address = %event.resolved_address, ttl = event.ttl_seconds,
                  "egress allowed");
            ctx.shared.rules.lock().insert(
                event.resolved_address,
                FirewallRuleHandle {
                    vm_id: ctx.vm_id.clone(),
                    address: event.resolved_address,
                    backend_rule_id: rule_id,
                    expires_at: new_expiry,
                    refresh_count: 0,
                },
            );
        }
        Err(error) => {
            // Fail closed: stop granting, keep what exists expiring.
            ctx.metrics.backend_failures.inc();
            ctx.metrics.vms_degraded.inc();
            ctx.shared.set_degraded();
            error!(vm_id = %ctx.vm_id, %error,
                   "install retries exhausted, VM policy degraded");
        }
    }
}

/// Removes every rule whose expiry has passed, then retries earlier
/// failed removals. A rule leaves the in-memory record the moment it
/// expires; its kernel entry is retried until actually gone, since a stuck
/// allow rule is a security exposure.
async fn sweep_expired(ctx: &VmTaskContext, pending_removals: &mut Vec<(IpAddr, RuleId)>) {
    let now = ctx.clock.now();
    let expired: Vec<FirewallRuleHandle> = {
        let mut rules = ctx.shared.rules.lock();
        let addresses: Vec<_> = rules
            .iter()
            .filter(|(_, h)| h.expires_at <= now)
            .map(|(addr, _)| *addr)
            .collect();
        addresses
            .into_iter()
            .filter_map(|addr| rules.remove(&addr))
            .collect()
    };

    for handle in expired {
        info!(vm_id = %ctx.vm_id, address = %handle.address,
              refreshes = handle.refresh_count, "allow rule expired");
        ctx.metrics.rules_expired.inc();
        let context = format!("removing expired rule for {}", handle.address);
        match with_backoff(&ctx.config.retry, &context, || {
            ctx.backend.remove_rule(&handle.backend_rule_id)
        })
        .await
        {
            Ok(()) => ctx.metrics.rules_removed.inc(),
            Err(error) => {
                ctx.metrics.backend_failures.inc();
                warn!(vm_id = %ctx.vm_id, %error,
                      "expired rule removal failed, queued for background retry");
                pending_removals.push((handle.address, handle.backend_rule_id));
            }
        }
    }

    if !pending_removals.is_empty() {
        let mut still_pending = Vec::new();
        for (address, rule_id) in pending_removals.drain(..) {
            match ctx.backend.remove_rule(&rule_id).await {
                Ok(()) => ctx.metrics.rules_removed.inc(),
                Err(_) => still_pending.push((address, rule_id)),
            }
        }
        *pending_removals = still_pending;
    }
}

/// Re-aligns kernel state with the in-memory record, which is the source
/// of truth: backend strays are removed, missing rules reinstalled.
async fn reconcile(
    ctx: &VmTaskContext,
    pending_removals: &mut Vec<(IpAddr, RuleId)>,
) -> Result<ReconcileReport, EngineError> {
    let kernel = ctx.backend.list_active(&ctx.vm_id).await?;
    let mut report = ReconcileReport::default();

    let recorded: Vec<(IpAddr, RuleId)> = ctx
        .shared
        .rules
        .lock()
        .values()
        .map(|h| (h.address, h.backend_rule_id.clone()))
        .collect();

    // Kernel rules with no in-memory handle are strays.
    for (address, rule_id) in &kernel {
        if let Some((_, recorded_id)) = recorded.iter().find(|(addr, _)| addr == address) {
            report.confirmed += 1;
            // The kernel's identity wins: a restarted backend may have
            // renumbered the rule.
            if recorded_id != rule_id {
                if let Some(handle) = ctx.shared.rules.lock().get_mut(address) {
                    handle.backend_rule_id = rule_id.clone();
                }
            }
        } else {
            warn!(vm_id = %ctx.vm_id, %address, "removing stray backend rule");
            ctx.backend.remove_rule(rule_id).await?;
            report.removed += 1;
        }
    }

    // In-memory handles with no kernel rule are reinstalled under a fresh id.
    for (address, _) in recorded {
        if kernel.iter().any(|(addr, _)| *addr == address) {
            continue;
        }
        warn!(vm_id = %ctx.vm_id, %address, "reinstalling missing backend rule");
        let rule_id = ctx.backend.install_rule(&ctx.vm_id, address).await?;
        pending_removals.retain(|(addr, _)| *addr != address);
        if let Some(handle) = ctx.shared.rules.lock().get_mut(&address) {
            handle.backend_rule_id = rule_id;
        }
        report.reinstalled += 1;
    }

    if report.removed > 0 || report.reinstalled > 0 {
        warn!(vm_id = %ctx.vm_id, ?report, "backend state diverged from policy record");
    }
    Ok(report)
}
