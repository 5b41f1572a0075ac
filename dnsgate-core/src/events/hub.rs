//! Per-VM ordered event delivery.
//!
//! One bounded broadcast channel per VM: events for the same VM reach every
//! subscriber in publish order; there is no ordering across VMs. When a
//! subscriber's queue overflows, the oldest unconsumed event is dropped and
//! the receiver observes the lag. A dropped resolution only delays access;
//! it never wrongly grants it.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use super::{LifecycleEvent, ResolutionEvent};
use crate::vm::VmId;

/// Events hub error conditions.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Invalid hub capacity (must be non-zero)")]
    InvalidCapacity,
}

/// Process-wide publish/subscribe hub for resolution and lifecycle events.
pub struct EventsHub {
    capacity: usize,
    channels: RwLock<HashMap<VmId, broadcast::Sender<ResolutionEvent>>>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

impl EventsHub {
    /// Creates a hub whose per-VM queues hold at most `capacity` events.
    pub fn new(capacity: usize) -> Result<Self, HubError> {
        if capacity == 0 {
            return Err(HubError::InvalidCapacity);
        }
        let (lifecycle, _) = broadcast::channel(capacity);
        Ok(Self {
            capacity,
            channels: RwLock::new(HashMap::new()),
            lifecycle,
        })
    }

    /// Publishes a resolution event to the VM's subscribers.
    ///
    /// Never blocks the producer. Returns the number of subscribers reached;
    /// an event published for a VM with no subscription is dropped (the rule
    /// is simply not installed until a later resolution).
    pub fn publish(&self, event: ResolutionEvent) -> usize {
        let channels = self.channels.read();
        match channels.get(&event.vm_id) {
            Some(tx) => tx.send(event).unwrap_or(0),
            None => {
                debug!(vm_id = %event.vm_id, domain = %event.domain,
                       "resolution event with no subscriber, dropped");
                0
            }
        }
    }

    /// Subscribes to the VM's resolution event stream.
    ///
    /// Events published after this call are delivered in publish order.
    pub fn subscribe(&self, vm_id: &VmId) -> broadcast::Receiver<ResolutionEvent> {
        let mut channels = self.channels.write();
        channels
            .entry(vm_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Tears down the VM's channel; outstanding receivers observe a close.
    pub fn remove_vm(&self, vm_id: &VmId) {
        self.channels.write().remove(vm_id);
    }

    /// Publishes a lifecycle transition to all lifecycle observers.
    pub fn publish_lifecycle(&self, event: LifecycleEvent) {
        // No observers is normal, not an error.
        let _ = self.lifecycle.send(event);
    }

    /// Subscribes to lifecycle transitions of every VM.
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::sync::broadcast::error::TryRecvError;

    use super::*;

    fn event(vm: &str, seq: u32) -> ResolutionEvent {
        ResolutionEvent {
            vm_id: vm.into(),
            domain: format!("host{seq}.example.com"),
            resolved_address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, seq as u8)),
            ttl_seconds: seq,
            observed_at: 1_000 + seq as u64,
        }
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(EventsHub::new(0), Err(HubError::InvalidCapacity)));
    }

    #[tokio::test]
    async fn maintains_per_vm_ordering() {
        let hub = EventsHub::new(8).unwrap();
        let mut rx = hub.subscribe(&"v1".into());
        for seq in 1..=4 {
            assert_eq!(hub.publish(event("v1", seq)), 1);
        }
        for seq in 1..=4 {
            assert_eq!(rx.recv().await.unwrap().ttl_seconds, seq);
        }
    }

    #[tokio::test]
    async fn no_subscriber_means_dropped() {
        let hub = EventsHub::new(8).unwrap();
        assert_eq!(hub.publish(event("v1", 1)), 0);
        // A subscription opened afterwards does not see the old event.
        let mut rx = hub.subscribe(&"v1".into());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let hub = EventsHub::new(2).unwrap();
        let mut rx = hub.subscribe(&"v1".into());
        for seq in 1..=5 {
            hub.publish(event("v1", seq));
        }
        // Receiver lags: oldest three were dropped, newest two survive.
        match rx.try_recv() {
            Err(TryRecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(rx.try_recv().unwrap().ttl_seconds, 4);
        assert_eq!(rx.try_recv().unwrap().ttl_seconds, 5);
    }

    #[tokio::test]
    async fn vms_are_independent() {
        let hub = EventsHub::new(8).unwrap();
        let mut rx1 = hub.subscribe(&"v1".into());
        let mut rx2 = hub.subscribe(&"v2".into());
        hub.publish(event("v2", 7));
        hub.publish(event("v1", 3));
        assert_eq!(rx1.recv().await.unwrap().ttl_seconds, 3);
        assert_eq!(rx2.recv().await.unwrap().ttl_seconds, 7);
    }

    #[tokio::test]
    async fn remove_vm_closes_receivers() {
        let hub = EventsHub::new(8).unwrap();
        let mut rx = hub.subscribe(&"v1".into());
        hub.remove_vm(&"v1".into());
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Closed)));
    }
}
