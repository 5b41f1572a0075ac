//! ## dnsgate-core::events
//! **Event types and the per-VM publish/subscribe hub**
//!
//! Two event families flow through the hub:
//! - [`ResolutionEvent`]: one per successful allow-listed DNS answer,
//!   produced by the resolution filter and consumed by the policy engine.
//! - [`LifecycleEvent`]: VM policy phase transitions, published for
//!   observers (diagnostics, UI); the engine itself is driven by the
//!   synchronous `arm`/`activate`/`drain` calls, not by these.

use std::net::IpAddr;

use crate::vm::{LifecyclePhase, VmId};

pub mod hub;

/// A successful, allow-listed DNS resolution.
///
/// Emitted once per upstream answer; never mutated. `ttl_seconds` is the
/// minimum TTL across the answer's records, already clamped to at least 1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolutionEvent {
    pub vm_id: VmId,
    pub domain: String,
    pub resolved_address: IpAddr,
    pub ttl_seconds: u32,
    /// Unix timestamp (seconds) at which the answer was observed.
    pub observed_at: u64,
}

/// A VM policy phase transition, for observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub vm_id: VmId,
    pub phase: LifecyclePhase,
    /// Unix timestamp (seconds) of the transition.
    pub at: u64,
}
