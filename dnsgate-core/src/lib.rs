//! # dnsgate-core
//!
//! Shared vocabulary of the dnsgate system: VM identity and lifecycle
//! phases, resolution/lifecycle event types, the Events Hub that carries
//! them, and the clock abstraction the policy engine keys expiries off.

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod events;
pub mod time;
pub mod vm;

pub use events::hub::{EventsHub, HubError};
pub use events::{LifecycleEvent, ResolutionEvent};
pub use time::{Clock, SystemClock, VirtualClock};
pub use vm::{LifecyclePhase, VmId};
