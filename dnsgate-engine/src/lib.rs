//! # dnsgate-engine
//!
//! The Network Policy Engine: consumes resolution events, installs,
//! refreshes and expires firewall rules per VM, and reconciles backend
//! state against its own record.
//!
//! One consumer task per VM guarantees per-VM event ordering without a
//! shared lock across VMs; within a VM, resolution handling and the expiry
//! sweep execute as mutually exclusive steps of one serial loop, so a
//! refresh can never race the sweep removing the same address.

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

mod engine;
mod error;
mod retry;
mod state;
mod task;

pub use engine::{PolicyEngine, ReconcileReport};
pub use error::EngineError;
pub use state::FirewallRuleHandle;
