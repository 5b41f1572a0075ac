//! # dnsgate-firewall
//!
//! Firewall backend abstraction and its implementations.
//!
//! The policy engine owns rule lifetime; backends only mutate kernel tables
//! and hand back opaque rule identifiers. Two kernel-facing variants exist
//! (legacy iptables chains, nftables table/handle rules) plus an in-process
//! memory backend for tests and dry runs. Every operation is idempotent at
//! the semantic level: removing a vanished rule or flushing an absent VM is
//! a no-op, never an error.
//!
//! All rules are namespaced by VM (a chain or table derived from the VM id)
//! so `flush_vm` can never touch another VM's rules.

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod backend;
pub mod detect;
mod exec;
pub mod iptables;
pub mod memory;
pub mod nftables;

mod error;

pub use backend::{FirewallBackend, RuleId};
pub use detect::{detect_backend, BackendKind};
pub use error::FirewallError;
pub use iptables::IptablesBackend;
pub use memory::{BackendCall, MemoryBackend};
pub use nftables::NftablesBackend;
