//! # dnsgate-resolver
//!
//! The Resolution Filter contract: policy checks at DNS query time and
//! ResolutionEvent emission on successful upstream answers.
//!
//! The filter's runtime is owned by the resolver process (it executes in
//! the resolver's plugin context); this crate carries the decision logic
//! and the event construction so the core and the resolver plugin agree on
//! exactly one semantics.

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod filter;

pub use filter::{AnswerRecord, FilterDecision, ResolutionFilter};
