//! VM identity and lifecycle phases.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque VM identifier, also used to namespace firewall rules per VM.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VmId(String);

impl VmId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VmId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for VmId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Network policy lifecycle of a single VM.
///
/// Transitions are linear: `Inactive → Armed → Active → Draining → Inactive`.
/// The policy engine enforces legality; this type only names the phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecyclePhase {
    /// No policy state, no firewall rules.
    Inactive,
    /// Allow-list loaded and subscription registered, no rules installed yet.
    Armed,
    /// Resolution events are consumed and turned into TTL-bounded rules.
    Active,
    /// Shutdown in progress: intake stopped, remaining rules being flushed.
    Draining,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecyclePhase::Inactive => "inactive",
            LifecyclePhase::Armed => "armed",
            LifecyclePhase::Active => "active",
            LifecyclePhase::Draining => "draining",
        };
        f.write_str(name)
    }
}
