use thiserror::Error;

use dnsgate_config::ConfigError;
use dnsgate_core::{LifecyclePhase, VmId};
use dnsgate_firewall::FirewallError;

/// Policy engine error conditions.
///
/// Backend failures reach this type only after retry exhaustion; transient
/// failures are absorbed by the retry envelope and the degraded fail-closed
/// state. Nothing here ever converts into an allow-by-default.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("VM '{0}' is not known to the policy engine")]
    UnknownVm(VmId),

    /// Arming with a policy that allows nothing is a provisioning bug,
    /// not a VM that should run fully egress-blocked by accident.
    #[error("Refusing to arm VM '{0}' with an empty allow-list")]
    EmptyPolicy(VmId),

    #[error("VM '{vm_id}' is {phase}, cannot {action}")]
    InvalidTransition {
        vm_id: VmId,
        phase: LifecyclePhase,
        action: &'static str,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Firewall backend error: {0}")]
    Backend(#[from] FirewallError),
}
