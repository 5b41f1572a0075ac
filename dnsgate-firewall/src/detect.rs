//! Backend auto-detection.
//!
//! Mirrors the host check the VM provisioner performs: a system whose
//! iptables is the legacy binary, or which has no `nft` at all, gets the
//! iptables backend; everything else gets nftables.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::backend::FirewallBackend;
use crate::error::FirewallError;
use crate::exec::exec;
use crate::iptables::IptablesBackend;
use crate::memory::MemoryBackend;
use crate::nftables::NftablesBackend;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Iptables,
    Nftables,
    /// In-process backend: no kernel mutation, used by tests and dry runs.
    Memory,
}

impl BackendKind {
    /// Probes the host for the appropriate kernel-facing backend.
    pub async fn detect(timeout: Duration) -> Result<Self, FirewallError> {
        let out = exec(
            "/sbin/iptables",
            &["--version"],
            timeout,
            "detecting iptables flavor",
        )
        .await?;
        if !out.success {
            return Err(FirewallError::CommandFailed {
                context: "detecting iptables flavor".to_string(),
                stderr: out.stderr,
            });
        }
        let kind = if out.stdout.contains("legacy") || !Path::new("/sbin/nft").exists() {
            BackendKind::Iptables
        } else {
            BackendKind::Nftables
        };
        info!(?kind, "firewall backend detected");
        Ok(kind)
    }

    /// Constructs the backend for this kind.
    pub fn build(self, timeout: Duration) -> Arc<dyn FirewallBackend> {
        match self {
            BackendKind::Iptables => Arc::new(IptablesBackend::new(timeout)),
            BackendKind::Nftables => Arc::new(NftablesBackend::new(timeout)),
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
        }
    }
}

/// Detects and constructs the host's kernel-facing backend.
pub async fn detect_backend(timeout: Duration) -> Result<Arc<dyn FirewallBackend>, FirewallError> {
    Ok(BackendKind::detect(timeout).await?.build(timeout))
}
