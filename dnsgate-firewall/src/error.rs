use thiserror::Error;

/// Firewall backend error conditions.
///
/// Backend failures are transient from the engine's point of view: install
/// and remove calls are retried with bounded backoff, and exhaustion marks
/// the VM degraded (fail closed) rather than surfacing an allow-by-default.
#[derive(Debug, Error)]
pub enum FirewallError {
    /// The external tool did not complete within the bounded timeout.
    #[error("Firewall command timed out while {context}")]
    Timeout { context: String },

    /// The external tool exited non-zero for a reason other than the
    /// target object being absent.
    #[error("Firewall error while {context}: {stderr}")]
    CommandFailed { context: String, stderr: String },

    /// Output of the external tool could not be interpreted.
    #[error("Unexpected firewall tool output while {context}")]
    UnexpectedOutput { context: String },

    /// A rule identifier not minted by this backend.
    #[error("Malformed rule id '{0}'")]
    MalformedRuleId(String),

    /// Address family the backend cannot express (iptables is IPv4-only).
    #[error("Address family of {0} not supported by this backend")]
    UnsupportedFamily(std::net::IpAddr),

    #[error("Firewall I/O error: {0}")]
    Io(#[from] std::io::Error),
}
