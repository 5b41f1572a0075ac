//! Bounded execution of external firewall tooling.

use std::time::Duration;

use tokio::process::Command;
use tracing::trace;

use crate::error::FirewallError;

pub(crate) struct CmdOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `program` with `args`, bounded by `timeout`.
///
/// A non-zero exit is not an error here: callers interpret stderr, since
/// "object absent" exits non-zero but is a legitimate idempotent outcome.
pub(crate) async fn exec(
    program: &str,
    args: &[&str],
    timeout: Duration,
    context: &str,
) -> Result<CmdOutput, FirewallError> {
    trace!(program, ?args, context, "running firewall tool");
    let output = tokio::time::timeout(timeout, Command::new(program).args(args).output())
        .await
        .map_err(|_| FirewallError::Timeout {
            context: context.to_string(),
        })??;

    Ok(CmdOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Sanitizes a VM id into a netfilter object name fragment.
///
/// Chain names are capped at 28 characters by iptables; the caller's
/// prefixes leave room for roughly 16. A clean id that fits is used
/// verbatim. Anything lossy (replaced characters, truncation) gets a
/// digest suffix of the full original id, so two distinct VM ids can
/// never share a chain or table and a flush stays confined to its VM.
/// The digest is stable across restarts; listing finds the same name.
pub(crate) fn sanitize_vm_id(vm_id: &str, max_len: usize) -> String {
    let clean: String = vm_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    if clean == vm_id && clean.len() <= max_len {
        return clean;
    }

    let digest = blake3::hash(vm_id.as_bytes()).to_hex();
    let tag = &digest.as_str()[..6];
    let keep = max_len.saturating_sub(tag.len() + 1);
    let mut name: String = clean.chars().take(keep).collect();
    name.push('-');
    name.push_str(tag);
    name
}
