//! Legacy packet-filter backend.
//!
//! Each VM gets two dedicated chains in the filter table:
//! `DNSGATE-<vm>` for TTL-bounded per-address accepts and `DNSGATE-<vm>-NET`
//! for lifetime baseline networks. The provisioned VM forward path jumps
//! into these chains; this backend only manages their contents.
//!
//! iptables has no stable rule handles, so a rule id encodes the chain and
//! the exact rule spec; removal replays the spec with `-D`. `-C` probes
//! tell "absent" apart from real failures by matching the tool's stderr.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use tracing::{debug, info};

use dnsgate_core::VmId;

use crate::backend::{FirewallBackend, RuleId};
use crate::error::FirewallError;
use crate::exec::{exec, sanitize_vm_id};

const IPTABLES: &str = "/sbin/iptables";
const LOCK_WAIT_SECS: u32 = 20;

pub struct IptablesBackend {
    timeout: Duration,
}

impl IptablesBackend {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn chain(vm_id: &VmId) -> String {
        format!("DNSGATE-{}", sanitize_vm_id(vm_id.as_str(), 16))
    }

    fn baseline_chain(vm_id: &VmId) -> String {
        format!("{}-NET", Self::chain(vm_id))
    }

    async fn run(&self, args: &[&str], context: &str) -> Result<crate::exec::CmdOutput, FirewallError> {
        let wait = LOCK_WAIT_SECS.to_string();
        let mut full = vec!["-w", wait.as_str(), "-t", "filter"];
        full.extend_from_slice(args);
        exec(IPTABLES, &full, self.timeout, context).await
    }

    /// Runs an iptables mutation, treating any non-zero exit as failure.
    async fn run_checked(&self, args: &[&str], context: &str) -> Result<(), FirewallError> {
        let out = self.run(args, context).await?;
        if out.success {
            Ok(())
        } else {
            Err(FirewallError::CommandFailed {
                context: context.to_string(),
                stderr: out.stderr,
            })
        }
    }

    async fn chain_installed(&self, chain: &str) -> Result<bool, FirewallError> {
        let context = format!("probing chain '{chain}'");
        let out = self.run(&["-S", chain], &context).await?;
        if out.success {
            Ok(true)
        } else if stderr_means_absent(&out.stderr) {
            Ok(false)
        } else {
            Err(FirewallError::CommandFailed {
                context,
                stderr: out.stderr,
            })
        }
    }

    async fn ensure_chain(&self, chain: &str) -> Result<(), FirewallError> {
        if !self.chain_installed(chain).await? {
            self.run_checked(&["-N", chain], &format!("installing chain '{chain}'"))
                .await?;
        }
        Ok(())
    }

    /// `-C` probe: does this exact accept rule exist?
    async fn rule_installed(&self, chain: &str, dest: &str) -> Result<bool, FirewallError> {
        let context = format!("probing rule for {dest} in '{chain}'");
        let out = self
            .run(&["-C", chain, "-d", dest, "-j", "ACCEPT"], &context)
            .await?;
        if out.success {
            Ok(true)
        } else if stderr_means_absent(&out.stderr) {
            Ok(false)
        } else {
            Err(FirewallError::CommandFailed {
                context,
                stderr: out.stderr,
            })
        }
    }

    async fn remove_chain(&self, chain: &str) -> Result<(), FirewallError> {
        if self.chain_installed(chain).await? {
            self.run_checked(&["-F", chain], &format!("flushing chain '{chain}'"))
                .await?;
            self.run_checked(&["-X", chain], &format!("uninstalling chain '{chain}'"))
                .await?;
        }
        Ok(())
    }
}

fn stderr_means_absent(stderr: &str) -> bool {
    stderr.contains("No chain/target/match by that name")
        || stderr.contains("Bad rule")
        || stderr.contains("does not exist")
}

fn dest_of(address: IpAddr) -> String {
    format!("{address}/32")
}

/// Splits a `<chain>|<dest>` rule id minted by this backend.
fn parse_rule_id(rule_id: &RuleId) -> Result<(&str, &str), FirewallError> {
    rule_id
        .as_str()
        .split_once('|')
        .ok_or_else(|| FirewallError::MalformedRuleId(rule_id.as_str().to_string()))
}

/// Extracts rule destinations from `iptables -S <chain>` output.
fn parse_rule_specs(listing: &str) -> Vec<IpAddr> {
    listing
        .lines()
        .filter(|line| line.starts_with("-A") && line.contains("-j ACCEPT"))
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            while let Some(word) = words.next() {
                if word == "-d" {
                    return words
                        .next()
                        .and_then(|dest| dest.split('/').next())
                        .and_then(|ip| ip.parse().ok());
                }
            }
            None
        })
        .collect()
}

#[async_trait]
impl FirewallBackend for IptablesBackend {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn supports(&self, address: IpAddr) -> bool {
        address.is_ipv4()
    }

    async fn install_rule(&self, vm_id: &VmId, address: IpAddr) -> Result<RuleId, FirewallError> {
        if !address.is_ipv4() {
            return Err(FirewallError::UnsupportedFamily(address));
        }
        let chain = Self::chain(vm_id);
        let dest = dest_of(address);
        self.ensure_chain(&chain).await?;

        // Already present means reuse, not a duplicate kernel rule.
        if !self.rule_installed(&chain, &dest).await? {
            self.run_checked(
                &["-I", &chain, "-d", &dest, "-j", "ACCEPT"],
                &format!("allowing {dest} for VM '{vm_id}'"),
            )
            .await?;
        }
        info!(vm_id = %vm_id, %address, "iptables allow rule installed");
        Ok(RuleId::new(format!("{chain}|{dest}")))
    }

    async fn remove_rule(&self, rule_id: &RuleId) -> Result<(), FirewallError> {
        let (chain, dest) = parse_rule_id(rule_id)?;
        if self.rule_installed(chain, dest).await? {
            self.run_checked(
                &["-D", chain, "-d", dest, "-j", "ACCEPT"],
                &format!("removing allow rule for {dest}"),
            )
            .await?;
            debug!(rule_id = %rule_id, "iptables allow rule removed");
        }
        Ok(())
    }

    async fn list_active(&self, vm_id: &VmId) -> Result<Vec<(IpAddr, RuleId)>, FirewallError> {
        let chain = Self::chain(vm_id);
        let context = format!("listing chain '{chain}'");
        let out = self.run(&["-S", &chain], &context).await?;
        if !out.success {
            if stderr_means_absent(&out.stderr) {
                return Ok(Vec::new());
            }
            return Err(FirewallError::CommandFailed {
                context,
                stderr: out.stderr,
            });
        }
        Ok(parse_rule_specs(&out.stdout)
            .into_iter()
            .map(|addr| {
                let id = RuleId::new(format!("{chain}|{}", dest_of(addr)));
                (addr, id)
            })
            .collect())
    }

    async fn flush_vm(&self, vm_id: &VmId) -> Result<(), FirewallError> {
        self.remove_chain(&Self::chain(vm_id)).await?;
        self.remove_chain(&Self::baseline_chain(vm_id)).await?;
        info!(vm_id = %vm_id, "iptables rule group flushed");
        Ok(())
    }

    async fn install_baseline(
        &self,
        vm_id: &VmId,
        networks: &[IpNetwork],
    ) -> Result<(), FirewallError> {
        let chain = Self::baseline_chain(vm_id);
        self.ensure_chain(&chain).await?;
        for network in networks {
            if matches!(network, IpNetwork::V6(_)) {
                continue;
            }
            let dest = network.to_string();
            if !self.rule_installed(&chain, &dest).await? {
                self.run_checked(
                    &["-A", &chain, "-d", &dest, "-j", "ACCEPT"],
                    &format!("allowing baseline network {dest} for VM '{vm_id}'"),
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rule_specs_from_listing() {
        let listing = "\
-N DNSGATE-v1
-A DNSGATE-v1 -d 93.184.216.34/32 -j ACCEPT
-A DNSGATE-v1 -d 10.0.0.7/32 -j ACCEPT
-A DNSGATE-v1 -j LOG --log-prefix blocked
";
        let addrs = parse_rule_specs(listing);
        assert_eq!(
            addrs,
            vec![
                "93.184.216.34".parse::<IpAddr>().unwrap(),
                "10.0.0.7".parse().unwrap()
            ]
        );
    }

    #[test]
    fn absent_stderr_variants() {
        assert!(stderr_means_absent(
            "iptables: No chain/target/match by that name.\n"
        ));
        assert!(stderr_means_absent("iptables: Bad rule (does a matching rule exist in that chain?).\n"));
        assert!(!stderr_means_absent("iptables: Permission denied.\n"));
    }

    #[test]
    fn rule_id_round_trip() {
        let id = RuleId::new("DNSGATE-v1|93.184.216.34/32");
        let (chain, dest) = parse_rule_id(&id).unwrap();
        assert_eq!(chain, "DNSGATE-v1");
        assert_eq!(dest, "93.184.216.34/32");
        assert!(parse_rule_id(&RuleId::new("garbage")).is_err());
    }

    #[test]
    fn chain_names_are_namespaced() {
        assert_eq!(IptablesBackend::chain(&"v1".into()), "DNSGATE-v1");
        assert_eq!(
            IptablesBackend::baseline_chain(&"v1".into()),
            "DNSGATE-v1-NET"
        );
    }
}
