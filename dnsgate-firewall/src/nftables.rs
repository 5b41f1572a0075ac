//! nftables backend.
//!
//! Each VM gets its own `inet` family table, `dnsgate-<vm>`, holding an
//! `allow` chain for TTL-bounded per-address accepts and a `netallow` chain
//! for lifetime baseline networks. The provisioned VM forward path jumps
//! into these chains. nft assigns stable handles on insertion (`-a -e`
//! echoes them back), so a rule id is `<table>|<handle>` and removal is
//! delete-by-handle. Deleting into a table or chain that is already gone is
//! a no-op, which makes repeated drains harmless.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use tracing::{debug, info};

use dnsgate_core::VmId;

use crate::backend::{FirewallBackend, RuleId};
use crate::error::FirewallError;
use crate::exec::{exec, sanitize_vm_id};

const NFT: &str = "/sbin/nft";
const ALLOW_CHAIN: &str = "allow";
const BASELINE_CHAIN: &str = "netallow";

pub struct NftablesBackend {
    timeout: Duration,
}

impl NftablesBackend {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn table(vm_id: &VmId) -> String {
        format!("dnsgate-{}", sanitize_vm_id(vm_id.as_str(), 24))
    }

    async fn run(&self, args: &[&str], context: &str) -> Result<crate::exec::CmdOutput, FirewallError> {
        exec(NFT, args, self.timeout, context).await
    }

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

    /// `nft add table`/`add chain` are idempotent, so ensure is plain adds.
    async fn ensure_table(&self, table: &str) -> Result<(), FirewallError> {
        self.run_checked(
            &["add", "table", "inet", table],
            &format!("adding table '{table}'"),
        )
        .await?;
        for chain in [ALLOW_CHAIN, BASELINE_CHAIN] {
            self.run_checked(
                &["add", "chain", "inet", table, chain],
                &format!("adding chain '{table}/{chain}'"),
            )
            .await?;
        }
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, FirewallError> {
        let out = self
            .run(
                &["list", "table", "inet", table],
                &format!("probing table '{table}'"),
            )
            .await?;
        Ok(out.success)
    }
}

fn daddr_keyword(address: IpAddr) -> &'static str {
    match address {
        IpAddr::V4(_) => "ip",
        IpAddr::V6(_) => "ip6",
    }
}

/// Extracts the handle nft echoes back for `-a -e add rule`.
fn parse_echoed_handle(stdout: &str) -> Option<u64> {
    stdout.lines().find_map(|line| {
        let (_, tail) = line.split_once("# handle")?;
        tail.trim().parse().ok()
    })
}

/// Splits a `<table>|<handle>` rule id minted by this backend.
fn parse_rule_id(rule_id: &RuleId) -> Result<(&str, &str), FirewallError> {
    rule_id
        .as_str()
        .split_once('|')
        .ok_or_else(|| FirewallError::MalformedRuleId(rule_id.as_str().to_string()))
}

/// Extracts `(address, handle)` pairs from `nft -a list chain` output.
fn parse_chain_listing(stdout: &str) -> Vec<(IpAddr, u64)> {
    stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if !line.contains("daddr") || !line.contains("accept") {
                return None;
            }
            let handle = parse_echoed_handle(line)?;
            let mut words = line.split_whitespace();
            while let Some(word) = words.next() {
                if word == "daddr" {
                    let addr = words.next()?.split('/').next()?.parse().ok()?;
                    return Some((addr, handle));
                }
            }
            None
        })
        .collect()
}

#[async_trait]
impl FirewallBackend for NftablesBackend {
    fn name(&self) -> &'static str {
        "nftables"
    }

    async fn install_rule(&self, vm_id: &VmId, address: IpAddr) -> Result<RuleId, FirewallError> {
        let table = Self::table(vm_id);
        self.ensure_table(&table).await?;

        let dest = address.to_string();
        let context = format!("allowing {dest} for VM '{vm_id}'");
        let out = self
            .run(
                &[
                    "-a", "-e", "add", "rule", "inet", &table, ALLOW_CHAIN,
                    daddr_keyword(address), "daddr", &dest, "accept",
                ],
                &context,
            )
            .await?;
        if !out.success {
            return Err(FirewallError::CommandFailed {
                context,
                stderr: out.stderr,
            });
        }
        let handle =
            parse_echoed_handle(&out.stdout).ok_or(FirewallError::UnexpectedOutput { context })?;
        info!(vm_id = %vm_id, %address, handle, "nftables allow rule installed");
        Ok(RuleId::new(format!("{table}|{handle}")))
    }

    async fn remove_rule(&self, rule_id: &RuleId) -> Result<(), FirewallError> {
        let (table, handle) = parse_rule_id(rule_id)?;

        // Chain already gone (VM flushed) means nothing to delete.
        let probe = self
            .run(
                &["list", "chain", "inet", table, ALLOW_CHAIN],
                &format!("probing chain '{table}/{ALLOW_CHAIN}'"),
            )
            .await?;
        if !probe.success {
            return Ok(());
        }

        let context = format!("removing rule handle {handle} from '{table}'");
        let out = self
            .run(
                &["delete", "rule", "inet", table, ALLOW_CHAIN, "handle", handle],
                &context,
            )
            .await?;
        // A vanished handle is an idempotent no-op, not a failure.
        if out.success || out.stderr.contains("No such file or directory") {
            debug!(rule_id = %rule_id, "nftables allow rule removed");
            Ok(())
        } else {
            Err(FirewallError::CommandFailed {
                context,
                stderr: out.stderr,
            })
        }
    }

    async fn list_active(&self, vm_id: &VmId) -> Result<Vec<(IpAddr, RuleId)>, FirewallError> {
        let table = Self::table(vm_id);
        let out = self
            .run(
                &["-a", "list", "chain", "inet", &table, ALLOW_CHAIN],
                &format!("listing chain '{table}/{ALLOW_CHAIN}'"),
            )
            .await?;
        if !out.success {
            // No table yet: the VM has no rules.
            return Ok(Vec::new());
        }
        Ok(parse_chain_listing(&out.stdout)
            .into_iter()
            .map(|(addr, handle)| (addr, RuleId::new(format!("{table}|{handle}"))))
            .collect())
    }

    async fn flush_vm(&self, vm_id: &VmId) -> Result<(), FirewallError> {
        let table = Self::table(vm_id);
        if self.table_exists(&table).await? {
            self.run_checked(
                &["delete", "table", "inet", &table],
                &format!("deleting table '{table}'"),
            )
            .await?;
        }
        info!(vm_id = %vm_id, "nftables rule group flushed");
        Ok(())
    }

    async fn install_baseline(
        &self,
        vm_id: &VmId,
        networks: &[IpNetwork],
    ) -> Result<(), FirewallError> {
        let table = Self::table(vm_id);
        self.ensure_table(&table).await?;
        for network in networks {
            let keyword = match network {
                IpNetwork::V4(_) => "ip",
                IpNetwork::V6(_) => "ip6",
            };
            let dest = network.to_string();
            self.run_checked(
                &[
                    "add", "rule", "inet", &table, BASELINE_CHAIN, keyword, "daddr", &dest,
                    "accept",
                ],
                &format!("allowing baseline network {dest} for VM '{vm_id}'"),
            )
            .await?;
        }
        Ok(())
    }
}
