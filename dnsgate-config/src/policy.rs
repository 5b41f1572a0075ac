//! Per-profile allow-lists and the Policy Store.
//!
//! A profile's loose document (domain suffix strings, CIDR strings) is
//! compiled into a fixed [`VmPolicy`] at load time; malformed entries are a
//! [`ConfigError`], never a deferred match-time decision. Compiled policies
//! are immutable and shared by `Arc`; a reload swaps whole profiles
//! atomically and only affects VMs armed afterwards.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ConfigError;
use crate::validation;

lazy_static! {
    // One DNS label: alphanumeric, inner hyphens allowed.
    static ref LABEL_RE: Regex = Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").unwrap();
}

/// A validated, suffix-matchable domain pattern.
///
/// Stored lowercase without a trailing dot. `example.com` matches itself and
/// any name below it (`mail.example.com`), but never `notexample.com`:
/// suffix matching happens on label boundaries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DomainPattern(String);

impl DomainPattern {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Tells whether `domain` falls under this pattern.
    pub fn matches(&self, domain: &str) -> bool {
        let domain = normalize(domain);
        domain == self.0
            || (domain.len() > self.0.len() + 1
                && domain.ends_with(&self.0)
                && domain.as_bytes()[domain.len() - self.0.len() - 1] == b'.')
    }
}

impl FromStr for DomainPattern {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = normalize(s);
        let invalid = |reason: &str| ConfigError::InvalidPattern {
            entry: s.to_string(),
            reason: reason.to_string(),
            profile: None,
        };

        if normalized.is_empty() {
            return Err(invalid("empty pattern"));
        }
        if normalized.len() > 253 {
            return Err(invalid("name exceeds 253 characters"));
        }
        for label in normalized.split('.') {
            if label.len() > 63 {
                return Err(invalid("label exceeds 63 characters"));
            }
            if !LABEL_RE.is_match(label) {
                return Err(invalid("label is not valid hostname syntax"));
            }
        }
        Ok(Self(normalized))
    }
}

fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}

/// One VM profile's allow-list document, as loaded.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
pub struct ProfileConfig {
    /// Domain suffixes the VM may resolve (and subsequently reach).
    #[serde(default)]
    pub domains: Vec<String>,

    /// Networks the VM may reach regardless of DNS, installed as baseline
    /// rules at activation. Never consulted for domain matching.
    #[serde(default)]
    #[validate(custom(function = validation::validate_cidr_list))]
    pub networks: Vec<IpNetwork>,
}

impl ProfileConfig {
    /// Compiles the loose document into an immutable policy.
    pub fn compile(&self) -> Result<VmPolicy, ConfigError> {
        let patterns = self
            .domains
            .iter()
            .map(|d| d.parse())
            .collect::<Result<Vec<DomainPattern>, _>>()?;
        Ok(VmPolicy {
            patterns,
            networks: self.networks.clone(),
        })
    }
}

/// Compiled allow-list for one VM profile. Immutable once built.
#[derive(Clone, Debug, Default)]
pub struct VmPolicy {
    patterns: Vec<DomainPattern>,
    networks: Vec<IpNetwork>,
}

impl VmPolicy {
    /// Longest-suffix match of `domain` against the pattern set.
    ///
    /// Returns the most specific matching pattern, or `None` when the
    /// domain is not allow-listed. CIDR-only entries never match here.
    pub fn longest_match(&self, domain: &str) -> Option<&DomainPattern> {
        self.patterns
            .iter()
            .filter(|p| p.matches(domain))
            .max_by_key(|p| p.as_str().len())
    }

    pub fn patterns(&self) -> &[DomainPattern] {
        &self.patterns
    }

    /// A policy with no patterns and no networks allows nothing.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.networks.is_empty()
    }

    /// Baseline networks, reachable for the whole VM lifetime.
    pub fn networks(&self) -> &[IpNetwork] {
        &self.networks
    }
}

/// Read-mostly store of compiled profiles.
///
/// The policy engine snapshots a profile's `Arc<VmPolicy>` at arm time;
/// a reload replaces the map atomically and requires re-arming to take
/// effect on a VM (no hot patch of a running policy).
pub struct PolicyStore {
    profiles: RwLock<HashMap<String, Arc<VmPolicy>>>,
}

impl PolicyStore {
    /// Builds the store from loaded profile documents.
    pub fn from_profiles(
        profiles: &HashMap<String, ProfileConfig>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            profiles: RwLock::new(Self::compile_all(profiles)?),
        })
    }

    /// Replaces every profile in one step. Running VMs are unaffected.
    pub fn reload(&self, profiles: &HashMap<String, ProfileConfig>) -> Result<(), ConfigError> {
        let compiled = Self::compile_all(profiles)?;
        *self.profiles.write() = compiled;
        Ok(())
    }

    /// Snapshot of the named profile's compiled policy.
    pub fn policy_for(&self, profile: &str) -> Option<Arc<VmPolicy>> {
        self.profiles.read().get(profile).cloned()
    }

    fn compile_all(
        profiles: &HashMap<String, ProfileConfig>,
    ) -> Result<HashMap<String, Arc<VmPolicy>>, ConfigError> {
        profiles
            .iter()
            .map(|(name, profile)| {
                let policy = profile.compile().map_err(|e| e.in_profile(name))?;
                Ok((name.clone(), Arc::new(policy)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(domains: &[&str]) -> VmPolicy {
        ProfileConfig {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            networks: vec![],
        }
        .compile()
        .unwrap()
    }

    #[test]
    fn suffix_match_respects_label_boundaries() {
        let p = policy(&["example.com"]);
        assert!(p.longest_match("example.com").is_some());
        assert!(p.longest_match("mail.example.com").is_some());
        assert!(p.longest_match("a.b.example.com").is_some());
        assert!(p.longest_match("notexample.com").is_none());
        assert!(p.longest_match("example.com.evil.test").is_none());
    }

    #[test]
    fn match_ignores_case_and_trailing_dot() {
        let p = policy(&["Example.COM."]);
        assert!(p.longest_match("MAIL.example.com.").is_some());
    }

    #[test]
    fn longest_suffix_wins() {
        let p = policy(&["example.com", "mail.example.com"]);
        let best = p.longest_match("imap.mail.example.com").unwrap();
        assert_eq!(best.as_str(), "mail.example.com");
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        for bad in ["", ".", "-leading.com", "sp ace.com", "under_score.com"] {
            assert!(
                bad.parse::<DomainPattern>().is_err(),
                "pattern {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn store_reload_swaps_profiles() {
        let mut profiles = HashMap::new();
        profiles.insert(
            "office".to_string(),
            ProfileConfig {
                domains: vec!["example.com".into()],
                networks: vec![],
            },
        );
        let store = PolicyStore::from_profiles(&profiles).unwrap();
        let before = store.policy_for("office").unwrap();
        assert!(before.longest_match("example.com").is_some());

        profiles.get_mut("office").unwrap().domains = vec!["other.net".into()];
        store.reload(&profiles).unwrap();
        let after = store.policy_for("office").unwrap();
        assert!(after.longest_match("example.com").is_none());
        // The snapshot taken before the reload still matches: re-arming is
        // what picks up the new document.
        assert!(before.longest_match("example.com").is_some());
    }

    #[test]
    fn unknown_profile_is_none() {
        let store = PolicyStore::from_profiles(&HashMap::new()).unwrap();
        assert!(store.policy_for("ghost").is_none());
    }
}
