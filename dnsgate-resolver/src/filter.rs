//! Policy check at DNS time.
//!
//! One filter instance per VM, bound to the policy snapshot taken when the
//! VM was armed. Queries are decided by longest-suffix match against the
//! profile's domain patterns; CIDR-only entries never match by domain.
//! Allowed queries are forwarded upstream by the resolver host; each
//! successful answer is reported back here and becomes one ResolutionEvent
//! per resolved address, carrying the answer's minimum TTL (a TTL of 0 is
//! treated as 1 second so no rule is born dead). Refusals and upstream
//! failures emit nothing.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{info, warn};

use dnsgate_config::VmPolicy;
use dnsgate_core::{Clock, EventsHub, ResolutionEvent, VmId};
use dnsgate_telemetry::MetricsRecorder;

/// Outcome of the query-time policy check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterDecision {
    /// Query may be forwarded upstream; `pattern` is the matched suffix.
    Allow { pattern: String },
    /// Query is answered with an explicit resolution failure.
    Refuse,
}

/// One record of an upstream answer.
#[derive(Clone, Copy, Debug)]
pub struct AnswerRecord {
    pub address: IpAddr,
    pub ttl_seconds: u32,
}

/// Per-VM resolution filter.
pub struct ResolutionFilter {
    vm_id: VmId,
    policy: Arc<VmPolicy>,
    hub: Arc<EventsHub>,
    metrics: Arc<MetricsRecorder>,
    clock: Arc<dyn Clock>,
}

impl ResolutionFilter {
    pub fn new(
        vm_id: VmId,
        policy: Arc<VmPolicy>,
        hub: Arc<EventsHub>,
        metrics: Arc<MetricsRecorder>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            vm_id,
            policy,
            hub,
            metrics,
            clock,
        }
    }

    /// Decides `allow | refuse` for a query domain.
    pub fn check_query(&self, domain: &str) -> FilterDecision {
        match self.policy.longest_match(domain) {
            Some(pattern) => FilterDecision::Allow {
                pattern: pattern.as_str().to_string(),
            },
            None => {
                self.metrics.refusals.inc();
                warn!(vm_id = %self.vm_id, domain, "query refused by allow-list");
                FilterDecision::Refuse
            }
        }
    }

    /// Reports a successful upstream answer for an allowed query.
    ///
    /// Emits one event per distinct resolved address, all carrying the
    /// minimum TTL across the answer's records. An empty answer emits
    /// nothing.
    pub fn report_answer(&self, domain: &str, records: &[AnswerRecord]) -> Vec<ResolutionEvent> {
        if records.is_empty() {
            return Vec::new();
        }

        let min_ttl = records
            .iter()
            .map(|r| r.ttl_seconds)
            .min()
            .unwrap_or(0)
            .max(1);
        let observed_at = self.clock.now();

        let mut events: Vec<ResolutionEvent> = Vec::new();
        for record in records {
            if events.iter().any(|e| e.resolved_address == record.address) {
                continue;
            }
            let event = ResolutionEvent {
                vm_id: self.vm_id.clone(),
                domain: domain.to_string(),
                resolved_address: record.address,
                ttl_seconds: min_ttl,
                observed_at,
            };
            info!(vm_id = %self.vm_id, domain, address = %record.address, ttl = min_ttl,
                  "resolution observed");
            self.metrics.resolutions.inc();
            self.hub.publish(event.clone());
            events.push(event);
        }
        events
    }

    /// Reports that an allowed query failed upstream (NXDOMAIN, timeout).
    /// No event is emitted; the connection simply stays blocked.
    pub fn report_upstream_failure(&self, domain: &str, reason: &str) {
        warn!(vm_id = %self.vm_id, domain, reason, "upstream resolution failed");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;
    use tracing_test::traced_test;

    use dnsgate_config::{PolicyStore, ProfileConfig};
    use dnsgate_core::VirtualClock;

    use super::*;

    fn filter_for(domains: &[&str]) -> (ResolutionFilter, Arc<EventsHub>) {
        let mut profiles = HashMap::new();
        profiles.insert(
            "p".to_string(),
            ProfileConfig {
                domains: domains.iter().map(|d| d.to_string()).collect(),
                networks: vec![],
            },
        );
        let store = PolicyStore::from_profiles(&profiles).unwrap();
        let hub = Arc::new(EventsHub::new(64).unwrap());
        let filter = ResolutionFilter::new(
            "v1".into(),
            store.policy_for("p").unwrap(),
            Arc::clone(&hub),
            Arc::new(MetricsRecorder::new()),
            Arc::new(VirtualClock::new(1_000)),
        );
        (filter, hub)
    }

    fn record(addr: &str, ttl: u32) -> AnswerRecord {
        AnswerRecord {
            address: addr.parse().unwrap(),
            ttl_seconds: ttl,
        }
    }

    #[test]
    #[traced_test]
    fn allows_by_suffix_refuses_the_rest() {
        let (filter, _hub) = filter_for(&["example.com"]);
        assert!(matches!(
            filter.check_query("api.example.com"),
            FilterDecision::Allow { .. }
        ));
        assert_eq!(filter.check_query("evil.test"), FilterDecision::Refuse);
        assert!(logs_contain("query refused by allow-list"));
    }

    #[tokio::test]
    async fn answer_becomes_events_with_min_ttl() {
        let (filter, hub) = filter_for(&["example.com"]);
        let mut rx = hub.subscribe(&"v1".into());
        let events = filter.report_answer(
            "api.example.com",
            &[record("93.184.216.34", 300), record("93.184.216.35", 30)],
        );
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.ttl_seconds == 30));
        assert_eq!(events[0].observed_at, 1_000);
        assert_eq!(
            rx.recv().await.unwrap().resolved_address,
            "93.184.216.34".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn zero_ttl_is_clamped_to_one() {
        let (filter, _hub) = filter_for(&["example.com"]);
        let events = filter.report_answer("example.com", &[record("10.0.0.1", 0)]);
        assert_eq!(events[0].ttl_seconds, 1);
    }

    #[test]
    fn duplicate_addresses_collapse() {
        let (filter, _hub) = filter_for(&["example.com"]);
        let events = filter.report_answer(
            "example.com",
            &[record("10.0.0.1", 60), record("10.0.0.1", 60)],
        );
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn empty_answer_emits_nothing() {
        let (filter, hub) = filter_for(&["example.com"]);
        let mut rx = hub.subscribe(&"v1".into());
        assert!(filter.report_answer("example.com", &[]).is_empty());
        assert!(rx.try_recv().is_err());
    }

    proptest! {
        // A domain that matches does so because some pattern is a
        // label-boundary suffix of it; gluing arbitrary prefixes onto an
        // unrelated apex must never match.
        #[test]
        fn unrelated_apex_never_matches(label in "[a-z]{1,10}") {
            let (filter, _hub) = filter_for(&["example.com"]);
            let domain = format!("{label}.not-example.org");
            prop_assert_eq!(filter.check_query(&domain), FilterDecision::Refuse);
        }

        #[test]
        fn subdomains_always_match(label in "[a-z]{1,10}") {
            let (filter, _hub) = filter_for(&["example.com"]);
            let domain = format!("{label}.example.com");
            let allowed = matches!(
                filter.check_query(&domain),
                FilterDecision::Allow { .. }
            );
            prop_assert!(allowed, "{} was refused", domain);
        }
    }
}
