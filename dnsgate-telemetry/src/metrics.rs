//! ## dnsgate-telemetry::metrics
//! **Prometheus counters for the policy engine**
//!
//! One registry per process; counters cover the full resolution-to-rule
//! pipeline so a diverging backend or a lossy hub shows up immediately:
//! - `dnsgate_resolutions_total` / `dnsgate_refusals_total` at the filter,
//! - `dnsgate_rules_installed_total` / `dnsgate_rules_expired_total` /
//!   `dnsgate_rules_removed_total` at the engine,
//! - `dnsgate_events_dropped_total` for hub backpressure,
//! - `dnsgate_backend_failures_total` / `dnsgate_vms_degraded_total` for
//!   fail-closed accounting.

use prometheus::{IntCounter, Registry};

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    pub resolutions: IntCounter,
    pub refusals: IntCounter,
    pub rules_installed: IntCounter,
    pub rules_expired: IntCounter,
    pub rules_removed: IntCounter,
    pub events_dropped: IntCounter,
    pub backend_failures: IntCounter,
    pub vms_degraded: IntCounter,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let registry = Registry::new();
        let resolutions = IntCounter::new(
            "dnsgate_resolutions_total",
            "Allow-listed DNS resolutions forwarded upstream",
        )
        .unwrap();
        let refusals = IntCounter::new(
            "dnsgate_refusals_total",
            "DNS queries refused by the allow-list",
        )
        .unwrap();
        let rules_installed = IntCounter::new(
            "dnsgate_rules_installed_total",
            "Firewall allow rules installed",
        )
        .unwrap();
        let rules_expired = IntCounter::new(
            "dnsgate_rules_expired_total",
            "Firewall allow rules removed by TTL expiry",
        )
        .unwrap();
        let rules_removed = IntCounter::new(
            "dnsgate_rules_removed_total",
            "Firewall allow rules removed for any reason",
        )
        .unwrap();
        let events_dropped = IntCounter::new(
            "dnsgate_events_dropped_total",
            "Resolution events dropped by hub backpressure",
        )
        .unwrap();
        let backend_failures = IntCounter::new(
            "dnsgate_backend_failures_total",
            "Firewall backend calls failed after retry exhaustion",
        )
        .unwrap();
        let vms_degraded = IntCounter::new(
            "dnsgate_vms_degraded_total",
            "VM policies transitioned to the degraded fail-closed state",
        )
        .unwrap();

        for collector in [
            &resolutions,
            &refusals,
            &rules_installed,
            &rules_expired,
            &rules_removed,
            &events_dropped,
            &backend_failures,
            &vms_degraded,
        ] {
            registry.register(Box::new(collector.clone())).unwrap();
        }

        Self {
            registry,
            resolutions,
            refusals,
            rules_installed,
            rules_expired,
            rules_removed,
            events_dropped,
            backend_failures,
            vms_degraded,
        }
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).unwrap())
    }
}
