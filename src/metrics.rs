// metrics.rs - Prometheus counters for the NAN control plane
use prometheus::{IntCounter, IntCounterVec, IntGauge, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub enable_requests: IntCounter,
    pub enable_failures: IntCounter,
    pub disable_requests: IntCounter,
    pub implicit_disables: IntCounter,
    pub rejected_transitions: IntCounter,
    pub confirms_accepted: IntCounter,
    pub confirms_rejected: IntCounter,
    pub end_indications: IntCounter,
    pub session_underflows: IntCounter,
    pub commands_activated: IntCounterVec,
    pub commands_cancelled: IntCounter,
    pub commands_timed_out: IntCounter,
    pub commands_queued: IntGauge,
    pub transaction_timeouts: IntCounter,
    pub late_completions: IntCounter,
    pub active_ndp_sessions: IntGauge,
    pub active_ndp_peers: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("nanlink".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_counter_vec {
            ($name:expr, $help:expr, $labels:expr) => {{
                let counter = IntCounterVec::new(prometheus::Opts::new($name, $help), $labels)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        let enable_requests =
            register_counter!("discovery_enable_requests_total", "NAN enable requests");
        let enable_failures = register_counter!(
            "discovery_enable_failures_total",
            "NAN enable requests that failed or timed out"
        );
        let disable_requests =
            register_counter!("discovery_disable_requests_total", "NAN disable requests");
        let implicit_disables = register_counter!(
            "discovery_implicit_disables_total",
            "Discovery disables raised by firmware without a host request"
        );
        let rejected_transitions = register_counter!(
            "discovery_rejected_transitions_total",
            "Rejected discovery state transitions"
        );
        let confirms_accepted =
            register_counter!("ndp_confirms_accepted_total", "Accepted NDP confirms");
        let confirms_rejected =
            register_counter!("ndp_confirms_rejected_total", "Rejected NDP confirms");
        let end_indications =
            register_counter!("ndp_end_indications_total", "NDP end indication entries");
        let session_underflows = register_counter!(
            "ndp_session_underflows_total",
            "Session decrements rejected because the peer had no sessions"
        );
        let commands_activated = register_counter_vec!(
            "commands_activated_total",
            "Serialized commands dispatched to firmware",
            &["kind"]
        );
        let commands_cancelled =
            register_counter!("commands_cancelled_total", "Serialized commands cancelled");
        let commands_timed_out =
            register_counter!("commands_timed_out_total", "Serialized commands timed out");
        let commands_queued = register_gauge!("commands_queued", "Serialized commands waiting");
        let transaction_timeouts = register_counter!(
            "transaction_timeouts_total",
            "Blocking requests that timed out"
        );
        let late_completions = register_counter!(
            "late_completions_total",
            "Responses that arrived after their waiter gave up"
        );
        let active_ndp_sessions = register_gauge!("active_ndp_sessions", "Active NDP sessions");
        let active_ndp_peers = register_gauge!("active_ndp_peers", "Peers with active NDPs");

        Ok(Self {
            registry,
            enable_requests,
            enable_failures,
            disable_requests,
            implicit_disables,
            rejected_transitions,
            confirms_accepted,
            confirms_rejected,
            end_indications,
            session_underflows,
            commands_activated,
            commands_cancelled,
            commands_timed_out,
            commands_queued,
            transaction_timeouts,
            late_completions,
            active_ndp_sessions,
            active_ndp_peers,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_metrics_registry() {
        let metrics = Metrics::new().expect("metrics");
        metrics.enable_requests.inc();
        metrics.commands_activated.with_label_values(&["initiator"]).inc();
        metrics.active_ndp_sessions.set(2);
        assert!(!metrics.gather().is_empty());
    }
}
