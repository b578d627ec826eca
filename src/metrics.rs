use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::config::CapabilityName;
use crate::mutation::PodMutator;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub webhook: &'static str,
    pub outcome: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MutatorLabels {
    pub mutator: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WebhookLabels {
    pub webhook: &'static str,
}

pub struct InjectorMetrics {
    pub admission_requests_total: Family<OutcomeLabels, Counter>,
    pub mutator_invocations_total: Family<MutatorLabels, Counter>,
    pub admission_request_duration_seconds: Family<WebhookLabels, Histogram>,
}

const DURATION_BUCKETS: [f64; 12] = [
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0,
];

fn new_duration_histogram() -> Histogram {
    Histogram::new(DURATION_BUCKETS.iter().copied())
}

impl InjectorMetrics {
    pub fn new(registry: &mut Registry, mutators: &[Arc<dyn PodMutator>]) -> Self {
        let admission_requests_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "dynakube_webhook_admission_requests",
            "Admission requests handled, by webhook and outcome",
            admission_requests_total.clone(),
        );

        let mutator_invocations_total = Family::<MutatorLabels, Counter>::default();
        registry.register(
            "dynakube_webhook_mutator_invocations",
            "Pods a capability mutator was applied to, fresh or repaired",
            mutator_invocations_total.clone(),
        );

        let admission_request_duration_seconds =
            Family::<WebhookLabels, Histogram>::new_with_constructor(new_duration_histogram);
        registry.register(
            "dynakube_webhook_admission_request_duration_seconds",
            "Duration of admission request processing in seconds",
            admission_request_duration_seconds.clone(),
        );

        let mutators_registered = Family::<MutatorLabels, Gauge>::default();
        registry.register(
            "dynakube_webhook_mutators_registered",
            "Whether each capability mutator is registered (1) or not (0)",
            mutators_registered.clone(),
        );
        for name in CapabilityName::ALL {
            let registered = mutators.iter().any(|m| m.name() == name);
            mutators_registered
                .get_or_create(&MutatorLabels {
                    mutator: name.as_str(),
                })
                .set(if registered { 1 } else { 0 });
        }

        Self {
            admission_requests_total,
            mutator_invocations_total,
            admission_request_duration_seconds,
        }
    }

    pub fn record_outcome(&self, webhook: &'static str, outcome: &'static str) {
        self.admission_requests_total
            .get_or_create(&OutcomeLabels { webhook, outcome })
            .inc();
    }

    pub fn record_mutators(&self, applied: &[CapabilityName]) {
        for name in applied {
            self.mutator_invocations_total
                .get_or_create(&MutatorLabels {
                    mutator: name.as_str(),
                })
                .inc();
        }
    }

    pub fn observe_duration(&self, webhook: &'static str, seconds: f64) {
        self.admission_request_duration_seconds
            .get_or_create(&WebhookLabels { webhook })
            .observe(seconds);
    }
}
