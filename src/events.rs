//! Kubernetes Events emitted while injecting.
//!
//! Publishing is fire-and-forget: a failed event is logged and never turns
//! into an admission failure.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

pub mod reasons {
    /// The namespace points at a DynaKube that does not exist.
    pub const MISSING_CONFIG: &str = "MissingConfig";
    pub const INJECT: &str = "Inject";
    pub const UPDATE_POD: &str = "UpdatePod";
}

const ACTION: &str = "Admission";

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, regarding: &ObjectReference, type_: EventType, reason: &str, note: String);
}

pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, regarding: &ObjectReference, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: ACTION.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, regarding).await {
            warn!(reason, error = %e, "failed to publish event");
        }
    }
}

/// Reference to a DynaKube that could not be read, so events about it still
/// have an object to hang on.
pub fn dynakube_reference(name: &str, namespace: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("dynatrace.com/v1beta1".to_string()),
        kind: Some("DynaKube".to_string()),
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}
