//! In-memory stand-ins for the cluster and event sink, plus fixtures.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Namespace, ObjectReference, Pod, PodSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::admission::{AdmissionRequest, AdmissionReview};
use kube::core::DynamicObject;
use kube::runtime::events::EventType;
use serde_json::json;

use crate::cluster::{Cluster, OwnedObject};
use crate::dynakube::{
    ANNOTATION_FEATURE_REINVOCATION, ApplicationMonitoringSpec, DynaKube, DynaKubeSpec,
    INSTANCE_LABEL, OneAgentSpec,
};
use crate::error::ClusterError;
use crate::events::EventPublisher;

pub const OPERATOR_NAMESPACE: &str = "dynatrace";

fn unavailable() -> ClusterError {
    ClusterError::Timeout(Duration::from_secs(1))
}

#[derive(Default)]
pub struct FakeCluster {
    namespaces: Mutex<HashMap<String, Namespace>>,
    dynakubes: Mutex<HashMap<(String, String), DynaKube>>,
    secrets: Mutex<HashMap<(String, String), Secret>>,
    owners: Mutex<HashMap<(String, String), OwnedObject>>,
    owner_reads: AtomicUsize,
    pub fail_namespaces: AtomicBool,
    /// Namespace reads never complete.
    pub hang_namespaces: AtomicBool,
    pub fail_dynakubes: AtomicBool,
    pub fail_secrets: AtomicBool,
}

impl FakeCluster {
    pub fn add_namespace(&self, name: &str, dynakube: Option<&str>) {
        let mut ns = Namespace::default();
        ns.metadata.name = Some(name.to_string());
        if let Some(dk) = dynakube {
            ns.metadata.labels = Some(BTreeMap::from([(INSTANCE_LABEL.to_string(), dk.to_string())]));
        }
        self.namespaces.lock().unwrap().insert(name.to_string(), ns);
    }

    pub fn add_dynakube(&self, dynakube: DynaKube) {
        let key = (
            dynakube.metadata.namespace.clone().unwrap_or_default(),
            dynakube.name().to_string(),
        );
        self.dynakubes.lock().unwrap().insert(key, dynakube);
    }

    pub fn add_secret(&self, namespace: &str, secret: Secret) {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name), secret);
    }

    pub fn get_secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn add_owner(&self, object: OwnedObject) {
        self.owners
            .lock()
            .unwrap()
            .insert((object.kind.clone(), object.name.clone()), object);
    }

    pub fn owner_reads(&self) -> usize {
        self.owner_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError> {
        if self.fail_namespaces.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        if self.hang_namespaces.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(self.namespaces.lock().unwrap().get(name).cloned())
    }

    async fn dynakube(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynaKube>, ClusterError> {
        if self.fail_dynakubes.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(self
            .dynakubes
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, ClusterError> {
        if self.fail_secrets.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(self.get_secret(namespace, name))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClusterError> {
        if self.fail_secrets.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.add_secret(namespace, secret.clone());
        Ok(())
    }

    async fn owner(
        &self,
        owner: &OwnerReference,
        _namespace: &str,
    ) -> Result<OwnedObject, ClusterError> {
        self.owner_reads.fetch_add(1, Ordering::SeqCst);
        self.owners
            .lock()
            .unwrap()
            .get(&(owner.kind.clone(), owner.name.clone()))
            .cloned()
            .ok_or_else(unavailable)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub type_: String,
    pub reason: String,
    pub note: String,
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, _regarding: &ObjectReference, type_: EventType, reason: &str, note: String) {
        self.events.lock().unwrap().push(RecordedEvent {
            type_: format!("{type_:?}"),
            reason: reason.to_string(),
            note,
        });
    }
}

pub fn owner_ref(name: &str, kind: &str, api_version: &str, controller: bool) -> OwnerReference {
    OwnerReference {
        name: name.to_string(),
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        controller: Some(controller),
        uid: format!("uid-{name}"),
        ..Default::default()
    }
}

pub fn owned(name: &str, kind: &str, api_version: &str, owners: Vec<OwnerReference>) -> OwnedObject {
    OwnedObject {
        name: name.to_string(),
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        namespace: "ns".to_string(),
        owner_references: owners,
    }
}

pub fn dynakube(name: &str, reinvocation: bool) -> DynaKube {
    let mut dk = DynaKube::new(
        name,
        DynaKubeSpec {
            api_url: "https://tenant.live.dynatrace.com/api".to_string(),
            one_agent: OneAgentSpec {
                application_monitoring: Some(ApplicationMonitoringSpec::default()),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    dk.metadata.namespace = Some(OPERATOR_NAMESPACE.to_string());
    if reinvocation {
        dk.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_FEATURE_REINVOCATION.to_string(),
            "true".to_string(),
        )]));
    }
    dk
}

pub fn container(name: &str, image: &str) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        ..Default::default()
    }
}

/// A pod with `count` application containers named `app-0`, `app-1`, ...
pub fn pod_with_containers(count: usize) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.generate_name = Some("web-5d9f-".to_string());
    pod.metadata.name = Some("web-5d9f-abcde".to_string());
    pod.spec = Some(PodSpec {
        containers: (0..count)
            .map(|i| container(&format!("app-{i}"), &format!("registry.local/app-{i}:1.0")))
            .collect(),
        ..Default::default()
    });
    pod
}

pub fn admission_request(pod: &Pod, namespace: &str) -> AdmissionRequest<DynamicObject> {
    let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": {"group": "", "version": "v1", "kind": "Pod"},
            "resource": {"group": "", "version": "v1", "resource": "pods"},
            "name": pod.metadata.name.clone().unwrap_or_default(),
            "namespace": namespace,
            "operation": "CREATE",
            "userInfo": {"username": "system:serviceaccount:kube-system:replicaset-controller"},
            "object": pod,
            "oldObject": null,
            "dryRun": false,
        }
    }))
    .unwrap();
    review.try_into().unwrap()
}
