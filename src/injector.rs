//! Admission handling for pods: decides whether a pod gets the agent, runs
//! the mutators or the repair pass, and turns the result into a response.
//!
//! A pod is never denied. Anything that goes wrong ends in an allowed
//! response without a patch and a warning naming the pod.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Container, Namespace, Pod, SecretVolumeSource, Volume};
use kube::Resource;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::runtime::events::EventType;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::config::CapabilityName;
use crate::dynakube::{DynaKube, INSTANCE_LABEL};
use crate::error::Error;
use crate::events::{EventPublisher, dynakube_reference, reasons};
use crate::mutation::pipeline::MutationPipeline;
use crate::mutation::{
    ANNOTATION_FAILURE_POLICY, ANNOTATION_INJECTED, CONFIG_DIR_MOUNT, CONTAINERS_COUNT_ENV,
    FAILURE_POLICY_ENV, INJECTION_CONFIG_VOLUME_NAME, INSTALL_CONTAINER_NAME, K8S_BASE_POD_NAME_ENV,
    K8S_NAMESPACE_ENV, K8S_NODE_NAME_ENV, K8S_POD_NAME_ENV, K8S_POD_UID_ENV, MutationRequest,
    SECRET_CONFIG_NAME, add_volumes, annotation, containers, env_var, field_env_var, pod_spec_mut,
    reinvocation, set_annotation, volume_mount,
};
use crate::patch::build_patch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Injected,
    Repaired,
    /// Already injected and nothing to repair.
    Unchanged,
    NotOptedIn,
    SoftFailed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Injected => "injected",
            Outcome::Repaired => "repaired",
            Outcome::Unchanged => "unchanged",
            Outcome::NotOptedIn => "not_opted_in",
            Outcome::SoftFailed => "soft_failed",
        }
    }
}

pub struct Handled {
    pub response: AdmissionResponse,
    pub outcome: Outcome,
    /// Capabilities applied or repaired by this request.
    pub mutators: Vec<CapabilityName>,
}

impl Handled {
    fn empty(req: &AdmissionRequest<DynamicObject>, outcome: Outcome) -> Self {
        Self {
            response: AdmissionResponse::from(req),
            outcome,
            mutators: Vec::new(),
        }
    }
}

pub struct PodInjector {
    cluster: Arc<dyn Cluster>,
    events: Arc<dyn EventPublisher>,
    pipeline: MutationPipeline,
    image: String,
    operator_namespace: String,
    deadline: Duration,
}

impl PodInjector {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        events: Arc<dyn EventPublisher>,
        pipeline: MutationPipeline,
        image: String,
        operator_namespace: String,
        deadline: Duration,
    ) -> Self {
        Self {
            cluster,
            events,
            pipeline,
            image,
            operator_namespace,
            deadline,
        }
    }

    pub async fn handle(&self, req: &AdmissionRequest<DynamicObject>) -> Handled {
        let (original, mut pod) = match decode_pod(req) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(uid = %req.uid, "failed to decode the request for pod injection: {e}");
                return soft_fail(req, &req.name, &e);
            }
        };
        let pod_name = display_name(&pod, &req.name);

        // Dropping the injection future on expiry cancels its outstanding
        // API calls.
        let injected =
            tokio::time::timeout(self.deadline, self.inject(req, &original, &mut pod, &pod_name))
                .await
                .unwrap_or_else(|_| Err(Error::Deadline(self.deadline)));

        match injected {
            Ok(handled) => handled,
            Err(e) => soft_fail(req, &pod_name, &e),
        }
    }

    async fn inject(
        &self,
        req: &AdmissionRequest<DynamicObject>,
        original: &Value,
        pod: &mut Pod,
        pod_name: &str,
    ) -> Result<Handled, Error> {
        let ns_name = req.namespace.as_deref().ok_or(Error::MissingNamespace)?;
        let namespace = self.namespace(ns_name).await?;

        let Some(dk_name) = namespace
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(INSTANCE_LABEL))
        else {
            debug!(namespace = ns_name, "namespace not assigned to a DynaKube");
            return Ok(Handled::empty(req, Outcome::NotOptedIn));
        };

        let dynakube = self.dynakube(dk_name, ns_name).await?;
        if !dynakube.need_app_injection() {
            return Ok(Handled::empty(req, Outcome::NotOptedIn));
        }

        info!(
            name = pod.metadata.name.as_deref().unwrap_or_default(),
            generated_name = pod.metadata.generate_name.as_deref().unwrap_or_default(),
            namespace = ns_name,
            "injecting into pod"
        );

        if annotation(pod, ANNOTATION_INJECTED).is_some_and(|v| !v.is_empty()) {
            if !dynakube.feature_enable_webhook_reinvocation_policy() {
                return Ok(Handled::empty(req, Outcome::Unchanged));
            }
            return self.repair(req, original, pod, &dynakube, ns_name).await;
        }

        if !self.pipeline.any_enabled(pod) {
            return Ok(Handled::empty(req, Outcome::NotOptedIn));
        }

        let mut install_container = self.install_container(pod, &dynakube);
        add_volumes(pod, [injection_config_volume()]);

        let owner_name = pod
            .metadata
            .name
            .clone()
            .or_else(|| pod.metadata.generate_name.clone())
            .unwrap_or_default();
        let mut request = MutationRequest {
            pod: &mut *pod,
            pod_name: &owner_name,
            namespace: &namespace,
            dynakube: &dynakube,
            init_container: &mut install_container,
        };
        let applied = self.pipeline.mutate(&mut request).await?;

        pod_spec_mut(pod)
            .init_containers
            .get_or_insert_with(Vec::new)
            .push(install_container);
        set_annotation(pod, ANNOTATION_INJECTED, "true");

        let note = format!(
            "Injecting the necessary info into pod {} in namespace {ns_name}",
            base_pod_name(pod)
        );
        let response = self
            .respond(req, original, pod, &dynakube, reasons::INJECT, note)
            .await?;
        Ok(Handled {
            response,
            outcome: Outcome::Injected,
            mutators: applied,
        })
    }

    async fn repair(
        &self,
        req: &AdmissionRequest<DynamicObject>,
        original: &Value,
        pod: &mut Pod,
        dynakube: &DynaKube,
        ns_name: &str,
    ) -> Result<Handled, Error> {
        let result = reinvocation::reinvoke(self.pipeline.mutators(), pod, dynakube);
        if !result.updated() {
            return Ok(Handled::empty(req, Outcome::Unchanged));
        }

        info!(namespace = ns_name, "updating pod with missing containers");
        let note = format!(
            "Updating pod {} in namespace {ns_name} with missing containers",
            pod.metadata.generate_name.as_deref().unwrap_or_default()
        );
        let response = self
            .respond(req, original, pod, dynakube, reasons::UPDATE_POD, note)
            .await?;
        Ok(Handled {
            response,
            outcome: Outcome::Repaired,
            mutators: result.capabilities(),
        })
    }

    /// Encodes the patch, then reports the change on the DynaKube. No event
    /// is published for a patch that cannot be encoded.
    async fn respond(
        &self,
        req: &AdmissionRequest<DynamicObject>,
        original: &Value,
        pod: &Pod,
        dynakube: &DynaKube,
        reason: &str,
        note: String,
    ) -> Result<AdmissionResponse, Error> {
        let response = patched_response(req, original, pod)?;
        self.events
            .publish(&dynakube.object_ref(&()), EventType::Normal, reason, note)
            .await;
        Ok(response)
    }

    async fn namespace(&self, name: &str) -> Result<Namespace, Error> {
        match self.cluster.namespace(name).await {
            Ok(Some(ns)) => Ok(ns),
            Ok(None) => Err(Error::NamespaceNotFound(name.to_string())),
            Err(source) => {
                warn!(namespace = name, "failed to query the namespace before pod injection: {source}");
                Err(Error::NamespaceLookup {
                    namespace: name.to_string(),
                    source,
                })
            }
        }
    }

    async fn dynakube(&self, name: &str, pod_namespace: &str) -> Result<DynaKube, Error> {
        match self.cluster.dynakube(name, &self.operator_namespace).await {
            Ok(Some(dk)) => Ok(dk),
            Ok(None) => {
                let err = Error::DynaKubeMissing {
                    namespace: pod_namespace.to_string(),
                    name: name.to_string(),
                };
                self.events
                    .publish(
                        &dynakube_reference(name, &self.operator_namespace),
                        EventType::Warning,
                        reasons::MISSING_CONFIG,
                        err.to_string(),
                    )
                    .await;
                Err(err)
            }
            Err(source) => Err(Error::DynaKubeLookup {
                name: name.to_string(),
                source,
            }),
        }
    }

    fn install_container(&self, pod: &Pod, dynakube: &DynaKube) -> Container {
        let app_containers = containers(pod);
        Container {
            name: INSTALL_CONTAINER_NAME.to_string(),
            image: Some(self.image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            args: Some(vec!["init".to_string()]),
            env: Some(vec![
                env_var(CONTAINERS_COUNT_ENV, app_containers.len().to_string()),
                env_var(FAILURE_POLICY_ENV, failure_policy(pod)),
                field_env_var(K8S_POD_NAME_ENV, "metadata.name"),
                field_env_var(K8S_POD_UID_ENV, "metadata.uid"),
                env_var(K8S_BASE_POD_NAME_ENV, base_pod_name(pod)),
                field_env_var(K8S_NAMESPACE_ENV, "metadata.namespace"),
                field_env_var(K8S_NODE_NAME_ENV, "spec.nodeName"),
            ]),
            security_context: app_containers
                .first()
                .and_then(|c| c.security_context.clone()),
            volume_mounts: Some(vec![volume_mount(
                INJECTION_CONFIG_VOLUME_NAME,
                CONFIG_DIR_MOUNT,
                None,
            )]),
            resources: dynakube.init_resources(),
            ..Default::default()
        }
    }
}

fn decode_pod(req: &AdmissionRequest<DynamicObject>) -> Result<(Value, Pod), Error> {
    let original = serde_json::to_value(&req.object).map_err(Error::Decode)?;
    let pod = serde_json::from_value(original.clone()).map_err(Error::Decode)?;
    Ok((original, pod))
}

fn display_name(pod: &Pod, fallback: &str) -> String {
    pod.metadata
        .name
        .as_deref()
        .or(pod.metadata.generate_name.as_deref())
        .filter(|n| !n.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

fn patched_response(
    req: &AdmissionRequest<DynamicObject>,
    original: &Value,
    pod: &Pod,
) -> Result<AdmissionResponse, Error> {
    let response = AdmissionResponse::from(req);
    match build_patch(original, pod)? {
        Some(patch) => Ok(response.with_patch(patch)?),
        None => Ok(response),
    }
}

fn soft_fail(req: &AdmissionRequest<DynamicObject>, pod_name: &str, err: &Error) -> Handled {
    warn!(pod = pod_name, "injection failed, admitting pod unchanged: {err}");
    let mut response = AdmissionResponse::from(req);
    response.warnings = Some(vec![format!(
        "Failed to inject into pod: {pod_name} because {err}"
    )]);
    Handled {
        response,
        outcome: Outcome::SoftFailed,
        mutators: Vec::new(),
    }
}

/// The installer config secret may not exist yet when the pod is scheduled.
fn injection_config_volume() -> Volume {
    Volume {
        name: INJECTION_CONFIG_VOLUME_NAME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(SECRET_CONFIG_NAME.to_string()),
            optional: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `fail` stays `fail`; anything else, including no annotation, is `silent`.
fn failure_policy(pod: &Pod) -> &'static str {
    match annotation(pod, ANNOTATION_FAILURE_POLICY) {
        Some("fail") => "fail",
        _ => "silent",
    }
}

/// The generate name (or name) up to, not including, its last `-`.
fn base_pod_name(pod: &Pod) -> &str {
    let name = pod
        .metadata
        .generate_name
        .as_deref()
        .filter(|n| !n.is_empty())
        .or(pod.metadata.name.as_deref())
        .unwrap_or_default();
    match name.rfind('-') {
        Some(i) => &name[..i],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use json_patch::Patch;
    use serde_json::json;

    use super::*;
    use crate::dynakube::DynaKubeSpec;
    use crate::mutation::dataingest::DataIngestMutator;
    use crate::mutation::oneagent::{OneAgentMutator, PRELOAD_ENV};
    use crate::mutation::{add_env, env_value, has_env};
    use crate::testing::{
        FakeCluster, OPERATOR_NAMESPACE, RecordingPublisher, admission_request, container,
        dynakube, pod_with_containers,
    };

    const INSTALLER_IMAGE: &str = "registry.local/dynatrace-operator:1.0";

    struct Fixture {
        cluster: Arc<FakeCluster>,
        events: Arc<RecordingPublisher>,
        injector: PodInjector,
    }

    fn fixture() -> Fixture {
        fixture_with_deadline(Duration::from_secs(5))
    }

    fn fixture_with_deadline(deadline: Duration) -> Fixture {
        let cluster = Arc::new(FakeCluster::default());
        let events = Arc::new(RecordingPublisher::default());
        let pipeline = MutationPipeline::new(vec![
            Arc::new(OneAgentMutator::new(cluster.clone(), "cluster-uid".into())),
            Arc::new(DataIngestMutator::new(cluster.clone(), "cluster-uid".into())),
        ])
        .unwrap();
        let injector = PodInjector::new(
            cluster.clone(),
            events.clone(),
            pipeline,
            INSTALLER_IMAGE.to_string(),
            OPERATOR_NAMESPACE.to_string(),
            deadline,
        );
        Fixture {
            cluster,
            events,
            injector,
        }
    }

    fn apply(pod: &Pod, response: &AdmissionResponse) -> Pod {
        let patch: Patch = serde_json::from_slice(response.patch.as_ref().unwrap()).unwrap();
        let mut doc = serde_json::to_value(pod).unwrap();
        json_patch::patch(&mut doc, &patch.0).unwrap();
        serde_json::from_value(doc).unwrap()
    }

    fn init_container(pod: &Pod) -> &Container {
        pod.spec
            .as_ref()
            .unwrap()
            .init_containers
            .as_ref()
            .unwrap()
            .iter()
            .find(|c| c.name == INSTALL_CONTAINER_NAME)
            .unwrap()
    }

    fn assert_soft_failed(handled: &Handled) {
        assert_eq!(handled.outcome, Outcome::SoftFailed);
        assert!(handled.response.allowed);
        assert!(handled.response.patch.is_none());
        let warnings = handled.response.warnings.as_ref().unwrap();
        assert!(warnings[0].starts_with("Failed to inject into pod: "));
    }

    #[tokio::test]
    async fn test_namespace_without_label_is_left_alone() {
        let f = fixture();
        f.cluster.add_namespace("apps", None);
        let pod = pod_with_containers(1);

        let handled = f.injector.handle(&admission_request(&pod, "apps")).await;
        assert_eq!(handled.outcome, Outcome::NotOptedIn);
        assert!(handled.response.allowed);
        assert!(handled.response.patch.is_none());
        assert!(f.events.events().is_empty());
    }

    #[tokio::test]
    async fn test_missing_dynakube_emits_warning_event() {
        let f = fixture();
        f.cluster.add_namespace("apps", Some("dk1"));
        let pod = pod_with_containers(1);

        let handled = f.injector.handle(&admission_request(&pod, "apps")).await;
        assert_soft_failed(&handled);

        let events = f.events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].type_, "Warning");
        assert_eq!(events[0].reason, reasons::MISSING_CONFIG);
        assert!(events[0].note.contains("'apps'"));
        assert!(events[0].note.contains("'dk1'"));
    }

    #[tokio::test]
    async fn test_already_injected_without_reinvocation() {
        let f = fixture();
        f.cluster.add_namespace("apps", Some("dk1"));
        f.cluster.add_dynakube(dynakube("dk1", false));
        let mut pod = pod_with_containers(2);
        set_annotation(&mut pod, ANNOTATION_INJECTED, "true");

        let handled = f.injector.handle(&admission_request(&pod, "apps")).await;
        assert_eq!(handled.outcome, Outcome::Unchanged);
        assert!(handled.response.patch.is_none());
        assert!(f.events.events().is_empty());
    }

    #[tokio::test]
    async fn test_reinvocation_repairs_new_container() {
        let f = fixture();
        f.cluster.add_namespace("apps", Some("dk1"));
        f.cluster.add_dynakube(dynakube("dk1", true));

        let mut pod = pod_with_containers(3);
        set_annotation(&mut pod, ANNOTATION_INJECTED, "true");
        set_annotation(&mut pod, "oneagent.dynatrace.com/injected", "true");
        set_annotation(&mut pod, "data-ingest.dynatrace.com/inject", "false");
        let spec = pod_spec_mut(&mut pod);
        for c in spec.containers.iter_mut().take(2) {
            add_env(c, [env_var(PRELOAD_ENV, "/opt/dynatrace/oneagent-paas/agent/lib64/liboneagentproc.so")]);
        }
        let mut install = container(INSTALL_CONTAINER_NAME, INSTALLER_IMAGE);
        add_env(&mut install, [env_var(CONTAINERS_COUNT_ENV, "2")]);
        spec.init_containers = Some(vec![install]);

        let handled = f.injector.handle(&admission_request(&pod, "apps")).await;
        assert_eq!(handled.outcome, Outcome::Repaired);
        assert_eq!(handled.mutators, vec![CapabilityName::OneAgent]);

        let patched = apply(&pod, &handled.response);
        let (before, after) = (pod.spec.as_ref().unwrap(), patched.spec.as_ref().unwrap());
        assert_eq!(after.containers[0], before.containers[0]);
        assert_eq!(after.containers[1], before.containers[1]);
        assert!(has_env(&after.containers[2], PRELOAD_ENV));

        let install = init_container(&patched);
        assert_eq!(env_value(install, "CONTAINER_3_NAME"), Some("app-2"));
        assert_eq!(env_value(install, "CONTAINER_3_IMAGE"), Some("registry.local/app-2:1.0"));
        assert_eq!(env_value(install, CONTAINERS_COUNT_ENV), Some("3"));

        let events = f.events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, reasons::UPDATE_POD);
        assert_eq!(events[0].type_, "Normal");
    }

    #[tokio::test]
    async fn test_fresh_injection() {
        let f = fixture();
        f.cluster.add_namespace("apps", Some("dk1"));
        f.cluster.add_dynakube(dynakube("dk1", false));

        let mut pod = pod_with_containers(2);
        add_env(&mut pod_spec_mut(&mut pod).containers[1], [env_var("USER_VAR", "keep")]);
        set_annotation(&mut pod, ANNOTATION_FAILURE_POLICY, "fail");

        let handled = f.injector.handle(&admission_request(&pod, "apps")).await;
        assert_eq!(handled.outcome, Outcome::Injected);
        assert_eq!(handled.mutators, CapabilityName::ALL.to_vec());
        assert!(handled.response.allowed);

        let patched = apply(&pod, &handled.response);
        assert_eq!(
            annotation(&patched, ANNOTATION_INJECTED),
            Some("true")
        );
        let spec = patched.spec.as_ref().unwrap();
        let volumes: Vec<_> = spec.volumes.as_ref().unwrap().iter().map(|v| v.name.as_str()).collect();
        assert_eq!(
            volumes,
            vec![
                INJECTION_CONFIG_VOLUME_NAME,
                "oneagent-bin",
                "oneagent-share",
                "data-ingest-enrichment",
                "data-ingest-endpoint",
            ]
        );
        assert_eq!(env_value(&spec.containers[1], "USER_VAR"), Some("keep"));
        assert!(spec.containers.iter().all(|c| has_env(c, PRELOAD_ENV)));

        let install = init_container(&patched);
        assert_eq!(install.image.as_deref(), Some(INSTALLER_IMAGE));
        assert_eq!(install.args, Some(vec!["init".to_string()]));
        assert_eq!(env_value(install, CONTAINERS_COUNT_ENV), Some("2"));
        assert_eq!(env_value(install, FAILURE_POLICY_ENV), Some("fail"));
        assert_eq!(env_value(install, K8S_BASE_POD_NAME_ENV), Some("web-5d9f"));
        let bookkeeping = install
            .env
            .as_ref()
            .unwrap()
            .iter()
            .filter(|e| e.name.starts_with("CONTAINER_"))
            .count();
        assert_eq!(bookkeeping, 4);

        let events = f.events.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, reasons::INJECT);
        assert!(events[0].note.contains("web-5d9f in namespace apps"));
    }

    #[tokio::test]
    async fn test_all_mutators_disabled() {
        let f = fixture();
        f.cluster.add_namespace("apps", Some("dk1"));
        f.cluster.add_dynakube(dynakube("dk1", false));
        let mut pod = pod_with_containers(1);
        set_annotation(&mut pod, "oneagent.dynatrace.com/inject", "false");
        set_annotation(&mut pod, "data-ingest.dynatrace.com/inject", "false");

        let handled = f.injector.handle(&admission_request(&pod, "apps")).await;
        assert_eq!(handled.outcome, Outcome::NotOptedIn);
        assert!(handled.response.patch.is_none());
    }

    #[tokio::test]
    async fn test_dynakube_without_app_injection() {
        let f = fixture();
        f.cluster.add_namespace("apps", Some("dk1"));
        let mut dk = DynaKube::new("dk1", DynaKubeSpec::default());
        dk.metadata.namespace = Some(OPERATOR_NAMESPACE.to_string());
        f.cluster.add_dynakube(dk);

        let handled = f
            .injector
            .handle(&admission_request(&pod_with_containers(1), "apps"))
            .await;
        assert_eq!(handled.outcome, Outcome::NotOptedIn);
    }

    #[tokio::test]
    async fn test_secret_failure_soft_fails() {
        let f = fixture();
        f.cluster.add_namespace("apps", Some("dk1"));
        f.cluster.add_dynakube(dynakube("dk1", false));
        f.cluster.fail_secrets.store(true, Ordering::SeqCst);

        let handled = f
            .injector
            .handle(&admission_request(&pod_with_containers(1), "apps"))
            .await;
        assert_soft_failed(&handled);
        assert!(handled.response.warnings.as_ref().unwrap()[0].contains("web-5d9f-abcde"));
        assert!(f.events.events().is_empty());
    }

    #[tokio::test]
    async fn test_namespace_lookup_failure_soft_fails() {
        let f = fixture();
        f.cluster.fail_namespaces.store(true, Ordering::SeqCst);

        let handled = f
            .injector
            .handle(&admission_request(&pod_with_containers(1), "apps"))
            .await;
        assert_soft_failed(&handled);
    }

    #[tokio::test]
    async fn test_undecodable_pod_soft_fails() {
        let f = fixture();
        let mut req = admission_request(&pod_with_containers(1), "apps");
        let mut object = req.object.take().unwrap();
        object.data = json!({"spec": {"containers": "not-a-list"}});
        req.object = Some(object);

        let handled = f.injector.handle(&req).await;
        assert_soft_failed(&handled);
    }

    #[test]
    fn test_base_pod_name() {
        let mut pod = Pod::default();
        pod.metadata.generate_name = Some("web-5d9f-".to_string());
        assert_eq!(base_pod_name(&pod), "web-5d9f");
        pod.metadata.generate_name = None;
        pod.metadata.name = Some("standalone".to_string());
        assert_eq!(base_pod_name(&pod), "standalone");
    }

    #[test]
    fn test_failure_policy() {
        let mut pod = Pod::default();
        assert_eq!(failure_policy(&pod), "silent");
        set_annotation(&mut pod, ANNOTATION_FAILURE_POLICY, "fail");
        assert_eq!(failure_policy(&pod), "fail");
        set_annotation(&mut pod, ANNOTATION_FAILURE_POLICY, "Fail");
        assert_eq!(failure_policy(&pod), "silent");
    }

    #[tokio::test]
    async fn test_no_event_when_patch_cannot_be_encoded() {
        let f = fixture();
        let dk = dynakube("dk1", false);
        let pod = pod_with_containers(1);
        let req = admission_request(&pod, "apps");

        let broken = json!({"spec": {"containers": "not-a-list"}});
        let result = f
            .injector
            .respond(&req, &broken, &pod, &dk, reasons::INJECT, "injecting".to_string())
            .await;
        assert!(matches!(result, Err(Error::Decode(_))));
        assert!(f.events.events().is_empty());

        let original = serde_json::to_value(&pod).unwrap();
        f.injector
            .respond(&req, &original, &pod, &dk, reasons::INJECT, "injecting".to_string())
            .await
            .unwrap();
        assert_eq!(f.events.events().len(), 1);
    }

    #[tokio::test]
    async fn test_deadline_soft_fails() {
        let f = fixture_with_deadline(Duration::from_millis(20));
        f.cluster.add_namespace("apps", Some("dk1"));
        f.cluster.add_dynakube(dynakube("dk1", false));
        f.cluster.hang_namespaces.store(true, Ordering::SeqCst);
        let pod = pod_with_containers(1);

        let handled = f.injector.handle(&admission_request(&pod, "apps")).await;

        assert_eq!(handled.outcome, Outcome::SoftFailed);
        assert!(handled.response.patch.is_none());
        assert_eq!(
            handled.response.warnings.unwrap(),
            vec!["Failed to inject into pod: web-5d9f-abcde because injection did not finish within 20ms".to_string()]
        );
        assert!(f.events.events().is_empty());
    }
}
