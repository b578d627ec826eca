pub mod dataingest;
pub mod oneagent;
pub mod pipeline;
pub mod reinvocation;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, Namespace, ObjectFieldSelector, Pod, PodSpec, Volume,
    VolumeMount,
};
use tracing::info;

use crate::config::CapabilityName;
use crate::dynakube::DynaKube;
use crate::error::Error;

/// Pod annotation marking a pod that went through the pipeline once.
pub const ANNOTATION_INJECTED: &str = "dynakube.dynatrace.com/injected";
pub const ANNOTATION_FAILURE_POLICY: &str = "oneagent.dynatrace.com/failure-policy";

pub const INSTALL_CONTAINER_NAME: &str = "install-oneagent";
pub const INJECTION_CONFIG_VOLUME_NAME: &str = "injection-config";
pub const SECRET_CONFIG_NAME: &str = "dynatrace-dynakube-config";
pub const CONFIG_DIR_MOUNT: &str = "/mnt/config";

pub const CONTAINERS_COUNT_ENV: &str = "CONTAINERS_COUNT";
pub const FAILURE_POLICY_ENV: &str = "FAILURE_POLICY";
pub const K8S_POD_NAME_ENV: &str = "K8S_PODNAME";
pub const K8S_POD_UID_ENV: &str = "K8S_PODUID";
pub const K8S_BASE_POD_NAME_ENV: &str = "K8S_BASEPODNAME";
pub const K8S_NAMESPACE_ENV: &str = "K8S_NAMESPACE";
pub const K8S_NODE_NAME_ENV: &str = "K8S_NODE_NAME";

/// Shared between mutators; whoever runs first adds it.
pub const DEPLOYMENT_METADATA_ENV: &str = "DT_DEPLOYMENT_METADATA";

/// Env vars and volumes owned by the install container itself rather than
/// by a capability.
pub const INSTALLER_ENV_NAMES: &[&str] = &[
    CONTAINERS_COUNT_ENV,
    FAILURE_POLICY_ENV,
    K8S_POD_NAME_ENV,
    K8S_POD_UID_ENV,
    K8S_BASE_POD_NAME_ENV,
    K8S_NAMESPACE_ENV,
    K8S_NODE_NAME_ENV,
    DEPLOYMENT_METADATA_ENV,
];
pub const INSTALLER_VOLUME_NAMES: &[&str] = &[INJECTION_CONFIG_VOLUME_NAME];

/// State handed to [`PodMutator::mutate`] on first injection.
///
/// The install container is not part of the pod yet; it is appended once all
/// mutators have run.
pub struct MutationRequest<'a> {
    pub pod: &'a mut Pod,
    /// Name used for owner lookups; falls back to the generate name.
    pub pod_name: &'a str,
    pub namespace: &'a Namespace,
    pub dynakube: &'a DynaKube,
    pub init_container: &'a mut Container,
}

impl MutationRequest<'_> {
    pub fn namespace_name(&self) -> &str {
        self.namespace.metadata.name.as_deref().unwrap_or_default()
    }
}

/// State handed to [`PodMutator::reinvoke`] for one application container.
pub struct ReinvocationRequest<'a> {
    pub pod: &'a mut Pod,
    pub dynakube: &'a DynaKube,
    pub container_index: usize,
    init_container_index: Option<usize>,
}

impl<'a> ReinvocationRequest<'a> {
    pub fn new(
        pod: &'a mut Pod,
        dynakube: &'a DynaKube,
        container_index: usize,
        init_container_index: Option<usize>,
    ) -> Self {
        Self {
            pod,
            dynakube,
            container_index,
            init_container_index,
        }
    }

    /// The container being repaired and, when present, the install container.
    pub fn containers_mut(&mut self) -> (&mut Container, Option<&mut Container>) {
        let spec = pod_spec_mut(self.pod);
        let init = match (self.init_container_index, spec.init_containers.as_mut()) {
            (Some(i), Some(init_containers)) => init_containers.get_mut(i),
            _ => None,
        };
        (&mut spec.containers[self.container_index], init)
    }
}

/// One optional injection concern.
///
/// `enabled`, `injected` and `container_injected` only look at the object
/// they are given. Implementations keep no per-request state.
#[async_trait]
pub trait PodMutator: Send + Sync {
    fn name(&self) -> CapabilityName;

    fn enabled(&self, pod: &Pod) -> bool;

    fn injected(&self, pod: &Pod) -> bool;

    fn container_injected(&self, container: &Container) -> bool;

    /// Env var names this mutator writes into any container.
    fn env_var_names(&self) -> &'static [&'static str];

    fn volume_names(&self) -> &'static [&'static str];

    async fn mutate(&self, request: &mut MutationRequest<'_>) -> Result<(), Error>;

    /// Repairs one container. Returns whether anything changed.
    fn reinvoke(&self, request: &mut ReinvocationRequest<'_>) -> bool;
}

pub fn pod_spec_mut(pod: &mut Pod) -> &mut PodSpec {
    pod.spec.get_or_insert_with(PodSpec::default)
}

pub fn containers(pod: &Pod) -> &[Container] {
    pod.spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default()
}

pub fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

pub fn annotation_or<'a>(pod: &'a Pod, key: &str, default: &'a str) -> &'a str {
    annotation(pod, key).unwrap_or(default)
}

/// Reads a boolean annotation. Anything but a case-insensitive `false`
/// or `true` leaves the default in place.
pub fn annotation_bool(pod: &Pod, key: &str, default: bool) -> bool {
    match annotation(pod, key) {
        Some(v) if v.eq_ignore_ascii_case("true") => true,
        Some(v) if v.eq_ignore_ascii_case("false") => false,
        _ => default,
    }
}

pub fn set_annotation(pod: &mut Pod, key: &str, value: &str) {
    pod.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
}

pub fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

/// An env var filled in by the kubelet from a pod field (downward API).
pub fn field_env_var(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                api_version: None,
                field_path: field_path.to_string(),
            }),
            ..Default::default()
        }),
    }
}

pub fn has_env(container: &Container, name: &str) -> bool {
    container
        .env
        .as_ref()
        .is_some_and(|env| env.iter().any(|e| e.name == name))
}

pub fn env_value<'a>(container: &'a Container, name: &str) -> Option<&'a str> {
    container
        .env
        .as_ref()?
        .iter()
        .find(|e| e.name == name)
        .and_then(|e| e.value.as_deref())
}

pub fn add_env(container: &mut Container, vars: impl IntoIterator<Item = EnvVar>) {
    container.env.get_or_insert_with(Vec::new).extend(vars);
}

pub fn add_env_if_missing(container: &mut Container, var: EnvVar) -> bool {
    if has_env(container, &var.name) {
        return false;
    }
    add_env(container, [var]);
    true
}

pub fn has_volume_mount(container: &Container, volume: &str) -> bool {
    container
        .volume_mounts
        .as_ref()
        .is_some_and(|mounts| mounts.iter().any(|m| m.name == volume))
}

pub fn volume_mount(name: &str, mount_path: &str, sub_path: Option<&str>) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        sub_path: sub_path.map(str::to_string),
        ..Default::default()
    }
}

pub fn add_volume_mounts(container: &mut Container, mounts: impl IntoIterator<Item = VolumeMount>) {
    container
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .extend(mounts);
}

pub fn add_volumes(pod: &mut Pod, volumes: impl IntoIterator<Item = Volume>) {
    pod_spec_mut(pod)
        .volumes
        .get_or_insert_with(Vec::new)
        .extend(volumes);
}

/// Records an application container on the install container as
/// `CONTAINER_<number>_NAME` / `CONTAINER_<number>_IMAGE`. `number` is
/// 1-based. Does nothing if the container is already recorded.
pub fn add_container_info_env(init_container: &mut Container, number: usize, container: &Container) -> bool {
    let name_key = format!("CONTAINER_{number}_NAME");
    if has_env(init_container, &name_key) {
        return false;
    }
    info!(
        container_name = %container.name,
        container_image = container.image.as_deref().unwrap_or_default(),
        "updating init container with new container"
    );
    add_env(
        init_container,
        [
            env_var(&name_key, container.name.clone()),
            env_var(
                &format!("CONTAINER_{number}_IMAGE"),
                container.image.clone().unwrap_or_default(),
            ),
        ],
    );
    true
}

/// Value of `DT_DEPLOYMENT_METADATA` for containers monitored through the
/// given DynaKube.
pub fn deployment_metadata(dynakube: &DynaKube, cluster_id: &str) -> String {
    let mode = if dynakube.cloud_native_fullstack_mode() {
        "cloud_native_fullstack"
    } else {
        "application_monitoring"
    };
    format!(
        "orchestration_tech=Operator-{mode};script_version={};orchestrator_id={cluster_id}",
        env!("CARGO_PKG_VERSION")
    )
}
