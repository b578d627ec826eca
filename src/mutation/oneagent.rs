use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    CSIVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, Pod, Secret,
    SecretKeySelector, Volume,
};
use tracing::{error, info, warn};

use crate::cluster::Cluster;
use crate::config::CapabilityName;
use crate::dynakube::DynaKube;
use crate::error::{ClusterError, Error};

use super::{
    DEPLOYMENT_METADATA_ENV, MutationRequest, PodMutator, ReinvocationRequest, SECRET_CONFIG_NAME,
    add_container_info_env, add_env, add_env_if_missing, add_volume_mounts, add_volumes,
    annotation_bool, annotation_or, deployment_metadata, env_var, has_env, pod_spec_mut,
    set_annotation, volume_mount,
};

pub const ANNOTATION_INJECT: &str = "oneagent.dynatrace.com/inject";
pub const ANNOTATION_INJECTED: &str = "oneagent.dynatrace.com/injected";
pub const ANNOTATION_INSTALL_PATH: &str = "oneagent.dynatrace.com/install-path";
pub const ANNOTATION_FLAVOR: &str = "oneagent.dynatrace.com/flavor";
pub const ANNOTATION_TECHNOLOGIES: &str = "oneagent.dynatrace.com/technologies";
pub const ANNOTATION_INSTALLER_URL: &str = "oneagent.dynatrace.com/installer-url";

pub const DEFAULT_INSTALL_PATH: &str = "/opt/dynatrace/oneagent-paas";
const DEFAULT_FLAVOR: &str = "default";
const DEFAULT_TECHNOLOGIES: &str = "all";

/// Marks a container as instrumented.
pub const PRELOAD_ENV: &str = "LD_PRELOAD";
pub const PROXY_ENV: &str = "DT_PROXY";
pub const NETWORK_ZONE_ENV: &str = "DT_NETWORK_ZONE";
const FLAVOR_ENV: &str = "FLAVOR";
const TECHNOLOGIES_ENV: &str = "TECHNOLOGIES";
const INSTALL_PATH_ENV: &str = "INSTALLPATH";
const INSTALLER_URL_ENV: &str = "INSTALLER_URL";
const MODE_ENV: &str = "MODE";
const ONEAGENT_INJECTED_ENV: &str = "ONEAGENT_INJECTED";

pub const BIN_VOLUME_NAME: &str = "oneagent-bin";
pub const SHARE_VOLUME_NAME: &str = "oneagent-share";

const BIN_MOUNT_PATH: &str = "/mnt/bin";
const SHARE_MOUNT_PATH: &str = "/mnt/share";
const LD_SO_PRELOAD_PATH: &str = "/etc/ld.so.preload";
const CONTAINER_CONF_PATH: &str = "/var/lib/dynatrace/oneagent/agent/config/container.conf";
const PRELOAD_LIBRARY: &str = "agent/lib64/liboneagentproc.so";

pub const CSI_DRIVER_NAME: &str = "csi.oneagent.dynatrace.com";
const PROVISIONED_VOLUME_MODE: &str = "provisioned";
const INSTALLER_VOLUME_MODE: &str = "installer";

const PROXY_SECRET_KEY: &str = "proxy";

const ENV_VAR_NAMES: &[&str] = &[
    PRELOAD_ENV,
    PROXY_ENV,
    NETWORK_ZONE_ENV,
    FLAVOR_ENV,
    TECHNOLOGIES_ENV,
    INSTALL_PATH_ENV,
    INSTALLER_URL_ENV,
    MODE_ENV,
    ONEAGENT_INJECTED_ENV,
];
const VOLUME_NAMES: &[&str] = &[BIN_VOLUME_NAME, SHARE_VOLUME_NAME];

/// Injects the OneAgent code modules through `LD_PRELOAD`.
pub struct OneAgentMutator {
    cluster: Arc<dyn Cluster>,
    cluster_id: String,
}

impl OneAgentMutator {
    pub fn new(cluster: Arc<dyn Cluster>, cluster_id: String) -> Self {
        Self {
            cluster,
            cluster_id,
        }
    }

    async fn ensure_init_secret(&self, namespace: &str, dynakube: &DynaKube) -> Result<(), Error> {
        let provisioning = |source: ClusterError| Error::Provisioning {
            secret: SECRET_CONFIG_NAME.to_string(),
            namespace: namespace.to_string(),
            source,
        };

        match self.cluster.secret(SECRET_CONFIG_NAME, namespace).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                let secret = self.init_secret(namespace, dynakube).await;
                self.cluster
                    .create_secret(namespace, &secret)
                    .await
                    .map_err(|e| {
                        error!(namespace, "failed to create the init secret before pod injection: {e}");
                        provisioning(e)
                    })
            }
            Err(e) => {
                error!(namespace, "failed to query the init secret before pod injection: {e}");
                Err(provisioning(e))
            }
        }
    }

    async fn init_secret(&self, namespace: &str, dynakube: &DynaKube) -> Secret {
        let mut data = BTreeMap::from([
            ("apiUrl".to_string(), dynakube.spec.api_url.clone()),
            ("clusterID".to_string(), self.cluster_id.clone()),
        ]);
        if let Some(proxy) = self.resolve_proxy(dynakube).await {
            data.insert(PROXY_SECRET_KEY.to_string(), proxy);
        }
        if let Some(zone) = dynakube.network_zone() {
            data.insert("networkZone".to_string(), zone.to_string());
        }

        let mut secret = Secret {
            string_data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        secret.metadata.name = Some(SECRET_CONFIG_NAME.to_string());
        secret.metadata.namespace = Some(namespace.to_string());
        secret
    }

    /// The proxy URL, read from the referenced secret when not given inline.
    /// An unreadable proxy secret leaves the proxy unset.
    async fn resolve_proxy(&self, dynakube: &DynaKube) -> Option<String> {
        let proxy = dynakube.spec.proxy.as_ref()?;
        if let Some(value) = proxy.value.as_deref().filter(|v| !v.is_empty()) {
            return Some(value.to_string());
        }
        let secret_name = proxy.value_from.as_deref().filter(|v| !v.is_empty())?;
        let namespace = dynakube.metadata.namespace.as_deref().unwrap_or_default();
        match self.cluster.secret(secret_name, namespace).await {
            Ok(Some(secret)) => secret
                .data
                .and_then(|d| d.get(PROXY_SECRET_KEY).cloned())
                .and_then(|v| String::from_utf8(v.0).ok()),
            Ok(None) => {
                warn!(secret = secret_name, namespace, "proxy secret not found");
                None
            }
            Err(e) => {
                warn!(secret = secret_name, namespace, "failed to read proxy secret: {e}");
                None
            }
        }
    }

    fn add_oneagent_to_container(&self, container: &mut Container, dynakube: &DynaKube, install_path: &str) {
        info!(container_name = %container.name, "updating container with missing preload variables");

        let container_conf = format!("container_{}.conf", container.name);
        add_volume_mounts(
            container,
            [
                volume_mount(BIN_VOLUME_NAME, install_path, None),
                volume_mount(SHARE_VOLUME_NAME, LD_SO_PRELOAD_PATH, Some("ld.so.preload")),
                volume_mount(SHARE_VOLUME_NAME, CONTAINER_CONF_PATH, Some(&container_conf)),
            ],
        );

        add_env_if_missing(
            container,
            env_var(DEPLOYMENT_METADATA_ENV, deployment_metadata(dynakube, &self.cluster_id)),
        );
        add_env(
            container,
            [env_var(PRELOAD_ENV, format!("{install_path}/{PRELOAD_LIBRARY}"))],
        );
        if dynakube.has_proxy() {
            add_env_if_missing(container, proxy_env());
        }
        if let Some(zone) = dynakube.network_zone() {
            add_env_if_missing(container, env_var(NETWORK_ZONE_ENV, zone));
        }
    }
}

#[async_trait]
impl PodMutator for OneAgentMutator {
    fn name(&self) -> CapabilityName {
        CapabilityName::OneAgent
    }

    fn enabled(&self, pod: &Pod) -> bool {
        annotation_bool(pod, ANNOTATION_INJECT, true)
    }

    fn injected(&self, pod: &Pod) -> bool {
        annotation_bool(pod, ANNOTATION_INJECTED, false)
    }

    fn container_injected(&self, container: &Container) -> bool {
        has_env(container, PRELOAD_ENV)
    }

    fn env_var_names(&self) -> &'static [&'static str] {
        ENV_VAR_NAMES
    }

    fn volume_names(&self) -> &'static [&'static str] {
        VOLUME_NAMES
    }

    async fn mutate(&self, request: &mut MutationRequest<'_>) -> Result<(), Error> {
        let namespace = request.namespace_name().to_string();
        self.ensure_init_secret(&namespace, request.dynakube).await?;

        let dynakube = request.dynakube;
        let install_path = install_path(request.pod).to_string();
        let use_csi = dynakube.needs_csi_driver();

        add_volumes(
            request.pod,
            [
                bin_volume(dynakube, use_csi),
                Volume {
                    name: SHARE_VOLUME_NAME.to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                },
            ],
        );
        configure_init_container(request.init_container, request.pod, &install_path, use_csi);

        for (i, container) in pod_spec_mut(request.pod).containers.iter_mut().enumerate() {
            add_container_info_env(request.init_container, i + 1, container);
            self.add_oneagent_to_container(container, dynakube, &install_path);
        }

        set_annotation(request.pod, ANNOTATION_INJECTED, "true");
        Ok(())
    }

    fn reinvoke(&self, request: &mut ReinvocationRequest<'_>) -> bool {
        let install_path = install_path(request.pod).to_string();
        let dynakube = request.dynakube;
        let number = request.container_index + 1;

        let (container, install_container) = request.containers_mut();
        if let Some(install_container) = install_container {
            add_container_info_env(install_container, number, container);
        }
        self.add_oneagent_to_container(container, dynakube, &install_path);
        true
    }
}

fn install_path(pod: &Pod) -> &str {
    annotation_or(pod, ANNOTATION_INSTALL_PATH, DEFAULT_INSTALL_PATH)
}

fn bin_volume(dynakube: &DynaKube, use_csi: bool) -> Volume {
    let mut volume = Volume {
        name: BIN_VOLUME_NAME.to_string(),
        ..Default::default()
    };
    if use_csi {
        volume.csi = Some(CSIVolumeSource {
            driver: CSI_DRIVER_NAME.to_string(),
            volume_attributes: Some(BTreeMap::from([
                ("mode".to_string(), "app".to_string()),
                ("dynakube".to_string(), dynakube.name().to_string()),
            ])),
            ..Default::default()
        });
    } else {
        volume.empty_dir = Some(EmptyDirVolumeSource::default());
    }
    volume
}

fn configure_init_container(init: &mut Container, pod: &Pod, install_path: &str, use_csi: bool) {
    let mode = if use_csi {
        PROVISIONED_VOLUME_MODE
    } else {
        INSTALLER_VOLUME_MODE
    };
    add_env(
        init,
        [
            env_var(FLAVOR_ENV, annotation_or(pod, ANNOTATION_FLAVOR, DEFAULT_FLAVOR)),
            env_var(
                TECHNOLOGIES_ENV,
                annotation_or(pod, ANNOTATION_TECHNOLOGIES, DEFAULT_TECHNOLOGIES),
            ),
            env_var(INSTALL_PATH_ENV, install_path),
            env_var(INSTALLER_URL_ENV, annotation_or(pod, ANNOTATION_INSTALLER_URL, "")),
            env_var(MODE_ENV, mode),
            env_var(ONEAGENT_INJECTED_ENV, "true"),
        ],
    );
    add_volume_mounts(
        init,
        [
            volume_mount(BIN_VOLUME_NAME, BIN_MOUNT_PATH, None),
            volume_mount(SHARE_VOLUME_NAME, SHARE_MOUNT_PATH, None),
        ],
    );
}

/// `DT_PROXY` is always read from the init secret, never set in plain text.
fn proxy_env() -> EnvVar {
    EnvVar {
        name: PROXY_ENV.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: SECRET_CONFIG_NAME.to_string(),
                key: PROXY_SECRET_KEY.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}
