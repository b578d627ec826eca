use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, Pod, Secret, SecretVolumeSource, Volume,
};
use tracing::{error, info, warn};

use crate::cluster::Cluster;
use crate::config::CapabilityName;
use crate::dynakube::DynaKube;
use crate::error::{ClusterError, Error};
use crate::owner::find_root_owner_of_pod;

use super::{
    DEPLOYMENT_METADATA_ENV, MutationRequest, PodMutator, ReinvocationRequest, add_env,
    add_env_if_missing, add_volume_mounts, add_volumes, annotation_bool, deployment_metadata,
    env_var, has_volume_mount, pod_spec_mut, set_annotation, volume_mount,
};

pub const ANNOTATION_INJECT: &str = "data-ingest.dynatrace.com/inject";
pub const ANNOTATION_INJECTED: &str = "data-ingest.dynatrace.com/injected";

pub const ENDPOINT_SECRET_NAME: &str = "dynatrace-data-ingest-endpoint";
const ENDPOINT_SECRET_KEY: &str = "endpoint.properties";
const METRICS_URL_PROPERTY: &str = "DT_METRICS_INGEST_URL";
const METRICS_INGEST_PATH: &str = "/v2/metrics/ingest";

pub const WORKLOAD_KIND_ENV: &str = "DT_WORKLOAD_KIND";
pub const WORKLOAD_NAME_ENV: &str = "DT_WORKLOAD_NAME";
const DATA_INGEST_INJECTED_ENV: &str = "DATA_INGEST_INJECTED";

/// Also the per-container marker.
pub const ENRICHMENT_VOLUME_NAME: &str = "data-ingest-enrichment";
pub const ENDPOINT_VOLUME_NAME: &str = "data-ingest-endpoint";

const ENRICHMENT_PATH: &str = "/var/lib/dynatrace/enrichment";
const ENDPOINT_PATH: &str = "/var/lib/dynatrace/enrichment/endpoint";

const ENV_VAR_NAMES: &[&str] = &[WORKLOAD_KIND_ENV, WORKLOAD_NAME_ENV, DATA_INGEST_INJECTED_ENV];
const VOLUME_NAMES: &[&str] = &[ENRICHMENT_VOLUME_NAME, ENDPOINT_VOLUME_NAME];

/// Enriches telemetry with workload metadata and the metrics ingest endpoint.
pub struct DataIngestMutator {
    cluster: Arc<dyn Cluster>,
    cluster_id: String,
}

impl DataIngestMutator {
    pub fn new(cluster: Arc<dyn Cluster>, cluster_id: String) -> Self {
        Self {
            cluster,
            cluster_id,
        }
    }

    async fn ensure_endpoint_secret(&self, namespace: &str, dynakube: &DynaKube) -> Result<(), Error> {
        let provisioning = |source: ClusterError| Error::Provisioning {
            secret: ENDPOINT_SECRET_NAME.to_string(),
            namespace: namespace.to_string(),
            source,
        };

        match self.cluster.secret(ENDPOINT_SECRET_NAME, namespace).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => self
                .cluster
                .create_secret(namespace, &endpoint_secret(namespace, dynakube))
                .await
                .map_err(|e| {
                    error!(namespace, "failed to create the data-ingest endpoint secret before pod injection: {e}");
                    provisioning(e)
                }),
            Err(e) => {
                error!(namespace, "failed to query the data-ingest endpoint secret before pod injection: {e}");
                Err(provisioning(e))
            }
        }
    }

    fn update_container(&self, container: &mut Container, dynakube: &DynaKube) {
        info!(container_name = %container.name, "updating container with missing data ingest enrichment");

        add_env_if_missing(
            container,
            env_var(DEPLOYMENT_METADATA_ENV, deployment_metadata(dynakube, &self.cluster_id)),
        );
        add_volume_mounts(
            container,
            [
                volume_mount(ENRICHMENT_VOLUME_NAME, ENRICHMENT_PATH, None),
                volume_mount(ENDPOINT_VOLUME_NAME, ENDPOINT_PATH, None),
            ],
        );
    }
}

#[async_trait]
impl PodMutator for DataIngestMutator {
    fn name(&self) -> CapabilityName {
        CapabilityName::DataIngest
    }

    fn enabled(&self, pod: &Pod) -> bool {
        annotation_bool(pod, ANNOTATION_INJECT, true)
    }

    fn injected(&self, pod: &Pod) -> bool {
        annotation_bool(pod, ANNOTATION_INJECTED, false)
    }

    fn container_injected(&self, container: &Container) -> bool {
        has_volume_mount(container, ENRICHMENT_VOLUME_NAME)
    }

    fn env_var_names(&self) -> &'static [&'static str] {
        ENV_VAR_NAMES
    }

    fn volume_names(&self) -> &'static [&'static str] {
        VOLUME_NAMES
    }

    async fn mutate(&self, request: &mut MutationRequest<'_>) -> Result<(), Error> {
        let namespace = request.namespace_name().to_string();
        self.ensure_endpoint_secret(&namespace, request.dynakube).await?;

        let workload = match find_root_owner_of_pod(
            self.cluster.as_ref(),
            request.pod,
            request.pod_name,
            &namespace,
        )
        .await
        {
            Ok(workload) => workload,
            Err(e) => {
                let partial = e.partial().clone();
                let err = Error::from(e);
                warn!(pod = request.pod_name, namespace = %namespace, "continuing with partially resolved workload: {err}");
                partial
            }
        };

        add_volumes(
            request.pod,
            [
                Volume {
                    name: ENRICHMENT_VOLUME_NAME.to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                },
                Volume {
                    name: ENDPOINT_VOLUME_NAME.to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(ENDPOINT_SECRET_NAME.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
        );

        add_env(
            request.init_container,
            [
                env_var(WORKLOAD_KIND_ENV, workload.kind),
                env_var(WORKLOAD_NAME_ENV, workload.name),
                env_var(DATA_INGEST_INJECTED_ENV, "true"),
            ],
        );
        add_volume_mounts(
            request.init_container,
            [volume_mount(ENRICHMENT_VOLUME_NAME, ENRICHMENT_PATH, None)],
        );

        let dynakube = request.dynakube;
        for container in pod_spec_mut(request.pod).containers.iter_mut() {
            self.update_container(container, dynakube);
        }

        set_annotation(request.pod, ANNOTATION_INJECTED, "true");
        Ok(())
    }

    fn reinvoke(&self, request: &mut ReinvocationRequest<'_>) -> bool {
        let dynakube = request.dynakube;
        let (container, _) = request.containers_mut();
        self.update_container(container, dynakube);
        true
    }
}

fn endpoint_secret(namespace: &str, dynakube: &DynaKube) -> Secret {
    let url = format!(
        "{}{METRICS_INGEST_PATH}",
        dynakube.spec.api_url.trim_end_matches('/')
    );
    let mut secret = Secret {
        string_data: Some(BTreeMap::from([(
            ENDPOINT_SECRET_KEY.to_string(),
            format!("{METRICS_URL_PROPERTY}={url}\n"),
        )])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };
    secret.metadata.name = Some(ENDPOINT_SECRET_NAME.to_string());
    secret.metadata.namespace = Some(namespace.to_string());
    secret
}
