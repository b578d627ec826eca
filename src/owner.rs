//! Resolution of the top-level workload that owns a pod.
//!
//! Only controller references to well-known workload kinds are followed, so
//! a pod created by an unknown operator resolves to the last known object
//! rather than to something the webhook cannot read.

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use thiserror::Error;
use tracing::{debug, error};

use crate::cluster::{Cluster, OwnedObject};
use crate::error::ClusterError;

/// Upper bound on owner hops. Real chains are at most three deep
/// (Pod -> ReplicaSet -> Deployment, Pod -> Job -> CronJob).
pub const MAX_OWNER_DEPTH: usize = 10;

const WELL_KNOWN_WORKLOADS: [(&str, &str); 8] = [
    ("ReplicaSet", "apps/v1"),
    ("Deployment", "apps/v1"),
    ("ReplicationController", "v1"),
    ("StatefulSet", "apps/v1"),
    ("DaemonSet", "apps/v1"),
    ("Job", "batch/v1"),
    ("CronJob", "batch/v1"),
    ("DeploymentConfig", "apps.openshift.io/v1"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workload {
    pub name: String,
    pub kind: String,
}

/// Resolution stopped early. Each variant carries the best-known workload so
/// the caller can decide to carry on with it.
#[derive(Debug, Error)]
pub enum OwnerError {
    #[error("failed to query owner {owner_kind} '{owner_name}': {source}")]
    Fetch {
        partial: Workload,
        owner_kind: String,
        owner_name: String,
        source: ClusterError,
    },
    #[error("owner chain of '{}' is deeper than {depth} objects", .partial.name)]
    DepthExceeded { partial: Workload, depth: usize },
}

impl OwnerError {
    pub fn partial(&self) -> &Workload {
        match self {
            OwnerError::Fetch { partial, .. } | OwnerError::DepthExceeded { partial, .. } => {
                partial
            }
        }
    }
}

/// Finds the root workload of a pod. `namespace` is passed separately because
/// the pod's own namespace field is usually unset at admission time.
pub async fn find_root_owner_of_pod(
    cluster: &dyn Cluster,
    pod: &Pod,
    pod_name: &str,
    namespace: &str,
) -> Result<Workload, OwnerError> {
    let object = OwnedObject {
        name: pod_name.to_string(),
        kind: "Pod".to_string(),
        api_version: "v1".to_string(),
        namespace: namespace.to_string(),
        owner_references: pod.metadata.owner_references.clone().unwrap_or_default(),
    };
    find_root_owner(cluster, object).await
}

pub async fn find_root_owner(
    cluster: &dyn Cluster,
    mut current: OwnedObject,
) -> Result<Workload, OwnerError> {
    let mut hops = 0;
    loop {
        if current.owner_references.is_empty() {
            let kind = if current.kind == "Pod" {
                String::new()
            } else {
                current.kind
            };
            return Ok(Workload {
                name: current.name,
                kind,
            });
        }

        let Some(owner) = current
            .owner_references
            .iter()
            .find(|o| o.controller == Some(true) && is_well_known_workload(o))
            .cloned()
        else {
            return Ok(workload_of(&current));
        };

        if hops == MAX_OWNER_DEPTH {
            return Err(OwnerError::DepthExceeded {
                partial: workload_of(&current),
                depth: MAX_OWNER_DEPTH,
            });
        }

        debug!(kind = %owner.kind, name = %owner.name, "following owner reference");
        match cluster.owner(&owner, &current.namespace).await {
            Ok(next) => {
                current = next;
                hops += 1;
            }
            Err(source) => {
                error!(
                    api_version = %owner.api_version,
                    kind = %owner.kind,
                    name = %owner.name,
                    namespace = %current.namespace,
                    "failed to query the owner object: {source}"
                );
                return Err(OwnerError::Fetch {
                    partial: workload_of(&current),
                    owner_kind: owner.kind.clone(),
                    owner_name: owner.name.clone(),
                    source,
                });
            }
        }
    }
}

fn workload_of(object: &OwnedObject) -> Workload {
    Workload {
        name: object.name.clone(),
        kind: object.kind.clone(),
    }
}

fn is_well_known_workload(owner: &OwnerReference) -> bool {
    WELL_KNOWN_WORKLOADS
        .iter()
        .any(|(kind, api_version)| owner.kind == *kind && owner.api_version == *api_version)
}
