use std::time::Duration;

use thiserror::Error;

/// Failure of a single call to the Kubernetes API.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error("request to the API server timed out after {0:?}")]
    Timeout(Duration),
}

/// Everything that can go wrong while handling one admission request.
///
/// None of these deny the pod; the injector turns each of them into an
/// allowed response carrying a warning.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to decode pod: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("admission request carries no namespace")]
    MissingNamespace,
    #[error("failed to query namespace '{namespace}': {source}")]
    NamespaceLookup {
        namespace: String,
        source: ClusterError,
    },
    #[error("namespace '{0}' not found")]
    NamespaceNotFound(String),
    #[error("failed to query DynaKube '{name}': {source}")]
    DynaKubeLookup { name: String, source: ClusterError },
    #[error("namespace '{namespace}' is assigned to DynaKube instance '{name}' but it doesn't exist")]
    DynaKubeMissing { namespace: String, name: String },
    #[error("failed to provision secret '{secret}' in namespace '{namespace}': {source}")]
    Provisioning {
        secret: String,
        namespace: String,
        source: ClusterError,
    },
    #[error(transparent)]
    OwnerResolution(#[from] crate::owner::OwnerError),
    #[error("name '{name}' is claimed by both '{first}' and '{second}'")]
    NameCollision {
        name: &'static str,
        first: &'static str,
        second: &'static str,
    },
    #[error("failed to encode pod: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    SerializePatch(#[from] kube::core::admission::SerializePatchError),
    #[error("injection did not finish within {0:?}")]
    Deadline(Duration),
}
