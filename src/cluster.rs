//! Reads and writes against the Kubernetes API the injector depends on.
//!
//! Everything goes through the [`Cluster`] trait so the injection logic can
//! be exercised against an in-memory cluster in tests. Each call is a single
//! attempt bounded by a timeout; retries are left to the API server's webhook
//! failure policy.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DynamicObject, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use tracing::debug;

use crate::dynakube::DynaKube;
use crate::error::ClusterError;

/// The metadata of an object met while walking an owner chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OwnedObject {
    pub name: String,
    pub kind: String,
    pub api_version: String,
    pub namespace: String,
    pub owner_references: Vec<OwnerReference>,
}

#[async_trait]
pub trait Cluster: Send + Sync {
    async fn namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError>;

    async fn dynakube(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynaKube>, ClusterError>;

    async fn secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, ClusterError>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClusterError>;

    /// Fetches the metadata of the object an owner reference points to.
    async fn owner(
        &self,
        owner: &OwnerReference,
        namespace: &str,
    ) -> Result<OwnedObject, ClusterError>;
}

pub struct KubeCluster {
    client: Client,
    timeout: Duration,
}

impl KubeCluster {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, ClusterError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(ClusterError::from),
            Err(_) => Err(ClusterError::Timeout(self.timeout)),
        }
    }

    /// Image of the first container of the given pod.
    pub async fn pod_image(&self, name: &str, namespace: &str) -> Result<Option<String>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = self.bounded(api.get(name)).await?;
        Ok(pod
            .spec
            .and_then(|spec| spec.containers.into_iter().next())
            .and_then(|c| c.image))
    }

    /// UID of the `kube-system` namespace, which identifies the cluster.
    pub async fn cluster_uid(&self) -> Result<Option<String>, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = self.bounded(api.get("kube-system")).await?;
        Ok(ns.metadata.uid)
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn namespace(&self, name: &str) -> Result<Option<Namespace>, ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        self.bounded(api.get_opt(name)).await
    }

    async fn dynakube(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynaKube>, ClusterError> {
        let api: Api<DynaKube> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(api.get_opt(name)).await
    }

    async fn secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, ClusterError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(api.get_opt(name)).await
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClusterError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        self.bounded(api.create(&PostParams::default(), secret)).await?;
        debug!(
            secret = secret.metadata.name.as_deref().unwrap_or_default(),
            namespace, "created secret"
        );
        Ok(())
    }

    async fn owner(
        &self,
        owner: &OwnerReference,
        namespace: &str,
    ) -> Result<OwnedObject, ClusterError> {
        let (group, version) = split_api_version(&owner.api_version);
        let gvk = GroupVersionKind::gvk(group, version, &owner.kind);
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        let meta = self.bounded(api.get_metadata(&owner.name)).await?;

        Ok(OwnedObject {
            name: meta.metadata.name.unwrap_or_else(|| owner.name.clone()),
            kind: owner.kind.clone(),
            api_version: owner.api_version.clone(),
            namespace: namespace.to_string(),
            owner_references: meta.metadata.owner_references.unwrap_or_default(),
        })
    }
}

/// Splits `apps/v1` into `("apps", "v1")` and `v1` into `("", "v1")`.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}
