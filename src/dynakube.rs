//! The DynaKube custom resource, as far as pod injection reads it.

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Namespace label naming the DynaKube a namespace is monitored by.
pub const INSTANCE_LABEL: &str = "dynakube.internal.dynatrace.com/instance";

pub const ANNOTATION_FEATURE_REINVOCATION: &str =
    "feature.dynatrace.com/enable-webhook-reinvocation-policy";

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "dynatrace.com",
    version = "v1beta1",
    kind = "DynaKube",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeSpec {
    #[serde(default)]
    pub api_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<DynaKubeProxy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_zone: Option<String>,
    #[serde(default)]
    pub one_agent: OneAgentSpec,
}

/// Either an inline proxy URL or the name of a secret holding it under `proxy`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynaKubeProxy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_monitoring: Option<ApplicationMonitoringSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_native_full_stack: Option<CloudNativeFullStackSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMonitoringSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_csi_driver: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_resources: Option<ResourceRequirements>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudNativeFullStackSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_resources: Option<ResourceRequirements>,
}

impl DynaKube {
    /// Whether application pods should receive the agent at all.
    pub fn need_app_injection(&self) -> bool {
        self.spec.one_agent.application_monitoring.is_some()
            || self.cloud_native_fullstack_mode()
    }

    pub fn cloud_native_fullstack_mode(&self) -> bool {
        self.spec.one_agent.cloud_native_full_stack.is_some()
    }

    pub fn needs_csi_driver(&self) -> bool {
        self.cloud_native_fullstack_mode()
            || self
                .spec
                .one_agent
                .application_monitoring
                .as_ref()
                .and_then(|am| am.use_csi_driver)
                .unwrap_or(false)
    }

    pub fn init_resources(&self) -> Option<ResourceRequirements> {
        let one_agent = &self.spec.one_agent;
        one_agent
            .cloud_native_full_stack
            .as_ref()
            .and_then(|cn| cn.init_resources.clone())
            .or_else(|| {
                one_agent
                    .application_monitoring
                    .as_ref()
                    .and_then(|am| am.init_resources.clone())
            })
    }

    pub fn has_proxy(&self) -> bool {
        self.spec.proxy.as_ref().is_some_and(|p| {
            p.value.as_deref().is_some_and(|v| !v.is_empty())
                || p.value_from.as_deref().is_some_and(|v| !v.is_empty())
        })
    }

    pub fn network_zone(&self) -> Option<&str> {
        self.spec.network_zone.as_deref().filter(|z| !z.is_empty())
    }

    pub fn feature_enable_webhook_reinvocation_policy(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_FEATURE_REINVOCATION))
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}
