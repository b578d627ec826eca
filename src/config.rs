use std::fmt;
use std::time::Duration;

use figment::{Figment, providers::{Env, Format, Yaml}};
use serde::{Deserialize, Serialize};

/// The capabilities the webhook can inject, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityName {
    OneAgent,
    DataIngest,
}

impl CapabilityName {
    pub const ALL: [CapabilityName; 2] = [CapabilityName::OneAgent, CapabilityName::DataIngest];

    pub fn as_str(self) -> &'static str {
        match self {
            CapabilityName::OneAgent => "oneagent",
            CapabilityName::DataIngest => "data-ingest",
        }
    }
}

impl fmt::Display for CapabilityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_tls_cert_path() -> String {
    "/tmp/webhook/certs/tls.crt".to_string()
}

fn default_tls_key_path() -> String {
    "/tmp/webhook/certs/tls.key".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:10080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_namespace() -> String {
    "dynatrace".to_string()
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_admission_timeout_secs() -> u64 {
    9
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectorConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_tls_cert_path")]
    pub tls_cert_path: String,
    #[serde(default = "default_tls_key_path")]
    pub tls_key_path: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Namespace the operator runs in; DynaKube objects are read from here.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Name of the webhook's own pod, used to discover the installer image.
    #[serde(default)]
    pub pod_name: Option<String>,
    /// Installer image. Falls back to the image of the webhook pod.
    #[serde(default)]
    pub image: Option<String>,
    /// Falls back to the UID of the `kube-system` namespace.
    #[serde(default)]
    pub cluster_id: Option<String>,
    /// Bound on a single API server call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Bound on a whole pod injection. Kept below the API server's webhook
    /// timeout so the pod is admitted with a warning instead of timing out.
    #[serde(default = "default_admission_timeout_secs")]
    pub admission_timeout_secs: u64,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            tls_cert_path: default_tls_cert_path(),
            tls_key_path: default_tls_key_path(),
            metrics_addr: default_metrics_addr(),
            log_level: default_log_level(),
            namespace: default_namespace(),
            pod_name: None,
            image: None,
            cluster_id: None,
            request_timeout_secs: default_request_timeout_secs(),
            admission_timeout_secs: default_admission_timeout_secs(),
        }
    }
}

impl InjectorConfig {
    /// Loads the YAML file at `path`, overlaid with `INJECTOR_*` environment
    /// variables. A missing file yields the defaults plus the environment.
    pub fn load(path: &str) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("INJECTOR_").split("__"))
            .extract()
            .map_err(Box::new)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.admission_timeout_secs)
    }
}
