//! Validation of DynaKube objects on admission.
//!
//! The proxy URL ends up in a shell `eval` inside the install container, so
//! its password may contain neither `'` nor `` ` ``, encoded or not.

use std::sync::LazyLock;

use k8s_openapi::api::core::v1::Secret;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use percent_encoding::percent_decode_str;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::cluster::Cluster;
use crate::dynakube::DynaKube;

pub const ERROR_INVALID_PROXY_URL: &str = "The DynaKube's specification has an invalid Proxy URL value set. Make sure you correctly specify the URL in your custom resource.";
pub const ERROR_INVALID_EVAL_CHARACTER: &str = "The DynaKube's specification has an invalid Proxy password value set. Make sure you don't use forbidden characters.";
pub const ERROR_MISSING_PROXY_SECRET: &str =
    "The Proxy secret indicated by the DynaKube specification doesn't exist.";
pub const ERROR_INVALID_PROXY_SECRET_FORMAT: &str = "The Proxy secret indicated by the DynaKube specification has an invalid format. Make sure you correctly creates the secret.";
pub const ERROR_INVALID_PROXY_SECRET_URL: &str = "The Proxy secret indicated by the DynaKube specification has an invalid URL value set. Make sure you correctly specify the URL in the secret.";
pub const ERROR_INVALID_PROXY_SECRET_EVAL_CHARACTER: &str = "The Proxy secret indicated by the DynaKube specification has an invalid Proxy password value set. Make sure you don't use forbidden characters.";

const PROXY_SECRET_KEY: &str = "proxy";

static PERCENT_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%[0-9A-Fa-f]{0,2}").expect("escape pattern is valid"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyUrlError {
    #[error("proxy URL is malformed")]
    Malformed,
    #[error("proxy password contains a forbidden character")]
    ForbiddenPasswordCharacter,
}

/// Accepts `scheme://[user[:password]@]host[:port][/path]`. The decoded
/// password is checked first; a raw `'` or `` ` `` anywhere else still makes
/// the URL malformed.
pub fn validate_proxy_url(proxy_url: &str) -> Result<(), ProxyUrlError> {
    if proxy_url.chars().any(char::is_whitespace) || has_invalid_escape(proxy_url) {
        return Err(ProxyUrlError::Malformed);
    }
    let parsed = Url::parse(proxy_url).map_err(|_| ProxyUrlError::Malformed)?;
    if !parsed.has_host() {
        return Err(ProxyUrlError::Malformed);
    }

    if let Some(password) = parsed.password() {
        let decoded: Vec<u8> = percent_decode_str(password).collect();
        if has_eval_character(&decoded) {
            return Err(ProxyUrlError::ForbiddenPasswordCharacter);
        }
    }

    if has_eval_character(proxy_url.as_bytes()) {
        return Err(ProxyUrlError::Malformed);
    }
    Ok(())
}

fn has_eval_character(bytes: &[u8]) -> bool {
    bytes.iter().any(|&b| b == b'\'' || b == b'`')
}

/// A `%` not followed by two hex digits.
fn has_invalid_escape(s: &str) -> bool {
    PERCENT_ESCAPE.find_iter(s).any(|m| m.len() != 3)
}

fn check_proxy_url(url: &str, malformed: &str, forbidden: &str) -> Option<String> {
    match validate_proxy_url(url) {
        Ok(()) => None,
        Err(ProxyUrlError::Malformed) => Some(malformed.to_string()),
        Err(ProxyUrlError::ForbiddenPasswordCharacter) => Some(forbidden.to_string()),
    }
}

/// Returns the reason to deny the DynaKube, if any.
pub async fn validate_dynakube(cluster: &dyn Cluster, dynakube: &DynaKube) -> Option<String> {
    let proxy = dynakube.spec.proxy.as_ref()?;

    if let Some(secret_name) = proxy.value_from.as_deref().filter(|v| !v.is_empty()) {
        let namespace = dynakube.metadata.namespace.as_deref().unwrap_or_default();
        let secret: Secret = match cluster.secret(secret_name, namespace).await {
            Ok(Some(secret)) => secret,
            Ok(None) => return Some(ERROR_MISSING_PROXY_SECRET.to_string()),
            Err(e) => {
                return Some(format!(
                    "error occurred while reading PROXY secret indicated in the Dynakube specification: {e}"
                ));
            }
        };
        let Some(url) = secret.data.as_ref().and_then(|d| d.get(PROXY_SECRET_KEY)) else {
            return Some(ERROR_INVALID_PROXY_SECRET_FORMAT.to_string());
        };
        return check_proxy_url(
            &String::from_utf8_lossy(&url.0),
            ERROR_INVALID_PROXY_SECRET_URL,
            ERROR_INVALID_PROXY_SECRET_EVAL_CHARACTER,
        );
    }

    let value = proxy.value.as_deref().filter(|v| !v.is_empty())?;
    check_proxy_url(value, ERROR_INVALID_PROXY_URL, ERROR_INVALID_EVAL_CHARACTER)
}

/// Admission entry point for DynaKube objects. Other kinds, and objects that
/// do not decode as a DynaKube, are allowed; schema checks belong to the API
/// server.
pub async fn review_dynakube(
    cluster: &dyn Cluster,
    req: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    if req.kind.kind != "DynaKube" {
        debug!(kind = %req.kind.kind, "not a DynaKube, allowing");
        return response;
    }

    let dynakube: DynaKube = match serde_json::to_value(&req.object).and_then(serde_json::from_value) {
        Ok(dk) => dk,
        Err(e) => {
            warn!(uid = %req.uid, "failed to decode DynaKube, allowing: {e}");
            return response;
        }
    };

    match validate_dynakube(cluster, &dynakube).await {
        Some(reason) => {
            info!(name = dynakube.name(), "denying DynaKube: {reason}");
            response.deny(reason)
        }
        None => response,
    }
}
