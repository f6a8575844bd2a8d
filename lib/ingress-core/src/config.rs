//! Provider configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for one provider instance. Immutable once the provider starts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// IngressClass name handled by this provider
    #[serde(default = "default_ingress_class")]
    pub ingress_class: String,

    /// Controller string matched against `IngressClass.spec.controller`
    #[serde(default = "default_controller_class")]
    pub controller_class: String,

    /// Also accept IngressClasses whose name is `ingress_class`, whatever their controller
    #[serde(default)]
    pub ingress_class_by_name: bool,

    /// Process Ingresses that name no class at all
    #[serde(default)]
    pub watch_ingress_without_class: bool,

    /// Namespaces to watch. Empty watches every namespace.
    #[serde(default)]
    pub watch_namespace: Vec<String>,

    /// Label selector choosing the watched namespaces
    #[serde(default)]
    pub watch_namespace_selector: Option<String>,

    /// `namespace/name` of the Service whose load balancer addresses are published
    #[serde(default)]
    pub publish_service: Option<String>,

    /// Addresses published verbatim, taking precedence over `publish_service`
    #[serde(default)]
    pub publish_status_address: Vec<String>,

    /// `namespace/name` of the Service serving unmatched requests
    #[serde(default)]
    pub default_backend_service: Option<String>,

    /// Minimum time between two recomputations
    #[serde(default = "default_throttle_duration_ms")]
    pub throttle_duration_ms: u64,

    #[serde(default)]
    pub disable_external_name_services: bool,
}

impl ProviderConfig {
    pub fn throttle_duration(&self) -> Duration {
        Duration::from_millis(self.throttle_duration_ms)
    }

    /// `(namespace, name)` of the default backend Service, if configured
    pub fn default_backend(&self) -> Option<(&str, &str)> {
        split_namespaced(self.default_backend_service.as_deref()?)
    }

    /// `(namespace, name)` of the publish Service, if configured
    pub fn publish_service(&self) -> Option<(&str, &str)> {
        split_namespaced(self.publish_service.as_deref()?)
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            ingress_class: default_ingress_class(),
            controller_class: default_controller_class(),
            ingress_class_by_name: false,
            watch_ingress_without_class: false,
            watch_namespace: Vec::new(),
            watch_namespace_selector: None,
            publish_service: None,
            publish_status_address: Vec::new(),
            default_backend_service: None,
            throttle_duration_ms: default_throttle_duration_ms(),
            disable_external_name_services: false,
        }
    }
}

fn split_namespaced(reference: &str) -> Option<(&str, &str)> {
    let (namespace, name) = reference.split_once('/')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some((namespace, name))
}

fn default_ingress_class() -> String {
    "nginx".to_string()
}

fn default_controller_class() -> String {
    "k8s.io/ingress-nginx".to_string()
}

fn default_throttle_duration_ms() -> u64 {
    0
}
