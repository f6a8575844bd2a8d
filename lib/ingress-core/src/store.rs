//! Access to cluster resources
//!
//! The provider only reads through [`ResourceStore`]. The cluster-backed implementation
//! lives in `ingress-kube`; [`memory::InMemoryStore`] serves tests and offline runs.

use crate::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::{Ingress, IngressClass, IngressLoadBalancerIngress};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod memory;

/// Label linking an EndpointSlice to its Service
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Kind of resource that changed. The reconciliation loop only needs to know that
/// something changed, so the payload stays coarse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceEvent {
    Ingress,
    IngressClass,
    Service,
    EndpointSlice,
    Secret,
}

impl fmt::Display for ResourceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ResourceEvent::Ingress => "Ingress",
            ResourceEvent::IngressClass => "IngressClass",
            ResourceEvent::Service => "Service",
            ResourceEvent::EndpointSlice => "EndpointSlice",
            ResourceEvent::Secret => "Secret",
        };
        f.write_str(kind)
    }
}

/// Change notifications. Sources push with `try_send` into a single-slot channel, so
/// a busy consumer makes them drop duplicates instead of blocking.
pub type EventStream = mpsc::Receiver<ResourceEvent>;

/// Cache-backed read access to the resources the provider compiles
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Start watching every resource kind. The stream ends when the watch breaks.
    async fn watch_all(&self) -> Result<EventStream>;

    async fn list_ingress_classes(&self) -> Result<Vec<Arc<IngressClass>>>;

    async fn list_ingresses(&self) -> Result<Vec<Arc<Ingress>>>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>>;

    async fn get_endpoint_slices_for_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<Arc<EndpointSlice>>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Arc<Secret>>>;

    /// Replace the load balancer addresses in the status of `ingress`
    async fn update_ingress_status(
        &self,
        ingress: &Ingress,
        addresses: Vec<IngressLoadBalancerIngress>,
    ) -> Result<()>;
}

/// Send an event without ever blocking the source. Returns false if the slot was taken.
pub fn notify(tx: &mpsc::Sender<ResourceEvent>, event: ResourceEvent) -> bool {
    tx.try_send(event).is_ok()
}
