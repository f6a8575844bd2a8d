//! In-memory resource store

use super::{notify, EventStream, ResourceEvent, ResourceStore, SERVICE_NAME_LABEL};
use crate::{CoreError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::{
    Ingress, IngressClass, IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus,
};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

type ObjectKey = (String, String);

#[derive(Default)]
struct Objects {
    ingress_classes: BTreeMap<String, Arc<IngressClass>>,
    ingresses: BTreeMap<ObjectKey, Arc<Ingress>>,
    services: BTreeMap<ObjectKey, Arc<Service>>,
    endpoint_slices: BTreeMap<ObjectKey, Arc<EndpointSlice>>,
    secrets: BTreeMap<ObjectKey, Arc<Secret>>,
    statuses: BTreeMap<ObjectKey, Vec<IngressLoadBalancerIngress>>,
}

/// A [`ResourceStore`] over plain maps, with hooks to simulate watch and status failures
pub struct InMemoryStore {
    namespaces: Option<BTreeSet<String>>,
    objects: Arc<RwLock<Objects>>,
    subscribers: Arc<RwLock<Vec<mpsc::Sender<ResourceEvent>>>>,
    watch_failures: AtomicUsize,
    watch_attempts: AtomicUsize,
    list_failures: AtomicUsize,
    fail_status_updates: AtomicBool,
    status_writes: AtomicUsize,
}

impl InMemoryStore {
    /// A store that sees every namespace
    pub fn new() -> Self {
        Self {
            namespaces: None,
            objects: Arc::new(RwLock::new(Objects::default())),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            watch_failures: AtomicUsize::new(0),
            watch_attempts: AtomicUsize::new(0),
            list_failures: AtomicUsize::new(0),
            fail_status_updates: AtomicBool::new(false),
            status_writes: AtomicUsize::new(0),
        }
    }

    /// A store scoped to the given namespaces
    pub fn with_namespaces<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespaces: Some(namespaces.into_iter().map(Into::into).collect()),
            ..Self::new()
        }
    }

    /// Make the next `count` calls to `watch_all` fail
    pub fn fail_next_watches(&self, count: usize) {
        self.watch_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` calls to `list_ingresses` fail as an unreachable API server would
    pub fn fail_next_lists(&self, count: usize) {
        self.list_failures.store(count, Ordering::SeqCst);
    }

    pub fn watch_attempts(&self) -> usize {
        self.watch_attempts.load(Ordering::SeqCst)
    }

    pub fn fail_status_updates(&self, fail: bool) {
        self.fail_status_updates.store(fail, Ordering::SeqCst);
    }

    /// Number of successful status writes
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Close every open event stream, as a broken watch would
    pub async fn disconnect(&self) {
        self.subscribers.write().await.clear();
    }

    pub async fn apply_ingress_class(&self, class: IngressClass) {
        let name = class.name_any();
        self.objects
            .write()
            .await
            .ingress_classes
            .insert(name, Arc::new(class));
        self.publish(ResourceEvent::IngressClass).await;
    }

    pub async fn apply_ingress(&self, ingress: Ingress) {
        let key = object_key(&ingress);
        self.objects
            .write()
            .await
            .ingresses
            .insert(key, Arc::new(ingress));
        self.publish(ResourceEvent::Ingress).await;
    }

    pub async fn delete_ingress(&self, namespace: &str, name: &str) {
        self.objects
            .write()
            .await
            .ingresses
            .remove(&(namespace.to_string(), name.to_string()));
        self.publish(ResourceEvent::Ingress).await;
    }

    pub async fn apply_service(&self, service: Service) {
        let key = object_key(&service);
        self.objects
            .write()
            .await
            .services
            .insert(key, Arc::new(service));
        self.publish(ResourceEvent::Service).await;
    }

    pub async fn apply_endpoint_slice(&self, slice: EndpointSlice) {
        let key = object_key(&slice);
        self.objects
            .write()
            .await
            .endpoint_slices
            .insert(key, Arc::new(slice));
        self.publish(ResourceEvent::EndpointSlice).await;
    }

    pub async fn apply_secret(&self, secret: Secret) {
        let key = object_key(&secret);
        self.objects
            .write()
            .await
            .secrets
            .insert(key, Arc::new(secret));
        self.publish(ResourceEvent::Secret).await;
    }

    /// Last status written for an Ingress
    pub async fn ingress_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<Vec<IngressLoadBalancerIngress>> {
        self.objects
            .read()
            .await
            .statuses
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    async fn publish(&self, event: ResourceEvent) {
        let subscribers = self.subscribers.read().await;
        for tx in subscribers.iter() {
            if !notify(tx, event) {
                debug!("Event slot busy, dropping {} event", event);
            }
        }
    }

    fn check_scope(&self, namespace: &str) -> Result<()> {
        match &self.namespaces {
            Some(namespaces) if !namespaces.contains(namespace) => {
                Err(CoreError::NamespaceOutOfScope(namespace.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn in_scope(&self, namespace: &str) -> bool {
        self.check_scope(namespace).is_ok()
    }
}

/// Consume one injected failure, if any are left
fn take_failure(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn watch_all(&self) -> Result<EventStream> {
        self.watch_attempts.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.watch_failures) {
            return Err(CoreError::Store("watch unavailable".to_string()));
        }

        let (tx, rx) = mpsc::channel(1);
        // Initial sync counts as a change
        notify(&tx, ResourceEvent::Ingress);
        self.subscribers.write().await.push(tx);
        Ok(rx)
    }

    async fn list_ingress_classes(&self) -> Result<Vec<Arc<IngressClass>>> {
        Ok(self
            .objects
            .read()
            .await
            .ingress_classes
            .values()
            .cloned()
            .collect())
    }

    async fn list_ingresses(&self) -> Result<Vec<Arc<Ingress>>> {
        if take_failure(&self.list_failures) {
            return Err(CoreError::Store("list unavailable".to_string()));
        }
        Ok(self
            .objects
            .read()
            .await
            .ingresses
            .iter()
            .filter(|((ns, _), _)| self.in_scope(ns))
            .map(|(_, ingress)| ingress.clone())
            .collect())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>> {
        self.check_scope(namespace)?;
        Ok(self
            .objects
            .read()
            .await
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_endpoint_slices_for_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<Arc<EndpointSlice>>> {
        self.check_scope(namespace)?;
        Ok(self
            .objects
            .read()
            .await
            .endpoint_slices
            .iter()
            .filter(|((ns, _), slice)| {
                ns == namespace
                    && slice.labels().get(SERVICE_NAME_LABEL).map(String::as_str) == Some(name)
            })
            .map(|(_, slice)| slice.clone())
            .collect())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Arc<Secret>>> {
        self.check_scope(namespace)?;
        Ok(self
            .objects
            .read()
            .await
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn update_ingress_status(
        &self,
        ingress: &Ingress,
        addresses: Vec<IngressLoadBalancerIngress>,
    ) -> Result<()> {
        if self.fail_status_updates.load(Ordering::SeqCst) {
            return Err(CoreError::Store("status update rejected".to_string()));
        }
        let key = object_key(ingress);
        self.check_scope(&key.0)?;
        {
            let mut objects = self.objects.write().await;
            if let Some(stored) = objects.ingresses.get(&key) {
                let mut updated = Ingress::clone(stored);
                updated.status = Some(IngressStatus {
                    load_balancer: Some(IngressLoadBalancerStatus {
                        ingress: Some(addresses.clone()),
                    }),
                });
                objects.ingresses.insert(key.clone(), Arc::new(updated));
            }
            objects.statuses.insert(key, addresses);
        }
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        // The API server reports status writes like any other change
        self.publish(ResourceEvent::Ingress).await;
        Ok(())
    }
}

fn object_key<K: ResourceExt>(object: &K) -> ObjectKey {
    (
        object.namespace().unwrap_or_else(|| "default".to_string()),
        object.name_any(),
    )
}
