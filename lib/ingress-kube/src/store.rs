//! Reflector-backed [`ResourceStore`]

use crate::error::{KubeStoreError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use ingress_core::config::ProviderConfig;
use ingress_core::store::{notify, EventStream, ResourceEvent, ResourceStore, SERVICE_NAME_LABEL};
use ingress_core::CoreError;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::{Ingress, IngressClass, IngressLoadBalancerIngress};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::reflector::{self, ObjectRef, Store};
use kube_runtime::watcher::{self, watcher, Event};
use kube_runtime::WatchStreamExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Helm keeps release history in Secrets; they never hold TLS material
const HELM_SECRET_FILTER: &str = "type!=helm.sh/release.v1";

const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

type Fingerprint<K> = fn(&K) -> Option<String>;

/// Caches for one namespace, or for the whole cluster
#[derive(Clone)]
struct NamespaceStores {
    ingresses: Store<Ingress>,
    services: Store<Service>,
    endpoint_slices: Store<EndpointSlice>,
    secrets: Store<Secret>,
}

impl NamespaceStores {
    fn start(
        client: &Client,
        namespace: Option<&str>,
        tx: &mpsc::Sender<ResourceEvent>,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            ingresses: spawn_reflector(
                scoped_api(client, namespace),
                watcher::Config::default(),
                ResourceEvent::Ingress,
                no_fingerprint,
                tx.clone(),
                cancel.clone(),
            ),
            services: spawn_reflector(
                scoped_api(client, namespace),
                watcher::Config::default(),
                ResourceEvent::Service,
                no_fingerprint,
                tx.clone(),
                cancel.clone(),
            ),
            endpoint_slices: spawn_reflector(
                scoped_api(client, namespace),
                watcher::Config::default(),
                ResourceEvent::EndpointSlice,
                endpoint_slice_fingerprint,
                tx.clone(),
                cancel.clone(),
            ),
            secrets: spawn_reflector(
                scoped_api(client, namespace),
                watcher::Config::default().fields(HELM_SECRET_FILTER),
                ResourceEvent::Secret,
                no_fingerprint,
                tx.clone(),
                cancel.clone(),
            ),
        }
    }

    async fn wait_ready(&self) -> Result<()> {
        wait_ready(&self.ingresses, "Ingress").await?;
        wait_ready(&self.services, "Service").await?;
        wait_ready(&self.endpoint_slices, "EndpointSlice").await?;
        wait_ready(&self.secrets, "Secret").await
    }
}

enum Caches {
    Cluster(NamespaceStores),
    Namespaced(BTreeMap<String, NamespaceStores>),
}

impl Caches {
    fn for_namespace(&self, namespace: &str) -> ingress_core::Result<&NamespaceStores> {
        match self {
            Caches::Cluster(stores) => Ok(stores),
            Caches::Namespaced(stores) => stores
                .get(namespace)
                .ok_or_else(|| CoreError::NamespaceOutOfScope(namespace.to_string())),
        }
    }

    fn all(&self) -> Vec<&NamespaceStores> {
        match self {
            Caches::Cluster(stores) => vec![stores],
            Caches::Namespaced(stores) => stores.values().collect(),
        }
    }
}

struct WatchState {
    caches: Caches,
    ingress_classes: Store<IngressClass>,
    /// Stops the reflector tasks of this watch when replaced
    _guard: DropGuard,
}

/// A [`ResourceStore`] reading from kube-runtime reflectors
pub struct KubeStore {
    client: Client,
    namespaces: Vec<String>,
    namespace_selector: Option<String>,
    state: RwLock<Option<WatchState>>,
}

impl KubeStore {
    pub fn new(client: Client, config: &ProviderConfig) -> Self {
        Self {
            client,
            namespaces: config.watch_namespace.clone(),
            namespace_selector: config
                .watch_namespace_selector
                .clone()
                .filter(|s| !s.is_empty()),
            state: RwLock::new(None),
        }
    }

    /// Namespaces to watch; `None` watches the whole cluster
    async fn resolve_namespaces(&self) -> Result<Option<BTreeSet<String>>> {
        if let Some(selector) = &self.namespace_selector {
            let api: Api<Namespace> = Api::all(self.client.clone());
            let list = api.list(&ListParams::default().labels(selector)).await?;
            let names: BTreeSet<String> = list.items.iter().map(|ns| ns.name_any()).collect();
            debug!("Namespace selector {} matched {} namespace(s)", selector, names.len());
            return Ok(Some(names));
        }

        if self.namespaces.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.namespaces.iter().cloned().collect()))
        }
    }

    async fn start_watch(&self) -> Result<EventStream> {
        let namespaces = self.resolve_namespaces().await?;
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);

        let ingress_classes = spawn_reflector(
            Api::<IngressClass>::all(self.client.clone()),
            watcher::Config::default(),
            ResourceEvent::IngressClass,
            no_fingerprint,
            tx.clone(),
            cancel.clone(),
        );

        let caches = match &namespaces {
            None => Caches::Cluster(NamespaceStores::start(&self.client, None, &tx, &cancel)),
            Some(namespaces) => Caches::Namespaced(
                namespaces
                    .iter()
                    .map(|ns| {
                        (
                            ns.clone(),
                            NamespaceStores::start(&self.client, Some(ns), &tx, &cancel),
                        )
                    })
                    .collect(),
            ),
        };
        // Only the reflector tasks hold senders now
        drop(tx);

        if let (Some(selector), Some(namespaces)) = (&self.namespace_selector, &namespaces) {
            spawn_namespace_watch(&self.client, selector, namespaces.clone(), cancel.clone());
        }

        let guard = cancel.drop_guard();
        wait_ready(&ingress_classes, "IngressClass").await?;
        for stores in caches.all() {
            stores.wait_ready().await?;
        }

        match &namespaces {
            None => info!("Watching Ingress resources in all namespaces"),
            Some(namespaces) => info!(
                "Watching Ingress resources in namespaces: {}",
                namespaces.iter().cloned().collect::<Vec<_>>().join(", ")
            ),
        }

        // Dropping the previous state stops its reflectors
        *self.state.write().await = Some(WatchState {
            caches,
            ingress_classes,
            _guard: guard,
        });
        Ok(rx)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        addresses: &[IngressLoadBalancerIngress],
    ) -> Result<()> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        let patch = status_patch(addresses);
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn watch_all(&self) -> ingress_core::Result<EventStream> {
        Ok(self.start_watch().await?)
    }

    async fn list_ingress_classes(&self) -> ingress_core::Result<Vec<Arc<IngressClass>>> {
        let state = self.state.read().await;
        let state = state.as_ref().ok_or(KubeStoreError::NotWatching)?;
        Ok(state.ingress_classes.state())
    }

    async fn list_ingresses(&self) -> ingress_core::Result<Vec<Arc<Ingress>>> {
        let state = self.state.read().await;
        let state = state.as_ref().ok_or(KubeStoreError::NotWatching)?;
        Ok(state
            .caches
            .all()
            .into_iter()
            .flat_map(|stores| stores.ingresses.state())
            .collect())
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> ingress_core::Result<Option<Arc<Service>>> {
        let state = self.state.read().await;
        let state = state.as_ref().ok_or(KubeStoreError::NotWatching)?;
        let stores = state.caches.for_namespace(namespace)?;
        Ok(stores.services.get(&ObjectRef::new(name).within(namespace)))
    }

    async fn get_endpoint_slices_for_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> ingress_core::Result<Vec<Arc<EndpointSlice>>> {
        let state = self.state.read().await;
        let state = state.as_ref().ok_or(KubeStoreError::NotWatching)?;
        let stores = state.caches.for_namespace(namespace)?;
        Ok(stores
            .endpoint_slices
            .state()
            .into_iter()
            .filter(|slice| {
                slice.namespace().as_deref() == Some(namespace)
                    && slice.labels().get(SERVICE_NAME_LABEL).map(String::as_str) == Some(name)
            })
            .collect())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> ingress_core::Result<Option<Arc<Secret>>> {
        let state = self.state.read().await;
        let state = state.as_ref().ok_or(KubeStoreError::NotWatching)?;
        let stores = state.caches.for_namespace(namespace)?;
        Ok(stores.secrets.get(&ObjectRef::new(name).within(namespace)))
    }

    async fn update_ingress_status(
        &self,
        ingress: &Ingress,
        addresses: Vec<IngressLoadBalancerIngress>,
    ) -> ingress_core::Result<()> {
        let namespace = ingress.namespace().unwrap_or_default();
        {
            let state = self.state.read().await;
            let state = state.as_ref().ok_or(KubeStoreError::NotWatching)?;
            state.caches.for_namespace(&namespace)?;
        }
        Ok(self
            .patch_status(&namespace, &ingress.name_any(), &addresses)
            .await?)
    }
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

/// Start a reflector for `api` and report its changes as `kind` events on `tx`.
/// The task stops when `cancel` fires or the event receiver goes away.
fn spawn_reflector<K>(
    api: Api<K>,
    config: watcher::Config,
    kind: ResourceEvent,
    fingerprint: Fingerprint<K>,
    tx: mpsc::Sender<ResourceEvent>,
    cancel: CancellationToken,
) -> Store<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store();
    let mut stream = watcher(api, config)
        .default_backoff()
        .reflect(writer)
        .boxed();

    tokio::spawn(async move {
        let mut seen: HashMap<String, String> = HashMap::new();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tx.closed() => break,
                event = stream.next() => event,
            };
            let Some(event) = event else {
                break;
            };

            let changed = match event {
                Ok(Event::Apply(object)) => record(&mut seen, &object, fingerprint),
                Ok(Event::Delete(object)) => {
                    seen.remove(&object_id(&object));
                    true
                }
                Ok(Event::Init) => {
                    seen.clear();
                    false
                }
                Ok(Event::InitApply(object)) => {
                    record(&mut seen, &object, fingerprint);
                    false
                }
                Ok(Event::InitDone) => true,
                Err(err) => {
                    warn!("{} watch error: {}", kind, err);
                    false
                }
            };

            if changed && !notify(&tx, kind) {
                debug!("Event slot busy, dropping {} event", kind);
            }
        }
        debug!("{} reflector stopped", kind);
    });

    reader
}

/// Namespaces matching the selector as a Namespace watch reports them, compared with
/// the namespaces the caches were built for
struct NamespaceMembership {
    watched: BTreeSet<String>,
    listing: Option<BTreeSet<String>>,
}

impl NamespaceMembership {
    fn new(watched: BTreeSet<String>) -> Self {
        Self {
            watched,
            listing: None,
        }
    }

    /// True once the matching namespaces differ from the watched ones
    fn observe(&mut self, event: &Event<Namespace>) -> bool {
        match event {
            Event::Init => {
                self.listing = Some(BTreeSet::new());
                false
            }
            Event::InitApply(namespace) => {
                if let Some(listing) = &mut self.listing {
                    listing.insert(namespace.name_any());
                }
                false
            }
            Event::InitDone => self
                .listing
                .take()
                .is_some_and(|listed| listed != self.watched),
            Event::Apply(namespace) => !self.watched.contains(&namespace.name_any()),
            // Relabelled namespaces leave a selector watch as deletions
            Event::Delete(namespace) => self.watched.contains(&namespace.name_any()),
        }
    }
}

/// Cancel `cancel`, and with it the whole watch, when the namespaces matching `selector`
/// stop being `watched`. The provider then starts a new watch for the new set.
fn spawn_namespace_watch(
    client: &Client,
    selector: &str,
    watched: BTreeSet<String>,
    cancel: CancellationToken,
) {
    let api: Api<Namespace> = Api::all(client.clone());
    let mut stream = watcher(api, watcher::Config::default().labels(selector))
        .default_backoff()
        .boxed();
    let mut membership = NamespaceMembership::new(watched);

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(event)) => {
                    if membership.observe(&event) {
                        info!("Namespaces matching the selector changed, restarting the watch");
                        cancel.cancel();
                        break;
                    }
                }
                Some(Err(err)) => warn!("Namespace watch error: {}", err),
                None => break,
            }
        }
        debug!("Namespace watch stopped");
    });
}

async fn wait_ready<K>(store: &Store<K>, kind: &'static str) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    match tokio::time::timeout(CACHE_SYNC_TIMEOUT, store.wait_until_ready()).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(KubeStoreError::CacheNotReady(kind)),
    }
}

fn object_id<K: ResourceExt>(object: &K) -> String {
    format!("{}/{}", object.namespace().unwrap_or_default(), object.name_any())
}

/// Remember the fingerprint of `object`; true when it differs from the last one seen.
/// Kinds without a fingerprint always count as changed.
fn record<K: ResourceExt>(
    seen: &mut HashMap<String, String>,
    object: &K,
    fingerprint: Fingerprint<K>,
) -> bool {
    let Some(print) = fingerprint(object) else {
        return true;
    };
    let previous = seen.insert(object_id(object), print.clone());
    previous.as_ref() != Some(&print)
}

fn no_fingerprint<K>(_: &K) -> Option<String> {
    None
}

/// Only endpoints and ports matter for routing; metadata churn is ignored
fn endpoint_slice_fingerprint(slice: &EndpointSlice) -> Option<String> {
    serde_json::to_string(&(&slice.endpoints, &slice.ports)).ok()
}

fn status_patch(addresses: &[IngressLoadBalancerIngress]) -> serde_json::Value {
    json!({
        "status": {
            "loadBalancer": {
                "ingress": addresses,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingress_core::status::status_address;
    use ingress_core::testing::{endpoint_slice, ready_endpoint};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn namespace(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn watched(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn stores() -> NamespaceStores {
        NamespaceStores {
            ingresses: reflector::store().0,
            services: reflector::store().0,
            endpoint_slices: reflector::store().0,
            secrets: reflector::store().0,
        }
    }

    #[test]
    fn test_endpoint_slice_metadata_churn_is_ignored() {
        let mut seen = HashMap::new();
        let slice = endpoint_slice(
            "default",
            "whoami-abc",
            "whoami",
            &[(None, 80)],
            &[ready_endpoint("10.0.0.1")],
        );
        assert!(record(&mut seen, &slice, endpoint_slice_fingerprint));

        let mut annotated = slice.clone();
        annotated.metadata.annotations = Some(BTreeMap::from([(
            "endpoints.kubernetes.io/last-change-trigger-time".to_string(),
            "2024-01-01T00:00:00Z".to_string(),
        )]));
        assert!(!record(&mut seen, &annotated, endpoint_slice_fingerprint));

        let mut scaled = slice.clone();
        scaled.endpoints.push(ready_endpoint("10.0.0.2"));
        assert!(record(&mut seen, &scaled, endpoint_slice_fingerprint));
    }

    #[test]
    fn test_kinds_without_fingerprint_always_change() {
        let mut seen = HashMap::new();
        let slice = endpoint_slice("default", "a", "a", &[], &[]);
        assert!(record(&mut seen, &slice, no_fingerprint));
        assert!(record(&mut seen, &slice, no_fingerprint));
        assert!(seen.is_empty());
    }

    #[test]
    fn test_namespace_scope() {
        let caches = Caches::Namespaced(BTreeMap::from([("apps".to_string(), stores())]));
        assert!(caches.for_namespace("apps").is_ok());
        assert!(matches!(
            caches.for_namespace("kube-system"),
            Err(CoreError::NamespaceOutOfScope(ns)) if ns == "kube-system"
        ));
        assert_eq!(caches.all().len(), 1);

        let cluster = Caches::Cluster(stores());
        assert!(cluster.for_namespace("anything").is_ok());
    }

    #[test]
    fn test_status_patch_body() {
        let patch = status_patch(&[status_address("203.0.113.10"), status_address("lb.example.com")]);
        assert_eq!(
            patch,
            json!({
                "status": {
                    "loadBalancer": {
                        "ingress": [
                            {"ip": "203.0.113.10"},
                            {"hostname": "lb.example.com"},
                        ]
                    }
                }
            })
        );
    }

    #[test]
    fn test_initial_listing_matches_watched_namespaces() {
        let mut membership = NamespaceMembership::new(watched(&["apps", "web"]));
        assert!(!membership.observe(&Event::Init));
        assert!(!membership.observe(&Event::InitApply(namespace("web"))));
        assert!(!membership.observe(&Event::InitApply(namespace("apps"))));
        assert!(!membership.observe(&Event::InitDone));

        // Label churn on a watched namespace
        assert!(!membership.observe(&Event::Apply(namespace("apps"))));
    }

    #[test]
    fn test_new_matching_namespace_restarts_watch() {
        let mut membership = NamespaceMembership::new(watched(&["apps"]));
        assert!(membership.observe(&Event::Apply(namespace("team-b"))));
    }

    #[test]
    fn test_relabelled_namespace_restarts_watch() {
        let mut membership = NamespaceMembership::new(watched(&["apps"]));
        assert!(!membership.observe(&Event::Delete(namespace("elsewhere"))));
        assert!(membership.observe(&Event::Delete(namespace("apps"))));
    }

    #[test]
    fn test_relist_with_other_namespaces_restarts_watch() {
        let mut membership = NamespaceMembership::new(watched(&["apps"]));
        membership.observe(&Event::Init);
        membership.observe(&Event::InitApply(namespace("apps")));
        membership.observe(&Event::InitApply(namespace("team-b")));
        assert!(membership.observe(&Event::InitDone));
    }

    #[test]
    fn test_object_id() {
        let slice = endpoint_slice("apps", "web-xyz", "web", &[], &[]);
        assert_eq!(object_id(&slice), "apps/web-xyz");
    }
}
