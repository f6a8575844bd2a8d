//! Resolution of Service backends into network addresses

use crate::annotations::IngressPolicy;
use crate::endpoint::BackendAddress;
use crate::store::ResourceStore;
use crate::{CoreError, Result};
use k8s_openapi::api::core::v1::ServicePort;
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointSlice};
use k8s_openapi::api::networking::v1::IngressServiceBackend;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

const EXTERNAL_NAME: &str = "ExternalName";

/// Addresses resolved for one (service, port) reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedBackend {
    /// Port component of the generated service key: the number, or the name when
    /// the backend references its port by name
    pub port_key: String,
    pub addresses: Vec<BackendAddress>,
}

/// Resolves Service references through the resource store. Read-only.
pub struct BackendResolver<'a> {
    store: &'a dyn ResourceStore,
    allow_external_name: bool,
}

impl<'a> BackendResolver<'a> {
    pub fn new(store: &'a dyn ResourceStore, allow_external_name: bool) -> Self {
        Self {
            store,
            allow_external_name,
        }
    }

    /// Resolve a backend Service in `namespace` to its current addresses
    pub async fn resolve(
        &self,
        namespace: &str,
        backend: &IngressServiceBackend,
        policy: &IngressPolicy,
    ) -> Result<ResolvedBackend> {
        let service_id = format!("{}/{}", namespace, backend.name);
        let service = self
            .store
            .get_service(namespace, &backend.name)
            .await?
            .ok_or_else(|| CoreError::ServiceNotFound(service_id.clone()))?;

        let spec = service.spec.clone().unwrap_or_default();
        let is_external_name = spec.type_.as_deref() == Some(EXTERNAL_NAME);
        if is_external_name && !self.allow_external_name {
            return Err(CoreError::ExternalNameDisallowed(service_id));
        }

        let (port_number, port_name) = requested_port(backend);
        let matched = spec
            .ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|p| port_matches(p, port_number, &port_name))
            .cloned()
            .ok_or_else(|| CoreError::PortNotFound {
                service: service_id.clone(),
                port: port_label(port_number, &port_name),
            })?;

        let port_key = port_label(port_number, &port_name);

        if is_external_name {
            let host = spec.external_name.unwrap_or_default();
            debug!("Resolved ExternalName service {} to {}", service_id, host);
            return Ok(ResolvedBackend {
                port_key,
                addresses: vec![BackendAddress::new(&host, matched.port)],
            });
        }

        if policy.service_upstream.unwrap_or(false) {
            let cluster_ip = spec
                .cluster_ip
                .filter(|ip| !ip.is_empty() && ip != "None")
                .ok_or_else(|| {
                    CoreError::MissingBackend(format!("service {} has no cluster IP", service_id))
                })?;
            return Ok(ResolvedBackend {
                port_key,
                addresses: vec![BackendAddress::new(&cluster_ip, matched.port)],
            });
        }

        let mut slices = self
            .store
            .get_endpoint_slices_for_service(namespace, &backend.name)
            .await?;
        // Slice order decides which duplicate wins; keep it stable
        slices.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let port_name = matched.name.clone().unwrap_or_default();
        let addresses = addresses_from_slices(&slices, &port_name);
        debug!(
            "Resolved service {} port {} to {} address(es)",
            service_id,
            port_key,
            addresses.len()
        );

        Ok(ResolvedBackend {
            port_key,
            addresses,
        })
    }
}

/// The requested port as (number, name). Zero/empty means unset.
fn requested_port(backend: &IngressServiceBackend) -> (i32, String) {
    let port = backend.port.clone().unwrap_or_default();
    (port.number.unwrap_or(0), port.name.unwrap_or_default())
}

/// Match by number when one is requested, otherwise by name. A request with neither
/// matches an unnamed port, which is how the default backend service is referenced.
fn port_matches(port: &ServicePort, number: i32, name: &str) -> bool {
    if number != 0 {
        return port.port == number;
    }
    port.name.as_deref().unwrap_or_default() == name
}

fn port_label(number: i32, name: &str) -> String {
    if number != 0 || name.is_empty() {
        number.to_string()
    } else {
        name.to_string()
    }
}

/// Collect serving addresses for the slice port named `port_name`, deduplicated by
/// exact address string across all slices, in sorted order.
pub fn addresses_from_slices(slices: &[Arc<EndpointSlice>], port_name: &str) -> Vec<BackendAddress> {
    let mut seen = HashSet::new();
    let mut addresses = Vec::new();

    for slice in slices {
        let port = slice
            .ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|p| p.name.as_deref().unwrap_or_default() == port_name)
            .and_then(|p| p.port);

        let Some(port) = port else {
            continue;
        };

        for endpoint in &slice.endpoints {
            if !is_serving(endpoint) {
                continue;
            }
            let fenced = is_fenced(endpoint);
            for address in &endpoint.addresses {
                let backend = BackendAddress::new(address, port).fenced(fenced);
                if seen.insert(backend.address.clone()) {
                    addresses.push(backend);
                }
            }
        }
    }

    addresses.sort();
    addresses
}

/// Ready endpoints serve; so do terminating endpoints that still report serving.
/// An unknown ready condition counts as ready.
fn is_serving(endpoint: &Endpoint) -> bool {
    let conditions = endpoint.conditions.clone().unwrap_or_default();
    conditions.ready.unwrap_or(true) || conditions.serving.unwrap_or(false)
}

fn is_fenced(endpoint: &Endpoint) -> bool {
    let conditions = endpoint.conditions.clone().unwrap_or_default();
    conditions.terminating.unwrap_or(false) && conditions.serving.unwrap_or(false)
}
