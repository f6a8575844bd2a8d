//! Ingress status write-back
//!
//! Best effort: failures are logged and never affect configuration publication.

use crate::config::ProviderConfig;
use crate::store::ResourceStore;
use crate::Result;
use k8s_openapi::api::networking::v1::{Ingress, IngressLoadBalancerIngress};
use kube::ResourceExt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Addresses to publish on every handled Ingress, or `None` when nothing is configured
pub async fn published_addresses(
    store: &dyn ResourceStore,
    config: &ProviderConfig,
) -> Result<Option<Vec<IngressLoadBalancerIngress>>> {
    if !config.publish_status_address.is_empty() {
        return Ok(Some(
            config
                .publish_status_address
                .iter()
                .map(|address| status_address(address))
                .collect(),
        ));
    }

    let Some((namespace, name)) = config.publish_service() else {
        return Ok(None);
    };

    let Some(service) = store.get_service(namespace, name).await? else {
        warn!("Publish service {}/{} not found", namespace, name);
        return Ok(None);
    };

    let addresses = service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| {
            ingress
                .iter()
                .map(|lb| IngressLoadBalancerIngress {
                    ip: lb.ip.clone(),
                    hostname: lb.hostname.clone(),
                    ports: None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Some(addresses))
}

/// An IP literal goes to `ip`, anything else to `hostname`
pub fn status_address(address: &str) -> IngressLoadBalancerIngress {
    let address = address.trim();
    if address.parse::<IpAddr>().is_ok() {
        IngressLoadBalancerIngress {
            ip: Some(address.to_string()),
            ..Default::default()
        }
    } else {
        IngressLoadBalancerIngress {
            hostname: Some(address.to_string()),
            ..Default::default()
        }
    }
}

fn current_addresses(ingress: &Ingress) -> &[IngressLoadBalancerIngress] {
    ingress
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_deref())
        .unwrap_or_default()
}

/// Write `addresses` to every Ingress that does not already carry them.
/// Returns the number of Ingresses updated.
pub async fn update_statuses(
    store: &dyn ResourceStore,
    ingresses: &[Arc<Ingress>],
    addresses: &[IngressLoadBalancerIngress],
) -> usize {
    let mut updated = 0;
    for ingress in ingresses {
        if current_addresses(ingress) == addresses {
            continue;
        }

        let namespace = ingress.namespace().unwrap_or_default();
        let name = ingress.name_any();
        match store.update_ingress_status(ingress, addresses.to_vec()).await {
            Ok(()) => {
                debug!("Updated status of ingress {}/{}", namespace, name);
                updated += 1;
            }
            Err(err) => warn!(
                namespace = %namespace,
                ingress = %name,
                error = %err,
                "Failed to update ingress status"
            ),
        }
    }
    updated
}
