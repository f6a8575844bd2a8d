//! Cluster-backed resource store for the Ingress provider
//!
//! Reflectors cache Ingresses, IngressClasses, Services, EndpointSlices and Secrets
//! for the watched namespaces and report changes to the provider.

pub mod error;
pub mod store;

pub use error::{KubeStoreError, Result};
pub use store::KubeStore;
