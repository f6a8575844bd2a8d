//! Kubernetes Ingress provider core
//!
//! This library provides:
//! - Decoding of `nginx.ingress.kubernetes.io/*` annotations into an ingress policy
//! - Backend resolution from Services and EndpointSlices
//! - Compilation of Ingresses into routers, services, middlewares and TLS material
//! - The reconciliation loop publishing configuration snapshots

pub mod annotations;
pub mod backend;
pub mod certificates;
pub mod classes;
pub mod compiler;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod keys;
pub mod provider;
pub mod status;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod throttle;

pub use annotations::{decode, IngressPolicy};
pub use backend::{BackendResolver, ResolvedBackend};
pub use certificates::CertificateLoader;
pub use compiler::{compile_all, Compiler};
pub use config::ProviderConfig;
pub use endpoint::BackendAddress;
pub use error::{CoreError, Result};
pub use provider::Provider;
pub use store::{ResourceEvent, ResourceStore};
