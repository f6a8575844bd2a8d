use ingress_core::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KubeStoreError>;

#[derive(Error, Debug)]
pub enum KubeStoreError {
    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::error::Error),

    #[error("Cache for {0} did not become ready")]
    CacheNotReady(&'static str),

    #[error("Resources are not watched yet")]
    NotWatching,
}

impl From<KubeStoreError> for CoreError {
    fn from(err: KubeStoreError) -> Self {
        match err {
            KubeStoreError::KubernetesError(err) => CoreError::KubernetesError(err),
            other => CoreError::Store(other.to_string()),
        }
    }
}
