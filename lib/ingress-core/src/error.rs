use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("ExternalName services are disabled: {0}")]
    ExternalNameDisallowed(String),

    #[error("Port {port} not found on service {service}")]
    PortNotFound { service: String, port: String },

    #[error("Secret not found: {0}")]
    SecretNotFound(String),

    #[error("Invalid TLS material in secret {secret}: {reason}")]
    InvalidCertificate { secret: String, reason: String },

    #[error("Invalid ingress policy: {0}")]
    InvalidPolicy(String),

    #[error("Service {0} is already defined with a different load balancer")]
    ConflictingService(String),

    #[error("Missing backend: {0}")]
    MissingBackend(String),

    #[error("Namespace {0} is not watched")]
    NamespaceOutOfScope(String),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::error::Error),

    #[error("Resource store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl CoreError {
    /// Transport errors end the current watch and go through the provider's backoff.
    /// Everything else is scoped to one ingress, rule or path.
    pub fn is_transport(&self) -> bool {
        matches!(self, CoreError::KubernetesError(_) | CoreError::Store(_))
    }
}
