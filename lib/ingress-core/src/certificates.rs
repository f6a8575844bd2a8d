//! Loading of TLS material from Secrets

use crate::store::ResourceStore;
use crate::{CoreError, Result};
use ingress_api::CertificatePair;
use k8s_openapi::api::core::v1::Secret;
use rustls_pemfile::{certs, read_all, Item};
use std::collections::HashMap;
use std::io::BufReader;
use std::sync::Arc;
use tracing::debug;

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
pub const CA_CERT_KEY: &str = "ca.crt";

/// TLS material found in one Secret
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretMaterial {
    pub certificate: Option<CertificatePair>,
    /// PEM-encoded CA bundle
    pub ca: Option<String>,
}

/// Loads Secrets once per reconciliation pass
pub struct CertificateLoader<'a> {
    store: &'a dyn ResourceStore,
    cache: HashMap<(String, String), Arc<SecretMaterial>>,
}

impl<'a> CertificateLoader<'a> {
    pub fn new(store: &'a dyn ResourceStore) -> Self {
        Self {
            store,
            cache: HashMap::new(),
        }
    }

    /// Load and validate the TLS material of `namespace/name`
    pub async fn load(&mut self, namespace: &str, name: &str) -> Result<Arc<SecretMaterial>> {
        let key = (namespace.to_string(), name.to_string());
        if let Some(material) = self.cache.get(&key) {
            return Ok(material.clone());
        }

        let secret = self
            .store
            .get_secret(namespace, name)
            .await?
            .ok_or_else(|| CoreError::SecretNotFound(format!("{}/{}", namespace, name)))?;

        let material = Arc::new(material_from_secret(&secret, namespace, name)?);
        debug!(
            "Loaded TLS material from secret {}/{} (certificate: {}, ca: {})",
            namespace,
            name,
            material.certificate.is_some(),
            material.ca.is_some()
        );
        self.cache.insert(key, material.clone());
        Ok(material)
    }

    /// Number of distinct secrets loaded so far
    pub fn loaded(&self) -> usize {
        self.cache.len()
    }
}

/// Extract certificate/key and CA data from a Secret. Requires cert+key, a CA, or both.
pub fn material_from_secret(secret: &Secret, namespace: &str, name: &str) -> Result<SecretMaterial> {
    let invalid = |reason: String| CoreError::InvalidCertificate {
        secret: format!("{}/{}", namespace, name),
        reason,
    };

    let data = secret.data.clone().unwrap_or_default();
    let field = |key: &str| -> Result<Option<String>> {
        match data.get(key) {
            Some(bytes) if !bytes.0.is_empty() => String::from_utf8(bytes.0.clone())
                .map(Some)
                .map_err(|_| invalid(format!("{} is not valid UTF-8", key))),
            _ => Ok(None),
        }
    };

    let cert = field(TLS_CERT_KEY)?;
    let key = field(TLS_PRIVATE_KEY_KEY)?;
    let ca = field(CA_CERT_KEY)?;

    let certificate = match (cert, key) {
        (Some(cert), Some(key)) => {
            validate_certificates(cert.as_bytes()).map_err(&invalid)?;
            validate_private_key(key.as_bytes()).map_err(&invalid)?;
            Some(CertificatePair { cert, key })
        }
        (Some(_), None) => return Err(invalid(format!("{} without {}", TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY))),
        (None, Some(_)) => return Err(invalid(format!("{} without {}", TLS_PRIVATE_KEY_KEY, TLS_CERT_KEY))),
        (None, None) => None,
    };

    if let Some(ca) = &ca {
        validate_certificates(ca.as_bytes()).map_err(&invalid)?;
    }

    if certificate.is_none() && ca.is_none() {
        return Err(invalid(format!(
            "expected {} and {}, or {}",
            TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY, CA_CERT_KEY
        )));
    }

    Ok(SecretMaterial { certificate, ca })
}

fn validate_certificates(pem: &[u8]) -> std::result::Result<usize, String> {
    let mut reader = BufReader::new(pem);
    let parsed = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to parse certificates: {}", e))?;

    if parsed.is_empty() {
        return Err("no certificates found in PEM data".to_string());
    }
    Ok(parsed.len())
}

fn validate_private_key(pem: &[u8]) -> std::result::Result<(), String> {
    let mut reader = BufReader::new(pem);
    let items: Vec<_> = read_all(&mut reader)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| format!("failed to parse private key: {}", e))?;

    let has_key = items
        .iter()
        .any(|item| matches!(item, Item::Pkcs1Key(_) | Item::Pkcs8Key(_) | Item::Sec1Key(_)));
    if has_key {
        Ok(())
    } else {
        Err("no private key found in PEM data".to_string())
    }
}
