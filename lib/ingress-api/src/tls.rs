//! TLS material shared by all routers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfiguration {
    /// Certificates keyed by `<namespace>.<secret>`
    #[serde(default)]
    pub certificates: BTreeMap<String, CertificatePair>,
}

impl TlsConfiguration {
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}

/// PEM-encoded certificate chain and private key
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificatePair {
    pub cert: String,
    pub key: String,
}
