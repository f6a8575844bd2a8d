//! Compilation of Ingresses into a routing snapshot
//!
//! A [`Compiler`] lives for one reconciliation pass. Every Ingress is compiled
//! independently: a failing path, rule or TLS secret is logged and skipped while the
//! rest of the Ingress (and of the cluster) still produces routes. Only transport
//! errors from the resource store abort the pass.

pub mod middlewares;
pub mod rules;

use crate::annotations::{self, IngressPolicy};
use crate::backend::{BackendResolver, ResolvedBackend};
use crate::certificates::CertificateLoader;
use crate::config::ProviderConfig;
use crate::keys;
use crate::store::ResourceStore;
use crate::{CoreError, Result};
use ingress_api::{
    Cookie, DynamicConfiguration, Router, RouterTls, Server, ServersLoadBalancer,
    ServersTransport, Service, Sticky, TcpRouter, TcpRouterTls, TcpServer, TcpServersLoadBalancer,
    TcpService,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, Ingress, IngressBackend, IngressRule, IngressServiceBackend, IngressSpec,
    IngressTLS,
};
use kube::ResourceExt;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_COOKIE_NAME: &str = "INGRESSCOOKIE";

/// Catch-all routers lose against every other rule
pub const DEFAULT_BACKEND_PRIORITY: i32 = i32::MIN;

/// Compile `ingresses` into one snapshot, in namespace/name order
pub async fn compile_all(
    store: &dyn ResourceStore,
    config: &ProviderConfig,
    ingresses: &[Arc<Ingress>],
) -> Result<DynamicConfiguration> {
    let mut ordered: Vec<&Arc<Ingress>> = ingresses.iter().collect();
    ordered.sort_by_key(|ingress| (ingress.namespace().unwrap_or_default(), ingress.name_any()));

    let mut compiler = Compiler::new(store, config);
    for ingress in ordered {
        compiler.compile_ingress(ingress).await?;
    }
    compiler.finish().await
}

/// Accumulates the snapshot of one reconciliation pass
pub struct Compiler<'a> {
    store: &'a dyn ResourceStore,
    resolver: BackendResolver<'a>,
    certificates: CertificateLoader<'a>,
    config: &'a ProviderConfig,
    conf: DynamicConfiguration,
    default_backend_claimed: bool,
}

impl<'a> Compiler<'a> {
    pub fn new(store: &'a dyn ResourceStore, config: &'a ProviderConfig) -> Self {
        Self {
            store,
            resolver: BackendResolver::new(store, !config.disable_external_name_services),
            certificates: CertificateLoader::new(store),
            config,
            conf: DynamicConfiguration::new(),
            default_backend_claimed: false,
        }
    }

    /// Add the routes of one Ingress. Returns an error only for transport failures.
    pub async fn compile_ingress(&mut self, ingress: &Ingress) -> Result<()> {
        let namespace = ingress.namespace().unwrap_or_default();
        let name = ingress.name_any();
        let policy = annotations::decode(ingress.annotations());
        let spec = ingress.spec.clone().unwrap_or_default();

        let tls = spec.tls.as_deref().unwrap_or_default();
        let has_tls = !tls.is_empty();
        self.load_tls(&namespace, &name, tls).await?;

        let rules = spec.rules.as_deref().unwrap_or_default();

        if rules.is_empty() {
            if let Some(backend) = &spec.default_backend {
                match self.compile_default_backend(&namespace, backend, &policy).await {
                    Ok(()) => {}
                    Err(err) if err.is_transport() => return Err(err),
                    Err(err) => warn!(
                        namespace = %namespace,
                        ingress = %name,
                        error = %err,
                        "Skipping default backend"
                    ),
                }
            }
            return Ok(());
        }

        for (rule_index, rule) in rules.iter().enumerate() {
            if policy.ssl_passthrough.unwrap_or(false) {
                match self
                    .compile_passthrough(&namespace, &name, rule_index, rule, &spec, &policy)
                    .await
                {
                    Ok(fragment) => self.merge(fragment),
                    Err(err) if err.is_transport() => return Err(err),
                    Err(err) => warn!(
                        namespace = %namespace,
                        ingress = %name,
                        rule = rule_index,
                        error = %err,
                        "Skipping passthrough rule"
                    ),
                }
                continue;
            }

            let host = rule.host.as_deref();
            let paths = rule
                .http
                .as_ref()
                .map(|http| http.paths.as_slice())
                .unwrap_or_default();

            for (path_index, path) in paths.iter().enumerate() {
                let target = PathTarget {
                    namespace: &namespace,
                    ingress: &name,
                    rule: rule_index,
                    path: path_index,
                    host,
                };
                match self.compile_path(&target, path, &policy, has_tls).await {
                    Ok(fragment) => self.merge(fragment),
                    Err(err) if err.is_transport() => return Err(err),
                    Err(err) => warn!(
                        namespace = %namespace,
                        ingress = %name,
                        rule = rule_index,
                        path = path_index,
                        error = %err,
                        "Skipping path"
                    ),
                }
            }
        }

        Ok(())
    }

    /// Add the provider default backend unless an Ingress claimed it, and return the snapshot
    pub async fn finish(mut self) -> Result<DynamicConfiguration> {
        let config = self.config;
        if !self.default_backend_claimed {
            if let Some((namespace, name)) = config.default_backend() {
                let backend = IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: name.to_string(),
                        port: None,
                    }),
                    resource: None,
                };
                match self
                    .compile_default_backend(namespace, &backend, &IngressPolicy::default())
                    .await
                {
                    Ok(()) => {}
                    Err(err) if err.is_transport() => return Err(err),
                    Err(err) => warn!(
                        namespace = %namespace,
                        service = %name,
                        error = %err,
                        "Skipping configured default backend"
                    ),
                }
            }
        }

        debug!(
            "Compiled {} HTTP router(s), {} TCP router(s), {} certificate(s) from {} secret(s)",
            self.conf.http.routers.len(),
            self.conf.tcp.routers.len(),
            self.conf.tls.certificates.len(),
            self.certificates.loaded()
        );
        Ok(self.conf)
    }

    async fn load_tls(&mut self, namespace: &str, ingress: &str, tls: &[IngressTLS]) -> Result<()> {
        for entry in tls {
            let Some(secret) = entry.secret_name.as_deref().filter(|s| !s.is_empty()) else {
                continue;
            };

            match self.certificates.load(namespace, secret).await {
                Ok(material) => match &material.certificate {
                    Some(pair) => insert_first(
                        &mut self.conf.tls.certificates,
                        keys::certificate(namespace, secret),
                        pair.clone(),
                        "certificate",
                    ),
                    None => warn!(
                        namespace = %namespace,
                        ingress = %ingress,
                        "Secret {} holds no certificate, skipping",
                        secret
                    ),
                },
                Err(err) if err.is_transport() => return Err(err),
                Err(err) => warn!(
                    namespace = %namespace,
                    ingress = %ingress,
                    error = %err,
                    "Skipping TLS secret {}",
                    secret
                ),
            }
        }
        Ok(())
    }

    async fn compile_default_backend(
        &mut self,
        namespace: &str,
        backend: &IngressBackend,
        policy: &IngressPolicy,
    ) -> Result<()> {
        if self.default_backend_claimed {
            warn!(
                "Default backend already defined, ignoring the one in namespace {}",
                namespace
            );
            return Ok(());
        }

        let service = service_backend(backend)?;
        let resolved = self.resolver.resolve(namespace, service, policy).await?;
        let scheme = backend_scheme(policy);

        let mut fragment = DynamicConfiguration::new();
        fragment.http.services.insert(
            keys::DEFAULT_BACKEND.to_string(),
            http_service(&resolved, scheme, policy),
        );
        let router = Router {
            rule: rules::MATCH_ALL.to_string(),
            priority: Some(DEFAULT_BACKEND_PRIORITY),
            service: keys::DEFAULT_BACKEND.to_string(),
            middlewares: Vec::new(),
            tls: None,
        };
        fragment.http.routers.insert(
            keys::DEFAULT_BACKEND_TLS.to_string(),
            Router {
                tls: Some(RouterTls::default()),
                ..router.clone()
            },
        );
        fragment
            .http
            .routers
            .insert(keys::DEFAULT_BACKEND.to_string(), router);

        self.merge(fragment);
        self.default_backend_claimed = true;
        debug!(
            "Default backend set to {}/{} ({} server(s))",
            namespace,
            service.name,
            resolved.addresses.len()
        );
        Ok(())
    }

    async fn compile_passthrough(
        &mut self,
        namespace: &str,
        ingress: &str,
        rule_index: usize,
        rule: &IngressRule,
        spec: &IngressSpec,
        policy: &IngressPolicy,
    ) -> Result<DynamicConfiguration> {
        let host = rule
            .host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| CoreError::InvalidPolicy("ssl-passthrough requires a host".to_string()))?;

        let backend = match &rule.http {
            Some(http) => http
                .paths
                .iter()
                .find(|path| path.path.as_deref() == Some("/"))
                .map(|path| &path.backend),
            None => spec.default_backend.as_ref(),
        }
        .ok_or_else(|| {
            CoreError::MissingBackend(format!("no root path backend for passthrough host {}", host))
        })?;

        let service = service_backend(backend)?;
        let resolved = self.resolver.resolve(namespace, service, policy).await?;
        let service_key = keys::service(namespace, &service.name, &resolved.port_key);

        let mut fragment = DynamicConfiguration::new();
        fragment.tcp.services.insert(
            service_key.clone(),
            TcpService {
                load_balancer: TcpServersLoadBalancer {
                    servers: resolved
                        .addresses
                        .iter()
                        .map(|a| TcpServer {
                            address: a.address.clone(),
                        })
                        .collect(),
                },
            },
        );
        fragment.tcp.routers.insert(
            keys::passthrough_router(namespace, ingress, rule_index),
            TcpRouter {
                rule: rules::host_sni(host),
                service: service_key,
                tls: Some(TcpRouterTls { passthrough: true }),
            },
        );
        self.check_conflicts(&fragment)?;
        Ok(fragment)
    }

    async fn compile_path(
        &mut self,
        target: &PathTarget<'_>,
        path: &HTTPIngressPath,
        policy: &IngressPolicy,
        has_tls: bool,
    ) -> Result<DynamicConfiguration> {
        let backend = service_backend(&path.backend)?;
        let resolved = self.resolver.resolve(target.namespace, backend, policy).await?;
        let scheme = backend_scheme(policy);

        let mut fragment = DynamicConfiguration::new();
        let mut service = http_service(&resolved, scheme, policy);
        if scheme == "https" {
            let transport_key = keys::servers_transport(target.namespace, target.ingress);
            let transport = self.servers_transport(target.namespace, policy).await?;
            fragment
                .http
                .servers_transports
                .insert(transport_key.clone(), transport);
            service.load_balancer.servers_transport = Some(transport_key);
        }

        let service_key = keys::service(target.namespace, &backend.name, &resolved.port_key);
        fragment.http.services.insert(service_key.clone(), service);

        let router_key = keys::router(target.namespace, target.ingress, target.rule, target.path);
        let mut router = Router {
            rule: rules::build_rule(
                target.host,
                path.path.as_deref(),
                &path.path_type,
                policy.use_regex.unwrap_or(false),
            ),
            priority: None,
            service: service_key,
            middlewares: Vec::new(),
            tls: has_tls.then(RouterTls::default),
        };

        let mut chain = Vec::new();
        chain.extend(middlewares::auth(self.store, target.namespace, &router_key, policy).await?);
        chain.extend(middlewares::forward_auth(&router_key, policy)?);
        chain.extend(middlewares::cors(&router_key, policy));
        chain.extend(middlewares::allow_list(&router_key, policy));
        chain.extend(middlewares::rate_limit(&router_key, policy));
        chain.extend(middlewares::buffering(&router_key, policy));
        for (key, middleware) in chain {
            debug!(router = %router_key, "Attaching {} middleware {}", middleware.kind(), key);
            router.middlewares.push(key.clone());
            fragment.http.middlewares.insert(key, middleware);
        }

        middlewares::apply_ssl_redirect(&router_key, &mut router, policy, has_tls, &mut fragment);
        fragment.http.routers.insert(router_key, router);
        self.check_conflicts(&fragment)?;
        Ok(fragment)
    }

    async fn servers_transport(
        &mut self,
        namespace: &str,
        policy: &IngressPolicy,
    ) -> Result<ServersTransport> {
        let mut transport = ServersTransport {
            insecure_skip_verify: !is_on(&policy.proxy_ssl_verify),
            ..Default::default()
        };

        if is_on(&policy.proxy_ssl_server_name) {
            transport.server_name = policy.proxy_ssl_name.clone().filter(|n| !n.is_empty());
        }

        if let Some(reference) = policy.proxy_ssl_secret.as_deref().map(str::trim) {
            if !reference.is_empty() {
                let (secret_namespace, secret_name) =
                    middlewares::split_reference(reference, namespace);
                let material = self.certificates.load(secret_namespace, secret_name).await?;
                transport.root_cas.extend(material.ca.clone());
                transport.certificates.extend(material.certificate.clone());
            }
        }

        Ok(transport)
    }

    /// Services are shared by key across Ingresses. A staged service must equal any
    /// earlier definition, otherwise its routes would run with another Ingress's policy.
    fn check_conflicts(&self, fragment: &DynamicConfiguration) -> Result<()> {
        for (key, service) in &fragment.http.services {
            if self.conf.http.services.get(key).is_some_and(|existing| existing != service) {
                return Err(CoreError::ConflictingService(key.clone()));
            }
        }
        for (key, service) in &fragment.tcp.services {
            if self.conf.tcp.services.get(key).is_some_and(|existing| existing != service) {
                return Err(CoreError::ConflictingService(key.clone()));
            }
        }
        Ok(())
    }

    fn merge(&mut self, fragment: DynamicConfiguration) {
        let DynamicConfiguration { http, tcp, tls } = fragment;
        let conf = &mut self.conf;
        merge_map(&mut conf.http.routers, http.routers, "router");
        merge_map(&mut conf.http.services, http.services, "service");
        merge_map(&mut conf.http.middlewares, http.middlewares, "middleware");
        merge_map(&mut conf.http.servers_transports, http.servers_transports, "servers transport");
        merge_map(&mut conf.tcp.routers, tcp.routers, "TCP router");
        merge_map(&mut conf.tcp.services, tcp.services, "TCP service");
        merge_map(&mut conf.tls.certificates, tls.certificates, "certificate");
    }
}

/// Where a path lives: its Ingress, rule and path indices, and the rule host
struct PathTarget<'a> {
    namespace: &'a str,
    ingress: &'a str,
    rule: usize,
    path: usize,
    host: Option<&'a str>,
}

fn merge_map<V: PartialEq>(target: &mut BTreeMap<String, V>, entries: BTreeMap<String, V>, kind: &str) {
    for (key, value) in entries {
        insert_first(target, key, value, kind);
    }
}

/// Keep the first definition of a key; a differing later one is dropped with a warning
fn insert_first<V: PartialEq>(target: &mut BTreeMap<String, V>, key: String, value: V, kind: &str) {
    match target.entry(key) {
        Entry::Vacant(entry) => {
            entry.insert(value);
        }
        Entry::Occupied(entry) => {
            if *entry.get() != value {
                warn!("Conflicting definitions for {} {}, keeping the first", kind, entry.key());
            }
        }
    }
}

fn service_backend(backend: &IngressBackend) -> Result<&IngressServiceBackend> {
    backend.service.as_ref().ok_or_else(|| {
        CoreError::MissingBackend("only service backends are supported".to_string())
    })
}

/// URL scheme for `backend-protocol`
pub fn backend_scheme(policy: &IngressPolicy) -> &'static str {
    let protocol = policy
        .backend_protocol
        .as_deref()
        .map(str::to_ascii_uppercase)
        .unwrap_or_default();
    match protocol.as_str() {
        "HTTPS" | "GRPCS" => "https",
        "GRPC" => "h2c",
        _ => "http",
    }
}

fn http_service(resolved: &ResolvedBackend, scheme: &str, policy: &IngressPolicy) -> Service {
    Service {
        load_balancer: ServersLoadBalancer {
            servers: resolved
                .addresses
                .iter()
                .map(|a| Server {
                    url: format!("{}://{}", scheme, a.address),
                    fenced: a.fenced,
                })
                .collect(),
            sticky: sticky(policy),
            pass_host_header: true,
            servers_transport: None,
        },
    }
}

fn sticky(policy: &IngressPolicy) -> Option<Sticky> {
    let affinity = policy.affinity.as_deref()?;
    if !affinity.eq_ignore_ascii_case("cookie") {
        return None;
    }

    Some(Sticky {
        cookie: Cookie {
            name: policy
                .session_cookie_name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| DEFAULT_COOKIE_NAME.to_string()),
            secure: policy.session_cookie_secure.unwrap_or(false),
            http_only: true,
            same_site: policy.session_cookie_same_site.clone(),
            domain: policy.session_cookie_domain.clone(),
            path: policy.session_cookie_path.clone(),
            max_age: policy.session_cookie_max_age,
        },
    })
}

fn is_on(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| v.eq_ignore_ascii_case("on"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificates::{CA_CERT_KEY, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};
    use crate::store::memory::InMemoryStore;
    use crate::testing::*;
    use ingress_api::{BasicAuth, Middleware, NOOP_SERVICE};

    async fn compile(store: &InMemoryStore, config: &ProviderConfig) -> DynamicConfiguration {
        let ingresses = store.list_ingresses().await.unwrap();
        compile_all(store, config, &ingresses).await.unwrap()
    }

    async fn whoami(store: &InMemoryStore, addresses: &[&str]) {
        store
            .apply_service(cluster_service("default", "whoami", &[(None, 80)]))
            .await;
        let endpoints: Vec<_> = addresses.iter().map(|a| ready_endpoint(a)).collect();
        store
            .apply_endpoint_slice(endpoint_slice("default", "whoami-abc", "whoami", &[(None, 80)], &endpoints))
            .await;
    }

    fn urls(service: &Service) -> Vec<&str> {
        service
            .load_balancer
            .servers
            .iter()
            .map(|s| s.url.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_basic_auth_ingress() {
        let store = InMemoryStore::new();
        whoami(&store, &["10.10.0.1", "10.10.0.2"]).await;
        store
            .apply_secret(secret(
                "default",
                "basic-auth",
                &[("auth", "user:{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=")],
            ))
            .await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "whoami")
                    .annotation("auth-type", "basic")
                    .annotation("auth-secret", "basic-auth")
                    .rule(
                        Some("whoami.localhost"),
                        vec![http_path("/basicauth", Some("Exact"), "whoami", 80)],
                    )
                    .build(),
            )
            .await;

        let conf = compile(&store, &ProviderConfig::default()).await;

        assert_eq!(conf.http.routers.len(), 1);
        let router = &conf.http.routers["default.whoami-rule-0-path-0"];
        assert_eq!(router.rule, "Host(`whoami.localhost`) && Path(`/basicauth`)");
        assert_eq!(router.service, "default.whoami.80");
        assert_eq!(router.middlewares, vec!["default.whoami-rule-0-path-0-basic-auth"]);
        assert!(router.tls.is_none());

        assert_eq!(
            conf.http.middlewares["default.whoami-rule-0-path-0-basic-auth"],
            Middleware::BasicAuth(BasicAuth {
                users: vec!["user:{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=".to_string()],
                realm: "Authentication Required".to_string(),
            })
        );

        assert_eq!(conf.http.services.len(), 1);
        let service = &conf.http.services["default.whoami.80"];
        assert_eq!(urls(service), vec!["http://10.10.0.1:80", "http://10.10.0.2:80"]);
        assert!(service.load_balancer.pass_host_header);
    }

    #[tokio::test]
    async fn test_ssl_passthrough() {
        let store = InMemoryStore::new();
        store
            .apply_service(cluster_service("default", "whoami-tls", &[(None, 443)]))
            .await;
        store
            .apply_endpoint_slice(endpoint_slice(
                "default",
                "whoami-tls-abc",
                "whoami-tls",
                &[(None, 8443)],
                &[ready_endpoint("10.10.0.5"), ready_endpoint("10.10.0.6")],
            ))
            .await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "passthrough")
                    .annotation("ssl-passthrough", "true")
                    .rule(
                        Some("passthrough.whoami.localhost"),
                        vec![http_path("/", None, "whoami-tls", 443)],
                    )
                    .build(),
            )
            .await;

        let conf = compile(&store, &ProviderConfig::default()).await;

        assert!(conf.http.is_empty());
        assert_eq!(conf.tcp.routers.len(), 1);
        let router = &conf.tcp.routers["default.passthrough-rule-0-passthrough"];
        assert_eq!(router.rule, "HostSNI(`passthrough.whoami.localhost`)");
        assert_eq!(router.tls, Some(TcpRouterTls { passthrough: true }));

        assert_eq!(conf.tcp.services.len(), 1);
        let addresses: Vec<_> = conf.tcp.services[&router.service]
            .load_balancer
            .servers
            .iter()
            .map(|s| s.address.as_str())
            .collect();
        assert_eq!(addresses, vec!["10.10.0.5:8443", "10.10.0.6:8443"]);
    }

    #[tokio::test]
    async fn test_passthrough_requires_host_and_root_path() {
        let store = InMemoryStore::new();
        whoami(&store, &["10.10.0.1"]).await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "no-host")
                    .annotation("ssl-passthrough", "true")
                    .rule(None, vec![http_path("/", None, "whoami", 80)])
                    .build(),
            )
            .await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "no-root")
                    .annotation("ssl-passthrough", "true")
                    .rule(Some("a.localhost"), vec![http_path("/api", None, "whoami", 80)])
                    .build(),
            )
            .await;

        let conf = compile(&store, &ProviderConfig::default()).await;
        assert!(conf.is_empty());
    }

    #[tokio::test]
    async fn test_external_name_services() {
        let store = InMemoryStore::new();
        store
            .apply_service(external_service("default", "external-1", "backend1", 80))
            .await;
        store
            .apply_service(external_service("default", "external-2", "backend2", 8080))
            .await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "external")
                    .rule(Some("one.localhost"), vec![http_path("/test", None, "external-1", 80)])
                    .rule(Some("two.localhost"), vec![http_path("/test", None, "external-2", 8080)])
                    .build(),
            )
            .await;

        let conf = compile(&store, &ProviderConfig::default()).await;
        assert_eq!(urls(&conf.http.services["default.external-1.80"]), vec!["http://backend1:80"]);
        assert_eq!(urls(&conf.http.services["default.external-2.8080"]), vec!["http://backend2:8080"]);

        let disabled = ProviderConfig {
            disable_external_name_services: true,
            ..Default::default()
        };
        assert!(compile(&store, &disabled).await.is_empty());
    }

    #[tokio::test]
    async fn test_cors_toggle() {
        let store = InMemoryStore::new();
        whoami(&store, &["10.10.0.1"]).await;
        let ingress = |enabled: &str| {
            IngressBuilder::new("default", "cors")
                .annotation("enable-cors", enabled)
                .rule(Some("cors.localhost"), vec![http_path("/", None, "whoami", 80)])
                .build()
        };
        let router_key = "default.cors-rule-0-path-0";

        store.apply_ingress(ingress("false")).await;
        let before = compile(&store, &ProviderConfig::default()).await;
        assert!(before.http.middlewares.is_empty());
        assert!(before.http.routers[router_key].middlewares.is_empty());

        store.apply_ingress(ingress("true")).await;
        let enabled = compile(&store, &ProviderConfig::default()).await;
        assert_eq!(enabled.http.middlewares.len(), 1);
        assert!(enabled.http.middlewares.contains_key("default.cors-rule-0-path-0-cors"));
        assert_eq!(
            enabled.http.routers[router_key].middlewares,
            vec!["default.cors-rule-0-path-0-cors"]
        );

        store.apply_ingress(ingress("false")).await;
        assert_eq!(compile(&store, &ProviderConfig::default()).await, before);
    }

    #[tokio::test]
    async fn test_compilation_is_deterministic() {
        let build = |order: &[usize]| {
            let ingresses = [
                IngressBuilder::new("default", "b")
                    .annotation("enable-cors", "true")
                    .rule(Some("b.localhost"), vec![http_path("/", None, "whoami", 80)])
                    .build(),
                IngressBuilder::new("apps", "a")
                    .rule(Some("a.localhost"), vec![http_path("/x", None, "whoami", 80)])
                    .build(),
                IngressBuilder::new("default", "a")
                    .rule(Some("c.localhost"), vec![http_path("/y", Some("Exact"), "whoami", 80)])
                    .build(),
            ];
            order.iter().map(|i| Arc::new(ingresses[*i].clone())).collect::<Vec<_>>()
        };

        let store = InMemoryStore::new();
        whoami(&store, &["10.10.0.2", "10.10.0.1"]).await;
        store
            .apply_service(cluster_service("apps", "whoami", &[(None, 80)]))
            .await;

        let config = ProviderConfig::default();
        let first = compile_all(&store, &config, &build(&[0, 1, 2])).await.unwrap();
        let second = compile_all(&store, &config, &build(&[2, 0, 1])).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_tls_ingress_redirects_to_https() {
        let store = InMemoryStore::new();
        whoami(&store, &["10.10.0.1"]).await;
        store
            .apply_secret(secret(
                "default",
                "whoami-tls",
                &[(TLS_CERT_KEY, TEST_CERT), (TLS_PRIVATE_KEY_KEY, TEST_KEY)],
            ))
            .await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "secure")
                    .annotation("enable-cors", "true")
                    .tls(&["secure.localhost"], Some("whoami-tls"))
                    .rule(Some("secure.localhost"), vec![http_path("/", None, "whoami", 80)])
                    .build(),
            )
            .await;

        let conf = compile(&store, &ProviderConfig::default()).await;

        assert_eq!(conf.tls.certificates["default.whoami-tls"].cert, TEST_CERT);

        let key = "default.secure-rule-0-path-0";
        assert!(conf.http.routers[key].tls.is_some());
        let redirect = &conf.http.routers["default.secure-rule-0-path-0-redirect"];
        assert_eq!(redirect.service, NOOP_SERVICE);
        assert_eq!(
            redirect.middlewares.last().map(String::as_str),
            Some("default.secure-rule-0-path-0-redirect-scheme")
        );
        assert_eq!(redirect.middlewares.len(), 2);
        assert!(!conf.http.routers.contains_key("default.secure-rule-0-path-0-http"));
    }

    #[tokio::test]
    async fn test_tls_without_redirect_keeps_plain_sibling() {
        let store = InMemoryStore::new();
        whoami(&store, &["10.10.0.1"]).await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "both")
                    .annotation("ssl-redirect", "false")
                    .tls(&["both.localhost"], Some("missing"))
                    .rule(Some("both.localhost"), vec![http_path("/", None, "whoami", 80)])
                    .build(),
            )
            .await;

        let conf = compile(&store, &ProviderConfig::default()).await;

        // A broken TLS secret only drops the certificate
        assert!(conf.tls.certificates.is_empty());
        assert!(conf.http.routers["default.both-rule-0-path-0"].tls.is_some());
        let sibling = &conf.http.routers["default.both-rule-0-path-0-http"];
        assert!(sibling.tls.is_none());
        assert_eq!(sibling.service, "default.whoami.80");
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_path() {
        let store = InMemoryStore::new();
        whoami(&store, &["10.10.0.1"]).await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "mixed")
                    .rule(
                        Some("mixed.localhost"),
                        vec![
                            http_path("/missing", None, "absent", 80),
                            http_path("/ok", None, "whoami", 80),
                            http_path("/wrong-port", None, "whoami", 8080),
                        ],
                    )
                    .build(),
            )
            .await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "bad-auth")
                    .annotation("auth-type", "oauth")
                    .annotation("auth-secret", "users")
                    .rule(Some("auth.localhost"), vec![http_path("/", None, "whoami", 80)])
                    .build(),
            )
            .await;

        let conf = compile(&store, &ProviderConfig::default()).await;

        let routers: Vec<_> = conf.http.routers.keys().map(String::as_str).collect();
        assert_eq!(routers, vec!["default.mixed-rule-0-path-1"]);
        let services: Vec<_> = conf.http.services.keys().map(String::as_str).collect();
        assert_eq!(services, vec!["default.whoami.80"]);
    }

    #[tokio::test]
    async fn test_ingress_default_backend_wins_over_configured_one() {
        let store = InMemoryStore::new();
        whoami(&store, &["10.10.0.1"]).await;
        store
            .apply_service(cluster_service("infra", "fallback", &[(None, 80)]))
            .await;
        store
            .apply_ingress(IngressBuilder::new("default", "catch-all").default_backend("whoami", 80).build())
            .await;
        store
            .apply_ingress(IngressBuilder::new("default", "second").default_backend("whoami", 80).build())
            .await;
        let config = ProviderConfig {
            default_backend_service: Some("infra/fallback".to_string()),
            ..Default::default()
        };

        let conf = compile(&store, &config).await;

        let routers: Vec<_> = conf.http.routers.keys().map(String::as_str).collect();
        assert_eq!(routers, vec!["default-backend", "default-backend-tls"]);
        assert_eq!(conf.http.routers["default-backend"].rule, "PathPrefix(`/`)");
        assert_eq!(conf.http.routers["default-backend"].priority, Some(i32::MIN));
        assert!(conf.http.routers["default-backend-tls"].tls.is_some());
        assert_eq!(urls(&conf.http.services["default-backend"]), vec!["http://10.10.0.1:80"]);
    }

    #[tokio::test]
    async fn test_configured_default_backend() {
        let store = InMemoryStore::new();
        store
            .apply_service(cluster_service("infra", "fallback", &[(None, 80)]))
            .await;
        store
            .apply_endpoint_slice(endpoint_slice(
                "infra",
                "fallback-abc",
                "fallback",
                &[(None, 8080)],
                &[ready_endpoint("10.20.0.1")],
            ))
            .await;
        let config = ProviderConfig {
            default_backend_service: Some("infra/fallback".to_string()),
            ..Default::default()
        };

        let conf = compile(&store, &config).await;
        assert_eq!(conf.http.routers.len(), 2);
        assert_eq!(urls(&conf.http.services["default-backend"]), vec!["http://10.20.0.1:8080"]);

        assert!(compile(&store, &ProviderConfig::default()).await.is_empty());
    }

    #[tokio::test]
    async fn test_https_backend_with_servers_transport() {
        let store = InMemoryStore::new();
        whoami(&store, &["10.10.0.1"]).await;
        store
            .apply_secret(secret(
                "certs",
                "upstream",
                &[
                    (CA_CERT_KEY, TEST_CERT),
                    (TLS_CERT_KEY, TEST_CERT),
                    (TLS_PRIVATE_KEY_KEY, TEST_KEY),
                ],
            ))
            .await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "upstream")
                    .annotation("backend-protocol", "HTTPS")
                    .annotation("proxy-ssl-secret", "certs/upstream")
                    .annotation("proxy-ssl-verify", "on")
                    .annotation("proxy-ssl-server-name", "on")
                    .annotation("proxy-ssl-name", "whoami.internal")
                    .rule(Some("up.localhost"), vec![http_path("/", None, "whoami", 80)])
                    .build(),
            )
            .await;

        let conf = compile(&store, &ProviderConfig::default()).await;

        let service = &conf.http.services["default.whoami.80"];
        assert_eq!(urls(service), vec!["https://10.10.0.1:80"]);
        assert_eq!(service.load_balancer.servers_transport.as_deref(), Some("default.upstream"));

        let transport = &conf.http.servers_transports["default.upstream"];
        assert_eq!(transport.server_name.as_deref(), Some("whoami.internal"));
        assert!(!transport.insecure_skip_verify);
        assert_eq!(transport.root_cas, vec![TEST_CERT.to_string()]);
        assert_eq!(transport.certificates.len(), 1);
    }

    #[tokio::test]
    async fn test_sticky_cookie_and_grpc_scheme() {
        let store = InMemoryStore::new();
        whoami(&store, &["10.10.0.1"]).await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "sticky")
                    .annotation("affinity", "cookie")
                    .annotation("session-cookie-max-age", "3600")
                    .annotation("backend-protocol", "GRPC")
                    .rule(Some("*.sticky.localhost"), vec![http_path("/", None, "whoami", 80)])
                    .build(),
            )
            .await;

        let conf = compile(&store, &ProviderConfig::default()).await;

        let service = &conf.http.services["default.whoami.80"];
        assert_eq!(urls(service), vec!["h2c://10.10.0.1:80"]);
        let cookie = &service.load_balancer.sticky.as_ref().unwrap().cookie;
        assert_eq!(cookie.name, DEFAULT_COOKIE_NAME);
        assert!(cookie.http_only);
        assert_eq!(cookie.max_age, Some(3600));

        assert_eq!(
            conf.http.routers["default.sticky-rule-0-path-0"].rule,
            "HostRegexp(`^[a-zA-Z0-9-]+\\.sticky\\.localhost$`) && PathPrefix(`/`)"
        );
    }

    #[tokio::test]
    async fn test_middleware_order() {
        let store = InMemoryStore::new();
        whoami(&store, &["10.10.0.1"]).await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "ordered")
                    .annotation("auth-url", "http://auth.default.svc/verify")
                    .annotation("enable-cors", "true")
                    .annotation("whitelist-source-range", "10.0.0.0/8, 192.168.0.0/16")
                    .annotation("limit-rps", "5")
                    .annotation("proxy-body-size", "1m")
                    .annotation("force-ssl-redirect", "true")
                    .rule(Some("o.localhost"), vec![http_path("/", None, "whoami", 80)])
                    .build(),
            )
            .await;

        let conf = compile(&store, &ProviderConfig::default()).await;

        let prefix = "default.ordered-rule-0-path-0";
        let expected: Vec<String> = ["forward-auth", "cors", "allowlist", "rate-limit", "buffering"]
            .iter()
            .map(|kind| format!("{}-{}", prefix, kind))
            .collect();
        assert_eq!(conf.http.routers[prefix].middlewares, expected);

        let mut redirect_chain = expected.clone();
        redirect_chain.push(format!("{}-redirect-scheme", prefix));
        assert_eq!(
            conf.http.routers[&format!("{}-redirect", prefix)].middlewares,
            redirect_chain
        );
    }

    #[tokio::test]
    async fn test_conflicting_service_policy_skips_the_later_path() {
        let store = InMemoryStore::new();
        whoami(&store, &["10.10.0.1"]).await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "a-plain")
                    .rule(Some("a.localhost"), vec![http_path("/", None, "whoami", 80)])
                    .build(),
            )
            .await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "b-tls")
                    .annotation("backend-protocol", "HTTPS")
                    .annotation("affinity", "cookie")
                    .rule(Some("b.localhost"), vec![http_path("/", None, "whoami", 80)])
                    .build(),
            )
            .await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "c-plain")
                    .rule(Some("c.localhost"), vec![http_path("/", None, "whoami", 80)])
                    .build(),
            )
            .await;

        let conf = compile(&store, &ProviderConfig::default()).await;

        let routers: Vec<_> = conf.http.routers.keys().map(String::as_str).collect();
        assert_eq!(
            routers,
            vec!["default.a-plain-rule-0-path-0", "default.c-plain-rule-0-path-0"]
        );
        assert!(conf.http.servers_transports.is_empty());

        let service = &conf.http.services["default.whoami.80"];
        assert_eq!(urls(service), vec!["http://10.10.0.1:80"]);
        assert!(service.load_balancer.sticky.is_none());
    }

    #[tokio::test]
    async fn test_passthrough_falls_back_to_default_backend() {
        let store = InMemoryStore::new();
        store
            .apply_service(cluster_service("default", "whoami-tls", &[(None, 443)]))
            .await;
        store
            .apply_endpoint_slice(endpoint_slice(
                "default",
                "whoami-tls-abc",
                "whoami-tls",
                &[(None, 8443)],
                &[ready_endpoint("10.10.0.5")],
            ))
            .await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "pt")
                    .annotation("ssl-passthrough", "true")
                    .default_backend("whoami-tls", 443)
                    .rule(Some("pt.localhost"), vec![])
                    .build(),
            )
            .await;

        let conf = compile(&store, &ProviderConfig::default()).await;

        assert!(conf.http.is_empty());
        let router = &conf.tcp.routers["default.pt-rule-0-passthrough"];
        assert_eq!(router.rule, "HostSNI(`pt.localhost`)");
        assert_eq!(router.service, "default.whoami-tls.443");
        let addresses: Vec<_> = conf.tcp.services[&router.service]
            .load_balancer
            .servers
            .iter()
            .map(|s| s.address.as_str())
            .collect();
        assert_eq!(addresses, vec!["10.10.0.5:8443"]);
    }

    #[tokio::test]
    async fn test_wildcard_passthrough_host() {
        let store = InMemoryStore::new();
        whoami(&store, &["10.10.0.1"]).await;
        store
            .apply_ingress(
                IngressBuilder::new("default", "wild")
                    .annotation("ssl-passthrough", "true")
                    .rule(Some("*.pt.localhost"), vec![http_path("/", None, "whoami", 80)])
                    .build(),
            )
            .await;

        let conf = compile(&store, &ProviderConfig::default()).await;

        assert_eq!(
            conf.tcp.routers["default.wild-rule-0-passthrough"].rule,
            "HostSNIRegexp(`^[a-zA-Z0-9-]+\\.pt\\.localhost$`)"
        );
    }
}
