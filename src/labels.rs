//! Label compiler: turns container labels and static-route records into
//! validated [`Service`] descriptors.
//!
//! Compilation is total. Invalid input never aborts a compile pass; the
//! offending service is dropped and a warning describes why. The raw label
//! map stops here: everything downstream sees only the closed `Service`
//! shape.

use crate::container::{Container, ContainerStatus, LABEL_PREFIX};
use crate::service::{Backend, Origin, Protocol, Service, ServiceOptions};
use crate::static_routes::StaticRoute;
use serde::Serialize;
use std::collections::BTreeMap;

/// A non-fatal problem found while compiling routing intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileWarning {
    /// What was being compiled, e.g. `container web@tower` or
    /// `static dup.example.com`.
    pub source: String,
    pub message: String,
}

impl CompileWarning {
    fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
        }
    }
}

/// Properties recognized inside the label namespace.
const KNOWN_PROPERTIES: &[&str] = &[
    "domain",
    "backend-proto",
    "backend-path",
    "force-ssl",
    "support-websocket",
    "cloudflare-tunnel",
    "tunnel-domain",
];

/// Maximum length of a fully qualified domain name.
const MAX_DOMAIN_LEN: usize = 253;

/// Validate an FQDN: dotted labels of alphanumerics and hyphens, no label
/// starting or ending with a hyphen.
pub fn validate_domain(domain: &str) -> Result<(), String> {
    if domain.is_empty() {
        return Err("domain is empty".to_string());
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(format!("domain exceeds {} characters", MAX_DOMAIN_LEN));
    }
    if !domain.contains('.') {
        return Err(format!("'{}' is not a fully qualified domain name", domain));
    }
    for label in domain.split('.') {
        if label.is_empty() {
            return Err(format!("'{}' contains an empty label", domain));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(format!("'{}' contains invalid characters", domain));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!(
                "'{}' has a label starting or ending with a hyphen",
                domain
            ));
        }
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<(), String> {
    if !path.starts_with('/') {
        return Err(format!("path '{}' must start with '/'", path));
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("'{}' is not a boolean, expected true or false", other)),
    }
}

/// Compile a container's labels into services.
///
/// `backend_host` is the resolved network address of the owning host;
/// `backend.port` resolves to the published host port for each labeled
/// container port. Containers that are not running produce no services.
pub fn compile_container(
    container: &Container,
    backend_host: &str,
) -> (Vec<Service>, Vec<CompileWarning>) {
    let source = format!("container {}@{}", container.name, container.host);
    let mut warnings = Vec::new();

    if container.status != ContainerStatus::Running {
        return (Vec::new(), warnings);
    }

    // Partition the namespace labels by port. BTreeMap keeps the output
    // order deterministic across compile passes.
    let mut partitions: BTreeMap<u16, BTreeMap<String, String>> = BTreeMap::new();
    for (key, value) in &container.labels {
        let Some(rest) = key.strip_prefix(LABEL_PREFIX) else {
            continue;
        };
        let Some((port_str, property)) = rest.split_once('.') else {
            warnings.push(CompileWarning::new(
                &source,
                format!("label '{}' does not match <port>.<property>", key),
            ));
            continue;
        };
        if port_str.is_empty() || port_str.len() > 5 || !port_str.chars().all(|c| c.is_ascii_digit())
        {
            warnings.push(CompileWarning::new(
                &source,
                format!("label '{}' has a non-numeric port", key),
            ));
            continue;
        }
        let port: u16 = match port_str.parse() {
            Ok(p) if p > 0 => p,
            _ => {
                warnings.push(CompileWarning::new(
                    &source,
                    format!("label '{}' has an out-of-range port", key),
                ));
                continue;
            }
        };
        if !KNOWN_PROPERTIES.contains(&property) {
            warnings.push(CompileWarning::new(
                &source,
                format!("unknown property '{}' on port {}", property, port),
            ));
            continue;
        }
        partitions
            .entry(port)
            .or_default()
            .insert(property.to_string(), value.clone());
    }

    let mut services = Vec::new();
    for (port, properties) in partitions {
        match compile_partition(container, backend_host, port, &properties, &source, &mut warnings)
        {
            Some(service) => services.extend(service.with_tunnel_expansion()),
            None => {}
        }
    }

    (services, warnings)
}

fn compile_partition(
    container: &Container,
    backend_host: &str,
    port: u16,
    properties: &BTreeMap<String, String>,
    source: &str,
    warnings: &mut Vec<CompileWarning>,
) -> Option<Service> {
    let Some(domain) = properties.get("domain") else {
        warnings.push(CompileWarning::new(
            source,
            format!("port {} has labels but no domain", port),
        ));
        return None;
    };
    if let Err(reason) = validate_domain(domain) {
        warnings.push(CompileWarning::new(
            source,
            format!("port {}: {}", port, reason),
        ));
        return None;
    }

    let Some(host_port) = container.published_port(port) else {
        warnings.push(CompileWarning::new(
            source,
            format!(
                "port {} for {} is not published on the host",
                port, domain
            ),
        ));
        return None;
    };

    let mut options = ServiceOptions::default();
    let mut protocol = Protocol::Http;
    let mut path = "/".to_string();

    for (property, value) in properties {
        let result: Result<(), String> = match property.as_str() {
            "domain" => Ok(()),
            "backend-proto" => value.parse::<Protocol>().map(|p| protocol = p),
            "backend-path" => validate_path(value).map(|_| path = value.clone()),
            "force-ssl" => parse_bool(value).map(|b| options.force_ssl = b),
            "support-websocket" => parse_bool(value).map(|b| options.support_websocket = b),
            "cloudflare-tunnel" => parse_bool(value).map(|b| options.cloudflare_tunnel = b),
            "tunnel-domain" => {
                validate_domain(value).map(|_| options.tunnel_domain = Some(value.clone()))
            }
            _ => Ok(()),
        };
        if let Err(reason) = result {
            warnings.push(CompileWarning::new(
                source,
                format!("port {} {}: {}, using default", port, property, reason),
            ));
        }
    }

    Some(Service {
        domain: domain.clone(),
        origin: Origin::Container {
            host: container.host.clone(),
            container_id: container.id.clone(),
            container_port: port,
        },
        backend: Backend {
            host: backend_host.to_string(),
            port: host_port,
            protocol,
            path,
        },
        options,
    })
}

/// Compile a static-route record into a service.
pub fn compile_static_route(route: &StaticRoute) -> Result<Service, CompileWarning> {
    let source = format!("static {}", route.domain);

    validate_domain(&route.domain).map_err(|reason| CompileWarning::new(&source, reason))?;

    let parsed = url::Url::parse(&route.backend_url).map_err(|e| {
        CompileWarning::new(&source, format!("invalid backend_url: {}", e))
    })?;

    let protocol: Protocol = parsed
        .scheme()
        .parse()
        .map_err(|reason| CompileWarning::new(&source, reason))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| CompileWarning::new(&source, "backend_url has no host"))?
        .to_string();

    let port = parsed.port().unwrap_or_else(|| protocol.default_port());

    validate_path(&route.backend_path)
        .map_err(|reason| CompileWarning::new(&source, reason))?;

    Ok(Service {
        domain: route.domain.clone(),
        origin: Origin::Static,
        backend: Backend {
            host,
            port,
            protocol,
            path: route.backend_path.clone(),
        },
        options: ServiceOptions {
            force_ssl: route.force_ssl,
            support_websocket: route.support_websocket,
            tls_insecure_skip_verify: route.tls_insecure_skip_verify,
            cloudflare_tunnel: route.cloudflare_tunnel,
            tunnel_domain: None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn container_with(labels: &[(&str, &str)], bindings: &[(u16, Option<u16>)]) -> Container {
        Container {
            id: "abc123".to_string(),
            host: "h1".to_string(),
            name: "web".to_string(),
            image: "nginx".to_string(),
            status: ContainerStatus::Running,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            port_bindings: bindings.iter().copied().collect(),
        }
    }

    #[test]
    fn test_single_domain_label() {
        let c = container_with(
            &[("snadboy.revp.80.domain", "app.example.com")],
            &[(80, Some(8080))],
        );
        let (services, warnings) = compile_container(&c, "10.0.0.1");

        assert!(warnings.is_empty());
        assert_eq!(services.len(), 1);

        let svc = &services[0];
        assert_eq!(svc.domain, "app.example.com");
        assert_eq!(svc.backend.host, "10.0.0.1");
        assert_eq!(svc.backend.port, 8080);
        assert_eq!(svc.backend.protocol, Protocol::Http);
        assert_eq!(svc.backend.path, "/");
        assert!(svc.options.force_ssl);
        assert!(!svc.options.support_websocket);
    }

    #[test]
    fn test_multi_port_labels() {
        let c = container_with(
            &[
                ("snadboy.revp.80.domain", "a.example.com"),
                ("snadboy.revp.8000.domain", "b.example.com"),
                ("snadboy.revp.8000.support-websocket", "true"),
            ],
            &[(80, Some(8080)), (8000, Some(8000))],
        );
        let (services, warnings) = compile_container(&c, "10.0.0.1");

        assert!(warnings.is_empty());
        assert_eq!(services.len(), 2);

        let a = services.iter().find(|s| s.domain == "a.example.com").unwrap();
        let b = services.iter().find(|s| s.domain == "b.example.com").unwrap();
        assert_eq!(a.backend.port, 8080);
        assert!(!a.options.support_websocket);
        assert_eq!(b.backend.port, 8000);
        assert!(b.options.support_websocket);
    }

    #[test]
    fn test_cloudflare_tunnel_options() {
        let c = container_with(
            &[
                ("snadboy.revp.80.domain", "cf.example.com"),
                ("snadboy.revp.80.cloudflare-tunnel", "true"),
                ("snadboy.revp.80.force-ssl", "false"),
            ],
            &[(80, Some(8080))],
        );
        let (services, _) = compile_container(&c, "10.0.0.1");
        assert_eq!(services.len(), 1);
        assert!(services[0].options.cloudflare_tunnel);
        assert!(!services[0].options.force_ssl);
    }

    #[test]
    fn test_tunnel_domain_emits_auxiliary_service() {
        let c = container_with(
            &[
                ("snadboy.revp.80.domain", "app.example.com"),
                ("snadboy.revp.80.tunnel-domain", "tun.example.com"),
            ],
            &[(80, Some(8080))],
        );
        let (services, warnings) = compile_container(&c, "10.0.0.1");

        assert!(warnings.is_empty());
        assert_eq!(services.len(), 2);

        let aux = services.iter().find(|s| s.domain == "tun.example.com").unwrap();
        assert!(aux.options.cloudflare_tunnel);
        assert!(!aux.options.force_ssl);
        assert_eq!(aux.backend.port, 8080);
    }

    #[test]
    fn test_partition_without_domain_warns() {
        let c = container_with(
            &[("snadboy.revp.80.force-ssl", "false")],
            &[(80, Some(8080))],
        );
        let (services, warnings) = compile_container(&c, "10.0.0.1");
        assert!(services.is_empty());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("no domain"));
    }

    #[test]
    fn test_unpublished_port_drops_service() {
        let c = container_with(
            &[("snadboy.revp.80.domain", "app.example.com")],
            &[(80, None)],
        );
        let (services, warnings) = compile_container(&c, "10.0.0.1");
        assert!(services.is_empty());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("not published"));
    }

    #[test]
    fn test_stopped_container_produces_nothing() {
        let mut c = container_with(
            &[("snadboy.revp.80.domain", "app.example.com")],
            &[(80, Some(8080))],
        );
        c.status = ContainerStatus::Exited;
        let (services, warnings) = compile_container(&c, "10.0.0.1");
        assert!(services.is_empty());
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_invalid_bool_falls_back_to_default() {
        let c = container_with(
            &[
                ("snadboy.revp.80.domain", "app.example.com"),
                ("snadboy.revp.80.force-ssl", "yes"),
            ],
            &[(80, Some(8080))],
        );
        let (services, warnings) = compile_container(&c, "10.0.0.1");
        assert_eq!(services.len(), 1);
        assert!(services[0].options.force_ssl);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_unknown_property_warns_and_ignores() {
        let c = container_with(
            &[
                ("snadboy.revp.80.domain", "app.example.com"),
                ("snadboy.revp.80.color", "blue"),
            ],
            &[(80, Some(8080))],
        );
        let (services, warnings) = compile_container(&c, "10.0.0.1");
        assert_eq!(services.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("unknown property"));
    }

    #[test]
    fn test_labels_outside_namespace_ignored() {
        let c = container_with(
            &[
                ("snadboy.revp.80.domain", "app.example.com"),
                ("com.docker.compose.project", "stack"),
            ],
            &[(80, Some(8080))],
        );
        let (services, warnings) = compile_container(&c, "10.0.0.1");
        assert_eq!(services.len(), 1);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_invalid_domain_rejected() {
        for bad in ["nodots", "has space.example.com", "-bad.example.com", ""] {
            let c = container_with(
                &[("snadboy.revp.80.domain", bad)],
                &[(80, Some(8080))],
            );
            let (services, warnings) = compile_container(&c, "10.0.0.1");
            assert!(services.is_empty(), "domain '{}' should be rejected", bad);
            assert!(!warnings.is_empty());
        }
    }

    #[test]
    fn test_backend_proto_and_path() {
        let c = container_with(
            &[
                ("snadboy.revp.443.domain", "secure.example.com"),
                ("snadboy.revp.443.backend-proto", "https"),
                ("snadboy.revp.443.backend-path", "/api"),
            ],
            &[(443, Some(8443))],
        );
        let (services, _) = compile_container(&c, "10.0.0.1");
        assert_eq!(services[0].backend.protocol, Protocol::Https);
        assert_eq!(services[0].backend.path, "/api");
    }

    fn static_route(domain: &str, backend_url: &str) -> StaticRoute {
        StaticRoute {
            domain: domain.to_string(),
            backend_url: backend_url.to_string(),
            backend_path: "/".to_string(),
            force_ssl: true,
            support_websocket: false,
            tls_insecure_skip_verify: false,
            cloudflare_tunnel: false,
        }
    }

    #[test]
    fn test_static_route_compiles() {
        let svc =
            compile_static_route(&static_route("s.example.com", "http://backend:8080")).unwrap();
        assert_eq!(svc.domain, "s.example.com");
        assert_eq!(svc.backend.host, "backend");
        assert_eq!(svc.backend.port, 8080);
        assert_eq!(svc.backend.protocol, Protocol::Http);
        assert!(svc.origin.is_static());
    }

    #[test]
    fn test_static_route_default_ports() {
        let http = compile_static_route(&static_route("a.example.com", "http://b")).unwrap();
        assert_eq!(http.backend.port, 80);
        let https = compile_static_route(&static_route("a.example.com", "https://b")).unwrap();
        assert_eq!(https.backend.port, 443);
    }

    #[test]
    fn test_static_route_bad_scheme_rejected() {
        let err = compile_static_route(&static_route("a.example.com", "ftp://b")).unwrap_err();
        assert!(err.message.contains("invalid protocol"));
    }

    #[test]
    fn test_static_route_unparseable_url_rejected() {
        assert!(compile_static_route(&static_route("a.example.com", "not a url")).is_err());
    }

    #[test]
    fn test_static_route_relative_path_rejected() {
        let mut route = static_route("a.example.com", "http://b:1000");
        route.backend_path = "api".to_string();
        assert!(compile_static_route(&route).is_err());
    }

    #[test]
    fn test_compile_is_deterministic() {
        let mut labels = HashMap::new();
        for port in [80u16, 81, 82] {
            labels.insert(
                format!("snadboy.revp.{}.domain", port),
                format!("p{}.example.com", port),
            );
        }
        let c = Container {
            id: "x".to_string(),
            host: "h1".to_string(),
            name: "multi".to_string(),
            image: "img".to_string(),
            status: ContainerStatus::Running,
            labels,
            port_bindings: [(80, Some(1080)), (81, Some(1081)), (82, Some(1082))]
                .into_iter()
                .collect(),
        };
        let (first, _) = compile_container(&c, "10.0.0.1");
        let (second, _) = compile_container(&c, "10.0.0.1");
        assert_eq!(first, second);
        let domains: Vec<_> = first.iter().map(|s| s.domain.as_str()).collect();
        assert_eq!(
            domains,
            vec!["p80.example.com", "p81.example.com", "p82.example.com"]
        );
    }
}
