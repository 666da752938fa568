//! Compiled routing intent: the Service model shared by the registry and
//! the reconciler.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Backend protocol spoken by the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    /// Default port for the protocol, used when a backend URL omits one.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            other => Err(format!("invalid protocol '{}', expected http or https", other)),
        }
    }
}

/// The upstream endpoint that receives proxied traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backend {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub path: String,
}

impl Backend {
    /// The address the proxy dials, `host:port`.
    pub fn dial(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The closed set of per-service options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceOptions {
    /// Issue an HTTP→HTTPS redirect route in addition to the HTTPS route.
    pub force_ssl: bool,
    /// Preserve Upgrade/Connection headers end to end.
    pub support_websocket: bool,
    /// Accept any certificate presented by an HTTPS backend.
    pub tls_insecure_skip_verify: bool,
    /// Traffic arrives through a Cloudflare tunnel: rewrite client-IP
    /// headers from CF-Connecting-IP and serve the proxy route on the
    /// HTTP listener instead of a redirect.
    pub cloudflare_tunnel: bool,
    /// Auxiliary domain materialized as a second tunnel-mode service.
    pub tunnel_domain: Option<String>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            force_ssl: true,
            support_websocket: false,
            tls_insecure_skip_verify: false,
            cloudflare_tunnel: false,
            tunnel_domain: None,
        }
    }
}

/// Where a service's routing intent came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Origin {
    Container {
        host: String,
        container_id: String,
        container_port: u16,
    },
    Static,
}

impl Origin {
    pub fn is_static(&self) -> bool {
        matches!(self, Origin::Static)
    }

    /// Ordering key used by the domain-conflict tie-break. Static origins
    /// sort before any container; containers order by host alias, then
    /// container id, then container port.
    pub fn precedence_key(&self) -> (u8, &str, &str, u16) {
        match self {
            Origin::Static => (0, "", "", 0),
            Origin::Container {
                host,
                container_id,
                container_port,
            } => (1, host.as_str(), container_id.as_str(), *container_port),
        }
    }
}

/// A compiled, validated routing intent keyed by domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    pub domain: String,
    pub origin: Origin,
    pub backend: Backend,
    pub options: ServiceOptions,
}

impl Service {
    /// Content hash of everything that affects the materialized routes.
    /// Two services with equal revisions need no proxy update.
    pub fn revision(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.domain.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.backend.host.as_bytes());
        hasher.update(self.backend.port.to_be_bytes());
        hasher.update(self.backend.protocol.as_str().as_bytes());
        hasher.update(self.backend.path.as_bytes());
        hasher.update([
            self.options.force_ssl as u8,
            self.options.support_websocket as u8,
            self.options.tls_insecure_skip_verify as u8,
            self.options.cloudflare_tunnel as u8,
        ]);
        if let Some(ref tunnel) = self.options.tunnel_domain {
            hasher.update(tunnel.as_bytes());
        }
        let digest = hasher.finalize();
        digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Expand the auxiliary tunnel domain, if configured, into a second
    /// service sharing this backend. The auxiliary service always runs in
    /// tunnel mode without the HTTPS redirect.
    pub fn with_tunnel_expansion(self) -> Vec<Service> {
        let Some(tunnel_domain) = self.options.tunnel_domain.clone() else {
            return vec![self];
        };

        let aux = Service {
            domain: tunnel_domain,
            origin: self.origin.clone(),
            backend: self.backend.clone(),
            options: ServiceOptions {
                force_ssl: false,
                cloudflare_tunnel: true,
                tunnel_domain: None,
                ..self.options.clone()
            },
        };
        vec![self, aux]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(domain: &str) -> Service {
        Service {
            domain: domain.to_string(),
            origin: Origin::Container {
                host: "h1".to_string(),
                container_id: "abc123".to_string(),
                container_port: 80,
            },
            backend: Backend {
                host: "10.0.0.1".to_string(),
                port: 8080,
                protocol: Protocol::Http,
                path: "/".to_string(),
            },
            options: ServiceOptions::default(),
        }
    }

    #[test]
    fn test_revision_stable() {
        let a = service("app.example.com");
        let b = service("app.example.com");
        assert_eq!(a.revision(), b.revision());
    }

    #[test]
    fn test_revision_changes_with_backend() {
        let a = service("app.example.com");
        let mut b = service("app.example.com");
        b.backend.port = 9090;
        assert_ne!(a.revision(), b.revision());
    }

    #[test]
    fn test_revision_changes_with_options() {
        let a = service("app.example.com");
        let mut b = service("app.example.com");
        b.options.support_websocket = true;
        assert_ne!(a.revision(), b.revision());
    }

    #[test]
    fn test_tunnel_expansion() {
        let mut svc = service("app.example.com");
        svc.options.tunnel_domain = Some("tunnel.example.com".to_string());

        let expanded = svc.with_tunnel_expansion();
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0].domain, "app.example.com");

        let aux = &expanded[1];
        assert_eq!(aux.domain, "tunnel.example.com");
        assert!(aux.options.cloudflare_tunnel);
        assert!(!aux.options.force_ssl);
        assert_eq!(aux.options.tunnel_domain, None);
        assert_eq!(aux.backend, expanded[0].backend);
    }

    #[test]
    fn test_no_tunnel_expansion_without_domain() {
        let svc = service("app.example.com");
        assert_eq!(svc.with_tunnel_expansion().len(), 1);
    }

    #[test]
    fn test_static_precedence_sorts_first() {
        let container = Origin::Container {
            host: "a".to_string(),
            container_id: "0".to_string(),
            container_port: 80,
        };
        assert!(Origin::Static.precedence_key() < container.precedence_key());
    }

    #[test]
    fn test_container_precedence_orders_by_host_id_port() {
        let origin = |host: &str, id: &str, port: u16| Origin::Container {
            host: host.to_string(),
            container_id: id.to_string(),
            container_port: port,
        };

        assert!(origin("h1", "zzz", 80).precedence_key() < origin("h2", "aaa", 80).precedence_key());
        assert!(origin("h1", "aaa", 9000).precedence_key() < origin("h1", "bbb", 80).precedence_key());
        assert!(origin("h1", "aaa", 80).precedence_key() < origin("h1", "aaa", 9000).precedence_key());
    }
}
