//! Caddy admin API client and route materialization.
//!
//! Every service maps to exactly two proxy routes, one per listener,
//! addressed by ids derived from the domain. The deterministic id is the
//! whole idempotence mechanism: applying the same service twice replaces
//! the same routes, and the sweep can match live routes back to desired
//! services without any extra bookkeeping.

use crate::service::{Protocol, Service};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Namespace for route ids owned by this process. Routes outside it are
/// never touched, including by orphan collection.
pub const ROUTE_ID_PREFIX: &str = "revp_route_";

/// The proxy listener a route is materialized on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Listener {
    Http,
    Https,
}

impl Listener {
    pub fn as_str(&self) -> &'static str {
        match self {
            Listener::Http => "http",
            Listener::Https => "https",
        }
    }
}

/// Deterministic route id for a (domain, listener) pair.
pub fn route_id(domain: &str, listener: Listener) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update(b":");
    hasher.update(listener.as_str().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}", ROUTE_ID_PREFIX, hex)
}

/// Both route ids a service occupies.
pub fn route_ids(domain: &str) -> [String; 2] {
    [
        route_id(domain, Listener::Https),
        route_id(domain, Listener::Http),
    ]
}

// Caddy route payload types. BTreeMaps keep the serialized form canonical
// so payload hashes are stable across processes.

#[derive(Debug, Clone, Serialize)]
pub struct RoutePayload {
    #[serde(rename = "@id")]
    pub id: String,
    pub r#match: Vec<HostMatcher>,
    pub handle: Vec<CaddyHandler>,
    pub terminal: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostMatcher {
    pub host: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "handler", rename_all = "snake_case")]
pub enum CaddyHandler {
    Subroute {
        routes: Vec<SubrouteEntry>,
    },
    ReverseProxy {
        upstreams: Vec<Upstream>,
        #[serde(skip_serializing_if = "Option::is_none")]
        transport: Option<Transport>,
        headers: RequestHeaders,
    },
    Rewrite {
        strip_path_prefix: String,
    },
    StaticResponse {
        headers: BTreeMap<String, Vec<String>>,
        status_code: u16,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct SubrouteEntry {
    pub handle: Vec<CaddyHandler>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Upstream {
    pub dial: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Transport {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsTransport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TlsTransport {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestHeaders {
    pub request: HeaderSet,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeaderSet {
    pub set: BTreeMap<String, Vec<String>>,
}

/// A route ready to apply: the listener decides which server it lands on.
#[derive(Debug, Clone)]
pub struct MaterializedRoute {
    pub listener: Listener,
    pub id: String,
    pub payload: RoutePayload,
}

/// Map a service to its proxy routes.
///
/// The HTTPS listener always carries the reverse-proxy route. The HTTP
/// listener carries a 308 redirect when `force_ssl` is on, except in
/// Cloudflare-tunnel mode where the tunnel terminates TLS upstream of us
/// and the HTTP listener must serve the proxy route directly.
pub fn materialize(service: &Service) -> Vec<MaterializedRoute> {
    let https_route = MaterializedRoute {
        listener: Listener::Https,
        id: route_id(&service.domain, Listener::Https),
        payload: proxy_payload(service, Listener::Https),
    };

    let http_id = route_id(&service.domain, Listener::Http);
    let http_route = if service.options.force_ssl && !service.options.cloudflare_tunnel {
        MaterializedRoute {
            listener: Listener::Http,
            id: http_id.clone(),
            payload: redirect_payload(service, http_id),
        }
    } else {
        MaterializedRoute {
            listener: Listener::Http,
            id: http_id,
            payload: proxy_payload(service, Listener::Http),
        }
    };

    vec![https_route, http_route]
}

fn proxy_payload(service: &Service, listener: Listener) -> RoutePayload {
    let mut set: BTreeMap<String, Vec<String>> = BTreeMap::new();
    set.insert(
        "Host".to_string(),
        vec!["{http.request.host}".to_string()],
    );
    set.insert(
        "X-Forwarded-Host".to_string(),
        vec!["{http.request.host}".to_string()],
    );
    set.insert(
        "X-Forwarded-Proto".to_string(),
        vec!["{http.request.scheme}".to_string()],
    );

    if service.options.cloudflare_tunnel {
        // The tunnel connects from Cloudflare's edge; the real client
        // address only exists in CF-Connecting-IP.
        set.insert(
            "X-Real-IP".to_string(),
            vec!["{http.request.header.CF-Connecting-IP}".to_string()],
        );
        set.insert(
            "X-Forwarded-For".to_string(),
            vec!["{http.request.header.CF-Connecting-IP}".to_string()],
        );
    } else {
        set.insert(
            "X-Real-IP".to_string(),
            vec!["{http.request.remote.host}".to_string()],
        );
        set.insert(
            "X-Forwarded-For".to_string(),
            vec![
                "{http.request.header.X-Forwarded-For}, {http.request.remote.host}".to_string(),
            ],
        );
    }

    if service.options.support_websocket {
        set.insert(
            "Connection".to_string(),
            vec!["{http.request.header.Connection}".to_string()],
        );
        set.insert(
            "Upgrade".to_string(),
            vec!["{http.request.header.Upgrade}".to_string()],
        );
    }

    let transport = match service.backend.protocol {
        Protocol::Http => None,
        Protocol::Https => Some(Transport {
            protocol: "http".to_string(),
            tls: Some(TlsTransport {
                insecure_skip_verify: service.options.tls_insecure_skip_verify,
            }),
        }),
    };

    let mut handle = Vec::new();
    if service.backend.path != "/" {
        handle.push(CaddyHandler::Rewrite {
            strip_path_prefix: service.backend.path.trim_end_matches('/').to_string(),
        });
    }
    handle.push(CaddyHandler::ReverseProxy {
        upstreams: vec![Upstream {
            dial: service.backend.dial(),
        }],
        transport,
        headers: RequestHeaders {
            request: HeaderSet { set },
        },
    });

    RoutePayload {
        id: route_id(&service.domain, listener),
        r#match: vec![HostMatcher {
            host: vec![service.domain.clone()],
        }],
        handle: vec![CaddyHandler::Subroute {
            routes: vec![SubrouteEntry { handle }],
        }],
        terminal: true,
    }
}

fn redirect_payload(service: &Service, id: String) -> RoutePayload {
    let mut headers = BTreeMap::new();
    headers.insert(
        "Location".to_string(),
        vec!["https://{http.request.host}{http.request.uri}".to_string()],
    );

    RoutePayload {
        id,
        r#match: vec![HostMatcher {
            host: vec![service.domain.clone()],
        }],
        handle: vec![CaddyHandler::StaticResponse {
            headers,
            status_code: 308,
        }],
        terminal: true,
    }
}

/// Stable hash over a route's canonical JSON encoding. serde_json orders
/// object keys, so equal payloads hash equal regardless of construction.
pub fn payload_hash(value: &Value) -> String {
    let canonical = serde_json::to_string(value).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// A route currently present on the proxy, reduced to what the sweep
/// needs.
#[derive(Debug, Clone)]
pub struct LiveRoute {
    pub id: String,
    pub payload_hash: String,
}

/// Error from a proxy admin call, carrying enough to classify the retry
/// policy.
#[derive(Debug)]
pub enum ProxyError {
    /// Connection-level failure: refused, reset, timed out.
    Transport(String),
    /// The proxy answered with a non-success status.
    Status { code: u16, body: String },
}

impl ProxyError {
    /// Transient failures are retried with backoff; the rest are permanent
    /// until inputs change.
    pub fn is_transient(&self) -> bool {
        match self {
            ProxyError::Transport(_) => true,
            ProxyError::Status { code, .. } => *code >= 500,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ProxyError::Status { code: 409, .. })
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::Transport(e) => write!(f, "proxy unreachable: {}", e),
            ProxyError::Status { code, body } => {
                write!(f, "proxy returned {}: {}", code, body)
            }
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        ProxyError::Transport(e.to_string())
    }
}

/// Typed wrapper over the proxy admin HTTP API.
pub struct CaddyClient {
    base_url: String,
    client: reqwest::Client,
    http_server: String,
    https_server: String,
}

impl CaddyClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        http_server: String,
        https_server: String,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build proxy admin client: {}", e))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            http_server,
            https_server,
        })
    }

    fn server_for(&self, listener: Listener) -> &str {
        match listener {
            Listener::Http => &self.http_server,
            Listener::Https => &self.https_server,
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProxyError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProxyError::Status {
            code: status.as_u16(),
            body,
        })
    }

    /// Verify the admin endpoint answers at all. Startup check.
    pub async fn check_connectivity(&self) -> Result<(), ProxyError> {
        self.get_config().await.map(|_| ())
    }

    pub async fn get_config(&self) -> Result<Value, ProxyError> {
        let response = self
            .client
            .get(format!("{}/config/", self.base_url))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Create the listener servers this process materializes routes into,
    /// if the proxy does not have them yet. Existing servers and routes
    /// are left untouched.
    pub async fn ensure_servers(&self) -> Result<(), ProxyError> {
        let config = self.get_config().await?;
        let servers = config
            .pointer("/apps/http/servers")
            .and_then(Value::as_object);

        let missing_all = servers.is_none();
        if missing_all {
            let mut server_map = serde_json::Map::new();
            server_map.insert(
                self.https_server.clone(),
                serde_json::json!({ "listen": [":443"], "routes": [] }),
            );
            server_map.insert(
                self.http_server.clone(),
                serde_json::json!({ "listen": [":80"], "routes": [] }),
            );
            let skeleton = serde_json::json!({
                "apps": { "http": { "servers": server_map } }
            });
            let response = self
                .client
                .post(format!("{}/load", self.base_url))
                .json(&skeleton)
                .send()
                .await?;
            Self::check_status(response).await?;
            info!("Provisioned proxy server config from scratch");
            return Ok(());
        }

        for (name, listen) in [
            (self.https_server.clone(), ":443"),
            (self.http_server.clone(), ":80"),
        ] {
            let exists = servers.map(|s| s.contains_key(&name)).unwrap_or(false);
            if exists {
                continue;
            }
            let body = serde_json::json!({ "listen": [listen], "routes": [] });
            let response = self
                .client
                .put(format!(
                    "{}/config/apps/http/servers/{}",
                    self.base_url, name
                ))
                .json(&body)
                .send()
                .await?;
            Self::check_status(response).await?;
            info!(server = %name, listen, "Provisioned proxy listener server");
        }
        Ok(())
    }

    /// All live routes in this process's id namespace, across every
    /// server, with canonical payload hashes.
    pub async fn list_routes(&self) -> Result<Vec<LiveRoute>, ProxyError> {
        let config = self.get_config().await?;
        let mut live = Vec::new();

        let Some(servers) = config
            .pointer("/apps/http/servers")
            .and_then(Value::as_object)
        else {
            return Ok(live);
        };

        for server in servers.values() {
            let Some(routes) = server.get("routes").and_then(Value::as_array) else {
                continue;
            };
            for route in routes {
                let Some(id) = route.get("@id").and_then(Value::as_str) else {
                    continue;
                };
                if !id.starts_with(ROUTE_ID_PREFIX) {
                    continue;
                }
                live.push(LiveRoute {
                    id: id.to_string(),
                    payload_hash: payload_hash(route),
                });
            }
        }
        Ok(live)
    }

    /// Create or replace the route at its id. Replacement goes through the
    /// id-addressed API; a route that does not exist yet is appended to
    /// its listener's route array.
    pub async fn put_route(&self, route: &MaterializedRoute) -> Result<(), ProxyError> {
        let response = self
            .client
            .put(format!("{}/id/{}", self.base_url, route.id))
            .json(&route.payload)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status == 404 || status == 500 {
            // Unknown id: first apply for this route, append it instead.
            let body = response.text().await.unwrap_or_default();
            if status == 500 && !body.contains("unknown object ID") && !body.contains("invalid traversal path") {
                return Err(ProxyError::Status { code: status, body });
            }
            debug!(id = %route.id, "Route id unknown, appending to server");
            let response = self
                .client
                .post(format!(
                    "{}/config/apps/http/servers/{}/routes",
                    self.base_url,
                    self.server_for(route.listener)
                ))
                .json(&route.payload)
                .send()
                .await?;
            Self::check_status(response).await?;
            return Ok(());
        }

        Self::check_status(response).await?;
        Ok(())
    }

    /// Delete the route at an id. A missing id is success: the desired
    /// outcome already holds.
    pub async fn delete_route(&self, id: &str) -> Result<(), ProxyError> {
        let response = self
            .client
            .delete(format!("{}/id/{}", self.base_url, id))
            .send()
            .await?;

        let status = response.status().as_u16();
        if status == 404 {
            return Ok(());
        }
        if status == 500 {
            let body = response.text().await.unwrap_or_default();
            if body.contains("unknown object ID") || body.contains("invalid traversal path") {
                return Ok(());
            }
            return Err(ProxyError::Status { code: status, body });
        }
        Self::check_status(response).await?;
        Ok(())
    }
}
