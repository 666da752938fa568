//! Read-only status and health API.
//!
//! Serves the component-status document operators and dashboards poll,
//! plus a resync trigger. Everything here is a view over state owned by
//! other components; nothing is mutated except the resync request.

use crate::caddy::CaddyClient;
use crate::observer::{HostState, HostStates};
use crate::reconciler::{IntentState, Reconciler};
use crate::registry::SharedSnapshot;
use crate::static_routes::StaticRouteStore;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_value(status: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
    json_response(status, value.to_string())
}

/// Shared references the handlers read from.
#[derive(Clone)]
pub struct StatusContext {
    pub registry: SharedSnapshot,
    pub host_states: HostStates,
    pub store: Arc<StaticRouteStore>,
    pub reconciler: Arc<Reconciler>,
    pub proxy: Arc<CaddyClient>,
}

pub struct StatusServer {
    bind_addr: SocketAddr,
    context: StatusContext,
    shutdown_rx: watch::Receiver<bool>,
}

impl StatusServer {
    pub fn new(
        bind_addr: SocketAddr,
        context: StatusContext,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            context,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Status API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = self.context.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let context = context.clone();
                                    async move { handle_request(req, context).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Status connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept status connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Status API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    context: StatusContext,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            format!(r#"{{"status":"healthy","name":"{}","version":"{}"}}"#, PKG_NAME, VERSION),
        ),
        (&Method::GET, "/health/detailed") => detailed_health(&context).await,
        (&Method::GET, "/services") => services_inventory(&context),
        (&Method::POST, "/resync") => {
            context.reconciler.request_resync();
            json_response(StatusCode::ACCEPTED, r#"{"status":"resync requested"}"#)
        }
        _ => json_response(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#),
    };
    Ok(response)
}

/// Component-status document. `degraded` overall when any host failed,
/// any service is degraded, or the static route file stopped parsing.
async fn detailed_health(context: &StatusContext) -> Response<Full<Bytes>> {
    let registry = context.registry.read().clone();
    let host_states = context.host_states.read().clone();
    let store_info = context.store.info();
    let degraded_services = context.reconciler.degraded();
    let proxy_reachable = context.proxy.check_connectivity().await.is_ok();

    let hosts_failed = host_states
        .values()
        .any(|s| matches!(s, HostState::Failed { .. }));
    let overall = if hosts_failed
        || !degraded_services.is_empty()
        || store_info.parse_error.is_some()
        || !proxy_reachable
    {
        "degraded"
    } else {
        "healthy"
    };

    let hosts: serde_json::Map<String, serde_json::Value> = host_states
        .iter()
        .map(|(alias, state)| {
            let containers = registry
                .containers_per_host
                .get(alias)
                .copied()
                .unwrap_or(0);
            (
                alias.clone(),
                serde_json::json!({
                    "connection": state,
                    "containers": containers,
                }),
            )
        })
        .collect();

    let body = serde_json::json!({
        "status": overall,
        "components": {
            "hosts": hosts,
            "static_routes": store_info,
            "proxy": { "reachable": proxy_reachable },
            "registry": {
                "desired_services": registry.desired.len(),
                "dropped": registry.dropped,
                "warnings": registry.warnings,
            },
            "reconciler": {
                "degraded": degraded_services,
            },
        },
    });

    json_value(StatusCode::OK, &body)
}

/// Inventory of desired services with their reconciliation state.
/// Degraded services stay listed, with the reason attached.
fn services_inventory(context: &StatusContext) -> Response<Full<Bytes>> {
    let registry = context.registry.read().clone();
    let states: std::collections::HashMap<String, IntentState> = context
        .reconciler
        .domain_statuses()
        .into_iter()
        .map(|s| (s.domain, s.state))
        .collect();

    let services: Vec<serde_json::Value> = registry
        .desired
        .values()
        .map(|service| {
            let state = states
                .get(&service.domain)
                .cloned()
                .unwrap_or(IntentState::Pending);
            serde_json::json!({
                "domain": service.domain,
                "origin": service.origin,
                "backend": service.backend,
                "options": service.options,
                "revision": service.revision(),
                "state": state,
            })
        })
        .collect();

    let body = serde_json::json!({ "services": services });
    json_value(StatusCode::OK, &body)
}
