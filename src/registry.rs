//! Service registry: the authoritative desired set.
//!
//! One task merges container events from every host observer with change
//! events from the static route store, recompiles the candidate services,
//! resolves domain conflicts deterministically, and ships the resulting
//! diff to the reconciler. Status readers get cloned snapshots and never
//! block the writer.

use crate::container::{Container, HostEvent};
use crate::labels::{self, CompileWarning};
use crate::service::Service;
use crate::static_routes::{StaticRoute, StoreEvent};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

/// One unit of reconciliation work: the desired state of a single domain
/// changed.
#[derive(Debug, Clone)]
pub enum DiffItem {
    /// The domain should exist with this shape (new or updated).
    Upsert(Service),
    /// The domain should no longer exist on the proxy.
    Remove { domain: String },
}

impl DiffItem {
    pub fn domain(&self) -> &str {
        match self {
            DiffItem::Upsert(service) => &service.domain,
            DiffItem::Remove { domain } => domain,
        }
    }
}

/// A service that lost the domain-uniqueness tie-break, kept for
/// visibility.
#[derive(Debug, Clone, Serialize)]
pub struct DroppedService {
    pub domain: String,
    pub source: String,
    pub reason: String,
}

/// Read-only view of the registry for the status API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrySnapshot {
    pub desired: BTreeMap<String, Service>,
    pub dropped: Vec<DroppedService>,
    pub warnings: Vec<CompileWarning>,
    /// Containers currently tracked, per host.
    pub containers_per_host: BTreeMap<String, usize>,
}

pub type SharedSnapshot = Arc<RwLock<RegistrySnapshot>>;

pub struct ServiceRegistry {
    /// host alias → container id → container
    containers: HashMap<String, HashMap<String, Container>>,
    static_routes: Vec<StaticRoute>,
    /// host alias → address backends on that host are dialed at
    backend_hosts: HashMap<String, String>,
    desired: HashMap<String, Service>,
    snapshot: SharedSnapshot,
    diff_tx: mpsc::Sender<DiffItem>,
}

impl ServiceRegistry {
    pub fn new(
        backend_hosts: HashMap<String, String>,
        initial_static_routes: Vec<StaticRoute>,
        diff_tx: mpsc::Sender<DiffItem>,
    ) -> Self {
        Self {
            containers: HashMap::new(),
            static_routes: initial_static_routes,
            backend_hosts,
            desired: HashMap::new(),
            snapshot: Arc::new(RwLock::new(RegistrySnapshot::default())),
            diff_tx,
        }
    }

    pub fn snapshot_handle(&self) -> SharedSnapshot {
        Arc::clone(&self.snapshot)
    }

    /// Run the registry until shutdown, consuming both input streams.
    pub async fn run(
        mut self,
        mut host_events: mpsc::Receiver<HostEvent>,
        mut store_events: broadcast::Receiver<StoreEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Service registry starting");

        // The initial static set counts as a change so the first desired
        // set reaches the reconciler even with no hosts connected yet.
        self.recompute().await;

        // With no hosts configured the observer channel closes right
        // away; static routes still flow.
        let mut hosts_open = true;

        loop {
            tokio::select! {
                event = host_events.recv(), if hosts_open => {
                    match event {
                        Some(event) => {
                            self.apply_host_event(event);
                            self.recompute().await;
                        }
                        None => hosts_open = false,
                    }
                }
                event = store_events.recv() => {
                    match event {
                        Ok(StoreEvent::Changed(routes)) => {
                            debug!(routes = routes.len(), "Static routes changed");
                            self.static_routes = routes;
                            self.recompute().await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Static route events lagged, forcing recompute");
                            self.recompute().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Service registry stopped");
    }

    fn apply_host_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Sync { host, containers } => {
                debug!(host = %host, containers = containers.len(), "Host sync");
                self.containers.insert(
                    host,
                    containers.into_iter().map(|c| (c.id.clone(), c)).collect(),
                );
            }
            HostEvent::Changed(container) => {
                self.containers
                    .entry(container.host.clone())
                    .or_default()
                    .insert(container.id.clone(), container);
            }
            HostEvent::Removed { host, id } => {
                if let Some(host_containers) = self.containers.get_mut(&host) {
                    // Events may carry short ids while snapshots carry
                    // full ones.
                    if host_containers.remove(&id).is_none() {
                        host_containers.retain(|cid, _| !cid.starts_with(&id));
                    }
                }
            }
        }
    }

    /// Recompile everything, resolve conflicts, publish the snapshot, and
    /// emit the diff against the previous desired set.
    async fn recompute(&mut self) {
        let (next, dropped, warnings) = self.compile_candidates();

        let diff = compute_diff(&self.desired, &next);
        self.desired = next.clone();

        {
            let mut snapshot = self.snapshot.write();
            snapshot.desired = next.into_iter().collect();
            snapshot.dropped = dropped;
            snapshot.warnings = warnings;
            snapshot.containers_per_host = self
                .containers
                .iter()
                .map(|(host, map)| (host.clone(), map.len()))
                .collect();
        }

        for item in diff {
            debug!(domain = %item.domain(), upsert = matches!(item, DiffItem::Upsert(_)), "Desired set changed");
            if self.diff_tx.send(item).await.is_err() {
                return;
            }
        }
    }

    /// Compile all sources into a conflict-free desired set.
    ///
    /// Tie-break on duplicate domains: static records beat containers;
    /// among containers the lexicographically lower host alias wins, then
    /// the lower container id, then the lower container port. The loser is
    /// recorded, never silently discarded.
    fn compile_candidates(
        &self,
    ) -> (
        HashMap<String, Service>,
        Vec<DroppedService>,
        Vec<CompileWarning>,
    ) {
        let mut warnings = Vec::new();
        let mut candidates: Vec<Service> = Vec::new();

        for route in &self.static_routes {
            match labels::compile_static_route(route) {
                Ok(service) => candidates.push(service),
                Err(warning) => warnings.push(warning),
            }
        }

        // Deterministic iteration: hosts and containers in sorted order.
        let mut hosts: Vec<_> = self.containers.keys().collect();
        hosts.sort();
        for host in hosts {
            let backend_host = match self.backend_hosts.get(host) {
                Some(addr) => addr.clone(),
                None => {
                    warnings.push(CompileWarning {
                        source: format!("host {}", host),
                        message: "no backend address configured".to_string(),
                    });
                    continue;
                }
            };
            let mut ids: Vec<_> = self.containers[host].keys().collect();
            ids.sort();
            for id in ids {
                let container = &self.containers[host][id];
                let (services, container_warnings) =
                    labels::compile_container(container, &backend_host);
                candidates.extend(services);
                warnings.extend(container_warnings);
            }
        }

        let mut winners: HashMap<String, Service> = HashMap::new();
        let mut dropped = Vec::new();
        for candidate in candidates {
            match winners.get(&candidate.domain) {
                None => {
                    winners.insert(candidate.domain.clone(), candidate);
                }
                Some(current) => {
                    let (winner, loser) =
                        if candidate.origin.precedence_key() < current.origin.precedence_key() {
                            (candidate, current.clone())
                        } else {
                            (current.clone(), candidate)
                        };
                    warn!(
                        domain = %winner.domain,
                        winner = ?winner.origin,
                        loser = ?loser.origin,
                        "Domain conflict, dropping lower-precedence service"
                    );
                    dropped.push(DroppedService {
                        domain: loser.domain.clone(),
                        source: format!("{:?}", loser.origin),
                        reason: "DomainConflict".to_string(),
                    });
                    winners.insert(winner.domain.clone(), winner);
                }
            }
        }

        (winners, dropped, warnings)
    }
}

/// Diff two desired sets by revision.
fn compute_diff(
    previous: &HashMap<String, Service>,
    next: &HashMap<String, Service>,
) -> Vec<DiffItem> {
    let mut diff = Vec::new();

    // Sorted order keeps diff emission deterministic for a given change.
    let mut domains: Vec<&String> = next.keys().chain(previous.keys()).collect();
    domains.sort();
    domains.dedup();

    for domain in domains {
        match (previous.get(domain), next.get(domain)) {
            (None, Some(service)) => diff.push(DiffItem::Upsert(service.clone())),
            (Some(old), Some(new)) => {
                if old.revision() != new.revision() {
                    diff.push(DiffItem::Upsert(new.clone()));
                }
            }
            (Some(_), None) => diff.push(DiffItem::Remove {
                domain: domain.clone(),
            }),
            (None, None) => unreachable!(),
        }
    }

    diff
}
