//! Route reconciler: converges the proxy's live routes toward the
//! desired set.
//!
//! Each domain owns a serialized intent. Diff items bump the domain's
//! generation and rewrite the intent; at most one worker is ever active
//! per domain, and it always re-reads the intent before acting, so stale
//! work is dropped instead of applied out of order. Across domains,
//! workers run in parallel up to a configured bound.
//!
//! A periodic sweep fetches the proxy's full route list, deletes orphans
//! inside this process's id namespace, and re-enqueues any domain whose
//! live routes are missing or stale. The sweep is the authoritative
//! drift-repair mechanism; per-event reconciliation is just the fast
//! path.

use crate::backoff::Backoff;
use crate::caddy::{self, CaddyClient, ProxyError};
use crate::registry::DiffItem;
use crate::service::Service;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tracing::{debug, error, info, warn};

/// Where one domain stands relative to the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum IntentState {
    /// A change is queued or in flight.
    Pending,
    /// The proxy matches the intent.
    Applied,
    /// The last apply failed permanently; kept for visibility.
    Degraded { reason: String, retriable: bool },
}

#[derive(Debug)]
struct Intent {
    /// Desired shape; `None` means the domain must be removed.
    service: Option<Service>,
    generation: u64,
    state: IntentState,
    /// True while a worker owns this domain.
    worker_active: bool,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub sweep_interval: Duration,
}

/// Per-domain status line for the inventory API.
#[derive(Debug, Clone, Serialize)]
pub struct DomainStatus {
    pub domain: String,
    pub state: IntentState,
}

pub struct Reconciler {
    client: Arc<CaddyClient>,
    intents: DashMap<String, Intent>,
    permits: Arc<Semaphore>,
    config: ReconcilerConfig,
    resync: Notify,
    shutdown_rx: watch::Receiver<bool>,
}

impl Reconciler {
    pub fn new(
        client: Arc<CaddyClient>,
        config: ReconcilerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            intents: DashMap::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            resync: Notify::new(),
            shutdown_rx,
        })
    }

    /// Ask for an immediate sweep, ahead of the periodic timer.
    pub fn request_resync(&self) {
        self.resync.notify_one();
    }

    /// Domain states for the inventory, sorted by domain.
    pub fn domain_statuses(&self) -> Vec<DomainStatus> {
        let mut statuses: Vec<DomainStatus> = self
            .intents
            .iter()
            .map(|entry| DomainStatus {
                domain: entry.key().clone(),
                state: entry.value().state.clone(),
            })
            .collect();
        statuses.sort_by(|a, b| a.domain.cmp(&b.domain));
        statuses
    }

    pub fn degraded(&self) -> Vec<DomainStatus> {
        self.domain_statuses()
            .into_iter()
            .filter(|s| matches!(s.state, IntentState::Degraded { .. }))
            .collect()
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run until shutdown: consume diffs, tick the sweep, honor resync
    /// requests.
    pub async fn run(self: Arc<Self>, mut diff_rx: mpsc::Receiver<DiffItem>) {
        info!(
            max_concurrent = self.config.max_concurrent,
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            "Reconciler starting"
        );

        self.wait_for_proxy().await;
        if self.shutting_down() {
            return;
        }

        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                item = diff_rx.recv() => {
                    match item {
                        Some(item) => self.ingest(item),
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.sweep().await;
                }
                _ = self.resync.notified() => {
                    info!("Resync requested");
                    self.sweep().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// Block until the proxy admin endpoint answers and our listener
    /// servers exist. Nothing can be applied before that.
    async fn wait_for_proxy(&self) {
        let mut backoff = Backoff::reconnect();
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            match self.client.ensure_servers().await {
                Ok(()) => {
                    info!("Proxy admin endpoint ready");
                    return;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Proxy admin endpoint not ready");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Fold a diff item into the domain's intent, spawning a worker if
    /// none owns the domain yet.
    fn ingest(self: &Arc<Self>, item: DiffItem) {
        let domain = item.domain().to_string();
        let service = match item {
            DiffItem::Upsert(service) => Some(service),
            DiffItem::Remove { .. } => None,
        };

        let spawn = {
            let mut entry = self.intents.entry(domain.clone()).or_insert_with(|| Intent {
                service: None,
                generation: 0,
                state: IntentState::Pending,
                worker_active: false,
            });
            entry.generation += 1;
            entry.service = service;
            entry.state = IntentState::Pending;
            let spawn = !entry.worker_active;
            if spawn {
                entry.worker_active = true;
            }
            spawn
        };

        if spawn {
            let reconciler = Arc::clone(self);
            tokio::spawn(async move { reconciler.worker(domain).await });
        }
    }

    /// Re-enqueue a domain whose live routes drifted, re-applying the
    /// current intent.
    fn bump(self: &Arc<Self>, domain: &str) {
        let spawn = {
            let Some(mut entry) = self.intents.get_mut(domain) else {
                return;
            };
            entry.generation += 1;
            entry.state = IntentState::Pending;
            let spawn = !entry.worker_active;
            if spawn {
                entry.worker_active = true;
            }
            spawn
        };
        if spawn {
            let reconciler = Arc::clone(self);
            let domain = domain.to_string();
            tokio::spawn(async move { reconciler.worker(domain).await });
        }
    }

    /// Serialized per-domain worker. Owns the domain until its intent is
    /// settled, re-reading it before every attempt so newer generations
    /// always win.
    async fn worker(self: Arc<Self>, domain: String) {
        let mut backoff = Backoff::retry();
        let mut conflict_repaired = false;
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            let (service, generation) = {
                let Some(entry) = self.intents.get(&domain) else {
                    return;
                };
                (entry.service.clone(), entry.generation)
            };

            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if self.shutting_down() {
                self.release_worker(&domain);
                return;
            }

            let result = match &service {
                Some(service) => self.apply(service).await,
                None => self.remove(&domain).await,
            };
            drop(permit);

            // A newer generation invalidates whatever just happened.
            let stale = self
                .intents
                .get(&domain)
                .map(|e| e.generation != generation)
                .unwrap_or(true);
            if stale {
                backoff.reset();
                conflict_repaired = false;
                continue;
            }

            match result {
                Ok(()) => {
                    if service.is_none() {
                        // Domain is gone; drop the intent unless a newer
                        // generation slipped in.
                        let removed = self
                            .intents
                            .remove_if(&domain, |_, e| e.generation == generation)
                            .is_some();
                        if removed {
                            debug!(domain = %domain, "Domain removed from proxy");
                            return;
                        }
                        backoff.reset();
                        conflict_repaired = false;
                        continue;
                    }
                    if self.settle(&domain, generation, IntentState::Applied) {
                        debug!(domain = %domain, "Domain applied");
                        return;
                    }
                    backoff.reset();
                    conflict_repaired = false;
                }
                Err(e) if e.is_conflict() && !conflict_repaired => {
                    // Another route owns the domain: clear our ids and
                    // reapply once.
                    warn!(domain = %domain, error = %e, "Route conflict, repairing");
                    conflict_repaired = true;
                    for id in caddy::route_ids(&domain) {
                        if let Err(e) = self.client.delete_route(&id).await {
                            warn!(domain = %domain, id = %id, error = %e, "Conflict repair delete failed");
                        }
                    }
                    continue;
                }
                Err(e) if e.is_transient() => {
                    if backoff.attempt() + 1 >= self.config.max_retries {
                        error!(
                            domain = %domain,
                            error = %e,
                            retries = backoff.attempt(),
                            "Retries exhausted, marking degraded"
                        );
                        let degraded = IntentState::Degraded {
                            reason: format!("retries exhausted: {}", e),
                            retriable: true,
                        };
                        if self.settle(&domain, generation, degraded) {
                            return;
                        }
                        backoff.reset();
                        conflict_repaired = false;
                        continue;
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        domain = %domain,
                        error = %e,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Apply failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                self.release_worker(&domain);
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(domain = %domain, error = %e, "Apply rejected, marking degraded");
                    let degraded = IntentState::Degraded {
                        reason: e.to_string(),
                        retriable: false,
                    };
                    if self.settle(&domain, generation, degraded) {
                        return;
                    }
                    backoff.reset();
                    conflict_repaired = false;
                }
            }
        }
    }

    /// Record the outcome of an attempt and release the domain, unless a
    /// newer generation arrived meanwhile. Returns false when the worker
    /// must keep going.
    fn settle(&self, domain: &str, generation: u64, state: IntentState) -> bool {
        match self.intents.get_mut(domain) {
            Some(mut entry) if entry.generation == generation => {
                entry.state = state;
                entry.worker_active = false;
                true
            }
            Some(_) => false,
            // Entry vanished; nothing left to own.
            None => true,
        }
    }

    fn release_worker(&self, domain: &str) {
        if let Some(mut entry) = self.intents.get_mut(domain) {
            entry.worker_active = false;
        }
    }

    /// Push every route of a service to the proxy.
    async fn apply(&self, service: &Service) -> Result<(), ProxyError> {
        for route in caddy::materialize(service) {
            self.client.put_route(&route).await?;
        }
        Ok(())
    }

    /// Delete every route id a domain can occupy.
    async fn remove(&self, domain: &str) -> Result<(), ProxyError> {
        for id in caddy::route_ids(domain) {
            self.client.delete_route(&id).await?;
        }
        Ok(())
    }

    /// Full comparison of desired and live: collect orphans in our id
    /// namespace, re-enqueue missing or stale domains.
    pub async fn sweep(self: &Arc<Self>) {
        let live = match self.client.list_routes().await {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "Sweep skipped, proxy unreadable");
                return;
            }
        };

        // Desired route ids with their canonical payload hashes.
        let mut desired: HashMap<String, (String, String)> = HashMap::new();
        for entry in self.intents.iter() {
            let Some(service) = &entry.service else {
                continue;
            };
            for route in caddy::materialize(service) {
                let value = serde_json::to_value(&route.payload).unwrap_or_default();
                desired.insert(
                    route.id,
                    (entry.key().clone(), caddy::payload_hash(&value)),
                );
            }
        }

        let mut orphans = 0usize;
        let live_map: HashMap<&str, &str> = live
            .iter()
            .map(|r| (r.id.as_str(), r.payload_hash.as_str()))
            .collect();

        for route in &live {
            if !desired.contains_key(&route.id) {
                match self.client.delete_route(&route.id).await {
                    Ok(()) => {
                        orphans += 1;
                        info!(id = %route.id, "Collected orphan route");
                    }
                    Err(e) => warn!(id = %route.id, error = %e, "Orphan delete failed"),
                }
            }
        }

        let mut stale_domains: HashSet<String> = HashSet::new();
        for (id, (domain, want_hash)) in &desired {
            match live_map.get(id.as_str()) {
                Some(have_hash) if *have_hash == want_hash => {}
                _ => {
                    stale_domains.insert(domain.clone());
                }
            }
        }

        for domain in &stale_domains {
            // A domain degraded by a proxy rejection is not retried until
            // its inputs change; everything else is drift to repair.
            let skip = self
                .intents
                .get(domain)
                .map(|e| {
                    matches!(
                        e.state,
                        IntentState::Degraded { retriable: false, .. }
                    )
                })
                .unwrap_or(false);
            if !skip {
                self.bump(domain);
            }
        }

        debug!(
            live = live.len(),
            desired = desired.len(),
            orphans,
            stale = stale_domains.len(),
            "Sweep complete"
        );
    }
}
