use revp::caddy::CaddyClient;
use revp::config::Config;
use revp::executor::{RemoteExecutor, SshExecutor, SshTarget};
use revp::observer::{self, HostObserver, ObserverConfig};
use revp::reconciler::{Reconciler, ReconcilerConfig};
use revp::registry::ServiceRegistry;
use revp::static_routes::StaticRouteStore;
use revp::status::{StatusContext, StatusServer, PKG_NAME, VERSION};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("revp=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("revp.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Root shutdown signal; every task drains on it.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Proxy admin client. Reachability is probed here for the log, but a
    // down proxy is not fatal: the reconciler retries until it answers.
    let client = Arc::new(CaddyClient::new(
        &config.proxy.admin_url,
        config.proxy_timeout(),
        config.proxy.http_server.clone(),
        config.proxy.https_server.clone(),
    )?);
    match client.check_connectivity().await {
        Ok(()) => info!(url = %config.proxy.admin_url, "Connected to proxy admin API"),
        Err(e) => warn!(url = %config.proxy.admin_url, error = %e, "Proxy admin API unreachable, will keep retrying"),
    }

    // Static route store and its external-change watcher.
    let store = match config.static_routes.file.as_deref() {
        Some(path) => StaticRouteStore::open(path)
            .map_err(|e| anyhow::anyhow!("failed to open static route store: {}", e))?,
        None => {
            // No file configured: an inert store backed by a path that
            // will never exist keeps the rest of the wiring uniform.
            StaticRouteStore::open(std::env::temp_dir().join("revp-static-disabled.yml"))
                .map_err(|e| anyhow::anyhow!("failed to open static route store: {}", e))?
        }
    };
    let store_events = store.subscribe();
    if config.static_routes.file.is_some() {
        let watcher = Arc::clone(&store);
        let watcher_shutdown = shutdown_rx.clone();
        tokio::spawn(watcher.run_watcher(config.store_poll_interval(), watcher_shutdown));
    }

    // Remote executor over the enabled hosts.
    let enabled_hosts = config.enabled_hosts();
    let targets: Vec<SshTarget> = enabled_hosts
        .iter()
        .map(|h| SshTarget {
            alias: h.alias.clone(),
            hostname: h.hostname.clone(),
            port: h.port,
            user: h.user.clone(),
            identity_file: h.identity_file.clone(),
        })
        .collect();
    let executor: Arc<dyn RemoteExecutor> = Arc::new(SshExecutor::new(
        targets,
        PathBuf::from(&config.ssh.control_dir),
        config.command_timeout(),
    )?);

    // Observers feed one bounded channel into the registry.
    let (host_event_tx, host_event_rx) = mpsc::channel(config.limits.event_channel_capacity);
    let host_states = observer::new_host_states(enabled_hosts.iter().map(|h| h.alias.clone()));

    let mut observer_handles = Vec::new();
    for host in &enabled_hosts {
        let observer = HostObserver::new(
            host.alias.clone(),
            host.backend_host(),
            Arc::clone(&executor),
            host_event_tx.clone(),
            Arc::clone(&host_states),
            ObserverConfig {
                heartbeat_deadline: config.heartbeat_deadline(),
                resync_interval: config.reconcile_interval(),
            },
            shutdown_rx.clone(),
        );
        observer_handles.push(tokio::spawn(observer.run()));
    }
    // The registry's channel closes when the last observer drops its
    // sender; keep ours out of the count.
    drop(host_event_tx);

    // Registry: merge observers and store into the desired set.
    let backend_hosts: HashMap<String, String> = enabled_hosts
        .iter()
        .map(|h| (h.alias.clone(), h.backend_host()))
        .collect();
    let (diff_tx, diff_rx) = mpsc::channel(1024);
    let registry = ServiceRegistry::new(backend_hosts, store.list(), diff_tx);
    let registry_snapshot = registry.snapshot_handle();
    let registry_handle = tokio::spawn(registry.run(
        host_event_rx,
        store_events,
        shutdown_rx.clone(),
    ));

    // Reconciler: converge the proxy toward the desired set.
    let reconciler = Reconciler::new(
        Arc::clone(&client),
        ReconcilerConfig {
            max_concurrent: config.limits.max_concurrent_reconciles,
            max_retries: config.limits.max_retries,
            sweep_interval: config.reconcile_interval(),
        },
        shutdown_rx.clone(),
    );
    let reconciler_handle = tokio::spawn(Arc::clone(&reconciler).run(diff_rx));

    // Status API.
    let status_handle = if config.status.bind.is_empty() {
        None
    } else {
        let bind_addr: SocketAddr = config
            .status
            .bind
            .parse()
            .expect("status.bind validated at load");
        let server = StatusServer::new(
            bind_addr,
            StatusContext {
                registry: registry_snapshot,
                host_states,
                store: Arc::clone(&store),
                reconciler: Arc::clone(&reconciler),
                proxy: Arc::clone(&client),
            },
            shutdown_rx.clone(),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Status API error");
            }
        }))
    };

    // Wait for shutdown signal; SIGHUP forces an immediate resync.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, requesting resync");
                    reconciler.request_resync();
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and drain within the grace period. In-flight proxy
    // mutations finish; queued work is dropped.
    let _ = shutdown_tx.send(true);

    let drained = tokio::time::timeout(config.shutdown_grace(), async {
        for handle in observer_handles {
            let _ = handle.await;
        }
        let _ = registry_handle.await;
        let _ = reconciler_handle.await;
        if let Some(handle) = status_handle {
            let _ = handle.await;
        }
    })
    .await
    .is_ok();

    if drained {
        info!("Shutdown complete");
    } else {
        warn!(
            grace_secs = config.shutdown_grace().as_secs(),
            "Shutdown grace period elapsed with tasks still running"
        );
    }
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting control plane");
    info!(
        proxy_admin = %config.proxy.admin_url,
        http_server = %config.proxy.http_server,
        https_server = %config.proxy.https_server,
        "Proxy settings"
    );
    info!(
        reconcile_interval_secs = config.timers.reconcile_interval_secs,
        heartbeat_deadline_secs = config.timers.heartbeat_deadline_secs,
        shutdown_grace_secs = config.timers.shutdown_grace_secs,
        command_timeout_secs = config.timers.command_timeout_secs,
        "Timers"
    );
    info!(
        max_concurrent_reconciles = config.limits.max_concurrent_reconciles,
        max_retries = config.limits.max_retries,
        event_channel_capacity = config.limits.event_channel_capacity,
        "Limits"
    );
    let hosts = config.enabled_hosts();
    info!(
        host_count = hosts.len(),
        hosts = ?hosts.iter().map(|h| h.alias.as_str()).collect::<Vec<_>>(),
        static_routes = ?config.static_routes.file,
        "Sources"
    );
}
