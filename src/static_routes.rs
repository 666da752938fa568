//! Static route store: declarative routes from a YAML file.
//!
//! The file is the source of truth. Mutations rewrite it atomically
//! (sibling temp file + rename) and only then update the in-memory set,
//! so a crash mid-write always leaves the previous full document behind.
//! External edits are picked up by a polling watcher; a file that stops
//! parsing keeps the last good in-memory set and surfaces the error
//! through [`StaticRouteStore::info`].

use crate::labels;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

fn default_backend_path() -> String {
    "/".to_string()
}

fn default_force_ssl() -> bool {
    true
}

/// One statically declared route record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoute {
    pub domain: String,
    pub backend_url: String,
    #[serde(default = "default_backend_path")]
    pub backend_path: String,
    #[serde(default = "default_force_ssl")]
    pub force_ssl: bool,
    #[serde(default)]
    pub support_websocket: bool,
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
    #[serde(default)]
    pub cloudflare_tunnel: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StaticRoutesDocument {
    #[serde(default)]
    static_routes: Vec<StaticRoute>,
}

/// Typed store failures; callers branch on these.
#[derive(Debug)]
pub enum StoreError {
    DomainConflict(String),
    NotFound(String),
    Invalid(String),
    Io(std::io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DomainConflict(domain) => {
                write!(f, "a route for '{}' already exists", domain)
            }
            StoreError::NotFound(domain) => write!(f, "no route for '{}'", domain),
            StoreError::Invalid(reason) => write!(f, "invalid route: {}", reason),
            StoreError::Io(e) => write!(f, "static route file write failed: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// Broadcast to subscribers after every successful mutation or reload.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Changed(Vec<StaticRoute>),
}

/// Snapshot of the backing file's state, for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct StoreInfo {
    pub path: String,
    pub exists: bool,
    pub size: u64,
    pub mtime_secs: Option<u64>,
    pub routes_count: usize,
    pub parse_error: Option<String>,
}

struct StoreState {
    routes: Vec<StaticRoute>,
    /// (mtime, size) of the file as last read or written by us.
    file_stamp: Option<(SystemTime, u64)>,
    parse_error: Option<String>,
}

pub struct StaticRouteStore {
    path: PathBuf,
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

/// Comment block written at the top of the file, matching what operators
/// expect to find when they edit it by hand.
const FILE_HEADER: &str = "\
# Static routes configuration
# This file is watched for changes; edits take effect without a restart.
#
# Format:
# static_routes:
#   - domain: example.com
#     backend_url: http://backend-server:8080
#     backend_path: /
#     force_ssl: true
#     support_websocket: false

";

impl StaticRouteStore {
    /// Open the store, reading the file if it exists. A missing file is an
    /// empty store; an unparseable file starts the store empty with the
    /// parse error surfaced through `info()`. Only I/O failures are fatal.
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let path = path.into();
        let (events, _) = broadcast::channel(16);
        let store = Arc::new(Self {
            path,
            state: Mutex::new(StoreState {
                routes: Vec::new(),
                file_stamp: None,
                parse_error: None,
            }),
            events,
        });

        match store.read_file() {
            Ok(Some((routes, stamp))) => {
                info!(
                    path = %store.path.display(),
                    routes = routes.len(),
                    "Loaded static routes"
                );
                let mut state = store.state.lock();
                state.routes = routes;
                state.file_stamp = Some(stamp);
            }
            Ok(None) => {
                info!(path = %store.path.display(), "No static route file, starting empty");
            }
            Err(e @ StoreError::Io(_)) => return Err(e),
            Err(e) => {
                warn!(path = %store.path.display(), error = %e, "Static route file unreadable, starting empty");
                store.state.lock().parse_error = Some(e.to_string());
            }
        }
        Ok(store)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn list(&self) -> Vec<StaticRoute> {
        self.state.lock().routes.clone()
    }

    pub fn get(&self, domain: &str) -> Option<StaticRoute> {
        self.state
            .lock()
            .routes
            .iter()
            .find(|r| r.domain == domain)
            .cloned()
    }

    pub fn info(&self) -> StoreInfo {
        let state = self.state.lock();
        let metadata = std::fs::metadata(&self.path).ok();
        StoreInfo {
            path: self.path.display().to_string(),
            exists: metadata.is_some(),
            size: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
            mtime_secs: metadata
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            routes_count: state.routes.len(),
            parse_error: state.parse_error.clone(),
        }
    }

    pub fn create(&self, route: StaticRoute) -> Result<(), StoreError> {
        labels::compile_static_route(&route)
            .map_err(|w| StoreError::Invalid(w.message))?;

        let mut state = self.state.lock();
        if state.routes.iter().any(|r| r.domain == route.domain) {
            return Err(StoreError::DomainConflict(route.domain));
        }

        let mut updated = state.routes.clone();
        updated.push(route);
        self.persist(&mut state, updated)
    }

    pub fn update(&self, domain: &str, route: StaticRoute) -> Result<(), StoreError> {
        labels::compile_static_route(&route)
            .map_err(|w| StoreError::Invalid(w.message))?;

        let mut state = self.state.lock();
        if !state.routes.iter().any(|r| r.domain == domain) {
            return Err(StoreError::NotFound(domain.to_string()));
        }
        if route.domain != domain && state.routes.iter().any(|r| r.domain == route.domain) {
            return Err(StoreError::DomainConflict(route.domain));
        }

        let updated = state
            .routes
            .iter()
            .map(|r| if r.domain == domain { route.clone() } else { r.clone() })
            .collect();
        self.persist(&mut state, updated)
    }

    pub fn delete(&self, domain: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let updated: Vec<StaticRoute> = state
            .routes
            .iter()
            .filter(|r| r.domain != domain)
            .cloned()
            .collect();
        if updated.len() == state.routes.len() {
            return Err(StoreError::NotFound(domain.to_string()));
        }
        self.persist(&mut state, updated)
    }

    /// Write `updated` to disk atomically, then commit it to memory and
    /// notify subscribers. Memory is untouched when the write fails.
    fn persist(&self, state: &mut StoreState, updated: Vec<StaticRoute>) -> Result<(), StoreError> {
        let stamp = self.write_file(&updated)?;
        state.routes = updated.clone();
        state.file_stamp = Some(stamp);
        state.parse_error = None;
        let _ = self.events.send(StoreEvent::Changed(updated));
        Ok(())
    }

    /// Atomic write: temp sibling, flush to disk, rename over the target.
    fn write_file(&self, routes: &[StaticRoute]) -> Result<(SystemTime, u64), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let document = StaticRoutesDocument {
            static_routes: routes.to_vec(),
        };
        let yaml = serde_yaml::to_string(&document)
            .map_err(|e| StoreError::Invalid(format!("serialization failed: {}", e)))?;
        let content = format!("{}{}", FILE_HEADER, yaml);

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "static-routes.yml".to_string());
        let tmp_path = self.path.with_file_name(format!(".{}.tmp", file_name));

        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o644));
        }

        let metadata = std::fs::metadata(&self.path)?;
        let mtime = metadata.modified()?;
        Ok((mtime, metadata.len()))
    }

    /// Read and validate the file. `Ok(None)` when it does not exist;
    /// `Err` carries a parse failure message.
    fn read_file(&self) -> Result<Option<(Vec<StaticRoute>, (SystemTime, u64))>, StoreError> {
        let metadata = match std::fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let content = std::fs::read_to_string(&self.path)?;

        let document: StaticRoutesDocument = if content.trim().is_empty() {
            StaticRoutesDocument::default()
        } else {
            serde_yaml::from_str(&content)
                .map_err(|e| StoreError::Invalid(format!("YAML parse error: {}", e)))?
        };

        // Drop records that would not compile, and reject duplicate
        // domains at load: the first record wins.
        let mut routes: Vec<StaticRoute> = Vec::new();
        for route in document.static_routes {
            if let Err(w) = labels::compile_static_route(&route) {
                warn!(domain = %route.domain, reason = %w.message, "Dropping invalid static route");
                continue;
            }
            if routes.iter().any(|r| r.domain == route.domain) {
                warn!(domain = %route.domain, "Dropping duplicate static route, first record wins");
                continue;
            }
            routes.push(route);
        }

        let mtime = metadata.modified()?;
        Ok(Some((routes, (mtime, metadata.len()))))
    }

    /// Re-read the file if its stamp moved since we last touched it.
    /// Returns true when a reload happened and subscribers were notified.
    pub fn reload_if_changed(&self) -> bool {
        let current = std::fs::metadata(&self.path)
            .ok()
            .and_then(|m| m.modified().ok().map(|t| (t, m.len())));

        {
            let state = self.state.lock();
            if current == state.file_stamp {
                return false;
            }
        }

        match self.read_file() {
            Ok(Some((routes, stamp))) => {
                let mut state = self.state.lock();
                info!(
                    path = %self.path.display(),
                    before = state.routes.len(),
                    after = routes.len(),
                    "Static route file changed externally, reloaded"
                );
                state.routes = routes.clone();
                state.file_stamp = Some(stamp);
                state.parse_error = None;
                drop(state);
                let _ = self.events.send(StoreEvent::Changed(routes));
                true
            }
            Ok(None) => {
                let mut state = self.state.lock();
                if state.routes.is_empty() && state.file_stamp.is_none() {
                    return false;
                }
                info!(path = %self.path.display(), "Static route file removed, clearing routes");
                state.routes = Vec::new();
                state.file_stamp = None;
                state.parse_error = None;
                drop(state);
                let _ = self.events.send(StoreEvent::Changed(Vec::new()));
                true
            }
            Err(e) => {
                // Keep the previous set; surface the error through info().
                warn!(path = %self.path.display(), error = %e, "Static route file unreadable, keeping previous routes");
                let mut state = self.state.lock();
                state.parse_error = Some(e.to_string());
                state.file_stamp = current;
                false
            }
        }
    }

    /// Poll the file for external changes until shutdown. The polling
    /// watcher survives bind mounts and network filesystems that drop
    /// inotify events.
    pub async fn run_watcher(
        self: Arc<Self>,
        poll_interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!(path = %self.path.display(), "Static route watcher starting");
        let debounce = Duration::from_millis(500);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {
                    let changed = {
                        let current = std::fs::metadata(&self.path)
                            .ok()
                            .and_then(|m| m.modified().ok().map(|t| (t, m.len())));
                        current != self.state.lock().file_stamp
                    };
                    if changed {
                        // Let in-progress writers finish their rename.
                        tokio::time::sleep(debounce).await;
                        self.reload_if_changed();
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(path = %self.path.display(), "Static route watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(domain: &str, backend_url: &str) -> StaticRoute {
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

    fn temp_store() -> (tempfile::TempDir, Arc<StaticRouteStore>) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = StaticRouteStore::open(dir.path().join("static-routes.yml")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_get_delete() {
        let (_dir, store) = temp_store();

        store.create(route("a.example.com", "http://b:8080")).unwrap();
        assert_eq!(store.list().len(), 1);
        assert!(store.get("a.example.com").is_some());

        store.delete("a.example.com").unwrap();
        assert!(store.list().is_empty());
        assert!(store.get("a.example.com").is_none());
    }

    #[test]
    fn test_create_conflict() {
        let (_dir, store) = temp_store();
        store.create(route("a.example.com", "http://b:8080")).unwrap();
        let err = store.create(route("a.example.com", "http://c:9090")).unwrap_err();
        assert!(matches!(err, StoreError::DomainConflict(_)));
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_update_and_not_found() {
        let (_dir, store) = temp_store();
        store.create(route("a.example.com", "http://b:8080")).unwrap();

        store
            .update("a.example.com", route("a.example.com", "http://c:9090"))
            .unwrap();
        assert_eq!(store.get("a.example.com").unwrap().backend_url, "http://c:9090");

        let err = store
            .update("missing.example.com", route("missing.example.com", "http://x:1"))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let err = store.delete("missing.example.com").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_update_rename_conflict() {
        let (_dir, store) = temp_store();
        store.create(route("a.example.com", "http://b:8080")).unwrap();
        store.create(route("b.example.com", "http://b:8081")).unwrap();

        let err = store
            .update("a.example.com", route("b.example.com", "http://b:8080"))
            .unwrap_err();
        assert!(matches!(err, StoreError::DomainConflict(_)));
    }

    #[test]
    fn test_invalid_record_rejected() {
        let (_dir, store) = temp_store();
        let err = store.create(route("a.example.com", "ftp://nope")).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_file_is_complete_document_after_write() {
        let (dir, store) = temp_store();
        store.create(route("a.example.com", "http://b:8080")).unwrap();
        store.create(route("b.example.com", "http://b:8081")).unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("static-routes.yml")).unwrap();
        assert!(content.starts_with("# Static routes configuration"));
        let document: StaticRoutesDocument = serde_yaml::from_str(&content).unwrap();
        assert_eq!(document.static_routes.len(), 2);

        // No temp file left behind.
        assert!(!dir.path().join(".static-routes.yml.tmp").exists());
    }

    #[test]
    fn test_reopen_reads_persisted_routes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("static-routes.yml");
        {
            let store = StaticRouteStore::open(&path).unwrap();
            store.create(route("a.example.com", "http://b:8080")).unwrap();
        }
        let reopened = StaticRouteStore::open(&path).unwrap();
        assert_eq!(reopened.list().len(), 1);
    }

    #[test]
    fn test_duplicate_domains_in_file_first_wins() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("static-routes.yml");
        std::fs::write(
            &path,
            "static_routes:\n\
             - domain: dup.example.com\n  backend_url: http://first:80\n\
             - domain: dup.example.com\n  backend_url: http://second:80\n",
        )
        .unwrap();

        let store = StaticRouteStore::open(&path).unwrap();
        let routes = store.list();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].backend_url, "http://first:80");
    }

    #[test]
    fn test_external_change_reload_and_event() {
        let (dir, store) = temp_store();
        store.create(route("a.example.com", "http://b:8080")).unwrap();
        let mut events = store.subscribe();

        // Simulate an external atomic replace with one add and one delete.
        std::fs::write(
            dir.path().join("static-routes.yml"),
            "static_routes:\n- domain: b.example.com\n  backend_url: http://c:9090\n",
        )
        .unwrap();

        assert!(store.reload_if_changed());
        let routes = store.list();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].domain, "b.example.com");

        match events.try_recv().unwrap() {
            StoreEvent::Changed(routes) => assert_eq!(routes.len(), 1),
        }
    }

    #[test]
    fn test_unparseable_file_keeps_previous_state() {
        let (dir, store) = temp_store();
        store.create(route("a.example.com", "http://b:8080")).unwrap();

        std::fs::write(dir.path().join("static-routes.yml"), "static_routes: [unclosed").unwrap();

        assert!(!store.reload_if_changed());
        assert_eq!(store.list().len(), 1);
        let info = store.info();
        assert!(info.parse_error.is_some());
    }

    #[test]
    fn test_info_reports_file_state() {
        let (_dir, store) = temp_store();
        let before = store.info();
        assert!(!before.exists);
        assert_eq!(before.routes_count, 0);

        store.create(route("a.example.com", "http://b:8080")).unwrap();
        let after = store.info();
        assert!(after.exists);
        assert_eq!(after.routes_count, 1);
        assert!(after.size > 0);
        assert!(after.parse_error.is_none());
    }
}
