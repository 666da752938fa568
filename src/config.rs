use crate::executor::validate_host_token;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Process configuration, loaded from a TOML file at startup.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub static_routes: StaticRoutesConfig,

    #[serde(default)]
    pub status: StatusConfig,

    #[serde(default)]
    pub timers: TimersConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    /// Defaults applied to hosts that omit the corresponding field.
    #[serde(default)]
    pub host_defaults: HostDefaults,

    /// Observed hosts, keyed by alias.
    #[serde(default)]
    pub hosts: HashMap<String, HostEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Base URL of the proxy admin API.
    #[serde(default = "default_admin_url")]
    pub admin_url: String,

    /// Server name routes for the HTTP listener are materialized into.
    #[serde(default = "default_http_server")]
    pub http_server: String,

    /// Server name routes for the HTTPS listener are materialized into.
    #[serde(default = "default_https_server")]
    pub https_server: String,

    /// Deadline for each admin API call in seconds.
    #[serde(default = "default_proxy_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            admin_url: default_admin_url(),
            http_server: default_http_server(),
            https_server: default_https_server(),
            timeout_secs: default_proxy_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StaticRoutesConfig {
    /// Path of the static route YAML file. Unset disables static routes.
    pub file: Option<String>,

    /// Poll interval of the external-change watcher in seconds.
    #[serde(default = "default_store_poll")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatusConfig {
    /// Bind address of the status API; empty string disables it.
    #[serde(default = "default_status_bind")]
    pub bind: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            bind: default_status_bind(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimersConfig {
    /// Periodic sweep and observer resync interval in seconds.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Event stream considered stalled after this many seconds.
    #[serde(default = "default_heartbeat_deadline")]
    pub heartbeat_deadline_secs: u64,

    /// Grace period for draining tasks at shutdown in seconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Deadline for unary remote commands in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            heartbeat_deadline_secs: default_heartbeat_deadline(),
            shutdown_grace_secs: default_shutdown_grace(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Upper bound on concurrently reconciling domains.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_reconciles: usize,

    /// Retries per proxy operation before a domain degrades.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Capacity of the observer→registry event channel.
    #[serde(default = "default_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: default_max_concurrent(),
            max_retries: default_max_retries(),
            event_channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SshConfig {
    /// Directory holding ControlMaster sockets.
    #[serde(default = "default_control_dir")]
    pub control_dir: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            control_dir: default_control_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostDefaults {
    #[serde(default = "default_ssh_user")]
    pub user: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default = "default_identity_file")]
    pub identity_file: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for HostDefaults {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            port: default_ssh_port(),
            identity_file: default_identity_file(),
            enabled: default_true(),
        }
    }
}

/// One observed host as written in the config file. Unset fields fall
/// back to `[host_defaults]`.
#[derive(Debug, Deserialize, Clone)]
pub struct HostEntry {
    pub hostname: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<String>,
    pub enabled: Option<bool>,
    #[serde(default)]
    pub description: String,
}

/// A host with every default applied, ready for the executor.
#[derive(Debug, Clone)]
pub struct ResolvedHost {
    pub alias: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub identity_file: String,
    pub enabled: bool,
    pub description: String,
}

impl ResolvedHost {
    /// Address backends published on this host are dialed at. Containers
    /// cannot reach the proxy's loopback, so localhost maps to the
    /// host-gateway name.
    pub fn backend_host(&self) -> String {
        match self.hostname.as_str() {
            "localhost" | "127.0.0.1" => "host.docker.internal".to_string(),
            other => other.to_string(),
        }
    }
}

fn default_admin_url() -> String {
    "http://localhost:2019".to_string()
}

fn default_http_server() -> String {
    "revp_http".to_string()
}

fn default_https_server() -> String {
    "revp_https".to_string()
}

fn default_proxy_timeout() -> u64 {
    5
}

fn default_store_poll() -> u64 {
    2
}

fn default_status_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_reconcile_interval() -> u64 {
    300
}

fn default_heartbeat_deadline() -> u64 {
    90
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    16
}

fn default_max_retries() -> u32 {
    8
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_control_dir() -> String {
    std::env::temp_dir().join("revp-ssh").display().to_string()
}

fn default_ssh_user() -> String {
    "revp".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_identity_file() -> String {
    "/root/.ssh/id_revp".to_string()
}

fn default_true() -> bool {
    true
}

/// Maximum SSH username length.
const MAX_USER_LEN: usize = 32;

fn validate_user(user: &str) -> Result<(), String> {
    if user.is_empty() {
        return Err("user is empty".to_string());
    }
    if user.len() > MAX_USER_LEN {
        return Err(format!("user exceeds {} characters", MAX_USER_LEN));
    }
    if !user
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err(format!("user '{}' contains invalid characters", user));
    }
    Ok(())
}

fn validate_alias(alias: &str) -> Result<(), String> {
    if alias.is_empty() {
        return Err("alias is empty".to_string());
    }
    if !alias
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err(format!("alias '{}' contains invalid characters", alias));
    }
    Ok(())
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("failed to read config file {}: {}", path.display(), e)
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("failed to parse config file {}: {}", path.display(), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything up front and report every problem at once.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors: Vec<String> = Vec::new();

        match url::Url::parse(&self.proxy.admin_url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            Ok(parsed) => errors.push(format!(
                "proxy.admin_url has unsupported scheme '{}'",
                parsed.scheme()
            )),
            Err(e) => errors.push(format!("proxy.admin_url is invalid: {}", e)),
        }

        if !self.status.bind.is_empty() && self.status.bind.parse::<std::net::SocketAddr>().is_err()
        {
            errors.push(format!(
                "status.bind '{}' is not a valid socket address",
                self.status.bind
            ));
        }

        if let Err(e) = validate_user(&self.host_defaults.user) {
            errors.push(format!("host_defaults: {}", e));
        }

        for (alias, entry) in &self.hosts {
            if let Err(e) = validate_alias(alias) {
                errors.push(format!("hosts.{}: {}", alias, e));
            }
            if let Err(e) = validate_host_token(&entry.hostname) {
                errors.push(format!("hosts.{}: hostname {}", alias, e));
            }
            if let Some(ref user) = entry.user {
                if let Err(e) = validate_user(user) {
                    errors.push(format!("hosts.{}: {}", alias, e));
                }
            }
            if entry.port == Some(0) {
                errors.push(format!("hosts.{}: port must be between 1 and 65535", alias));
            }
            let identity = entry
                .identity_file
                .as_deref()
                .unwrap_or(&self.host_defaults.identity_file);
            if identity.is_empty() {
                errors.push(format!("hosts.{}: identity_file is empty", alias));
            }
        }

        if self.enabled_hosts().is_empty() && self.static_routes.file.is_none() {
            errors.push(
                "no enabled hosts and no static route file configured, nothing to do".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("configuration errors:\n  - {}", errors.join("\n  - "))
        }
    }

    /// All hosts with defaults applied.
    pub fn resolved_hosts(&self) -> Vec<ResolvedHost> {
        let mut hosts: Vec<ResolvedHost> = self
            .hosts
            .iter()
            .map(|(alias, entry)| ResolvedHost {
                alias: alias.clone(),
                hostname: entry.hostname.clone(),
                port: entry.port.unwrap_or(self.host_defaults.port),
                user: entry
                    .user
                    .clone()
                    .unwrap_or_else(|| self.host_defaults.user.clone()),
                identity_file: entry
                    .identity_file
                    .clone()
                    .unwrap_or_else(|| self.host_defaults.identity_file.clone()),
                enabled: entry.enabled.unwrap_or(self.host_defaults.enabled),
                description: entry.description.clone(),
            })
            .collect();
        hosts.sort_by(|a, b| a.alias.cmp(&b.alias));
        hosts
    }

    pub fn enabled_hosts(&self) -> Vec<ResolvedHost> {
        self.resolved_hosts()
            .into_iter()
            .filter(|h| h.enabled)
            .collect()
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.timers.reconcile_interval_secs)
    }

    pub fn heartbeat_deadline(&self) -> Duration {
        Duration::from_secs(self.timers.heartbeat_deadline_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.timers.shutdown_grace_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.timers.command_timeout_secs)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.timeout_secs)
    }

    pub fn store_poll_interval(&self) -> Duration {
        Duration::from_secs(self.static_routes.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [hosts.tower]
            hostname = "tower.example.net"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.proxy.admin_url, "http://localhost:2019");
        assert_eq!(config.timers.reconcile_interval_secs, 300);
        assert_eq!(config.timers.heartbeat_deadline_secs, 90);
        assert_eq!(config.limits.max_concurrent_reconciles, 16);
        assert_eq!(config.limits.max_retries, 8);

        let hosts = config.enabled_hosts();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].alias, "tower");
        assert_eq!(hosts[0].port, 22);
        assert_eq!(hosts[0].user, "revp");
        assert_eq!(hosts[0].identity_file, "/root/.ssh/id_revp");
    }

    #[test]
    fn test_host_defaults_merge() {
        let config: Config = toml::from_str(
            r#"
            [host_defaults]
            user = "deploy"
            port = 2222
            identity_file = "/keys/id_deploy"

            [hosts.a]
            hostname = "a.example.net"

            [hosts.b]
            hostname = "b.example.net"
            user = "custom"
            port = 22
            enabled = false
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        let hosts = config.resolved_hosts();
        let a = hosts.iter().find(|h| h.alias == "a").unwrap();
        assert_eq!(a.user, "deploy");
        assert_eq!(a.port, 2222);
        assert_eq!(a.identity_file, "/keys/id_deploy");
        assert!(a.enabled);

        let b = hosts.iter().find(|h| h.alias == "b").unwrap();
        assert_eq!(b.user, "custom");
        assert_eq!(b.port, 22);
        assert!(!b.enabled);

        assert_eq!(config.enabled_hosts().len(), 1);
    }

    #[test]
    fn test_localhost_backend_host_mapping() {
        let host = ResolvedHost {
            alias: "local".to_string(),
            hostname: "localhost".to_string(),
            port: 22,
            user: "revp".to_string(),
            identity_file: "/k".to_string(),
            enabled: true,
            description: String::new(),
        };
        assert_eq!(host.backend_host(), "host.docker.internal");

        let remote = ResolvedHost {
            hostname: "tower.example.net".to_string(),
            ..host
        };
        assert_eq!(remote.backend_host(), "tower.example.net");
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            admin_url = "not a url"

            [status]
            bind = "nonsense"

            [hosts."bad alias!"]
            hostname = "also bad!"
            user = "no spaces allowed"
            "#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("admin_url"));
        assert!(err.contains("status.bind"));
        assert!(err.contains("alias"));
        assert!(err.contains("hostname"));
        assert!(err.contains("invalid characters"));
    }

    #[test]
    fn test_nothing_to_do_is_an_error() {
        let config: Config = toml::from_str("").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("nothing to do"));
    }

    #[test]
    fn test_static_routes_only_is_valid() {
        let config: Config = toml::from_str(
            r#"
            [static_routes]
            file = "/data/static-routes.yml"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
    }
}
