//! Canonical container model and parsing of the Docker CLI's JSON output.
//!
//! The observer drives `docker ps`, `docker inspect` and `docker events`
//! over SSH; this module turns their output into the one container shape
//! the rest of the crate consumes. Only field availability matters here,
//! not the transport.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Label namespace that marks a container as participating in routing.
pub const LABEL_PREFIX: &str = "snadboy.revp.";

/// Container lifecycle status as reported by the remote daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Paused,
    Exited,
    Other,
}

impl ContainerStatus {
    fn from_docker(status: &str) -> Self {
        match status {
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "exited" | "dead" => ContainerStatus::Exited,
            _ => ContainerStatus::Other,
        }
    }
}

/// Snapshot of one container on one host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Container {
    pub id: String,
    pub host: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub labels: HashMap<String, String>,
    /// Container port → published host port. Unpublished ports map to None.
    pub port_bindings: HashMap<u16, Option<u16>>,
}

impl Container {
    /// Whether any label participates in the routing namespace.
    pub fn has_route_labels(&self) -> bool {
        self.labels.keys().any(|k| k.starts_with(LABEL_PREFIX))
    }

    /// Published host port for a container port, if the port is bound.
    pub fn published_port(&self, container_port: u16) -> Option<u16> {
        self.port_bindings.get(&container_port).copied().flatten()
    }
}

/// Events emitted by a host observer toward the registry.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// Full authoritative snapshot of the host's labeled containers.
    Sync {
        host: String,
        containers: Vec<Container>,
    },
    /// One container was created, started, stopped, or otherwise mutated.
    Changed(Container),
    /// One container is gone from the host.
    Removed { host: String, id: String },
}

// docker inspect output, reduced to the fields the model needs.

#[derive(Debug, Deserialize)]
struct InspectRecord {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Config", default)]
    config: InspectConfig,
    #[serde(rename = "State", default)]
    state: InspectState,
    #[serde(rename = "NetworkSettings", default)]
    network_settings: InspectNetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectState {
    #[serde(rename = "Status", default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct InspectNetworkSettings {
    #[serde(rename = "Ports", default)]
    ports: HashMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Debug, Deserialize)]
struct PortBinding {
    #[serde(rename = "HostPort", default)]
    host_port: String,
}

/// Parse the JSON array printed by `docker inspect <id>...`.
pub fn parse_inspect_output(host: &str, json: &str) -> Result<Vec<Container>> {
    let records: Vec<InspectRecord> =
        serde_json::from_str(json).context("invalid docker inspect output")?;
    Ok(records
        .into_iter()
        .map(|r| container_from_inspect(host, r))
        .collect())
}

fn container_from_inspect(host: &str, record: InspectRecord) -> Container {
    let mut port_bindings: HashMap<u16, Option<u16>> = HashMap::new();

    // Keys look like "80/tcp"; a TCP binding wins over a UDP one for the
    // same container port.
    for (key, bindings) in &record.network_settings.ports {
        let Some((port_str, proto)) = key.split_once('/') else {
            continue;
        };
        let Ok(container_port) = port_str.parse::<u16>() else {
            continue;
        };

        let host_port = bindings
            .as_ref()
            .and_then(|b| b.first())
            .and_then(|b| b.host_port.parse::<u16>().ok());

        let entry = port_bindings.entry(container_port).or_insert(None);
        match (proto, host_port) {
            ("tcp", Some(p)) => *entry = Some(p),
            (_, Some(p)) if entry.is_none() => *entry = Some(p),
            _ => {}
        }
    }

    Container {
        id: record.id,
        host: host.to_string(),
        name: record.name.trim_start_matches('/').to_string(),
        image: record.config.image,
        status: ContainerStatus::from_docker(&record.state.status),
        labels: record.config.labels.unwrap_or_default(),
        port_bindings,
    }
}

/// Lifecycle actions the observer reacts to on the event stream.
pub const WATCHED_ACTIONS: &[&str] = &[
    "start", "die", "kill", "stop", "pause", "unpause", "destroy", "rename", "update",
];

/// One line of `docker events --format '{{json .}}'`.
#[derive(Debug, Clone, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub time: i64,
}

impl EventRecord {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).context("invalid docker events line")
    }

    /// Container lifecycle events the observer cares about. Exec and
    /// health-check noise carries a ":"-suffixed action and is skipped.
    pub fn is_watched(&self) -> bool {
        self.kind == "container" && WATCHED_ACTIONS.contains(&self.action.as_str())
    }

    /// Actions after which the container no longer exists (or is about
    /// to stop existing) and its routes must be withdrawn.
    pub fn is_removal(&self) -> bool {
        matches!(self.action.as_str(), "die" | "destroy")
    }
}

/// One line of `docker ps --format '{{json .}}'`; only the id is consumed,
/// the full model always comes from inspect.
#[derive(Debug, Deserialize)]
pub struct PsRecord {
    #[serde(rename = "ID")]
    pub id: String,
}

pub fn parse_ps_output(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str::<PsRecord>(l).ok())
        .map(|r| r.id)
        .collect()
}
