// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Daemon configuration loaded from YAML.
//!
//! Configuration is YAML (never TOML). Layers are **deep-merged** — override
//! only the fields you care about in each file.
//!
//! Search order (later overrides earlier):
//! 1. `/etc/agent-relay/relay.yaml`
//! 2. `~/.config/agent-relay/relay.yaml`
//! 3. `.agent-relay/relay.yaml` (workspace-local)
//! 4. Path given to [`load`] explicitly.
//!
//! Environment overrides apply last: `AGENT_RELAY_SOCKET` for the socket
//! path, `AGENT_RELAY_DATA_DIR` for the data directory.
//!
//! **All defaults are production-safe**: 1 MiB frames, 5 s heartbeats with a
//! ×6 idle allowance, 500/1500/2000 write-queue watermarks, 30 s blocking
//! sends, 2 s shutdown grace, no TLS, no outbox, allow-all peer policy.
//!
//! # Example full config
//! ```yaml
//! socket:
//!   path: /run/user/1000/agent-relay.sock
//!   handshake_timeout_ms: 5000
//!
//! limits:
//!   max_frame_bytes: 1048576
//!   write_queue:
//!     low: 500
//!     high: 1500
//!     cap: 2000
//!
//! heartbeat:
//!   interval_ms: 5000
//!   timeout_multiplier: 6
//!
//! registry:
//!   duplicate_policy: displace   # or: reject
//!
//! spawn:
//!   commands:
//!     claude: ["claude-wrapper", "--name", "{name}", "--task", "{task}", "--socket", "{socket}"]
//!
//! tls:
//!   bind: "0.0.0.0:18800"
//!   cert: /etc/agent-relay/server.pem
//!   key: /etc/agent-relay/server.key
//!   client_ca: /etc/agent-relay/clients-ca.pem
//!   allowed_cns: ["ci-runner", "dashboard"]
//!
//! outbox:
//!   dir: /var/lib/agent-relay/outbox
//! ```

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub spawn: SpawnConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// Optional TCP+TLS listener for network deployments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Optional file-based ingress directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<OutboxConfig>,
    /// Directory for the auth config and PID file. Defaults next to the
    /// user's local data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Unix-domain socket path. `AGENT_RELAY_SOCKET` overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Accept the legacy 4-byte-header JSON-only framing on this listener.
    /// Applied per connection before its first frame is consumed.
    #[serde(default)]
    pub legacy_framing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default)]
    pub write_queue: WriteQueueConfig,
}

/// Watermarks for the per-connection bounded write queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteQueueConfig {
    #[serde(default = "default_queue_low")]
    pub low: usize,
    #[serde(default = "default_queue_high")]
    pub high: usize,
    #[serde(default = "default_queue_cap")]
    pub cap: usize,
    /// `retry_after_ms` advertised in BUSY notifications.
    #[serde(default = "default_busy_retry_ms")]
    pub busy_retry_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_ms")]
    pub interval_ms: u64,
    /// Idle allowance: a connection is dead after
    /// `interval_ms * timeout_multiplier` without any inbound frame.
    #[serde(default = "default_heartbeat_multiplier")]
    pub timeout_multiplier: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Default blocking-send timeout when the sender supplies none.
    #[serde(default = "default_sync_timeout_ms")]
    pub default_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// A second HELLO with a live name closes the previous holder and takes
    /// over. Keeps availability across CLI restarts.
    #[default]
    Displace,
    /// A second HELLO with a live name is rejected.
    Reject,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnConfig {
    /// argv template per recognized CLI identifier. Placeholders `{name}`,
    /// `{task}`, `{socket}`, `{parent}`, `{model}`, `{cwd}` are substituted
    /// per element.
    #[serde(default)]
    pub commands: HashMap<String, Vec<String>>,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Drain allowance for active connections during shutdown.
    #[serde(default = "default_shutdown_grace_ms")]
    pub grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// `host:port` for the TCP listener.
    pub bind: String,
    /// PEM server certificate chain.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
    /// PEM CA bundle; when set, clients must present a certificate that
    /// chains to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ca: Option<PathBuf>,
    /// Allowed client-certificate common names. Empty means any validated
    /// client certificate is accepted.
    #[serde(default)]
    pub allowed_cns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// YAML file mapping peer uid/gid to a team and agent-name prefix.
    /// Absent file means allow-all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    pub dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

fn default_handshake_timeout_ms() -> u64 {
    5000
}
fn default_max_frame_bytes() -> usize {
    relay_proto::DEFAULT_MAX_FRAME_BYTES
}
fn default_queue_low() -> usize {
    500
}
fn default_queue_high() -> usize {
    1500
}
fn default_queue_cap() -> usize {
    2000
}
fn default_busy_retry_ms() -> u64 {
    1000
}
fn default_heartbeat_ms() -> u64 {
    5000
}
fn default_heartbeat_multiplier() -> u32 {
    6
}
fn default_sync_timeout_ms() -> u64 {
    30_000
}
fn default_stop_grace_ms() -> u64 {
    3000
}
fn default_shutdown_grace_ms() -> u64 {
    2000
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            legacy_framing: false,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            write_queue: WriteQueueConfig::default(),
        }
    }
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            low: default_queue_low(),
            high: default_queue_high(),
            cap: default_queue_cap(),
            busy_retry_ms: default_busy_retry_ms(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_ms(),
            timeout_multiplier: default_heartbeat_multiplier(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_sync_timeout_ms(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_shutdown_grace_ms(),
        }
    }
}

// ── Resolved paths ────────────────────────────────────────────────────────────

impl RelayConfig {
    /// Effective socket path: env override, then config, then the runtime dir.
    pub fn socket_path(&self) -> PathBuf {
        if let Ok(p) = std::env::var("AGENT_RELAY_SOCKET") {
            if !p.is_empty() {
                return PathBuf::from(p);
            }
        }
        if let Some(p) = &self.socket.path {
            return p.clone();
        }
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("agent-relay.sock")
    }

    /// PID file sits next to the socket so `stop` can find the owner.
    pub fn pid_path(&self) -> PathBuf {
        self.socket_path().with_extension("pid")
    }

    /// Effective data directory: env override, then config, then
    /// `~/.local/share/agent-relay`.
    pub fn data_dir(&self) -> PathBuf {
        if let Ok(p) = std::env::var("AGENT_RELAY_DATA_DIR") {
            if !p.is_empty() {
                return PathBuf::from(p);
            }
        }
        if let Some(p) = &self.data_dir {
            return p.clone();
        }
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("agent-relay")
    }

    /// Effective peer-policy file: explicit config, else `peers.yaml` in the
    /// data dir (only honored when the file exists).
    pub fn peers_file(&self) -> Option<PathBuf> {
        if let Some(p) = &self.auth.peers_file {
            return Some(p.clone());
        }
        let implicit = self.data_dir().join("peers.yaml");
        implicit.is_file().then_some(implicit)
    }
}

// ── Loader ────────────────────────────────────────────────────────────────────

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    paths.push(PathBuf::from("/etc/agent-relay/relay.yaml"));
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/agent-relay/relay.yaml"));
    }
    paths.push(PathBuf::from(".agent-relay/relay.yaml"));
    paths
}

pub fn load(extra: Option<&Path>) -> anyhow::Result<RelayConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading relay config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit relay config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let config: RelayConfig = if matches!(&merged, serde_yaml::Value::Mapping(m) if m.is_empty()) {
        RelayConfig::default()
    } else {
        serde_yaml::from_value(merged).context("invalid relay configuration")?
    };
    Ok(config)
}

fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
