// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Peer-credential authorization for Unix-socket clients.
//!
//! On accept, the daemon reads the peer's uid/gid/pid from the kernel
//! (`SO_PEERCRED` via `UnixStream::peer_cred`). At HELLO time the claimed
//! agent name is checked against a YAML policy mapping uid/gid to a team and
//! an optional agent-name prefix. No policy file means allow-all; a policy
//! file with no matching rule means deny.
//!
//! ```yaml
//! rules:
//!   - uid: 1000
//!     team: core
//!     name_prefix: "core-"
//!   - gid: 2000
//!     team: web
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("peer not authorized: {0}")]
    Denied(String),
}

/// One uid/gid rule. A rule matches when its uid or gid equals the peer's.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    /// Agent names registered by this peer must start with the prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
}

impl PeerRule {
    fn matches(&self, uid: u32, gid: u32) -> bool {
        match (self.uid, self.gid) {
            (Some(u), Some(g)) => u == uid && g == gid,
            (Some(u), None) => u == uid,
            (None, Some(g)) => g == gid,
            (None, None) => false,
        }
    }
}

/// The loaded authorization policy. Empty means allow-all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerPolicy {
    #[serde(default)]
    pub rules: Vec<PeerRule>,
}

impl PeerPolicy {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let policy: PeerPolicy = serde_yaml::from_str(&text)?;
        Ok(policy)
    }

    /// Load the policy, falling back to allow-all when the file is absent or
    /// unreadable (logged).
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "peer policy unavailable, allowing all");
                Self::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check a HELLO against the policy. Returns the peer's team (if mapped).
    pub fn check(&self, uid: u32, gid: u32, agent_name: &str) -> Result<Option<String>, AuthError> {
        if self.rules.is_empty() {
            return Ok(None);
        }
        let Some(rule) = self.rules.iter().find(|r| r.matches(uid, gid)) else {
            return Err(AuthError::Denied(format!(
                "no policy rule for uid {uid} / gid {gid}"
            )));
        };
        if let Some(prefix) = &rule.name_prefix {
            if !agent_name.starts_with(prefix.as_str()) {
                return Err(AuthError::Denied(format!(
                    "agent name {agent_name:?} violates team prefix {prefix:?}"
                )));
            }
        }
        Ok(rule.team.clone())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
