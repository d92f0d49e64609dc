// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Authoritative live mapping of agent name → connection.
//!
//! Exactly one connection owns a name at a time. The duplicate policy decides
//! what happens when a second HELLO claims a live name: **displace** (default,
//! keeps availability across CLI restarts) or **reject**. Membership changes
//! are announced on a broadcast channel; the router never stores strong
//! references of its own, it resolves through this table.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use relay_proto::EntityType;

use crate::config::DuplicatePolicy;
use crate::connection::Connection;

/// Presence events observed by the server (and anything else subscribed).
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    AgentReady { name: String, entity: EntityType },
    AgentGone { name: String },
}

/// Result of a registration attempt.
pub enum RegisterOutcome {
    /// The name was free (or already held by this very connection).
    Inserted,
    /// Displace policy: the previous holder was evicted and is returned so
    /// the caller can notify and close it.
    Displaced(Arc<Connection>),
    /// Reject policy: the name stays with its current holder.
    Rejected,
}

pub struct AgentRegistry {
    agents: DashMap<String, Arc<Connection>>,
    policy: DuplicatePolicy,
    events: broadcast::Sender<RegistryEvent>,
}

impl AgentRegistry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            agents: DashMap::new(),
            policy,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Atomically claim `name` for `conn`. The connection must already carry
    /// its validated agent identity.
    pub fn register(&self, name: &str, conn: Arc<Connection>) -> RegisterOutcome {
        let entity = conn.agent().map(|a| a.entity).unwrap_or_default();
        let outcome = match self.agents.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(conn);
                RegisterOutcome::Inserted
            }
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if e.get().id() == conn.id() {
                    RegisterOutcome::Inserted
                } else {
                    match self.policy {
                        DuplicatePolicy::Displace => {
                            let old = std::mem::replace(e.get_mut(), conn);
                            RegisterOutcome::Displaced(old)
                        }
                        DuplicatePolicy::Reject => RegisterOutcome::Rejected,
                    }
                }
            }
        };
        match &outcome {
            RegisterOutcome::Inserted => {
                info!(agent = name, "agent registered");
                let _ = self.events.send(RegistryEvent::AgentReady {
                    name: name.to_string(),
                    entity,
                });
            }
            RegisterOutcome::Displaced(old) => {
                info!(agent = name, displaced_conn = old.id(), "agent re-registered, displacing previous connection");
                let _ = self.events.send(RegistryEvent::AgentReady {
                    name: name.to_string(),
                    entity,
                });
            }
            RegisterOutcome::Rejected => {
                debug!(agent = name, "registration rejected, name in use");
            }
        }
        outcome
    }

    /// Remove `conn`'s entry, but only if it still owns it — a displaced
    /// connection closing late must not evict its successor.
    pub fn deregister(&self, conn: &Connection) -> bool {
        let Some(name) = conn.agent_name() else {
            return false;
        };
        let removed = self
            .agents
            .remove_if(&name, |_, held| held.id() == conn.id())
            .is_some();
        if removed {
            info!(agent = %name, "agent deregistered");
            let _ = self.events.send(RegistryEvent::AgentGone { name });
        }
        removed
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Connection>> {
        self.agents.get(name).map(|e| e.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Snapshot of every registered agent.
    pub fn list_active(&self) -> Vec<(String, Arc<Connection>)> {
        self.agents
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
