// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Worker spawn brokering.
//!
//! Agents ask the daemon to start (SPAWN) and stop (RELEASE) worker agents.
//! The manager validates, delegates to an injected [`WorkerLauncher`],
//! records bookkeeping tying the worker to the requesting connection, and
//! answers with SPAWN_RESULT / RELEASE_RESULT. The spawned worker is expected
//! to connect back as an ordinary client; the manager does not wait for that
//! before replying. Retries and backoff are the launcher's business.
//!
//! When a connection that spawned workers disconnects, each of its workers
//! gets a best-effort release; failures are logged and go no further.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use relay_proto::{
    envelope::now_ms, Envelope, Kind, ReleasePayload, ReleaseResultPayload, SpawnPayload,
    SpawnResultPayload,
};

use crate::config::SpawnConfig;
use crate::connection::{ConnId, Connection};
use crate::registry::AgentRegistry;
use crate::router::Router;

/// Everything a launcher needs to start one worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub cli: String,
    pub task: String,
    pub cwd: Option<String>,
    pub team: Option<String>,
    pub model: Option<String>,
    /// Socket the worker must connect back to.
    pub socket_path: PathBuf,
    pub parent_name: String,
}

/// Outcome of a launch or stop attempt.
#[derive(Debug, Clone, Default)]
pub struct LaunchOutcome {
    pub success: bool,
    pub pid: Option<u32>,
    pub error: Option<String>,
}

impl LaunchOutcome {
    pub fn ok(pid: Option<u32>) -> Self {
        Self {
            success: true,
            pid,
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            pid: None,
            error: Some(error.into()),
        }
    }
}

/// Injected worker process launcher. Synchronous from the manager's
/// perspective: `launch` returns once the child has been started; the child
/// connects back on its own time.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Whether `cli` names a launchable worker kind.
    fn knows_cli(&self, cli: &str) -> bool;

    async fn launch(&self, spec: &LaunchSpec) -> LaunchOutcome;

    async fn stop(&self, name: &str) -> LaunchOutcome;
}

/// Bookkeeping for one live spawned worker.
#[derive(Debug, Clone)]
pub struct SpawnedAgent {
    pub parent_conn_id: ConnId,
    pub pid: Option<u32>,
    pub spawned_at_ms: i64,
    pub team: Option<String>,
    pub shadow_of: Option<String>,
}

pub struct SpawnManager {
    launcher: Arc<dyn WorkerLauncher>,
    registry: Arc<AgentRegistry>,
    router: Arc<Router>,
    spawned: Mutex<HashMap<String, SpawnedAgent>>,
    socket_path: PathBuf,
}

impl SpawnManager {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        registry: Arc<AgentRegistry>,
        router: Arc<Router>,
        socket_path: PathBuf,
    ) -> Self {
        Self {
            launcher,
            registry,
            router,
            spawned: Mutex::new(HashMap::new()),
            socket_path,
        }
    }

    /// Handle one SPAWN request end to end, replying SPAWN_RESULT on the
    /// requesting connection.
    pub async fn handle_spawn(self: Arc<Self>, conn: Arc<Connection>, env: Envelope) {
        let reply_to = env.id.clone();
        let payload: SpawnPayload = match env.payload_as() {
            Ok(p) => p,
            Err(e) => {
                self.reply_spawn(
                    &conn,
                    SpawnResultPayload {
                        reply_to,
                        success: false,
                        name: String::new(),
                        pid: None,
                        error: Some(format!("invalid SPAWN payload: {e}")),
                        policy_decision: Some("bad_request".into()),
                    },
                );
                return;
            }
        };

        if let Some(rejection) = self.validate(&payload) {
            self.reply_spawn(
                &conn,
                SpawnResultPayload {
                    reply_to,
                    success: false,
                    name: payload.name.clone(),
                    pid: None,
                    error: Some(rejection.reason),
                    policy_decision: Some(rejection.decision),
                },
            );
            return;
        }

        let parent_name = conn
            .agent_name()
            .or(payload.spawner_name.clone())
            .unwrap_or_default();
        let spec = LaunchSpec {
            name: payload.name.clone(),
            cli: payload.cli.clone(),
            task: payload.task.clone(),
            cwd: payload.cwd.clone(),
            team: payload.team.clone(),
            model: payload.model.clone(),
            socket_path: self.socket_path.clone(),
            parent_name,
        };

        let outcome = self.launcher.launch(&spec).await;
        if outcome.success {
            info!(name = %payload.name, cli = %payload.cli, pid = ?outcome.pid, "worker spawned");
            let mut spawned = self.spawned.lock().unwrap_or_else(|e| e.into_inner());
            spawned.insert(
                payload.name.clone(),
                SpawnedAgent {
                    parent_conn_id: conn.id(),
                    pid: outcome.pid,
                    spawned_at_ms: now_ms(),
                    team: payload.team.clone(),
                    shadow_of: payload.shadow_of.clone(),
                },
            );
        } else {
            warn!(name = %payload.name, error = ?outcome.error, "worker launch failed");
        }

        self.reply_spawn(
            &conn,
            SpawnResultPayload {
                reply_to,
                success: outcome.success,
                name: payload.name,
                pid: outcome.pid,
                error: outcome.error,
                policy_decision: outcome.success.then(|| "launched".to_string()),
            },
        );
    }

    /// Handle one RELEASE request, replying RELEASE_RESULT.
    pub async fn handle_release(self: Arc<Self>, conn: Arc<Connection>, env: Envelope) {
        let reply_to = env.id.clone();
        let payload: ReleasePayload = match env.payload_as() {
            Ok(p) => p,
            Err(e) => {
                self.reply_release(
                    &conn,
                    ReleaseResultPayload {
                        reply_to,
                        success: false,
                        name: String::new(),
                        error: Some(format!("invalid RELEASE payload: {e}")),
                    },
                );
                return;
            }
        };

        let known = {
            let spawned = self.spawned.lock().unwrap_or_else(|e| e.into_inner());
            spawned.contains_key(&payload.name)
        };
        if !known {
            self.reply_release(
                &conn,
                ReleaseResultPayload {
                    reply_to,
                    success: false,
                    name: payload.name,
                    error: Some("not a spawned worker".into()),
                },
            );
            return;
        }

        let outcome = self.release(&payload.name).await;
        self.reply_release(
            &conn,
            ReleaseResultPayload {
                reply_to,
                success: outcome.success,
                name: payload.name,
                error: outcome.error,
            },
        );
    }

    /// Stop a worker and drop its bookkeeping and derived shadow bindings.
    async fn release(&self, name: &str) -> LaunchOutcome {
        let outcome = self.launcher.stop(name).await;
        if outcome.success {
            info!(name, "worker released");
            {
                let mut spawned = self.spawned.lock().unwrap_or_else(|e| e.into_inner());
                spawned.remove(name);
            }
            self.router.purge_shadows_of(name);
            if let Some(conn) = self.registry.lookup(name) {
                self.router.purge(&conn);
            }
        }
        outcome
    }

    /// Best-effort release of every worker the disconnected parent spawned.
    pub async fn on_parent_disconnect(self: Arc<Self>, conn_id: ConnId) {
        let owned: Vec<String> = {
            let spawned = self.spawned.lock().unwrap_or_else(|e| e.into_inner());
            spawned
                .iter()
                .filter(|(_, a)| a.parent_conn_id == conn_id)
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in owned {
            debug!(name = %name, parent = conn_id, "releasing worker of disconnected parent");
            let outcome = self.release(&name).await;
            if !outcome.success {
                warn!(name = %name, error = ?outcome.error, "best-effort release failed");
                // Keep no entry for a worker we cannot stop; the parent is
                // gone and nobody is left to retry.
                let mut spawned = self.spawned.lock().unwrap_or_else(|e| e.into_inner());
                spawned.remove(&name);
            }
        }
    }

    pub fn spawned_len(&self) -> usize {
        self.spawned.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn spawned_entry(&self, name: &str) -> Option<SpawnedAgent> {
        self.spawned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn validate(&self, payload: &SpawnPayload) -> Option<Rejection> {
        if payload.name.trim().is_empty() {
            return Some(Rejection::new("bad_request", "worker name must be non-empty"));
        }
        if !self.launcher.knows_cli(&payload.cli) {
            return Some(Rejection::new(
                "unknown_cli",
                format!("unrecognized cli {:?}", payload.cli),
            ));
        }
        if self.registry.contains(&payload.name) {
            return Some(Rejection::new(
                "name_in_use",
                format!("an agent named {:?} is already connected", payload.name),
            ));
        }
        if let Some(primary) = &payload.shadow_of {
            if !self.registry.contains(primary) {
                return Some(Rejection::new(
                    "primary_missing",
                    format!("shadow primary {primary:?} is not connected"),
                ));
            }
        }
        None
    }

    fn reply_spawn(&self, conn: &Arc<Connection>, payload: SpawnResultPayload) {
        match Envelope::with_payload(Kind::SpawnResult, &payload) {
            Ok(mut reply) => {
                reply.to = conn.agent_name();
                conn.send_control(reply);
            }
            Err(e) => warn!(error = %e, "failed to encode SPAWN_RESULT"),
        }
    }

    fn reply_release(&self, conn: &Arc<Connection>, payload: ReleaseResultPayload) {
        match Envelope::with_payload(Kind::ReleaseResult, &payload) {
            Ok(mut reply) => {
                reply.to = conn.agent_name();
                conn.send_control(reply);
            }
            Err(e) => warn!(error = %e, "failed to encode RELEASE_RESULT"),
        }
    }
}

struct Rejection {
    decision: String,
    reason: String,
}

impl Rejection {
    fn new(decision: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            decision: decision.into(),
            reason: reason.into(),
        }
    }
}

// ── Process launcher ──────────────────────────────────────────────────────────

/// Production launcher: starts workers from per-cli argv templates declared
/// in config. Placeholders `{name}`, `{task}`, `{socket}`, `{parent}`,
/// `{model}` and `{cwd}` are substituted in every argv element.
pub struct ProcessLauncher {
    commands: HashMap<String, Vec<String>>,
    stop_grace: Duration,
    children: tokio::sync::Mutex<HashMap<String, tokio::process::Child>>,
}

impl ProcessLauncher {
    pub fn new(cfg: &SpawnConfig) -> Self {
        Self {
            commands: cfg.commands.clone(),
            stop_grace: Duration::from_millis(cfg.stop_grace_ms),
            children: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn render(template: &[String], spec: &LaunchSpec) -> Vec<String> {
        template
            .iter()
            .map(|arg| {
                arg.replace("{name}", &spec.name)
                    .replace("{task}", &spec.task)
                    .replace("{socket}", &spec.socket_path.to_string_lossy())
                    .replace("{parent}", &spec.parent_name)
                    .replace("{model}", spec.model.as_deref().unwrap_or(""))
                    .replace("{cwd}", spec.cwd.as_deref().unwrap_or(""))
            })
            .collect()
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    fn knows_cli(&self, cli: &str) -> bool {
        self.commands.contains_key(cli)
    }

    async fn launch(&self, spec: &LaunchSpec) -> LaunchOutcome {
        let Some(template) = self.commands.get(&spec.cli) else {
            return LaunchOutcome::err(format!("unrecognized cli {:?}", spec.cli));
        };
        let argv = Self::render(template, spec);
        if argv.is_empty() {
            return LaunchOutcome::err(format!("empty command template for {:?}", spec.cli));
        }

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env("AGENT_RELAY_SOCKET", &spec.socket_path)
            .env("AGENT_RELAY_PARENT", &spec.parent_name)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id();
                self.children
                    .lock()
                    .await
                    .insert(spec.name.clone(), child);
                LaunchOutcome::ok(pid)
            }
            Err(e) => LaunchOutcome::err(format!("spawn {:?}: {e}", argv[0])),
        }
    }

    async fn stop(&self, name: &str) -> LaunchOutcome {
        let child = self.children.lock().await.remove(name);
        let Some(mut child) = child else {
            return LaunchOutcome::err("no such worker process");
        };
        // SIGTERM first; escalate to SIGKILL after the grace period.
        if let Err(e) = child.start_kill() {
            return LaunchOutcome::err(format!("stop: {e}"));
        }
        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(_status)) => LaunchOutcome::ok(None),
            Ok(Err(e)) => LaunchOutcome::err(format!("wait: {e}")),
            Err(_) => match child.kill().await {
                Ok(()) => LaunchOutcome::ok(None),
                Err(e) => LaunchOutcome::err(format!("kill: {e}")),
            },
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DuplicatePolicy;
    use crate::connection::{AgentInfo, ConnPeer, ConnState, ConnTuning, WriteCmd};
    use relay_proto::{HelloPayload, ShadowBindPayload};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Launcher double that records calls and always succeeds.
    struct MockLauncher {
        launches: AtomicUsize,
        stops: AtomicUsize,
        fail_launch: bool,
    }

    impl MockLauncher {
        fn new() -> Self {
            Self {
                launches: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                fail_launch: false,
            }
        }
    }

    #[async_trait]
    impl WorkerLauncher for MockLauncher {
        fn knows_cli(&self, cli: &str) -> bool {
            cli == "claude"
        }

        async fn launch(&self, _spec: &LaunchSpec) -> LaunchOutcome {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail_launch {
                LaunchOutcome::err("boom")
            } else {
                LaunchOutcome::ok(Some(4242))
            }
        }

        async fn stop(&self, _name: &str) -> LaunchOutcome {
            self.stops.fetch_add(1, Ordering::SeqCst);
            LaunchOutcome::ok(None)
        }
    }

    struct Fixture {
        registry: Arc<AgentRegistry>,
        router: Arc<Router>,
        launcher: Arc<MockLauncher>,
        manager: Arc<SpawnManager>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_launcher(MockLauncher::new())
        }

        fn with_launcher(launcher: MockLauncher) -> Self {
            let registry = Arc::new(AgentRegistry::new(DuplicatePolicy::Displace));
            let router = Arc::new(Router::new(registry.clone()));
            let launcher = Arc::new(launcher);
            let manager = Arc::new(SpawnManager::new(
                launcher.clone(),
                registry.clone(),
                router.clone(),
                PathBuf::from("/tmp/relay.sock"),
            ));
            Self {
                registry,
                router,
                launcher,
                manager,
            }
        }

        fn agent(
            &self,
            id: u64,
            name: &str,
        ) -> (Arc<Connection>, mpsc::UnboundedReceiver<WriteCmd>) {
            let (conn, rx) = Connection::new(
                id,
                ConnTuning::default(),
                ConnPeer::Internal,
                CancellationToken::new(),
            );
            conn.set_agent(AgentInfo::from(HelloPayload {
                agent: name.to_string(),
                ..Default::default()
            }));
            conn.set_state(ConnState::Active);
            self.registry.register(name, conn.clone());
            (conn, rx)
        }
    }

    fn spawn_env(name: &str) -> Envelope {
        Envelope::with_payload(
            Kind::Spawn,
            &SpawnPayload {
                name: name.into(),
                cli: "claude".into(),
                task: "do the thing".into(),
                cwd: None,
                team: None,
                spawner_name: None,
                model: None,
                shadow_of: None,
                shadow_speak_on: vec![],
            },
        )
        .unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WriteCmd>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            out.push(match cmd {
                WriteCmd::Frame(env) | WriteCmd::Control(env) => env,
            });
        }
        out
    }

    #[tokio::test]
    async fn spawn_success_records_and_replies() {
        let fx = Fixture::new();
        let (lead, mut rx) = fx.agent(1, "Lead");

        let env = spawn_env("Reviewer");
        let env_id = env.id.clone();
        fx.manager.clone().handle_spawn(lead, env).await;

        let got = drain(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].kind, Kind::SpawnResult);
        let p: SpawnResultPayload = got[0].payload_as().unwrap();
        assert!(p.success);
        assert_eq!(p.reply_to, env_id);
        assert_eq!(p.pid, Some(4242));
        assert_eq!(fx.manager.spawned_len(), 1);
        assert_eq!(fx.launcher.launches.load(Ordering::SeqCst), 1);
        assert_eq!(
            fx.manager.spawned_entry("Reviewer").unwrap().parent_conn_id,
            1
        );
    }

    #[tokio::test]
    async fn spawn_rejects_live_name() {
        let fx = Fixture::new();
        let (lead, mut rx) = fx.agent(1, "Lead");
        let _worker = fx.agent(2, "Reviewer");

        fx.manager
            .clone()
            .handle_spawn(lead, spawn_env("Reviewer"))
            .await;

        let got = drain(&mut rx);
        let p: SpawnResultPayload = got[0].payload_as().unwrap();
        assert!(!p.success);
        assert_eq!(p.policy_decision.as_deref(), Some("name_in_use"));
        assert_eq!(fx.launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn spawn_rejects_unknown_cli() {
        let fx = Fixture::new();
        let (lead, mut rx) = fx.agent(1, "Lead");

        let mut env = spawn_env("Reviewer");
        env.payload["cli"] = serde_json::json!("weird");
        fx.manager.clone().handle_spawn(lead, env).await;

        let p: SpawnResultPayload = drain(&mut rx)[0].payload_as().unwrap();
        assert!(!p.success);
        assert_eq!(p.policy_decision.as_deref(), Some("unknown_cli"));
    }

    #[tokio::test]
    async fn spawn_shadow_requires_live_primary() {
        let fx = Fixture::new();
        let (lead, mut rx) = fx.agent(1, "Lead");

        let mut env = spawn_env("Shade");
        env.payload["shadow_of"] = serde_json::json!("Nobody");
        fx.manager.clone().handle_spawn(lead, env).await;

        let p: SpawnResultPayload = drain(&mut rx)[0].payload_as().unwrap();
        assert!(!p.success);
        assert_eq!(p.policy_decision.as_deref(), Some("primary_missing"));
    }

    #[tokio::test]
    async fn launcher_failure_reported_in_result_only() {
        let fx = Fixture::with_launcher(MockLauncher {
            launches: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_launch: true,
        });
        let (lead, mut rx) = fx.agent(1, "Lead");

        fx.manager
            .clone()
            .handle_spawn(lead, spawn_env("Reviewer"))
            .await;

        let got = drain(&mut rx);
        assert_eq!(got.len(), 1, "only the SPAWN_RESULT, no ERROR frames");
        let p: SpawnResultPayload = got[0].payload_as().unwrap();
        assert!(!p.success);
        assert_eq!(p.error.as_deref(), Some("boom"));
        assert_eq!(fx.manager.spawned_len(), 0);
    }

    #[tokio::test]
    async fn release_removes_entry_and_shadow_bindings() {
        let fx = Fixture::new();
        let (lead, mut lead_rx) = fx.agent(1, "Lead");

        fx.manager
            .clone()
            .handle_spawn(lead.clone(), spawn_env("Reviewer"))
            .await;
        drain(&mut lead_rx);

        // The worker connected back and bound itself as a shadow of Lead.
        let (reviewer, _reviewer_rx) = fx.agent(2, "Reviewer");
        fx.router.shadow_bind(
            &reviewer,
            ShadowBindPayload {
                primary: "Lead".into(),
                triggers: vec![],
                receive_incoming: true,
                receive_outgoing: true,
            },
        );

        let release = Envelope::with_payload(
            Kind::Release,
            &ReleasePayload {
                name: "Reviewer".into(),
            },
        )
        .unwrap();
        fx.manager.clone().handle_release(lead, release).await;

        let got = drain(&mut lead_rx);
        assert_eq!(got.len(), 1);
        let p: ReleaseResultPayload = got[0].payload_as().unwrap();
        assert!(p.success);
        assert_eq!(fx.manager.spawned_len(), 0);
        assert_eq!(fx.launcher.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_unknown_worker_fails_softly() {
        let fx = Fixture::new();
        let (lead, mut rx) = fx.agent(1, "Lead");

        let release = Envelope::with_payload(
            Kind::Release,
            &ReleasePayload {
                name: "Nobody".into(),
            },
        )
        .unwrap();
        fx.manager.clone().handle_release(lead, release).await;

        let p: ReleaseResultPayload = drain(&mut rx)[0].payload_as().unwrap();
        assert!(!p.success);
        assert_eq!(fx.launcher.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn parent_disconnect_releases_workers() {
        let fx = Fixture::new();
        let (lead, mut rx) = fx.agent(1, "Lead");

        fx.manager
            .clone()
            .handle_spawn(lead.clone(), spawn_env("W1"))
            .await;
        fx.manager
            .clone()
            .handle_spawn(lead.clone(), spawn_env("W2"))
            .await;
        drain(&mut rx);
        assert_eq!(fx.manager.spawned_len(), 2);

        fx.manager.clone().on_parent_disconnect(1).await;
        assert_eq!(fx.manager.spawned_len(), 0);
        assert_eq!(fx.launcher.stops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn template_rendering() {
        let spec = LaunchSpec {
            name: "W".into(),
            cli: "claude".into(),
            task: "fix it".into(),
            cwd: None,
            team: None,
            model: Some("opus".into()),
            socket_path: PathBuf::from("/tmp/r.sock"),
            parent_name: "Lead".into(),
        };
        let argv = ProcessLauncher::render(
            &[
                "wrapper".into(),
                "--name={name}".into(),
                "--task={task}".into(),
                "--socket={socket}".into(),
                "--model={model}".into(),
            ],
            &spec,
        );
        assert_eq!(argv[1], "--name=W");
        assert_eq!(argv[2], "--task=fix it");
        assert_eq!(argv[3], "--socket=/tmp/r.sock");
        assert_eq!(argv[4], "--model=opus");
    }
}
