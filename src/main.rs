// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use relay_client::RelayClient;
use relay_daemon::{ProcessLauncher, RelayConfig, RelayServer};
use relay_proto::{AckPayload, ErrorPayload, Kind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The daemon logs at info by default; one-shot commands stay quiet
    // unless asked.
    let default_level = match &cli.command {
        Commands::Start { .. } => "info",
        _ => "warn",
    };
    init_logging(cli.verbose, default_level);

    match cli.command {
        Commands::Start { socket, foreground } => {
            let config = load_config(cli.config.as_deref(), socket)?;
            if foreground {
                run_daemon(config).await
            } else {
                detach(&cli.config, &config)
            }
        }
        Commands::Stop { socket } => {
            let config = load_config(cli.config.as_deref(), socket)?;
            stop_daemon(&config).await
        }
        Commands::Status { socket } => {
            let config = load_config(cli.config.as_deref(), socket)?;
            status(&config).await
        }
        Commands::Send {
            from,
            to,
            message,
            wait_ack,
            timeout_ms,
            socket,
        } => {
            let config = load_config(cli.config.as_deref(), socket)?;
            send_once(&config, from, to, message, wait_ack, timeout_ms).await
        }
        Commands::ShowConfig => {
            let config = load_config(cli.config.as_deref(), None)?;
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn load_config(
    explicit: Option<&std::path::Path>,
    socket_override: Option<PathBuf>,
) -> anyhow::Result<RelayConfig> {
    let mut config = relay_daemon::load(explicit)?;
    if let Some(path) = socket_override {
        config.socket.path = Some(path);
    }
    Ok(config)
}

// ── start ─────────────────────────────────────────────────────────────────────

async fn run_daemon(config: RelayConfig) -> anyhow::Result<()> {
    let launcher = Arc::new(ProcessLauncher::new(&config.spawn));
    let server = RelayServer::new(config, launcher);
    server.run().await.context("relay daemon failed")
}

/// Re-execute ourselves with --foreground, detached from this terminal.
fn detach(explicit_config: &Option<PathBuf>, config: &RelayConfig) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("resolving own executable")?;
    let socket = config.socket_path();

    let mut cmd = std::process::Command::new(exe);
    cmd.arg("start")
        .arg("--foreground")
        .arg("--socket")
        .arg(&socket)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(cfg) = explicit_config {
        cmd.arg("--config").arg(cfg);
    }
    let child = cmd.spawn().context("spawning daemon process")?;

    println!(
        "agent-relay started (pid {}) on {}",
        child.id(),
        socket.display()
    );
    Ok(())
}

// ── stop ──────────────────────────────────────────────────────────────────────

async fn stop_daemon(config: &RelayConfig) -> anyhow::Result<()> {
    let socket = config.socket_path();
    let pid_path = config.pid_path();

    let pid = match std::fs::read_to_string(&pid_path)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
    {
        Some(pid) => pid,
        None => {
            println!("agent-relay is not running");
            return Ok(());
        }
    };

    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        // The owner is already gone; clean up the leftovers ourselves.
        let _ = std::fs::remove_file(&pid_path);
        let _ = std::fs::remove_file(&socket);
        println!("agent-relay is not running (removed stale files)");
        return Ok(());
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if !pid_path.exists() && !socket.exists() {
            println!("agent-relay stopped");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("daemon (pid {pid}) did not stop within 2s");
}

// ── status ────────────────────────────────────────────────────────────────────

async fn status(config: &RelayConfig) -> anyhow::Result<()> {
    let socket = config.socket_path();
    let probe = tokio::time::timeout(
        Duration::from_secs(1),
        tokio::net::UnixStream::connect(&socket),
    )
    .await;
    match probe {
        Ok(Ok(_)) => println!("RUNNING ({})", socket.display()),
        _ => println!("STOPPED ({})", socket.display()),
    }
    Ok(())
}

// ── send ──────────────────────────────────────────────────────────────────────

async fn send_once(
    config: &RelayConfig,
    from: String,
    to: String,
    message: String,
    wait_ack: bool,
    timeout_ms: u64,
) -> anyhow::Result<()> {
    let socket = config.socket_path();
    let mut client = RelayClient::connect(&socket)
        .await
        .with_context(|| format!("connecting to {}", socket.display()))?;
    client
        .hello(&from)
        .await
        .context("relay handshake failed")?;

    if !wait_ack {
        let id = client.send_message(&to, &message).await?;
        println!("sent {id}");
        let _ = client.bye().await;
        return Ok(());
    }

    let correlation_id = relay_proto::envelope::next_id();
    client
        .send_blocking(&to, &message, &correlation_id, timeout_ms)
        .await?;

    // The daemon answers with exactly one of: forwarded ACK or timeout ERROR.
    let deadline = Duration::from_millis(timeout_ms + 1000);
    loop {
        let Some(env) = client.recv_timeout(deadline).await? else {
            anyhow::bail!("no reply from daemon within {}ms", timeout_ms + 1000);
        };
        match env.kind {
            Kind::Ack => {
                let ack: AckPayload = env.payload_as()?;
                if ack.correlation_id.as_deref() == Some(correlation_id.as_str()) {
                    match ack.response_data {
                        Some(data) => println!("acknowledged: {data}"),
                        None => println!("acknowledged"),
                    }
                    let _ = client.bye().await;
                    return Ok(());
                }
            }
            Kind::Error => {
                let p: ErrorPayload = env.payload_as()?;
                anyhow::bail!("{:?}: {}", p.code, p.message);
            }
            Kind::Nack => {
                let p: relay_proto::NackPayload = env.payload_as()?;
                anyhow::bail!("{:?}: {}", p.code, p.reason.unwrap_or_default());
            }
            _ => continue,
        }
    }
}

// ── Logging ───────────────────────────────────────────────────────────────────

fn init_logging(verbosity: u8, default_level: &str) {
    let level = match verbosity {
        0 => default_level,
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("AGENT_RELAY_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    let json = std::env::var("AGENT_RELAY_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if let Ok(path) = std::env::var("AGENT_RELAY_LOG_FILE") {
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            let writer = std::sync::Mutex::new(file);
            if json {
                let _ = tracing_subscriber::registry()
                    .with(fmt::layer().json().with_ansi(false).with_writer(writer))
                    .with(filter)
                    .try_init();
            } else {
                let _ = tracing_subscriber::registry()
                    .with(fmt::layer().with_ansi(false).with_writer(writer))
                    .with(filter)
                    .try_init();
            }
            return;
        }
    }

    if json {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(filter)
            .try_init();
    }
}
