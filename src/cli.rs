// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

/// Local coordination fabric for AI-agent CLI processes.
///
/// The daemon owns a Unix-domain socket; agent clients hold long-lived
/// framed connections to it and exchange direct, channel, broadcast and
/// pub/sub messages. See `agent-relay start --help` to run one.
#[derive(Parser, Debug)]
#[command(name = "agent-relay", version, about)]
pub struct Cli {
    /// Path to the relay config file (YAML). Merged over the default layers.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the relay daemon.
    ///
    /// Without --foreground the daemon re-executes itself detached and the
    /// command returns once the child is running.
    Start {
        /// Socket path (overrides config and AGENT_RELAY_SOCKET).
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Run in the foreground instead of detaching.
        #[arg(long)]
        foreground: bool,
    },

    /// Stop a running daemon.
    ///
    /// Signals the PID-file owner and waits up to 2 s for the socket and
    /// PID file to disappear.
    Stop {
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Report whether a daemon is listening on the socket.
    Status {
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// One-shot test client: register, deliver one message, disconnect.
    Send {
        /// Agent name to register as.
        #[arg(long)]
        from: String,
        /// Recipient agent name, `#channel`, or `*` for broadcast.
        #[arg(long)]
        to: String,
        /// Message body.
        #[arg(long)]
        message: String,
        /// Block until the recipient acknowledges (or the daemon times out).
        #[arg(long)]
        wait_ack: bool,
        /// Blocking-send timeout in milliseconds.
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        #[arg(long)]
        socket: Option<PathBuf>,
    },

    /// Print the merged configuration and exit.
    ShowConfig,
}
