//! Worker binary: run one dispatched request and exit with its status.

use std::os::fd::{FromRawFd, OwnedFd};

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use qrexec_worker::dispatch::{self, Request, RequestKind, ServiceStdio};

#[derive(Parser)]
#[command(name = "qrexec-worker", version, about = "Bridge a data vchan to a local command")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Spawn `user:command` and bridge its stdio to the remote peer.
    Exec {
        /// Peer domain.
        #[arg(long)]
        domain: u32,
        /// Peer port.
        #[arg(long)]
        port: u32,
        /// Command line of the form `user:command`.
        #[arg(long)]
        cmd: String,
    },
    /// Spawn `user:command` detached and report synthetic success.
    JustExec {
        /// Peer domain.
        #[arg(long)]
        domain: u32,
        /// Peer port.
        #[arg(long)]
        port: u32,
        /// Command line of the form `user:command`.
        #[arg(long)]
        cmd: String,
    },
    /// Bridge this process's stdio to a connecting peer; no spawn.
    Service {
        /// Peer domain.
        #[arg(long)]
        domain: u32,
        /// Peer port.
        #[arg(long)]
        port: u32,
        /// vchan ring size in bytes (power of two; 0 selects 64 KiB).
        #[arg(long, default_value_t = 0)]
        buffer_size: usize,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        CliCommand::Exec { domain, port, cmd } => dispatch::run_worker(
            &Request {
                kind: RequestKind::ExecCmdline,
                domain,
                port,
                cmdline: Some(nul_terminated(cmd)),
                buffer_size: 0,
            },
            None,
        ),
        CliCommand::JustExec { domain, port, cmd } => dispatch::run_worker(
            &Request {
                kind: RequestKind::JustExec,
                domain,
                port,
                cmdline: Some(nul_terminated(cmd)),
                buffer_size: 0,
            },
            None,
        ),
        CliCommand::Service {
            domain,
            port,
            buffer_size,
        } => {
            // The session writes remote data to our stdout and reads local
            // input from our stdin; both are inherited and survive the
            // session's half-close rules. Fd 2 stays ours: the tracing
            // subscriber writes diagnostics there, so it is not bridged.
            let stdio = ServiceStdio {
                stdin: unsafe { OwnedFd::from_raw_fd(1) },
                stdout: unsafe { OwnedFd::from_raw_fd(0) },
                stderr: None,
            };
            dispatch::handle_data_client(domain, port, stdio, buffer_size)
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %e, "session failed");
            std::process::exit(1);
        }
    }
}

fn nul_terminated(cmd: String) -> Vec<u8> {
    let mut bytes = cmd.into_bytes();
    bytes.push(0);
    bytes
}
