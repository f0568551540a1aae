//! Request dispatch: validate, open the vchan in the right role, and run
//! the per-kind session.
//!
//! Three request kinds exist. `ExecCmdline` spawns a command and bridges
//! its stdio; `JustExec` spawns detached and reports synthetic success;
//! `ServiceConnect` bridges caller-supplied descriptors with no spawn and
//! the outbound tag reversed. The two child-owning kinds are forked off
//! the caller into a dedicated worker process.

use std::io;
use std::os::fd::OwnedFd;

use nix::unistd::{fork, ForkResult, Pid};
use qrexec_protocol::{MsgType, MAX_QREXEC_CMD_LEN};
use tracing::{error, info, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::handshake::handshake;
use crate::mux;
use crate::session::Session;
use crate::signals;
use crate::spawn;
use crate::vchan::{StreamVchan, Vchan};

/// The three request kinds consumed from the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Detached spawn, synthetic success reply.
    JustExec,
    /// Spawn plus full I/O bridge.
    ExecCmdline,
    /// I/O bridge over caller-provided descriptors.
    ServiceConnect,
}

impl RequestKind {
    /// Map a control-channel message type to a request kind.
    pub fn from_msg_type(ty: MsgType) -> Option<Self> {
        match ty {
            MsgType::JustExec => Some(Self::JustExec),
            MsgType::ExecCmdline => Some(Self::ExecCmdline),
            MsgType::ServiceConnect => Some(Self::ServiceConnect),
            _ => None,
        }
    }
}

/// One dispatched request.
#[derive(Debug)]
pub struct Request {
    /// What to do.
    pub kind: RequestKind,
    /// Peer domain to connect to (or serve).
    pub domain: u32,
    /// Peer port.
    pub port: u32,
    /// NUL-terminated `user:command` bytes; absent for service connect.
    pub cmdline: Option<Vec<u8>>,
    /// Requested vchan ring size; 0 selects the default.
    pub buffer_size: usize,
}

/// Caller-supplied descriptors for a service-connect session.
pub struct ServiceStdio {
    /// Where remote data is written.
    pub stdin: OwnedFd,
    /// Where local data is read from.
    pub stdout: OwnedFd,
    /// Optional error stream.
    pub stderr: Option<OwnedFd>,
}

/// Run one request to completion in the calling process and return the
/// exit status to report: the local child's (exec), 0 (just-exec), or the
/// remote's (service connect).
pub fn run_worker(req: &Request, stdio: Option<ServiceStdio>) -> Result<i32> {
    match req.kind {
        RequestKind::ServiceConnect => {
            if req.cmdline.is_some() {
                return Err(Error::BadCommand(
                    "unexpected command line for service connect".into(),
                ));
            }
            let Some(stdio) = stdio else {
                return Err(Error::BadCommand(
                    "service connect without descriptors".into(),
                ));
            };
            let mut vchan =
                StreamVchan::server(req.domain, req.port, req.buffer_size, req.buffer_size)?;
            vchan.wait()?;
            run_service_session(&mut vchan, stdio)
        }
        RequestKind::JustExec => {
            let cmd = prepare_cmdline(req.cmdline.as_deref())?;
            let mut vchan = StreamVchan::client(req.domain, req.port)?;
            run_just_exec_session(&mut vchan, &cmd)
        }
        RequestKind::ExecCmdline => {
            let cmd = prepare_cmdline(req.cmdline.as_deref())?;
            let mut vchan = StreamVchan::client(req.domain, req.port)?;
            run_exec_session(&mut vchan, &cmd)
        }
    }
}

/// Fork a dedicated worker for a child-owning request and return its pid.
/// The worker process exits with the session's status.
pub fn handle_new_process(req: Request) -> Result<Pid> {
    assert!(
        req.kind != RequestKind::ServiceConnect,
        "service connect runs in-process"
    );
    let fork_res = unsafe { fork() }.map_err(|e| Error::Sys {
        op: "fork",
        source: io::Error::from_raw_os_error(e as i32),
    })?;
    match fork_res {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let code = match run_worker(&req, None) {
                Ok(code) => code,
                Err(e) => {
                    error!(error = %e, "session failed");
                    1
                }
            };
            std::process::exit(code);
        }
    }
}

/// Run a service-connect session in the calling process and return the
/// remote exit status.
pub fn handle_data_client(
    domain: u32,
    port: u32,
    stdio: ServiceStdio,
    buffer_size: usize,
) -> Result<i32> {
    let req = Request {
        kind: RequestKind::ServiceConnect,
        domain,
        port,
        cmdline: None,
        buffer_size,
    };
    run_worker(&req, Some(stdio))
}

/// Handshake, spawn, and bridge. A spawn failure degrades to a session
/// with no local child that ends once the remote side finishes.
pub fn run_exec_session<V: Vchan>(vchan: &mut V, cmdline: &[u8]) -> Result<i32> {
    let version = handshake(vchan)?;
    let pipes = signals::install()?;
    signals::prepare_child_env();

    let mut session = match spawn::spawn_command(cmdline) {
        Ok(child) => Session::with_child(
            version,
            child.pid,
            child.stdin,
            child.stdout,
            Some(child.stderr),
        ),
        Err(e) => {
            error!(error = %e, "failed to spawn process");
            Session::new(version)
        }
    };
    let code = mux::run(vchan, &mut session, &pipes)?;
    info!(code, "session finished");
    Ok(code)
}

/// Handshake, detached spawn, synthetic exit-code frame. The reply carries
/// 0 on success and -1 when the command line is malformed or the spawn
/// fails; the worker itself reports success either way.
pub fn run_just_exec_session<V: Vchan>(vchan: &mut V, cmdline: &[u8]) -> Result<i32> {
    handshake(vchan)?;
    signals::prepare_child_env();

    let code = match spawn::just_exec(cmdline) {
        Ok(_) => 0,
        Err(e) => {
            warn!(error = %e, "just-exec failed");
            -1
        }
    };
    codec::send_exit_code(vchan, code)?;
    Ok(0)
}

/// Handshake and bridge caller descriptors; no spawn, outbound tag
/// reversed. Returns the remote exit status.
pub fn run_service_session<V: Vchan>(vchan: &mut V, stdio: ServiceStdio) -> Result<i32> {
    let version = handshake(vchan)?;
    let pipes = signals::install()?;
    signals::prepare_child_env();

    let mut session = Session::service(version, stdio.stdin, stdio.stdout, stdio.stderr);
    let code = mux::run(vchan, &mut session, &pipes)?;
    info!(code, "service session finished");
    Ok(code)
}

/// Validate a dispatched command line and take an owned copy with the
/// trailing byte forced to NUL; the caller's buffer is never touched.
/// Returns the command bytes up to the first NUL.
fn prepare_cmdline(cmdline: Option<&[u8]>) -> Result<Vec<u8>> {
    let Some(cmdline) = cmdline else {
        return Err(Error::BadCommand("missing command line".into()));
    };
    if cmdline.is_empty() {
        return Err(Error::BadCommand("empty command line".into()));
    }
    if cmdline.len() > MAX_QREXEC_CMD_LEN {
        return Err(Error::BadCommand(format!(
            "command line too long: length {}",
            cmdline.len()
        )));
    }
    let mut owned = cmdline.to_vec();
    *owned.last_mut().expect("checked non-empty") = 0;
    let nul = owned.iter().position(|&b| b == 0).expect("forced above");
    owned.truncate(nul);
    Ok(owned)
}
