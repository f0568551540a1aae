//! The bidirectional I/O multiplexer: one poll loop per session.
//!
//! The loop watches the vchan descriptor, the child's stdout/stderr, the
//! stdin descriptor when a write is pending, and the two signal pipes.
//! It copies vchan frames toward the child's stdin and child output toward
//! the vchan, applies the stdio collapse when the child asks for it, and
//! keeps going until the local child and the remote peer are both done.
//! Teardown restores blocking mode, applies the half-close rules, and sends
//! the exit-code frame — at most once, and as the final outbound frame.

use std::os::fd::{FromRawFd, OwnedFd};

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use qrexec_protocol::MsgHeader;
use tracing::{debug, error, info, warn};

use crate::codec::{self, ForwardOutcome, RemoteEvent};
use crate::error::Result;
use crate::session::{CollapseState, Session, StdioFd};
use crate::signals::{self, SignalPipes};
use crate::vchan::Vchan;

/// Bounded wait so signal races and liveness checks still run when both
/// peers go quiet.
const WAIT_TIMEOUT_MS: libc::c_int = 10_000;

enum LoopEnd {
    /// Normal termination; teardown decides the status.
    Finished,
    /// Remote exited and there is no local child; return its code as-is.
    RemoteOnly(i32),
}

/// Run the session to completion and return the exit status to report:
/// the local child's, or the remote's when no child exists.
pub fn run<V: Vchan>(
    vchan: &mut V,
    session: &mut Session,
    signals: &SignalPipes,
) -> Result<i32> {
    setup(session)?;
    match run_loop(vchan, session, signals) {
        Ok(LoopEnd::RemoteOnly(code)) => Ok(code),
        Ok(LoopEnd::Finished) => Ok(teardown(vchan, session, true)),
        Err(e) => {
            // Transport is gone: close everything, send nothing.
            teardown(vchan, session, false);
            Err(e)
        }
    }
}

/// Mark the stdio descriptors non-blocking. When stdin and stdout are the
/// same underlying descriptor (a single bidirectional socket), duplicate
/// it so the two directions can be closed independently.
fn setup(session: &mut Session) -> Result<()> {
    let same = match (&session.stdin, &session.stdout) {
        (Some(si), Some(so)) => si.raw() == so.raw(),
        _ => false,
    };
    if same {
        let stdin = session.stdin.as_ref().expect("checked above");
        let dup = unsafe { libc::fcntl(stdin.raw(), libc::F_DUPFD_CLOEXEC, 3) };
        if dup < 0 {
            // Out of descriptors this early is not survivable.
            error!("fcntl(F_DUPFD_CLOEXEC) failed duplicating shared stdio");
            std::process::abort();
        }
        let kind = stdin.kind();
        let inherited = stdin.inherited();
        let old = session.stdout.take().expect("checked above");
        // The old slot shares the raw descriptor with stdin; releasing it
        // without closing keeps stdin intact.
        let _ = old.into_raw();
        session.stdout = Some(StdioFd::from_parts(
            unsafe { OwnedFd::from_raw_fd(dup) },
            kind,
            inherited,
        ));
    }
    for slot in [&session.stdin, &session.stdout, &session.stderr]
        .into_iter()
        .flatten()
    {
        slot.set_nonblocking()?;
    }
    Ok(())
}

fn run_loop<V: Vchan>(
    vchan: &mut V,
    session: &mut Session,
    signals: &SignalPipes,
) -> Result<LoopEnd> {
    let mut child_exited = false;

    loop {
        if child_exited {
            reap(session);
            child_exited = false;
        }

        let local_done = session.child.is_none() || session.local_status.is_some();
        let remote_done = session.child.is_some() || session.remote_status.is_some();
        if local_done
            && remote_done
            && session.stdin.is_none()
            && session.stdout.is_none()
            && session.stderr.is_none()
        {
            return Ok(LoopEnd::Finished);
        }
        // A disconnected vchan with nothing left buffered means no further
        // work is possible.
        if vchan.data_ready() == 0 && !vchan.is_open() && session.stdin_buf.is_empty() {
            debug!("vchan disconnected, ending session");
            return Ok(LoopEnd::Finished);
        }

        if session.collapse == CollapseState::Pending {
            apply_collapse(session);
        }

        let vchan_fd = vchan.poll_fd();
        let space_for_output = vchan.buffer_space() > MsgHeader::SIZE;
        let stdout_fd = match &session.stdout {
            Some(slot) if space_for_output => slot.raw(),
            _ => -1,
        };
        let stderr_fd = match &session.stderr {
            Some(slot) if space_for_output => slot.raw(),
            _ => -1,
        };
        let stdin_fd = match &session.stdin {
            Some(slot) if !session.stdin_buf.is_empty() => slot.raw(),
            _ => -1,
        };

        let mut poll_fds = [
            libc::pollfd {
                fd: vchan_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: signals.child_exited_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: signals.collapse_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: stdout_fd,
                events: if stdout_fd >= 0 { libc::POLLIN } else { 0 },
                revents: 0,
            },
            libc::pollfd {
                fd: stderr_fd,
                events: if stderr_fd >= 0 { libc::POLLIN } else { 0 },
                revents: 0,
            },
            libc::pollfd {
                fd: stdin_fd,
                events: if stdin_fd >= 0 { libc::POLLOUT } else { 0 },
                revents: 0,
            },
        ];

        // Pure poll when vchan data is already buffered and no stdin write
        // is pending; bounded wait otherwise.
        let timeout = if vchan.data_ready() > 0 && session.stdin_buf.is_empty() {
            0
        } else {
            WAIT_TIMEOUT_MS
        };

        let rc = unsafe { libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as _, timeout) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            warn!(error = %err, "poll failed, ending session");
            return Ok(LoopEnd::Finished);
        }

        const READABLE: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
        let vchan_ready = poll_fds[0].revents & READABLE != 0;
        let stdout_ready = stdout_fd >= 0 && poll_fds[3].revents & READABLE != 0;
        let stderr_ready = stderr_fd >= 0 && poll_fds[4].revents & READABLE != 0;

        if poll_fds[1].revents & READABLE != 0 && signals::drain(signals.child_exited_fd()) {
            child_exited = true;
        }
        if poll_fds[2].revents & READABLE != 0
            && signals::drain(signals.collapse_fd())
            && session.collapse == CollapseState::Idle
        {
            session.collapse = CollapseState::Pending;
        }

        if vchan_ready {
            vchan.wait()?;
        }
        // The decoder checks readiness itself; calling it every round also
        // flushes the pending stdin queue once the descriptor drains.
        match codec::handle_remote_data(vchan, session)? {
            RemoteEvent::None => {}
            RemoteEvent::Eof => session.close_stdin(),
            RemoteEvent::Exited(code) => {
                // The remote accepts no more output.
                session.close_stdout();
                session.close_stderr();
                if session.child.is_none() {
                    return Ok(LoopEnd::RemoteOnly(code));
                }
            }
        }

        if stdout_ready {
            if let Some(slot) = &session.stdout {
                let collapsed = session.collapse == CollapseState::Applied;
                let outcome = codec::handle_input(
                    vchan,
                    slot.raw(),
                    session.stdout_msg_type,
                    session.version,
                    collapsed,
                )?;
                if outcome == ForwardOutcome::Eof {
                    session.close_stdout();
                }
            }
        }
        if stderr_ready {
            if let Some(slot) = &session.stderr {
                let collapsed = session.collapse == CollapseState::Applied;
                let outcome = codec::handle_input(
                    vchan,
                    slot.raw(),
                    qrexec_protocol::MsgType::DataStderr,
                    session.version,
                    collapsed,
                )?;
                if outcome == ForwardOutcome::Eof {
                    session.close_stderr();
                }
            }
        }
    }
}

/// Non-blocking reap after SIGCHLD. A signal death maps to `128 + signo`;
/// reaping also closes the child's stdin since nothing will read it.
fn reap(session: &mut Session) {
    let Some(pid) = session.child else {
        return;
    };
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => {
            info!(pid = pid.as_raw(), code, "child exited");
            session.local_status = Some(code);
            session.close_stdin();
        }
        Ok(WaitStatus::Signaled(_, sig, _)) => {
            info!(pid = pid.as_raw(), signal = ?sig, "child killed by signal");
            session.local_status = Some(128 + sig as i32);
            session.close_stdin();
        }
        Ok(_) => {}
        Err(e) => debug!(pid = pid.as_raw(), error = %e, "waitpid failed"),
    }
}

/// Redirect stdout onto stdin's descriptor so the child sees one
/// bidirectional socket. Descriptor duplication failing here means the
/// process table is in a state not worth recovering from.
fn apply_collapse(session: &mut Session) {
    let Some(stdin) = &session.stdin else {
        warn!("stdio collapse requested with stdin already closed");
        session.collapse = CollapseState::Applied;
        return;
    };
    let stdin_raw = stdin.raw();
    let kind = stdin.kind();
    let inherited = stdin.inherited();

    match &mut session.stdout {
        Some(stdout) => {
            loop {
                let rc = unsafe { libc::dup3(stdin_raw, stdout.raw(), libc::O_CLOEXEC) };
                if rc >= 0 {
                    break;
                }
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) | Some(libc::EBUSY) => continue,
                    _ => {
                        error!(error = %err, "dup3 failed during stdio collapse");
                        std::process::abort();
                    }
                }
            }
            stdout.kind = kind;
            stdout.inherited = inherited;
        }
        None => {
            let dup = unsafe { libc::fcntl(stdin_raw, libc::F_DUPFD_CLOEXEC, 3) };
            if dup < 3 {
                error!("fcntl(F_DUPFD_CLOEXEC) failed during stdio collapse");
                std::process::abort();
            }
            session.stdout = Some(StdioFd::from_parts(
                unsafe { OwnedFd::from_raw_fd(dup) },
                kind,
                inherited,
            ));
        }
    }
    debug!("stdio collapsed onto a single socket");
    session.collapse = CollapseState::Applied;
}

/// Close whatever is still open and report the final status. The exit-code
/// frame goes out only from here, only when a local child produced a
/// status, and only while the transport is still usable.
fn teardown<V: Vchan>(vchan: &mut V, session: &mut Session, send_exit: bool) -> i32 {
    session.close_stdout();
    session.close_stdin();
    session.close_stderr();

    let code = if session.child.is_none() {
        session.remote_status.unwrap_or(-1)
    } else {
        session
            .local_status
            .or(session.remote_status)
            .unwrap_or(-1)
    };

    if send_exit && session.child.is_some() {
        if let Some(status) = session.local_status {
            if vchan.is_open() {
                match codec::send_exit_code(vchan, status) {
                    Ok(()) => info!(status, "sent exit code"),
                    Err(e) => warn!(error = %e, "failed to send exit code"),
                }
            }
        }
    }
    code
}
