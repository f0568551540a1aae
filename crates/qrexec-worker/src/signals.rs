//! SIGCHLD / SIGUSR1 plumbing for the multiplexer.
//!
//! Each handler writes a single byte to a non-blocking self-pipe whose read
//! end is a member of the multiplexer's poll set, so signal delivery and
//! descriptor readiness are one event source and no mask juggling is needed
//! around the wait. Handlers do nothing else: no allocation, no other I/O.
//!
//! SIGUSR1 is the child's request to collapse its stdio onto one socket; the
//! handler re-arms to `SIG_IGN` so repeated signals stay idempotent.

use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Error, Result};

static SIGCHLD_WR: AtomicI32 = AtomicI32::new(-1);
static SIGUSR1_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn sigchld_handler(_sig: libc::c_int) {
    let fd = SIGCHLD_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = 0u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

extern "C" fn sigusr1_handler(_sig: libc::c_int) {
    let fd = SIGUSR1_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = 0u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
    unsafe {
        libc::signal(libc::SIGUSR1, libc::SIG_IGN);
    }
}

/// Read ends of the two signal self-pipes, owned by the session.
pub struct SignalPipes {
    child_exited: OwnedFd,
    collapse: OwnedFd,
}

impl SignalPipes {
    /// Descriptor that turns readable when SIGCHLD was delivered.
    pub fn child_exited_fd(&self) -> RawFd {
        self.child_exited.as_raw_fd()
    }

    /// Descriptor that turns readable when SIGUSR1 was delivered.
    pub fn collapse_fd(&self) -> RawFd {
        self.collapse.as_raw_fd()
    }
}

/// Install the SIGCHLD and SIGUSR1 handlers and hand back the pipe read
/// ends. Call before spawning the child so no delivery is missed; a byte
/// written before the first poll is still picked up there.
pub fn install() -> Result<SignalPipes> {
    let (chld_rd, chld_wr) = pipe_pair()?;
    let (usr1_rd, usr1_wr) = pipe_pair()?;

    // The write ends live for the rest of the process; the handlers own
    // them through the statics.
    SIGCHLD_WR.store(chld_wr.into_raw_fd(), Ordering::SeqCst);
    SIGUSR1_WR.store(usr1_wr.into_raw_fd(), Ordering::SeqCst);

    unsafe {
        if libc::signal(
            libc::SIGCHLD,
            sigchld_handler as *const () as libc::sighandler_t,
        ) == libc::SIG_ERR
        {
            return Err(Error::last_os("signal(SIGCHLD)"));
        }
        if libc::signal(
            libc::SIGUSR1,
            sigusr1_handler as *const () as libc::sighandler_t,
        ) == libc::SIG_ERR
        {
            return Err(Error::last_os("signal(SIGUSR1)"));
        }
    }

    Ok(SignalPipes {
        child_exited: chld_rd,
        collapse: usr1_rd,
    })
}

/// Export this worker's pid as `QREXEC_AGENT_PID` so the child can signal
/// the stdio collapse back.
pub fn prepare_child_env() {
    std::env::set_var("QREXEC_AGENT_PID", std::process::id().to_string());
}

/// Empty a signal pipe; true when at least one byte was pending.
pub fn drain(fd: RawFd) -> bool {
    let mut fired = false;
    let mut buf = [0u8; 16];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            fired = true;
        } else {
            return fired;
        }
    }
}

fn pipe_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(Error::last_os("pipe2"));
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_reports_pending_byte() {
        let (rd, wr) = pipe_pair().unwrap();
        assert!(!drain(rd.as_raw_fd()));

        let byte = 0u8;
        let n = unsafe {
            libc::write(
                wr.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
        assert_eq!(n, 1);
        assert!(drain(rd.as_raw_fd()));
        assert!(!drain(rd.as_raw_fd()));
    }

    #[test]
    fn child_env_carries_pid() {
        prepare_child_env();
        assert_eq!(
            std::env::var("QREXEC_AGENT_PID").unwrap(),
            std::process::id().to_string()
        );
    }
}
