//! Per-connection session state.
//!
//! Everything one worker needs for one remote request lives in a single
//! [`Session`] value threaded through the handshake, codec, and
//! multiplexer: the child pid, the three stdio slots, the outbound frame
//! tag, the pending stdin bytes, both exit-status slots, and the stdio
//! collapse state machine.
//!
//! Descriptor kind (pipe vs socket) is probed once when a slot is filled
//! and teardown dispatches on the recorded kind. Inherited descriptors
//! (raw fd 0 or 1, handed down by the parent process) are never shut down:
//! `shutdown` acts on the socket object shared with the parent, while a
//! plain close only drops this process's reference.

use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::unistd::Pid;
use qrexec_protocol::MsgType;
use tracing::debug;

use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// What a stdio descriptor is, probed once at acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    /// Pipe or anything else without half-close semantics.
    Pipe,
    /// Stream socket; directions can be shut down independently.
    Socket,
}

/// Which direction of a socket to shut down when releasing a slot.
#[derive(Debug, Clone, Copy)]
pub enum HalfClose {
    /// `SHUT_RD` — we will not read from it again.
    Read,
    /// `SHUT_WR` — we will not write to it again.
    Write,
    /// No shutdown, plain close only.
    None,
}

/// Lifecycle of the child-requested stdio collapse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollapseState {
    /// Not requested.
    Idle,
    /// SIGUSR1 seen, redirect not yet applied.
    Pending,
    /// Redirect applied; outbound frames use the single-socket tag.
    Applied,
}

/// One stdio descriptor slot: the owned fd plus what we learned about it
/// when it was acquired.
#[derive(Debug)]
pub struct StdioFd {
    pub(crate) fd: OwnedFd,
    pub(crate) kind: FdKind,
    pub(crate) inherited: bool,
}

impl StdioFd {
    /// Take ownership of a descriptor, probing its kind. Raw fds 0 and 1
    /// are treated as inherited from the parent process.
    pub fn new(fd: OwnedFd) -> Self {
        let raw = fd.as_raw_fd();
        Self {
            kind: probe_kind(raw),
            inherited: raw == 0 || raw == 1,
            fd,
        }
    }

    /// Slot with explicitly known provenance, e.g. a duplicate that must
    /// keep the original's socket identity.
    pub fn from_parts(fd: OwnedFd, kind: FdKind, inherited: bool) -> Self {
        Self {
            fd,
            kind,
            inherited,
        }
    }

    /// The raw descriptor for poll/read/write.
    pub fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Recorded descriptor kind.
    pub fn kind(&self) -> FdKind {
        self.kind
    }

    /// Whether this descriptor came down from the parent process.
    pub fn inherited(&self) -> bool {
        self.inherited
    }

    /// Switch the descriptor to non-blocking mode.
    pub fn set_nonblocking(&self) -> Result<()> {
        set_fd_flags(self.raw(), true)
    }

    /// Give up ownership without closing.
    pub(crate) fn into_raw(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    /// Restore blocking mode, then close the slot. A socket that is ours
    /// alone gets the requested half-close first; inherited descriptors
    /// and pipes are only ever plainly closed.
    fn release(self, how: HalfClose, local_child: bool) {
        let raw = self.raw();
        let _ = set_fd_flags(raw, false);
        if local_child && !self.inherited && self.kind == FdKind::Socket {
            let how = match how {
                HalfClose::Read => Some(libc::SHUT_RD),
                HalfClose::Write => Some(libc::SHUT_WR),
                HalfClose::None => None,
            };
            if let Some(how) = how {
                unsafe {
                    libc::shutdown(raw, how);
                }
            }
        }
        drop(self.fd);
    }
}

fn probe_kind(fd: RawFd) -> FdKind {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut st) };
    if rc == 0 && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK {
        FdKind::Socket
    } else {
        FdKind::Pipe
    }
}

fn set_fd_flags(fd: RawFd, nonblocking: bool) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(Error::last_os("fcntl(F_GETFL)"));
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
            return Err(Error::last_os("fcntl(F_SETFL)"));
        }
    }
    Ok(())
}

/// State of one remote request served by one worker.
#[derive(Debug)]
pub struct Session {
    /// Local child, if this session spawned one.
    pub child: Option<Pid>,
    /// Write side toward the child's stdin (or the local output descriptor
    /// in service-connect mode).
    pub stdin: Option<StdioFd>,
    /// Read side from the child's stdout (or the local input descriptor in
    /// service-connect mode).
    pub stdout: Option<StdioFd>,
    /// Read side from the child's stderr.
    pub stderr: Option<StdioFd>,
    /// Tag for locally produced output frames; `DataStdin` in
    /// service-connect mode where the direction is reversed.
    pub stdout_msg_type: MsgType,
    /// Remote bytes not yet accepted by the stdin descriptor.
    pub stdin_buf: Buffer,
    /// Local child's exit status once reaped.
    pub local_status: Option<i32>,
    /// Remote peer's exit status once reported.
    pub remote_status: Option<i32>,
    /// Replace non-printable bytes in forwarded stdout data.
    pub replace_chars_stdout: Option<bool>,
    /// Replace non-printable bytes in forwarded stderr data.
    pub replace_chars_stderr: Option<bool>,
    /// Stdio collapse state machine.
    pub collapse: CollapseState,
    /// Negotiated data protocol version.
    pub version: u32,
}

impl Session {
    /// Session with no child and no descriptors; used when the spawn
    /// failed and the loop only waits for the remote side to finish.
    pub fn new(version: u32) -> Self {
        Self {
            child: None,
            stdin: None,
            stdout: None,
            stderr: None,
            stdout_msg_type: MsgType::DataStdout,
            stdin_buf: Buffer::new(),
            local_status: None,
            remote_status: None,
            replace_chars_stdout: env_flag("QREXEC_REPLACE_CHARS_STDOUT"),
            replace_chars_stderr: env_flag("QREXEC_REPLACE_CHARS_STDERR"),
            collapse: CollapseState::Idle,
            version,
        }
    }

    /// Exec-mode session around a spawned child.
    pub fn with_child(
        version: u32,
        pid: Pid,
        stdin: OwnedFd,
        stdout: OwnedFd,
        stderr: Option<OwnedFd>,
    ) -> Self {
        Self {
            child: Some(pid),
            stdin: Some(StdioFd::new(stdin)),
            stdout: Some(StdioFd::new(stdout)),
            stderr: stderr.map(StdioFd::new),
            ..Self::new(version)
        }
    }

    /// Service-connect session over caller-supplied descriptors: no child,
    /// outbound tag remapped because the local descriptors represent the
    /// other end of the stream pair.
    pub fn service(
        version: u32,
        stdin: OwnedFd,
        stdout: OwnedFd,
        stderr: Option<OwnedFd>,
    ) -> Self {
        Self {
            stdin: Some(StdioFd::new(stdin)),
            stdout: Some(StdioFd::new(stdout)),
            stderr: stderr.map(StdioFd::new),
            stdout_msg_type: MsgType::DataStdin,
            ..Self::new(version)
        }
    }

    /// Release the stdin slot: write-direction half-close for a socket
    /// that is ours alone, plain close otherwise.
    pub fn close_stdin(&mut self) {
        if let Some(slot) = self.stdin.take() {
            debug!(fd = slot.raw(), "closing stdin slot");
            slot.release(HalfClose::Write, self.child.is_some());
        }
    }

    /// Release the stdout slot: read-direction half-close for a socket
    /// that is ours alone, plain close otherwise.
    pub fn close_stdout(&mut self) {
        if let Some(slot) = self.stdout.take() {
            debug!(fd = slot.raw(), "closing stdout slot");
            slot.release(HalfClose::Read, self.child.is_some());
        }
    }

    /// Release the stderr slot; always a plain close.
    pub fn close_stderr(&mut self) {
        if let Some(slot) = self.stderr.take() {
            debug!(fd = slot.raw(), "closing stderr slot");
            slot.release(HalfClose::None, self.child.is_some());
        }
    }
}

/// Tri-state env flag: "1"/"true" enables, "0"/"false" disables, anything
/// else (including unset) leaves the default.
fn env_flag(name: &str) -> Option<bool> {
    match std::env::var(name).ok()?.as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}
