//! Command-line parsing and child process setup.
//!
//! A dispatched command line has the form `user:command`. Switching to the
//! named user is the privileged daemon's job; here the user part is parsed
//! and logged, and the command runs under `/bin/sh -c` with the worker's
//! environment (including `QREXEC_AGENT_PID`) so the child can signal the
//! stdio collapse back.

use std::ffi::OsStr;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::process::{Command, Stdio};

use nix::unistd::Pid;
use tracing::info;

use crate::error::{Error, Result};

/// A spawned child with the three descriptors the multiplexer bridges.
pub struct SpawnedChild {
    /// Child process id, reaped by the multiplexer via `waitpid`.
    pub pid: Pid,
    /// Write side of the child's stdin.
    pub stdin: OwnedFd,
    /// Read side of the child's stdout.
    pub stdout: OwnedFd,
    /// Read side of the child's stderr.
    pub stderr: OwnedFd,
}

/// Split a command line at the first `:` into user and command. A missing
/// separator is a protocol error.
pub fn parse_user_command(cmdline: &[u8]) -> Result<(&OsStr, &OsStr)> {
    let colon = cmdline
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| Error::Protocol("no colon in command line".into()))?;
    Ok((
        OsStr::from_bytes(&cmdline[..colon]),
        OsStr::from_bytes(&cmdline[colon + 1..]),
    ))
}

/// Spawn the command with all three stdio streams piped.
pub fn spawn_command(cmdline: &[u8]) -> Result<SpawnedChild> {
    let (user, command) = parse_user_command(cmdline)?;
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(Error::Spawn)?;

    let pid = Pid::from_raw(child.id() as i32);
    info!(
        user = %user.to_string_lossy(),
        pid = pid.as_raw(),
        "executed command"
    );
    let stdin = OwnedFd::from(child.stdin.take().expect("stdin was piped"));
    let stdout = OwnedFd::from(child.stdout.take().expect("stdout was piped"));
    let stderr = OwnedFd::from(child.stderr.take().expect("stderr was piped"));
    // The Child handle is dropped without waiting; reaping happens in the
    // multiplexer via waitpid.
    Ok(SpawnedChild {
        pid,
        stdin,
        stdout,
        stderr,
    })
}

/// Spawn the command detached, with stdio on `/dev/null`. The caller
/// reports success without waiting for it.
pub fn just_exec(cmdline: &[u8]) -> Result<Pid> {
    let (user, command) = parse_user_command(cmdline)?;
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(Error::Spawn)?;
    let pid = Pid::from_raw(child.id() as i32);
    info!(
        user = %user.to_string_lossy(),
        pid = pid.as_raw(),
        "executed command (nowait)"
    );
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn parse_splits_at_first_colon() {
        let (user, cmd) = parse_user_command(b"alice:echo a:b").unwrap();
        assert_eq!(user, "alice");
        assert_eq!(cmd, "echo a:b");
    }

    #[test]
    fn parse_without_colon_is_protocol_error() {
        assert!(matches!(
            parse_user_command(b"noColonHere"),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn parse_allows_empty_user() {
        let (user, cmd) = parse_user_command(b":true").unwrap();
        assert_eq!(user, "");
        assert_eq!(cmd, "true");
    }

    #[test]
    fn spawn_pipes_child_output() {
        let spawned = spawn_command(b"user:printf hi").unwrap();
        drop(spawned.stdin);

        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    spawned.stdout.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
        }
        assert_eq!(out, b"hi");

        let _ = nix::sys::wait::waitpid(spawned.pid, None);
    }

    #[test]
    fn just_exec_returns_running_pid() {
        let pid = just_exec(b"user:true").unwrap();
        assert!(pid.as_raw() > 0);
        let _ = nix::sys::wait::waitpid(pid, None);
    }
}
