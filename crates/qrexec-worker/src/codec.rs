//! Frame codec between the vchan and raw descriptors.
//!
//! The decoder ([`handle_remote_data`]) drains complete frames off the
//! vchan and applies them to the session: data frames go to the stdin
//! slot (buffered when the non-blocking descriptor pushes back), stderr
//! frames go to the worker's own stderr, an exit-code frame records the
//! remote status. The encoder ([`handle_input`]) reads one chunk from a
//! child descriptor and pushes it as a tagged data frame, never larger
//! than the vchan's current headroom allows.

use std::io::{self, Write};
use std::os::fd::RawFd;

use qrexec_protocol::{max_data_chunk, MsgHeader, MsgType};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::session::Session;
use crate::vchan::Vchan;

/// What the decoder learned from the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEvent {
    /// Nothing of note; keep looping.
    None,
    /// The remote will send no more stdin data.
    Eof,
    /// The remote reported its exit code; no more output will be accepted.
    Exited(i32),
}

/// Result of one encoder pass over a child descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// One data frame was sent.
    Sent(usize),
    /// Nothing readable, or no room in the outbound ring.
    NotReady,
    /// The descriptor reached end of stream; the EOF marker was sent.
    Eof,
}

/// Replace every byte outside printable ASCII (keeping `\n` and `\t`)
/// with `_`.
pub fn sanitize(data: &mut [u8]) {
    for byte in data {
        if !(0x20..0x7f).contains(byte) && *byte != b'\n' && *byte != b'\t' {
            *byte = b'_';
        }
    }
}

/// Process everything the remote side has made available.
///
/// Pending stdin bytes are flushed first; while any remain queued, no new
/// frames are read so arrival order holds and the queue stays bounded by
/// the vchan ring. Returns the most significant event seen.
pub fn handle_remote_data<V: Vchan>(vchan: &mut V, session: &mut Session) -> Result<RemoteEvent> {
    if !session.stdin_buf.is_empty() && !flush_stdin_buf(session)? {
        return Ok(RemoteEvent::None);
    }

    while vchan.data_ready() >= MsgHeader::SIZE {
        let mut hdr_buf = [0u8; MsgHeader::SIZE];
        vchan.recv_exact(&mut hdr_buf)?;
        let hdr = MsgHeader::from_bytes(&hdr_buf);
        let ty = hdr
            .msg_type()
            .ok_or_else(|| Error::Protocol(format!("unknown frame type {:#x}", hdr.ty)))?;
        if hdr.len as usize > max_data_chunk(session.version) {
            return Err(Error::Protocol(format!(
                "oversized data frame: {} bytes",
                hdr.len
            )));
        }

        match ty {
            MsgType::DataStdin | MsgType::DataStdout => {
                if hdr.len == 0 {
                    debug!("remote stdin stream finished");
                    return Ok(RemoteEvent::Eof);
                }
                let mut data = vec![0u8; hdr.len as usize];
                vchan.recv_exact(&mut data)?;
                if ty == MsgType::DataStdout && session.replace_chars_stdout == Some(true) {
                    sanitize(&mut data);
                }
                write_or_buffer(session, &data)?;
                // Stop draining while bytes are queued so a later EOF
                // cannot overtake them.
                if !session.stdin_buf.is_empty() {
                    return Ok(RemoteEvent::None);
                }
            }
            MsgType::DataStderr => {
                let mut data = vec![0u8; hdr.len as usize];
                vchan.recv_exact(&mut data)?;
                if session.replace_chars_stderr == Some(true) {
                    sanitize(&mut data);
                }
                let _ = io::stderr().write_all(&data);
            }
            MsgType::DataExitCode => {
                if hdr.len as usize != std::mem::size_of::<i32>() {
                    return Err(Error::Protocol(format!(
                        "bad exit-code frame length: {}",
                        hdr.len
                    )));
                }
                let mut code_buf = [0u8; 4];
                vchan.recv_exact(&mut code_buf)?;
                let code = i32::from_le_bytes(code_buf);
                debug!(code, "remote process exited");
                session.remote_status = Some(code);
                return Ok(RemoteEvent::Exited(code));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected frame type {:?} on data channel",
                    other
                )));
            }
        }
    }
    Ok(RemoteEvent::None)
}

/// Read one chunk from `fd` and push it as a data frame.
///
/// The chunk never exceeds the outbound headroom minus one header, so a
/// frame the ring cannot take is never attempted. Once the stdio collapse
/// has been applied the frame carries the `DataStdin` tag regardless of
/// `msg_type` — the single-socket convention for a merged stream.
pub fn handle_input<V: Vchan>(
    vchan: &mut V,
    fd: RawFd,
    msg_type: MsgType,
    version: u32,
    collapsed: bool,
) -> Result<ForwardOutcome> {
    let space = vchan.buffer_space();
    if space <= MsgHeader::SIZE {
        return Ok(ForwardOutcome::NotReady);
    }
    let max = (space - MsgHeader::SIZE).min(max_data_chunk(version));
    let mut buf = vec![0u8; max];

    let tag = if collapsed { MsgType::DataStdin } else { msg_type };
    match read_fd(fd, &mut buf) {
        Ok(0) => {
            send_frame(vchan, tag, &[])?;
            Ok(ForwardOutcome::Eof)
        }
        Ok(n) => {
            send_frame(vchan, tag, &buf[..n])?;
            Ok(ForwardOutcome::Sent(n))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ForwardOutcome::NotReady),
        Err(e) => Err(Error::Sys {
            op: "stream read",
            source: e,
        }),
    }
}

/// Send the final status frame for the local child.
pub fn send_exit_code<V: Vchan>(vchan: &mut V, status: i32) -> Result<()> {
    send_frame(vchan, MsgType::DataExitCode, &status.to_le_bytes())
}

fn send_frame<V: Vchan>(vchan: &mut V, ty: MsgType, payload: &[u8]) -> Result<()> {
    let hdr = MsgHeader::new(ty, payload.len() as u32);
    vchan.send_all(&hdr.to_bytes())?;
    if !payload.is_empty() {
        vchan.send_all(payload)?;
    }
    Ok(())
}

/// Write remote data to the stdin slot, queueing whatever the descriptor
/// will not take yet. Data arriving after the slot is gone is discarded.
fn write_or_buffer(session: &mut Session, data: &[u8]) -> Result<()> {
    let Some(raw) = session.stdin.as_ref().map(|s| s.raw()) else {
        return Ok(());
    };
    let mut offset = 0;
    if session.stdin_buf.is_empty() {
        while offset < data.len() {
            match write_fd(raw, &data[offset..]) {
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    // The reader is gone; nothing left to deliver.
                    warn!("stdin reader disappeared, discarding remote data");
                    session.close_stdin();
                    session.stdin_buf.clear();
                    return Ok(());
                }
                Err(e) => {
                    return Err(Error::Sys {
                        op: "stdin write",
                        source: e,
                    })
                }
            }
        }
    }
    if offset < data.len() {
        session.stdin_buf.queue(&data[offset..]);
    }
    Ok(())
}

/// Drain the pending stdin queue. True when nothing remains queued.
pub(crate) fn flush_stdin_buf(session: &mut Session) -> Result<bool> {
    loop {
        if session.stdin_buf.is_empty() {
            return Ok(true);
        }
        let Some(raw) = session.stdin.as_ref().map(|s| s.raw()) else {
            session.stdin_buf.clear();
            return Ok(true);
        };
        let chunk = session.stdin_buf.front_chunk().to_vec();
        match write_fd(raw, &chunk) {
            Ok(n) => session.stdin_buf.consume(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                warn!("stdin reader disappeared, dropping buffered data");
                session.close_stdin();
                session.stdin_buf.clear();
                return Ok(true);
            }
            Err(e) => {
                return Err(Error::Sys {
                    op: "stdin write",
                    source: e,
                })
            }
        }
    }
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vchan::StreamVchan;
    use std::io::Read;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::os::unix::net::UnixStream;

    #[test]
    fn sanitize_keeps_printables_and_whitespace() {
        let mut data = b"ok\tline\nend".to_vec();
        let original = data.clone();
        sanitize(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn sanitize_replaces_control_and_high_bytes() {
        let mut data = vec![0x07, b'a', 0x1b, b'b', 0xff, 0x7f];
        sanitize(&mut data);
        assert_eq!(data, b"_a_b__");
    }

    fn pipe_fds() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn handle_input_frames_chunk_then_eof_marker() {
        let (a, mut peer) = UnixStream::pair().unwrap();
        let mut vchan = StreamVchan::from_stream(a, 65536).unwrap();
        let (rd, wr) = pipe_fds();

        let n = unsafe {
            libc::write(
                wr.as_raw_fd(),
                b"hello".as_ptr() as *const libc::c_void,
                5,
            )
        };
        assert_eq!(n, 5);
        drop(wr);

        let out = handle_input(&mut vchan, rd.as_raw_fd(), MsgType::DataStdout, 3, false).unwrap();
        assert_eq!(out, ForwardOutcome::Sent(5));
        let out = handle_input(&mut vchan, rd.as_raw_fd(), MsgType::DataStdout, 3, false).unwrap();
        assert_eq!(out, ForwardOutcome::Eof);

        let mut hdr_buf = [0u8; MsgHeader::SIZE];
        peer.read_exact(&mut hdr_buf).unwrap();
        let hdr = MsgHeader::from_bytes(&hdr_buf);
        assert_eq!(hdr.msg_type(), Some(MsgType::DataStdout));
        assert_eq!(hdr.len, 5);
        let mut payload = [0u8; 5];
        peer.read_exact(&mut payload).unwrap();
        assert_eq!(&payload, b"hello");

        peer.read_exact(&mut hdr_buf).unwrap();
        let hdr = MsgHeader::from_bytes(&hdr_buf);
        assert_eq!(hdr.msg_type(), Some(MsgType::DataStdout));
        assert_eq!(hdr.len, 0);
    }

    #[test]
    fn collapsed_input_uses_stdin_tag() {
        let (a, mut peer) = UnixStream::pair().unwrap();
        let mut vchan = StreamVchan::from_stream(a, 65536).unwrap();
        let (rd, wr) = pipe_fds();

        unsafe {
            libc::write(wr.as_raw_fd(), b"X".as_ptr() as *const libc::c_void, 1);
        }
        let out = handle_input(&mut vchan, rd.as_raw_fd(), MsgType::DataStdout, 3, true).unwrap();
        assert_eq!(out, ForwardOutcome::Sent(1));

        let mut hdr_buf = [0u8; MsgHeader::SIZE];
        peer.read_exact(&mut hdr_buf).unwrap();
        assert_eq!(
            MsgHeader::from_bytes(&hdr_buf).msg_type(),
            Some(MsgType::DataStdin)
        );
    }

    #[test]
    fn decoder_routes_data_to_stdin_slot() {
        use crate::session::Session;
        use std::io::Write as _;

        let (a, mut peer) = UnixStream::pair().unwrap();
        let mut vchan = StreamVchan::from_stream(a, 65536).unwrap();
        let (rd, wr) = pipe_fds();

        let mut session = Session::new(3);
        session.stdin = Some(crate::session::StdioFd::new(wr));

        let hdr = MsgHeader::new(MsgType::DataStdin, 3);
        peer.write_all(&hdr.to_bytes()).unwrap();
        peer.write_all(b"abc").unwrap();

        let event = handle_remote_data(&mut vchan, &mut session).unwrap();
        assert_eq!(event, RemoteEvent::None);

        let mut buf = [0u8; 3];
        let n = unsafe { libc::read(rd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 3) };
        assert_eq!(n, 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn decoder_reports_zero_length_stdin_as_eof() {
        use crate::session::Session;
        use std::io::Write as _;

        let (a, mut peer) = UnixStream::pair().unwrap();
        let mut vchan = StreamVchan::from_stream(a, 65536).unwrap();

        let mut session = Session::new(3);
        let hdr = MsgHeader::new(MsgType::DataStdin, 0);
        peer.write_all(&hdr.to_bytes()).unwrap();

        let event = handle_remote_data(&mut vchan, &mut session).unwrap();
        assert_eq!(event, RemoteEvent::Eof);
    }

    #[test]
    fn decoder_records_remote_exit() {
        use crate::session::Session;
        use std::io::Write as _;

        let (a, mut peer) = UnixStream::pair().unwrap();
        let mut vchan = StreamVchan::from_stream(a, 65536).unwrap();

        let mut session = Session::new(3);
        let hdr = MsgHeader::new(MsgType::DataExitCode, 4);
        peer.write_all(&hdr.to_bytes()).unwrap();
        peer.write_all(&42i32.to_le_bytes()).unwrap();

        let event = handle_remote_data(&mut vchan, &mut session).unwrap();
        assert_eq!(event, RemoteEvent::Exited(42));
        assert_eq!(session.remote_status, Some(42));
    }

    #[test]
    fn decoder_rejects_hello_mid_stream() {
        use crate::session::Session;
        use std::io::Write as _;

        let (a, mut peer) = UnixStream::pair().unwrap();
        let mut vchan = StreamVchan::from_stream(a, 65536).unwrap();

        let mut session = Session::new(3);
        let hdr = MsgHeader::new(MsgType::Hello, 4);
        peer.write_all(&hdr.to_bytes()).unwrap();
        peer.write_all(&3u32.to_le_bytes()).unwrap();

        assert!(matches!(
            handle_remote_data(&mut vchan, &mut session),
            Err(Error::Protocol(_))
        ));
    }
}
