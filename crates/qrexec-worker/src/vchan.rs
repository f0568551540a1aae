//! The vchan transport contract and a stream-backed implementation.
//!
//! The multiplexer and codec only ever talk to the [`Vchan`] trait: the
//! operations an inter-domain byte channel offers (blocking send/recv, an
//! event descriptor for the wait set, ring accounting, connection state).
//! [`StreamVchan`] implements the contract over a `UnixStream`, with one
//! socket path per (domain, port) pair under `QREXEC_VCHAN_DIR`.

use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use qrexec_protocol::DEFAULT_VCHAN_BUFFER_SIZE;
use tracing::debug;

use crate::error::{Error, Result};

/// Environment variable naming the directory that holds vchan sockets.
pub const VCHAN_DIR_ENV: &str = "QREXEC_VCHAN_DIR";

/// Fallback socket directory when `QREXEC_VCHAN_DIR` is unset.
const DEFAULT_VCHAN_DIR: &str = "/var/run/qrexec";

/// Operations the data path invokes on an inter-domain byte channel.
pub trait Vchan {
    /// Send the whole buffer; a short transfer is an error.
    fn send_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Receive exactly `buf.len()` bytes; a short transfer is an error.
    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Advance transport state after the poll descriptor fired. In the
    /// server role the first call blocks until the peer connects.
    fn wait(&mut self) -> Result<()>;

    /// Bytes that can be read right now without blocking.
    fn data_ready(&self) -> usize;

    /// Outbound ring headroom in bytes.
    fn buffer_space(&self) -> usize;

    /// False once the peer has been observed closed.
    fn is_open(&self) -> bool;

    /// Descriptor to watch for readability in the wait set.
    fn poll_fd(&self) -> RawFd;
}

enum State {
    Listening(UnixListener),
    Connected(UnixStream),
    Closed,
}

/// [`Vchan`] over a `UnixStream`, with ring accounting via socket queues.
pub struct StreamVchan {
    state: State,
    ring_size: usize,
    eof: bool,
}

impl StreamVchan {
    /// Create the server side for (domain, port) and start listening.
    /// The peer connection is accepted by the first [`Vchan::wait`] call.
    /// A ring size of 0 selects the 64 KiB default; sizes must be powers
    /// of two.
    pub fn server(domain: u32, port: u32, read_ring: usize, write_ring: usize) -> Result<Self> {
        effective_ring_size(read_ring)?;
        let ring_size = effective_ring_size(write_ring)?;
        let path = socket_path(domain, port);
        if let Some(dir) = path.parent() {
            let _ = fs::create_dir_all(dir);
        }
        match fs::remove_file(&path) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::transport("bind", e)),
        }
        let listener = UnixListener::bind(&path).map_err(|e| Error::transport("bind", e))?;
        debug!(domain, port, path = %path.display(), "vchan server listening");
        Ok(Self {
            state: State::Listening(listener),
            ring_size,
            eof: false,
        })
    }

    /// Connect to the server side for (domain, port).
    pub fn client(domain: u32, port: u32) -> Result<Self> {
        let path = socket_path(domain, port);
        let stream = UnixStream::connect(&path).map_err(|e| Error::transport("connect", e))?;
        debug!(domain, port, path = %path.display(), "vchan client connected");
        Ok(Self::connected(stream, DEFAULT_VCHAN_BUFFER_SIZE))
    }

    /// Wrap an already-connected stream, e.g. one half of a socketpair.
    pub fn from_stream(stream: UnixStream, ring_size: usize) -> Result<Self> {
        let ring_size = effective_ring_size(ring_size)?;
        Ok(Self::connected(stream, ring_size))
    }

    fn connected(stream: UnixStream, ring_size: usize) -> Self {
        set_send_buffer(stream.as_raw_fd(), ring_size);
        Self {
            state: State::Connected(stream),
            ring_size,
            eof: false,
        }
    }

    /// Configured outbound ring size.
    pub fn ring_size(&self) -> usize {
        self.ring_size
    }
}

impl Vchan for StreamVchan {
    fn send_all(&mut self, buf: &[u8]) -> Result<()> {
        match &mut self.state {
            State::Connected(stream) => stream
                .write_all(buf)
                .map_err(|e| Error::transport("send", e)),
            _ => Err(Error::Disconnected),
        }
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let res = match &mut self.state {
            State::Connected(stream) => stream.read_exact(buf),
            _ => return Err(Error::Disconnected),
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.eof = true;
                Err(Error::Disconnected)
            }
            Err(e) => Err(Error::transport("recv", e)),
        }
    }

    fn wait(&mut self) -> Result<()> {
        if matches!(self.state, State::Listening(_)) {
            let State::Listening(listener) = std::mem::replace(&mut self.state, State::Closed)
            else {
                unreachable!();
            };
            let (stream, _) = listener
                .accept()
                .map_err(|e| Error::transport("accept", e))?;
            set_send_buffer(stream.as_raw_fd(), self.ring_size);
            debug!("vchan peer connected");
            self.state = State::Connected(stream);
            return Ok(());
        }
        match &self.state {
            State::Connected(stream) => {
                // Peek one byte to learn about an orderly close; buffered
                // data stays readable until drained.
                let fd = stream.as_raw_fd();
                let mut byte = 0u8;
                let n = unsafe {
                    libc::recv(
                        fd,
                        &mut byte as *mut u8 as *mut libc::c_void,
                        1,
                        libc::MSG_PEEK | libc::MSG_DONTWAIT,
                    )
                };
                if n == 0 {
                    self.eof = true;
                }
                Ok(())
            }
            _ => Err(Error::Disconnected),
        }
    }

    fn data_ready(&self) -> usize {
        match &self.state {
            State::Connected(stream) => {
                let mut count: libc::c_int = 0;
                let rc =
                    unsafe { libc::ioctl(stream.as_raw_fd(), libc::FIONREAD as _, &mut count) };
                if rc < 0 {
                    0
                } else {
                    count.max(0) as usize
                }
            }
            _ => 0,
        }
    }

    fn buffer_space(&self) -> usize {
        match &self.state {
            State::Connected(stream) => {
                let mut queued: libc::c_int = 0;
                let rc =
                    unsafe { libc::ioctl(stream.as_raw_fd(), libc::TIOCOUTQ as _, &mut queued) };
                if rc < 0 {
                    self.ring_size
                } else {
                    self.ring_size.saturating_sub(queued.max(0) as usize)
                }
            }
            _ => 0,
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, State::Connected(_)) && !self.eof
    }

    fn poll_fd(&self) -> RawFd {
        match &self.state {
            State::Listening(listener) => listener.as_raw_fd(),
            State::Connected(stream) => stream.as_raw_fd(),
            State::Closed => -1,
        }
    }
}

/// Resolve the requested ring size: 0 selects the default, anything else
/// must be a power of two.
fn effective_ring_size(size: usize) -> Result<usize> {
    let size = if size == 0 {
        DEFAULT_VCHAN_BUFFER_SIZE
    } else {
        size
    };
    if !size.is_power_of_two() {
        return Err(Error::InvalidRingSize(size));
    }
    Ok(size)
}

fn socket_path(domain: u32, port: u32) -> PathBuf {
    let dir = std::env::var_os(VCHAN_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_VCHAN_DIR));
    dir.join(format!("data.{}.{}", domain, port))
}

/// Size the kernel send queue to the ring so `buffer_space` accounting
/// reflects the configured ring. Best effort.
fn set_send_buffer(fd: RawFd, ring_size: usize) {
    let size = ring_size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
