//! Wire protocol for the qrexec data channel.
//!
//! This crate defines the frame format spoken over a data vchan between a
//! worker and its remote peer. It contains no I/O — only constants, the
//! fixed header, and the HELLO payload.
//!
//! # Frame format
//!
//! Every frame is a fixed 8-byte header followed by `len` bytes of payload:
//!
//! ```text
//! +--------------+--------------+------------------+
//! | type (u32 LE)| len  (u32 LE)| payload (len B)  |
//! +--------------+--------------+------------------+
//! ```
//!
//! A session starts with exactly one `Hello` in each direction. Data frames
//! carry opaque bytes for the named stream; a zero-length data frame means
//! end-of-stream. `DataExitCode` carries a single `i32` and is the last
//! frame sent in either direction.

#![deny(missing_docs)]

/// Protocol version this implementation speaks.
pub const PROTOCOL_VERSION: u32 = 3;

/// Oldest data protocol version still accepted during the handshake.
pub const MIN_DATA_PROTOCOL_VERSION: u32 = 2;

/// Upper bound on an `ExecCmdline`/`JustExec` command line, including the
/// trailing NUL. Keeps downstream parsers bounded.
pub const MAX_QREXEC_CMD_LEN: usize = 65535;

/// Largest payload carried by a single data frame under protocol v2.
pub const MAX_DATA_CHUNK_V2: usize = 4096;

/// Largest payload carried by a single data frame under protocol v3.
pub const MAX_DATA_CHUNK_V3: usize = 65536;

/// Largest data-frame payload for the negotiated protocol version.
pub fn max_data_chunk(version: u32) -> usize {
    if version >= 3 {
        MAX_DATA_CHUNK_V3
    } else {
        MAX_DATA_CHUNK_V2
    }
}

/// Default vchan ring size (each direction) when the request asks for 0.
pub const DEFAULT_VCHAN_BUFFER_SIZE: usize = 65536;

/// Frame and request types on the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    /// Bytes destined for the remote command's standard input.
    DataStdin = 0x190,
    /// Bytes produced on the local command's standard output.
    DataStdout = 0x191,
    /// Bytes produced on the local command's standard error.
    DataStderr = 0x192,
    /// Final frame: the command's exit status as an `i32`.
    DataExitCode = 0x193,
    /// Request kind: spawn a command and bridge its stdio.
    ExecCmdline = 0x200,
    /// Request kind: spawn a detached command, report synthetic success.
    JustExec = 0x201,
    /// Request kind: bridge caller-supplied descriptors, no spawn.
    ServiceConnect = 0x202,
    /// Version negotiation, exchanged once at session start.
    Hello = 0x300,
}

impl MsgType {
    /// Decode a raw wire value. Unknown values are a protocol violation.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x190 => Some(Self::DataStdin),
            0x191 => Some(Self::DataStdout),
            0x192 => Some(Self::DataStderr),
            0x193 => Some(Self::DataExitCode),
            0x200 => Some(Self::ExecCmdline),
            0x201 => Some(Self::JustExec),
            0x202 => Some(Self::ServiceConnect),
            0x300 => Some(Self::Hello),
            _ => None,
        }
    }
}

/// Fixed frame header: message type and payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Raw message type (see [`MsgType`]).
    pub ty: u32,
    /// Payload length in bytes.
    pub len: u32,
}

impl MsgHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 8;

    /// Header for a frame of the given type and payload length.
    pub fn new(ty: MsgType, len: u32) -> Self {
        Self { ty: ty as u32, len }
    }

    /// Encode to wire bytes (little-endian).
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..4].copy_from_slice(&self.ty.to_le_bytes());
        buf[4..].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    /// Decode from wire bytes.
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            ty: u32::from_le_bytes(buf[..4].try_into().expect("4-byte slice")),
            len: u32::from_le_bytes(buf[4..].try_into().expect("4-byte slice")),
        }
    }

    /// The decoded message type, if recognized.
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_raw(self.ty)
    }
}

/// HELLO payload: the sender's protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    /// Protocol version the peer speaks.
    pub version: u32,
}

impl PeerInfo {
    /// Encoded size on the wire.
    pub const SIZE: usize = 4;

    /// Encode to wire bytes (little-endian).
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        self.version.to_le_bytes()
    }

    /// Decode from wire bytes.
    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            version: u32::from_le_bytes(*buf),
        }
    }
}
