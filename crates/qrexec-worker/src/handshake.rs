//! Protocol version negotiation on a freshly opened vchan.

use qrexec_protocol::{
    MsgHeader, MsgType, PeerInfo, MIN_DATA_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use tracing::debug;

use crate::error::{Error, Result};
use crate::vchan::Vchan;

/// Exchange one HELLO in each direction and return the negotiated data
/// protocol version: the minimum of the two peers, rejected when it falls
/// below the supported floor. Any short transfer, wrong header type, or
/// wrong length is fatal for the session.
pub fn handshake<V: Vchan>(vchan: &mut V) -> Result<u32> {
    let hdr = MsgHeader::new(MsgType::Hello, PeerInfo::SIZE as u32);
    vchan.send_all(&hdr.to_bytes())?;
    let info = PeerInfo {
        version: PROTOCOL_VERSION,
    };
    vchan.send_all(&info.to_bytes())?;

    let mut hdr_buf = [0u8; MsgHeader::SIZE];
    vchan.recv_exact(&mut hdr_buf)?;
    let hdr = MsgHeader::from_bytes(&hdr_buf);
    if hdr.msg_type() != Some(MsgType::Hello) || hdr.len as usize != PeerInfo::SIZE {
        return Err(Error::Handshake(format!(
            "invalid hello packet: type {:#x}, len {}",
            hdr.ty, hdr.len
        )));
    }

    let mut info_buf = [0u8; PeerInfo::SIZE];
    vchan.recv_exact(&mut info_buf)?;
    let peer = PeerInfo::from_bytes(&info_buf);

    let version = peer.version.min(PROTOCOL_VERSION);
    if version < MIN_DATA_PROTOCOL_VERSION {
        return Err(Error::Handshake(format!(
            "incompatible peer protocol version (remote {}, local {})",
            peer.version, PROTOCOL_VERSION
        )));
    }
    debug!(version, remote = peer.version, "data protocol negotiated");
    Ok(version)
}
