//! End-to-end data path scenarios over a socketpair-backed vchan.
//!
//! Each test drives the remote side of the wire protocol by hand while a
//! worker session runs in a thread. Sessions install process-wide signal
//! handlers, so scenarios that spawn a child are serialized behind a lock.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::process::{Command, Stdio};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Instant;

use nix::unistd::Pid;
use qrexec_protocol::{MsgHeader, MsgType, PeerInfo, PROTOCOL_VERSION};
use qrexec_worker::dispatch::{
    run_exec_session, run_just_exec_session, run_service_session, ServiceStdio,
};
use qrexec_worker::session::Session;
use qrexec_worker::vchan::StreamVchan;
use qrexec_worker::{mux, signals};

fn session_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Peer {
    stream: UnixStream,
}

impl Peer {
    fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    fn handshake(&mut self) {
        let hdr = MsgHeader::new(MsgType::Hello, PeerInfo::SIZE as u32);
        self.stream.write_all(&hdr.to_bytes()).unwrap();
        self.stream
            .write_all(
                &PeerInfo {
                    version: PROTOCOL_VERSION,
                }
                .to_bytes(),
            )
            .unwrap();

        let (hdr, payload) = self.read_frame();
        assert_eq!(hdr.msg_type(), Some(MsgType::Hello));
        let info = PeerInfo::from_bytes(&payload.try_into().unwrap());
        assert_eq!(info.version, PROTOCOL_VERSION);
    }

    fn send_frame(&mut self, ty: MsgType, payload: &[u8]) {
        let hdr = MsgHeader::new(ty, payload.len() as u32);
        self.stream.write_all(&hdr.to_bytes()).unwrap();
        self.stream.write_all(payload).unwrap();
    }

    fn send_exit(&mut self, code: i32) {
        self.send_frame(MsgType::DataExitCode, &code.to_le_bytes());
    }

    fn read_frame(&mut self) -> (MsgHeader, Vec<u8>) {
        let mut hdr_buf = [0u8; MsgHeader::SIZE];
        self.stream.read_exact(&mut hdr_buf).unwrap();
        let hdr = MsgHeader::from_bytes(&hdr_buf);
        let mut payload = vec![0u8; hdr.len as usize];
        self.stream.read_exact(&mut payload).unwrap();
        (hdr, payload)
    }

    /// Collect frames until the exit-code frame; returns them plus the code.
    fn read_until_exit(&mut self) -> (Vec<(MsgType, Vec<u8>)>, i32) {
        let mut frames = Vec::new();
        loop {
            let (hdr, payload) = self.read_frame();
            let ty = hdr.msg_type().expect("known frame type");
            if ty == MsgType::DataExitCode {
                let code = i32::from_le_bytes(payload.try_into().unwrap());
                return (frames, code);
            }
            frames.push((ty, payload));
        }
    }

    /// The exit-code frame must be the last one: nothing after it but EOF.
    fn assert_closed(&mut self) {
        let mut byte = [0u8; 1];
        assert_eq!(self.stream.read(&mut byte).unwrap(), 0);
    }
}

fn vchan_pair() -> (StreamVchan, Peer) {
    let (a, b) = UnixStream::pair().unwrap();
    (
        StreamVchan::from_stream(a, 65536).unwrap(),
        Peer::new(b),
    )
}

fn stdout_bytes(frames: &[(MsgType, Vec<u8>)]) -> Vec<u8> {
    frames
        .iter()
        .filter(|(ty, _)| *ty == MsgType::DataStdout)
        .flat_map(|(_, data)| data.iter().copied())
        .collect()
}

fn pipe_fds() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as libc::c_int; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

#[test]
fn echo_frames_in_order_then_exit_zero() {
    let _guard = session_lock();
    let (mut vchan, mut peer) = vchan_pair();

    let worker =
        std::thread::spawn(move || run_exec_session(&mut vchan, b"user:cat").unwrap());

    peer.handshake();
    peer.send_frame(MsgType::DataStdin, b"a");
    peer.send_frame(MsgType::DataStdin, b"b");
    peer.send_frame(MsgType::DataStdin, b"c");
    peer.send_frame(MsgType::DataStdin, b"");

    let (frames, exit) = peer.read_until_exit();
    assert_eq!(stdout_bytes(&frames), b"abc");
    assert_eq!(exit, 0);

    assert_eq!(worker.join().unwrap(), 0);
    peer.assert_closed();
}

#[test]
fn child_signal_death_reports_128_plus_signo() {
    let _guard = session_lock();
    let (mut vchan, mut peer) = vchan_pair();

    let worker =
        std::thread::spawn(move || run_exec_session(&mut vchan, b"user:kill -9 $$").unwrap());

    peer.handshake();
    let (_, exit) = peer.read_until_exit();
    assert_eq!(exit, 137);
    assert_eq!(worker.join().unwrap(), 137);
}

#[test]
fn remote_exit_first_tears_down_and_returns_remote_code() {
    let _guard = session_lock();
    let (mut vchan, mut peer) = vchan_pair();

    let worker =
        std::thread::spawn(move || run_exec_session(&mut vchan, b"user:sleep 5").unwrap());

    peer.handshake();
    peer.send_exit(0);
    drop(peer);

    let start = Instant::now();
    assert_eq!(worker.join().unwrap(), 0);
    // The worker must not sit out the child's sleep.
    assert!(start.elapsed().as_secs() < 3);
}

#[test]
fn zero_length_stdin_closes_child_stdin() {
    let _guard = session_lock();
    let (mut vchan, mut peer) = vchan_pair();

    let worker =
        std::thread::spawn(move || run_exec_session(&mut vchan, b"user:cat").unwrap());

    peer.handshake();
    peer.send_frame(MsgType::DataStdin, b"");

    // cat exits on stdin EOF without producing output.
    let (frames, exit) = peer.read_until_exit();
    assert!(stdout_bytes(&frames).is_empty());
    assert_eq!(exit, 0);
    assert_eq!(worker.join().unwrap(), 0);
}

#[test]
fn just_exec_without_colon_reports_minus_one() {
    let _guard = session_lock();
    let (mut vchan, mut peer) = vchan_pair();

    let worker =
        std::thread::spawn(move || run_just_exec_session(&mut vchan, b"noColonHere").unwrap());

    peer.handshake();
    let (hdr, payload) = peer.read_frame();
    assert_eq!(hdr.msg_type(), Some(MsgType::DataExitCode));
    assert_eq!(i32::from_le_bytes(payload.try_into().unwrap()), -1);

    // The worker itself still reports success.
    assert_eq!(worker.join().unwrap(), 0);
    peer.assert_closed();
}

#[test]
fn just_exec_reports_zero_for_valid_command() {
    let _guard = session_lock();
    let (mut vchan, mut peer) = vchan_pair();

    let worker =
        std::thread::spawn(move || run_just_exec_session(&mut vchan, b"user:true").unwrap());

    peer.handshake();
    let (hdr, payload) = peer.read_frame();
    assert_eq!(hdr.msg_type(), Some(MsgType::DataExitCode));
    assert_eq!(i32::from_le_bytes(payload.try_into().unwrap()), 0);
    assert_eq!(worker.join().unwrap(), 0);
}

#[test]
fn stdio_collapse_tags_output_as_stdin() {
    let _guard = session_lock();
    let (a, b) = UnixStream::pair().unwrap();
    let mut peer = Peer::new(b);

    let pipes = signals::install().unwrap();
    signals::prepare_child_env();

    // The child gets one bidirectional socket for stdin and stdout, asks
    // for the collapse, then writes through it.
    let (child_sock, agent_sock) = UnixStream::pair().unwrap();
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg("kill -USR1 $QREXEC_AGENT_PID; sleep 0.3; printf X")
        .stdin(Stdio::from(OwnedFd::from(child_sock.try_clone().unwrap())))
        .stdout(Stdio::from(OwnedFd::from(child_sock)))
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let pid = Pid::from_raw(child.id() as i32);

    let agent_clone = agent_sock.try_clone().unwrap();
    let mut session = Session::with_child(
        3,
        pid,
        OwnedFd::from(agent_sock),
        OwnedFd::from(agent_clone),
        None,
    );

    let worker = std::thread::spawn(move || {
        let mut vchan = StreamVchan::from_stream(a, 65536).unwrap();
        mux::run(&mut vchan, &mut session, &pipes).unwrap()
    });

    let (frames, exit) = peer.read_until_exit();
    let collapsed_output: Vec<u8> = frames
        .iter()
        .filter(|(ty, data)| *ty == MsgType::DataStdin && !data.is_empty())
        .flat_map(|(_, data)| data.iter().copied())
        .collect();
    assert_eq!(collapsed_output, b"X");
    assert_eq!(exit, 0);
    assert_eq!(worker.join().unwrap(), 0);
}

#[test]
fn service_connect_bridges_and_returns_remote_code() {
    let _guard = session_lock();
    let (a, b) = UnixStream::pair().unwrap();
    let mut peer = Peer::new(b);

    // Local "service": remote data lands in one pipe, local output comes
    // from another.
    let (in_rd, in_wr) = pipe_fds();
    let (out_rd, out_wr) = pipe_fds();

    let worker = std::thread::spawn(move || {
        let mut vchan = StreamVchan::from_stream(a, 65536).unwrap();
        run_service_session(
            &mut vchan,
            ServiceStdio {
                stdin: in_wr,
                stdout: out_rd,
                stderr: None,
            },
        )
        .unwrap()
    });

    peer.handshake();

    // Local output is framed with the reversed tag.
    let n = unsafe {
        libc::write(
            out_wr.as_raw_fd(),
            b"local".as_ptr() as *const libc::c_void,
            5,
        )
    };
    assert_eq!(n, 5);
    drop(out_wr);

    let mut local_seen = Vec::new();
    loop {
        let (hdr, payload) = peer.read_frame();
        assert_eq!(hdr.msg_type(), Some(MsgType::DataStdin));
        if payload.is_empty() {
            break;
        }
        local_seen.extend_from_slice(&payload);
    }
    assert_eq!(local_seen, b"local");

    // Remote data reaches the service's input descriptor.
    peer.send_frame(MsgType::DataStdin, b"remote");
    let mut buf = [0u8; 6];
    let n = unsafe {
        libc::read(
            in_rd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    assert_eq!(n, 6);
    assert_eq!(&buf, b"remote");

    peer.send_exit(3);
    assert_eq!(worker.join().unwrap(), 3);
}

#[test]
fn spawn_failure_degrades_to_remote_status() {
    let _guard = session_lock();
    let (mut vchan, mut peer) = vchan_pair();

    // A command line without the user separator never spawns; the session
    // runs with no local child and ends on the remote's exit report.
    let worker =
        std::thread::spawn(move || run_exec_session(&mut vchan, b"noColonHere").unwrap());

    peer.handshake();
    peer.send_exit(9);
    assert_eq!(worker.join().unwrap(), 9);
}

#[test]
fn session_without_child_yields_remote_status() {
    let _guard = session_lock();
    let (a, b) = UnixStream::pair().unwrap();
    let mut peer = Peer::new(b);

    let pipes = signals::install().unwrap();
    let worker = std::thread::spawn(move || {
        let mut vchan = StreamVchan::from_stream(a, 65536).unwrap();
        let mut session = Session::new(3);
        mux::run(&mut vchan, &mut session, &pipes).unwrap()
    });

    peer.send_exit(7);
    assert_eq!(worker.join().unwrap(), 7);
}
