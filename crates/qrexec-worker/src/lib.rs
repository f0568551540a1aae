//! Per-connection data mover for remote command execution between domains.
//!
//! Each accepted request gets a dedicated worker that bridges a data vchan
//! to a locally spawned command's stdin/stdout/stderr until both the local
//! child and the remote peer are finished, then reports the child's exit
//! status back over the vchan.
//!
//! The pieces, bottom up:
//! - [`vchan`] — the transport contract and a stream-backed implementation
//! - [`signals`] — SIGCHLD / SIGUSR1 self-pipes feeding the poll loop
//! - [`handshake`] — protocol version negotiation
//! - [`codec`] — frame encoder/decoder between the vchan and raw fds
//! - [`session`] — all per-connection state in one explicit value
//! - [`mux`] — the single-threaded poll loop that owns a session
//! - [`spawn`] — `user:command` parsing and child process setup
//! - [`dispatch`] — request validation and per-kind session drivers

pub mod buffer;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod mux;
pub mod session;
pub mod signals;
pub mod spawn;
pub mod vchan;

pub use dispatch::{handle_data_client, handle_new_process, run_worker, Request, RequestKind};
pub use error::{Error, Result};
pub use session::Session;
pub use vchan::{StreamVchan, Vchan};
