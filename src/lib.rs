// (c) 2025 Ross Younger

#![allow(clippy::doc_markdown)]
//! Store-and-forward file transfer between two peer nodes over an
//! unreliable byte-stream link (serial line, modem, pseudo-terminal).
//!
//! ## Overview
//!
//! `sfcp` is the transfer *core* of a spooled file-exchange system: two
//! daemons connect over a raw full-duplex byte stream and move queued
//! files in both directions, surviving line noise without corrupting a
//! byte. The crate is a stack of two tightly coupled layers:
//!
//! * The [link] layer frames bytes into numbered, checksummed
//!   [packets](protocol), retransmits on loss, enforces a sliding send
//!   window, and presents a reliable ordered channel.
//! * The [session] layer exchanges ASCII commands over that channel to
//!   negotiate transfers (`S`/`R`/`X` requests with `SY`/`SN`-style
//!   replies), streams file data, confirms arrival (`CY`/`CN5`), and
//!   negotiates hangup.
//!
//! Everything else a full system needs — spool and work-queue management,
//! configuration files, dialing and login chat, the real serial port — is
//! deliberately someone else's job, reached through the narrow seams in
//! [port] and [files].
//!
//! ## A minimal exchange
//!
//! ```no_run
//! # async fn demo<P: sfcp::LinkPort>(port: P) -> anyhow::Result<()> {
//! use sfcp::{FileStore as _, FsStore, ProtoParams, Session, TransferRequest};
//!
//! // The calling side:
//! let mut session = Session::start(port, ProtoParams::default(), true).await?;
//! let store = FsStore::default();
//! let request = TransferRequest {
//!     from: "/var/spool/out/report.dat".into(),
//!     to: "/var/spool/in/report.dat".into(),
//!     user: "news".into(),
//!     ..Default::default()
//! };
//! let handle = store.open_send(&request).await.expect("local open");
//! let outcome = session.send_file(true, &request, handle.file).await?;
//! println!("{outcome:?}");
//! session.request_hangup().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The called side runs [`Session::serve_next`] in a loop, letting its
//! [`FileStore`] accept or refuse each request.

pub mod config;
pub mod files;
pub mod link;
pub mod port;
pub mod protocol;
pub mod session;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::ProtoParams;
pub use files::{FileStore, FsStore, RecvFile, SendFile, SendHandle, TransferFailure};
pub use link::{DataSink, Link, LinkError, LinkStats, SinkFlow};
pub use port::{LinkPort, PortError, PortIo};
pub use session::{
    Command, CommandParseError, ExecOutcome, ReceiveOutcome, RequestKind, SendOutcome,
    ServeOutcome, Session, SessionError, SessionEvent, TransferRequest,
};
