// (c) 2025 Ross Younger

//! The transfer session.
//!
//! A [`Session`] wraps a started [`Link`] and speaks the command grammar of
//! [`command`] over it. Within a session the peers alternate *master* and
//! *slave* roles per transfer: the master issues an `S`/`R`/`X` request,
//! the slave accepts or refuses it, and on acceptance the file data flows
//! over the link, ending with a zero-length packet and a `CY`/`CN5`
//! confirmation from whichever side received.
//!
//! A refusal is not a session error. It carries a disposition: some
//! refusals (`SN4`, `SN6`, `RN6`) mean "try again later, keep the work
//! queued"; the rest mean the request is hopeless and its work record
//! should be discarded. [`SendOutcome`]/[`ReceiveOutcome`] surface that
//! distinction to the work-queue layer driving the session.
//!
//! The session ends with a negotiated hangup: `H` from the side that has
//! run out of work, answered by `HN` (the peer has work of its own; roles
//! swap) or by the three-way `HY` exchange, after which each side sends a
//! link-level CLOSE and parts ways.

pub(crate) mod command;
mod inbox;


pub use command::{Command, CommandParseError, TransferRequest};

use tracing::{debug, error, trace, warn};

use crate::config::ProtoParams;
use crate::files::{FileStore, RecvFile, SendFile, TransferFailure};
use crate::link::{Link, LinkError, LinkStats};
use crate::port::LinkPort;

use inbox::Inbox;

/// Errors that tear a session down.
///
/// Refused or failed transfers are *not* errors — see [`SendOutcome`] and
/// [`ReceiveOutcome`]; these are the cases where the conversation itself
/// broke.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The link failed underneath us.
    #[error(transparent)]
    Link(#[from] LinkError),
    /// The peer answered a request with something unintelligible.
    #[error("bad response to {kind} request: \"{got}\"")]
    BadResponse {
        /// Which request we had issued.
        kind: &'static str,
        /// What came back.
        got: String,
    },
    /// Reading the file being sent failed. The protocol has no way to
    /// signal this mid-transfer, so the link is torn down.
    #[error("read: {0}")]
    Read(#[from] std::io::Error),
}

/// How a send ended.
#[derive(Debug)]
pub enum SendOutcome {
    /// The peer confirmed the file was stored (`CY`).
    Delivered {
        /// Payload bytes transmitted.
        bytes: u64,
    },
    /// The peer received the data but could not move it into its final
    /// location (`CN5`).
    NotStored {
        /// Payload bytes transmitted.
        bytes: u64,
    },
    /// The peer's confirmation was missing or unintelligible.
    Unconfirmed {
        /// Payload bytes transmitted.
        bytes: u64,
    },
    /// The request was refused up front (`SN*`).
    Refused {
        /// Why, per the peer.
        failure: TransferFailure,
    },
}

/// How a receive ended.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// The file arrived and was stored; we confirmed with `CY`.
    Received {
        /// Payload bytes accepted.
        bytes: u64,
    },
    /// The file arrived but could not be written or stored; we answered
    /// `CN5`.
    NotStored {
        /// Payload bytes accepted (including any that could not be written).
        bytes: u64,
    },
    /// The request was refused up front (`RN*`).
    Refused {
        /// Why, per the peer.
        failure: TransferFailure,
    },
}

/// How an execution request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// `XY` — the peer took the work.
    Accepted,
    /// `XN` — the peer declined it.
    Denied,
}

/// What [`Session::next_command`] surfaced.
#[derive(Debug)]
pub enum SessionEvent {
    /// A request from the peer (acting as master) for us to handle.
    Command(Command),
    /// The peer asked to hang up; answer with
    /// [`reply_hangup`](Session::reply_hangup).
    HangupRequested,
    /// A hangup we had requested was confirmed and the link is now shut
    /// down. The session is over.
    HangupComplete,
}

/// Which of the peer's requests we are refusing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// An `S` request (peer wanted to send to us).
    Send,
    /// An `R` request (peer wanted to fetch from us).
    Receive,
    /// An `X` request.
    Execute,
}

/// What [`Session::serve_next`] did on behalf of the peer.
#[derive(Debug)]
pub enum ServeOutcome {
    /// The peer sent us a file.
    Received {
        /// The request that was served.
        request: TransferRequest,
        /// How the receive ended.
        outcome: ReceiveOutcome,
    },
    /// The peer fetched a file from us.
    Sent {
        /// The request that was served.
        request: TransferRequest,
        /// How the send ended.
        outcome: SendOutcome,
    },
    /// The store refused the request and the peer was told so.
    Refused {
        /// The request that was refused.
        request: TransferRequest,
        /// Why.
        failure: TransferFailure,
    },
    /// The peer issued an execution request; accept it with
    /// [`confirm_execute`](Session::confirm_execute) or decline with
    /// [`refuse`](Session::refuse).
    ExecuteRequested(TransferRequest),
    /// The peer asked to hang up.
    HangupRequested,
    /// Our own earlier hangup request completed; the link is shut down.
    HangupComplete,
}

/// One file-transfer conversation over a reliable link. See the
/// [module docs](self).
pub struct Session<P: LinkPort> {
    link: Link<P>,
    inbox: Inbox,
}

impl<P: LinkPort> Session<P> {
    /// Brings up the link over `port` and wraps it in a session.
    ///
    /// `caller` must be true on exactly one end: the one that placed the
    /// connection.
    pub async fn start(port: P, params: ProtoParams, caller: bool) -> Result<Self, SessionError> {
        let mut inbox = Inbox::default();
        let link = Link::start(port, params, caller, &mut inbox).await?;
        Ok(Self { link, inbox })
    }

    /// A snapshot of the link's traffic counters.
    #[must_use]
    pub fn stats(&self) -> LinkStats {
        self.link.stats()
    }

    /// Sends a file to the peer.
    ///
    /// As master we issue the `S` request and proceed only on `SY`; as
    /// slave we are answering the peer's `R` request and open with
    /// `RY 0mode`. Either way the file then streams out, ending with a
    /// zero-length packet, and the peer's `CY`/`CN5` confirmation decides
    /// the outcome.
    pub async fn send_file(
        &mut self,
        master: bool,
        request: &TransferRequest,
        mut file: Box<dyn SendFile>,
    ) -> Result<SendOutcome, SessionError> {
        if master {
            let cmd = Command::Send(request.clone()).to_string();
            self.link.send_cmd(&cmd, &mut self.inbox).await?;

            let reply = self.next_raw_command().await?;
            match reply.parse::<Command>() {
                Ok(Command::SendAccepted) => {}
                Ok(Command::SendRefused(failure)) => {
                    match failure {
                        TransferFailure::WorkSpace => error!(
                            "can't send {}: remote cannot create work files",
                            request.from
                        ),
                        TransferFailure::Size => {
                            error!("{} is too big to send now", request.from);
                        }
                        TransferFailure::Permission => {
                            error!("can't send {}: permission denied", request.from);
                        }
                        TransferFailure::Other => {
                            error!("can't send {}: unknown reason", request.from);
                        }
                    }
                    return Ok(SendOutcome::Refused { failure });
                }
                _ => {
                    error!("bad response to send request");
                    return Err(SessionError::BadResponse {
                        kind: "send",
                        got: reply,
                    });
                }
            }
        } else {
            let cmd = Command::ReceiveAccepted {
                mode: request.mode,
            }
            .to_string();
            self.link.send_cmd(&cmd, &mut self.inbox).await?;
        }

        // The transfer proper: read straight into link-owned packet space.
        // Passing the file offset along lets the link emit an SPOS whenever
        // its stream position and ours diverge (always true for the first
        // packet, since the request commands advanced the stream).
        let mut offset = 0u64;
        loop {
            let space = self.link.get_space();
            let n = file.read(space).await.inspect_err(|e| error!("read: {e}"))?;
            self.link
                .send_data(n, Some(offset), &mut self.inbox)
                .await?;
            offset += n as u64;
            if n == 0 {
                debug!("sent {offset} bytes, awaiting confirmation");
                return self.confirm_sent(offset).await;
            }
        }
    }

    /// The peer's verdict on a file we just finished sending.
    async fn confirm_sent(&mut self, bytes: u64) -> Result<SendOutcome, SessionError> {
        let reply = self.next_raw_command().await?;
        match reply.parse::<Command>() {
            Ok(Command::Stored) => Ok(SendOutcome::Delivered { bytes }),
            Ok(Command::NotStored) => {
                error!("file could not be stored in final location");
                Ok(SendOutcome::NotStored { bytes })
            }
            _ => {
                error!("bad confirmation for sent file");
                Ok(SendOutcome::Unconfirmed { bytes })
            }
        }
    }

    /// Receives a file from the peer.
    ///
    /// As master we issue the `R` request and proceed on `RY 0mode`; as
    /// slave we are answering the peer's `S` request and open with `SY`.
    /// Inbound data is written to `file` as it arrives; write errors do
    /// not stop the transfer (the link must be drained either way) but
    /// down-grade the confirmation to `CN5`.
    pub async fn receive_file(
        &mut self,
        master: bool,
        request: &TransferRequest,
        file: Box<dyn RecvFile>,
    ) -> Result<ReceiveOutcome, SessionError> {
        let mode;
        if master {
            let cmd = Command::Receive(request.clone()).to_string();
            self.link.send_cmd(&cmd, &mut self.inbox).await?;

            let reply = self.next_raw_command().await?;
            match reply.parse::<Command>() {
                Ok(Command::ReceiveAccepted { mode: m }) => mode = m,
                Ok(Command::ReceiveRefused(failure)) => {
                    match failure {
                        TransferFailure::Size => error!("{} is too big to receive", request.from),
                        TransferFailure::Permission => {
                            error!("can't receive {}: no such file", request.from);
                        }
                        TransferFailure::WorkSpace | TransferFailure::Other => {
                            error!("can't receive {}: unknown reason", request.from);
                        }
                    }
                    file.discard().await;
                    return Ok(ReceiveOutcome::Refused { failure });
                }
                _ => {
                    error!("bad response to receive request");
                    file.discard().await;
                    return Err(SessionError::BadResponse {
                        kind: "receive",
                        got: reply,
                    });
                }
            }
        } else {
            self.link
                .send_cmd(&Command::SendAccepted.to_string(), &mut self.inbox)
                .await?;
            mode = request.mode;
        }

        self.inbox.open_receive(file);
        loop {
            if let Err(e) = self.link.wait(&mut self.inbox).await {
                // Tear-down: don't leave a half-written temporary behind.
                if let Some(state) = self.inbox.abort_receive() {
                    state.file.discard().await;
                }
                return Err(e.into());
            }
            if let Some(state) = self.inbox.take_received() {
                return Ok(self.finish_receive(state, mode).await?);
            }
        }
    }

    /// Commits (or discards) a completed receive and sends the `CY`/`CN5`
    /// confirmation.
    async fn finish_receive(
        &mut self,
        state: inbox::ReceiveState,
        mode: u32,
    ) -> Result<ReceiveOutcome, LinkError> {
        let bytes = state.bytes;
        let stored = if state.error {
            state.file.discard().await;
            false
        } else {
            match state.file.commit(mode).await {
                Ok(()) => true,
                Err(e) => {
                    error!("could not store file in final location: {e}");
                    false
                }
            }
        };
        let confirm = if stored {
            Command::Stored
        } else {
            Command::NotStored
        };
        self.link
            .send_cmd(&confirm.to_string(), &mut self.inbox)
            .await?;
        debug!("received {bytes} bytes, stored: {stored}");
        if stored {
            Ok(ReceiveOutcome::Received { bytes })
        } else {
            Ok(ReceiveOutcome::NotStored { bytes })
        }
    }

    /// Issues an `X` request asking the peer to execute a transfer on our
    /// behalf (e.g. to forward a file onward).
    pub async fn request_execute(
        &mut self,
        request: &TransferRequest,
    ) -> Result<ExecOutcome, SessionError> {
        let cmd = Command::Execute(request.clone()).to_string();
        self.link.send_cmd(&cmd, &mut self.inbox).await?;

        let reply = self.next_raw_command().await?;
        match reply.parse::<Command>() {
            Ok(Command::ExecuteAccepted) => Ok(ExecOutcome::Accepted),
            Ok(Command::ExecuteRefused) => {
                error!("work request denied");
                Ok(ExecOutcome::Denied)
            }
            _ => {
                error!("bad response to wildcard request");
                Err(SessionError::BadResponse {
                    kind: "wildcard",
                    got: reply,
                })
            }
        }
    }

    /// Accepts a peer's `X` request.
    pub async fn confirm_execute(&mut self) -> Result<(), SessionError> {
        self.link
            .send_cmd(&Command::ExecuteAccepted.to_string(), &mut self.inbox)
            .await?;
        Ok(())
    }

    /// Refuses a peer's request with the appropriate `SN`/`RN`/`XN` reply.
    pub async fn refuse(
        &mut self,
        kind: RequestKind,
        failure: TransferFailure,
    ) -> Result<(), SessionError> {
        let reply = match kind {
            RequestKind::Send => Command::SendRefused(failure),
            RequestKind::Receive => Command::ReceiveRefused(failure),
            RequestKind::Execute => Command::ExecuteRefused,
        };
        self.link
            .send_cmd(&reply.to_string(), &mut self.inbox)
            .await?;
        Ok(())
    }

    /// Proposes hanging up. The peer's answer arrives through
    /// [`next_command`](Self::next_command): `HN` is swallowed there (the
    /// request counts as denied), `HY` completes the handshake.
    pub async fn request_hangup(&mut self) -> Result<(), SessionError> {
        self.link
            .send_cmd(&Command::Hangup.to_string(), &mut self.inbox)
            .await?;
        Ok(())
    }

    /// Answers a peer's hangup request. Denying sends `HN`; confirming
    /// runs our half of the three-way `HY` exchange and shuts the link
    /// down.
    pub async fn reply_hangup(&mut self, confirm: bool) -> Result<(), SessionError> {
        if !confirm {
            self.link
                .send_cmd(&Command::HangupNo.to_string(), &mut self.inbox)
                .await?;
            return Ok(());
        }

        self.link
            .send_cmd(&Command::HangupYes.to_string(), &mut self.inbox)
            .await?;
        self.link.expect_close();
        let reply = self.next_raw_command().await?;
        if reply == "HY" {
            self.link
                .send_cmd(&Command::HangupYes.to_string(), &mut self.inbox)
                .await?;
        } else {
            error!("got \"{reply}\" when expecting \"HY\"");
        }
        self.link.shutdown().await?;
        Ok(())
    }

    /// Waits for the peer's next command, handling hangup traffic
    /// specially (see [`SessionEvent`]).
    pub async fn next_command(&mut self, master: bool) -> Result<SessionEvent, SessionError> {
        loop {
            let raw = self.next_raw_command().await?;
            let Ok(cmd) = raw.parse::<Command>() else {
                warn!("ignoring unparseable command \"{raw}\"");
                continue;
            };
            match cmd {
                Command::HangupNo => {
                    // The peer denied a hangup; the work loop treats
                    // requests as denied until told otherwise, so there is
                    // nothing to do.
                    if master {
                        error!("Got hangup reply as master");
                    }
                }
                Command::HangupYes => {
                    if master {
                        error!("Got hangup reply as master");
                    }
                    // Complete the three-way exchange. The peer may hang up
                    // in a hurry, so errors past this point end the session
                    // rather than raising them.
                    if self
                        .link
                        .send_cmd(&Command::HangupYes.to_string(), &mut self.inbox)
                        .await
                        .is_err()
                    {
                        return Ok(SessionEvent::HangupComplete);
                    }
                    self.link.expect_close();
                    match self.next_raw_command().await {
                        Ok(reply) if reply == "HY" => {}
                        Ok(reply) => error!("got \"{reply}\" when expecting \"HY\""),
                        Err(e) => {
                            debug!("peer hung up early: {e}");
                            return Ok(SessionEvent::HangupComplete);
                        }
                    }
                    let _ = self.link.shutdown().await;
                    return Ok(SessionEvent::HangupComplete);
                }
                Command::Hangup => return Ok(SessionEvent::HangupRequested),
                other => return Ok(SessionEvent::Command(other)),
            }
        }
    }

    /// Serves the peer's next request out of `store`: opens the file it
    /// names, accepts or refuses, and runs the transfer.
    ///
    /// This is the slave half of a work loop; drive it repeatedly until it
    /// reports a hangup event.
    pub async fn serve_next<F: FileStore>(
        &mut self,
        store: &F,
    ) -> Result<ServeOutcome, SessionError> {
        loop {
            let event = match self.next_command(false).await? {
                SessionEvent::HangupRequested => return Ok(ServeOutcome::HangupRequested),
                SessionEvent::HangupComplete => return Ok(ServeOutcome::HangupComplete),
                SessionEvent::Command(cmd) => cmd,
            };
            match event {
                Command::Send(request) => {
                    // The peer sends; we receive.
                    return match store.open_recv(&request).await {
                        Ok(file) => {
                            let outcome = self.receive_file(false, &request, file).await?;
                            Ok(ServeOutcome::Received { request, outcome })
                        }
                        Err(failure) => {
                            self.refuse(RequestKind::Send, failure).await?;
                            Ok(ServeOutcome::Refused { request, failure })
                        }
                    };
                }
                Command::Receive(request) => {
                    // The peer receives; we send.
                    let handle = match store.open_send(&request).await {
                        Ok(h) => h,
                        Err(failure) => {
                            self.refuse(RequestKind::Receive, failure).await?;
                            return Ok(ServeOutcome::Refused { request, failure });
                        }
                    };
                    // A size-bearing R names the most the peer will take.
                    if let Some(max) = request.size {
                        if handle.size > max {
                            self.refuse(RequestKind::Receive, TransferFailure::Size)
                                .await?;
                            return Ok(ServeOutcome::Refused {
                                request,
                                failure: TransferFailure::Size,
                            });
                        }
                    }
                    let mut accepted = request.clone();
                    accepted.mode = handle.mode;
                    let outcome = self.send_file(false, &accepted, handle.file).await?;
                    return Ok(ServeOutcome::Sent {
                        request: accepted,
                        outcome,
                    });
                }
                Command::Execute(request) => {
                    return Ok(ServeOutcome::ExecuteRequested(request));
                }
                other => {
                    warn!("ignoring unexpected command {other}");
                }
            }
        }
    }

    /// Blocks until the peer's next complete command string arrives.
    async fn next_raw_command(&mut self) -> Result<String, SessionError> {
        loop {
            if let Some(cmd) = self.inbox.pop_command() {
                trace!("next command \"{cmd}\"");
                return Ok(cmd);
            }
            self.link.wait(&mut self.inbox).await?;
        }
    }
}
