// (c) 2025 Ross Younger

//! Inbound payload routing.
//!
//! [`Inbox`] is the session's [`DataSink`]: the link hands it every
//! in-order payload, and it decides — based on whether a receive file is
//! open — whether the bytes belong to that file or to the command string
//! currently being assembled. A zero-length payload marks the end of a
//! file; a NUL byte marks the end of a command. Either completion tells
//! the link to stop draining so the session layer can act.
//!
//! Commands are queued rather than handled inline: the acknowledgements
//! for the tail of a file we sent may well arrive bundled with the
//! confirmation string for that file, before anyone has asked for it.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::BytesMut;
use tracing::{error, trace};

use crate::files::RecvFile;
use crate::link::{DataSink, SinkFlow};

/// State of the file currently being received, if any.
pub(crate) struct ReceiveState {
    pub(crate) file: Box<dyn RecvFile>,
    /// Where the next in-order byte will land.
    offset: u64,
    /// Payload bytes accepted so far.
    pub(crate) bytes: u64,
    /// A write failed; we keep draining the link but will answer `CN5`.
    pub(crate) error: bool,
    /// The zero-length end-of-file payload has arrived.
    done: bool,
}

/// Routes inbound data to the open receive file or the command queue.
#[derive(Default)]
pub(crate) struct Inbox {
    /// Command string under assembly, continued across packets until its
    /// terminating NUL arrives.
    partial: BytesMut,
    commands: VecDeque<String>,
    receive: Option<ReceiveState>,
}

impl Inbox {
    /// Attaches a receive file; subsequent payloads are file data.
    pub(crate) fn open_receive(&mut self, file: Box<dyn RecvFile>) {
        debug_assert!(self.receive.is_none());
        self.receive = Some(ReceiveState {
            file,
            offset: 0,
            bytes: 0,
            error: false,
            done: false,
        });
    }

    /// Detaches the receive file once its end-of-file marker has arrived.
    /// Returns `None` while the transfer is still in progress.
    pub(crate) fn take_received(&mut self) -> Option<ReceiveState> {
        if self.receive.as_ref().is_some_and(|r| r.done) {
            self.receive.take()
        } else {
            None
        }
    }

    /// Detaches the receive file regardless of progress, for teardown.
    pub(crate) fn abort_receive(&mut self) -> Option<ReceiveState> {
        self.receive.take()
    }

    /// Next fully-assembled command string, if one is queued.
    pub(crate) fn pop_command(&mut self) -> Option<String> {
        self.commands.pop_front()
    }
}

#[async_trait]
impl DataSink for Inbox {
    async fn on_data(&mut self, first: &[u8], second: &[u8], pos: u64) -> SinkFlow {
        if let Some(receive) = &mut self.receive {
            let len = (first.len() + second.len()) as u64;
            if len == 0 {
                receive.done = true;
                return SinkFlow::Break;
            }
            if !receive.error {
                if pos != receive.offset {
                    trace!("receive file repositioned to {pos}");
                    if let Err(e) = receive.file.set_pos(pos).await {
                        error!("seek: {e}");
                        receive.error = true;
                    }
                }
                for span in [first, second] {
                    if span.is_empty() || receive.error {
                        continue;
                    }
                    if let Err(e) = receive.file.write(span).await {
                        error!("write: {e}");
                        receive.error = true;
                    }
                }
            }
            receive.offset = pos + len;
            receive.bytes += len;
            return SinkFlow::Continue;
        }

        // No file open: this is (part of) a command string. Anything after
        // the terminating NUL is discarded.
        for span in [first, second] {
            if let Some(nul) = span.iter().position(|&b| b == 0) {
                self.partial.extend_from_slice(&span[..nul]);
                let command = String::from_utf8_lossy(&self.partial).into_owned();
                trace!("got command \"{command}\"");
                self.partial.clear();
                self.commands.push_back(command);
                return SinkFlow::Break;
            }
            self.partial.extend_from_slice(span);
        }
        SinkFlow::Continue
    }
}
