// (c) 2025 Ross Younger

//! The sliding-window link layer.
//!
//! [`Link`] turns an unreliable byte [port](crate::port) into a reliable,
//! ordered, full-duplex packet channel. It owns all protocol state: the
//! sequence numbers, the 32-slot send and receive buffer arrays, the
//! receive ring, the checksum machinery and the retransmission logic.
//!
//! The session layer above drives it through a handful of operations —
//! [`get_space`](Link::get_space)/[`send_data`](Link::send_data) for
//! zero-copy transmission, [`send_cmd`](Link::send_cmd) for NUL-terminated
//! command strings, [`wait`](Link::wait) to make progress when there is
//! nothing to transmit — and receives inbound payloads through the
//! [`DataSink`] upcall.
//!
//! Flow control is windowed: a sender may have at most `window` unacked
//! packets outstanding. Acknowledgements are piggybacked on every outgoing
//! header; a standalone ACK is emitted only once half a window has gone
//! unacknowledged, which keeps the reverse channel quiet during bulk
//! transfers. Loss is repaired by NAKs (from the receiver, on checksum
//! failure or a sequence gap) and by timeout-driven retransmission of the
//! oldest unacked packet.

mod ring;

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, trace};

use crate::config::ProtoParams;
use crate::port::{LinkPort, PortError};
use crate::protocol::crc::Crc32;
use crate::protocol::packet::{
    self, HEADER_LEN, INTRO, MAX_SEQ, PacketHeader, PacketKind, TRAILER_LEN, next_seq, seq_diff,
};

use ring::Ring;

/// Smallest packet size the startup allocation fallback will shrink to.
const MIN_PACKET_SIZE: usize = 200;

/// Errors raised by the link layer.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The port failed underneath us.
    #[error(transparent)]
    Port(#[from] PortError),
    /// No packet arrived within the retry budget.
    #[error("timed out waiting for packet")]
    Timeout,
    /// The running fault count exceeded the configured error budget.
    #[error("too many protocol errors")]
    TooManyErrors,
    /// The SYNC exchange never completed, or buffers could not be set up.
    #[error("protocol startup failed")]
    StartupFailed,
    /// A SYNC packet arrived with a truncated parameter payload.
    #[error("bad SYNC packet")]
    BadSync,
    /// The peer closed the link while we were not shutting down.
    #[error("received unexpected CLOSE packet")]
    UnexpectedClose,
}

/// Tells the link what to do after a payload delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFlow {
    /// Keep draining.
    Continue,
    /// A complete session-level unit (command or file) has been assembled;
    /// return control to the session layer once buffered input is drained.
    Break,
}

/// Upcall interface for in-order payload delivery.
///
/// The payload arrives as two spans because it may wrap the receive ring;
/// the second span is usually empty. Neither span outlives the call. `pos`
/// is the file offset of the first byte, as steered by SPOS packets.
#[async_trait]
pub trait DataSink: Send {
    async fn on_data(&mut self, first: &[u8], second: &[u8], pos: u64) -> SinkFlow;
}

/// Link traffic and fault counters.
///
/// Snapshots are cheap; diff two of them to meter a single transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// DATA packets transmitted (retransmissions not included).
    pub sent: u64,
    /// Valid payload-bearing packets received.
    pub received: u64,
    /// Packets retransmitted, whether by NAK or by timeout.
    pub resent: u64,
    /// Headers that failed the XOR check or carried our own caller flag.
    pub bad_hdr: u64,
    /// Payloads whose CRC trailer did not verify.
    pub bad_cksum: u64,
    /// Sequenced packets outside the receive window.
    pub bad_order: u64,
    /// NAKs received from the peer.
    pub remote_rejects: u64,
}

/// A packet received ahead of sequence, parked until the gap fills.
struct Stashed {
    header: PacketHeader,
    payload: Vec<u8>,
}

/// Outcome of one drain of the receive ring.
struct Drained {
    /// A delivery or control packet asked us to return to the caller.
    exit: bool,
    /// How many more bytes the decoder needs to make progress.
    need: usize,
}

/// What a [`Link::wait_for_packet`] call is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Until {
    /// A session-level unit completed (command, file, SYNC, CLOSE).
    Exit,
    /// The send window has room again (a blocked sender; piggybacked acks
    /// on anything inbound can open it).
    WindowOpen,
}

/// Reliable packet link over a byte port. See the [module docs](self).
pub struct Link<P: LinkPort> {
    port: P,
    params: ProtoParams,
    /// True on the end that initiated the connection. Stamped into every
    /// header and used to reject reflections of our own traffic.
    caller: bool,

    ring: Ring,

    /// Next sequence number to assign to an outgoing sequenced packet.
    send_seq: u8,
    /// Highest sequence received contiguously from the peer.
    recv_seq: u8,
    /// Latest sequence we have acknowledged to the peer.
    local_ack: u8,
    /// Latest of our sequences the peer has acknowledged.
    remote_ack: u8,
    /// File position our outgoing DATA stream is at.
    send_pos: u64,
    /// File position the peer's DATA stream is at.
    recv_pos: u64,
    /// Set once shutdown has begun; an inbound CLOSE is then expected.
    closing: bool,
    /// Set once any SYNC has been received.
    sync_seen: bool,

    /// Peer's announced (or locally forced) maximum payload size.
    remote_packet_size: usize,
    /// Peer's announced (or locally forced) window.
    remote_window: u8,
    forced_packet_size: usize,
    forced_window: u8,

    /// One slot per sequence number; each packet stays intact in its slot
    /// until the sequence space wraps back around, which the window
    /// guarantees cannot happen before it was acknowledged.
    send_buffers: Vec<Vec<u8>>,
    stash: [Option<Stashed>; MAX_SEQ as usize],
    /// Which awaited sequences we have already NAKed, to suppress duplicates.
    naked: [bool; MAX_SEQ as usize],

    stats: LinkStats,
}

impl<P: LinkPort> Link<P> {
    /// Starts the protocol: exchanges SYNC packets announcing our packet
    /// size and window, adopts the peer's announcement, and sets up the
    /// send buffers.
    ///
    /// Inbound non-SYNC traffic during startup (possible if the peer got
    /// ahead of us) is delivered through `sink` as usual.
    pub async fn start<S: DataSink>(
        port: P,
        params: ProtoParams,
        caller: bool,
        sink: &mut S,
    ) -> Result<Self, LinkError> {
        let params = params.sanitized();
        let forced_packet_size = usize::from(params.remote_packet_size);
        let forced_window = params.remote_window;

        let mut link = Self {
            port,
            caller,
            ring: Ring::new(),
            send_seq: 1,
            recv_seq: 0,
            local_ack: 0,
            remote_ack: 0,
            send_pos: 0,
            recv_pos: 0,
            closing: false,
            sync_seen: false,
            remote_packet_size: forced_packet_size,
            remote_window: forced_window,
            forced_packet_size,
            forced_window,
            send_buffers: Vec::new(),
            stash: [const { None }; MAX_SEQ as usize],
            naked: [false; MAX_SEQ as usize],
            stats: LinkStats::default(),
            params,
        };

        // Our SYNC: 3-byte payload of max packet size (big-endian) and window.
        let size_bytes = link.params.packet_size.to_be_bytes();
        let payload = [size_bytes[0], size_bytes[1], link.params.window];
        let header = PacketHeader {
            kind: PacketKind::Sync,
            caller,
            local_seq: 0,
            local_chan: 0,
            remote_seq: 0,
            remote_chan: 0,
            len: 3,
        };
        let mut sync = [0u8; HEADER_LEN + 3 + TRAILER_LEN];
        sync[..HEADER_LEN].copy_from_slice(&header.encode());
        sync[HEADER_LEN..HEADER_LEN + 3].copy_from_slice(&payload);
        let mut crc = Crc32::new();
        crc.update(&payload);
        sync[HEADER_LEN + 3..].copy_from_slice(&crc.value().to_be_bytes());

        let sync_timeout = link.params.sync_timeout();
        let mut tries = 0;
        loop {
            trace!(
                "sending SYNC packsize {} winsize {}",
                link.params.packet_size, link.params.window
            );
            Self::pump_out(&mut link.port, &mut link.ring, &sync).await?;

            match link.wait_for_packet(sync_timeout, 0, Until::Exit, sink).await {
                Ok(()) if link.sync_seen => break,
                Ok(()) => {}
                Err(LinkError::Timeout) => {
                    tries += 1;
                    if tries > link.params.sync_retries {
                        error!("protocol startup failed");
                        return Err(LinkError::StartupFailed);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // Set up 32 send buffers sized for the negotiated packet; on
        // allocation failure halve the packet size and try again.
        loop {
            if link.alloc_send_buffers() {
                break;
            }
            if link.remote_packet_size / 2 > MIN_PACKET_SIZE {
                link.remote_packet_size /= 2;
            } else {
                error!("protocol startup failed; insufficient memory for packets");
                return Err(LinkError::StartupFailed);
            }
        }

        debug!(
            "protocol started; remote packsize {} winsize {}",
            link.remote_packet_size, link.remote_window
        );
        Ok(link)
    }

    fn alloc_send_buffers(&mut self) -> bool {
        let size = HEADER_LEN + self.remote_packet_size + TRAILER_LEN;
        let mut buffers = Vec::new();
        if buffers.try_reserve_exact(usize::from(MAX_SEQ)).is_err() {
            return false;
        }
        for _ in 0..MAX_SEQ {
            let mut buf = Vec::new();
            if buf.try_reserve_exact(size).is_err() {
                return false;
            }
            buf.resize(size, 0);
            buffers.push(buf);
        }
        self.send_buffers = buffers;
        true
    }

    /// Shuts the link down: sends a CLOSE packet and logs the session's
    /// packet statistics. Does not wait for anything — the session-level
    /// hangup exchange has already drained the line.
    pub async fn shutdown(&mut self) -> Result<(), LinkError> {
        self.closing = true;

        let header = PacketHeader {
            kind: PacketKind::Close,
            caller: self.caller,
            local_seq: self.send_seq,
            local_chan: 0,
            remote_seq: self.recv_seq,
            remote_chan: 0,
            len: 0,
        };
        self.local_ack = self.recv_seq;
        trace!("sending CLOSE");
        let bytes = header.encode();
        Self::pump_out(&mut self.port, &mut self.ring, &bytes).await?;

        info!(
            "packets: sent {}, resent {}, received {}",
            self.stats.sent, self.stats.resent, self.stats.received
        );
        if self.stats.bad_hdr != 0
            || self.stats.bad_cksum != 0
            || self.stats.bad_order != 0
            || self.stats.remote_rejects != 0
        {
            info!(
                "errors: header {}, checksum {}, order {}, remote rejects {}",
                self.stats.bad_hdr, self.stats.bad_cksum, self.stats.bad_order,
                self.stats.remote_rejects
            );
        }
        Ok(())
    }

    /// A snapshot of the traffic counters.
    #[must_use]
    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Marks an inbound CLOSE as expected from here on.
    ///
    /// The session calls this once a hangup has been agreed, so that a peer
    /// shutting down promptly is not mistaken for a failure.
    pub fn expect_close(&mut self) {
        self.closing = true;
    }

    /// Whether the peer has acknowledged everything we sent.
    #[must_use]
    pub fn all_acked(&self) -> bool {
        next_seq(self.remote_ack) == self.send_seq
    }

    /// Borrows the payload region of the next outgoing packet's buffer.
    ///
    /// The caller writes payload bytes directly into the returned slice
    /// (saving a copy) and then calls [`send_data`](Self::send_data) with
    /// the number of bytes used. The slice is exactly the negotiated
    /// packet size long.
    pub fn get_space(&mut self) -> &mut [u8] {
        let seq = usize::from(self.send_seq);
        &mut self.send_buffers[seq][HEADER_LEN..HEADER_LEN + self.remote_packet_size]
    }

    /// Transmits `len` bytes previously written via
    /// [`get_space`](Self::get_space) as a DATA packet.
    ///
    /// When `pos` is given and differs from the current send position, an
    /// SPOS packet is emitted first so the receiver seeks before writing.
    /// Blocks (processing inbound traffic the while) if the send window is
    /// full.
    pub async fn send_data<S: DataSink>(
        &mut self,
        len: usize,
        pos: Option<u64>,
        sink: &mut S,
    ) -> Result<(), LinkError> {
        debug_assert!(len <= self.remote_packet_size);

        if let Some(p) = pos {
            if p != self.send_pos {
                self.send_spos(p).await?;
            }
        }

        // The payload checksum can be computed now; the header has to wait
        // until the window opens, so its piggybacked ack is fresh.
        let seq = usize::from(self.send_seq);
        if len > 0 {
            let mut crc = Crc32::new();
            crc.update(&self.send_buffers[seq][HEADER_LEN..HEADER_LEN + len]);
            self.send_buffers[seq][HEADER_LEN + len..HEADER_LEN + len + TRAILER_LEN]
                .copy_from_slice(&crc.value().to_be_bytes());
        }

        if self.remote_window > 0 {
            while seq_diff(self.send_seq, self.remote_ack) > self.remote_window {
                trace!("waiting for ACK");
                self.wait_for_packet(
                    self.params.timeout(),
                    self.params.retries,
                    Until::WindowOpen,
                    sink,
                )
                .await?;
            }
        }

        #[allow(clippy::cast_possible_truncation)] // bounded by the packet size
        let wire_len = len as u16;
        let header = PacketHeader {
            kind: PacketKind::Data,
            caller: self.caller,
            local_seq: self.send_seq,
            local_chan: 0,
            remote_seq: self.recv_seq,
            remote_chan: 0,
            len: wire_len,
        };
        self.send_buffers[seq][..HEADER_LEN].copy_from_slice(&header.encode());
        self.local_ack = self.recv_seq;

        trace!("sending packet {} ({} bytes)", self.send_seq, len);
        self.send_seq = next_seq(self.send_seq);
        self.stats.sent += 1;

        let total = HEADER_LEN + len + if len > 0 { TRAILER_LEN } else { 0 };
        Self::pump_out(
            &mut self.port,
            &mut self.ring,
            &self.send_buffers[seq][..total],
        )
        .await?;
        self.send_pos += len as u64;

        // The port may have deposited inbound bytes while we were pushing;
        // drain them opportunistically.
        if !self.ring.is_empty() {
            let _ = self.process_data(sink).await?;
        }
        Ok(())
    }

    /// Sends a command string, fragmented into packets as necessary. The
    /// final fragment carries the terminating NUL that marks end-of-command
    /// on the far side.
    pub async fn send_cmd<S: DataSink>(&mut self, cmd: &str, sink: &mut S) -> Result<(), LinkError> {
        trace!("sending command \"{cmd}\"");
        let bytes = cmd.as_bytes();
        let mut at = 0;
        loop {
            let space = self.get_space();
            let size = space.len();
            let remaining = bytes.len() - at;
            if remaining < size {
                space[..remaining].copy_from_slice(&bytes[at..]);
                space[remaining] = 0;
                return self.send_data(remaining + 1, None, sink).await;
            }
            space[..size].copy_from_slice(&bytes[at..at + size]);
            self.send_data(size, None, sink).await?;
            at += size;
        }
    }

    /// Waits for inbound traffic, using the configured timeout and retry
    /// budget. Returns once a delivery or control packet signals that the
    /// session layer has something to act on.
    pub async fn wait<S: DataSink>(&mut self, sink: &mut S) -> Result<(), LinkError> {
        self.wait_for_packet(self.params.timeout(), self.params.retries, Until::Exit, sink)
            .await
    }

    /// Emits an SPOS packet repositioning the peer's receive file.
    async fn send_spos(&mut self, pos: u64) -> Result<(), LinkError> {
        // The caller has already filled the current sequence slot with
        // payload, but the SPOS must go out under that sequence number.
        // Swap the slots so the data moves to the following one.
        let cur = usize::from(self.send_seq);
        let nxt = usize::from(next_seq(self.send_seq));
        self.send_buffers.swap(cur, nxt);

        let header = PacketHeader {
            kind: PacketKind::Spos,
            caller: self.caller,
            local_seq: self.send_seq,
            local_chan: 0,
            remote_seq: self.recv_seq,
            remote_chan: 0,
            len: 4,
        };
        self.local_ack = self.recv_seq;
        #[allow(clippy::cast_possible_truncation)] // wire positions are 32-bit
        let wire_pos = (pos as u32).to_be_bytes();
        let mut crc = Crc32::new();
        crc.update(&wire_pos);

        let buf = &mut self.send_buffers[cur];
        buf[..HEADER_LEN].copy_from_slice(&header.encode());
        buf[HEADER_LEN..HEADER_LEN + 4].copy_from_slice(&wire_pos);
        buf[HEADER_LEN + 4..HEADER_LEN + 8].copy_from_slice(&crc.value().to_be_bytes());

        trace!("sending SPOS {pos}");
        Self::pump_out(
            &mut self.port,
            &mut self.ring,
            &self.send_buffers[cur][..HEADER_LEN + 4 + TRAILER_LEN],
        )
        .await?;

        self.send_seq = next_seq(self.send_seq);
        self.send_pos = pos;
        Ok(())
    }

    /// Sends a NAK requesting resend of `seq`, and records it so the same
    /// sequence is not NAKed again while we wait.
    async fn send_nak(&mut self, seq: u8) -> Result<(), LinkError> {
        let header = PacketHeader {
            kind: PacketKind::Nak,
            caller: self.caller,
            local_seq: seq,
            local_chan: 0,
            remote_seq: self.recv_seq,
            remote_chan: 0,
            len: 0,
        };
        self.local_ack = self.recv_seq;
        self.naked[usize::from(seq)] = true;
        trace!("sending NAK {seq}");
        let bytes = header.encode();
        Self::pump_out(&mut self.port, &mut self.ring, &bytes).await
    }

    /// Retransmits the packet parked in slot `seq`, re-stamping its
    /// piggybacked ack first.
    async fn retransmit(&mut self, seq: u8) -> Result<(), LinkError> {
        if self.send_buffers.is_empty() {
            // Startup: nothing has ever been sent from a buffer.
            return Ok(());
        }
        let i = usize::from(seq);
        if self.send_buffers[i][2] >> 3 != self.recv_seq {
            packet::refresh_ack(&mut self.send_buffers[i][..HEADER_LEN], self.recv_seq);
            self.local_ack = self.recv_seq;
        }
        self.stats.resent += 1;

        let len = packet::payload_len(&self.send_buffers[i][..HEADER_LEN]);
        let total = HEADER_LEN + len + if len > 0 { TRAILER_LEN } else { 0 };
        trace!("resending packet {seq}");
        Self::pump_out(
            &mut self.port,
            &mut self.ring,
            &self.send_buffers[i][..total],
        )
        .await
    }

    /// Pushes `data` out through the port, draining concurrent inbound
    /// bytes into the ring so a full-duplex exchange cannot stall.
    async fn pump_out(port: &mut P, ring: &mut Ring, data: &[u8]) -> Result<(), LinkError> {
        let mut at = 0;
        while at < data.len() {
            let free = ring.free_mut();
            let done = port.io(&data[at..], free).await?;
            ring.commit(done.received);
            at += done.sent;
        }
        Ok(())
    }

    /// Reads into the ring's free region, waiting for at least `need` bytes
    /// (or as many as fit) up to `timeout`. Returns the number of bytes
    /// obtained; 0 means the read timed out.
    async fn receive_into(
        port: &mut P,
        ring: &mut Ring,
        need: usize,
        timeout: Duration,
    ) -> Result<usize, PortError> {
        let free = ring.free_mut();
        if free.is_empty() {
            return Ok(0);
        }
        let min = need.min(free.len());
        let n = port.read(free, min, timeout).await?;
        ring.commit(n);
        Ok(n)
    }

    /// Core wait loop: processes buffered data, reads more when needed, and
    /// on a read timeout either retransmits our oldest unacked packet or
    /// NAKs the packet we are missing.
    async fn wait_for_packet<S: DataSink>(
        &mut self,
        timeout: Duration,
        retries: u32,
        until: Until,
        sink: &mut S,
    ) -> Result<(), LinkError> {
        let mut short_reads = 0u32;
        let mut timeouts = 0u32;

        loop {
            let drained = self.process_data(sink).await?;
            if drained.exit {
                return Ok(());
            }
            if until == Until::WindowOpen
                && seq_diff(self.send_seq, self.remote_ack) <= self.remote_window
            {
                return Ok(());
            }
            if drained.need == 0 {
                continue;
            }
            trace!("need {} bytes", drained.need);

            let got =
                Self::receive_into(&mut self.port, &mut self.ring, drained.need, timeout).await?;
            if got != 0 {
                if got >= drained.need {
                    short_reads = 0;
                } else {
                    // Two short reads in a row suggest we lost part of a
                    // large packet; step past its intro byte so the decoder
                    // can hunt for the next one.
                    short_reads += 1;
                    if short_reads > 1 {
                        self.ring.bump_start();
                        short_reads = 0;
                    }
                }
            } else {
                timeouts += 1;
                if timeouts > retries {
                    if retries > 0 {
                        error!("timed out waiting for packet");
                    }
                    return Err(LinkError::Timeout);
                }

                if next_seq(self.remote_ack) != self.send_seq {
                    self.retransmit(next_seq(self.remote_ack)).await?;
                } else {
                    let want = next_seq(self.recv_seq);
                    self.send_nak(want).await?;
                }
            }
        }
    }

    /// Enforces the error budget: the link dies once the fault count, less
    /// one per `error_decay` packets received, exceeds `errors`.
    fn check_errors(&self) -> Result<(), LinkError> {
        if self.params.errors < 0 {
            return Ok(());
        }
        let faults = self.stats.bad_hdr
            + self.stats.bad_cksum
            + self.stats.bad_order
            + self.stats.remote_rejects;
        #[allow(clippy::cast_possible_wrap)]
        let level = faults as i64 - (self.stats.received as i64 / self.params.error_decay);
        if level > self.params.errors {
            error!("too many protocol errors");
            return Err(LinkError::TooManyErrors);
        }
        Ok(())
    }

    /// Decodes and dispatches everything currently buffered in the ring.
    #[allow(clippy::too_many_lines)]
    async fn process_data<S: DataSink>(&mut self, sink: &mut S) -> Result<Drained, LinkError> {
        let mut exit = false;

        while !self.ring.is_empty() {
            // Hunt for the intro byte; anything before it is line noise.
            if !self.ring.skip_until(INTRO) {
                continue;
            }

            let mut hdr_bytes = [0u8; HEADER_LEN];
            let have = self.ring.copy_out(0, &mut hdr_bytes);
            if have < HEADER_LEN {
                return Ok(Drained {
                    exit,
                    need: HEADER_LEN - have,
                });
            }

            let hdr = match PacketHeader::decode(&hdr_bytes) {
                Ok(h) if h.caller != self.caller => h,
                _ => {
                    trace!("bad header");
                    self.stats.bad_hdr += 1;
                    self.check_errors()?;
                    self.ring.bump_start();
                    continue;
                }
            };

            let len = usize::from(hdr.len);
            let seq = hdr.kind.carries_seq().then_some(hdr.local_seq);

            // Sequenced packets must land within our receive window,
            // measured from the last sequence we acknowledged.
            if let Some(s) = seq {
                if self.params.window > 0 && seq_diff(s, self.local_ack) >= self.params.window {
                    trace!("out of order packet {s}");
                    self.stats.bad_order += 1;
                    self.check_errors()?;
                    self.ring.bump_start();
                    continue;
                }
            }

            let total = if len > 0 {
                let needed = HEADER_LEN + len + TRAILER_LEN;
                let have = self.ring.len();
                if have < needed {
                    return Ok(Drained {
                        exit,
                        need: needed - have,
                    });
                }

                let mut trailer = [0u8; TRAILER_LEN];
                let _ = self.ring.copy_out(HEADER_LEN + len, &mut trailer);
                let mut crc = Crc32::new();
                {
                    let (first, second) = self.ring.spans(HEADER_LEN, len);
                    crc.update(first);
                    crc.update(second);
                }
                if crc.value() != u32::from_be_bytes(trailer) {
                    trace!(
                        "bad checksum; data {:#x}, frame {:#x}",
                        crc.value(),
                        u32::from_be_bytes(trailer)
                    );
                    self.stats.bad_cksum += 1;
                    self.check_errors()?;
                    if let Some(s) = seq {
                        self.send_nak(s).await?;
                    }
                    self.ring.bump_start();
                    continue;
                }
                self.stats.received += 1;
                needed
            } else {
                HEADER_LEN
            };

            // Piggybacked ack: accept it if it lies between what the peer
            // had already acked and our current send sequence.
            let ack = hdr.remote_seq;
            if seq_diff(ack, self.remote_ack) < seq_diff(self.send_seq, self.remote_ack) {
                self.remote_ack = ack;
            }

            // A packet ahead of sequence gets parked (or dropped, if it is
            // a duplicate), and the gap it reveals gets NAKed.
            if let Some(s) = seq {
                if s != next_seq(self.recv_seq) {
                    // A duplicate is anything not strictly ahead of us
                    // within the window, or already parked.
                    let ahead = seq_diff(s, self.recv_seq);
                    let duplicate = ahead == 0
                        || (self.params.window > 0 && ahead > self.params.window)
                        || self.stash[usize::from(s)].is_some();
                    if duplicate {
                        trace!("ignoring duplicate packet {s}");
                        self.ring.consume(total);
                        continue;
                    }

                    trace!("saving unexpected packet {s}");
                    let mut payload = vec![0u8; len];
                    let _ = self.ring.copy_out(HEADER_LEN, &mut payload);
                    self.ring.consume(total);
                    self.stash[usize::from(s)] = Some(Stashed {
                        header: hdr,
                        payload,
                    });

                    let mut missing = next_seq(self.recv_seq);
                    while missing != s {
                        if !self.naked[usize::from(missing)]
                            && self.stash[usize::from(missing)].is_none()
                        {
                            self.send_nak(missing).await?;
                        }
                        missing = next_seq(missing);
                    }
                    continue;
                }
                self.recv_seq = s;
            }

            // In order (or unsequenced): dispatch it.
            match hdr.kind {
                PacketKind::Data => {
                    trace!("got DATA packet {} size {}", hdr.local_seq, len);
                    let flow = {
                        let (first, second) = self.ring.spans(HEADER_LEN, len);
                        sink.on_data(first, second, self.recv_pos).await
                    };
                    self.ring.consume(total);
                    self.recv_pos += len as u64;
                    exit |= flow == SinkFlow::Break;
                }
                PacketKind::Sync => {
                    if len < 3 {
                        error!("bad SYNC packet");
                        return Err(LinkError::BadSync);
                    }
                    let mut p = [0u8; 3];
                    let _ = self.ring.copy_out(HEADER_LEN, &mut p);
                    self.ring.consume(total);
                    let packsize = (usize::from(p[0]) << 8) | usize::from(p[1]);
                    trace!("got SYNC packsize {} winsize {}", packsize, p[2]);
                    if self.forced_packet_size == 0 {
                        self.remote_packet_size = packsize.max(1);
                        if let Some(buf) = self.send_buffers.first() {
                            // A mid-session increase cannot outgrow the
                            // buffers allocated at startup.
                            let cap = buf.len() - HEADER_LEN - TRAILER_LEN;
                            self.remote_packet_size = self.remote_packet_size.min(cap);
                        }
                    }
                    if self.forced_window == 0 {
                        self.remote_window = p[2];
                    }
                    self.sync_seen = true;
                    exit = true;
                }
                PacketKind::Ack => {
                    // The piggyback processing above did all the work.
                    trace!("got ACK {}", hdr.remote_seq);
                    self.ring.consume(total);
                }
                PacketKind::Nak => {
                    self.ring.consume(total);
                    self.stats.remote_rejects += 1;
                    self.check_errors()?;
                    let s = hdr.local_seq;
                    let w = self.params.window;
                    if w > 0
                        && (s == self.send_seq
                            || seq_diff(s, self.remote_ack) > w
                            || seq_diff(self.send_seq, s) > w)
                    {
                        trace!("ignoring out of order NAK {s}");
                    } else {
                        trace!("got NAK {s}; resending packet");
                        self.retransmit(s).await?;
                    }
                }
                PacketKind::Spos => {
                    let mut p = [0u8; 4];
                    let copied = self.ring.copy_out(HEADER_LEN, &mut p);
                    self.ring.consume(total);
                    if copied == 4 && len >= 4 {
                        self.recv_pos = u64::from(u32::from_be_bytes(p));
                        trace!("got SPOS {}", self.recv_pos);
                    }
                }
                PacketKind::Close => {
                    self.ring.consume(total);
                    if self.closing {
                        debug!("got CLOSE packet");
                        exit = true;
                    } else {
                        error!("received unexpected CLOSE packet");
                        return Err(LinkError::UnexpectedClose);
                    }
                }
                PacketKind::Reserved(t) => {
                    // Tolerated, for future protocol growth.
                    trace!("got packet type {t}");
                    self.ring.consume(total);
                }
            }

            // Replay any parked successors that are now in order.
            if seq.is_some() {
                loop {
                    let nxt = next_seq(self.recv_seq);
                    let Some(parked) = self.stash[usize::from(nxt)].take() else {
                        break;
                    };
                    self.recv_seq = nxt;
                    match parked.header.kind {
                        PacketKind::Data => {
                            trace!("delivering saved packet {nxt}");
                            let flow = sink.on_data(&parked.payload, &[], self.recv_pos).await;
                            self.recv_pos += parked.payload.len() as u64;
                            exit |= flow == SinkFlow::Break;
                        }
                        PacketKind::Spos => {
                            if parked.payload.len() >= 4 {
                                let mut p = [0u8; 4];
                                p.copy_from_slice(&parked.payload[..4]);
                                self.recv_pos = u64::from(u32::from_be_bytes(p));
                                trace!("got SPOS {}", self.recv_pos);
                            }
                        }
                        PacketKind::Close => {
                            if self.closing {
                                debug!("got CLOSE packet");
                                exit = true;
                            } else {
                                error!("received unexpected CLOSE packet");
                                return Err(LinkError::UnexpectedClose);
                            }
                        }
                        _ => {}
                    }
                }
            }

            // Half a window since our last ack: tell the peer explicitly.
            // (While we are transmitting this hardly ever fires, since every
            // outgoing header acks for free.)
            if self.remote_window > 0
                && seq_diff(self.recv_seq, self.local_ack) >= self.remote_window / 2
            {
                let mut i = self.local_ack;
                loop {
                    self.naked[usize::from(i)] = false;
                    if i == self.recv_seq {
                        break;
                    }
                    i = next_seq(i);
                }
                let header = PacketHeader {
                    kind: PacketKind::Ack,
                    caller: self.caller,
                    local_seq: 0,
                    local_chan: 0,
                    remote_seq: self.recv_seq,
                    remote_chan: 0,
                    len: 0,
                };
                self.local_ack = self.recv_seq;
                trace!("sending ACK {}", self.recv_seq);
                let bytes = header.encode();
                Self::pump_out(&mut self.port, &mut self.ring, &bytes).await?;
            }

            // Hand control back as soon as the session has something to act
            // on. Whatever else is buffered keeps until the next call; in
            // particular, file data following a reply command must not be
            // decoded before the session has opened its receive file.
            if exit {
                break;
            }
        }

        Ok(Drained {
            exit,
            need: HEADER_LEN,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::{DataSink, Link, LinkError, SinkFlow};
    use crate::config::ProtoParams;
    use crate::protocol::crc::Crc32;
    use crate::protocol::packet::{HEADER_LEN, PacketHeader, PacketKind, TRAILER_LEN};
    use crate::test_helpers::{Script, ScriptedPort};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    /// Collects every delivery; answers `Break` so waits return promptly.
    #[derive(Default)]
    struct RecordingSink {
        chunks: Vec<(Vec<u8>, u64)>,
    }

    #[async_trait]
    impl DataSink for RecordingSink {
        async fn on_data(&mut self, first: &[u8], second: &[u8], pos: u64) -> SinkFlow {
            let mut whole = first.to_vec();
            whole.extend_from_slice(second);
            self.chunks.push((whole, pos));
            SinkFlow::Break
        }
    }

    /// Encodes a peer packet (caller flag clear; our test links are the
    /// caller side).
    fn peer_packet(kind: PacketKind, seq: u8, ack: u8, payload: &[u8]) -> Vec<u8> {
        let header = PacketHeader {
            kind,
            caller: false,
            local_seq: seq,
            local_chan: 0,
            remote_seq: ack,
            remote_chan: 0,
            len: u16::try_from(payload.len()).unwrap(),
        };
        let mut bytes = header.encode().to_vec();
        if !payload.is_empty() {
            bytes.extend_from_slice(payload);
            let mut crc = Crc32::new();
            crc.update(payload);
            bytes.extend_from_slice(&crc.value().to_be_bytes());
        }
        bytes
    }

    fn peer_sync(packet_size: u16, window: u8) -> Vec<u8> {
        let size = packet_size.to_be_bytes();
        peer_packet(PacketKind::Sync, 0, 0, &[size[0], size[1], window])
    }

    /// Re-parses a clean transmitted byte stream into packets.
    fn parse_sent(bytes: &[u8]) -> Vec<(PacketHeader, Vec<u8>)> {
        let mut out = Vec::new();
        let mut at = 0;
        while at + HEADER_LEN <= bytes.len() {
            let header: &[u8; HEADER_LEN] = bytes[at..at + HEADER_LEN].try_into().unwrap();
            let header = PacketHeader::decode(header).unwrap();
            at += HEADER_LEN;
            let len = usize::from(header.len);
            let payload = bytes[at..at + len].to_vec();
            at += len + if len > 0 { TRAILER_LEN } else { 0 };
            out.push((header, payload));
        }
        assert_eq!(at, bytes.len(), "trailing partial packet in sent stream");
        out
    }

    fn kinds_of(sent: &[(PacketHeader, Vec<u8>)]) -> Vec<PacketKind> {
        sent.iter().map(|(h, _)| h.kind).collect()
    }

    fn quick_params() -> ProtoParams {
        ProtoParams {
            retries: 0,
            sync_retries: 2,
            ..Default::default()
        }
    }

    async fn started(
        params: ProtoParams,
        peer_announces: (u16, u8),
    ) -> (Link<ScriptedPort>, Script, RecordingSink) {
        let script = Script::default();
        script.feed(peer_sync(peer_announces.0, peer_announces.1));
        let mut sink = RecordingSink::default();
        let link = Link::start(script.port(), params, true, &mut sink)
            .await
            .expect("startup");
        (link, script, sink)
    }

    #[tokio::test]
    async fn startup_announces_and_adopts() {
        let (mut link, script, _sink) = started(quick_params(), (512, 8)).await;

        // We adopted the peer's packet size and window.
        assert_eq!(link.get_space().len(), 512);
        assert_eq!(link.remote_window, 8);

        // Our own SYNC went out announcing the configured values.
        let sent = parse_sent(&script.sent());
        assert_eq!(sent.len(), 1);
        let (header, payload) = &sent[0];
        assert_eq!(header.kind, PacketKind::Sync);
        assert!(header.caller);
        assert_eq!(payload, &[0x04, 0x00, 16]); // 1024, window 16
    }

    #[tokio::test]
    async fn startup_gives_up_after_retries() {
        let script = Script::default();
        let mut sink = RecordingSink::default();
        let result = Link::start(script.port(), quick_params(), true, &mut sink).await;
        assert!(matches!(result, Err(LinkError::StartupFailed)));

        // One initial SYNC plus one per retry.
        let sent = parse_sent(&script.sent());
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(h, _)| h.kind == PacketKind::Sync));
    }

    #[tokio::test]
    async fn forced_remote_values_override_announcement() {
        let params = ProtoParams {
            remote_packet_size: 300,
            remote_window: 4,
            ..quick_params()
        };
        let (mut link, _script, _sink) = started(params, (2048, 24)).await;
        assert_eq!(link.get_space().len(), 300);
        assert_eq!(link.remote_window, 4);
    }

    #[tokio::test]
    async fn in_order_delivery_with_positions() {
        let (mut link, script, mut sink) = started(quick_params(), (512, 8)).await;
        script.feed(peer_packet(PacketKind::Data, 1, 0, b"hello"));
        link.wait(&mut sink).await.unwrap();

        assert_eq!(sink.chunks, vec![(b"hello".to_vec(), 0)]);
        assert_eq!(link.stats().received, 1);

        script.feed(peer_packet(PacketKind::Data, 2, 0, b" world"));
        link.wait(&mut sink).await.unwrap();
        assert_eq!(sink.chunks[1], (b" world".to_vec(), 5));
    }

    #[tokio::test]
    async fn out_of_order_stash_naks_once_and_replays() {
        let (mut link, script, mut sink) = started(quick_params(), (512, 8)).await;
        script.feed(peer_packet(PacketKind::Data, 2, 0, b"BB"));
        script.feed(peer_packet(PacketKind::Data, 3, 0, b"CC"));
        script.feed(peer_packet(PacketKind::Data, 1, 0, b"AA"));
        link.wait(&mut sink).await.unwrap();

        // Delivered in order despite arrival order.
        assert_eq!(
            sink.chunks,
            vec![
                (b"AA".to_vec(), 0),
                (b"BB".to_vec(), 2),
                (b"CC".to_vec(), 4),
            ]
        );

        // Exactly one NAK went out, for the one genuinely missing packet;
        // the already-stashed sequence was not NAKed when 3 arrived.
        let naks: Vec<u8> = parse_sent(&script.sent())
            .iter()
            .filter(|(h, _)| h.kind == PacketKind::Nak)
            .map(|(h, _)| h.local_seq)
            .collect();
        assert_eq!(naks, vec![1]);
    }

    #[tokio::test]
    async fn duplicates_are_dropped() {
        let (mut link, script, mut sink) = started(quick_params(), (512, 8)).await;
        script.feed(peer_packet(PacketKind::Data, 1, 0, b"one"));
        link.wait(&mut sink).await.unwrap();
        // The same packet again: sequence 1 is now far outside (recv_seq, window].
        script.feed(peer_packet(PacketKind::Data, 1, 0, b"one"));
        let result = link.wait(&mut sink).await;
        assert!(matches!(result, Err(LinkError::Timeout)));
        assert_eq!(sink.chunks.len(), 1);
    }

    #[tokio::test]
    async fn bad_checksum_naks_the_sequence() {
        let (mut link, script, mut sink) = started(quick_params(), (512, 8)).await;
        let mut mangled = peer_packet(PacketKind::Data, 1, 0, b"good");
        mangled[HEADER_LEN] ^= 0xFF;
        script.feed(mangled);

        let result = link.wait(&mut sink).await;
        assert!(matches!(result, Err(LinkError::Timeout)));
        assert!(sink.chunks.is_empty());
        assert_eq!(link.stats().bad_cksum, 1);

        let naks: Vec<u8> = parse_sent(&script.sent())
            .iter()
            .filter(|(h, _)| h.kind == PacketKind::Nak)
            .map(|(h, _)| h.local_seq)
            .collect();
        assert_eq!(naks, vec![1]);
    }

    #[tokio::test]
    async fn reflected_traffic_is_rejected() {
        let (mut link, script, mut sink) = started(quick_params(), (512, 8)).await;
        // A packet wearing our own caller flag can only be an echo.
        let mut echo = peer_packet(PacketKind::Data, 1, 0, b"echo!");
        let header = PacketHeader {
            caller: true,
            ..PacketHeader::decode(echo[..HEADER_LEN].try_into().unwrap()).unwrap()
        };
        echo[..HEADER_LEN].copy_from_slice(&header.encode());
        script.feed(echo);

        let result = link.wait(&mut sink).await;
        assert!(matches!(result, Err(LinkError::Timeout)));
        assert!(sink.chunks.is_empty());
        assert!(link.stats().bad_hdr >= 1);
    }

    #[tokio::test]
    async fn nak_triggers_retransmit() {
        let (mut link, script, mut sink) = started(quick_params(), (512, 8)).await;
        link.get_space()[..3].copy_from_slice(b"abc");
        link.send_data(3, None, &mut sink).await.unwrap();

        script.feed(peer_packet(PacketKind::Nak, 1, 0, b""));
        let result = link.wait(&mut sink).await;
        assert!(matches!(result, Err(LinkError::Timeout)));

        let data_packets: Vec<(u8, Vec<u8>)> = parse_sent(&script.sent())
            .iter()
            .filter(|(h, _)| h.kind == PacketKind::Data)
            .map(|(h, p)| (h.local_seq, p.clone()))
            .collect();
        assert_eq!(
            data_packets,
            vec![(1, b"abc".to_vec()), (1, b"abc".to_vec())]
        );
        assert_eq!(link.stats().resent, 1);
        assert_eq!(link.stats().remote_rejects, 1);
    }

    #[tokio::test]
    async fn error_budget_trips_the_link() {
        let params = ProtoParams {
            errors: 1,
            ..quick_params()
        };
        let (mut link, script, mut sink) = started(params, (512, 8)).await;
        // Each chunk is an intro byte followed by a header that fails its
        // XOR check.
        script.feed(vec![0x07, 1, 2, 3, 4, 0]);
        script.feed(vec![0x07, 1, 2, 3, 4, 0]);

        let result = link.wait(&mut sink).await;
        assert!(matches!(result, Err(LinkError::TooManyErrors)));
        assert_eq!(link.stats().bad_hdr, 2);
    }

    #[tokio::test]
    async fn spos_emitted_when_position_jumps() {
        let (mut link, script, mut sink) = started(quick_params(), (512, 8)).await;
        link.get_space()[..2].copy_from_slice(b"xy");
        link.send_data(2, Some(100), &mut sink).await.unwrap();
        link.get_space()[..1].copy_from_slice(b"z");
        link.send_data(1, Some(102), &mut sink).await.unwrap();

        let sent = parse_sent(&script.sent());
        assert_eq!(
            kinds_of(&sent),
            vec![
                PacketKind::Sync,
                PacketKind::Spos,
                PacketKind::Data,
                PacketKind::Data,
            ]
        );
        // The SPOS payload is the big-endian target position, and it took
        // the sequence number the data would have used.
        assert_eq!(sent[1].1, 100u32.to_be_bytes().to_vec());
        assert_eq!(sent[1].0.local_seq, 1);
        assert_eq!(sent[2].0.local_seq, 2);
        assert_eq!(sent[3].0.local_seq, 3);
        // Only DATA counts as sent.
        assert_eq!(link.stats().sent, 2);
    }

    #[tokio::test]
    async fn spos_delivery_moves_receive_position() {
        let (mut link, script, mut sink) = started(quick_params(), (512, 8)).await;
        script.feed(peer_packet(PacketKind::Spos, 1, 0, &4096u32.to_be_bytes()));
        script.feed(peer_packet(PacketKind::Data, 2, 0, b"payload"));
        link.wait(&mut sink).await.unwrap();

        assert_eq!(sink.chunks, vec![(b"payload".to_vec(), 4096)]);
    }

    #[tokio::test]
    async fn window_wait_unblocks_on_piggybacked_ack() {
        let (mut link, script, mut sink) = started(quick_params(), (512, 2)).await;
        for b in [b"1", b"2"] {
            link.get_space()[..1].copy_from_slice(b);
            link.send_data(1, None, &mut sink).await.unwrap();
        }
        // Window of 2 is now full; an ACK must arrive before the third
        // packet may go out.
        script.feed(peer_packet(PacketKind::Ack, 0, 2, b""));
        link.get_space()[..1].copy_from_slice(b"3");
        link.send_data(1, None, &mut sink).await.unwrap();

        let seqs: Vec<u8> = parse_sent(&script.sent())
            .iter()
            .filter(|(h, _)| h.kind == PacketKind::Data)
            .map(|(h, _)| h.local_seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn half_window_triggers_standalone_ack() {
        let (mut link, script, mut sink) = started(quick_params(), (512, 8)).await;
        // Four packets is half the peer's announced window of 8.
        for seq in 1..=4u8 {
            script.feed(peer_packet(PacketKind::Data, seq, 0, b"x"));
        }
        while link.stats().received < 4 {
            link.wait(&mut sink).await.unwrap();
        }

        let acks: Vec<u8> = parse_sent(&script.sent())
            .iter()
            .filter(|(h, _)| h.kind == PacketKind::Ack)
            .map(|(h, _)| h.remote_seq)
            .collect();
        assert_eq!(acks, vec![4]);
    }

    #[tokio::test]
    async fn close_is_fatal_unless_shutting_down() {
        let (mut link, script, mut sink) = started(quick_params(), (512, 8)).await;
        script.feed(peer_packet(PacketKind::Close, 1, 0, b""));
        let result = link.wait(&mut sink).await;
        assert!(matches!(result, Err(LinkError::UnexpectedClose)));

        let (mut link, script, mut sink) = started(quick_params(), (512, 8)).await;
        link.expect_close();
        script.feed(peer_packet(PacketKind::Close, 1, 0, b""));
        link.wait(&mut sink).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_sends_close() {
        let (mut link, script, _sink) = started(quick_params(), (512, 8)).await;
        link.shutdown().await.unwrap();
        let sent = parse_sent(&script.sent());
        assert_eq!(kinds_of(&sent), vec![PacketKind::Sync, PacketKind::Close]);
    }

    #[tokio::test]
    async fn command_fragmentation_ends_with_nul() {
        // Tiny packets force fragmentation.
        let (mut link, script, mut sink) = started(quick_params(), (4, 8)).await;
        link.send_cmd("CMD WORD", &mut sink).await.unwrap();

        let payloads: Vec<Vec<u8>> = parse_sent(&script.sent())
            .iter()
            .filter(|(h, _)| h.kind == PacketKind::Data)
            .map(|(_, p)| p.clone())
            .collect();
        assert_eq!(
            payloads,
            vec![b"CMD ".to_vec(), b"WORD".to_vec(), b"\0".to_vec()]
        );
    }

    #[tokio::test]
    async fn reserved_packet_types_are_ignored() {
        let (mut link, script, mut sink) = started(quick_params(), (512, 8)).await;
        script.feed(peer_packet(PacketKind::Reserved(7), 0, 0, b"future"));
        script.feed(peer_packet(PacketKind::Data, 1, 0, b"now"));
        link.wait(&mut sink).await.unwrap();
        assert_eq!(sink.chunks, vec![(b"now".to_vec(), 0)]);
        assert_eq!(link.stats().received, 2);
    }
}
