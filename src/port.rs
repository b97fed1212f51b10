// (c) 2025 Ross Younger

//! The byte-port seam.
//!
//! The link layer talks to the outside world through [`LinkPort`], a narrow
//! abstraction over a full-duplex byte stream (serial line, modem, pty,
//! in-memory pipe). Opening, configuring and dialing the device are someone
//! else's problem; by the time a port reaches this crate it is a live
//! bidirectional stream.

use std::time::Duration;

use async_trait::async_trait;

/// Result of a combined write-and-read cycle on the port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortIo {
    /// Bytes accepted from the send buffer.
    pub sent: usize,
    /// Bytes deposited into the receive buffer.
    pub received: usize,
}

/// Errors surfaced by a port implementation.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// The underlying device failed.
    #[error("port I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer went away.
    #[error("port closed")]
    Closed,
}

/// A full-duplex byte stream with the two operations the link layer needs.
///
/// The two-sided [`io`](Self::io) call is the heart of the cooperative
/// model: while a packet is being pushed out, whatever the peer is sending
/// concurrently must be drained into `recv` so the line cannot deadlock
/// with both sides blocked on writes. Implementations must never wait for
/// `recv` to fill; partial completion of either side is expected.
#[async_trait]
pub trait LinkPort: Send {
    /// Writes from `send` while opportunistically reading into `recv`.
    ///
    /// Must make progress on the send side (at least one byte accepted
    /// unless `send` is empty) and must return immediately once it has,
    /// reporting whatever input happened to be available.
    async fn io(&mut self, send: &[u8], recv: &mut [u8]) -> Result<PortIo, PortError>;

    /// Reads into `recv`, waiting up to `timeout` for at least `min` bytes
    /// to arrive (the decoder knows how many more it needs to make
    /// progress).
    ///
    /// Returns however many bytes were read — possibly more than `min`,
    /// possibly fewer if the timeout expired first, and 0 if it expired
    /// with nothing at all.
    async fn read(&mut self, recv: &mut [u8], min: usize, timeout: Duration)
    -> Result<usize, PortError>;
}
