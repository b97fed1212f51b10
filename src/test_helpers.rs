// (c) 2025 Ross Younger

//! In-memory ports for exercising the protocol without a serial line.
//!
//! [`pair`] wires two [`TestPort`]s back to back through an in-memory
//! duplex pipe, so a caller and a called peer can run complete sessions
//! against each other inside one test. [`ScriptedPort`] is the
//! single-ended variant: tests feed it exact inbound bytes and inspect
//! exactly what was transmitted. [`CorruptingPort`] wraps either and
//! flips a bit every N received bytes, for loss-recovery tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream, ReadHalf, WriteHalf};

use crate::port::{LinkPort, PortError, PortIo};

const PIPE_CAPACITY: usize = 1 << 20;

/// A [`LinkPort`] over one end of an in-memory duplex pipe.
pub(crate) struct TestPort {
    rx: ReadHalf<DuplexStream>,
    tx: WriteHalf<DuplexStream>,
}

/// Two ports plumbed into each other.
pub(crate) fn pair() -> (TestPort, TestPort) {
    let (a, b) = tokio::io::duplex(PIPE_CAPACITY);
    let (ra, wa) = tokio::io::split(a);
    let (rb, wb) = tokio::io::split(b);
    (TestPort { rx: ra, tx: wa }, TestPort { rx: rb, tx: wb })
}

#[async_trait]
impl LinkPort for TestPort {
    async fn io(&mut self, send: &[u8], recv: &mut [u8]) -> Result<PortIo, PortError> {
        self.tx.write_all(send).await?;
        // Opportunistic read: grab whatever the peer has already pushed,
        // without waiting for more.
        let received = match tokio::time::timeout(Duration::ZERO, self.rx.read(recv)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_elapsed) => 0,
        };
        Ok(PortIo {
            sent: send.len(),
            received,
        })
    }

    async fn read(
        &mut self,
        recv: &mut [u8],
        min: usize,
        timeout: Duration,
    ) -> Result<usize, PortError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut total = 0;
        while total < min {
            match tokio::time::timeout_at(deadline, self.rx.read(&mut recv[total..])).await {
                Ok(Ok(0)) => return Err(PortError::Closed),
                Ok(Ok(n)) => total += n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => break,
            }
        }
        Ok(total)
    }
}

/// Shared state behind a [`ScriptedPort`]; the test keeps one handle to
/// feed input and inspect output while the link owns the port.
#[derive(Clone, Default)]
pub(crate) struct Script(Arc<Mutex<ScriptInner>>);

#[derive(Default)]
struct ScriptInner {
    sent: Vec<u8>,
    feed: VecDeque<Vec<u8>>,
}

impl Script {
    /// Queues bytes for the port to "receive". Each call is delivered as
    /// one read.
    pub(crate) fn feed(&self, bytes: impl Into<Vec<u8>>) {
        self.0.lock().unwrap().feed.push_back(bytes.into());
    }

    /// Everything the link has transmitted so far.
    pub(crate) fn sent(&self) -> Vec<u8> {
        self.0.lock().unwrap().sent.clone()
    }

    pub(crate) fn port(&self) -> ScriptedPort {
        ScriptedPort(self.clone())
    }
}

/// A deterministic [`LinkPort`]: transmissions are recorded, reads deliver
/// pre-scripted chunks, and an empty script reads as an instant timeout.
pub(crate) struct ScriptedPort(Script);

#[async_trait]
impl LinkPort for ScriptedPort {
    async fn io(&mut self, send: &[u8], _recv: &mut [u8]) -> Result<PortIo, PortError> {
        self.0.0.lock().unwrap().sent.extend_from_slice(send);
        Ok(PortIo {
            sent: send.len(),
            received: 0,
        })
    }

    async fn read(
        &mut self,
        recv: &mut [u8],
        _min: usize,
        _timeout: Duration,
    ) -> Result<usize, PortError> {
        let mut inner = self.0.0.lock().unwrap();
        match inner.feed.pop_front() {
            None => Ok(0),
            Some(mut chunk) => {
                let n = chunk.len().min(recv.len());
                recv[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    let tail = chunk.split_off(n);
                    inner.feed.push_front(tail);
                }
                Ok(n)
            }
        }
    }
}

/// Wraps a port and flips one bit in every `period`-th received byte.
pub(crate) struct CorruptingPort<P> {
    inner: P,
    period: usize,
    seen: usize,
}

impl<P> CorruptingPort<P> {
    pub(crate) fn new(inner: P, period: usize) -> Self {
        Self {
            inner,
            period,
            seen: 0,
        }
    }

    fn mangle(&mut self, buf: &mut [u8]) {
        for b in buf {
            self.seen += 1;
            if self.seen % self.period == 0 {
                *b ^= 0x40;
            }
        }
    }
}

#[async_trait]
impl<P: LinkPort> LinkPort for CorruptingPort<P> {
    async fn io(&mut self, send: &[u8], recv: &mut [u8]) -> Result<PortIo, PortError> {
        let done = self.inner.io(send, recv).await?;
        self.mangle(&mut recv[..done.received]);
        Ok(done)
    }

    async fn read(
        &mut self,
        recv: &mut [u8],
        min: usize,
        timeout: Duration,
    ) -> Result<usize, PortError> {
        let n = self.inner.read(recv, min, timeout).await?;
        self.mangle(&mut recv[..n]);
        Ok(n)
    }
}
