// (c) 2025 Ross Younger

//! Protocol tunables.
//!
//! These are the knobs a deployment can turn per peer; everything has a
//! sensible default and most installations never touch any of them. In
//! configuration files the field names are kebab-case
//! (`packet-size`, `sync-timeout`, ...). Parsing those files is the
//! caller's business; this crate only defines the structure.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::packet::{MAX_PAYLOAD, MAX_SEQ};

/// Protocol parameters for one link.
///
/// Construct with [`ProtoParams::default`] and override fields as needed;
/// the link sanitizes out-of-range values at startup rather than erroring,
/// falling back to auto-negotiation (for the `remote-*` overrides) or the
/// default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProtoParams {
    /// Largest packet payload we ask the peer to send us, announced in our
    /// SYNC packet. [default: 1024, maximum 4095]
    pub packet_size: u16,

    /// Receive window we ask the peer to respect, announced in our SYNC
    /// packet. [default: 16, maximum 31]
    pub window: u8,

    /// Overrides the packet size the peer announces, when nonzero.
    /// [default: 0 = accept the peer's announcement]
    pub remote_packet_size: u16,

    /// Overrides the window the peer announces, when nonzero.
    /// [default: 0 = accept the peer's announcement]
    pub remote_window: u8,

    /// Seconds to wait for the peer's SYNC during startup before resending
    /// ours. [default: 10]
    pub sync_timeout: u16,

    /// How many SYNC timeouts to tolerate before declaring startup failed.
    /// [default: 6]
    pub sync_retries: u32,

    /// Seconds to wait for inbound data before retransmitting or NAKing.
    /// [default: 10]
    pub timeout: u16,

    /// How many consecutive read timeouts to tolerate within one wait
    /// before giving up on the link. [default: 6]
    pub retries: u32,

    /// Error budget: the link fails once the running fault count (bad
    /// headers, bad checksums, ordering faults, peer rejects), less one per
    /// `error_decay` packets received, exceeds this. Negative disables the
    /// budget entirely. [default: 100]
    pub errors: i64,

    /// Every this-many successfully received packets forgive one fault.
    /// [default: 10]
    pub error_decay: i64,
}

impl Default for ProtoParams {
    fn default() -> Self {
        Self {
            packet_size: 1024,
            window: 16,
            remote_packet_size: 0,
            remote_window: 0,
            sync_timeout: 10,
            sync_retries: 6,
            timeout: 10,
            retries: 6,
            errors: 100,
            error_decay: 10,
        }
    }
}

impl ProtoParams {
    /// Clamps out-of-range values to their auto/default equivalents.
    /// The link applies this once at startup.
    #[must_use]
    pub(crate) fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.packet_size == 0 || usize::from(self.packet_size) > MAX_PAYLOAD {
            self.packet_size = defaults.packet_size;
        }
        if self.window == 0 || self.window >= MAX_SEQ {
            self.window = defaults.window;
        }
        if usize::from(self.remote_packet_size) > MAX_PAYLOAD {
            self.remote_packet_size = 0;
        }
        if self.remote_window >= MAX_SEQ {
            self.remote_window = 0;
        }
        if self.error_decay < 1 {
            self.error_decay = defaults.error_decay;
        }
        self
    }

    pub(crate) fn sync_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.sync_timeout))
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout))
    }
}
