//! Protocol defaults -- the timing parameter set mesh nodes agree on.
//!
//! Hold-time negotiation takes the minimum of the local default and the
//! value proposed in an open, floored at `min_hold_time_secs`. Everything
//! here is a protocol-level constant; listener addresses and queue depths
//! are node-local configuration and live in the node's config instead.

/// Timing and sizing parameters for the announcement protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolDefaults {
    // -- Session liveness --
    /// Hold time in seconds offered when opening a session. A peer silent
    /// for longer than the negotiated hold time is marked degraded.
    pub hold_time_secs: u64,
    /// Multiplier on the hold time before a silent peer is closed and its
    /// routes withdrawn.
    pub hold_grace_multiplier: u32,
    /// Keepalives are sent every `hold_time / keepalive_divisor` seconds.
    pub keepalive_divisor: u32,
    /// Floor for a negotiated hold time. Proposals below this are clamped.
    pub min_hold_time_secs: u64,

    // -- Transport --
    /// Timeout for a single peer RPC (request/response and socket alike).
    pub rpc_timeout_secs: u64,
    /// Timeout for establishing a persistent-socket connection.
    pub connect_timeout_secs: u64,
    /// Maximum serialized size of one wire envelope in bytes.
    pub max_envelope_bytes: usize,
}

impl ProtocolDefaults {
    /// Interval between keepalive emissions; also the tick cadence, so the
    /// tick handler needs no per-peer send bookkeeping.
    pub const fn keepalive_interval_secs(&self) -> u64 {
        self.hold_time_secs / self.keepalive_divisor as u64
    }

    /// Seconds of silence after which a peer is closed outright.
    pub const fn close_after_secs(&self) -> u64 {
        self.hold_time_secs * self.hold_grace_multiplier as u64
    }
}

/// Default parameter set.
///
/// Hold time and keepalive cadence follow the BGP conventions (90s hold,
/// keepalive at a third of it). The grace window is deliberately wide so a
/// briefly partitioned peer degrades long before its routes are withdrawn.
pub const DEFAULTS: ProtocolDefaults = ProtocolDefaults {
    hold_time_secs: 90,
    hold_grace_multiplier: 3,
    keepalive_divisor: 3,
    min_hold_time_secs: 3,

    rpc_timeout_secs: 10,
    connect_timeout_secs: 5,
    max_envelope_bytes: 1024 * 1024, // 1 MB -- a full-table resync in one frame
};
