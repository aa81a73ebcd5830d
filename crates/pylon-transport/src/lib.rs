//! Outbound peer RPC -- pooled sessions and propagation fan-out.
//!
//! The RIB emits `Propagation`s; this crate delivers them. [`PeerTransport`]
//! resolves each peer's credential and endpoint, borrows a peer-control stub
//! from the [`ConnectionPool`], and invokes the remote method. [`fan_out`]
//! runs a commit batch concurrently across peers but sequentially within
//! each peer, so one session always observes batch order. Every item settles
//! to an outcome: a dead peer costs one failed entry, never the rest of the
//! batch and never the committed state.
//!
//! [`fan_out`]: PeerTransport::fan_out

pub mod pool;
pub mod session;

pub use pool::{ConnectionPool, GatewayConfig, PeerControl, ProxyConfig};
pub use session::Session;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use pylon_protocol::{PeerInfo, Propagation, PropagationPayload, RouteUpdateMessage};

/// Everything that can go wrong delivering one envelope to one peer.
///
/// None of these escalate: the dispatcher logs them, counts them, and moves
/// on. A committed state transition is never rolled back by a delivery
/// failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer record carries no endpoint to dial.
    #[error("peer {peer} has no endpoint")]
    EndpointMissing { peer: String },

    /// No peer-specific token and no node-wide token configured.
    #[error("no token for peer {peer}")]
    TokenMissing { peer: String },

    #[error(transparent)]
    Scheme(#[from] pylon_protocol::ProtocolError),

    #[error("http client init failed: {0}")]
    ClientInit(String),

    #[error("connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    /// The remote refused our credentials.
    #[error("authorization rejected")]
    AuthRejected,

    /// Delivered and answered, but with `success: false`.
    #[error("{action} rejected by peer: {reason}")]
    Rejected { action: String, reason: String },

    #[error("{action} rpc failed: {reason}")]
    Rpc { action: String, reason: String },

    #[error("{action} rpc timed out after {after:?}")]
    Timeout { action: String, after: Duration },

    #[error("encode failed: {0}")]
    Encode(String),
}

/// Monotonic delivery counters, one triple per payload kind -- shared
/// between the dispatcher and the status surface.
#[derive(Debug, Default)]
pub struct TransportStats {
    pub open: KindStats,
    pub update: KindStats,
    pub keepalive: KindStats,
    pub close: KindStats,
}

/// Attempt/success/failure counts for one payload kind.
#[derive(Debug, Default)]
pub struct KindStats {
    pub attempted: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
}

impl KindStats {
    fn record(&self, ok: bool) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn counters(&self) -> KindCounters {
        KindCounters {
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl TransportStats {
    pub fn new() -> Self {
        TransportStats::default()
    }

    fn for_payload(&self, payload: &PropagationPayload) -> &KindStats {
        match payload {
            PropagationPayload::Open { .. } => &self.open,
            PropagationPayload::Update(_) => &self.update,
            PropagationPayload::Keepalive => &self.keepalive,
            PropagationPayload::Close { .. } => &self.close,
        }
    }

    /// Point-in-time copy for diagnostics.
    pub fn snapshot(&self) -> TransportCounters {
        TransportCounters {
            open: self.open.counters(),
            update: self.update.counters(),
            keepalive: self.keepalive.counters(),
            close: self.close.counters(),
        }
    }
}

/// Serializable form of [`TransportStats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCounters {
    pub open: KindCounters,
    pub update: KindCounters,
    pub keepalive: KindCounters,
    pub close: KindCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindCounters {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Settled result of delivering one propagation.
#[derive(Debug)]
pub struct PropagationOutcome {
    pub peer: String,
    pub payload: &'static str,
    pub result: Result<(), TransportError>,
}

impl PropagationOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outbound half of the peer protocol: resolves credentials, borrows stubs
/// from the pool, invokes the remote methods.
#[derive(Clone)]
pub struct PeerTransport {
    local: PeerInfo,
    node_token: Option<String>,
    pool: ConnectionPool,
    stats: Arc<TransportStats>,
}

impl PeerTransport {
    /// `local` is this node's identity as announced to peers (any
    /// `peer_token` on it is stripped before the wire). `node_token` is the
    /// fallback credential for peers that carry none of their own.
    pub fn new(
        local: PeerInfo,
        node_token: Option<String>,
        pool: ConnectionPool,
        stats: Arc<TransportStats>,
    ) -> Self {
        PeerTransport {
            local,
            node_token,
            pool,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<TransportStats> {
        Arc::clone(&self.stats)
    }

    pub async fn send_open(
        &self,
        peer: &PeerInfo,
        hold_time_secs: u64,
    ) -> Result<(), TransportError> {
        self.send(peer, PropagationPayload::Open { hold_time_secs })
            .await
    }

    pub async fn send_update(
        &self,
        peer: &PeerInfo,
        update: RouteUpdateMessage,
    ) -> Result<(), TransportError> {
        self.send(peer, PropagationPayload::Update(update)).await
    }

    pub async fn send_keepalive(&self, peer: &PeerInfo) -> Result<(), TransportError> {
        self.send(peer, PropagationPayload::Keepalive).await
    }

    pub async fn send_close(
        &self,
        peer: &PeerInfo,
        code: u32,
        reason: Option<String>,
    ) -> Result<(), TransportError> {
        self.send(peer, PropagationPayload::Close { code, reason })
            .await
    }

    /// Deliver one payload to one peer. Failures are logged and counted
    /// here; callers decide whether they matter.
    pub async fn send(
        &self,
        peer: &PeerInfo,
        payload: PropagationPayload,
    ) -> Result<(), TransportError> {
        let kind = payload.kind();
        let stats = self.stats.for_payload(&payload);
        let result = self.dispatch(peer, payload).await;
        stats.record(result.is_ok());
        match &result {
            Ok(()) => tracing::debug!(peer = %peer.name, payload = kind, "peer send ok"),
            Err(e) => {
                tracing::warn!(peer = %peer.name, payload = kind, error = %e, "peer send failed")
            }
        }
        result
    }

    async fn dispatch(
        &self,
        peer: &PeerInfo,
        payload: PropagationPayload,
    ) -> Result<(), TransportError> {
        let endpoint = peer
            .endpoint
            .as_deref()
            .ok_or_else(|| TransportError::EndpointMissing {
                peer: peer.name.clone(),
            })?;
        let token = peer
            .peer_token
            .clone()
            .or_else(|| self.node_token.clone())
            .ok_or_else(|| TransportError::TokenMissing {
                peer: peer.name.clone(),
            })?;

        let control = self.pool.peer_control(endpoint).await?;
        let local = self.local.wire_identity();
        let action = payload.kind();
        let response = match payload {
            PropagationPayload::Open { hold_time_secs } => {
                control.open(&token, local, Some(hold_time_secs)).await?
            }
            PropagationPayload::Update(update) => control.update(&token, local, update).await?,
            PropagationPayload::Keepalive => control.keepalive(&token, local).await?,
            PropagationPayload::Close { code, reason } => {
                control.close(&token, local, code, reason).await?
            }
        };
        if response.success {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                action: action.to_string(),
                reason: response.error.unwrap_or_else(|| "unspecified".into()),
            })
        }
    }

    /// Deliver a commit batch. Concurrent across peers, sequential within a
    /// peer, and every item settles to an outcome at its input position.
    pub async fn fan_out(&self, batch: Vec<Propagation>) -> Vec<PropagationOutcome> {
        // (peer, kind) per input slot, for items whose task never reports.
        let labels: Vec<(String, &'static str)> = batch
            .iter()
            .map(|p| (p.peer.name.clone(), p.payload.kind()))
            .collect();

        // Group by peer: first-appearance order across, batch order within.
        let mut groups: Vec<(String, Vec<(usize, Propagation)>)> = Vec::new();
        for (idx, prop) in batch.into_iter().enumerate() {
            match groups.iter_mut().find(|(name, _)| *name == prop.peer.name) {
                Some((_, items)) => items.push((idx, prop)),
                None => groups.push((prop.peer.name.clone(), vec![(idx, prop)])),
            }
        }

        let mut tasks = JoinSet::new();
        for (_, items) in groups {
            let transport = self.clone();
            tasks.spawn(async move {
                let mut settled = Vec::with_capacity(items.len());
                for (idx, prop) in items {
                    let Propagation { peer, payload } = prop;
                    let payload_kind = payload.kind();
                    let result = transport.send(&peer, payload).await;
                    settled.push((
                        idx,
                        PropagationOutcome {
                            peer: peer.name,
                            payload: payload_kind,
                            result,
                        },
                    ));
                }
                settled
            });
        }

        let mut slots: Vec<Option<PropagationOutcome>> = Vec::with_capacity(labels.len());
        slots.resize_with(labels.len(), || None);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(settled) => {
                    for (idx, outcome) in settled {
                        slots[idx] = Some(outcome);
                    }
                }
                Err(e) => tracing::error!(error = %e, "fan-out delivery task failed"),
            }
        }

        slots
            .into_iter()
            .zip(labels)
            .map(|(slot, (peer, payload))| {
                slot.unwrap_or_else(|| PropagationOutcome {
                    peer,
                    payload,
                    result: Err(TransportError::Rpc {
                        action: payload.to_string(),
                        reason: "delivery task aborted".into(),
                    }),
                })
            })
            .collect()
    }
}
