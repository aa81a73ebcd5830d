//! Connection pool -- cached capability stubs keyed by endpoint.
//!
//! One cache per capability kind. The first request for an endpoint builds a
//! stub over a fresh [`Session`] (the URL scheme picks the transport); later
//! requests return the identical `Arc`. The pool never health-checks or
//! expires entries: staleness is the hold timer's concern, and callers evict
//! on persistent failure or peer deletion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use pylon_protocol::{PeerInfo, PeerRequest, PeerResponse, RouteUpdateMessage};

use crate::session::Session;
use crate::TransportError;

/// Thread-safe cache of outbound capability stubs.
///
/// Cheap to clone; all clones share the caches and the HTTP client. Sessions
/// connect lazily on their first RPC, so building a stub for an unreachable
/// endpoint succeeds.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    http: reqwest::Client,
    connect_timeout: Duration,
    request_timeout: Duration,
    peer_control: Mutex<HashMap<String, Arc<PeerControl>>>,
    proxy_config: Mutex<HashMap<String, Arc<ProxyConfig>>>,
    gateway_config: Mutex<HashMap<String, Arc<GatewayConfig>>>,
}

impl ConnectionPool {
    /// Timeouts are fixed per pool instance and apply to every session it
    /// creates.
    pub fn new(
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::ClientInit(e.to_string()))?;
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                http,
                connect_timeout,
                request_timeout,
                peer_control: Mutex::new(HashMap::new()),
                proxy_config: Mutex::new(HashMap::new()),
                gateway_config: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn session_for(&self, endpoint: &str) -> Result<Session, TransportError> {
        Session::for_endpoint(
            endpoint,
            self.inner.http.clone(),
            self.inner.connect_timeout,
            self.inner.request_timeout,
        )
    }

    /// Peer-control stub for `endpoint`, cached. Check-then-insert runs
    /// under the cache lock, so concurrent callers get the same stub.
    pub async fn peer_control(&self, endpoint: &str) -> Result<Arc<PeerControl>, TransportError> {
        let mut cache = self.inner.peer_control.lock().await;
        if let Some(stub) = cache.get(endpoint) {
            return Ok(Arc::clone(stub));
        }
        let stub = Arc::new(PeerControl {
            session: self.session_for(endpoint)?,
        });
        cache.insert(endpoint.to_string(), Arc::clone(&stub));
        tracing::debug!(endpoint, kind = "peer-control", pool_size = cache.len(), "pooled stub");
        Ok(stub)
    }

    /// Proxy-config stub for `endpoint`, cached.
    pub async fn proxy_config(&self, endpoint: &str) -> Result<Arc<ProxyConfig>, TransportError> {
        let mut cache = self.inner.proxy_config.lock().await;
        if let Some(stub) = cache.get(endpoint) {
            return Ok(Arc::clone(stub));
        }
        let stub = Arc::new(ProxyConfig {
            session: self.session_for(endpoint)?,
        });
        cache.insert(endpoint.to_string(), Arc::clone(&stub));
        tracing::debug!(endpoint, kind = "proxy-config", pool_size = cache.len(), "pooled stub");
        Ok(stub)
    }

    /// Gateway-config stub for `endpoint`, cached.
    pub async fn gateway_config(
        &self,
        endpoint: &str,
    ) -> Result<Arc<GatewayConfig>, TransportError> {
        let mut cache = self.inner.gateway_config.lock().await;
        if let Some(stub) = cache.get(endpoint) {
            return Ok(Arc::clone(stub));
        }
        let stub = Arc::new(GatewayConfig {
            session: self.session_for(endpoint)?,
        });
        cache.insert(endpoint.to_string(), Arc::clone(&stub));
        tracing::debug!(endpoint, kind = "gateway-config", pool_size = cache.len(), "pooled stub");
        Ok(stub)
    }

    /// Drop the cached stubs for `endpoint`, every capability kind. Holders
    /// of an existing `Arc` keep it until it drops; new requests rebuild.
    pub async fn evict(&self, endpoint: &str) {
        let removed = self.inner.peer_control.lock().await.remove(endpoint).is_some()
            | self.inner.proxy_config.lock().await.remove(endpoint).is_some()
            | self.inner.gateway_config.lock().await.remove(endpoint).is_some();
        if removed {
            tracing::debug!(endpoint, "evicted pooled stubs");
        }
    }

    /// Drop every cached stub.
    pub async fn purge(&self) {
        self.inner.peer_control.lock().await.clear();
        self.inner.proxy_config.lock().await.clear();
        self.inner.gateway_config.lock().await.clear();
    }
}

/// Session-management surface of a remote node's `/rpc`.
#[derive(Debug)]
pub struct PeerControl {
    session: Session,
}

impl PeerControl {
    pub fn endpoint(&self) -> &str {
        self.session.endpoint()
    }

    pub async fn open(
        &self,
        token: &str,
        local: PeerInfo,
        hold_time: Option<u64>,
    ) -> Result<PeerResponse, TransportError> {
        let request = PeerRequest::Open {
            peer_info: local,
            hold_time,
        };
        self.session.request(token, request.kind(), &request).await
    }

    pub async fn update(
        &self,
        token: &str,
        local: PeerInfo,
        update: RouteUpdateMessage,
    ) -> Result<PeerResponse, TransportError> {
        let request = PeerRequest::Update {
            peer_info: local,
            update,
        };
        self.session.request(token, request.kind(), &request).await
    }

    pub async fn keepalive(
        &self,
        token: &str,
        local: PeerInfo,
    ) -> Result<PeerResponse, TransportError> {
        let request = PeerRequest::Keepalive { peer_info: local };
        self.session.request(token, request.kind(), &request).await
    }

    pub async fn close(
        &self,
        token: &str,
        local: PeerInfo,
        code: u32,
        reason: Option<String>,
    ) -> Result<PeerResponse, TransportError> {
        let request = PeerRequest::Close {
            peer_info: local,
            code,
            reason,
        };
        self.session.request(token, request.kind(), &request).await
    }
}

/// Proxy-configuration surface of a remote node. Nothing in this crate
/// dials it; the xDS translator pushes regenerated listener and cluster
/// sets through it.
#[derive(Debug)]
pub struct ProxyConfig {
    session: Session,
}

impl ProxyConfig {
    pub fn endpoint(&self) -> &str {
        self.session.endpoint()
    }

    /// Raw envelope passthrough; config payload shapes belong to the
    /// translator, not this crate.
    pub async fn request<R: Serialize>(
        &self,
        token: &str,
        action: &str,
        body: &R,
    ) -> Result<PeerResponse, TransportError> {
        self.session.request(token, action, body).await
    }
}

/// Gateway-configuration surface of a remote node, for the GraphQL gateway
/// front-end. Passthrough like [`ProxyConfig`].
#[derive(Debug)]
pub struct GatewayConfig {
    session: Session,
}

impl GatewayConfig {
    pub fn endpoint(&self) -> &str {
        self.session.endpoint()
    }

    pub async fn request<R: Serialize>(
        &self,
        token: &str,
        action: &str,
        body: &R,
    ) -> Result<PeerResponse, TransportError> {
        self.session.request(token, action, body).await
    }
}
