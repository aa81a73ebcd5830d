//! Test harness for in-process pylon-node integration tests.
//!
//! TestNode runs the full node wiring (RIB task, outbound dispatcher, peer
//! RPC server, admin server) on ephemeral loopback ports. TestMesh
//! orchestrates N of them into a statically seeded mesh, the same way
//! `[[peers]]` config entries would.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use pylon_api::{admin_router, rpc_router, ActionHandle, AppState};
use pylon_node::{outbound, rib_task};
use pylon_protocol::{PeerInfo, ProtocolDefaults, DEFAULTS};
use pylon_rib::{Rib, SnapshotCell};
use pylon_transport::{ConnectionPool, PeerTransport, TransportStats};

/// Mesh-wide peer credential shared by every test node.
pub const MESH_TOKEN: &str = "test-mesh-token";

/// A running in-process node with all four tasks.
pub struct TestNode {
    pub name: String,
    /// Peer-facing endpoint other nodes dial (`http://...` or `ws://...`).
    pub rpc_endpoint: String,
    pub admin_addr: String,
    pub admin_token: String,
    shutdown_tx: broadcast::Sender<()>,
    _handles: Vec<tokio::task::JoinHandle<()>>,
}

#[allow(dead_code)]
impl TestNode {
    /// Identity entry another node seeds to peer with this one.
    pub fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            name: self.name.clone(),
            endpoint: Some(self.rpc_endpoint.clone()),
            domains: Vec::new(),
            peer_token: None,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    /// Abort every task without the close handshake, like a crash. Peers
    /// only find out through their hold timers.
    pub async fn kill(self) {
        for handle in &self._handles {
            handle.abort();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    /// GET an admin path, parsed as JSON.
    pub async fn admin_get(&self, path: &str) -> anyhow::Result<serde_json::Value> {
        let url = format!("http://{}{}", self.admin_addr, path);
        let resp = reqwest::Client::new()
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.admin_token))
            .send()
            .await?;
        Ok(resp.json().await?)
    }

    /// POST an admin mutation, returning (status, body).
    pub async fn admin_post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<(u16, serde_json::Value)> {
        let url = format!("http://{}{}", self.admin_addr, path);
        let resp = reqwest::Client::new()
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.admin_token))
            .json(&body)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let value: serde_json::Value =
            serde_json::from_str(&text).unwrap_or(serde_json::json!({ "_raw": text }));
        Ok((status, value))
    }

    pub async fn api_status(&self) -> anyhow::Result<serde_json::Value> {
        self.admin_get("/api/v1/status").await
    }

    pub async fn api_peers(&self) -> anyhow::Result<serde_json::Value> {
        self.admin_get("/api/v1/peers").await
    }

    pub async fn api_routes(&self) -> anyhow::Result<serde_json::Value> {
        self.admin_get("/api/v1/routes").await
    }

    /// Advertise a local http route via the admin API.
    pub async fn add_route(&self, name: &str) -> anyhow::Result<()> {
        let (status, body) = self
            .admin_post(
                "/api/v1/routes/create",
                serde_json::json!({ "route": {
                    "name": name,
                    "protocol": "http",
                    "endpoint": format!("http://{name}.local:8080"),
                }}),
            )
            .await?;
        anyhow::ensure!(status == 200, "route create failed ({status}): {body}");
        Ok(())
    }

    pub async fn add_peer(&self, info: PeerInfo) -> anyhow::Result<()> {
        let (status, body) = self
            .admin_post(
                "/api/v1/peers/create",
                serde_json::json!({ "peerInfo": info }),
            )
            .await?;
        anyhow::ensure!(status == 200, "peer create failed ({status}): {body}");
        Ok(())
    }

    pub async fn del_peer(&self, name: &str) -> anyhow::Result<()> {
        let (status, body) = self
            .admin_post("/api/v1/peers/delete", serde_json::json!({ "name": name }))
            .await?;
        anyhow::ensure!(status == 200, "peer delete failed ({status}): {body}");
        Ok(())
    }

    /// Poll /api/v1/peers until `n` peers are connected, or timeout.
    pub async fn wait_connected_peers(&self, n: usize, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                let resp = self.api_peers().await?;
                anyhow::bail!(
                    "{}: timeout waiting for {} connected peers. response: {}",
                    self.name,
                    n,
                    resp
                );
            }
            if let Ok(resp) = self.api_peers().await {
                let connected = resp["connected"].as_u64().unwrap_or(0) as usize;
                if connected >= n {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Poll until the named peer reports the given session status.
    pub async fn wait_peer_status(
        &self,
        peer: &str,
        status: &str,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                let resp = self.api_peers().await?;
                anyhow::bail!(
                    "{}: timeout waiting for peer {} to be {}. response: {}",
                    self.name,
                    peer,
                    status,
                    resp
                );
            }
            if let Ok(resp) = self.api_peers().await {
                let found = resp["peers"].as_array().and_then(|peers| {
                    peers
                        .iter()
                        .find(|p| p["name"] == peer)
                        .and_then(|p| p["status"].as_str())
                });
                if found == Some(status) {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Every learned entry for the named route, as listed by the admin API.
    pub async fn learned_entries(&self, name: &str) -> anyhow::Result<Vec<serde_json::Value>> {
        let resp = self.api_routes().await?;
        Ok(resp["learned"]
            .as_array()
            .map(|learned| {
                learned
                    .iter()
                    .filter(|entry| entry["route"]["name"] == name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Poll until at least one learned entry for `name` exists; returns all
    /// of them.
    pub async fn wait_route(
        &self,
        name: &str,
        timeout: Duration,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let entries = self.learned_entries(name).await.unwrap_or_default();
            if !entries.is_empty() {
                return Ok(entries);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("{}: timeout waiting for learned route {}", self.name, name);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Poll until no learned entry for `name` remains.
    pub async fn wait_route_gone(&self, name: &str, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let entries = self.learned_entries(name).await.unwrap_or_default();
            if entries.is_empty() {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!(
                    "{}: timeout waiting for route {} to be withdrawn: {:?}",
                    self.name,
                    name,
                    entries
                );
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Builder for configuring and spawning a TestNode.
pub struct TestNodeBuilder {
    name: String,
    scheme: &'static str,
    hold_time_secs: u64,
    peers: Vec<PeerInfo>,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            scheme: "http",
            hold_time_secs: 30,
            peers: Vec::new(),
        }
    }

    /// Peer transport scheme: "http" (request/response) or "ws" (socket).
    pub fn scheme(mut self, scheme: &'static str) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn hold_time(mut self, secs: u64) -> Self {
        self.hold_time_secs = secs;
        self
    }

    /// Seed a peer, as a `[[peers]]` config entry would.
    pub fn peer(mut self, info: PeerInfo) -> Self {
        self.peers.push(info);
        self
    }

    pub async fn build(self) -> anyhow::Result<TestNode> {
        let defaults = ProtocolDefaults {
            hold_time_secs: self.hold_time_secs,
            ..DEFAULTS
        };

        let rpc_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let rpc_endpoint = format!("{}://{}/rpc", self.scheme, rpc_listener.local_addr()?);
        let admin_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let admin_addr = admin_listener.local_addr()?.to_string();

        let local = PeerInfo {
            name: self.name.clone(),
            endpoint: Some(rpc_endpoint.clone()),
            domains: Vec::new(),
            peer_token: None,
        };

        let rib = Rib::new(self.name.clone(), defaults);
        let snapshots = Arc::new(SnapshotCell::new());
        let pool = ConnectionPool::new(Duration::from_secs(2), Duration::from_secs(5))?;
        let stats = Arc::new(TransportStats::new());
        let transport = PeerTransport::new(
            local,
            Some(MESH_TOKEN.into()),
            pool.clone(),
            Arc::clone(&stats),
        );

        let (action_tx, action_rx) = mpsc::channel(64);
        let (batch_tx, batch_rx) = mpsc::channel(64);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let handle = ActionHandle::new(action_tx);

        let admin_token = format!("admin-{}", self.name);
        let state = Arc::new(AppState {
            node_name: self.name.clone(),
            admin_token: admin_token.clone(),
            peer_token: MESH_TOKEN.into(),
            start_time: std::time::Instant::now(),
            handle: handle.clone(),
            snapshots: Arc::clone(&snapshots),
            transport_stats: stats,
        });

        let mut handles = Vec::new();

        handles.push(tokio::spawn(rib_task::run_rib_loop(
            rib,
            action_rx,
            snapshots,
            batch_tx,
            self.peers,
            shutdown_tx.subscribe(),
        )));

        handles.push(tokio::spawn(outbound::run_outbound_loop(
            transport,
            handle,
            pool,
            batch_rx,
        )));

        {
            let router = rpc_router(Arc::clone(&state));
            let shutdown = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                axum::serve(rpc_listener, router)
                    .with_graceful_shutdown(async move {
                        let mut shutdown = shutdown;
                        let _ = shutdown.recv().await;
                    })
                    .await
                    .ok();
            }));
        }

        {
            let router = admin_router(state);
            let shutdown = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                axum::serve(admin_listener, router)
                    .with_graceful_shutdown(async move {
                        let mut shutdown = shutdown;
                        let _ = shutdown.recv().await;
                    })
                    .await
                    .ok();
            }));
        }

        Ok(TestNode {
            name: self.name,
            rpc_endpoint,
            admin_addr,
            admin_token,
            shutdown_tx,
            _handles: handles,
        })
    }
}

/// Orchestrates N nodes into a mesh.
pub struct TestMesh {
    pub nodes: Vec<TestNode>,
}

#[allow(dead_code)]
impl TestMesh {
    /// Create N nodes named node-0..node-N-1; each node is seeded with all
    /// prior nodes, so the handshake fan-in converges to a full mesh.
    pub async fn new(n: usize) -> anyhow::Result<Self> {
        Self::with_scheme(n, "http").await
    }

    pub async fn with_scheme(n: usize, scheme: &'static str) -> anyhow::Result<Self> {
        let mut nodes: Vec<TestNode> = Vec::new();
        for i in 0..n {
            let mut builder = TestNodeBuilder::new(&format!("node-{i}")).scheme(scheme);
            for prev in &nodes {
                builder = builder.peer(prev.peer_info());
            }
            nodes.push(builder.build().await?);
        }
        Ok(Self { nodes })
    }

    /// Wait until every node reports every other node connected.
    pub async fn wait_full_mesh(&self, timeout: Duration) -> anyhow::Result<()> {
        let expected = self.nodes.len() - 1;
        for node in &self.nodes {
            node.wait_connected_peers(expected, timeout).await?;
        }
        Ok(())
    }

    pub async fn shutdown_all(self) {
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}
