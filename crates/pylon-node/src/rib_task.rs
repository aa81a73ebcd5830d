//! The single-writer RIB task.
//!
//! Owns the `Rib`: every state change in the node funnels through this
//! loop's mpsc queue and commits in arrival order. Committed snapshots are
//! published through the watch cell; the propagation batch of each commit
//! is handed to the outbound dispatcher and never awaited here, so commit
//! latency is independent of peer reachability.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};

use pylon_api::ActionRequest;
use pylon_protocol::{Action, PeerInfo, Propagation, PropagationPayload, CLOSE_SHUTDOWN};
use pylon_rib::{Rib, RibState, SnapshotCell};

/// Run the RIB loop until shutdown or until every action sender is gone.
pub async fn run_rib_loop(
    mut rib: Rib,
    mut actions: mpsc::Receiver<ActionRequest>,
    snapshots: Arc<SnapshotCell>,
    outbound: mpsc::Sender<Vec<Propagation>>,
    seed_peers: Vec<PeerInfo>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut published = rib.state();
    snapshots.set(Arc::clone(&published));

    // Statically configured peers register before the first request is
    // served; each registration opens the outbound handshake.
    for info in seed_peers {
        let name = info.name.clone();
        match rib.apply(&Action::LocalPeerCreate { peer_info: info }) {
            Ok((state, propagations)) => {
                tracing::info!(peer = %name, "seeded peer from config");
                publish(&snapshots, &mut published, state);
                forward(&outbound, propagations).await;
            }
            Err(e) => tracing::warn!(peer = %name, error = %e, "seed peer rejected"),
        }
    }

    let tick_every = Duration::from_secs(rib.defaults().keepalive_interval_secs().max(1));
    let mut ticker = tokio::time::interval(tick_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            request = actions.recv() => {
                let Some(ActionRequest { action, reply }) = request else {
                    tracing::info!("action queue closed");
                    break;
                };
                let kind = action.kind();
                match rib.apply(&action) {
                    Ok((state, propagations)) => {
                        tracing::debug!(
                            action = kind,
                            version = state.version,
                            propagations = propagations.len(),
                            "action committed"
                        );
                        publish(&snapshots, &mut published, Arc::clone(&state));
                        forward(&outbound, propagations).await;
                        let _ = reply.send(Ok(state));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }

            _ = ticker.tick() => {
                // Tick cannot be rejected.
                if let Ok((state, propagations)) = rib.apply(&Action::Tick { at: Utc::now() }) {
                    publish(&snapshots, &mut published, state);
                    forward(&outbound, propagations).await;
                }
            }

            _ = shutdown.recv() => {
                // Tell every live session we are going away while the
                // dispatcher is still running.
                let closes: Vec<Propagation> = rib
                    .state()
                    .connected_peers()
                    .map(|record| Propagation {
                        peer: record.info.clone(),
                        payload: PropagationPayload::Close {
                            code: CLOSE_SHUTDOWN,
                            reason: Some("node shutting down".into()),
                        },
                    })
                    .collect();
                forward(&outbound, closes).await;
                break;
            }
        }
    }
    tracing::info!("RIB task stopped");
}

/// Publish a committed snapshot, skipping no-op commits (a quiet tick
/// returns the same `Arc`).
fn publish(snapshots: &SnapshotCell, published: &mut Arc<RibState>, state: Arc<RibState>) {
    if Arc::ptr_eq(published, &state) {
        return;
    }
    snapshots.set(Arc::clone(&state));
    *published = state;
}

async fn forward(outbound: &mpsc::Sender<Vec<Propagation>>, propagations: Vec<Propagation>) {
    if propagations.is_empty() {
        return;
    }
    if outbound.send(propagations).await.is_err() {
        tracing::warn!("outbound dispatcher gone, dropping propagation batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pylon_api::ActionHandle;
    use pylon_protocol::{ConnectionStatus, ProtocolDefaults, Route, RouteProtocol, DEFAULTS};

    struct TaskUnderTest {
        handle: ActionHandle,
        snapshots: Arc<SnapshotCell>,
        batches: mpsc::Receiver<Vec<Propagation>>,
        shutdown: broadcast::Sender<()>,
    }

    fn spawn_task(defaults: ProtocolDefaults, seed_peers: Vec<PeerInfo>) -> TaskUnderTest {
        let (action_tx, action_rx) = mpsc::channel(16);
        let (batch_tx, batch_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let snapshots = Arc::new(SnapshotCell::new());
        tokio::spawn(run_rib_loop(
            Rib::new("edge-a", defaults),
            action_rx,
            Arc::clone(&snapshots),
            batch_tx,
            seed_peers,
            shutdown_rx,
        ));
        TaskUnderTest {
            handle: ActionHandle::new(action_tx),
            snapshots,
            batches: batch_rx,
            shutdown: shutdown_tx,
        }
    }

    fn peer(name: &str) -> PeerInfo {
        PeerInfo {
            name: name.into(),
            endpoint: Some(format!("http://{name}:7100/rpc")),
            domains: Vec::new(),
            peer_token: None,
        }
    }

    fn route(name: &str) -> Route {
        Route {
            name: name.into(),
            protocol: RouteProtocol::Http,
            endpoint: format!("http://{name}:8080"),
            region: None,
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_seed_peers_open_at_startup() {
        let mut task = spawn_task(DEFAULTS, vec![peer("edge-b")]);

        let batch = task.batches.recv().await.expect("seed batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].peer.name, "edge-b");
        assert_eq!(batch[0].payload.kind(), "open");

        let snapshot = task.snapshots.get().unwrap();
        assert_eq!(
            snapshot.peer("edge-b").unwrap().status,
            ConnectionStatus::Initializing
        );
    }

    #[tokio::test]
    async fn test_commit_publishes_and_forwards() {
        let mut task = spawn_task(DEFAULTS, vec![]);

        task.handle
            .submit(Action::InternalProtocolOpen {
                peer_info: peer("edge-b"),
                hold_time: None,
                at: Utc::now(),
            })
            .await
            .unwrap();
        // Open-back to the newly connected peer.
        let batch = task.batches.recv().await.expect("open batch");
        assert_eq!(batch[0].payload.kind(), "open");

        let state = task
            .handle
            .submit(Action::LocalRouteCreate { route: route("svc-x") })
            .await
            .unwrap();
        assert_eq!(state.local.routes.len(), 1);
        assert_eq!(task.snapshots.get().unwrap().version, state.version);

        let batch = task.batches.recv().await.expect("update batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].peer.name, "edge-b");
        assert_eq!(batch[0].payload.kind(), "update");
    }

    #[tokio::test]
    async fn test_rejection_replies_without_commit() {
        let task = spawn_task(DEFAULTS, vec![]);
        // The spawned loop publishes the initial snapshot only once polled.
        tokio::task::yield_now().await;
        let before = task.snapshots.get().unwrap().version;

        let err = task
            .handle
            .submit(Action::LocalPeerDelete { name: "ghost".into() })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown peer"));
        assert_eq!(task.snapshots.get().unwrap().version, before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_emits_keepalives_without_republishing() {
        let defaults = ProtocolDefaults {
            hold_time_secs: 9,
            ..DEFAULTS
        };
        let mut task = spawn_task(defaults, vec![]);

        task.handle
            .submit(Action::InternalProtocolOpen {
                peer_info: peer("edge-b"),
                hold_time: None,
                at: Utc::now(),
            })
            .await
            .unwrap();
        let _open_back = task.batches.recv().await.unwrap();
        let version = task.snapshots.get().unwrap().version;

        // One keepalive interval elapses; the peer stays fresh (wall-clock
        // silence is far below the hold time), so the snapshot must not
        // churn while the keepalive still goes out.
        let batch = task.batches.recv().await.expect("keepalive batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].peer.name, "edge-b");
        assert_eq!(batch[0].payload.kind(), "keepalive");
        assert_eq!(task.snapshots.get().unwrap().version, version);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connected_peers() {
        let mut task = spawn_task(DEFAULTS, vec![]);

        task.handle
            .submit(Action::InternalProtocolOpen {
                peer_info: peer("edge-b"),
                hold_time: None,
                at: Utc::now(),
            })
            .await
            .unwrap();
        let _open_back = task.batches.recv().await.unwrap();

        task.shutdown.send(()).unwrap();
        let batch = task.batches.recv().await.expect("close batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload.kind(), "close");
        match &batch[0].payload {
            PropagationPayload::Close { code, .. } => assert_eq!(*code, CLOSE_SHUTDOWN),
            other => panic!("wrong payload: {}", other.kind()),
        }

        // The channel closes once the task drops its sender.
        assert!(task.batches.recv().await.is_none());
    }
}
