//! Outbound dispatcher -- delivers committed propagation batches.
//!
//! Batches arrive in commit order and each one is fanned out fully before
//! the next starts, so every peer observes this node's transitions in the
//! order they committed. Delivery failures stay here: they are logged and
//! counted by the transport and never bounce back into the RIB.

use chrono::Utc;
use tokio::sync::mpsc;

use pylon_api::ActionHandle;
use pylon_protocol::{Action, Propagation};
use pylon_transport::{ConnectionPool, PeerTransport};

/// Run the dispatcher until the batch channel closes.
pub async fn run_outbound_loop(
    transport: PeerTransport,
    handle: ActionHandle,
    pool: ConnectionPool,
    mut batches: mpsc::Receiver<Vec<Propagation>>,
) {
    while let Some(batch) = batches.recv().await {
        // Endpoint per slot; outcomes only carry the peer name.
        let endpoints: Vec<Option<String>> =
            batch.iter().map(|p| p.peer.endpoint.clone()).collect();

        let outcomes = transport.fan_out(batch).await;

        for (outcome, endpoint) in outcomes.iter().zip(&endpoints) {
            match outcome.payload {
                // A delivered open completes our half of the handshake.
                "open" if outcome.is_ok() => {
                    let handle = handle.clone();
                    let name = outcome.peer.clone();
                    // Detached: the RIB task is also the producer of this
                    // loop's batches, so awaiting a round trip here could
                    // deadlock against a full batch channel.
                    tokio::spawn(async move {
                        if let Err(e) = handle
                            .submit(Action::InternalProtocolConnected {
                                name: name.clone(),
                                at: Utc::now(),
                            })
                            .await
                        {
                            tracing::debug!(peer = %name, error = %e, "connected ack dropped");
                        }
                    });
                }
                // The session is over whether or not the peer heard us.
                "close" => {
                    if let Some(endpoint) = endpoint {
                        pool.evict(endpoint).await;
                    }
                }
                _ => {}
            }
        }
    }
    tracing::info!("outbound dispatcher stopped");
}
