//! Mesh route propagation and session lifecycle tests.

use std::time::Duration;

use serde_json::json;

use crate::harness::{TestMesh, TestNodeBuilder};

/// Two nodes: a local route shows up on the other side with a one-hop path.
#[tokio::test]
async fn test_two_node_route_exchange() {
    let mesh = TestMesh::new(2).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    mesh.nodes[0].add_route("svc-x").await.unwrap();

    let entries = mesh.nodes[1]
        .wait_route("svc-x", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["peer"], "node-0");
    assert_eq!(entries[0]["node_path"], json!(["node-0"]));
    assert_eq!(entries[0]["route"]["protocol"], "http");

    // The announcer never hears its own route back.
    let own = mesh.nodes[0].learned_entries("svc-x").await.unwrap();
    assert!(own.is_empty(), "route echoed to its announcer: {own:?}");

    mesh.shutdown_all().await;
}

/// A -> B -> C chain: the path accumulates one hop per re-announcement.
#[tokio::test]
async fn test_chain_accumulates_path() {
    let node_a = TestNodeBuilder::new("edge-a").build().await.unwrap();
    let node_b = TestNodeBuilder::new("edge-b")
        .peer(node_a.peer_info())
        .build()
        .await
        .unwrap();
    let node_c = TestNodeBuilder::new("edge-c")
        .peer(node_b.peer_info())
        .build()
        .await
        .unwrap();

    node_a
        .wait_connected_peers(1, Duration::from_secs(10))
        .await
        .unwrap();
    node_b
        .wait_connected_peers(2, Duration::from_secs(10))
        .await
        .unwrap();
    node_c
        .wait_connected_peers(1, Duration::from_secs(10))
        .await
        .unwrap();

    node_a.add_route("svc-chain").await.unwrap();

    let at_b = node_b
        .wait_route("svc-chain", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(at_b[0]["peer"], "edge-a");
    assert_eq!(at_b[0]["node_path"], json!(["edge-a"]));

    let at_c = node_c
        .wait_route("svc-chain", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(at_c[0]["peer"], "edge-b");
    assert_eq!(at_c[0]["node_path"], json!(["edge-b", "edge-a"]));

    node_c.shutdown().await;
    node_b.shutdown().await;
    node_a.shutdown().await;
}

/// Deleting a peer closes its session and withdraws its routes downstream.
#[tokio::test]
async fn test_peer_delete_withdraws_routes() {
    let hub = TestNodeBuilder::new("edge-a").build().await.unwrap();
    let node_b = TestNodeBuilder::new("edge-b")
        .peer(hub.peer_info())
        .build()
        .await
        .unwrap();
    let node_c = TestNodeBuilder::new("edge-c")
        .peer(hub.peer_info())
        .build()
        .await
        .unwrap();

    hub.wait_connected_peers(2, Duration::from_secs(10))
        .await
        .unwrap();

    node_b.add_route("svc-y").await.unwrap();
    let at_c = node_c
        .wait_route("svc-y", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(at_c[0]["peer"], "edge-a");
    assert_eq!(at_c[0]["node_path"], json!(["edge-a", "edge-b"]));

    hub.del_peer("edge-b").await.unwrap();

    // The surviving spoke sees the withdrawal; the deleted peer gets a
    // close and marks the hub's session down.
    node_c
        .wait_route_gone("svc-y", Duration::from_secs(10))
        .await
        .unwrap();
    node_b
        .wait_peer_status("edge-a", "closed", Duration::from_secs(10))
        .await
        .unwrap();

    // A delete removes the record entirely; a close only marks it.
    let peers = hub.api_peers().await.unwrap();
    assert!(
        peers["peers"]
            .as_array()
            .unwrap()
            .iter()
            .all(|p| p["name"] != "edge-b"),
        "deleted peer still listed: {peers}"
    );

    node_c.shutdown().await;
    node_b.shutdown().await;
    hub.shutdown().await;
}

/// Full triangle: announcements that loop back to their origin are stored
/// with the origin on the path and never re-announced, so the mesh settles.
#[tokio::test]
async fn test_loop_suppression_triangle() {
    let mesh = TestMesh::new(3).await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    mesh.nodes[0].add_route("svc-x").await.unwrap();
    for node in &mesh.nodes[1..] {
        node.wait_route("svc-x", Duration::from_secs(10))
            .await
            .unwrap();
    }

    // Let the second-hop re-announcements land.
    tokio::time::sleep(Duration::from_secs(2)).await;

    // The direct copy keeps its one-hop path; churn would have grown it.
    let entries = mesh.nodes[1].learned_entries("svc-x").await.unwrap();
    let direct: Vec<_> = entries.iter().filter(|e| e["peer"] == "node-0").collect();
    assert_eq!(direct.len(), 1, "entries: {entries:?}");
    assert_eq!(direct[0]["node_path"], json!(["node-0"]));

    // Copies that travelled the long way around reach the announcer with
    // its own name on the path. They stay quarantined in the table.
    let own = mesh.nodes[0].learned_entries("svc-x").await.unwrap();
    assert!(!own.is_empty(), "expected looped copies at the announcer");
    for entry in &own {
        let path = entry["node_path"].as_array().unwrap();
        assert!(
            path.iter().any(|hop| hop == "node-0"),
            "looped copy without the announcer on its path: {entry}"
        );
    }

    mesh.shutdown_all().await;
}

/// A crashed peer degrades after one hold time of silence and closes after
/// three, taking its routes with it.
#[tokio::test]
async fn test_hold_timer_degrades_then_closes() {
    let node_a = TestNodeBuilder::new("edge-a")
        .hold_time(3)
        .build()
        .await
        .unwrap();
    let node_b = TestNodeBuilder::new("edge-b")
        .hold_time(3)
        .peer(node_a.peer_info())
        .build()
        .await
        .unwrap();

    node_a
        .wait_connected_peers(1, Duration::from_secs(10))
        .await
        .unwrap();
    node_b.add_route("svc-hold").await.unwrap();
    node_a
        .wait_route("svc-hold", Duration::from_secs(10))
        .await
        .unwrap();

    node_b.kill().await;

    node_a
        .wait_peer_status("edge-b", "degraded", Duration::from_secs(8))
        .await
        .unwrap();
    node_a
        .wait_peer_status("edge-b", "closed", Duration::from_secs(15))
        .await
        .unwrap();
    node_a
        .wait_route_gone("svc-hold", Duration::from_secs(5))
        .await
        .unwrap();

    node_a.shutdown().await;
}

/// An idle but healthy session outlives several hold windows on keepalives
/// alone.
#[tokio::test]
async fn test_keepalives_sustain_idle_session() {
    let node_a = TestNodeBuilder::new("edge-a")
        .hold_time(3)
        .build()
        .await
        .unwrap();
    let node_b = TestNodeBuilder::new("edge-b")
        .hold_time(3)
        .peer(node_a.peer_info())
        .build()
        .await
        .unwrap();

    node_a
        .wait_connected_peers(1, Duration::from_secs(10))
        .await
        .unwrap();
    node_b
        .wait_connected_peers(1, Duration::from_secs(10))
        .await
        .unwrap();

    // Three close windows of silence on the route side.
    tokio::time::sleep(Duration::from_secs(10)).await;

    let at_a = node_a.api_peers().await.unwrap();
    assert_eq!(at_a["connected"], 1, "session dropped at edge-a: {at_a}");
    let at_b = node_b.api_peers().await.unwrap();
    assert_eq!(at_b["connected"], 1, "session dropped at edge-b: {at_b}");

    node_b.shutdown().await;
    node_a.shutdown().await;
}

/// Same exchange over persistent sockets instead of request/response.
#[tokio::test]
async fn test_socket_transport_route_exchange() {
    let mesh = TestMesh::with_scheme(2, "ws").await.unwrap();
    mesh.wait_full_mesh(Duration::from_secs(10)).await.unwrap();

    mesh.nodes[0].add_route("svc-ws").await.unwrap();

    let entries = mesh.nodes[1]
        .wait_route("svc-ws", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(entries[0]["peer"], "node-0");
    assert_eq!(entries[0]["node_path"], json!(["node-0"]));

    mesh.shutdown_all().await;
}
