//! Full socket-based integration tests for client ↔ server communication.

use std::time::Duration;

use arena_client::{
    client::ClientLink,
    view::{JoinState, WorldView},
};
use arena_shared::{
    collision::Bounds,
    ecs::{EntityId, Kind},
    math::Vec2,
    net::{ClientCommand, Envelope, Event, ServerMessage, MAX_FRAME_LEN},
};
use arena_tests::{init_tracing, test_config, RawClient, RunningServer};
use tokio::net::TcpSocket;

fn full_update(msg: &ServerMessage) -> Option<arena_shared::net::FullUpdate> {
    match msg {
        ServerMessage::FullUpdate(u) => Some(u.clone()),
        _ => None,
    }
}

/// Waits for a snapshot in which `player` moves horizontally at `speed`.
async fn wait_for_steer(client: &mut RawClient, player: EntityId, speed: f32) -> anyhow::Result<()> {
    for _ in 0..100 {
        let update = client.recv_until(full_update).await?;
        let v = update.entities[player.index()].velocity;
        if v.x.abs() == speed && v.y == 0.0 {
            return Ok(());
        }
    }
    anyhow::bail!("player {player} never picked up the steer")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn join_then_full_updates() -> anyhow::Result<()> {
    init_tracing();
    let server = RunningServer::start(test_config()).await?;

    let (mut client, player) = RawClient::join(server.addr).await?;
    let update = client.recv_until(full_update).await?;

    let cfg = test_config();
    assert_eq!(update.entities.len(), cfg.sim.entity_capacity);
    let me = update.entities[player.index()];
    assert!(me.in_use);
    assert_eq!(me.kind, Kind::Player);
    assert_eq!(update.leaderboard.len(), 1);
    assert_eq!(update.leaderboard[0].player, player);
    assert!(update.remaining_secs > 0.0);

    let stars = update.entities.iter().filter(|r| r.in_use && r.kind == Kind::Star).count();
    assert!(stars >= cfg.sim.min_stars);

    server.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn steer_reaches_the_world() -> anyhow::Result<()> {
    init_tracing();
    let server = RunningServer::start(test_config()).await?;
    let (mut client, player) = RawClient::join(server.addr).await?;

    client.send(ClientCommand::Steer(Vec2::new(1.0, 0.0))).await?;
    wait_for_steer(&mut client, player, test_config().sim.player_speed).await?;

    server.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frame_split_across_writes_is_reassembled() -> anyhow::Result<()> {
    init_tracing();
    let server = RunningServer::start(test_config()).await?;
    let (mut client, player) = RawClient::join(server.addr).await?;

    let frame = ClientCommand::Steer(Vec2::new(-1.0, 0.0)).to_envelope(-1).encode_frame();
    client.send_raw(&frame[..3]).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.send_raw(&frame[3..11]).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.send_raw(&frame[11..]).await?;

    wait_for_steer(&mut client, player, test_config().sim.player_speed).await?;

    server.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_messages_keep_the_connection() -> anyhow::Result<()> {
    init_tracing();
    let server = RunningServer::start(test_config()).await?;
    let (mut client, player) = RawClient::join(server.addr).await?;

    // Garbage body behind a valid length prefix.
    client.send_raw(&[0, 0, 0, 3, 1, 2, 3]).await?;
    // Well-formed envelope, wrong direction of travel.
    let bogus = Envelope::new(-1, "", Event::JoinAcknowledge, vec![1.0]).encode_frame();
    client.send_raw(&bogus).await?;
    // Steer with a missing component.
    let short = Envelope::new(-1, "", Event::RequestSteer, vec![1.0]).encode_frame();
    client.send_raw(&short).await?;

    client.send(ClientCommand::Steer(Vec2::new(1.0, 0.0))).await?;
    wait_for_steer(&mut client, player, test_config().sim.player_speed).await?;

    server.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_frame_closes_the_connection() -> anyhow::Result<()> {
    init_tracing();
    let server = RunningServer::start(test_config()).await?;
    let (mut client, _player) = RawClient::join(server.addr).await?;

    client.send_raw(&((MAX_FRAME_LEN + 1) as u32).to_be_bytes()).await?;

    let mut closed = false;
    for _ in 0..1000 {
        match client.recv_frame().await {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => {
                closed = true;
                break;
            }
        }
    }
    assert!(closed, "server kept the connection open");

    let server = server.stop().await?;
    assert_eq!(server.world().roster().len(), 0);
    assert_eq!(server.world().store().count_live(Kind::Player), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_server_rejects_and_closes() -> anyhow::Result<()> {
    init_tracing();
    let mut cfg = test_config();
    cfg.max_clients = 1;
    let server = RunningServer::start(cfg).await?;

    let (_first, _) = RawClient::join(server.addr).await?;
    let mut second = RawClient::connect(server.addr).await?;
    match second.recv().await? {
        ServerMessage::JoinReject { reason } => assert_eq!(reason, "server full"),
        other => panic!("expected join-reject, got {other:?}"),
    }
    assert!(second.recv_frame().await?.is_none());

    let server = server.stop().await?;
    assert_eq!(server.world().roster().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn capacity_reject_is_reported_and_server_keeps_serving() -> anyhow::Result<()> {
    init_tracing();
    let mut cfg = test_config();
    // Four stars plus one player fill the table.
    cfg.sim.entity_capacity = 5;
    cfg.sim.min_stars = 4;
    cfg.sim.trap_count = 0;
    let server = RunningServer::start(cfg).await?;

    let (first, _) = RawClient::join(server.addr).await?;
    let mut refused = RawClient::connect(server.addr).await?;
    match refused.recv().await? {
        ServerMessage::JoinReject { reason } => assert!(reason.contains("entity table full"), "{reason}"),
        other => panic!("expected join-reject, got {other:?}"),
    }
    assert!(refused.recv_frame().await?.is_none());

    drop(first);
    let mut joined = None;
    for _ in 0..100 {
        let mut client = RawClient::connect(server.addr).await?;
        if let ServerMessage::JoinAcknowledge { player } = client.recv().await? {
            joined = Some((client, player));
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let (mut client, player) = joined.expect("slot never freed after disconnect");
    let update = client.recv_until(full_update).await?;
    assert!(update.entities[player.index()].in_use);
    assert_eq!(update.leaderboard.len(), 1);

    let server = server.stop().await?;
    assert_eq!(server.world().roster().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_removes_player_and_roster_entry() -> anyhow::Result<()> {
    init_tracing();
    let server = RunningServer::start(test_config()).await?;

    let (mut observer, observer_id) = RawClient::join(server.addr).await?;
    let (leaver, leaver_id) = RawClient::join(server.addr).await?;
    observer
        .recv_until(|m| full_update(m).filter(|u| u.leaderboard.len() == 2))
        .await?;

    drop(leaver);
    let update = observer
        .recv_until(|m| full_update(m).filter(|u| u.leaderboard.len() == 1))
        .await?;
    assert_eq!(update.leaderboard[0].player, observer_id);
    assert!(!update.entities[leaver_id.index()].in_use || update.entities[leaver_id.index()].kind != Kind::Player);

    let server = server.stop().await?;
    assert_eq!(server.world().store().count_live(Kind::Player), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_client_does_not_block_others() -> anyhow::Result<()> {
    init_tracing();
    let mut cfg = test_config();
    // Large snapshots so the stalled socket fills up quickly.
    cfg.sim.entity_capacity = 2000;
    cfg.sim.history_depth = 8;
    let server = RunningServer::start(cfg).await?;

    // Connects, never reads.
    let socket = TcpSocket::new_v4()?;
    socket.set_recv_buffer_size(4096)?;
    let _stalled = socket.connect(server.addr).await?;

    let (mut fast, _) = RawClient::join(server.addr).await?;
    for _ in 0..150 {
        fast.recv_until(full_update).await?;
    }

    let server = server.stop().await?;
    let skipped: Vec<u64> = server.connections().map(|c| c.skipped()).collect();
    assert_eq!(skipped.len(), 2);
    assert!(skipped.iter().any(|&s| s > 0), "no snapshot was skipped: {skipped:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_link_joins_and_steers() -> anyhow::Result<()> {
    init_tracing();
    let cfg = test_config();
    let server = RunningServer::start(cfg.clone()).await?;

    let mut link = ClientLink::spawn(&server.addr.to_string(), cfg.link_queue_capacity)?;
    let mut view = WorldView::new(
        Bounds::new(cfg.sim.half_width, cfg.sim.half_height),
        Vec2::new(800.0, 600.0),
    );

    let mut steered = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        for msg in link.poll() {
            view.apply(msg);
        }
        if let Some(me) = view.local_record() {
            if !steered {
                link.send(ClientCommand::Steer(Vec2::new(0.0, 1.0)))?;
                steered = true;
            } else if me.velocity.y.abs() == cfg.sim.player_speed {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(matches!(view.join_state(), JoinState::Joined(_)));
    let me = view.local_record().copied();
    assert_eq!(me.map(|r| r.velocity.y.abs()), Some(cfg.sim.player_speed));
    assert!(view.updates() > 0);
    assert_eq!(view.leaderboard().len(), 1);

    link.close();
    server.stop().await?;
    Ok(())
}
