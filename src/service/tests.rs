#![allow(clippy::panic)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use super::{ConnectionPool, EventHandler};
use crate::domain::{
    ClientProfile, ConnectionId, ConnectionState, EventFlags, Permission, PoolEvent, PoolFlags,
};
use crate::error::RelayError;
use crate::transport::Message;
use crate::transport::mock::{MockConnector, MockNetwork};

/// Far enough to be past any backoff interval.
const PAST_BACKOFF: Duration = Duration::from_secs(7200);

struct Fixture {
    _dir: TempDir,
    net: MockNetwork,
    pool: ConnectionPool<MockConnector>,
}

fn fixture() -> Fixture {
    let Ok(dir) = tempfile::tempdir() else {
        panic!("cannot create temp dir");
    };
    let net = MockNetwork::new();
    let profile = ClientProfile::new("sensor", 7, dir.path());
    let pool = ConnectionPool::new(
        MockConnector::new(net.clone()),
        profile,
        Permission::IDMEF_WRITE,
    );
    Fixture {
        _dir: dir,
        net,
        pool,
    }
}

async fn started(expr: &str, up: &[&str]) -> Fixture {
    let fx = fixture();
    for addr in up {
        fx.net.set_reachable(addr, true);
    }
    if let Err(err) = fx.pool.set_connection_string(expr).await {
        panic!("connection string rejected: {err}");
    }
    if let Err(err) = fx.pool.init().await {
        panic!("init failed: {err}");
    }
    fx
}

fn msg(payload: &str) -> Message {
    let Ok(msg) = Message::idmef(payload) else {
        panic!("valid message");
    };
    msg
}

fn payloads(items: &[&str]) -> Vec<Vec<u8>> {
    items.iter().map(|s| s.as_bytes().to_vec()).collect()
}

async fn id_of(pool: &ConnectionPool<MockConnector>, addr: &str) -> ConnectionId {
    let Some(info) = pool
        .connections()
        .await
        .into_iter()
        .find(|info| info.addr == addr)
    else {
        panic!("no connection to {addr}");
    };
    info.id
}

async fn backlog_of(pool: &ConnectionPool<MockConnector>, addr: &str) -> usize {
    let id = id_of(pool, addr).await;
    pool.connection(id).await.map_or(usize::MAX, |info| info.backlog)
}

#[tokio::test]
async fn broadcast_reaches_every_member_of_first_group() {
    let fx = started("a && b || c", &["a", "b", "c"]).await;
    fx.pool.broadcast(&msg("m1")).await;

    assert_eq!(fx.net.delivered("a"), payloads(&["m1"]));
    assert_eq!(fx.net.delivered("b"), payloads(&["m1"]));
    assert!(fx.net.delivered("c").is_empty());
}

#[tokio::test]
async fn dead_member_spools_while_partner_receives() {
    let fx = started("a && b || c", &["b", "c"]).await;
    fx.pool.broadcast(&msg("m1")).await;
    fx.pool.broadcast(&msg("m2")).await;

    assert_eq!(fx.net.delivered("b"), payloads(&["m1", "m2"]));
    assert!(fx.net.delivered("c").is_empty());
    assert_eq!(backlog_of(&fx.pool, "a").await, 2);
    assert_eq!(fx.pool.global_backlog().await, 0);
}

#[tokio::test]
async fn reconnected_member_gets_backlog_before_new_messages() {
    let fx = started("a && b || c", &["b", "c"]).await;
    fx.pool.broadcast(&msg("m1")).await;
    fx.pool.broadcast(&msg("m2")).await;

    fx.net.set_reachable("a", true);
    fx.pool.run_timers_at(Instant::now() + PAST_BACKOFF).await;
    fx.pool.broadcast(&msg("m3")).await;

    assert_eq!(fx.net.delivered("a"), payloads(&["m1", "m2", "m3"]));
    assert_eq!(fx.net.delivered("b"), payloads(&["m1", "m2", "m3"]));
    assert_eq!(backlog_of(&fx.pool, "a").await, 0);
}

#[tokio::test]
async fn fully_dead_group_is_skipped() {
    let fx = started("a || b", &["b"]).await;
    fx.pool.broadcast(&msg("m1")).await;

    assert_eq!(fx.net.delivered("b"), payloads(&["m1"]));
    assert_eq!(backlog_of(&fx.pool, "a").await, 0);
    assert_eq!(fx.pool.global_backlog().await, 0);
}

#[tokio::test]
async fn all_groups_down_spools_globally_once() {
    let fx = started("a || b", &[]).await;
    fx.pool.broadcast(&msg("m1")).await;
    fx.pool.broadcast(&msg("m2")).await;

    assert_eq!(fx.pool.global_backlog().await, 2);
    assert_eq!(backlog_of(&fx.pool, "a").await, 0);
    assert_eq!(backlog_of(&fx.pool, "b").await, 0);

    fx.net.set_reachable("b", true);
    fx.pool.run_timers_at(Instant::now() + PAST_BACKOFF).await;

    assert_eq!(fx.net.delivered("b"), payloads(&["m1", "m2"]));
    assert_eq!(fx.pool.global_backlog().await, 0);
    assert!(fx.net.delivered("a").is_empty());
}

#[tokio::test]
async fn global_backlog_flushes_at_init() {
    let fx = fixture();
    if let Err(err) = fx.pool.set_connection_string("a").await {
        panic!("connection string rejected: {err}");
    }
    fx.pool.broadcast(&msg("early")).await;
    assert_eq!(fx.pool.global_backlog().await, 1);

    fx.net.set_reachable("a", true);
    assert!(fx.pool.init().await.is_ok());
    assert_eq!(fx.net.delivered("a"), payloads(&["early"]));
    assert_eq!(fx.pool.global_backlog().await, 0);
}

#[tokio::test]
async fn backoff_doubles_then_resets_on_success() {
    let fx = started("a", &[]).await;
    let id = id_of(&fx.pool, "a").await;
    let retry = |pool: &ConnectionPool<MockConnector>| {
        let pool = pool.clone();
        async move { pool.connection(id).await.map_or(0, |i| i.retry_interval_secs) }
    };
    assert_eq!(retry(&fx.pool).await, 10);

    let start = Instant::now();
    fx.pool.run_timers_at(start + PAST_BACKOFF).await;
    assert_eq!(retry(&fx.pool).await, 20);
    fx.pool.run_timers_at(start + PAST_BACKOFF * 2).await;
    assert_eq!(retry(&fx.pool).await, 40);
    assert_eq!(fx.net.connect_attempts("a"), 3);

    fx.net.set_reachable("a", true);
    fx.pool.run_timers_at(start + PAST_BACKOFF * 3).await;
    let Some(info) = fx.pool.connection(id).await else {
        panic!("connection vanished");
    };
    assert_eq!(info.state, ConnectionState::Alive);
    assert_eq!(info.retry_interval_secs, 10);
}

#[tokio::test]
async fn timers_are_not_armed_without_reconnect() {
    let fx = fixture();
    fx.pool.set_flags(PoolFlags::FAILOVER).await;
    assert!(fx.pool.set_connection_string("a").await.is_ok());
    assert!(fx.pool.init().await.is_ok());

    fx.net.set_reachable("a", true);
    fx.pool.run_timers_at(Instant::now() + PAST_BACKOFF).await;
    assert_eq!(fx.net.connect_attempts("a"), 1);
}

#[tokio::test]
async fn failover_disabled_drops_undeliverable_messages() {
    let fx = fixture();
    fx.pool.set_flags(PoolFlags::RECONNECT).await;
    assert_eq!(fx.pool.flags().await, PoolFlags::RECONNECT);
    assert!(fx.pool.set_connection_string("a").await.is_ok());
    assert!(fx.pool.init().await.is_ok());

    fx.pool.broadcast(&msg("lost")).await;
    assert_eq!(fx.pool.global_backlog().await, 0);
    assert!(!fx.pool.profile().global_backup_dir().exists());
}

#[tokio::test]
async fn send_failure_demotes_and_spools() {
    let fx = started("a && b", &["a", "b"]).await;
    let mut events = fx.pool.subscribe();
    fx.net.set_reachable("b", false);
    fx.pool.broadcast(&msg("m1")).await;

    assert_eq!(fx.net.delivered("a"), payloads(&["m1"]));
    let b = id_of(&fx.pool, "b").await;
    let Some(info) = fx.pool.connection(b).await else {
        panic!("connection vanished");
    };
    assert_eq!(info.state, ConnectionState::Dead);
    assert_eq!(info.backlog, 1);

    let Ok(first) = events.try_recv() else {
        panic!("expected an event");
    };
    assert_eq!(first.event_type_str(), "connection_dead");
    let Ok(second) = events.try_recv() else {
        panic!("expected an event");
    };
    assert_eq!(second.event_type_str(), "spooled");
}

#[tokio::test]
async fn external_liveness_overrides() {
    let fx = started("a && b", &["a", "b"]).await;
    let a = id_of(&fx.pool, "a").await;

    assert!(fx.pool.set_connection_dead(a).await.is_ok());
    fx.pool.broadcast(&msg("m1")).await;
    assert!(fx.net.delivered("a").is_empty());
    assert_eq!(fx.net.delivered("b"), payloads(&["m1"]));
    assert_eq!(backlog_of(&fx.pool, "a").await, 1);

    assert!(fx.pool.set_connection_alive(a).await.is_ok());
    assert_eq!(fx.net.delivered("a"), payloads(&["m1"]));
    assert_eq!(backlog_of(&fx.pool, "a").await, 0);

    let stale = ConnectionId::new(99, 0);
    assert!(matches!(
        fx.pool.set_connection_dead(stale).await,
        Err(RelayError::ConnectionNotFound(_))
    ));
}

#[tokio::test]
async fn invalid_connection_string_keeps_topology() {
    let fx = started("a || b", &["a"]).await;
    let result = fx.pool.set_connection_string("a && && b").await;
    assert!(matches!(result, Err(RelayError::InvalidTopology(_))));
    assert_eq!(fx.pool.connection_string().await, "a || b");
    assert_eq!(fx.pool.connections().await.len(), 2);
}

#[tokio::test]
async fn repeated_address_is_an_invalid_topology() {
    let fx = started("a || b", &["a"]).await;
    let Err(RelayError::InvalidTopology(reason)) = fx.pool.set_connection_string("a && a").await
    else {
        panic!("repeated address should be rejected");
    };
    assert!(reason.contains("more than once"), "{reason}");
    assert_eq!(fx.pool.connection_string().await, "a || b");
    assert_eq!(fx.pool.connections().await.len(), 2);
}

#[tokio::test]
async fn path_like_addresses_get_private_journals() {
    let fx = started("global && .. && .", &["global"]).await;
    fx.pool.broadcast(&msg("m1")).await;

    assert_eq!(fx.net.delivered("global"), payloads(&["m1"]));
    assert_eq!(backlog_of(&fx.pool, "..").await, 1);
    assert_eq!(backlog_of(&fx.pool, ".").await, 1);
    assert_eq!(fx.pool.global_backlog().await, 0);

    let root = fx._dir.path();
    let connections = root.join("connections");
    assert!(connections.join("%2E.").join("data").exists());
    assert!(connections.join("%2E").join("data").exists());
    assert!(!root.join("data").exists());
}

#[tokio::test]
async fn replacing_topology_keeps_backlog_of_known_address() {
    let fx = started("a && b", &["b"]).await;
    fx.pool.broadcast(&msg("kept")).await;
    assert_eq!(backlog_of(&fx.pool, "a").await, 1);

    assert!(fx.pool.set_connection_string("b && a").await.is_ok());
    assert_eq!(fx.pool.connection_string().await, "b && a");
    assert_eq!(backlog_of(&fx.pool, "a").await, 1);

    fx.net.set_reachable("a", true);
    fx.pool.run_timers_at(Instant::now() + PAST_BACKOFF).await;
    assert_eq!(fx.net.delivered("a"), payloads(&["kept"]));
}

#[tokio::test]
async fn setup_needed_is_fatal_at_init() {
    let fx = fixture();
    fx.net.set_reachable("a", true);
    fx.net.require_setup("a");
    assert!(fx.pool.set_connection_string("a").await.is_ok());

    let Err(err) = fx.pool.init().await else {
        panic!("init should fail");
    };
    assert!(matches!(err, RelayError::SetupNeeded { .. }));
    assert!(err.is_fatal());
    assert!(!fx.pool.is_initialized().await);
}

#[tokio::test]
async fn invalid_profile_is_fatal_at_init() {
    let net = MockNetwork::new();
    let pool = ConnectionPool::new(
        MockConnector::new(net),
        ClientProfile::new("", 0, "/nonexistent"),
        Permission::IDMEF_WRITE,
    );
    assert!(matches!(pool.init().await, Err(RelayError::Profile(_))));
}

#[tokio::test]
async fn add_and_delete_connections_at_runtime() {
    let fx = started("a", &["a", "b"]).await;
    let Ok(b) = fx.pool.add_connection("b").await else {
        panic!("add failed");
    };
    assert_eq!(fx.pool.connection_string().await, "a && b");
    assert_eq!(
        fx.pool.connection(b).await.map(|info| info.state),
        Some(ConnectionState::Alive)
    );
    assert!(matches!(
        fx.pool.add_connection("x || y").await,
        Err(RelayError::InvalidTopology(_))
    ));
    assert!(matches!(
        fx.pool.add_connection("a").await,
        Err(RelayError::InvalidTopology(_))
    ));
    assert_eq!(fx.pool.connections().await.len(), 2);

    assert!(fx.pool.del_connection(b).await.is_ok());
    assert_eq!(fx.pool.connection_string().await, "a");
    assert!(fx.pool.connection(b).await.is_none());
    assert!(matches!(
        fx.pool.del_connection(b).await,
        Err(RelayError::ConnectionNotFound(_))
    ));
}

#[tokio::test]
async fn broadcast_async_keeps_order_and_pool_alive() {
    let fx = started("a", &["a"]).await;
    for payload in ["q1", "q2", "q3"] {
        assert!(fx.pool.broadcast_async(msg(payload)).is_ok());
    }
    assert_eq!(fx.pool.handle_count(), 4);

    let Fixture { _dir, net, pool } = fx;
    drop(pool);
    for _ in 0..200 {
        if net.delivered("a").len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(net.delivered("a"), payloads(&["q1", "q2", "q3"]));
}

#[test]
fn broadcast_async_requires_runtime() {
    let fx = fixture();
    assert!(matches!(
        fx.pool.broadcast_async(msg("x")),
        Err(RelayError::NoRuntime)
    ));
}

#[tokio::test]
async fn recv_returns_inbound_message() {
    let fx = started("a", &["a"]).await;
    fx.net.push_inbound("a", msg("hello"));

    let Ok(Some((id, received))) = fx.pool.recv(Some(Duration::from_millis(200))).await else {
        panic!("expected a message");
    };
    assert_eq!(id, id_of(&fx.pool, "a").await);
    assert_eq!(received.payload(), b"hello");
}

#[tokio::test]
async fn recv_times_out_without_input() {
    let fx = started("a", &["a"]).await;
    assert!(matches!(fx.pool.recv(Some(Duration::ZERO)).await, Ok(None)));
}

#[tokio::test]
async fn process_events_dispatches_input_to_handler() {
    let fx = started("a", &["a"]).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    fx.pool.set_event_handler(EventHandler::connection(EventFlags::INPUT, move |event| {
        if let (Some(msg), Ok(mut sink)) = (&event.message, sink.lock()) {
            sink.push(msg.payload().to_vec());
        }
    }));
    assert_eq!(fx.pool.wanted_events(), EventFlags::INPUT);

    fx.net.push_inbound("a", msg("ping"));
    let Ok(count) = fx.pool.process_events(Some(Duration::ZERO)).await else {
        panic!("processing failed");
    };
    assert_eq!(count, 1);
    let Ok(seen) = seen.lock() else {
        panic!("poisoned");
    };
    assert_eq!(*seen, payloads(&["ping"]));
}

#[tokio::test]
async fn callback_error_marks_connection_dead() {
    let fx = started("a", &["a"]).await;
    let flags = Arc::new(Mutex::new(EventFlags::empty()));
    let sink = Arc::clone(&flags);
    fx.pool.set_event_handler(EventHandler::global(
        EventFlags::INPUT | EventFlags::DEAD,
        move |raised| {
            if let Ok(mut sink) = sink.lock() {
                *sink |= raised;
            }
        },
    ));

    fx.net.push_inbound("a", msg("bad"));
    let result = fx
        .pool
        .check_event(Some(Duration::ZERO), |_, _| {
            Err(RelayError::Callback("rejected".to_string()))
        })
        .await;
    assert!(matches!(result, Ok(1)));

    let a = id_of(&fx.pool, "a").await;
    assert_eq!(
        fx.pool.connection(a).await.map(|info| info.state),
        Some(ConnectionState::Dead)
    );
    let Ok(flags) = flags.lock() else {
        panic!("poisoned");
    };
    assert_eq!(*flags, EventFlags::INPUT | EventFlags::DEAD);
}

#[tokio::test]
async fn reactor_detects_lost_peer() {
    let fx = started("a", &["a"]).await;
    let mut events = fx.pool.subscribe();
    fx.net.set_reachable("a", false);

    let result = fx.pool.process_events(Some(Duration::from_millis(100))).await;
    assert!(matches!(result, Ok(1)));

    let Ok(event) = events.try_recv() else {
        panic!("expected an event");
    };
    assert!(matches!(event, PoolEvent::ConnectionDead { .. }));
}

#[tokio::test]
async fn init_reports_alive_connections_on_bus() {
    let fx = fixture();
    let mut events = fx.pool.subscribe();
    fx.net.set_reachable("a", true);
    assert!(fx.pool.set_connection_string("a || b").await.is_ok());
    assert!(fx.pool.init().await.is_ok());
    assert!(fx.pool.is_initialized().await);

    let Ok(first) = events.try_recv() else {
        panic!("expected an event");
    };
    assert_eq!(first.flag(), Some(EventFlags::ALIVE));
    let Ok(second) = events.try_recv() else {
        panic!("expected an event");
    };
    assert_eq!(second.flag(), Some(EventFlags::DEAD));
}
