// crab-sync/tests/sync_connection.rs
// 集成测试 - SyncConnection 对接 MemoryService

use crab_sync::{
    ConnectOptions, Handshake, InvariantViolation, MemoryService, RemoteError, SyncConnection,
    SyncError, TransportError,
};
use serde_json::{Value, json};
use std::thread;
use std::time::{Duration, Instant};

fn service() -> MemoryService {
    crab_sync::logging::init_logger_with_level(Some("debug"));
    let service = MemoryService::new().expect("memory service should start");
    service
        .method("add", |args| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        })
        .method("fail", |_| {
            Err(RemoteError::new("not-authorized").with_reason("Login required"))
        })
        .hang_method("slow");
    service
        .publish("tasks", |_| Ok(()))
        .publish("secrets", |_| Err(RemoteError::new("403").with_reason("Forbidden")));
    service
}

fn connect(service: &MemoryService) -> SyncConnection {
    SyncConnection::connect(service, "memory://local", ConnectOptions::new())
        .expect("connect should succeed")
}

/// Poll until `cond` holds, failing the test after a few seconds
fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

// ========== Connection establishment ==========

#[test]
fn test_connect_marks_connected() {
    let service = service();
    let conn = connect(&service);

    assert!(conn.is_connected());
    assert!(!conn.is_busy());
    assert_eq!(conn.endpoint(), "memory://local");
    assert!(service.take_unhandled().is_empty());
}

#[test]
fn test_connect_forces_fail_fast_policy() {
    let service = service();
    let options = ConnectOptions::new()
        .with_header("x-api-key", "secret")
        .with_suppress_errors(true)
        .with_retry(true)
        .with_connect_timeout(Duration::from_secs(2))
        .with_option("heartbeatInterval", json!(17500));
    let _conn = SyncConnection::connect(&service, "memory://local", options).unwrap();

    let requests = service.connect_requests();
    assert_eq!(requests.len(), 1);
    let options = &requests[0].options;
    assert!(!options.retry);
    assert_eq!(options.connect_timeout, Duration::from_secs(15));
    assert_eq!(options.headers["x-api-key"], "secret");
    assert!(options.suppress_errors);
    assert_eq!(options.extra["heartbeatInterval"], json!(17500));
}

#[test]
fn test_refused_connect_raises_reported_error() {
    let refused = TransportError::new("ECONNREFUSED");
    let service = service().with_handshake(Handshake::Refuse(refused.clone()));

    let err = SyncConnection::connect(&service, "memory://local", ConnectOptions::new())
        .unwrap_err();
    assert_eq!(err, SyncError::Disconnected(refused));
    assert!(!err.is_fatal());
    assert!(service.take_unhandled().is_empty());
}

#[test]
fn test_invalid_endpoint_is_refused_synchronously() {
    let service = service();
    let err = SyncConnection::connect(&service, "tcp://local", ConnectOptions::new()).unwrap_err();
    assert!(matches!(err, SyncError::Transport(_)));
    assert!(service.connect_requests().is_empty());
}

#[test]
#[ignore = "waits out the full 15s connect timeout"]
fn test_stalled_handshake_times_out() {
    let service = service().with_handshake(Handshake::Stall);
    let options = ConnectOptions::new()
        .with_retry(true)
        .with_connect_timeout(Duration::from_secs(1));

    let started = Instant::now();
    let err = SyncConnection::connect(&service, "memory://local", options).unwrap_err();
    assert_eq!(
        err,
        SyncError::Disconnected(TransportError::connect_timeout(Duration::from_secs(15)))
    );
    assert!(started.elapsed() >= Duration::from_secs(15));
    assert!(service.take_unhandled().is_empty());
}

#[test]
fn test_forced_reconnect_during_handshake_is_tolerated() {
    let service = service().with_handshake(Handshake::ForcedReconnectThenAccept);
    let conn = connect(&service);

    assert!(conn.is_connected());
    assert_eq!(conn.call("add", &[json!(1), json!(1)]).unwrap(), json!(2));
    assert!(service.take_unhandled().is_empty());
}

#[test]
fn test_forced_reconnect_after_connect_is_fatal() {
    let service = service();
    let conn = connect(&service);

    service.force_reconnect();
    let unhandled = service.take_unhandled();
    assert_eq!(unhandled.len(), 1);
    assert!(unhandled[0].is_fatal());
    assert_eq!(
        unhandled[0].invariant(),
        Some(InvariantViolation::ForcedReconnectAfterConnect)
    );
    assert!(conn.is_connected());
}

// ========== apply / call ==========

#[test]
fn test_call_returns_remote_result() {
    let service = service();
    let conn = connect(&service);

    assert_eq!(conn.call("add", &[json!(2), json!(40)]).unwrap(), json!(42));
    assert_eq!(conn.apply("add", vec![json!(5)]).unwrap(), json!(5));
    assert_eq!(service.calls_received(), 2);
}

#[test]
fn test_call_raises_remote_error() {
    let service = service();
    let conn = connect(&service);

    let err = conn.call("fail", &[]).unwrap_err();
    assert_eq!(
        err,
        SyncError::Remote(RemoteError::new("not-authorized").with_reason("Login required"))
    );
    assert!(!err.is_fatal());
    // The connection stays usable after a remote error
    assert_eq!(conn.call("add", &[json!(1)]).unwrap(), json!(1));
}

#[test]
fn test_unknown_method_is_remote_404() {
    let service = service();
    let conn = connect(&service);

    let err = conn.apply("nope", vec![]).unwrap_err();
    assert_eq!(err, SyncError::Remote(RemoteError::not_found("Method", "nope")));
}

#[test]
fn test_second_operation_fails_fast() {
    let service = service();
    let conn = connect(&service);

    thread::scope(|s| {
        let pending = s.spawn(|| conn.call("slow", &[]));

        wait_until(|| service.calls_received() == 1);
        assert!(conn.is_busy());

        let err = conn.call("add", &[json!(1)]).unwrap_err();
        assert_eq!(err.invariant(), Some(InvariantViolation::OperationPending));
        let err = conn.subscribe_and_wait("tasks", vec![]).unwrap_err();
        assert_eq!(err.invariant(), Some(InvariantViolation::OperationPending));
        assert_eq!(service.calls_received(), 1);

        service.disconnect(None);
        assert_eq!(pending.join().unwrap(), Err(SyncError::ConnectionLost));
    });
    assert!(!conn.is_busy());
}

#[test]
fn test_disconnect_with_error_unblocks_pending_call() {
    let service = service();
    let conn = connect(&service);
    let dropped = TransportError::new("socket hang up");

    thread::scope(|s| {
        let pending = s.spawn(|| conn.call("slow", &[]));
        wait_until(|| conn.is_busy());

        service.disconnect(Some(dropped.clone()));
        assert_eq!(
            pending.join().unwrap(),
            Err(SyncError::Disconnected(dropped.clone()))
        );
    });

    assert!(!conn.is_connected());
    assert!(service.take_unhandled().is_empty());
}

#[test]
fn test_disconnect_mid_call_from_server() {
    let service = service();
    service.disconnect_on("crash", Some(TransportError::new("server crashed")));
    let conn = connect(&service);

    let err = conn.call("crash", &[]).unwrap_err();
    assert_eq!(
        err,
        SyncError::Disconnected(TransportError::new("server crashed"))
    );
    assert!(!conn.is_connected());

    // No session left: later calls fail fast instead of hanging
    assert_eq!(conn.call("add", &[]).unwrap_err(), SyncError::NotConnected);
}

// ========== subscribe_and_wait ==========

#[test]
fn test_subscribe_returns_ready_handle() {
    let service = service();
    let conn = connect(&service);

    let sub = conn.subscribe_and_wait("tasks", vec![json!("open")]).unwrap();
    assert_eq!(sub.name(), "tasks");
    assert!(!sub.id().is_empty());
    assert_eq!(service.live_subscriptions(), 1);

    sub.stop();
    assert_eq!(service.live_subscriptions(), 0);
}

#[test]
fn test_subscribe_error_before_ready() {
    let service = service();
    let conn = connect(&service);

    let err = conn.subscribe_and_wait("secrets", vec![]).unwrap_err();
    assert_eq!(
        err,
        SyncError::Remote(RemoteError::new("403").with_reason("Forbidden"))
    );
    assert!(!conn.is_busy());
    assert!(service.take_unhandled().is_empty());
}

#[test]
fn test_subscribe_error_after_ready_is_orphaned() {
    let service = service();
    let conn = connect(&service);
    let _sub = conn.subscribe_and_wait("tasks", vec![]).unwrap();

    let late = RemoteError::new("500").with_reason("publication crashed");
    service.fail_subscriptions("tasks", late.clone());

    let unhandled = service.take_unhandled();
    assert_eq!(
        unhandled,
        vec![SyncError::Orphaned(Box::new(SyncError::Remote(late)))]
    );
    assert!(!unhandled[0].is_fatal());
    // The connection itself is unaffected
    assert_eq!(conn.call("add", &[json!(3)]).unwrap(), json!(3));
}

#[test]
fn test_pending_subscription_failed_by_server() {
    let service = service();
    service.hang_publication("feed");
    let conn = connect(&service);

    thread::scope(|s| {
        let pending = s.spawn(|| conn.subscribe_and_wait("feed", vec![]));
        wait_until(|| service.live_subscriptions() == 1);

        service.fail_subscriptions("feed", RemoteError::new("503"));
        let err = pending.join().unwrap().unwrap_err();
        assert_eq!(err, SyncError::Remote(RemoteError::new("503")));
    });
    assert!(service.take_unhandled().is_empty());
}

#[test]
fn test_disconnect_unblocks_pending_subscription() {
    let service = service();
    service.hang_publication("feed");
    let conn = connect(&service);

    thread::scope(|s| {
        let pending = s.spawn(|| conn.subscribe_and_wait("feed", vec![]));
        wait_until(|| service.live_subscriptions() == 1);

        service.disconnect(None);
        assert_eq!(
            pending.join().unwrap().unwrap_err(),
            SyncError::ConnectionLost
        );
    });
}

// ========== Disconnect monitor ==========

#[test]
fn test_clean_disconnect_without_wait_is_noop() {
    let service = service();
    let conn = connect(&service);

    service.disconnect(None);
    assert!(service.take_unhandled().is_empty());
    assert!(!conn.is_connected());
    assert!(!conn.is_busy());
}

#[test]
fn test_error_disconnect_without_wait_is_reraised() {
    let service = service();
    let conn = connect(&service);

    service.disconnect(Some(TransportError::new("heartbeat timeout")));
    let unhandled = service.take_unhandled();
    assert_eq!(
        unhandled,
        vec![SyncError::Orphaned(Box::new(SyncError::Disconnected(
            TransportError::new("heartbeat timeout")
        )))]
    );
    assert!(!conn.is_connected());
}

// ========== close ==========

#[test]
fn test_close_twice_is_noop() {
    let service = service();
    let conn = connect(&service);

    conn.close();
    assert!(conn.is_closed());
    conn.close();
    service.flush();

    assert!(service.take_unhandled().is_empty());
    assert_eq!(conn.call("add", &[]).unwrap_err(), SyncError::Closed);
}

#[test]
fn test_drop_closes_session() {
    let service = service();
    let conn = connect(&service);
    let _sub = conn.subscribe_and_wait("tasks", vec![]).unwrap();
    assert_eq!(service.live_subscriptions(), 1);

    drop(conn);
    service.flush();
    assert_eq!(service.live_subscriptions(), 0);
    assert!(service.take_unhandled().is_empty());
}
