// crab-sync/examples/blocking_client.rs
// 阻塞客户端示例 - 在普通 fn main() 中调用远程方法和订阅

use anyhow::Context;
use crab_sync::logging::init_logger_with_level;
use crab_sync::{ConnectOptions, MemoryService, RemoteError, SyncConnection, TransportError};
use serde_json::json;

fn main() -> anyhow::Result<()> {
    init_logger_with_level(Some("debug"));

    let service = MemoryService::new().context("failed to start in-memory service")?;
    service
        .method("orders.total", |args| {
            let total: f64 = args.iter().filter_map(|v| v.as_f64()).sum();
            Ok(json!(total))
        })
        .method("orders.void", |_| {
            Err(RemoteError::new("403").with_reason("Voiding requires a manager"))
        })
        .disconnect_on("server.crash", Some(TransportError::new("socket hang up")));
    service.publish("orders.open", |_| Ok(()));

    let options = ConnectOptions::new()
        .with_header("x-client-name", "pos-01")
        .with_retry(true);
    let conn = SyncConnection::connect(&service, "memory://edge", options)?;
    tracing::info!("Connected: {}", conn.is_connected());

    let total = conn.call("orders.total", &[json!(12.5), json!(7.5)])?;
    tracing::info!("orders.total -> {}", total);

    match conn.apply("orders.void", vec![json!("order-1")]) {
        Ok(v) => tracing::info!("orders.void -> {}", v),
        Err(e) => tracing::warn!("orders.void failed: {}", e),
    }

    let sub = conn.subscribe_and_wait("orders.open", vec![])?;
    tracing::info!("Subscribed to {} ({})", sub.name(), sub.id());

    // Late failure: nobody is waiting, so the service records it as unhandled
    service.fail_subscriptions("orders.open", RemoteError::new("500"));
    for err in service.take_unhandled() {
        tracing::error!("Unhandled: {}", err);
    }

    match conn.call("server.crash", &[]) {
        Ok(_) => tracing::info!("server.crash returned"),
        Err(e) => tracing::warn!("server.crash: {}", e),
    }
    tracing::info!("Connected after crash: {}", conn.is_connected());

    conn.close();
    conn.close();
    Ok(())
}
