use std::sync::Arc;

use plexus::prelude::*;
use plexus::{info, init_subscriber, warn, MANAGER_NAME};
use serde_json::json;

// ============================================
// Plugins
// ============================================

/// Answers `ping` and tells everyone how many it has served
fn pong() -> FnPlugin {
    let served = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let pong = FnPlugin::new("pong").describe("Replies to pings");

    pong.method("ping", move |request, args| {
        let served = Arc::clone(&served);
        async move {
            let count = served.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            info!(from = %request.from, count, "Ping received");
            Ok(json!({ "reply": "pong", "echo": args, "count": count }))
        }
    })
}

/// Pings `pong` during its own activation
fn ping() -> FnPlugin {
    FnPlugin::new("ping").on_activate(|ctx| async move {
        ctx.on("pong", "served", |payload: &[serde_json::Value]| {
            info!(payload = ?payload, "Pong served");
        })
        .map_err(|e| PluginError::system(e.to_string()))?;

        let reply = ctx
            .call("pong", "ping", vec![json!("hello")])
            .await
            .map_err(|e| PluginError::system(e.to_string()))?;
        info!(reply = %reply, "Ping answered");
        Ok::<_, PluginError>(())
    })
}

// ============================================
// Main
// ============================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_subscriber()?;

    let grants = Grants::new()
        .allow_call("ping", "pong")
        .allow_activation("ping", "pong")
        .allow_call("*", MANAGER_NAME);
    let engine = Engine::bootstrap(Arc::new(ManagerPresets::strict(grants))).await?;

    engine.register(Arc::new(pong())).await?;
    engine.register(Arc::new(ping())).await?;
    engine.activate_plugin("ping").await?;

    let served = engine.broadcast("pong", "served", vec![json!(1)])?;
    info!(listeners = served, "Broadcast delivered");

    // Nothing grants pong the right to call ping back.
    if let Err(e) = engine.call_method("pong", "ping", "anything", vec![]).await {
        warn!(error = %e, "Call refused");
    }

    engine.deactivate_plugin("ping").await?;
    Ok(())
}
