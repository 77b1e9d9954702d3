//! Integration tests for registration, dispatch, events and lifecycle

use std::sync::{Arc, Mutex};
use std::time::Duration;

use plexus_engine::audit::{AuditEventType, MemoryAuditSink};
use plexus_engine::manager::{Grants, ManagerPresets, PluginManager};
use plexus_engine::testing::MockPlugin;
use plexus_engine::{
    Engine, EngineConfig, EngineError, Operation, PluginError, Profile, Value, ACTIVATED_EVENT,
    DEACTIVATED_EVENT,
};
use serde_json::json;

async fn permissive() -> (Engine, Arc<PluginManager>) {
    let manager = Arc::new(ManagerPresets::testing());
    let engine = Engine::bootstrap(Arc::clone(&manager))
        .await
        .expect("Failed to bootstrap engine");
    (engine, manager)
}

fn recorder() -> (Arc<Mutex<Vec<Vec<Value>>>>, impl Fn(&[Value]) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |payload: &[Value]| {
        sink.lock().unwrap().push(payload.to_vec())
    })
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn test_duplicate_registration_keeps_first_handle() {
    let (engine, _) = permissive().await;
    let first = Arc::new(MockPlugin::new("calc").methods(["add"]).respond("add", json!(1)));
    let second = Arc::new(MockPlugin::new("calc").methods(["add"]).respond("add", json!(2)));
    engine.register(first.clone()).await.unwrap();
    engine.register(Arc::new(MockPlugin::new("ui"))).await.unwrap();

    let err = engine.register(second.clone()).await.unwrap_err();
    assert_eq!(err.code(), "ALREADY_REGISTERED");

    let result = engine.call_method("ui", "calc", "add", vec![]).await.unwrap();
    assert_eq!(result, json!(1));
    assert!(second.requests().is_empty());
}

#[tokio::test]
async fn test_unregistered_target_fails_for_any_caller() {
    let (engine, _) = permissive().await;
    engine.register(Arc::new(MockPlugin::new("ui"))).await.unwrap();

    for caller in ["ui", "manager", "nobody"] {
        let err = engine
            .call_method(caller, "ghost", "anything", vec![])
            .await
            .unwrap_err();
        assert!(
            matches!(err, EngineError::NotRegistered(ref name) if name == "ghost"),
            "unexpected error for {caller}: {err}"
        );
    }
}

#[tokio::test]
async fn test_unknown_caller_surfaces_authority_error() {
    let (engine, _) = permissive().await;
    engine.register(Arc::new(MockPlugin::new("calc").methods(["add"]))).await.unwrap();

    let err = engine.call_method("ghost", "calc", "add", vec![]).await.unwrap_err();
    assert_eq!(err.code(), "AUTHORITY");
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_denied_call_never_reaches_target() {
    let audit = Arc::new(MemoryAuditSink::new());
    let manager = Arc::new(
        PluginManager::builder()
            .grants(Grants::new().allow_activation("*", "*"))
            .audit(audit.clone())
            .build(),
    );
    let engine = Engine::bootstrap(manager).await.unwrap();
    let calc = Arc::new(MockPlugin::new("calc").methods(["add"]));
    engine.register(calc.clone()).await.unwrap();
    engine.register(Arc::new(MockPlugin::new("ui"))).await.unwrap();

    let err = engine
        .call_method("ui", "calc", "add", vec![json!(1)])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied { .. }));
    assert!(calc.requests().is_empty());
    assert_eq!(calc.activation_count(), 0);
    assert_eq!(audit.find_by_type(AuditEventType::CallDenied).len(), 1);
}

#[tokio::test]
async fn test_inactive_target_without_activation_grant() {
    let manager = Arc::new(ManagerPresets::strict(Grants::new().allow_call("ui", "calc")));
    let engine = Engine::bootstrap(manager).await.unwrap();
    let calc = Arc::new(MockPlugin::new("calc").methods(["add"]));
    engine.register(calc.clone()).await.unwrap();
    engine.register(Arc::new(MockPlugin::new("ui"))).await.unwrap();

    let err = engine.call_method("ui", "calc", "add", vec![]).await.unwrap_err();
    assert!(matches!(err, EngineError::NotActivatable { .. }));
    assert_eq!(calc.activation_count(), 0);

    // Explicit activation bypasses the activation grant
    engine.activate_plugin("calc").await.unwrap();
    assert!(engine.call_method("ui", "calc", "add", vec![]).await.is_ok());
}

#[tokio::test]
async fn test_method_not_exposed_lists_methods() {
    let (engine, _) = permissive().await;
    engine
        .register(Arc::new(MockPlugin::new("calc").methods(["add", "sub"])))
        .await
        .unwrap();
    engine.register(Arc::new(MockPlugin::new("ui"))).await.unwrap();

    let err = engine.call_method("ui", "calc", "div", vec![]).await.unwrap_err();
    match err {
        EngineError::MethodNotExposed { exposed, .. } => assert_eq!(exposed, vec!["add", "sub"]),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_concurrent_callers_activate_once() {
    let (engine, _) = permissive().await;
    let calc = Arc::new(
        MockPlugin::new("calc")
            .methods(["add"])
            .respond("add", json!(3))
            .activation_delay(Duration::from_millis(50)),
    );
    engine.register(calc.clone()).await.unwrap();
    engine.register(Arc::new(MockPlugin::new("a"))).await.unwrap();
    engine.register(Arc::new(MockPlugin::new("b"))).await.unwrap();

    let (first, second) = tokio::join!(
        engine.call_method("a", "calc", "add", vec![]),
        engine.call_method("b", "calc", "add", vec![]),
    );
    assert_eq!(first.unwrap(), json!(3));
    assert_eq!(second.unwrap(), json!(3));
    assert_eq!(calc.activation_count(), 1);
    assert_eq!(calc.requests().len(), 2);
}

#[tokio::test]
async fn test_concurrent_callers_on_separate_tasks_activate_once() {
    let (engine, _) = permissive().await;
    let calc = Arc::new(
        MockPlugin::new("calc")
            .methods(["add"])
            .activation_delay(Duration::from_millis(30)),
    );
    engine.register(calc.clone()).await.unwrap();
    engine.register(Arc::new(MockPlugin::new("ui"))).await.unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.call_method("ui", "calc", "add", vec![json!(i)]).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(calc.activation_count(), 1);
}

#[tokio::test]
async fn test_manager_is_callable() {
    let (engine, _) = permissive().await;
    engine
        .register(Arc::new(MockPlugin::new("calc").methods(["add"])))
        .await
        .unwrap();
    engine.register(Arc::new(MockPlugin::new("ui"))).await.unwrap();

    let profile = engine
        .call_method("ui", "manager", "getProfile", vec![json!("calc")])
        .await
        .unwrap();
    assert_eq!(profile["methods"], json!(["add"]));

    let active = engine
        .call_method("ui", "manager", "isActive", vec![json!("calc")])
        .await
        .unwrap();
    assert_eq!(active, json!(false));
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test]
async fn test_broadcast_and_once() {
    let (engine, _) = permissive().await;
    let (seen, callback) = recorder();
    let (seen_once, once_callback) = recorder();

    assert!(engine.add_listener("ui", "clock", "tick", callback));
    assert!(engine.listen_once("log", "clock", "tick", once_callback));

    assert_eq!(engine.broadcast("clock", "tick", vec![json!(1), json!(2)]).unwrap(), 2);
    assert_eq!(engine.broadcast("clock", "tick", vec![json!(3)]).unwrap(), 1);
    engine.broadcast("clock", "tick", vec![]).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![vec![json!(1), json!(2)], vec![json!(3)], vec![]]
    );
    assert_eq!(*seen_once.lock().unwrap(), vec![vec![json!(1), json!(2)]]);
    engine.verify_events().unwrap();
}

#[tokio::test]
async fn test_plugin_events_through_context() {
    let (engine, _) = permissive().await;
    let clock = Arc::new(MockPlugin::new("clock"));
    let ui = Arc::new(MockPlugin::new("ui"));
    engine.register(clock.clone()).await.unwrap();
    engine.register(ui.clone()).await.unwrap();
    engine.activate_plugin("clock").await.unwrap();
    engine.activate_plugin("ui").await.unwrap();

    let (seen, callback) = recorder();
    let ui_ctx = ui.context().unwrap();
    assert!(ui_ctx.on("clock", "tick", callback).unwrap());

    let clock_ctx = clock.context().unwrap();
    assert_eq!(clock_ctx.emit("tick", vec![json!("noon")]).unwrap(), 1);

    assert!(ui_ctx.off("clock", "tick").unwrap());
    assert_eq!(clock_ctx.emit("tick", vec![json!("midnight")]).unwrap(), 0);
    assert_eq!(*seen.lock().unwrap(), vec![vec![json!("noon")]]);
}

#[tokio::test]
async fn test_listener_may_unsubscribe_during_broadcast() {
    let (engine, _) = permissive().await;
    let inner = engine.clone();
    let (seen, callback) = recorder();

    engine.add_listener("a", "clock", "tick", move |_| {
        inner.remove_listener("b", "clock", "tick");
    });
    engine.add_listener("b", "clock", "tick", callback);

    // Snapshot taken before "a" ran, so "b" still receives this one
    assert_eq!(engine.broadcast("clock", "tick", vec![]).unwrap(), 2);
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(engine.broadcast("clock", "tick", vec![]).unwrap(), 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_lifecycle_events_under_manager_name() {
    let (engine, _) = permissive().await;
    engine.register(Arc::new(MockPlugin::new("clock"))).await.unwrap();

    let (activated, on_activated) = recorder();
    let (deactivated, on_deactivated) = recorder();
    engine.add_listener("observer", "manager", ACTIVATED_EVENT, on_activated);
    engine.add_listener("observer", "manager", DEACTIVATED_EVENT, on_deactivated);

    engine.activate_plugin("clock").await.unwrap();
    engine.deactivate_plugin("clock").await.unwrap();

    assert_eq!(*activated.lock().unwrap(), vec![vec![json!("clock")]]);
    assert_eq!(*deactivated.lock().unwrap(), vec![vec![json!("clock")]]);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_deactivated_capabilities_fail_and_recover() {
    let (engine, _) = permissive().await;
    let clock = Arc::new(MockPlugin::new("clock").methods(["now"]));
    let ui = Arc::new(MockPlugin::new("ui"));
    engine.register(clock.clone()).await.unwrap();
    engine.register(ui.clone()).await.unwrap();
    engine.activate_plugin("ui").await.unwrap();

    let ctx = ui.context().unwrap();
    engine.deactivate_plugin("ui").await.unwrap();
    assert!(!ctx.is_live());

    let expect_deactivated = |result: Result<(), EngineError>, operation: Operation| match result {
        Err(EngineError::Deactivated { plugin, operation: op }) => {
            assert_eq!(plugin, "ui");
            assert_eq!(op, operation);
        }
        other => panic!("expected Deactivated for {operation}, got {other:?}"),
    };
    expect_deactivated(
        ctx.call("clock", "now", vec![]).await.map(drop),
        Operation::Call,
    );
    expect_deactivated(ctx.on("clock", "tick", |_| {}).map(drop), Operation::On);
    expect_deactivated(ctx.once("clock", "tick", |_| {}).map(drop), Operation::Once);
    expect_deactivated(ctx.off("clock", "tick").map(drop), Operation::Off);
    expect_deactivated(ctx.emit("tick", vec![]).map(drop), Operation::Emit);
    expect_deactivated(ctx.app().map(drop), Operation::App);
    assert!(clock.requests().is_empty());

    // Registered while "ui" was inactive; must show up in the new snapshot
    engine.register(Arc::new(MockPlugin::new("late"))).await.unwrap();
    engine.activate_plugin("ui").await.unwrap();

    let ctx = ui.context().unwrap();
    assert!(ctx.call("clock", "now", vec![]).await.is_ok());
    assert!(ctx.app().unwrap().get("late").is_some());
}

#[tokio::test]
async fn test_deactivation_purges_own_subscriptions_only() {
    let (engine, _) = permissive().await;
    let clock = Arc::new(MockPlugin::new("clock"));
    let ui = Arc::new(MockPlugin::new("ui"));
    engine.register(clock.clone()).await.unwrap();
    engine.register(ui.clone()).await.unwrap();
    engine.activate_plugin("clock").await.unwrap();
    engine.activate_plugin("ui").await.unwrap();

    let (ui_seen, ui_callback) = recorder();
    let (clock_seen, clock_callback) = recorder();
    ui.context().unwrap().on("clock", "tick", ui_callback).unwrap();
    clock.context().unwrap().on("ui", "click", clock_callback).unwrap();

    engine.deactivate_plugin("clock").await.unwrap();

    // ui keeps listening to the (now inactive) clock
    assert_eq!(engine.listeners("clock", "tick"), vec!["ui"]);
    assert!(engine.listeners("ui", "click").is_empty());
    engine.broadcast("clock", "tick", vec![]).unwrap();
    ui.context().unwrap().emit("click", vec![]).unwrap();

    assert_eq!(ui_seen.lock().unwrap().len(), 1);
    assert!(clock_seen.lock().unwrap().is_empty());
    engine.verify_events().unwrap();
}

#[tokio::test]
async fn test_activation_failure_propagates_and_rolls_back() {
    let (engine, manager) = permissive().await;
    let calc = Arc::new(
        MockPlugin::new("calc")
            .methods(["add"])
            .failing_activations(1)
            .on_activate(|_| async { Ok(()) }),
    );
    engine.register(calc.clone()).await.unwrap();
    engine.register(Arc::new(MockPlugin::new("ui"))).await.unwrap();

    let err = engine.call_method("ui", "calc", "add", vec![]).await.unwrap_err();
    assert!(matches!(err, EngineError::Plugin(ref e) if e.is_system()));
    assert!(calc.requests().is_empty());
    assert!(!manager.active_plugins().contains(&"calc".to_string()));

    // The next call activates again and dispatches
    engine.call_method("ui", "calc", "add", vec![]).await.unwrap();
    assert_eq!(calc.activation_count(), 2);
    assert_eq!(calc.requests().len(), 1);
}

#[tokio::test]
async fn test_activation_hook_can_call_other_plugins() {
    let (engine, _) = permissive().await;
    let config = Arc::new(
        MockPlugin::new("config")
            .methods(["get"])
            .respond("get", json!({"interval": 5})),
    );
    let seen = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    let clock = Arc::new(MockPlugin::new("clock").on_activate(move |ctx| {
        let sink = Arc::clone(&sink);
        async move {
            let value = ctx
                .call("config", "get", vec![])
                .await
                .map_err(|e| PluginError::system(e.to_string()))?;
            *sink.lock().unwrap() = Some(value);
            Ok::<_, PluginError>(())
        }
    }));
    engine.register(config.clone()).await.unwrap();
    engine.register(clock).await.unwrap();

    engine.activate_plugin("clock").await.unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(json!({"interval": 5})));
    assert_eq!(config.activation_count(), 1);
}

#[tokio::test]
async fn test_activation_cycle_is_detected() {
    let (engine, _) = permissive().await;
    let inner_error = Arc::new(Mutex::new(None));

    let alpha = Arc::new(MockPlugin::new("alpha").methods(["ping"]).on_activate(|ctx| async move {
        ctx.call("beta", "ping", vec![])
            .await
            .map(drop)
            .map_err(|e| PluginError::system(e.to_string()))
    }));
    let sink = Arc::clone(&inner_error);
    let beta = Arc::new(MockPlugin::new("beta").methods(["ping"]).on_activate(move |ctx| {
        let sink = Arc::clone(&sink);
        async move {
            let result = ctx.call("alpha", "ping", vec![]).await;
            if let Err(e) = &result {
                *sink.lock().unwrap() = Some(e.clone());
            }
            result.map(drop).map_err(|e| PluginError::system(e.to_string()))
        }
    }));
    engine.register(alpha.clone()).await.unwrap();
    engine.register(beta.clone()).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), engine.activate_plugin("alpha"))
        .await
        .expect("activation cycle must not deadlock");
    assert!(result.is_err());

    match inner_error.lock().unwrap().clone() {
        Some(EngineError::ActivationCycle { chain }) => {
            assert_eq!(chain, vec!["alpha", "beta", "alpha"]);
        }
        other => panic!("expected ActivationCycle, got {other:?}"),
    }
    assert!(!engine.is_active("alpha").await.unwrap());
    assert!(!engine.is_active("beta").await.unwrap());
    engine.verify_events().unwrap();
}

#[tokio::test]
async fn test_concurrent_mutual_activation_settles() {
    let (engine, _) = permissive().await;
    let errors = Arc::new(Mutex::new(Vec::new()));

    let mutual = |name: &str, peer: &'static str| {
        let sink = Arc::clone(&errors);
        MockPlugin::new(name)
            .methods(["ping"])
            .activation_delay(Duration::from_millis(20))
            .on_activate(move |ctx| {
                let sink = Arc::clone(&sink);
                async move {
                    let result = ctx.call(peer, "ping", vec![]).await;
                    if let Err(e) = &result {
                        sink.lock().unwrap().push(e.clone());
                    }
                    result.map(drop).map_err(|e| PluginError::system(e.to_string()))
                }
            })
    };
    engine.register(Arc::new(mutual("alpha", "beta"))).await.unwrap();
    engine.register(Arc::new(mutual("beta", "alpha"))).await.unwrap();

    let (a, b) = tokio::time::timeout(
        Duration::from_secs(3),
        async { tokio::join!(engine.activate_plugin("alpha"), engine.activate_plugin("beta")) },
    )
    .await
    .expect("mutual activation on two tasks must not deadlock");
    assert!(a.is_err());
    assert!(b.is_err());

    let cycle = errors.lock().unwrap().iter().find_map(|e| match e {
        EngineError::ActivationCycle { chain } => Some(chain.clone()),
        _ => None,
    });
    let chain = cycle.expect("one hook must see an ActivationCycle");
    assert_eq!(chain.first(), chain.last());
    assert!(chain.iter().any(|n| n == "alpha"));
    assert!(chain.iter().any(|n| n == "beta"));

    // Nothing stays wedged behind a lifecycle guard
    let settle = Duration::from_secs(1);
    assert!(tokio::time::timeout(settle, engine.deactivate_plugin("alpha")).await.unwrap().is_ok());
    assert!(tokio::time::timeout(settle, engine.activate_plugin("beta")).await.unwrap().is_err());
    assert!(!engine.is_active("alpha").await.unwrap());
    assert!(!engine.is_active("beta").await.unwrap());
    engine.verify_events().unwrap();
}

#[tokio::test]
async fn test_zero_depth_from_config_file_still_bootstraps() {
    let config: EngineConfig = serde_json::from_str(r#"{"max_activation_depth":0}"#).unwrap();
    let engine = Engine::bootstrap_with_config(Arc::new(ManagerPresets::permissive()), config)
        .await
        .unwrap();
    engine.register(Arc::new(MockPlugin::new("clock"))).await.unwrap();
    engine.activate_plugin("clock").await.unwrap();
    assert_eq!(engine.config().max_activation_depth, 1);
}

#[tokio::test]
async fn test_activation_depth_is_bounded() {
    let manager = Arc::new(ManagerPresets::permissive());
    let engine = Engine::bootstrap_with_config(manager, EngineConfig::new().max_activation_depth(2))
        .await
        .unwrap();

    let chain_link = |name: &str, next: &'static str| {
        MockPlugin::new(name).methods(["ping"]).on_activate(move |ctx| async move {
            ctx.call(next, "ping", vec![])
                .await
                .map(drop)
                .map_err(|e| PluginError::system(e.to_string()))
        })
    };
    engine.register(Arc::new(chain_link("a", "b"))).await.unwrap();
    engine.register(Arc::new(chain_link("b", "c"))).await.unwrap();
    engine.register(Arc::new(MockPlugin::new("c").methods(["ping"]))).await.unwrap();

    let err = engine.activate_plugin("a").await.unwrap_err();
    assert!(err.to_string().contains("activation chain exceeds 2 plugins"));
    assert!(!engine.is_active("c").await.unwrap());
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test]
async fn test_snapshot_call_matches_direct_call() {
    let (engine, _) = permissive().await;
    let a = Arc::new(MockPlugin::new("A").methods(["ping"]).respond("ping", json!("pong")));
    let b = Arc::new(MockPlugin::new("B"));
    engine.register(a.clone()).await.unwrap();
    engine.register(b.clone()).await.unwrap();
    engine.activate_plugin("A").await.unwrap();
    engine.activate_plugin("B").await.unwrap();

    let app = b.context().unwrap().app().unwrap();
    let via_snapshot = app.get("A").unwrap().method("ping").unwrap().call(vec![]).await;
    let direct = engine.call_method("B", "A", "ping", vec![]).await;

    assert_eq!(via_snapshot.unwrap(), direct.unwrap());
    let requests = a.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], requests[1]);
}

#[tokio::test]
async fn test_stale_snapshot_uses_current_profile() {
    let (engine, manager) = permissive().await;
    let a = Arc::new(MockPlugin::new("A").methods(["ping"]));
    let b = Arc::new(MockPlugin::new("B"));
    engine.register(a.clone()).await.unwrap();
    engine.register(b.clone()).await.unwrap();
    engine.activate_plugin("B").await.unwrap();

    let stale = b.context().unwrap().app().unwrap();
    manager
        .update_profile(Profile::new("A").method("pong"))
        .unwrap();

    // The stale snapshot still advertises "ping", the authority no longer does
    let ping = stale.get("A").unwrap().method("ping").unwrap();
    let err = ping.call(vec![]).await.unwrap_err();
    match err {
        EngineError::MethodNotExposed { exposed, .. } => assert_eq!(exposed, vec!["pong"]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(stale.get("A").unwrap().method("pong").is_none());
    assert!(stale.get("A").unwrap().call("pong", vec![]).await.is_ok());
    assert_eq!(a.requests().len(), 1);

    let fresh = b.context().unwrap().refresh_app().await.unwrap();
    assert_eq!(fresh.get("A").unwrap().methods(), ["pong"]);
}

#[tokio::test]
async fn test_snapshot_events_are_bound_to_target() {
    let (engine, _) = permissive().await;
    let clock = Arc::new(MockPlugin::new("clock"));
    let ui = Arc::new(MockPlugin::new("ui"));
    engine.register(clock.clone()).await.unwrap();
    engine.register(ui.clone()).await.unwrap();
    engine.activate_plugin("clock").await.unwrap();
    engine.activate_plugin("ui").await.unwrap();

    let app = ui.context().unwrap().app().unwrap();
    let (seen, callback) = recorder();
    let clock_api = app.get("clock").unwrap();
    assert!(clock_api.once("tick", callback).unwrap());
    assert_eq!(engine.listeners("clock", "tick"), vec!["ui"]);

    clock.context().unwrap().emit("tick", vec![json!(1)]).unwrap();
    clock.context().unwrap().emit("tick", vec![json!(2)]).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![vec![json!(1)]]);

    engine.deactivate_plugin("ui").await.unwrap();
    assert!(matches!(
        clock_api.off("tick"),
        Err(EngineError::Deactivated { .. })
    ));
}
