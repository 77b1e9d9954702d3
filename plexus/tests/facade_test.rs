use std::sync::Arc;

use plexus::prelude::*;
use serde_json::json;

fn calculator() -> FnPlugin {
    FnPlugin::new("calc")
        .version("0.1.0")
        .method("add", |_, args| async move {
            let a: i64 = arg(&args, 0)?;
            let b: i64 = arg(&args, 1)?;
            Ok::<_, PluginError>(json!(a + b))
        })
        .method("reset", |_, _| async { Ok(Value::Null) })
}

#[tokio::test]
async fn test_strict_grants_limit_methods() {
    let grants = Grants::new()
        .allow_methods("ui", "calc", ["add"])
        .allow_activation("ui", "calc");
    let engine = Engine::bootstrap(Arc::new(ManagerPresets::strict(grants)))
        .await
        .unwrap();
    engine.register(Arc::new(calculator())).await.unwrap();
    engine.register(Arc::new(FnPlugin::new("ui"))).await.unwrap();

    let sum = engine
        .call_method("ui", "calc", "add", vec![json!(2), json!(3)])
        .await
        .unwrap();
    assert_eq!(sum, json!(5));

    let err = engine
        .call_method("ui", "calc", "reset", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied { .. }));
}

#[tokio::test]
async fn test_bad_arguments_surface_as_plugin_error() {
    let engine = Engine::bootstrap(Arc::new(ManagerPresets::permissive()))
        .await
        .unwrap();
    engine.register(Arc::new(calculator())).await.unwrap();
    engine.register(Arc::new(FnPlugin::new("ui"))).await.unwrap();

    let err = engine
        .call_method("ui", "calc", "add", vec![json!("two")])
        .await
        .unwrap_err();
    match err {
        EngineError::Plugin(e) => assert!(e.message.contains("invalid argument 0")),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_plugin_reads_app_snapshot() {
    let engine = Engine::bootstrap(Arc::new(ManagerPresets::permissive()))
        .await
        .unwrap();
    engine.register(Arc::new(calculator())).await.unwrap();

    let ui = Arc::new(FnPlugin::new("ui"));
    engine.register(ui.clone()).await.unwrap();
    engine.activate_plugin("ui").await.unwrap();

    let app = ui.context().unwrap().app().unwrap();
    let add = app.get("calc").unwrap().method("add").unwrap();
    assert_eq!(add.call(vec![json!(40), json!(2)]).await.unwrap(), json!(42));
}
