//! Agent integration tests over fixture directories on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use telemetry_agent::config::{load_context, resolve_declaration_path, resolve_fixtures_dir};
use telemetry_agent::{Agent, AgentError, FixtureLoader};
use telemetry_core::{CollectorConfig, EndpointLoader, ErrorStage, LoadError};

// ─────────────────────── helpers ───────────────────────

fn write_json(path: &Path, value: &Value) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

/// Lay out a declaration and its fixtures under `dir`.
fn setup(dir: &tempfile::TempDir) -> (PathBuf, PathBuf) {
    let declaration = dir.path().join("declaration.json");
    let fixtures = dir.path().join("fixtures");
    write_json(
        &declaration,
        &json!({
            "stats": {
                "hostname": {"key": "sys/global-settings::hostname", "structure": {"parentKey": "system"}},
                "version": {"key": "sys/version::version", "structure": {"parentKey": "system"}},
                "pools": {"key": "ltm/pool/stats", "addKeysByTag": true},
                "asmState": {"key": "asm/state", "if": {"isModuleProvisioned": "asm"}, "else": {"disabled": true}}
            },
            "definitions": {"`T`": {"pattern": "^/([^/]*)/.*", "group": 1}},
            "global": {"addKeysByTag": {"tags": {"tenant": "`T`"}}},
            "actions": [{"setTag": {"environment": "lab"}}]
        }),
    );
    write_json(
        &fixtures.join("sys/global-settings.json"),
        &json!({"kind": "tm:sys:global-settings:global-settingsstate", "hostname": "bigip1", "selfLink": "x"}),
    );
    write_json(
        &fixtures.join("sys/version.json"),
        &json!({"entries": {"version": {"description": "16.1.3"}}}),
    );
    write_json(
        &fixtures.join("ltm/pool/stats.json"),
        &json!({"entries": {"~Tenant1~app~pool1": {"nestedStats": {"entries": {"serverside.curConns": {"value": 3}}}}}}),
    );
    (declaration, fixtures)
}

// ═══════════════════════════════════════════════════════
// FIXTURE LOADER
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_fixture_loader_reads_nested_files() {
    let dir = tempfile::tempdir().unwrap();
    let (_, fixtures) = setup(&dir);
    let loader = FixtureLoader::new(&fixtures);

    let value = loader.load_endpoint("/sys/version", None).await.unwrap();
    assert_eq!(value["entries"]["version"]["description"], json!("16.1.3"));
    assert_eq!(
        loader.fixture_path("ltm/pool/stats"),
        Some(fixtures.join("ltm/pool/stats.json"))
    );
}

#[tokio::test]
async fn test_fixture_loader_errors() {
    let dir = tempfile::tempdir().unwrap();
    let (_, fixtures) = setup(&dir);
    std::fs::write(fixtures.join("broken.json"), "{\"broken\":").unwrap();
    let loader = FixtureLoader::new(&fixtures);

    assert_eq!(
        loader.load_endpoint("nothing/here", None).await.unwrap_err(),
        LoadError::NotFound("nothing/here".to_string())
    );
    assert!(matches!(
        loader.load_endpoint("broken", None).await,
        Err(LoadError::Failed { .. })
    ));
    assert!(loader.fixture_path("../declaration").is_none());
    assert!(loader.fixture_path("").is_none());
    assert!(matches!(
        loader.load_endpoint("sys/../../declaration", None).await,
        Err(LoadError::Failed { .. })
    ));
}

// ═══════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════

#[test]
fn test_explicit_paths_win() {
    assert_eq!(
        resolve_declaration_path(Some("/tmp/decl.json")),
        PathBuf::from("/tmp/decl.json")
    );
    assert_eq!(resolve_fixtures_dir(Some("/tmp/fx")), PathBuf::from("/tmp/fx"));
}

#[test]
fn test_load_context() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_context(None).unwrap().0.is_empty());

    let good = dir.path().join("context.json");
    write_json(&good, &json!({"deviceVersion": "16.1.3", "provisioning": {"asm": {"level": "nominal"}}}));
    let context = load_context(Some(good.as_path())).unwrap();
    assert_eq!(context.device_version(), Some("16.1.3"));
    assert!(context.is_module_provisioned("asm"));

    let bad = dir.path().join("list.json");
    write_json(&bad, &json!([1, 2]));
    assert!(matches!(load_context(Some(bad.as_path())), Err(AgentError::Config(_))));
    assert!(matches!(
        load_context(Some(dir.path().join("missing.json").as_path())),
        Err(AgentError::Config(_))
    ));
}

// ═══════════════════════════════════════════════════════
// CYCLES
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_cycle_from_fixtures() {
    let dir = tempfile::tempdir().unwrap();
    let (declaration, fixtures) = setup(&dir);
    let agent = tokio_test::assert_ok!(Agent::from_paths(
        &declaration,
        &fixtures,
        None,
        CollectorConfig::default()
    ));

    let report = agent.run_cycle().await;
    assert!(!report.output.has_errors(), "{:?}", report.output.errors);
    assert_eq!(
        Value::Object(report.output.stats.clone()),
        json!({
            "system": {"hostname": "bigip1", "version": "16.1.3"},
            "pools": {"/Tenant1/app/pool1": {"serverside.curConns": 3, "tenant": "Tenant1", "environment": "lab"}}
        })
    );

    let printed = serde_json::to_value(&report).unwrap();
    assert!(printed["cycleId"].as_str().is_some_and(|id| id.len() == 36));
    assert!(printed["startedAt"].is_string());
    assert_eq!(printed["stats"]["system"]["hostname"], json!("bigip1"));
    assert_eq!(printed["errors"], json!([]));
}

#[tokio::test]
async fn test_context_enables_conditional_property() {
    let dir = tempfile::tempdir().unwrap();
    let (declaration, fixtures) = setup(&dir);
    let context = dir.path().join("context.json");
    write_json(&context, &json!({"provisioning": {"asm": "nominal"}}));

    let agent = Agent::from_paths(&declaration, &fixtures, Some(context.as_path()), CollectorConfig::default()).unwrap();
    let report = agent.run_cycle().await;

    // No fixture recorded for asm/state.
    let error = report.output.error_for("asmState").unwrap();
    assert_eq!(error.stage, ErrorStage::Fetch);
    assert_eq!(report.output.stats["system"]["hostname"], json!("bigip1"));
}

#[tokio::test]
async fn test_run_every_stops_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let (declaration, fixtures) = setup(&dir);
    let agent = Agent::from_paths(&declaration, &fixtures, None, CollectorConfig::default()).unwrap();
    let stop = agent.stop_signal();

    let mut ids = Vec::new();
    let cycles = tokio::time::timeout(
        Duration::from_secs(10),
        agent.run_every(Duration::from_millis(10), |report| {
            ids.push(report.cycle_id.clone());
            if ids.len() == 2 {
                stop.request_stop();
            }
        }),
    )
    .await
    .unwrap();

    assert_eq!(cycles, 2);
    assert_ne!(ids[0], ids[1]);
}

#[test]
fn test_missing_declaration_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = Agent::from_paths(
        &dir.path().join("none.json"),
        dir.path(),
        None,
        CollectorConfig::default(),
    );
    assert!(matches!(result, Err(AgentError::Telemetry(_))));
}

#[test]
fn test_process_event_applies_actions() {
    let dir = tempfile::tempdir().unwrap();
    let (declaration, fixtures) = setup(&dir);
    let agent = Agent::new(
        Arc::new(FixtureLoader::new(fixtures)),
        CollectorConfig::default(),
        telemetry_core::Declaration::from_file(&declaration).unwrap(),
        telemetry_core::Context::new(),
    );

    let event = agent.process_event(r#"virtual_name="/Tenant1/vs",bytes="10""#);
    assert_eq!(event["virtual_name"], json!("/Tenant1/vs"));
    assert_eq!(event["environment"], json!("lab"));
    assert_eq!(agent.declaration().stats.len(), 4);
}
