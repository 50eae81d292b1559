use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use pump_common::config::ConfigState;
use pump_common::events::NullSink;
use pump_common::pipeline::MissingDataRule;
use pump_common::runtime::{PumpRuntime, RuntimeOptions};
use pump_worker::pumps::mpc::MPC;
use pump_worker::pumps::registry;
use serde_json::json;

const RESULTS: &str = "Name,Value,Threshold,Result\n\
    BeamGroup/BeamOutputChange [%],0.12,2,PASS\n\
    CollimationGroup/MLCGroup/MLCLeavesA/MLCLeaf1,0.01,1,PASS\n";

async fn write_results(tds: &Path, dir_name: &str) {
    let dir = tds.join("H191234").join("MPCChecks").join(dir_name);
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("Results.csv"), RESULTS).await.unwrap();
}

fn saved_state(server: &MockServer, tds: &Path) -> ConfigState {
    serde_json::from_value(json!({
        "Pump": [{"interval (s)": 3600, "active": true}],
        "MPC": [{
            "tds directory": tds.to_string_lossy(),
            "grouping window": 20,
            "wait time": 20,
        }],
        "QATrack+ API": [{
            "api url": server.url("/api/"),
            "auth token": "abc123",
            "throttle": 0.0,
        }],
        "Test List": [{"name": "MPC: {{ check_type }}"}],
    }))
    .unwrap()
}

#[tokio::test]
async fn test_groups_settled_results_per_check_type() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/auth/");
            then.status(200);
        })
        .await;
    let units = server
        .mock_async(|when, then| {
            when.method(GET).path("/api/units/units/");
            then.status(200).json_body(json!({
                "count": 1,
                "next": null,
                "results": [{"name": "TB1", "serial_number": "1234"}],
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/qa/testinstances/");
            then.status(200).json_body(json!({"count": 0, "results": []}));
        })
        .await;
    let beam_and_geometry = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/qa/unittestcollections/")
                .query_param("unit__name", "TB1")
                .query_param("test_list__name", "MPC: Beam and Geometry Checks");
            then.status(200).json_body(json!({
                "count": 1,
                "results": [{"url": "http://qatrack/api/qa/unittestcollections/1/"}],
            }));
        })
        .await;
    let enhanced_mlc = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/qa/unittestcollections/")
                .query_param("unit__name", "TB1")
                .query_param("test_list__name", "MPC: Enhanced MLC Checks");
            then.status(200).json_body(json!({
                "count": 1,
                "results": [{"url": "http://qatrack/api/qa/unittestcollections/2/"}],
            }));
        })
        .await;
    let grouped_upload = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/qa/testlistinstances/")
                .body_contains("unittestcollections/1/")
                .body_contains("beamgroup_beamoutputchange_6x")
                .body_contains("beamgroup_beamoutputchange_10fff")
                .body_contains("QCPump/MPC/1234/2024-03-01-08-00/Beam and Geometry Checks");
            then.status(201).json_body(json!({"url": "created"}));
        })
        .await;
    let mlc_upload = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/qa/testlistinstances/")
                .body_contains("unittestcollections/2/");
            then.status(201).json_body(json!({"url": "created"}));
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let tds = dir.path();
    write_results(tds, "NDS-WKS-SN1234-2024-03-01-08-00-00-0000-BeamCheckTemplate6x").await;
    write_results(tds, "NDS-WKS-SN1234-2024-03-01-08-05-30-0001-BeamCheckTemplate10xFFF").await;
    write_results(tds, "NDS-WKS-SN1234-2024-03-01-08-10-00-0002-EnhancedMLCCheckTemplate6x").await;

    let registry = registry(Duration::from_secs(5), MissingDataRule::default()).unwrap();
    let runtime = PumpRuntime::new(
        registry.get(MPC).unwrap(),
        "Linac MPC",
        Some(&saved_state(&server, tds)),
        Arc::new(NullSink),
        RuntimeOptions::default(),
    )
    .await
    .unwrap();

    runtime.settled().await;
    assert!(runtime.is_valid(), "{:?}", runtime.statuses());

    let outcome = runtime.run_once().await.unwrap();

    assert_eq!(outcome.stats.fetched, 2);
    assert_eq!(outcome.stats.uploaded, 2);
    units.assert_async().await;
    beam_and_geometry.assert_async().await;
    enhanced_mlc.assert_async().await;
    grouped_upload.assert_async().await;
    mlc_upload.assert_async().await;
    runtime.terminate().await;
}

#[tokio::test]
async fn test_unknown_serial_number_is_skipped() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/auth/");
            then.status(200);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/units/units/");
            then.status(200).json_body(json!({
                "count": 1,
                "next": null,
                "results": [{"name": "TB2", "serial_number": "5678"}],
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/qa/testinstances/");
            then.status(200).json_body(json!({"count": 0, "results": []}));
        })
        .await;
    let upload = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/qa/testlistinstances/");
            then.status(201);
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    write_results(dir.path(), "NDS-WKS-SN1234-2024-03-01-08-00-00-0000-BeamCheckTemplate6x").await;

    let registry = registry(Duration::from_secs(5), MissingDataRule::default()).unwrap();
    let runtime = PumpRuntime::new(
        registry.get(MPC).unwrap(),
        "Linac MPC",
        Some(&saved_state(&server, dir.path())),
        Arc::new(NullSink),
        RuntimeOptions::default(),
    )
    .await
    .unwrap();
    runtime.settled().await;

    let outcome = runtime.run_once().await.unwrap();

    assert_eq!(outcome.stats.skipped, 1);
    upload.assert_hits_async(0).await;
    runtime.terminate().await;
}
