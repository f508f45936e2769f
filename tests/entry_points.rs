// tests/entry_points.rs

use chrono::{DateTime, Utc};
use hprobe::{
    ProbeResult, ScanError, ScanOptions, scan_target, scan_target_async, scan_target_with_config,
    scan_target_with_config_async,
};
use serde_json::json;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Drops the fields that legitimately differ between two runs.
fn normalized(mut results: Vec<ProbeResult>) -> Vec<ProbeResult> {
    for result in &mut results {
        result.timestamp = DateTime::<Utc>::UNIX_EPOCH;
        result.elapsed_ms = 0;
        if let Some(response) = result.response.as_mut() {
            response.headers.remove("date");
        }
    }
    results.sort_by_key(ProbeResult::sort_key);
    results
}

fn start_server(runtime: &tokio::runtime::Runtime) -> MockServer {
    runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Server", "Apache/2.4.58 (Debian)")
                    .set_body_raw("<html><title>Parity</title></html>", "text/html"),
            )
            .mount(&server)
            .await;
        server
    })
}

#[test]
fn test_blocking_and_async_entry_points_agree() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let server = start_server(&runtime);
    let port = server.address().port();

    let options = ScanOptions {
        targets: vec!["127.0.0.1".to_string(), format!("{}/other", server.uri())],
        ports: vec![port],
        scheme_policy: "http".to_string(),
        tech_detect: true,
        fingerprint: true,
        silent: true,
        ..Default::default()
    };
    let config = json!({
        "targets": ["127.0.0.1", format!("{}/other", server.uri())],
        "ports": [port],
        "scheme_policy": "HTTP",
        "tech_detect": true,
        "fingerprint": true,
        "silent": true
    });

    let blocking = normalized(scan_target(options.clone()).unwrap());
    let from_config = normalized(scan_target_with_config(&config).unwrap());
    let asynchronous = normalized(runtime.block_on(scan_target_async(options)).unwrap());
    let async_config = normalized(runtime.block_on(scan_target_with_config_async(&config)).unwrap());

    assert_eq!(blocking.len(), 2);
    assert!(blocking.iter().all(ProbeResult::is_success));
    assert_eq!(blocking, asynchronous);
    assert_eq!(blocking, from_config);
    assert_eq!(blocking, async_config);
}

#[test]
fn test_config_object_rejects_unknown_keys() {
    let err = scan_target_with_config(&json!({"target": "a.test", "threadz": 5})).unwrap_err();
    assert!(matches!(err, ScanError::Config(_)));
}

#[test]
fn test_config_object_must_be_a_map() {
    let err = scan_target_with_config(&json!(["a.test"])).unwrap_err();
    assert!(matches!(err, ScanError::Config(_)));
}

#[test]
fn test_body_sources_are_exclusive() {
    let err = scan_target(ScanOptions {
        target: Some("a.test".to_string()),
        post_data: Some("a=1".to_string()),
        post_file: Some("body.txt".into()),
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, ScanError::Config(_)));
}

#[test]
fn test_empty_targets_are_rejected() {
    let err = scan_target(ScanOptions::default()).unwrap_err();
    assert!(matches!(err, ScanError::Config(_)));
}

#[tokio::test]
async fn test_results_serialize_as_json() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let results = scan_target_async(ScanOptions {
        target: Some(server.uri()),
        asn: false,
        silent: true,
        ..Default::default()
    })
    .await
    .unwrap();

    let value = serde_json::to_value(&results[0]).unwrap();
    assert_eq!(value["scheme"], "http");
    assert_eq!(value["source"], "active");
    assert_eq!(value["asn"]["status"], "not_requested");
    assert_eq!(value["response"]["status_code"], 200);
    assert!(value["error"].is_null());
}
