//! Integration tests driving the gateway server over real HTTP, covering
//! the boundary and scenario tests enumerated in the specification's
//! testable-properties section.

use std::collections::HashMap;
use std::net::SocketAddr;

use ciana_parrot::gateway::{start_server, BridgeConfig, GatewayConfig, GatewayRequest, GatewayResult};

const TOKEN: &str = "integration-test-token";

fn config_with_bridge(name: &str, allowed_cwd: Vec<std::path::PathBuf>) -> GatewayConfig {
    let mut bridges = HashMap::new();
    bridges.insert(
        name.to_string(),
        BridgeConfig {
            allowed_commands: ["echo".to_string(), "sleep".to_string(), "cat".to_string()]
                .into_iter()
                .collect(),
            allowed_cwd,
        },
    );
    GatewayConfig {
        token: TOKEN.to_string(),
        bridges,
        default_timeout: 30,
        recursion_guard_vars: vec!["CLAUDE_CODE_ENTRYPOINT".into(), "CIANAPARROT_BRIDGE_DEPTH".into()],
    }
}

async fn spawn_server(config: GatewayConfig) -> SocketAddr {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (listener, local_addr, router) = start_server(config, addr).await.unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    local_addr
}

#[tokio::test]
async fn health_endpoint_lists_configured_bridges() {
    let addr = spawn_server(config_with_bridge("claude-code", vec![])).await;
    let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["bridges"][0], "claude-code");
}

#[tokio::test]
async fn oversized_body_returns_413() {
    let addr = spawn_server(config_with_bridge("claude-code", vec![])).await;
    let client = reqwest::Client::new();
    let big = vec![b'a'; 1_048_577];
    let response = client
        .post(format!("http://{addr}/execute"))
        .bearer_auth(TOKEN)
        .body(big)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);
}

#[tokio::test]
async fn unauthenticated_oversized_body_returns_401_not_413() {
    let addr = spawn_server(config_with_bridge("claude-code", vec![])).await;
    let client = reqwest::Client::new();
    let big = vec![b'a'; 1_048_577];
    let response = client
        .post(format!("http://{addr}/execute"))
        .body(big)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn missing_auth_returns_401() {
    let addr = spawn_server(config_with_bridge("claude-code", vec![])).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/execute"))
        .json(&GatewayRequest {
            bridge: "claude-code".into(),
            argv: vec!["echo".into()],
            cwd: None,
            timeout: None,
        })
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn traversal_cwd_outside_allowed_prefix_is_rejected() {
    let allowed = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let addr = spawn_server(config_with_bridge(
        "claude-code",
        vec![allowed.path().canonicalize().unwrap()],
    ))
    .await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/execute"))
        .bearer_auth(TOKEN)
        .json(&GatewayRequest {
            bridge: "claude-code".into(),
            argv: vec!["echo".into()],
            cwd: Some(outside.path().to_string_lossy().into_owned()),
            timeout: None,
        })
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn timeout_scenario_returns_200_with_returncode_negative_one() {
    let addr = spawn_server(config_with_bridge("claude-code", vec![])).await;
    let client = reqwest::Client::new();
    let start = std::time::Instant::now();
    let response = client
        .post(format!("http://{addr}/execute"))
        .bearer_auth(TOKEN)
        .json(&GatewayRequest {
            bridge: "claude-code".into(),
            argv: vec!["sleep".into(), "3".into()],
            cwd: None,
            timeout: Some(1),
        })
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: GatewayResult = response.json().await.unwrap();
    assert_eq!(body.returncode, -1);
    assert_eq!(body.stderr, "Command timed out");
    assert!(start.elapsed() < std::time::Duration::from_secs(3));
}

#[tokio::test]
async fn allowed_command_runs_and_returns_200_with_stdout() {
    let addr = spawn_server(config_with_bridge("claude-code", vec![])).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/execute"))
        .bearer_auth(TOKEN)
        .json(&GatewayRequest {
            bridge: "claude-code".into(),
            argv: vec!["echo".into(), "integration".into()],
            cwd: None,
            timeout: None,
        })
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: GatewayResult = response.json().await.unwrap();
    assert_eq!(body.returncode, 0);
    assert_eq!(body.stdout.trim(), "integration");
}
