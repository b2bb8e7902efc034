//! Socket-level tests for the RPC surface: real unix-socket round trips
//! against a daemon wired to a mock orchestrator. Acquisition itself needs a
//! DHCP server and a container namespace, so these exercise the framing and
//! the error paths a plugin invocation can hit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use leasekeeper::daemon::Daemon;
use leasekeeper::orchestrator::Orchestrator;
use leasekeeper::{DaemonConfig, Result};

struct NoWorkloads;

#[async_trait]
impl Orchestrator for NoWorkloads {
    async fn workload_exists(&self, _namespace: &str, _name: &str) -> Result<bool> {
        Ok(false)
    }

    async fn set_node_offline(&self, _node: &str, _offline: bool) -> Result<()> {
        Ok(())
    }
}

struct TestGuard(Vec<PathBuf>);

impl Drop for TestGuard {
    fn drop(&mut self) {
        for path in &self.0 {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn start_daemon(tag: &str) -> (PathBuf, TestGuard) {
    let socket_path = std::env::temp_dir().join(format!(
        "leasekeeper-test-{}-{}.sock",
        tag,
        std::process::id()
    ));
    let lease_file = std::env::temp_dir().join(format!(
        "leasekeeper-test-{}-{}.json",
        tag,
        std::process::id()
    ));
    let _ = std::fs::remove_file(&socket_path);

    let config = DaemonConfig {
        socket_path: socket_path.clone(),
        lease_file: lease_file.clone(),
        hostprefix: String::new(),
        pidfile: None,
        timeout: Duration::from_secs(1),
        resend_max: Duration::from_secs(2),
        broadcast: false,
    };

    let listener = UnixListener::bind(&socket_path).unwrap();
    let daemon = Arc::new(Daemon::new(config, Arc::new(NoWorkloads)));
    tokio::spawn(daemon.run(listener));

    let guard = TestGuard(vec![socket_path.clone(), lease_file]);
    (socket_path, guard)
}

async fn call(socket_path: &PathBuf, request: &Value) -> Value {
    let mut stream = UnixStream::connect(socket_path).await.unwrap();
    stream
        .write_all(request.to_string().as_bytes())
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    serde_json::from_slice(&reply).unwrap()
}

fn cmd_args(netns: &str) -> Value {
    json!({
        "containerID": "c1",
        "netns": netns,
        "ifName": "eth0",
        "args": "K8S_POD_NAMESPACE=prod;K8S_POD_NAME=web-0",
        "stdinData": "{\"name\": \"testnet\"}"
    })
}

#[tokio::test]
async fn malformed_request_gets_error_reply() {
    let (socket_path, _guard) = start_daemon("malformed");

    let mut stream = UnixStream::connect(&socket_path).await.unwrap();
    stream.write_all(b"this is not json").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    let reply: Value = serde_json::from_slice(&reply).unwrap();

    let error = reply["error"].as_str().unwrap();
    assert!(error.contains("invalid request"), "got: {}", error);
}

#[tokio::test]
async fn release_of_unknown_lease_succeeds() {
    let (socket_path, _guard) = start_daemon("release-unknown");

    let reply = call(
        &socket_path,
        &json!({"method": "Release", "args": cmd_args("/var/run/netns/nope")}),
    )
    .await;

    assert!(reply.get("error").is_none(), "got: {}", reply);
    assert_eq!(reply["result"], json!({}));
}

#[tokio::test]
async fn allocate_reports_missing_namespace() {
    let (socket_path, _guard) = start_daemon("allocate-badns");

    let reply = call(
        &socket_path,
        &json!({"method": "Allocate", "args": cmd_args("/no/such/netns")}),
    )
    .await;

    let error = reply["error"].as_str().unwrap();
    assert!(error.contains("namespace unavailable"), "got: {}", error);
}

#[tokio::test]
async fn allocate_rejects_bad_network_config() {
    let (socket_path, _guard) = start_daemon("allocate-badconf");

    let mut args = cmd_args("/no/such/netns");
    args["stdinData"] = json!("not a config");
    let reply = call(&socket_path, &json!({"method": "Allocate", "args": args})).await;

    let error = reply["error"].as_str().unwrap();
    assert!(error.contains("Invalid configuration"), "got: {}", error);
}

#[tokio::test]
async fn connections_are_independent() {
    let (socket_path, _guard) = start_daemon("sequential");

    for _ in 0..3 {
        let reply = call(
            &socket_path,
            &json!({"method": "Release", "args": cmd_args("/var/run/netns/nope")}),
        )
        .await;
        assert!(reply.get("error").is_none());
    }
}
