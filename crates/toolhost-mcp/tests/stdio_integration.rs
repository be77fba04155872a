//! End-to-end tests for `McpClient` against the `mcp-fixture` server.
//!
//! Every test spawns a real child process and talks newline-delimited
//! JSON-RPC to it over stdio.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use toolhost_mcp::{ClientState, McpClient, McpError, TOOLS_LIST_CHANGED};

const FIXTURE: &str = env!("CARGO_BIN_EXE_mcp-fixture");
const HANDSHAKE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn spawn(flags: &[&str]) -> McpClient {
    let args: Vec<String> = flags.iter().map(|f| f.to_string()).collect();
    McpClient::spawn("fixture", FIXTURE, &args, HashMap::new()).unwrap()
}

async fn connected(flags: &[&str]) -> McpClient {
    let client = spawn(flags);
    client.initialize(HANDSHAKE).await.unwrap();
    client
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

async fn crash(client: &McpClient) {
    let result = client.call_tool("crash", json!({}), None).await;
    assert!(
        matches!(result, Err(McpError::Closed { .. })),
        "expected Closed, got {result:?}"
    );
    assert!(wait_until(|| client.state() == ClientState::Dead).await);
}

// ---------------------------------------------------------------------------
// Handshake and discovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_marks_client_alive() {
    let client = spawn(&[]);
    assert_eq!(client.state(), ClientState::Starting);
    client.initialize(HANDSHAKE).await.unwrap();
    assert_eq!(client.state(), ClientState::Alive);
    assert!(client.is_alive());
    client.close().await.unwrap();
    assert_eq!(client.state(), ClientState::Dead);
}

#[tokio::test]
async fn list_tools_follows_cursor_in_order() {
    let client = connected(&[]).await;
    let tools = client.list_tools(HANDSHAKE).await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(
        names,
        ["echo", "fail", "image", "mixed", "slow", "hang", "crash", "notify", "probes"]
    );
    assert_eq!(tools[0].description, "Echo the text argument");
    assert_eq!(tools[0].input_schema["type"], "object");
    client.close().await.unwrap();
}

#[tokio::test]
async fn null_schema_is_replaced_with_empty_object_schema() {
    let client = connected(&["--null-schema"]).await;
    let tools = client.list_tools(HANDSHAKE).await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");
    assert_eq!(tools[0].description, "");
    assert_eq!(
        tools[0].input_schema,
        json!({"type": "object", "properties": {}})
    );
    client.close().await.unwrap();
}

#[tokio::test]
async fn initialize_error_is_reported_as_rpc_error() {
    let client = spawn(&["--fail-initialize"]);
    match client.initialize(HANDSHAKE).await {
        Err(McpError::JsonRpc { code, message, .. }) => {
            assert_eq!(code, -32603);
            assert_eq!(message, "initialization refused");
        }
        other => panic!("expected JsonRpc error, got {other:?}"),
    }
    // A refused handshake leaves nothing usable behind
    assert_eq!(client.state(), ClientState::Dead);
    let result = client.call_tool("echo", json!({}), None).await;
    assert!(matches!(result, Err(McpError::ServerNotRunning { .. })));
    client.close().await.unwrap();
}

#[tokio::test]
async fn spawn_of_missing_binary_fails() {
    let result = McpClient::spawn("ghost", "/nonexistent/mcp-server-xyz", &[], HashMap::new());
    match result {
        Err(McpError::SpawnFailed { name, .. }) => assert_eq!(name, "ghost"),
        other => panic!("expected SpawnFailed, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn echo_returns_text() {
    let client = connected(&[]).await;
    let out = client
        .call_tool("echo", json!({"text": "hello"}), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(out, "hello");
    client.close().await.unwrap();
}

#[tokio::test]
async fn error_result_carries_rendered_detail() {
    let client = connected(&[]).await;
    match client.call_tool("fail", json!({}), None).await {
        Err(McpError::ToolFailed { tool, detail, .. }) => {
            assert_eq!(tool, "fail");
            assert_eq!(detail, "boom");
        }
        other => panic!("expected ToolFailed, got {other:?}"),
    }
    // A tool-level error leaves the server healthy
    assert!(client.is_alive());
    client.close().await.unwrap();
}

#[tokio::test]
async fn image_and_mixed_content_are_rendered() {
    let client = connected(&[]).await;
    let image = client.call_tool("image", json!({}), None).await.unwrap();
    assert_eq!(image, "[image: image/png, 8 bytes base64]");

    let mixed = client.call_tool("mixed", json!({}), None).await.unwrap();
    assert_eq!(
        mixed,
        "first\n[image: image/unknown, 4 bytes base64]\nres"
    );
    client.close().await.unwrap();
}

#[tokio::test]
async fn unknown_tool_is_rpc_error() {
    let client = connected(&[]).await;
    let result = client.call_tool("nope", json!({}), None).await;
    assert!(matches!(result, Err(McpError::JsonRpc { code: -32602, .. })));
    client.close().await.unwrap();
}

#[tokio::test]
async fn timeout_abandons_request_without_leaking() {
    let client = connected(&[]).await;
    let before = client.pending_requests();

    let started = Instant::now();
    let result = client
        .call_tool("hang", json!({}), Some(Duration::from_millis(200)))
        .await;
    match result {
        Err(McpError::Timeout {
            method, timeout_ms, ..
        }) => {
            assert_eq!(method, "tools/call");
            assert_eq!(timeout_ms, 200);
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(client.pending_requests(), before);

    // The connection is still usable
    let out = client.call_tool("echo", json!({"text": "still here"}), None).await;
    assert_eq!(out.unwrap(), "still here");
    client.close().await.unwrap();
}

#[tokio::test]
async fn responses_are_matched_out_of_order() {
    let client = Arc::new(connected(&[]).await);

    let slow = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.call_tool("slow", json!({"ms": 600}), None).await })
    };
    assert!(wait_until(|| client.pending_requests() == 1).await);

    let fast = client.call_tool("echo", json!({"text": "fast"}), None).await;
    assert_eq!(fast.unwrap(), "fast");
    assert!(!slow.is_finished());

    assert_eq!(slow.await.unwrap().unwrap(), "slept 600ms");
    assert_eq!(client.pending_requests(), 0);
    client.close().await.unwrap();
}

#[tokio::test]
async fn noise_on_stdout_is_ignored() {
    let client = connected(&["--noise"]).await;
    let tools = client.list_tools(HANDSHAKE).await.unwrap();
    assert_eq!(tools.len(), 9);
    let out = client.call_tool("echo", json!({"text": "clean"}), None).await;
    assert_eq!(out.unwrap(), "clean");
    assert_eq!(client.pending_requests(), 0);
    client.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Process death
// ---------------------------------------------------------------------------

#[tokio::test]
async fn crash_fails_every_pending_request() {
    let client = Arc::new(connected(&[]).await);

    let hung: Vec<_> = (0..8)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call_tool("hang", json!({}), None).await })
        })
        .collect();
    assert!(wait_until(|| client.pending_requests() == 8).await);

    crash(&client).await;
    for handle in hung {
        let result = handle.await.unwrap();
        assert!(
            matches!(result, Err(McpError::Closed { .. })),
            "expected Closed, got {result:?}"
        );
    }
    assert_eq!(client.pending_requests(), 0);
    client.close().await.unwrap();
}

#[tokio::test]
async fn dead_client_fails_fast() {
    let client = connected(&[]).await;
    crash(&client).await;

    let started = Instant::now();
    let result = client.call_tool("echo", json!({"text": "x"}), None).await;
    assert!(matches!(result, Err(McpError::ServerNotRunning { .. })));
    assert!(started.elapsed() < Duration::from_secs(1));
    client.close().await.unwrap();
}

#[tokio::test]
async fn reconnect_restores_a_dead_server() {
    let client = connected(&[]).await;
    crash(&client).await;

    client.reconnect(HANDSHAKE).await.unwrap();
    assert_eq!(client.state(), ClientState::Alive);
    let out = client.call_tool("echo", json!({"text": "back"}), None).await;
    assert_eq!(out.unwrap(), "back");

    // stderr survives the restart: both processes announced themselves
    assert!(
        wait_until(|| client.stderr().matches("mcp-fixture: starting pid").count() == 2).await
    );
    assert!(client.stderr().contains("mcp-fixture: crashing"));
    client.close().await.unwrap();
}

#[tokio::test]
async fn revive_leaves_a_live_server_alone() {
    let client = connected(&[]).await;
    assert!(!client.revive(HANDSHAKE).await.unwrap());
    assert!(wait_until(|| client.stderr().contains("starting pid")).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.stderr().matches("starting pid").count(), 1);
    client.close().await.unwrap();
}

#[tokio::test]
async fn stderr_is_captured() {
    let client = connected(&[]).await;
    assert!(wait_until(|| client.stderr().contains("mcp-fixture: starting pid")).await);
    assert!(client.stderr_tail(10).len() <= 10);
    client.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_waits_for_clean_exit() {
    let client = connected(&[]).await;
    let started = Instant::now();
    client.close().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.state(), ClientState::Dead);
    assert!(wait_until(|| client.stderr().contains("stdin closed, exiting")).await);
}

#[tokio::test]
async fn close_kills_server_that_ignores_eof() {
    let client = connected(&["--ignore-eof"]).await;
    let started = Instant::now();
    client
        .graceful_close(Duration::from_millis(300))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.state(), ClientState::Dead);

    let result = client.call_tool("echo", json!({}), None).await;
    assert!(matches!(result, Err(McpError::ServerNotRunning { .. })));
}

#[tokio::test]
async fn close_is_idempotent() {
    let client = connected(&[]).await;
    client.close().await.unwrap();
    client.close().await.unwrap();
    assert_eq!(client.state(), ClientState::Dead);
}

// ---------------------------------------------------------------------------
// Server-initiated traffic
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_requests_are_answered() {
    let client = connected(&["--ping"]).await;

    let mut report = String::new();
    for _ in 0..50 {
        report = client.call_tool("probes", json!({}), None).await.unwrap();
        if !report.contains("pending") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(report, "ping:ok roots:-32601");
    client.close().await.unwrap();
}

#[tokio::test]
async fn notifications_reach_the_handler() {
    let client = connected(&[]).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client.set_notification_handler(move |method, _params| {
        sink.lock().unwrap().push(method.to_string());
    });

    // The fixture writes the notification before the response, and frames
    // are dispatched in order.
    let out = client.call_tool("notify", json!({}), None).await.unwrap();
    assert_eq!(out, "notified");
    assert_eq!(*seen.lock().unwrap(), vec![TOOLS_LIST_CHANGED.to_string()]);

    let tools = client.list_tools(HANDSHAKE).await.unwrap();
    assert_eq!(tools.last().map(|t| t.name.as_str()), Some("added"));
    client.close().await.unwrap();
}
