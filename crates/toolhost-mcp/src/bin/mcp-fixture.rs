//! Scriptable MCP server over stdio, used by the integration tests.
//!
//! Flags:
//!   --noise              surround every response with junk lines and a stale-id frame
//!   --null-schema        list a single `echo` tool with a null input schema
//!   --fail-initialize    answer `initialize` with a JSON-RPC error
//!   --ignore-eof         keep running after stdin closes
//!   --ping               send `ping` and `roots/list` requests after the handshake
//!   --crash-once <path>  `crash` exits only if <path> does not exist yet (then creates it)

use serde_json::{Value, json};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Options {
    noise: bool,
    null_schema: bool,
    fail_initialize: bool,
    ignore_eof: bool,
    ping: bool,
    crash_once: Option<PathBuf>,
}

fn parse_options() -> Options {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--noise" => options.noise = true,
            "--null-schema" => options.null_schema = true,
            "--fail-initialize" => options.fail_initialize = true,
            "--ignore-eof" => options.ignore_eof = true,
            "--ping" => options.ping = true,
            "--crash-once" => options.crash_once = args.next().map(PathBuf::from),
            other => eprintln!("mcp-fixture: ignoring unknown flag {other}"),
        }
    }
    options
}

/// Server-initiated requests and what came back for them.
#[derive(Default)]
struct Probes {
    ping: Option<String>,
    roots: Option<String>,
}

struct Server {
    options: Options,
    catalog_changed: AtomicBool,
    probes: Mutex<Probes>,
}

fn send(frame: &Value) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{frame}");
    let _ = out.flush();
}

fn send_raw(line: &str) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

fn text(s: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": s.into()}], "isError": false})
}

impl Server {
    fn respond(&self, id: &Value, outcome: Result<Value, (i64, &str)>) {
        if self.options.noise {
            send_raw("fixture log: handling request");
            send_raw("");
            send_raw("{not json at all");
            send(&json!({"jsonrpc": "2.0", "id": 999_999, "result": {"stale": true}}));
        }
        let frame = match outcome {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            }
        };
        send(&frame);
    }

    fn tool(name: &str, description: &str) -> Value {
        json!({
            "name": name,
            "description": description,
            "inputSchema": {"type": "object", "properties": {}}
        })
    }

    fn list_tools(&self, params: &Value) -> Value {
        if self.options.null_schema {
            return json!({"tools": [{"name": "echo", "description": "", "inputSchema": null}]});
        }
        match params.get("cursor").and_then(Value::as_str) {
            None => json!({
                "tools": [Self::tool("echo", "Echo the text argument"), Self::tool("fail", "Always fails")],
                "nextCursor": "c2"
            }),
            Some(_) => {
                let mut tools = vec![
                    Self::tool("image", "Returns an image"),
                    Self::tool("mixed", "Returns mixed content"),
                    Self::tool("slow", "Sleeps for `ms` milliseconds"),
                    Self::tool("hang", "Never answers"),
                    Self::tool("crash", "Exits the process"),
                    Self::tool("notify", "Announces a catalog change"),
                    Self::tool("probes", "Reports server-initiated request results"),
                ];
                if self.catalog_changed.load(Ordering::SeqCst) {
                    tools.push(Self::tool("added", "Appears after a catalog change"));
                }
                json!({"tools": tools, "nextCursor": ""})
            }
        }
    }

    fn call_tool(self: &Arc<Self>, id: Value, params: &Value) {
        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        let args = params.get("arguments").cloned().unwrap_or(Value::Null);

        match name {
            "echo" => {
                let reply = args
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| args.to_string());
                self.respond(&id, Ok(text(reply)));
            }
            "fail" => self.respond(
                &id,
                Ok(json!({"content": [{"type": "text", "text": "boom"}], "isError": true})),
            ),
            "image" => self.respond(
                &id,
                Ok(json!({"content": [{"type": "image", "data": "aGVsbG8=", "mimeType": "image/png"}]})),
            ),
            "mixed" => self.respond(
                &id,
                Ok(json!({"content": [
                    {"type": "text", "text": "first"},
                    {"type": "image", "data": "abcd"},
                    {"type": "resource", "text": "res"}
                ]})),
            ),
            "slow" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(300);
                let server = Arc::clone(self);
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(ms));
                    server.respond(&id, Ok(text(format!("slept {ms}ms"))));
                });
            }
            "hang" => {}
            "crash" => match &self.options.crash_once {
                Some(marker) if marker.exists() => self.respond(&id, Ok(text("survived"))),
                Some(marker) => {
                    let _ = std::fs::write(marker, b"crashed");
                    eprintln!("mcp-fixture: crashing once");
                    std::process::exit(3);
                }
                None => {
                    eprintln!("mcp-fixture: crashing");
                    std::process::exit(3);
                }
            },
            "notify" => {
                self.catalog_changed.store(true, Ordering::SeqCst);
                send(&json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}));
                self.respond(&id, Ok(text("notified")));
            }
            "probes" => {
                let probes = self.probes.lock().unwrap_or_else(|e| e.into_inner());
                let report = format!(
                    "ping:{} roots:{}",
                    probes.ping.as_deref().unwrap_or("pending"),
                    probes.roots.as_deref().unwrap_or("pending")
                );
                drop(probes);
                self.respond(&id, Ok(text(report)));
            }
            other => self.respond(&id, Err((-32602, &format!("unknown tool {other}")))),
        }
    }

    fn record_probe(&self, frame: &Value) {
        let outcome = match frame.get("error") {
            Some(err) => err
                .get("code")
                .map(Value::to_string)
                .unwrap_or_else(|| "error".to_string()),
            None => "ok".to_string(),
        };
        let mut probes = self.probes.lock().unwrap_or_else(|e| e.into_inner());
        match frame.get("id").and_then(Value::as_str) {
            Some("probe-ping") => probes.ping = Some(outcome),
            Some("probe-roots") => probes.roots = Some(outcome),
            _ => {}
        }
    }

    fn handle(self: &Arc<Self>, frame: Value) {
        let method = frame.get("method").and_then(Value::as_str).map(str::to_string);
        let id = frame.get("id").cloned();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);

        match (method.as_deref(), id) {
            (Some("initialize"), Some(id)) => {
                if self.options.fail_initialize {
                    self.respond(&id, Err((-32603, "initialization refused")));
                } else {
                    self.respond(
                        &id,
                        Ok(json!({
                            "protocolVersion": "2024-11-05",
                            "capabilities": {"tools": {"listChanged": true}},
                            "serverInfo": {"name": "mcp-fixture", "version": "0.1.0"}
                        })),
                    );
                }
            }
            (Some("notifications/initialized"), None) => {
                if self.options.ping {
                    send(&json!({"jsonrpc": "2.0", "id": "probe-ping", "method": "ping"}));
                    send(&json!({"jsonrpc": "2.0", "id": "probe-roots", "method": "roots/list"}));
                }
            }
            (Some("tools/list"), Some(id)) => {
                let result = self.list_tools(&params);
                self.respond(&id, Ok(result));
            }
            (Some("tools/call"), Some(id)) => self.call_tool(id, &params),
            (Some(_), Some(id)) => self.respond(&id, Err((-32601, "Method not found"))),
            (Some(_), None) => {}
            (None, Some(_)) => self.record_probe(&frame),
            (None, None) => {}
        }
    }
}

fn main() {
    let server = Arc::new(Server {
        options: parse_options(),
        catalog_changed: AtomicBool::new(false),
        probes: Mutex::new(Probes::default()),
    });
    eprintln!("mcp-fixture: starting pid {}", std::process::id());

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(frame) => server.handle(frame),
            Err(e) => eprintln!("mcp-fixture: bad frame: {e}"),
        }
    }

    if server.options.ignore_eof {
        eprintln!("mcp-fixture: stdin closed, lingering");
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    }
    eprintln!("mcp-fixture: stdin closed, exiting");
}
