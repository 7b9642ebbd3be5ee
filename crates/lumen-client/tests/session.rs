//! Session tests against a scripted server on a loopback socket pair.
//!
//! The "server" side speaks raw framed JSON-RPC through the same codec the
//! client uses, which keeps the scripts honest about what actually goes over
//! the wire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lumen_client::{
    ext::MoveCursorResponse, ClientHooks, FrameReader, FrameWriter, ProgressEvent, Session,
    SessionConfig, SessionState,
};
use lumen_launch::{LaunchedServer, ServerProcess};
use serde_json::{json, Value};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
    (accepted.expect("accept").0, connected.expect("connect"))
}

struct ScriptedServer {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
}

impl ScriptedServer {
    fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
        }
    }

    async fn read(&mut self) -> Value {
        timeout(WAIT, self.reader.read())
            .await
            .expect("read timed out")
            .expect("read frame")
            .expect("peer closed unexpectedly")
    }

    async fn send(&mut self, message: Value) {
        self.writer.write(&message).await.expect("write frame");
    }

    /// Answer `initialize` and swallow `initialized`.
    async fn handshake(&mut self) {
        let initialize = self.read().await;
        assert_eq!(initialize["method"], "initialize");
        self.send(json!({
            "jsonrpc": "2.0",
            "id": initialize["id"],
            "result": { "capabilities": {} }
        }))
        .await;

        let initialized = self.read().await;
        assert_eq!(initialized["method"], "initialized");
    }

    /// Request/response fence: once the client has answered, everything sent
    /// before the request is guaranteed dispatched.
    async fn fence(&mut self) -> Value {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": 9999,
            "method": "sts/moveCursor",
            "params": {
                "uri": "file:///fence.java",
                "position": { "line": 0, "character": 0 }
            }
        }))
        .await;
        self.read().await
    }
}

fn external(stream: TcpStream) -> LaunchedServer {
    LaunchedServer::from_parts(ServerProcess::External, stream)
}

#[tokio::test]
async fn handshake_pushes_expanded_settings_in_order() {
    let (server_stream, client_stream) = socket_pair().await;

    let server = tokio::spawn(async move {
        let mut server = ScriptedServer::new(server_stream);
        server.handshake().await;
        let config_push = server.read().await;
        (server, config_push)
    });

    let config = SessionConfig {
        initialize_params: json!({ "processId": null, "rootUri": null }),
        initial_settings: Some(json!({ "bosh.cli.target": "https://10.0.0.4", "bosh.cli.timeout": 30 })),
    };
    let session = Session::start(external(client_stream), ClientHooks::default(), config)
        .await
        .expect("session start");
    assert_eq!(session.state(), SessionState::Ready);

    let (mut server, config_push) = server.await.expect("server script");
    assert_eq!(config_push["method"], "workspace/didChangeConfiguration");
    assert_eq!(
        config_push["params"]["settings"],
        json!({ "bosh": { "cli": { "target": "https://10.0.0.4", "timeout": 30 } } })
    );

    // Preference changes arrive in the order they were made.
    session
        .update_settings(&json!({ "boot.ls.heap": "1g" }))
        .expect("notify");
    session
        .update_settings(&json!({ "boot.ls.heap": "2g" }))
        .expect("notify");
    let first = server.read().await;
    let second = server.read().await;
    assert_eq!(first["params"]["settings"]["boot"]["ls"]["heap"], "1g");
    assert_eq!(second["params"]["settings"]["boot"]["ls"]["heap"], "2g");
}

#[tokio::test]
async fn move_cursor_request_is_answered_through_the_hook() {
    let (server_stream, client_stream) = socket_pair().await;

    let server = tokio::spawn(async move {
        let mut server = ScriptedServer::new(server_stream);
        server.handshake().await;
        server
            .send(json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "sts/moveCursor",
                "params": {
                    "uri": "file:///demo/App.java",
                    "position": { "line": 12, "character": 4 }
                }
            }))
            .await;
        let response = server.read().await;
        (server, response)
    });

    let seen = Arc::new(Mutex::new(Vec::new()));
    let hooks = ClientHooks {
        move_cursor: Box::new({
            let seen = Arc::clone(&seen);
            move |params| {
                seen.lock().unwrap().push(params.uri.as_str().to_string());
                MoveCursorResponse { applied: true }
            }
        }),
        ..ClientHooks::default()
    };

    let _session = Session::start(external(client_stream), hooks, SessionConfig::default())
        .await
        .expect("session start");

    let (_server, response) = server.await.expect("server script");
    assert_eq!(response["id"], 7);
    assert_eq!(response["result"]["applied"], true);
    assert_eq!(seen.lock().unwrap().as_slice(), ["file:///demo/App.java"]);
}

#[tokio::test]
async fn stale_highlight_versions_are_dropped() {
    let (server_stream, client_stream) = socket_pair().await;

    let highlight = |version: i32, lines: &[u32]| {
        let lenses: Vec<Value> = lines
            .iter()
            .map(|line| {
                json!({ "range": {
                    "start": { "line": line, "character": 0 },
                    "end": { "line": line, "character": 10 }
                } })
            })
            .collect();
        json!({
            "jsonrpc": "2.0",
            "method": "sts/highlight",
            "params": {
                "doc": { "uri": "file:///demo/App.java", "version": version },
                "codeLenses": lenses
            }
        })
    };

    let server = tokio::spawn(async move {
        let mut server = ScriptedServer::new(server_stream);
        server.handshake().await;
        server.send(highlight(5, &[1, 2])).await;
        // Out-of-order delivery of a superseded version.
        server.send(highlight(4, &[9])).await;
        server.send(highlight(6, &[3])).await;
        server.fence().await;
        server
    });

    let rendered = Arc::new(Mutex::new(Vec::new()));
    let hooks = ClientHooks {
        highlight: Box::new({
            let rendered = Arc::clone(&rendered);
            move |params| rendered.lock().unwrap().push(params.doc.version)
        }),
        ..ClientHooks::default()
    };

    let session = Session::start(external(client_stream), hooks, SessionConfig::default())
        .await
        .expect("session start");
    let _server = server.await.expect("server script");

    // Version 4 must never have reached the renderer.
    assert_eq!(rendered.lock().unwrap().as_slice(), [5, 6]);

    let uri: lsp_types::Uri = "file:///demo/App.java".parse().expect("uri");
    let held = session.highlights(&uri).expect("document present");
    assert_eq!(held.version, 6);
    assert_eq!(held.code_lenses.len(), 1);
}

#[tokio::test]
async fn progress_messages_set_and_clear_by_id() {
    let (server_stream, client_stream) = socket_pair().await;

    let server = tokio::spawn(async move {
        let mut server = ScriptedServer::new(server_stream);
        server.handshake().await;
        server
            .send(json!({
                "jsonrpc": "2.0",
                "method": "sts/progress",
                "params": { "id": "index", "statusMsg": "Indexing workspace" }
            }))
            .await;
        server
            .send(json!({
                "jsonrpc": "2.0",
                "method": "sts/progress",
                "params": { "id": "index" }
            }))
            .await;
        server.fence().await;
        server
    });

    let events = Arc::new(Mutex::new(Vec::new()));
    let hooks = ClientHooks {
        progress: Box::new({
            let events = Arc::clone(&events);
            move |event| events.lock().unwrap().push(event)
        }),
        ..ClientHooks::default()
    };

    let session = Session::start(external(client_stream), hooks, SessionConfig::default())
        .await
        .expect("session start");
    let _server = server.await.expect("server script");

    assert_eq!(
        events.lock().unwrap().as_slice(),
        [
            ProgressEvent {
                id: "index".to_string(),
                status: Some("Indexing workspace".to_string())
            },
            ProgressEvent {
                id: "index".to_string(),
                status: None
            },
        ]
    );
    assert_eq!(session.progress_status("index"), None);
}

#[tokio::test]
async fn classpath_listener_registry_tracks_add_and_remove() {
    let (server_stream, client_stream) = socket_pair().await;

    let server = tokio::spawn(async move {
        let mut server = ScriptedServer::new(server_stream);
        server.handshake().await;

        server
            .send(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "sts/addClasspathListener",
                "params": { "callbackCommandId": "lumen.classpath.cb" }
            }))
            .await;
        let added = server.read().await;

        server
            .send(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "sts/removeClasspathListener",
                "params": { "callbackCommandId": "lumen.classpath.cb" }
            }))
            .await;
        let removed = server.read().await;
        (server, added, removed)
    });

    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let hooks = ClientHooks {
        classpath_listeners_changed: Box::new({
            let snapshots = Arc::clone(&snapshots);
            move |listeners| snapshots.lock().unwrap().push(listeners.to_vec())
        }),
        ..ClientHooks::default()
    };

    let session = Session::start(external(client_stream), hooks, SessionConfig::default())
        .await
        .expect("session start");
    let (_server, added, removed) = server.await.expect("server script");

    assert_eq!(added["id"], 1);
    assert!(added.get("error").is_none());
    assert_eq!(removed["id"], 2);

    assert_eq!(
        snapshots.lock().unwrap().as_slice(),
        [vec!["lumen.classpath.cb".to_string()], Vec::new()]
    );
    assert!(session.classpath_listeners().is_empty());
}

#[tokio::test]
async fn unknown_requests_are_answered_without_killing_the_session() {
    let (server_stream, client_stream) = socket_pair().await;

    let server = tokio::spawn(async move {
        let mut server = ScriptedServer::new(server_stream);
        server.handshake().await;

        server
            .send(json!({ "jsonrpc": "2.0", "id": 41, "method": "sts/bogus", "params": {} }))
            .await;
        let error_response = server.read().await;
        // The session keeps working after the unknown method.
        let fence_response = server.fence().await;
        (server, error_response, fence_response)
    });

    let session = Session::start(
        external(client_stream),
        ClientHooks::default(),
        SessionConfig::default(),
    )
    .await
    .expect("session start");
    let (_server, error_response, fence_response) = server.await.expect("server script");

    assert_eq!(error_response["id"], 41);
    assert_eq!(error_response["error"]["code"], -32601);
    assert_eq!(fence_response["id"], 9999);
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn server_disconnect_disposes_the_session_once() {
    let (server_stream, client_stream) = socket_pair().await;

    let server = tokio::spawn(async move {
        let mut server = ScriptedServer::new(server_stream);
        server.handshake().await;
        // Dropping the socket simulates an abrupt server death.
    });

    let gone = Arc::new(Notify::new());
    let fired = Arc::new(AtomicUsize::new(0));
    let hooks = ClientHooks {
        disconnected: Box::new({
            let gone = Arc::clone(&gone);
            let fired = Arc::clone(&fired);
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
                gone.notify_one();
            }
        }),
        ..ClientHooks::default()
    };

    let session = Session::start(external(client_stream), hooks, SessionConfig::default())
        .await
        .expect("session start");
    server.await.expect("server script");

    timeout(WAIT, gone.notified())
        .await
        .expect("disconnect hook never fired");
    assert_eq!(session.state(), SessionState::Disconnected);

    // Requests on a dead session fail instead of hanging.
    let err = session
        .request("workspace/symbol", json!({ "query": "" }))
        .await
        .expect_err("dead session");
    assert!(matches!(
        err,
        lumen_client::ProtocolError::Disconnected | lumen_client::ProtocolError::RequestAbandoned
    ));

    drop(session);
    assert_eq!(fired.load(Ordering::SeqCst), 1, "disconnect hook fired once");
}

#[tokio::test]
async fn shutdown_sends_the_lsp_farewell() {
    let (server_stream, client_stream) = socket_pair().await;

    let server = tokio::spawn(async move {
        let mut server = ScriptedServer::new(server_stream);
        server.handshake().await;

        let shutdown = server.read().await;
        assert_eq!(shutdown["method"], "shutdown");
        server
            .send(json!({ "jsonrpc": "2.0", "id": shutdown["id"], "result": null }))
            .await;
        let exit = server.read().await;
        assert_eq!(exit["method"], "exit");
    });

    let fired = Arc::new(AtomicUsize::new(0));
    let hooks = ClientHooks {
        disconnected: Box::new({
            let fired = Arc::clone(&fired);
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        }),
        ..ClientHooks::default()
    };

    let session = Session::start(external(client_stream), hooks, SessionConfig::default())
        .await
        .expect("session start");
    session.shutdown().await;
    server.await.expect("server script");

    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
