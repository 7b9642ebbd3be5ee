//! Session driver: one object owning the socket, the server process, and all
//! per-session protocol state.
//!
//! Everything that was historically process-wide (the active-connection
//! holder, the highlight map, the status-message map) is instance state
//! here, so several sessions (one per workspace window) can coexist in one
//! process without stepping on each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lumen_launch::{LaunchedServer, ServerProcess};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::codec::{FrameReader, FrameWriter};
use crate::ext::{
    methods, ClasspathListenerParams, HighlightParams, MoveCursorParams, MoveCursorResponse,
    ProgressParams,
};
use crate::highlight::{DocumentHighlights, HighlightStore};
use crate::progress::{ProgressEvent, ProgressTracker};
use crate::settings::expand_settings;
use crate::ProtocolError;

const JSONRPC_INVALID_PARAMS: i64 = -32602;
const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Session lifecycle. Abrupt socket errors jump straight to `Disposing`
/// from wherever the session happens to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Initializing,
    Ready,
    Disposing,
}

/// Callbacks the host editor plugs into the session.
///
/// A plain struct of capabilities rather than something to subclass: each
/// editor adapter fills in the fields it cares about and leaves the rest at
/// the no-op defaults.
pub struct ClientHooks {
    /// `sts/moveCursor`: place the cursor in the matching editor and report
    /// whether that was possible.
    pub move_cursor: Box<dyn Fn(MoveCursorParams) -> MoveCursorResponse + Send + Sync>,
    /// `sts/progress`, after folding into the per-id tracker.
    pub progress: Box<dyn Fn(ProgressEvent) + Send + Sync>,
    /// `sts/highlight`, only for notifications that survived version gating.
    pub highlight: Box<dyn Fn(HighlightParams) + Send + Sync>,
    /// The classpath-listener registry changed; the slice holds the callback
    /// command ids currently registered.
    pub classpath_listeners_changed: Box<dyn Fn(&[String]) + Send + Sync>,
    /// The session is gone (server exit, socket error, or local shutdown).
    /// Fired exactly once.
    pub disconnected: Box<dyn Fn() + Send + Sync>,
}

impl Default for ClientHooks {
    fn default() -> Self {
        Self {
            move_cursor: Box::new(|_| MoveCursorResponse { applied: false }),
            progress: Box::new(|_| {}),
            highlight: Box::new(|_| {}),
            classpath_listeners_changed: Box::new(|_| {}),
            disconnected: Box::new(|| {}),
        }
    }
}

/// Transport-level handshake inputs.
pub struct SessionConfig {
    /// Params for the standard `initialize` request, passed through
    /// verbatim. Capability contents are the editor layer's business.
    pub initialize_params: Value,
    /// Flat (dot-qualified) editor settings to push right after
    /// `initialized`, completing the handshake the server expects.
    pub initial_settings: Option<Value>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initialize_params: json!({}),
            initial_settings: None,
        }
    }
}

/// One running language-server session.
pub struct Session {
    inner: Arc<SessionInner>,
    reader_task: JoinHandle<()>,
    writer_task: Option<JoinHandle<()>>,
    process_task: Option<JoinHandle<()>>,
}

struct SessionInner {
    state: Mutex<SessionState>,
    /// Taken (dropped) on dispose, which lets the writer task drain its
    /// queue and exit instead of being cut off mid-flush.
    outgoing: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Result<Value, ProtocolError>>>>,
    next_request_id: AtomicI64,
    highlights: Mutex<HighlightStore>,
    progress: Mutex<ProgressTracker>,
    classpath_listeners: Mutex<Vec<String>>,
    hooks: ClientHooks,
    /// Tells the process task to kill the child. `notify_one` stores a
    /// permit, so a signal sent before the task starts waiting is not lost.
    kill_child: Notify,
    disposed: AtomicBool,
}

impl Session {
    /// Wrap a launched (or attached) server in a protocol session.
    ///
    /// Performs the transport-level handshake (`initialize` request,
    /// `initialized` notification, initial configuration push) and returns
    /// once the session is `Ready`.
    pub async fn start(
        server: LaunchedServer,
        hooks: ClientHooks,
        config: SessionConfig,
    ) -> Result<Self, ProtocolError> {
        let (process, stream) = server.into_parts();
        let (read_half, write_half) = stream.into_split();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(SessionInner {
            state: Mutex::new(SessionState::Connecting),
            outgoing: Mutex::new(Some(outgoing)),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicI64::new(1),
            highlights: Mutex::new(HighlightStore::new()),
            progress: Mutex::new(ProgressTracker::new()),
            classpath_listeners: Mutex::new(Vec::new()),
            hooks,
            kill_child: Notify::new(),
            disposed: AtomicBool::new(false),
        });

        // All outgoing traffic funnels through this one task, which is what
        // keeps notification order identical to send order.
        let writer_task = tokio::spawn({
            let inner = Arc::clone(&inner);
            let mut outgoing_rx = outgoing_rx;
            async move {
                let mut writer = FrameWriter::new(write_half);
                while let Some(message) = outgoing_rx.recv().await {
                    if let Err(err) = writer.write(&message).await {
                        warn!(%err, "failed writing to language server socket");
                        break;
                    }
                }
                inner.dispose("write side closed");
            }
        });

        let reader_task = tokio::spawn({
            let inner = Arc::clone(&inner);
            async move {
                let mut reader = FrameReader::new(read_half);
                loop {
                    match reader.read().await {
                        Ok(Some(message)) => inner.dispatch(message),
                        Ok(None) => {
                            debug!("language server closed the connection");
                            break;
                        }
                        Err(err) => {
                            warn!(%err, "language server socket error");
                            break;
                        }
                    }
                }
                inner.dispose("read side closed");
            }
        });

        let process_task = match process {
            ServerProcess::External => None,
            mut process => Some(tokio::spawn({
                let inner = Arc::clone(&inner);
                async move {
                    tokio::select! {
                        status = process.wait() => {
                            match status {
                                Ok(Some(status)) => debug!(%status, "language server process exited"),
                                Ok(None) => {}
                                Err(err) => warn!(%err, "failed waiting on language server process"),
                            }
                            inner.dispose("process exit");
                        }
                        _ = inner.kill_child.notified() => {
                            if let Err(err) = process.kill().await {
                                warn!(%err, "failed to kill language server process");
                            }
                        }
                    }
                }
            })),
        };

        inner.set_state(SessionState::Initializing);
        let handshake = async {
            inner
                .request(methods::INITIALIZE, config.initialize_params)
                .await?;
            inner.notify(methods::INITIALIZED, json!({}))?;
            if let Some(settings) = &config.initial_settings {
                inner.notify(
                    methods::DID_CHANGE_CONFIGURATION,
                    json!({ "settings": expand_settings(settings) }),
                )?;
            }
            Ok::<_, ProtocolError>(())
        };

        match handshake.await {
            Ok(()) => {
                inner.set_state(SessionState::Ready);
                debug!("language server session ready");
                Ok(Self {
                    inner,
                    reader_task,
                    writer_task: Some(writer_task),
                    process_task,
                })
            }
            Err(err) => {
                inner.dispose("initialize handshake failed");
                reader_task.abort();
                writer_task.abort();
                if let Some(task) = process_task {
                    task.abort();
                }
                Err(err)
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Send an arbitrary request and await its response. Standard LSP
    /// traffic from the editor layer flows through here.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ProtocolError> {
        self.inner.request(method, params).await
    }

    pub fn notify(&self, method: &str, params: Value) -> Result<(), ProtocolError> {
        self.inner.notify(method, params)
    }

    /// Push changed preferences to the server.
    ///
    /// `settings` is the editor's flat dot-qualified map; it is expanded to
    /// the nested tree the server expects. Calls are delivered in call
    /// order.
    pub fn update_settings(&self, settings: &Value) -> Result<(), ProtocolError> {
        self.inner.notify(
            methods::DID_CHANGE_CONFIGURATION,
            json!({ "settings": expand_settings(settings) }),
        )
    }

    /// Highlight set currently held for a document, if any.
    pub fn highlights(&self, uri: &lsp_types::Uri) -> Option<DocumentHighlights> {
        self.inner.highlights.lock().get(uri).cloned()
    }

    /// Status message currently shown for a progress id, if any.
    pub fn progress_status(&self, id: &str) -> Option<String> {
        self.inner.progress.lock().status(id).map(str::to_string)
    }

    /// Callback command ids with a registered classpath listener.
    pub fn classpath_listeners(&self) -> Vec<String> {
        self.inner.classpath_listeners.lock().clone()
    }

    /// Orderly teardown: best-effort LSP farewell, then release the socket
    /// and terminate the child process (a no-op for attached sessions).
    pub async fn shutdown(mut self) {
        if self.inner.state() == SessionState::Ready {
            match tokio::time::timeout(
                SHUTDOWN_GRACE,
                self.inner.request(methods::SHUTDOWN, Value::Null),
            )
            .await
            {
                Ok(Ok(_)) => {
                    let _ = self.inner.notify(methods::EXIT, Value::Null);
                }
                Ok(Err(err)) => debug!(%err, "shutdown request failed"),
                Err(_) => debug!("shutdown request timed out"),
            }
        }
        self.inner.dispose("client shutdown");

        // Dispose dropped the sender; wait for the writer to drain so the
        // farewell actually reaches the wire before the socket goes away.
        if let Some(writer_task) = self.writer_task.take() {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer_task).await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.dispose("session dropped");
        self.reader_task.abort();
        if let Some(task) = &self.writer_task {
            task.abort();
        }
        if let Some(task) = &self.process_task {
            // Aborting drops the Child, which was spawned kill_on_drop.
            task.abort();
        }
    }
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    /// Tear the session down. Idempotent; every exit path funnels through
    /// here so the disconnect hook fires exactly once.
    fn dispose(&self, reason: &str) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(reason, "language server session disposing");
        self.set_state(SessionState::Disposing);

        self.kill_child.notify_one();
        // Dropping the sender lets the writer drain and exit; dropping the
        // pending senders lets every in-flight request observe
        // RequestAbandoned instead of hanging.
        self.outgoing.lock().take();
        self.pending.lock().clear();

        (self.hooks.disconnected)();
        self.set_state(SessionState::Disconnected);
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ProtocolError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().insert(id, sender);

        let message = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        if self.send_message(message).is_err() {
            self.pending.lock().remove(&id);
            return Err(ProtocolError::Disconnected);
        }

        receiver
            .await
            .map_err(|_| ProtocolError::RequestAbandoned)?
    }

    fn notify(&self, method: &str, params: Value) -> Result<(), ProtocolError> {
        self.send_message(json!({ "jsonrpc": "2.0", "method": method, "params": params }))
    }

    fn send_message(&self, message: Value) -> Result<(), ProtocolError> {
        match self.outgoing.lock().as_ref() {
            Some(sender) => sender.send(message).map_err(|_| ProtocolError::Disconnected),
            None => Err(ProtocolError::Disconnected),
        }
    }

    fn dispatch(&self, message: Value) {
        let Value::Object(message) = message else {
            warn!("dropping non-object JSON-RPC message");
            return;
        };

        let id = message.get("id").cloned();
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match (id, method) {
            (Some(id), Some(method)) => self.handle_server_request(id, &method, params),
            (None, Some(method)) => self.handle_notification(&method, params),
            (Some(id), None) => self.handle_response(id, &message),
            (None, None) => warn!("dropping JSON-RPC message with neither id nor method"),
        }
    }

    fn handle_response(&self, id: Value, message: &serde_json::Map<String, Value>) {
        let Some(id) = id.as_i64() else {
            warn!(?id, "dropping response with a non-numeric id");
            return;
        };
        let Some(sender) = self.pending.lock().remove(&id) else {
            debug!(id, "response for an unknown or abandoned request");
            return;
        };

        // Some servers send an explicit `"error": null` next to the result.
        let result = match message.get("error").filter(|error| !error.is_null()) {
            Some(error) => Err(ProtocolError::ResponseError {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32603),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = sender.send(result);
    }

    fn handle_server_request(&self, id: Value, method: &str, params: Value) {
        match method {
            methods::MOVE_CURSOR => match serde_json::from_value::<MoveCursorParams>(params) {
                Ok(params) => {
                    let response = (self.hooks.move_cursor)(params);
                    let result =
                        serde_json::to_value(response).unwrap_or(Value::Null);
                    self.respond(id, result);
                }
                Err(err) => self.respond_error(
                    id,
                    JSONRPC_INVALID_PARAMS,
                    format!("invalid sts/moveCursor params: {err}"),
                ),
            },
            methods::ADD_CLASSPATH_LISTENER => {
                self.update_classpath_listeners(id, params, true)
            }
            methods::REMOVE_CLASSPATH_LISTENER => {
                self.update_classpath_listeners(id, params, false)
            }
            other => {
                // Unknown traffic after Ready is logged and answered, never
                // fatal to the session.
                warn!(method = other, "unhandled server request");
                self.respond_error(
                    id,
                    JSONRPC_METHOD_NOT_FOUND,
                    format!("unknown method `{other}`"),
                );
            }
        }
    }

    fn update_classpath_listeners(&self, id: Value, params: Value, add: bool) {
        let params = match serde_json::from_value::<ClasspathListenerParams>(params) {
            Ok(params) => params,
            Err(err) => {
                self.respond_error(
                    id,
                    JSONRPC_INVALID_PARAMS,
                    format!("invalid classpath listener params: {err}"),
                );
                return;
            }
        };

        let snapshot = {
            let mut listeners = self.classpath_listeners.lock();
            if add {
                if !listeners.contains(&params.callback_command_id) {
                    listeners.push(params.callback_command_id.clone());
                }
            } else {
                listeners.retain(|listener| listener != &params.callback_command_id);
            }
            listeners.clone()
        };

        debug!(
            callback = %params.callback_command_id,
            add,
            "classpath listener registry changed"
        );
        (self.hooks.classpath_listeners_changed)(&snapshot);
        self.respond(id, Value::Null);
    }

    fn handle_notification(&self, method: &str, params: Value) {
        match method {
            methods::PROGRESS => match serde_json::from_value::<ProgressParams>(params) {
                Ok(params) => {
                    let event = self.progress.lock().apply(&params);
                    (self.hooks.progress)(event);
                }
                Err(err) => warn!(%err, "dropping malformed sts/progress notification"),
            },
            methods::HIGHLIGHT => match serde_json::from_value::<HighlightParams>(params) {
                Ok(params) => {
                    // Version gate and replacement happen inside one lock
                    // acquisition; see HighlightStore::apply.
                    let fresh = self.highlights.lock().apply(&params);
                    if fresh {
                        (self.hooks.highlight)(params);
                    }
                }
                Err(err) => warn!(%err, "dropping malformed sts/highlight notification"),
            },
            other => debug!(method = other, "ignoring unhandled notification"),
        }
    }

    fn respond(&self, id: Value, result: Value) {
        self.send_raw(json!({ "jsonrpc": "2.0", "id": id, "result": result }));
    }

    fn respond_error(&self, id: Value, code: i64, message: String) {
        self.send_raw(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message }
        }));
    }

    fn send_raw(&self, message: Value) {
        if self.send_message(message).is_err() {
            debug!("writer task is gone, dropping outgoing message");
        }
    }
}
