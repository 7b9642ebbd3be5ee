//! Wire contract of the protocol extensions layered over standard LSP.

use lsp_types::{CodeLens, Position, VersionedTextDocumentIdentifier};
use serde::{Deserialize, Serialize};

/// JSON-RPC method names. These are part of the wire contract shared with
/// the Java server; do not rename.
pub mod methods {
    /// Server → client request: move the text cursor in the active editor.
    pub const MOVE_CURSOR: &str = "sts/moveCursor";
    /// Server → client notification: transient status message keyed by id.
    pub const PROGRESS: &str = "sts/progress";
    /// Server → client notification: replace a document's highlight set.
    pub const HIGHLIGHT: &str = "sts/highlight";
    /// Server → client request: start forwarding classpath changes to a
    /// named callback command.
    pub const ADD_CLASSPATH_LISTENER: &str = "sts/addClasspathListener";
    /// Server → client request: stop forwarding classpath changes.
    pub const REMOVE_CLASSPATH_LISTENER: &str = "sts/removeClasspathListener";
    /// Client → server notification: nested configuration push.
    pub const DID_CHANGE_CONFIGURATION: &str = "workspace/didChangeConfiguration";

    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "initialized";
    pub const SHUTDOWN: &str = "shutdown";
    pub const EXIT: &str = "exit";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveCursorParams {
    pub uri: lsp_types::Uri,
    pub position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveCursorResponse {
    pub applied: bool,
}

/// An absent or empty `status_msg` clears whatever is currently shown for
/// `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_msg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighlightParams {
    pub doc: VersionedTextDocumentIdentifier,
    pub code_lenses: Vec<CodeLens>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClasspathListenerParams {
    pub callback_command_id: String,
}
