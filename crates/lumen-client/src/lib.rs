//! LSP protocol session for Lumen.
//!
//! Wraps the socket handed over by `lumen-launch` in a Content-Length framed
//! JSON-RPC connection, runs the transport-level `initialize`/`initialized`
//! handshake, and dispatches the custom extension methods
//! (`sts/moveCursor`, `sts/progress`, `sts/highlight`, classpath listeners)
//! to hooks supplied by the host editor.
//!
//! The standard LSP surface (document sync, capability negotiation) is the
//! server's and the editor's business; this crate only moves their messages.

mod codec;
pub mod ext;
mod highlight;
mod progress;
mod session;
pub mod settings;

use thiserror::Error;

pub use codec::{FrameReader, FrameWriter};
pub use highlight::{DocumentHighlights, HighlightStore};
pub use progress::{ProgressEvent, ProgressTracker};
pub use session::{ClientHooks, Session, SessionConfig, SessionState};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("session is disconnected")]
    Disconnected,

    #[error("server replied with error {code}: {message}")]
    ResponseError { code: i64, message: String },

    #[error("request was dropped by connection teardown")]
    RequestAbandoned,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
