//! Per-document highlight state received via `sts/highlight`.

use std::collections::HashMap;

use lsp_types::{CodeLens, Uri};
use tracing::trace;

use crate::ext::HighlightParams;

/// The highlight set last applied for one document version.
#[derive(Debug, Clone)]
pub struct DocumentHighlights {
    pub version: i32,
    pub code_lenses: Vec<CodeLens>,
}

/// Highlight sets keyed by document, with last-version-wins replacement.
///
/// Notifications race buffer edits: by the time a highlight set arrives the
/// buffer may already be at a newer version, and a slow notification for an
/// old version can be processed after a newer one. Rendering those would
/// flicker stale ranges, so the version check gates every application. The
/// check and the replace happen under one `&mut` borrow, so no other
/// application for the same document can interleave with them.
#[derive(Debug, Default)]
pub struct HighlightStore {
    documents: HashMap<Uri, DocumentHighlights>,
}

impl HighlightStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one notification. Returns `false` when it carries a version
    /// older than what is already held for the document, in which case
    /// nothing changes.
    ///
    /// Equal versions replace: a re-notification for the same buffer state
    /// is a refresh, not a stale echo.
    pub fn apply(&mut self, params: &HighlightParams) -> bool {
        if let Some(existing) = self.documents.get(&params.doc.uri) {
            if params.doc.version < existing.version {
                trace!(
                    uri = params.doc.uri.as_str(),
                    stale = params.doc.version,
                    current = existing.version,
                    "dropping superseded highlight set"
                );
                return false;
            }
        }

        self.documents.insert(
            params.doc.uri.clone(),
            DocumentHighlights {
                version: params.doc.version,
                code_lenses: params.code_lenses.clone(),
            },
        );
        true
    }

    pub fn get(&self, uri: &Uri) -> Option<&DocumentHighlights> {
        self.documents.get(uri)
    }

    /// Forget a document, e.g. when its editor closes.
    pub fn remove(&mut self, uri: &Uri) -> Option<DocumentHighlights> {
        self.documents.remove(uri)
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}
