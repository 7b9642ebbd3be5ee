//! Status-bar progress messages received via `sts/progress`.

use std::collections::HashMap;

use crate::ext::ProgressParams;

/// What a progress notification did, for the host's status-bar hook.
///
/// `status: None` means "clear whatever is shown for this id".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub id: String,
    pub status: Option<String>,
}

/// Current status message per progress id.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    messages: HashMap<String, String>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one notification in. An absent or empty `statusMsg` clears the
    /// id's entry.
    pub fn apply(&mut self, params: &ProgressParams) -> ProgressEvent {
        let status = params
            .status_msg
            .as_deref()
            .filter(|message| !message.is_empty());

        match status {
            Some(message) => {
                self.messages
                    .insert(params.id.clone(), message.to_string());
                ProgressEvent {
                    id: params.id.clone(),
                    status: Some(message.to_string()),
                }
            }
            None => {
                self.messages.remove(&params.id);
                ProgressEvent {
                    id: params.id.clone(),
                    status: None,
                }
            }
        }
    }

    pub fn status(&self, id: &str) -> Option<&str> {
        self.messages.get(id).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
