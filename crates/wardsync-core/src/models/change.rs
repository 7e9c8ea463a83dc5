//! Table change notifications

use serde::{Deserialize, Serialize};

/// Kind of write reported on the change channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One table-changed notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table: String,
    pub event: ChangeKind,
    pub old_id: Option<String>,
    pub new_id: Option<String>,
    pub changed_columns: Vec<String>,
}

impl ChangeEvent {
    /// Id of the row the event is about
    pub fn record_id(&self) -> Option<&str> {
        self.new_id.as_deref().or(self.old_id.as_deref())
    }
}
