//! Realtime change notifications.
//!
//! The backend pushes row-level notifications shaped like
//! `{"eventType": "UPDATE", "new": {...}, "old": {...}}`. Records may be
//! partial: `old` usually carries only the primary key, and `new` on an
//! update may omit columns that did not change. [`normalize`] turns these
//! into typed [`ChangeEvent`]s the store can apply. An update that does not
//! carry every column becomes [`ChangeEvent::Patched`], which the store
//! merges onto the record it already holds.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{Error, Result};
use crate::task::{Task, TaskId};

/// A notification exactly as the change feed delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawNotification {
    #[serde(alias = "eventType", alias = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
}

impl RawNotification {
    pub fn insert(new: Value) -> Self {
        Self {
            kind: "INSERT".to_string(),
            new: Some(new),
            old: None,
        }
    }

    pub fn update(new: Value, old: Option<Value>) -> Self {
        Self {
            kind: "UPDATE".to_string(),
            new: Some(new),
            old,
        }
    }

    pub fn delete(old: Value) -> Self {
        Self {
            kind: "DELETE".to_string(),
            new: None,
            old: Some(old),
        }
    }

    /// Parse one line of a recorded feed.
    pub fn from_json_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .map_err(|err| Error::MalformedEvent(format!("not a notification: {err}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotificationKind {
    Insert,
    Update,
    Delete,
}

impl NotificationKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "insert" => Some(NotificationKind::Insert),
            "update" => Some(NotificationKind::Update),
            "delete" => Some(NotificationKind::Delete),
            _ => None,
        }
    }
}

/// Columns a record must carry to stand on its own.
const TASK_COLUMNS: [&str; 5] = ["title", "description", "due_date", "is_completed", "assigned_to"];

/// An update that carried only some columns.
///
/// Keys absent from `fields` were not sent and must keep their stored
/// value; keys present with `null` clear the column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialTask {
    pub id: TaskId,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl PartialTask {
    pub fn has_field(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Overlay the carried columns onto `current`, validating the result.
    pub fn merge_onto(&self, current: &Task) -> Result<Task> {
        let mut record = match serde_json::to_value(current)? {
            Value::Object(record) => record,
            _ => Map::new(),
        };
        for (key, value) in &self.fields {
            record.insert(key.clone(), value.clone());
        }
        record.insert("id".to_string(), Value::String(self.id.to_string()));
        to_task(Value::Object(record))
    }
}

/// A normalized change to one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "record", rename_all = "snake_case")]
pub enum ChangeEvent {
    Created(Task),
    Updated(Task),
    Patched(PartialTask),
    Deleted(TaskId),
}

impl ChangeEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            ChangeEvent::Created(task) | ChangeEvent::Updated(task) => &task.id,
            ChangeEvent::Patched(partial) => &partial.id,
            ChangeEvent::Deleted(id) => id,
        }
    }

    /// The full record, when the event carried one.
    pub fn task(&self) -> Option<&Task> {
        match self {
            ChangeEvent::Created(task) | ChangeEvent::Updated(task) => Some(task),
            ChangeEvent::Patched(_) | ChangeEvent::Deleted(_) => None,
        }
    }

    pub fn task_mut(&mut self) -> Option<&mut Task> {
        match self {
            ChangeEvent::Created(task) | ChangeEvent::Updated(task) => Some(task),
            ChangeEvent::Patched(_) | ChangeEvent::Deleted(_) => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChangeEvent::Created(_) => "created",
            ChangeEvent::Updated(_) => "updated",
            ChangeEvent::Patched(_) => "patched",
            ChangeEvent::Deleted(_) => "deleted",
        }
    }
}

/// Convert a raw notification into a [`ChangeEvent`].
pub fn normalize(raw: &RawNotification) -> Result<ChangeEvent> {
    let kind = NotificationKind::parse(&raw.kind)
        .ok_or_else(|| Error::MalformedEvent(format!("unknown event kind '{}'", raw.kind)))?;

    match kind {
        NotificationKind::Insert => {
            let record = record_object(raw.new.as_ref())
                .ok_or_else(|| Error::MalformedEvent("insert without a new record".to_string()))?;
            if !has_id(record) {
                return Err(Error::MalformedEvent("insert record has no id".to_string()));
            }
            let task = to_task(Value::Object(record.clone()))?;
            Ok(ChangeEvent::Created(task))
        }
        NotificationKind::Update => {
            let mut merged = record_object(raw.new.as_ref()).cloned().unwrap_or_default();
            if let Some(old) = record_object(raw.old.as_ref()) {
                for (key, value) in old {
                    if key == "id" && !has_id(&merged) {
                        merged.insert(key.clone(), value.clone());
                    } else if !merged.contains_key(key) {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
            if !has_id(&merged) {
                return Err(Error::MalformedEvent("update without an id".to_string()));
            }
            if TASK_COLUMNS.iter().all(|column| merged.contains_key(*column)) {
                let task = to_task(Value::Object(merged))?;
                return Ok(ChangeEvent::Updated(task));
            }
            let id = merged.remove("id").unwrap_or(Value::Null);
            let id: TaskId = serde_json::from_value(id)
                .map_err(|err| Error::MalformedEvent(format!("update id rejected: {err}")))?;
            Ok(ChangeEvent::Patched(PartialTask { id, fields: merged }))
        }
        NotificationKind::Delete => {
            let id = record_object(raw.old.as_ref())
                .and_then(|old| old.get("id"))
                .filter(|id| !id.is_null())
                .ok_or_else(|| Error::MalformedEvent("delete without an old id".to_string()))?;
            let id: TaskId = serde_json::from_value(id.clone())
                .map_err(|err| Error::MalformedEvent(format!("delete id rejected: {err}")))?;
            Ok(ChangeEvent::Deleted(id))
        }
    }
}

/// Like [`normalize`], but logs and drops anything malformed.
pub fn normalize_or_drop(raw: &RawNotification) -> Option<ChangeEvent> {
    match normalize(raw) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(kind = %raw.kind, error = %err, "dropping change notification");
            None
        }
    }
}

/// Object records only; `{}` counts as absent (the feed sends it in place
/// of the unused side).
fn record_object(value: Option<&Value>) -> Option<&Map<String, Value>> {
    value
        .and_then(Value::as_object)
        .filter(|record| !record.is_empty())
}

fn has_id(record: &Map<String, Value>) -> bool {
    record.get("id").map(|id| !id.is_null()).unwrap_or(false)
}

fn to_task(record: Value) -> Result<Task> {
    Task::from_record(record).map_err(|err| Error::MalformedEvent(err.to_string()))
}
