//! Task and user records.
//!
//! Every list the client renders is ordered by [`compare`]: due date
//! ascending, tasks without a due date last, ties broken by id.
//!
//! Records come from two places with slightly different shapes: the bulk
//! fetch joins the assignee (`assigned_to: {id, email}`), realtime payloads
//! carry the raw column (`assigned_to: "<id>"`). Both deserialize into the
//! same [`Task`].

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

const DEFAULT_USER_INITIAL: char = 'U';
const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
const OFFSET_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%#z";

/// Ids arrive as JSON strings or integers depending on the backend column.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(serde_json::Number),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(value) => value.trim().to_string(),
            RawId::Number(value) => value.to_string(),
        }
    }
}

/// Backend-assigned task identity. Opaque and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Parse a user-supplied id, rejecting blanks.
    pub fn parse(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidArgument("task id cannot be empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Mint a fresh id on the client. The backend stores it as given, so
    /// the optimistic record and the server's echo share one identity.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl Ord for TaskId {
    /// Numeric ids compare as numbers and sort before anything else;
    /// the rest compare lexicographically.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(left), Some(right)) => left.cmp(&right).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = RawId::deserialize(deserializer)?.into_string();
        if value.is_empty() {
            return Err(serde::de::Error::custom("task id cannot be empty"));
        }
        Ok(Self(value))
    }
}

/// Identity of a user in the external directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for UserId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = RawId::deserialize(deserializer)?.into_string();
        if value.is_empty() {
            return Err(serde::de::Error::custom("user id cannot be empty"));
        }
        Ok(Self(value))
    }
}

/// A task's reference to its assignee.
///
/// `email` is only known when the record was joined against the user
/// directory; realtime payloads carry the bare id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRef {
    pub id: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl UserRef {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }

    pub fn with_email(id: impl Into<UserId>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: Some(email.into()),
        }
    }
}

impl From<UserId> for UserRef {
    fn from(id: UserId) -> Self {
        Self { id, email: None }
    }
}

impl<'de> Deserialize<'de> for UserRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Joined {
                id: UserId,
                #[serde(default)]
                email: Option<String>,
            },
            Bare(UserId),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Joined { id, email } => UserRef {
                id,
                email: email.filter(|value| !value.trim().is_empty()),
            },
            Repr::Bare(id) => UserRef::from(id),
        })
    }
}

/// A user as listed by the directory, used for assignment pickers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
}

impl User {
    pub fn new(id: impl Into<UserId>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
        }
    }

    /// Avatar initial: first letter of the email, upper-cased.
    pub fn initial(&self) -> char {
        self.email
            .trim()
            .chars()
            .next()
            .map(|ch| ch.to_uppercase().next().unwrap_or(ch))
            .unwrap_or(DEFAULT_USER_INITIAL)
    }

    pub fn reference(&self) -> UserRef {
        UserRef::with_email(self.id.clone(), self.email.clone())
    }
}

/// Order users for pickers: email (case-insensitive), then id.
pub fn sort_users(users: &mut [User]) {
    users.sort_by(|left, right| {
        left.email
            .to_lowercase()
            .cmp(&right.email.to_lowercase())
            .then_with(|| left.id.cmp(&right.id))
    });
}

/// A single todo item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, with = "due_date_format", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub is_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<UserRef>,
}

impl Task {
    /// Build a task with defaults, rejecting an empty title.
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>) -> Result<Self> {
        let mut task = Self {
            id: id.into(),
            title: title.into(),
            description: None,
            due_date: None,
            is_completed: false,
            assigned_to: None,
        };
        task.validate()?;
        Ok(task)
    }

    /// Parse a backend record and validate it.
    pub fn from_record(record: serde_json::Value) -> Result<Self> {
        let mut task: Task = serde_json::from_value(record)
            .map_err(|err| Error::InvalidTask(err.to_string()))?;
        task.validate()?;
        Ok(task)
    }

    /// Enforce a non-empty title and normalize optional text.
    pub fn validate(&mut self) -> Result<()> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(Error::InvalidTask(format!(
                "title cannot be empty (task {})",
                self.id
            )));
        }
        if title.len() != self.title.len() {
            self.title = title.to_string();
        }
        self.description = normalize_description(self.description.take());
        Ok(())
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = normalize_description(Some(description.into()));
        self
    }

    pub fn with_due_date(mut self, due_date: NaiveDate) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_assignee(mut self, assignee: impl Into<UserRef>) -> Self {
        self.assigned_to = Some(assignee.into());
        self
    }

    pub fn with_completed(mut self, is_completed: bool) -> Self {
        self.is_completed = is_completed;
        self
    }

    pub fn assignee_id(&self) -> Option<&UserId> {
        self.assigned_to.as_ref().map(|assignee| &assignee.id)
    }

    pub fn is_assigned_to(&self, user: &UserId) -> bool {
        self.assignee_id() == Some(user)
    }

    pub fn is_due_on(&self, day: NaiveDate) -> bool {
        self.due_date == Some(day)
    }

    /// Due strictly before `today` and still open.
    pub fn is_past_due(&self, today: NaiveDate) -> bool {
        !self.is_completed && self.due_date.map(|due| due < today).unwrap_or(false)
    }

    pub(crate) fn sort_key(&self) -> SortKey {
        SortKey {
            due: Due::from(self.due_date),
            id: self.id.clone(),
        }
    }
}

fn normalize_description(description: Option<String>) -> Option<String> {
    description.and_then(|value| {
        if value.trim().is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// Due-date position in the list order. Variant order matters: scheduled
/// tasks come first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Due {
    Date(NaiveDate),
    Unscheduled,
}

impl From<Option<NaiveDate>> for Due {
    fn from(value: Option<NaiveDate>) -> Self {
        value.map(Due::Date).unwrap_or(Due::Unscheduled)
    }
}

/// Position of a task in the ordered store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SortKey {
    pub(crate) due: Due,
    pub(crate) id: TaskId,
}

/// List order: due date ascending, no due date last, then id.
pub fn compare(left: &Task, right: &Task) -> Ordering {
    Due::from(left.due_date)
        .cmp(&Due::from(right.due_date))
        .then_with(|| left.id.cmp(&right.id))
}

pub fn sort_tasks(tasks: &mut [Task]) {
    tasks.sort_by(compare);
}

/// Normalize a due date into a calendar date.
///
/// Accepts `YYYY-MM-DD`, RFC 3339 timestamps, Postgres-style
/// `YYYY-MM-DD HH:MM:SS+00` and naive timestamps. Timestamps keep the date
/// as written; no timezone conversion happens.
pub fn parse_due_date(raw: &str) -> Result<Option<NaiveDate>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(Some(date));
    }
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(Some(timestamp.date_naive()));
    }
    if let Ok(timestamp) = DateTime::parse_from_str(trimmed, OFFSET_TIMESTAMP_FORMAT) {
        return Ok(Some(timestamp.date_naive()));
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(timestamp) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Some(timestamp.date()));
        }
    }
    Err(Error::InvalidTask(format!("invalid due date '{trimmed}'")))
}

mod due_date_format {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDate>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(date) => serializer.serialize_str(&date.format("%Y-%m-%d").to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveDate>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => super::parse_due_date(&raw).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Fields for a create call. The id is minted when the draft is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDraft {
    pub id: TaskId,
    pub title: String,
    pub description: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub assigned_to: Option<UserId>,
}

impl TaskDraft {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: TaskId::generate(),
            title: title.into(),
            description: None,
            due_date: None,
            assigned_to: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn due_date(mut self, due_date: NaiveDate) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn assigned_to(mut self, user: impl Into<UserId>) -> Self {
        self.assigned_to = Some(user.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::InvalidTask("title cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Materialize the draft under its own id.
    pub fn to_task(&self) -> Result<Task> {
        let mut task = Task {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            due_date: self.due_date,
            is_completed: false,
            assigned_to: self.assigned_to.clone().map(UserRef::from),
        };
        task.validate()?;
        Ok(task)
    }
}

/// Partial fields for an update call.
///
/// Outer `None` leaves a field alone; for nullable fields `Some(None)` clears.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub due_date: Option<Option<NaiveDate>>,
    pub is_completed: Option<bool>,
    pub assigned_to: Option<Option<UserId>>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: Option<String>) -> Self {
        self.description = Some(description);
        self
    }

    pub fn due_date(mut self, due_date: Option<NaiveDate>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn completed(mut self, is_completed: bool) -> Self {
        self.is_completed = Some(is_completed);
        self
    }

    pub fn assigned_to(mut self, user: Option<UserId>) -> Self {
        self.assigned_to = Some(user);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.due_date.is_none()
            && self.is_completed.is_none()
            && self.assigned_to.is_none()
    }

    /// Apply onto `task`. On error `task` is left untouched.
    pub fn apply_to(&self, task: &mut Task) -> Result<()> {
        let mut next = task.clone();
        if let Some(title) = &self.title {
            next.title = title.clone();
        }
        if let Some(description) = &self.description {
            next.description = description.clone();
        }
        if let Some(due_date) = self.due_date {
            next.due_date = due_date;
        }
        if let Some(is_completed) = self.is_completed {
            next.is_completed = is_completed;
        }
        if let Some(assignee) = &self.assigned_to {
            next.assigned_to = match (assignee, task.assigned_to.as_ref()) {
                (Some(id), Some(current)) if &current.id == id => Some(current.clone()),
                (Some(id), _) => Some(UserRef::from(id.clone())),
                (None, _) => None,
            };
        }
        next.validate()?;
        *task = next;
        Ok(())
    }
}
