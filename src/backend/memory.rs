//! In-process backend.
//!
//! Behaves like the hosted table: fetches join the assignee's email,
//! mutations publish realtime-shaped notifications to every open feed
//! connection (bare assignee id, `old` carrying only the key). Faults can
//! be injected to exercise error and reconnect paths.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{ChangeFeed, FeedConnection, TaskBackend, TaskFilter, UserDirectory};
use crate::error::{Error, MutationKind, Result};
use crate::events::RawNotification;
use crate::task::{Task, TaskDraft, TaskId, TaskPatch, User, UserRef};

#[derive(Default)]
struct Faults {
    fetch: Option<String>,
    mutation: Option<String>,
    directory: Option<String>,
    connects: usize,
    dropped_connections: usize,
    fetch_delay: Option<Duration>,
}

#[derive(Default)]
struct State {
    tasks: BTreeMap<TaskId, Task>,
    users: Vec<User>,
    feeds: Vec<mpsc::UnboundedSender<RawNotification>>,
    faults: Faults,
}

impl State {
    /// Attach the directory email, as the hosted fetch does.
    fn joined(&self, task: &Task) -> Task {
        let mut joined = task.clone();
        if let Some(assignee) = joined.assigned_to.as_mut() {
            assignee.email = self
                .users
                .iter()
                .find(|user| user.id == assignee.id)
                .map(|user| user.email.clone());
        }
        joined
    }

    fn publish(&mut self, notification: RawNotification) {
        self.feeds
            .retain(|feed| feed.send(notification.clone()).is_ok());
        debug!(kind = %notification.kind, feeds = self.feeds.len(), "published notification");
    }

    fn take_mutation_fault(&mut self, op: MutationKind) -> Result<()> {
        match self.faults.mutation.take() {
            Some(message) => Err(Error::MutationFailed { op, message }),
            None => Ok(()),
        }
    }
}

/// Row as the change feed carries it: assignee as a bare id.
fn raw_record(task: &Task) -> Value {
    json!({
        "id": task.id,
        "title": task.title,
        "description": task.description,
        "due_date": task.due_date.map(|date| date.format("%Y-%m-%d").to_string()),
        "is_completed": task.is_completed,
        "assigned_to": task.assignee_id(),
        "updated_at": Utc::now().to_rfc3339(),
    })
}

fn stripped(mut task: Task) -> Task {
    if let Some(assignee) = task.assigned_to.take() {
        task.assigned_to = Some(UserRef::from(assignee.id));
    }
    task
}

pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_users(mut self, users: Vec<User>) -> Self {
        self.state.get_mut().users = users;
        self
    }

    pub fn with_tasks(mut self, tasks: Vec<Task>) -> Self {
        let state = self.state.get_mut();
        for task in tasks {
            state.tasks.insert(task.id.clone(), stripped(task));
        }
        self
    }

    /// Current table contents, joined.
    pub async fn tasks(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        state.tasks.values().map(|task| state.joined(task)).collect()
    }

    pub async fn fail_next_fetch(&self, message: impl Into<String>) {
        self.state.lock().await.faults.fetch = Some(message.into());
    }

    pub async fn fail_next_mutation(&self, message: impl Into<String>) {
        self.state.lock().await.faults.mutation = Some(message.into());
    }

    pub async fn fail_next_directory(&self, message: impl Into<String>) {
        self.state.lock().await.faults.directory = Some(message.into());
    }

    /// Refuse the next `count` connection attempts.
    pub async fn fail_next_connects(&self, count: usize) {
        self.state.lock().await.faults.connects = count;
    }

    /// Accept the next `count` connections but close them at once.
    pub async fn drop_next_connections(&self, count: usize) {
        self.state.lock().await.faults.dropped_connections = count;
    }

    /// Delay every subsequent fetch.
    pub async fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.faults.fetch_delay = delay;
    }

    /// Drop every open feed connection, as a transport loss would.
    pub async fn disconnect_all(&self) {
        let mut state = self.state.lock().await;
        debug!(feeds = state.feeds.len(), "dropping feed connections");
        state.feeds.clear();
    }

    pub async fn connection_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.feeds.retain(|feed| !feed.is_closed());
        state.feeds.len()
    }

    /// Write a row without notifying anyone, like a change whose
    /// notification was lost in transit.
    pub async fn insert_unpublished(&self, task: Task) {
        let mut state = self.state.lock().await;
        state.tasks.insert(task.id.clone(), stripped(task));
    }

    /// Push an arbitrary notification to every open connection.
    pub async fn publish_raw(&self, notification: RawNotification) {
        self.state.lock().await.publish(notification);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskBackend for MemoryBackend {
    async fn fetch_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let delay = {
            let mut state = self.state.lock().await;
            if let Some(message) = state.faults.fetch.take() {
                return Err(Error::FetchFailed(message));
            }
            state.faults.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|task| filter.matches(task))
            .map(|task| state.joined(task))
            .collect())
    }

    async fn create_task(&self, draft: &TaskDraft) -> Result<Task> {
        let mut state = self.state.lock().await;
        state.take_mutation_fault(MutationKind::Create)?;

        if state.tasks.contains_key(&draft.id) {
            return Err(Error::MutationFailed {
                op: MutationKind::Create,
                message: format!("task id {} already exists", draft.id),
            });
        }
        let task = draft.to_task().map_err(|err| Error::MutationFailed {
            op: MutationKind::Create,
            message: err.to_string(),
        })?;
        state.tasks.insert(task.id.clone(), task.clone());
        state.publish(RawNotification::insert(raw_record(&task)));
        Ok(state.joined(&task))
    }

    async fn update_task(&self, id: &TaskId, patch: &TaskPatch) -> Result<Task> {
        let mut state = self.state.lock().await;
        state.take_mutation_fault(MutationKind::Update)?;

        let mut task = state
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| Error::MutationFailed {
                op: MutationKind::Update,
                message: format!("no task with id {id}"),
            })?;
        patch
            .apply_to(&mut task)
            .map_err(|err| Error::MutationFailed {
                op: MutationKind::Update,
                message: err.to_string(),
            })?;
        let task = stripped(task);
        state.tasks.insert(id.clone(), task.clone());
        state.publish(RawNotification::update(
            raw_record(&task),
            Some(json!({ "id": id })),
        ));
        Ok(state.joined(&task))
    }

    async fn delete_task(&self, id: &TaskId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.take_mutation_fault(MutationKind::Delete)?;

        if state.tasks.remove(id).is_none() {
            return Err(Error::MutationFailed {
                op: MutationKind::Delete,
                message: format!("no task with id {id}"),
            });
        }
        state.publish(RawNotification::delete(json!({ "id": id })));
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for MemoryBackend {
    async fn fetch_users(&self) -> Result<Vec<User>> {
        let mut state = self.state.lock().await;
        if let Some(message) = state.faults.directory.take() {
            return Err(Error::FetchFailed(message));
        }
        Ok(state.users.clone())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn connect(&self) -> Result<FeedConnection> {
        let mut state = self.state.lock().await;
        if state.faults.connects > 0 {
            state.faults.connects -= 1;
            return Err(Error::FeedFailed("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if state.faults.dropped_connections > 0 {
            state.faults.dropped_connections -= 1;
            debug!("feed connected and dropped");
            return Ok(FeedConnection::new(rx));
        }
        state.feeds.push(tx);
        debug!(feeds = state.feeds.len(), "feed connected");
        Ok(FeedConnection::new(rx))
    }
}
