//! Backend ports.
//!
//! The engine never talks to a global client: a view session is handed
//! the three capabilities it needs (bulk fetch plus mutation RPCs, the user
//! directory, and the change feed) as trait objects.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::events::RawNotification;
use crate::store::Scope;
use crate::task::{Task, TaskDraft, TaskId, TaskPatch, User, UserId};

pub use memory::MemoryBackend;

/// Server-side filter for the bulk fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub assignee: Option<UserId>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn assigned_to(user: UserId) -> Self {
        Self {
            assignee: Some(user),
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        match &self.assignee {
            Some(user) => task.is_assigned_to(user),
            None => true,
        }
    }
}

impl From<&Scope> for TaskFilter {
    fn from(scope: &Scope) -> Self {
        match scope {
            Scope::All => TaskFilter::all(),
            Scope::Assignee(user) => TaskFilter::assigned_to(user.clone()),
        }
    }
}

/// Bulk fetch and mutation RPCs.
///
/// Fetch results are unordered. Mutations return the authoritative
/// post-write record.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    async fn fetch_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    async fn create_task(&self, draft: &TaskDraft) -> Result<Task>;

    async fn update_task(&self, id: &TaskId, patch: &TaskPatch) -> Result<Task>;

    async fn delete_task(&self, id: &TaskId) -> Result<()>;
}

/// The external user directory.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn fetch_users(&self) -> Result<Vec<User>>;
}

/// Push channel for row-level change notifications.
///
/// Delivery is at-least-once and ordered per id only. A dropped connection
/// loses whatever was in flight; nothing is replayed on reconnect.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn connect(&self) -> Result<FeedConnection>;
}

/// One live feed connection.
#[derive(Debug)]
pub struct FeedConnection {
    rx: mpsc::UnboundedReceiver<RawNotification>,
}

impl FeedConnection {
    pub fn new(rx: mpsc::UnboundedReceiver<RawNotification>) -> Self {
        Self { rx }
    }

    /// Next notification, or `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<RawNotification> {
        self.rx.recv().await
    }
}

/// The capabilities a view session is mounted with.
#[derive(Clone)]
pub struct BackendHandles {
    pub tasks: Arc<dyn TaskBackend>,
    pub users: Arc<dyn UserDirectory>,
    pub feed: Arc<dyn ChangeFeed>,
}

impl BackendHandles {
    pub fn new(
        tasks: Arc<dyn TaskBackend>,
        users: Arc<dyn UserDirectory>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        Self { tasks, users, feed }
    }

    /// Use one object for all three capabilities.
    pub fn shared<B>(backend: Arc<B>) -> Self
    where
        B: TaskBackend + UserDirectory + ChangeFeed + 'static,
    {
        Self {
            tasks: backend.clone(),
            users: backend.clone(),
            feed: backend,
        }
    }
}

impl std::fmt::Debug for BackendHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandles").finish_non_exhaustive()
    }
}
