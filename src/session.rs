//! A mounted view.
//!
//! The session owns the store and drives it from one logical thread of
//! control: feed signals and async completions (fetches, mutation RPCs)
//! arrive over channels and are applied one at a time in [`ViewSession::pump`].
//! Background work never touches the store directly.
//!
//! Completions are guarded twice: a liveness flag stops work finishing
//! after unmount from being delivered, and a resync generation makes a
//! fetch superseded by a newer reconnect a no-op.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{BackendHandles, TaskFilter};
use crate::config::Config;
use crate::error::{Error, MutationKind, Result};
use crate::events::ChangeEvent;
use crate::store::{
    ApplyOutcome, Confirmation, LocalIntent, LocalTicket, Scope, SeedReport, TaskStore,
};
use crate::subscription::{FeedSignal, Subscription, SubscriptionManager, SubscriptionState};
use crate::task::{sort_users, Task, TaskDraft, TaskId, TaskPatch, User, UserId};

/// Handle for a submitted mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutationId(u64);

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// What one step of the session did.
#[derive(Debug)]
pub enum SessionUpdate {
    /// A feed event was applied to the store.
    Applied(ApplyOutcome),
    /// The feed reconnected; a fresh fetch is in flight.
    Resyncing,
    /// A resync fetch landed.
    Reseeded(SeedReport),
    /// A resync fetch failed; another attempt is scheduled.
    ResyncFailed(Error),
    /// A completion from an outdated resync was discarded.
    Stale,
    MutationConfirmed {
        id: MutationId,
        confirmation: Confirmation,
    },
    MutationFailed {
        id: MutationId,
        error: Error,
    },
    /// The feed gave up reconnecting; the store stops receiving remote changes.
    FeedFailed(String),
    /// The feed ended without a failure signal.
    FeedClosed,
}

enum Completion {
    Fetch {
        generation: u64,
        result: Result<Vec<Task>>,
    },
    Mutation {
        id: MutationId,
        op: MutationKind,
        ticket: Option<LocalTicket>,
        result: Result<Confirmation>,
    },
}

enum Next {
    Completion(Completion),
    Signal(Option<FeedSignal>),
}

pub struct ViewSession {
    handles: BackendHandles,
    config: Config,
    store: TaskStore,
    subscription: SubscriptionManager,
    feed: Subscription,
    feed_open: bool,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    generation: u64,
    next_mutation: u64,
    in_flight: usize,
    alive: Arc<AtomicBool>,
    users: Vec<User>,
    current_user: Option<UserId>,
}

impl ViewSession {
    /// Subscribe, fetch, seed, then load the user directory.
    ///
    /// Feed events that arrive while the fetch is in flight are buffered in
    /// the store and replayed after the seed. A failed fetch tears the
    /// subscription down again.
    pub async fn mount(handles: BackendHandles, scope: Scope, config: Config) -> Result<Self> {
        config.validate()?;
        let mut subscription = SubscriptionManager::new(handles.feed.clone(), config.feed.clone());
        let mut feed = subscription.start()?;
        // Fetch only once the first connect attempt has settled, so nothing
        // committed after the fetch reads the table can slip past the feed.
        let _ = subscription
            .watch_state()
            .wait_for(|state| *state != SubscriptionState::Connecting)
            .await;
        let mut store = TaskStore::with_buffer_limit(scope.clone(), config.store.buffer_limit);

        let filter = TaskFilter::from(&scope);
        let mut feed_open = true;
        let mut resync_needed = false;
        let fetched = {
            let fetch = handles.tasks.fetch_tasks(&filter);
            tokio::pin!(fetch);
            loop {
                tokio::select! {
                    result = &mut fetch => break result,
                    signal = feed.recv(), if feed_open => match signal {
                        Some(FeedSignal::Event(event)) => {
                            store.apply(event);
                        }
                        Some(FeedSignal::Reconnected) => {
                            // The fetch in flight may predate the gap.
                            resync_needed = true;
                        }
                        Some(FeedSignal::Failed(reason)) => {
                            warn!(%reason, "change feed failed during mount");
                            feed_open = false;
                        }
                        None => feed_open = false,
                    },
                }
            }
        };

        let tasks = match fetched {
            Ok(tasks) => tasks,
            Err(err) => {
                subscription.stop().await;
                warn!(error = %err, "initial fetch failed");
                return Err(as_fetch_failure(err));
            }
        };

        let users = match handles.users.fetch_users().await {
            Ok(mut users) => {
                sort_users(&mut users);
                users
            }
            Err(err) => {
                warn!(error = %err, "user directory unavailable");
                Vec::new()
            }
        };

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let current_user = match &scope {
            Scope::Assignee(user) => Some(user.clone()),
            Scope::All => config.user.user_id(),
        };
        let mut session = Self {
            handles,
            config,
            store,
            subscription,
            feed,
            feed_open,
            completions_tx,
            completions_rx,
            generation: 0,
            next_mutation: 0,
            in_flight: 0,
            alive: Arc::new(AtomicBool::new(true)),
            users,
            current_user,
        };

        let tasks = tasks
            .into_iter()
            .map(|mut task| {
                session.fill_assignee_email(&mut task);
                task
            })
            .collect();
        let report = session.store.seed(tasks);
        info!(
            loaded = report.loaded,
            replayed = report.replayed,
            users = session.users.len(),
            "view mounted"
        );
        if report.overflowed || resync_needed {
            session.resync();
        }
        Ok(session)
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.store.snapshot()
    }

    pub fn scope(&self) -> &Scope {
        self.store.scope()
    }

    /// The directory, sorted by email.
    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn current_user(&self) -> Option<&UserId> {
        self.current_user.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Reload the user directory.
    pub async fn reload_users(&mut self) -> Result<()> {
        self.ensure_alive()?;
        let mut users = self.handles.users.fetch_users().await?;
        sort_users(&mut users);
        self.users = users;
        Ok(())
    }

    /// Wait for the next feed signal or completion and apply it.
    ///
    /// Fails with [`Error::SessionClosed`] once the feed has ended and no
    /// fetch or mutation is in flight, since nothing more can arrive.
    pub async fn pump(&mut self) -> Result<SessionUpdate> {
        self.ensure_alive()?;
        let next = tokio::select! {
            Some(completion) = self.completions_rx.recv(), if self.in_flight > 0 => {
                Next::Completion(completion)
            }
            signal = self.feed.recv(), if self.feed_open => Next::Signal(signal),
            else => return Err(Error::SessionClosed),
        };
        self.handle(next)
    }

    /// Apply everything already queued without waiting.
    pub fn drain(&mut self) -> Result<Vec<SessionUpdate>> {
        self.ensure_alive()?;
        let mut updates = Vec::new();
        loop {
            if let Ok(completion) = self.completions_rx.try_recv() {
                updates.push(self.handle(Next::Completion(completion))?);
                continue;
            }
            if self.feed_open {
                if let Some(signal) = self.feed.try_recv() {
                    updates.push(self.handle(Next::Signal(Some(signal)))?);
                    continue;
                }
            }
            break;
        }
        Ok(updates)
    }

    fn handle(&mut self, next: Next) -> Result<SessionUpdate> {
        match next {
            Next::Completion(completion) => Ok(self.handle_completion(completion)),
            Next::Signal(signal) => Ok(self.handle_signal(signal)),
        }
    }

    fn handle_signal(&mut self, signal: Option<FeedSignal>) -> SessionUpdate {
        match signal {
            Some(FeedSignal::Event(mut event)) => {
                if let Some(task) = event.task_mut() {
                    self.fill_assignee_email(task);
                }
                SessionUpdate::Applied(self.store.apply(event))
            }
            Some(FeedSignal::Reconnected) => {
                self.resync();
                SessionUpdate::Resyncing
            }
            Some(FeedSignal::Failed(reason)) => {
                warn!(%reason, "change feed failed; view no longer live");
                self.feed_open = false;
                SessionUpdate::FeedFailed(reason)
            }
            None => {
                debug!("change feed ended");
                self.feed_open = false;
                SessionUpdate::FeedClosed
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) -> SessionUpdate {
        self.in_flight = self.in_flight.saturating_sub(1);
        match completion {
            Completion::Fetch { generation, result } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "discarding stale fetch");
                    return SessionUpdate::Stale;
                }
                match result {
                    Ok(tasks) => {
                        let tasks = tasks
                            .into_iter()
                            .map(|mut task| {
                                self.fill_assignee_email(&mut task);
                                task
                            })
                            .collect();
                        let report = self.store.seed(tasks);
                        if report.overflowed {
                            self.resync();
                        }
                        SessionUpdate::Reseeded(report)
                    }
                    Err(err) => {
                        warn!(error = %err, generation, "resync fetch failed; retrying");
                        self.schedule_fetch(self.config.feed.reconnect_backoff(1));
                        SessionUpdate::ResyncFailed(as_fetch_failure(err))
                    }
                }
            }
            Completion::Mutation {
                id,
                op,
                ticket,
                result,
            } => match result {
                Ok(mut confirmation) => {
                    if let Confirmation::Upsert(task) = &mut confirmation {
                        self.fill_assignee_email(task);
                    }
                    let outcome = match &ticket {
                        Some(ticket) => self.store.confirm(ticket, confirmation.clone()),
                        None => self.store.apply(match confirmation.clone() {
                            Confirmation::Upsert(task) => ChangeEvent::Updated(task),
                            Confirmation::Removed(id) => ChangeEvent::Deleted(id),
                        }),
                    };
                    debug!(mutation = %id, %op, ?outcome, "mutation confirmed");
                    SessionUpdate::MutationConfirmed { id, confirmation }
                }
                Err(err) => {
                    if let Some(ticket) = &ticket {
                        self.store.rollback(ticket);
                    }
                    let error = match err {
                        Error::MutationFailed { .. } => err,
                        other => Error::MutationFailed {
                            op,
                            message: other.to_string(),
                        },
                    };
                    warn!(mutation = %id, error = %error, "mutation failed");
                    SessionUpdate::MutationFailed { id, error }
                }
            },
        }
    }

    /// Re-fetch and re-seed; the store buffers until the fetch lands.
    fn resync(&mut self) {
        self.store.begin_resync();
        self.schedule_fetch(Duration::ZERO);
    }

    fn schedule_fetch(&mut self, delay: Duration) {
        self.generation += 1;
        let generation = self.generation;
        let tasks = self.handles.tasks.clone();
        let filter = TaskFilter::from(self.store.scope());
        let tx = self.completions_tx.clone();
        let alive = self.alive.clone();
        self.in_flight += 1;
        debug!(generation, delay_ms = delay.as_millis() as u64, "resync fetch scheduled");
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if !alive.load(Ordering::Acquire) {
                return;
            }
            let result = tasks.fetch_tasks(&filter).await;
            if alive.load(Ordering::Acquire) {
                let _ = tx.send(Completion::Fetch { generation, result });
            }
        });
    }

    fn spawn_mutation<F>(&mut self, op: MutationKind, ticket: Option<LocalTicket>, rpc: F) -> MutationId
    where
        F: Future<Output = Result<Confirmation>> + Send + 'static,
    {
        self.next_mutation += 1;
        let id = MutationId(self.next_mutation);
        let tx = self.completions_tx.clone();
        let alive = self.alive.clone();
        self.in_flight += 1;
        debug!(mutation = %id, %op, optimistic = ticket.is_some(), "mutation submitted");
        tokio::spawn(async move {
            let result = rpc.await;
            if alive.load(Ordering::Acquire) {
                let _ = tx.send(Completion::Mutation {
                    id,
                    op,
                    ticket,
                    result,
                });
            }
        });
        id
    }

    fn optimistic(&mut self, intent: LocalIntent) -> Result<Option<LocalTicket>> {
        if self.config.store.optimistic {
            Ok(Some(self.store.apply_local(intent)?))
        } else {
            Ok(None)
        }
    }

    /// Create a task under the draft's client-minted id. Unassigned drafts
    /// go to the current user.
    pub fn submit_create(&mut self, mut draft: TaskDraft) -> Result<MutationId> {
        self.ensure_alive()?;
        if draft.assigned_to.is_none() {
            draft.assigned_to = self.current_user.clone();
        }
        draft.validate()?;

        let ticket = self.optimistic(LocalIntent::Create(draft.clone()))?;
        let tasks = self.handles.tasks.clone();
        Ok(self.spawn_mutation(MutationKind::Create, ticket, async move {
            tasks.create_task(&draft).await.map(Confirmation::Upsert)
        }))
    }

    pub fn submit_update(&mut self, id: TaskId, patch: TaskPatch) -> Result<MutationId> {
        self.ensure_alive()?;
        self.ensure_known(&id)?;

        let ticket = self.optimistic(LocalIntent::Update(id.clone(), patch.clone()))?;
        let tasks = self.handles.tasks.clone();
        Ok(self.spawn_mutation(MutationKind::Update, ticket, async move {
            tasks.update_task(&id, &patch).await.map(Confirmation::Upsert)
        }))
    }

    pub fn submit_delete(&mut self, id: TaskId) -> Result<MutationId> {
        self.ensure_alive()?;
        self.ensure_known(&id)?;

        let ticket = self.optimistic(LocalIntent::Delete(id.clone()))?;
        let tasks = self.handles.tasks.clone();
        Ok(self.spawn_mutation(MutationKind::Delete, ticket, async move {
            tasks.delete_task(&id).await?;
            Ok::<_, Error>(Confirmation::Removed(id))
        }))
    }

    /// Flip `is_completed`.
    pub fn submit_toggle(&mut self, id: TaskId) -> Result<MutationId> {
        let completed = self
            .store
            .get(&id)
            .map(|task| task.is_completed)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        self.submit_update(id, TaskPatch::new().completed(!completed))
    }

    pub async fn create_task(&mut self, draft: TaskDraft) -> Result<Task> {
        let id = self.submit_create(draft)?;
        self.wait_for_task(id).await
    }

    pub async fn update_task(&mut self, id: TaskId, patch: TaskPatch) -> Result<Task> {
        let id = self.submit_update(id, patch)?;
        self.wait_for_task(id).await
    }

    pub async fn delete_task(&mut self, id: TaskId) -> Result<()> {
        let id = self.submit_delete(id)?;
        self.wait_for(id).await.map(|_| ())
    }

    pub async fn toggle_completed(&mut self, id: TaskId) -> Result<Task> {
        let id = self.submit_toggle(id)?;
        self.wait_for_task(id).await
    }

    async fn wait_for_task(&mut self, id: MutationId) -> Result<Task> {
        match self.wait_for(id).await? {
            Confirmation::Upsert(task) => Ok(task),
            Confirmation::Removed(task_id) => Err(Error::TaskNotFound(task_id)),
        }
    }

    /// Pump until mutation `id` completes, applying everything else on the way.
    async fn wait_for(&mut self, id: MutationId) -> Result<Confirmation> {
        loop {
            match self.pump().await? {
                SessionUpdate::MutationConfirmed {
                    id: done,
                    confirmation,
                } if done == id => return Ok(confirmation),
                SessionUpdate::MutationFailed { id: done, error } if done == id => {
                    return Err(error)
                }
                _ => {}
            }
        }
    }

    /// Stop the subscription and discard the store.
    pub async fn unmount(mut self) {
        self.alive.store(false, Ordering::Release);
        self.subscription.stop().await;
        info!(revision = self.store.revision(), "view unmounted");
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(Error::SessionClosed)
        }
    }

    fn ensure_known(&self, id: &TaskId) -> Result<()> {
        if self.store.contains(id) {
            Ok(())
        } else {
            Err(Error::TaskNotFound(id.clone()))
        }
    }

    /// Realtime payloads carry only the assignee id; fill the email from the
    /// directory when it is known.
    fn fill_assignee_email(&self, task: &mut Task) {
        if let Some(assignee) = task.assigned_to.as_mut() {
            if assignee.email.is_none() {
                assignee.email = self
                    .users
                    .iter()
                    .find(|user| user.id == assignee.id)
                    .map(|user| user.email.clone());
            }
        }
    }
}

impl Drop for ViewSession {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
    }
}

impl fmt::Debug for ViewSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewSession")
            .field("store", &self.store)
            .field("feed_open", &self.feed_open)
            .field("generation", &self.generation)
            .field("users", &self.users.len())
            .finish_non_exhaustive()
    }
}

fn as_fetch_failure(err: Error) -> Error {
    match err {
        Error::FetchFailed(_) => err,
        other => Error::FetchFailed(other.to_string()),
    }
}
