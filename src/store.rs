//! The reconciliation store.
//!
//! A single in-memory list of tasks fed by three sources: the bulk fetch
//! (`seed`), the realtime change feed (`apply`) and this client's own
//! mutations (`apply_local`, then `confirm` or `rollback`). The store is
//! owned by one view session and mutated only from its thread of control;
//! observers learn about changes through a `watch` channel carrying the
//! store revision.
//!
//! Events that arrive before the first seed (or while a resync is pending)
//! are queued and replayed right after the next seed, so a mount never
//! loses changes made between "subscribe" and "fetch returned".

use std::collections::{BTreeMap, HashMap};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::ChangeEvent;
use crate::task::{SortKey, Task, TaskDraft, TaskId, TaskPatch, UserId};

pub const DEFAULT_BUFFER_LIMIT: usize = 1024;

/// Which tasks a store holds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Scope {
    #[default]
    All,
    Assignee(UserId),
}

impl Scope {
    pub fn admits(&self, task: &Task) -> bool {
        match self {
            Scope::All => true,
            Scope::Assignee(user) => task.is_assigned_to(user),
        }
    }
}

/// What a single call did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Replaced,
    Removed,
    /// Already reflected; nothing changed.
    Unchanged,
    /// Outside the store's scope.
    Ignored,
    /// Queued until the next seed.
    Buffered,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        matches!(
            self,
            ApplyOutcome::Inserted | ApplyOutcome::Replaced | ApplyOutcome::Removed
        )
    }
}

/// Result of a [`TaskStore::seed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeedReport {
    pub loaded: usize,
    pub replayed: usize,
    /// Events were lost while buffering; the contents may be stale.
    pub overflowed: bool,
}

/// A mutation issued by this client, applied before the server answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalIntent {
    Create(TaskDraft),
    Update(TaskId, TaskPatch),
    Delete(TaskId),
}

/// Handle for a pending local intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTicket {
    seq: u64,
    task_id: TaskId,
}

impl LocalTicket {
    /// The id the intent was applied under. For creates this is the
    /// client-minted id the backend is asked to keep.
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }
}

/// The server's answer to a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Upsert(Task),
    Removed(TaskId),
}

#[derive(Debug)]
struct PendingIntent {
    task_id: TaskId,
    previous: Option<Task>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Buffering,
    Seeded,
}

pub struct TaskStore {
    scope: Scope,
    tasks: BTreeMap<SortKey, Task>,
    index: HashMap<TaskId, SortKey>,
    phase: Phase,
    buffer: Vec<ChangeEvent>,
    buffer_limit: usize,
    overflowed: bool,
    pending: HashMap<u64, PendingIntent>,
    next_ticket: u64,
    revision: u64,
    changes: watch::Sender<u64>,
}

impl TaskStore {
    pub fn new(scope: Scope) -> Self {
        Self::with_buffer_limit(scope, DEFAULT_BUFFER_LIMIT)
    }

    pub fn with_buffer_limit(scope: Scope, buffer_limit: usize) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            scope,
            tasks: BTreeMap::new(),
            index: HashMap::new(),
            phase: Phase::Buffering,
            buffer: Vec::new(),
            buffer_limit: buffer_limit.max(1),
            overflowed: false,
            pending: HashMap::new(),
            next_ticket: 0,
            revision: 0,
            changes,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn is_seeded(&self) -> bool {
        self.phase == Phase::Seeded
    }

    /// Replace the contents with a fetched list, then replay buffered events.
    ///
    /// Pending local intents are superseded: the fetched list is newer than
    /// whatever they would roll back to.
    pub fn seed(&mut self, tasks: Vec<Task>) -> SeedReport {
        self.tasks.clear();
        self.index.clear();
        self.pending.clear();

        for task in tasks {
            if self.scope.admits(&task) {
                self.upsert(task);
            }
        }
        let loaded = self.tasks.len();

        self.phase = Phase::Seeded;
        let buffered = std::mem::take(&mut self.buffer);
        let replayed = buffered.len();
        for event in buffered {
            self.apply_remote(event);
        }
        let overflowed = std::mem::replace(&mut self.overflowed, false);

        self.bump();
        info!(loaded, replayed, overflowed, revision = self.revision, "store seeded");
        SeedReport {
            loaded,
            replayed,
            overflowed,
        }
    }

    /// Go back to buffering until the next seed. Contents stay readable.
    pub fn begin_resync(&mut self) {
        debug!(buffered = self.buffer.len(), "store resync started");
        self.phase = Phase::Buffering;
        self.buffer.clear();
        self.overflowed = false;
    }

    /// Apply a remote change.
    pub fn apply(&mut self, event: ChangeEvent) -> ApplyOutcome {
        if self.phase == Phase::Buffering {
            return self.buffer_event(event);
        }

        self.supersede(event.task_id());
        let id = event.task_id().clone();
        let kind = event.label();
        let outcome = self.apply_remote(event);
        if outcome.changed() {
            self.bump();
        }
        debug!(task_id = %id, kind, ?outcome, "applied change event");
        outcome
    }

    fn buffer_event(&mut self, event: ChangeEvent) -> ApplyOutcome {
        if self.overflowed {
            return ApplyOutcome::Buffered;
        }
        if self.buffer.len() >= self.buffer_limit {
            warn!(
                limit = self.buffer_limit,
                "event buffer overflowed before seed; discarding buffered events"
            );
            self.buffer.clear();
            self.overflowed = true;
            return ApplyOutcome::Buffered;
        }
        self.buffer.push(event);
        ApplyOutcome::Buffered
    }

    fn apply_remote(&mut self, event: ChangeEvent) -> ApplyOutcome {
        match event {
            ChangeEvent::Created(task) | ChangeEvent::Updated(task) => self.upsert_in_scope(task),
            ChangeEvent::Patched(partial) => {
                let Some(current) = self.get(&partial.id) else {
                    warn!(task_id = %partial.id, "partial update for a task not held; dropped");
                    return ApplyOutcome::Ignored;
                };
                match partial.merge_onto(current) {
                    Ok(task) => self.upsert_in_scope(task),
                    Err(err) => {
                        warn!(task_id = %partial.id, error = %err, "partial update rejected");
                        ApplyOutcome::Ignored
                    }
                }
            }
            ChangeEvent::Deleted(id) => self.remove(&id),
        }
    }

    fn upsert_in_scope(&mut self, mut task: Task) -> ApplyOutcome {
        if !self.scope.admits(&task) {
            return match self.remove(&task.id) {
                ApplyOutcome::Removed => ApplyOutcome::Removed,
                _ => ApplyOutcome::Ignored,
            };
        }
        self.carry_email(&mut task);
        self.upsert(task)
    }

    /// Keep a known assignee email when the incoming record has the same
    /// assignee but no email (realtime payloads are not joined).
    fn carry_email(&self, task: &mut Task) {
        let known = self
            .get(&task.id)
            .and_then(|existing| existing.assigned_to.as_ref());
        if let (Some(incoming), Some(known)) = (task.assigned_to.as_mut(), known) {
            if incoming.email.is_none() && incoming.id == known.id {
                incoming.email = known.email.clone();
            }
        }
    }

    fn upsert(&mut self, task: Task) -> ApplyOutcome {
        let key = task.sort_key();
        match self.index.get(&task.id).cloned() {
            Some(existing_key) => {
                if self.tasks.get(&existing_key) == Some(&task) {
                    return ApplyOutcome::Unchanged;
                }
                self.tasks.remove(&existing_key);
                self.index.insert(task.id.clone(), key.clone());
                self.tasks.insert(key, task);
                ApplyOutcome::Replaced
            }
            None => {
                self.index.insert(task.id.clone(), key.clone());
                self.tasks.insert(key, task);
                ApplyOutcome::Inserted
            }
        }
    }

    fn remove(&mut self, id: &TaskId) -> ApplyOutcome {
        match self.index.remove(id) {
            Some(key) => {
                self.tasks.remove(&key);
                ApplyOutcome::Removed
            }
            None => ApplyOutcome::Unchanged,
        }
    }

    /// A remote event wins over any local intent still pending for the id.
    fn supersede(&mut self, id: &TaskId) {
        let before = self.pending.len();
        self.pending.retain(|_, intent| &intent.task_id != id);
        if self.pending.len() != before {
            debug!(task_id = %id, "remote event superseded pending local intent");
        }
    }

    /// Apply a local mutation ahead of the server's answer.
    pub fn apply_local(&mut self, intent: LocalIntent) -> Result<LocalTicket> {
        let (task_id, previous, outcome) = match intent {
            LocalIntent::Create(draft) => {
                draft.validate()?;
                if self.contains(&draft.id) {
                    return Err(Error::InvalidTask(format!("task id {} already exists", draft.id)));
                }
                let task = draft.to_task()?;
                let id = task.id.clone();
                let outcome = self.upsert_in_scope(task);
                (id, None, outcome)
            }
            LocalIntent::Update(id, patch) => {
                let current = self
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
                let mut next = current.clone();
                patch.apply_to(&mut next)?;
                let outcome = self.upsert_in_scope(next);
                (id, Some(current), outcome)
            }
            LocalIntent::Delete(id) => {
                let current = self
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
                let outcome = self.remove(&id);
                (id, Some(current), outcome)
            }
        };

        self.next_ticket += 1;
        let seq = self.next_ticket;
        self.pending.insert(
            seq,
            PendingIntent {
                task_id: task_id.clone(),
                previous,
            },
        );
        if outcome.changed() {
            self.bump();
        }
        debug!(task_id = %task_id, ticket = seq, ?outcome, "applied local intent");
        Ok(LocalTicket { seq, task_id })
    }

    /// Apply the server's authoritative result for a local intent.
    ///
    /// Older intents for the same record can no longer roll back over the
    /// confirmed state. Newer ones stay visible and roll back onto it.
    pub fn confirm(&mut self, ticket: &LocalTicket, confirmation: Confirmation) -> ApplyOutcome {
        self.pending.remove(&ticket.seq);
        let confirmed = match &confirmation {
            Confirmation::Upsert(task) => Some(task),
            Confirmation::Removed(_) => None,
        };
        let newer_pending = self.settle_pending(ticket, confirmed);

        let mut changed = false;
        if let Confirmation::Upsert(task) = &confirmation {
            if task.id != ticket.task_id {
                // The backend did not keep the client-minted id.
                changed |= self.remove(&ticket.task_id).changed();
            }
        }
        if newer_pending {
            if changed {
                self.bump();
            }
            debug!(ticket = ticket.seq, "confirmed local intent; newer intent still pending");
            return if changed {
                ApplyOutcome::Removed
            } else {
                ApplyOutcome::Unchanged
            };
        }

        let event = match confirmation {
            Confirmation::Upsert(task) => ChangeEvent::Updated(task),
            Confirmation::Removed(id) => ChangeEvent::Deleted(id),
        };
        if self.phase == Phase::Buffering {
            // Replayed after the pending seed so the fetch cannot hide it.
            self.buffer_event(event.clone());
        }
        let outcome = self.apply_remote(event);
        changed |= outcome.changed();

        if changed {
            self.bump();
        }
        debug!(ticket = ticket.seq, ?outcome, "confirmed local intent");
        match outcome {
            ApplyOutcome::Unchanged if changed => ApplyOutcome::Removed,
            other => other,
        }
    }

    /// Drop intents older than `ticket` on the same record and rebase newer
    /// ones onto the confirmed state. True when a newer one remains.
    fn settle_pending(&mut self, ticket: &LocalTicket, confirmed: Option<&Task>) -> bool {
        let mut newer = false;
        self.pending.retain(|seq, intent| {
            if intent.task_id != ticket.task_id {
                return true;
            }
            if *seq < ticket.seq {
                return false;
            }
            intent.previous = confirmed.cloned();
            newer = true;
            true
        });
        newer
    }

    /// Undo a local intent the server rejected.
    ///
    /// A no-op once a remote event for the same id has superseded it.
    pub fn rollback(&mut self, ticket: &LocalTicket) -> ApplyOutcome {
        let Some(intent) = self.pending.remove(&ticket.seq) else {
            debug!(ticket = ticket.seq, "rollback skipped; intent superseded");
            return ApplyOutcome::Unchanged;
        };

        let outcome = match intent.previous {
            None => self.remove(&intent.task_id),
            Some(previous) => {
                let removed = self.remove(&intent.task_id);
                match self.upsert_in_scope(previous) {
                    ApplyOutcome::Inserted if removed.changed() => ApplyOutcome::Replaced,
                    ApplyOutcome::Ignored if removed.changed() => ApplyOutcome::Removed,
                    other => other,
                }
            }
        };
        if outcome.changed() {
            self.bump();
        }
        debug!(task_id = %intent.task_id, ticket = ticket.seq, ?outcome, "rolled back local intent");
        outcome
    }

    /// Ordered copy of the current contents.
    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).and_then(|key| self.tasks.get(key))
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn pending_intents(&self) -> usize {
        self.pending.len()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Receiver of the store revision, bumped on every visible change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump(&mut self) {
        self.revision += 1;
        self.changes.send_replace(self.revision);
    }
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("scope", &self.scope)
            .field("len", &self.tasks.len())
            .field("phase", &self.phase)
            .field("buffered", &self.buffer.len())
            .field("pending", &self.pending.len())
            .field("revision", &self.revision)
            .finish()
    }
}
