//! taskboard - shared task list engine
//!
//! The client core of a shared todo list: an in-memory, UI-facing list of
//! tasks kept consistent across an initial bulk load, this client's own
//! mutations awaiting confirmation, and an out-of-order, at-least-once
//! stream of change notifications for edits made by any client.
//!
//! # Core Concepts
//!
//! - **Store**: the ordered task list; seeded once, then patched by events
//! - **Change events**: normalized `Created` / `Updated` / `Deleted` records
//! - **Local intents**: optimistic mutations confirmed or rolled back later
//! - **Resync**: after a feed reconnect the list is re-fetched, never gap-filled
//! - **Views**: all / mine / day / calendar projections over the store
//!
//! # Module Organization
//!
//! - `task`: Task and user records, due dates, list ordering
//! - `events`: Raw notification normalization
//! - `store`: The reconciliation store
//! - `subscription`: Change feed lifecycle and reconnects
//! - `projection`: View projections and the projection cache
//! - `backend`: Injected backend ports and an in-memory backend
//! - `session`: A mounted view wiring everything together
//! - `config`: Configuration loading from `.taskboard.toml`
//! - `error`: Error types and result aliases
//! - `output`: CLI output formatting
//! - `cli`: Command-line interface using clap

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod output;
pub mod projection;
pub mod session;
pub mod store;
pub mod subscription;
pub mod task;

pub use error::{Error, Result};
pub use events::{ChangeEvent, PartialTask, RawNotification};
pub use session::{MutationId, SessionUpdate, ViewSession};
pub use store::{ApplyOutcome, Confirmation, LocalIntent, LocalTicket, Scope, SeedReport, TaskStore};
pub use task::{Task, TaskDraft, TaskId, TaskPatch, User, UserId, UserRef};
