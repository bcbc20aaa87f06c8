//! taskboard replay command implementation
//!
//! Seeds a store from a bulk-load snapshot, applies a recorded feed and
//! prints one projection of the result.

use std::path::PathBuf;

use chrono::NaiveDate;
use serde::Serialize;

use super::{load_feed, load_seed, parse_date, DroppedLine};
use crate::config::{Config, ViewKind};
use crate::error::{Error, Result};
use crate::output::{emit_success, task_row, HumanOutput, OutputOptions};
use crate::projection::{past_due, View};
use crate::store::{ApplyOutcome, Scope, TaskStore};
use crate::task::{Task, TaskId, UserId};

/// Options for `taskboard replay`
pub struct ReplayOptions {
    pub seed: PathBuf,
    pub feed: Option<PathBuf>,
    pub view: Option<String>,
    pub day: Option<String>,
    pub today: Option<String>,
    pub user: Option<UserId>,
    pub config: Config,
    pub output: OutputOptions,
}

#[derive(Serialize)]
struct ReplayReport {
    view: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    day: Option<NaiveDate>,
    seeded: usize,
    applied: usize,
    unchanged: usize,
    dropped: Vec<DroppedLine>,
    revision: u64,
    tasks: Vec<Task>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    past_due: Vec<TaskId>,
}

fn resolve_view(options: &ReplayOptions) -> Result<View> {
    let kind = match options.view.as_deref() {
        Some(raw) => ViewKind::parse(raw).ok_or_else(|| {
            Error::InvalidArgument(format!("--view: expected all|mine|day, got '{raw}'"))
        })?,
        None => options.config.views.default_kind(),
    };

    match kind {
        ViewKind::All => Ok(View::All),
        ViewKind::Mine => options.user.clone().map(View::Mine).ok_or_else(|| {
            Error::InvalidArgument(
                "the mine view needs a user (--user, TASKBOARD_USER or [user] id)".to_string(),
            )
        }),
        ViewKind::Day => {
            let raw = options.day.as_deref().ok_or_else(|| {
                Error::InvalidArgument("the day view needs --day YYYY-MM-DD".to_string())
            })?;
            Ok(View::Day(parse_date(raw, "--day")?))
        }
    }
}

pub fn run(options: ReplayOptions) -> Result<()> {
    let view = resolve_view(&options)?;
    let today = options
        .today
        .as_deref()
        .map(|raw| parse_date(raw, "--today"))
        .transpose()?;

    let tasks = load_seed(&options.seed)?;
    let feed = load_feed(options.feed.as_deref())?;

    let mut store = TaskStore::with_buffer_limit(Scope::All, options.config.store.buffer_limit);
    let seeded = store.seed(tasks).loaded;
    let mut applied = 0;
    let mut unchanged = 0;
    for (_, event) in &feed.events {
        match store.apply(event.clone()) {
            ApplyOutcome::Unchanged | ApplyOutcome::Ignored => unchanged += 1,
            _ => applied += 1,
        }
    }

    let rows = view.project(store.iter());
    let overdue: Vec<TaskId> = today
        .map(|today| past_due(&rows, today).into_iter().map(|task| task.id).collect())
        .unwrap_or_default();

    let mut human = HumanOutput::new(format!(
        "taskboard replay: {} task(s) in view {}",
        rows.len(),
        view.label()
    ));
    human.push_summary("seeded", seeded.to_string());
    human.push_summary("events applied", applied.to_string());
    human.push_summary("events without effect", unchanged.to_string());
    if today.is_some() {
        human.push_summary("past due", overdue.len().to_string());
    }
    for task in &rows {
        human.push_detail(task_row(task, today));
    }
    for warning in feed.warnings() {
        human.push_warning(warning);
    }

    let report = ReplayReport {
        view: view.label(),
        user: match &view {
            View::Mine(user) => Some(user.clone()),
            _ => None,
        },
        day: match &view {
            View::Day(day) => Some(*day),
            _ => None,
        },
        seeded,
        applied,
        unchanged,
        dropped: feed.dropped,
        revision: store.revision(),
        tasks: rows,
        past_due: overdue,
    };

    emit_success(options.output, "replay", &report, Some(&human))
}
