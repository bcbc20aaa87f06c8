//! taskboard calendar command implementation
//!
//! Prints the marked days of one month and the tasks due on each.

use std::path::PathBuf;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use super::{load_feed, load_seed, DroppedLine};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::output::{emit_success, task_row, HumanOutput, OutputOptions};
use crate::projection::{calendar, marked_days};
use crate::store::{Scope, TaskStore};
use crate::task::Task;

/// Options for `taskboard calendar`
pub struct CalendarOptions {
    pub seed: PathBuf,
    pub feed: Option<PathBuf>,
    pub month: String,
    pub config: Config,
    pub output: OutputOptions,
}

#[derive(Serialize)]
struct CalendarDay {
    date: NaiveDate,
    tasks: Vec<Task>,
}

#[derive(Serialize)]
struct CalendarReport {
    month: String,
    days: Vec<CalendarDay>,
    dropped: Vec<DroppedLine>,
}

fn parse_month(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(&format!("{}-01", raw.trim()), "%Y-%m-%d").map_err(|_| {
        Error::InvalidArgument(format!("--month: expected YYYY-MM, got '{raw}'"))
    })
}

pub fn run(options: CalendarOptions) -> Result<()> {
    let first = parse_month(&options.month)?;
    let tasks = load_seed(&options.seed)?;
    let feed = load_feed(options.feed.as_deref())?;

    let mut store = TaskStore::with_buffer_limit(Scope::All, options.config.store.buffer_limit);
    store.seed(tasks);
    for (_, event) in &feed.events {
        store.apply(event.clone());
    }

    let mut grouped = calendar(store.iter());
    let days: Vec<CalendarDay> = marked_days(store.iter(), first.year(), first.month())
        .into_iter()
        .map(|date| CalendarDay {
            date,
            tasks: grouped.remove(&date).unwrap_or_default(),
        })
        .collect();

    let month = first.format("%Y-%m").to_string();
    let mut human = HumanOutput::new(format!(
        "taskboard calendar: {month}, {} marked day(s)",
        days.len()
    ));
    for day in &days {
        human.push_detail(format!("{} ({} task(s))", day.date, day.tasks.len()));
        for task in &day.tasks {
            human.push_detail(format!("  {}", task_row(task, None)));
        }
    }
    for warning in feed.warnings() {
        human.push_warning(warning);
    }

    let report = CalendarReport {
        month,
        days,
        dropped: feed.dropped,
    };
    emit_success(options.output, "calendar", &report, Some(&human))
}
