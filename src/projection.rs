//! Read-only views over the store.
//!
//! Every projection keeps the store's order, so filtered lists stay sorted
//! by due date without re-sorting.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use tokio::sync::watch;

use crate::store::TaskStore;
use crate::task::{Task, UserId};

/// A projection a view renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    All,
    Mine(UserId),
    Day(NaiveDate),
}

impl View {
    pub fn project<'a, I>(&self, tasks: I) -> Vec<Task>
    where
        I: IntoIterator<Item = &'a Task>,
    {
        match self {
            View::All => tasks.into_iter().cloned().collect(),
            View::Mine(user) => mine(tasks, user),
            View::Day(day) => for_day(tasks, *day),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            View::All => "all",
            View::Mine(_) => "mine",
            View::Day(_) => "day",
        }
    }
}

/// Tasks assigned to `user`.
pub fn mine<'a, I>(tasks: I, user: &UserId) -> Vec<Task>
where
    I: IntoIterator<Item = &'a Task>,
{
    tasks
        .into_iter()
        .filter(|task| task.is_assigned_to(user))
        .cloned()
        .collect()
}

/// Tasks due on `day`.
pub fn for_day<'a, I>(tasks: I, day: NaiveDate) -> Vec<Task>
where
    I: IntoIterator<Item = &'a Task>,
{
    tasks
        .into_iter()
        .filter(|task| task.is_due_on(day))
        .cloned()
        .collect()
}

/// Scheduled tasks grouped by due day. Unscheduled tasks are left out.
pub fn calendar<'a, I>(tasks: I) -> BTreeMap<NaiveDate, Vec<Task>>
where
    I: IntoIterator<Item = &'a Task>,
{
    let mut days: BTreeMap<NaiveDate, Vec<Task>> = BTreeMap::new();
    for task in tasks {
        if let Some(due) = task.due_date {
            days.entry(due).or_default().push(task.clone());
        }
    }
    days
}

/// Days of `year`-`month` with at least one task due.
pub fn marked_days<'a, I>(tasks: I, year: i32, month: u32) -> Vec<NaiveDate>
where
    I: IntoIterator<Item = &'a Task>,
{
    let mut days: Vec<NaiveDate> = tasks
        .into_iter()
        .filter_map(|task| task.due_date)
        .filter(|due| due.year() == year && due.month() == month)
        .collect();
    days.sort();
    days.dedup();
    days
}

/// Open tasks due before `today`.
pub fn past_due<'a, I>(tasks: I, today: NaiveDate) -> Vec<Task>
where
    I: IntoIterator<Item = &'a Task>,
{
    tasks
        .into_iter()
        .filter(|task| task.is_past_due(today))
        .cloned()
        .collect()
}

/// Cached rows for one view, recomputed when the store signals a change.
pub struct Projector {
    view: View,
    changes: watch::Receiver<u64>,
    seen: u64,
    rows: Vec<Task>,
}

impl Projector {
    pub fn new(view: View, store: &TaskStore) -> Self {
        let changes = store.subscribe();
        let seen = *changes.borrow();
        Self {
            rows: view.project(store.iter()),
            view,
            changes,
            seen,
        }
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn rows(&self) -> &[Task] {
        &self.rows
    }

    /// Switch views; rows are recomputed immediately.
    pub fn set_view(&mut self, view: View, store: &TaskStore) {
        self.view = view;
        self.recompute(store);
    }

    /// Recompute if the store changed since the last refresh.
    pub fn refresh(&mut self, store: &TaskStore) -> bool {
        if *self.changes.borrow() == self.seen {
            return false;
        }
        self.recompute(store);
        true
    }

    /// Wait until the store has a change these rows do not reflect.
    /// Returns `false` once the store is gone.
    pub async fn changed(&mut self) -> bool {
        loop {
            if *self.changes.borrow_and_update() != self.seen {
                return true;
            }
            if self.changes.changed().await.is_err() {
                return false;
            }
        }
    }

    fn recompute(&mut self, store: &TaskStore) {
        self.seen = *self.changes.borrow();
        self.rows = self.view.project(store.iter());
    }
}
