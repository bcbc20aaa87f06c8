//! Command-line interface for taskboard
//!
//! This module defines the CLI structure using clap derive macros.
//! Each subcommand is defined in its own submodule.
//!
//! The commands replay recorded backend data offline: a bulk-load snapshot
//! (JSON array of task records) and a change feed (one raw notification
//! per line).

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::config::{Config, CONFIG_FILE_NAME};
use crate::error::{Error, Result};
use crate::events::{normalize, ChangeEvent, RawNotification};
use crate::output::OutputOptions;
use crate::task::{Task, UserId};

mod calendar;
mod normalize;
mod replay;

/// taskboard - shared task list engine
///
/// Replays recorded task snapshots and realtime change feeds through the
/// list reconciliation engine and prints the resulting views.
#[derive(Parser, Debug)]
#[command(name = "taskboard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the config file (defaults to ./.taskboard.toml)
    #[arg(long, global = true, env = "TASKBOARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Current user id (for the "mine" view)
    #[arg(long, global = true, env = "TASKBOARD_USER")]
    pub user: Option<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Seed a store, apply a recorded feed and print a view
    Replay {
        /// JSON array of task records (bulk load)
        #[arg(long)]
        seed: PathBuf,

        /// Recorded change feed, one notification per line
        #[arg(long)]
        feed: Option<PathBuf>,

        /// View to print: all, mine, day (defaults to views.default)
        #[arg(long)]
        view: Option<String>,

        /// Day for the "day" view (YYYY-MM-DD)
        #[arg(long)]
        day: Option<String>,

        /// Reference date for past-due markers (YYYY-MM-DD)
        #[arg(long)]
        today: Option<String>,
    },

    /// Normalize a recorded feed and report dropped lines
    Normalize {
        /// Recorded change feed, one notification per line
        #[arg(long)]
        feed: PathBuf,
    },

    /// Print the days of a month that have tasks due
    Calendar {
        /// JSON array of task records (bulk load)
        #[arg(long)]
        seed: PathBuf,

        /// Recorded change feed, one notification per line
        #[arg(long)]
        feed: Option<PathBuf>,

        /// Month to show (YYYY-MM)
        #[arg(long)]
        month: String,
    },
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let output = OutputOptions {
            json: self.json,
            quiet: self.quiet,
        };
        let config_path = self
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        let config = Config::load_or_default(&config_path)?;
        let user = self
            .user
            .as_deref()
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .map(UserId::new)
            .or_else(|| config.user.user_id());

        match self.command {
            Commands::Replay {
                seed,
                feed,
                view,
                day,
                today,
            } => replay::run(replay::ReplayOptions {
                seed,
                feed,
                view,
                day,
                today,
                user,
                config,
                output,
            }),
            Commands::Normalize { feed } => normalize::run(normalize::NormalizeOptions {
                feed,
                output,
            }),
            Commands::Calendar { seed, feed, month } => {
                calendar::run(calendar::CalendarOptions {
                    seed,
                    feed,
                    month,
                    config,
                    output,
                })
            }
        }
    }
}

/// A feed line that could not be turned into an event.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct DroppedLine {
    pub line: usize,
    pub error: String,
}

/// Normalized events and drop diagnostics from a recorded feed.
#[derive(Debug, Default)]
pub(crate) struct FeedReplay {
    pub events: Vec<(usize, ChangeEvent)>,
    pub dropped: Vec<DroppedLine>,
}

impl FeedReplay {
    pub fn warnings(&self) -> Vec<String> {
        self.dropped
            .iter()
            .map(|dropped| format!("line {}: {}", dropped.line, dropped.error))
            .collect()
    }
}

/// Read a bulk-load snapshot.
pub(crate) fn load_seed(path: &Path) -> Result<Vec<Task>> {
    let content = std::fs::read_to_string(path)?;
    let records: Vec<serde_json::Value> = serde_json::from_str(&content)?;
    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            Task::from_record(record).map_err(|err| {
                Error::InvalidTask(format!("{} record {}: {err}", path.display(), index + 1))
            })
        })
        .collect()
}

/// Read and normalize a recorded feed. Malformed lines are collected, not fatal.
pub(crate) fn load_feed(path: Option<&Path>) -> Result<FeedReplay> {
    let mut replay = FeedReplay::default();
    let Some(path) = path else {
        return Ok(replay);
    };

    let content = std::fs::read_to_string(path)?;
    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match RawNotification::from_json_line(trimmed).and_then(|raw| normalize(&raw)) {
            Ok(event) => replay.events.push((line_no, event)),
            Err(err) => {
                tracing::warn!(line = line_no, error = %err, "dropping feed line");
                replay.dropped.push(DroppedLine {
                    line: line_no,
                    error: err.to_string(),
                });
            }
        }
    }
    Ok(replay)
}

pub(crate) fn parse_date(raw: &str, flag: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
        Error::InvalidArgument(format!("{flag}: expected YYYY-MM-DD, got '{raw}'"))
    })
}
