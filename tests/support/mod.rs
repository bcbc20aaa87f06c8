#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use chrono::NaiveDate;
use taskboard::task::{Task, UserRef};
use tempfile::TempDir;

/// A scratch directory holding seed files, feeds and config.
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn init() -> std::io::Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_file(&self, rel_path: &str, contents: &str) -> std::io::Result<PathBuf> {
        let path = self.dir.path().join(rel_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(path)
    }

    pub fn write_config(&self, contents: &str) -> std::io::Result<PathBuf> {
        self.write_file(".taskboard.toml", contents)
    }

    pub fn write_seed(&self, records: &serde_json::Value) -> std::io::Result<PathBuf> {
        self.write_file("seed.json", &records.to_string())
    }

    pub fn write_feed(&self, lines: &[&str]) -> std::io::Result<PathBuf> {
        let mut body = lines.join("\n");
        body.push('\n');
        self.write_file("feed.jsonl", &body)
    }
}

/// The binary with ambient configuration scrubbed from the environment.
pub fn taskboard_cmd() -> Command {
    let mut cmd = Command::cargo_bin("taskboard").expect("binary");
    cmd.env_remove("TASKBOARD_CONFIG")
        .env_remove("TASKBOARD_USER")
        .env_remove("RUST_LOG");
    cmd
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

pub fn task(id: &str, due: Option<NaiveDate>) -> Task {
    let task = Task::new(id, format!("task {id}")).expect("valid task");
    match due {
        Some(due) => task.with_due_date(due),
        None => task,
    }
}

pub fn assigned(id: &str, due: Option<NaiveDate>, user: &str) -> Task {
    task(id, due).with_assignee(UserRef::new(user))
}
