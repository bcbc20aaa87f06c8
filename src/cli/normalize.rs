//! taskboard normalize command implementation

use std::path::PathBuf;

use serde::Serialize;

use super::{load_feed, DroppedLine};
use crate::error::Result;
use crate::events::ChangeEvent;
use crate::output::{emit_success, HumanOutput, OutputOptions};

/// Options for `taskboard normalize`
pub struct NormalizeOptions {
    pub feed: PathBuf,
    pub output: OutputOptions,
}

#[derive(Serialize)]
struct NormalizedLine {
    line: usize,
    #[serde(flatten)]
    event: ChangeEvent,
}

#[derive(Serialize)]
struct NormalizeReport {
    events: Vec<NormalizedLine>,
    dropped: Vec<DroppedLine>,
}

pub fn run(options: NormalizeOptions) -> Result<()> {
    let feed = load_feed(Some(&options.feed))?;

    let mut human = HumanOutput::new(format!(
        "taskboard normalize: {} event(s), {} dropped",
        feed.events.len(),
        feed.dropped.len()
    ));
    for (line, event) in &feed.events {
        human.push_detail(format!("line {line}: {} {}", event.label(), event.task_id()));
    }
    for warning in feed.warnings() {
        human.push_warning(warning);
    }

    let report = NormalizeReport {
        events: feed
            .events
            .into_iter()
            .map(|(line, event)| NormalizedLine { line, event })
            .collect(),
        dropped: feed.dropped,
    };

    emit_success(options.output, "normalize", &report, Some(&human))
}
