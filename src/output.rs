//! Shared output formatting for taskboard CLI commands.

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::{JsonError, Result};
use crate::task::Task;

pub const SCHEMA_VERSION: &str = "taskboard.v1";

#[derive(Debug, Clone, Copy)]
pub struct OutputOptions {
    pub json: bool,
    pub quiet: bool,
}

#[derive(Debug, Clone)]
pub struct HumanOutput {
    header: String,
    summary: Vec<(String, String)>,
    details: Vec<String>,
    warnings: Vec<String>,
    next_steps: Vec<String>,
}

impl HumanOutput {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            summary: Vec::new(),
            details: Vec::new(),
            warnings: Vec::new(),
            next_steps: Vec::new(),
        }
    }

    pub fn push_summary(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.summary.push((key.into(), value.into()));
    }

    pub fn push_detail(&mut self, value: impl Into<String>) {
        self.details.push(value.into());
    }

    pub fn push_warning(&mut self, value: impl Into<String>) {
        self.warnings.push(value.into());
    }

    pub fn push_next_step(&mut self, value: impl Into<String>) {
        self.next_steps.push(value.into());
    }
}

#[derive(Serialize)]
struct Envelope<'a, B: Serialize> {
    schema_version: &'static str,
    command: &'a str,
    status: &'static str,
    #[serde(flatten)]
    body: B,
    #[serde(skip_serializing_if = "is_empty")]
    warnings: &'a [String],
    #[serde(skip_serializing_if = "is_empty")]
    next_steps: &'a [String],
}

fn is_empty(items: &&[String]) -> bool {
    items.is_empty()
}

#[derive(Serialize)]
struct DataBody<'a, T: Serialize> {
    data: &'a T,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    message: String,
    code: i32,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

pub fn emit_success<T: Serialize>(
    options: OutputOptions,
    command: &str,
    data: &T,
    human: Option<&HumanOutput>,
) -> Result<()> {
    if options.json {
        let payload = Envelope {
            schema_version: SCHEMA_VERSION,
            command,
            status: "success",
            body: DataBody { data },
            warnings: human.map(|h| h.warnings.as_slice()).unwrap_or_default(),
            next_steps: human.map(|h| h.next_steps.as_slice()).unwrap_or_default(),
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    if options.quiet {
        return Ok(());
    }
    if let Some(human) = human {
        println!("{}", format_human(human));
    }
    Ok(())
}

pub fn emit_error(command: &str, err: &crate::error::Error, json: bool) -> Result<()> {
    let next_steps = error_next_steps(err);
    if json {
        let rendered = JsonError::from(err);
        let payload = Envelope {
            schema_version: SCHEMA_VERSION,
            command,
            status: "error",
            body: ErrorBody {
                error: ErrorDetail {
                    message: rendered.error,
                    code: rendered.code,
                    kind: error_kind(err),
                    details: rendered.details,
                },
            },
            warnings: &[],
            next_steps: &next_steps,
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    eprintln!("error: {err}");
    if let Some(hint) = next_steps.first() {
        eprintln!("hint: {hint}");
    }
    Ok(())
}

pub fn format_human(output: &HumanOutput) -> String {
    let mut lines = Vec::new();
    lines.push(output.header.clone());

    push_summary(&mut lines, &output.summary);
    push_section(&mut lines, "Details", &output.details);
    push_section(&mut lines, "Warnings", &output.warnings);
    push_section(&mut lines, "Next steps", &output.next_steps);

    lines.join("\n")
}

pub fn infer_command_name_from_args() -> String {
    let mut skip_value = false;
    for arg in std::env::args().skip(1) {
        if skip_value {
            skip_value = false;
            continue;
        }
        if arg.starts_with('-') {
            // Global flags that take a separate value.
            skip_value = matches!(arg.as_str(), "--config" | "--user");
            continue;
        }
        return arg;
    }
    "taskboard".to_string()
}

/// One task as a list row: `[x] 12  2024-06-01  Title  (assignee)`.
pub fn task_row(task: &Task, today: Option<NaiveDate>) -> String {
    let check = if task.is_completed { "[x]" } else { "[ ]" };
    let due = task
        .due_date
        .map(|date| date.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "----------".to_string());
    let mut row = format!("{check} {:<6} {due}  {}", task.id.as_str(), task.title);
    if let Some(assignee) = &task.assigned_to {
        let who = assignee.email.as_deref().unwrap_or(assignee.id.as_str());
        row.push_str(&format!("  ({who})"));
    }
    if today.map(|today| task.is_past_due(today)).unwrap_or(false) {
        row.push_str("  PAST DUE");
    }
    row
}

fn error_kind(err: &crate::error::Error) -> &'static str {
    match err.exit_code() {
        2 => "user_error",
        _ => "operation_failed",
    }
}

fn error_next_steps(err: &crate::error::Error) -> Vec<String> {
    use crate::error::Error;

    match err {
        Error::InvalidConfig(_) => vec!["fix .taskboard.toml then retry".to_string()],
        Error::MalformedEvent(_) => {
            vec!["taskboard normalize --feed <events.jsonl>".to_string()]
        }
        Error::InvalidTask(_) => vec!["check the seed file's task records".to_string()],
        _ => Vec::new(),
    }
}

fn push_summary(lines: &mut Vec<String>, summary: &[(String, String)]) {
    if summary.is_empty() {
        return;
    }

    lines.push(String::new());
    lines.push("Summary:".to_string());
    for (key, value) in summary {
        if value.is_empty() {
            lines.push(format!("- {key}"));
        } else {
            lines.push(format!("- {key}: {value}"));
        }
    }
}

fn push_section(lines: &mut Vec<String>, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }

    lines.push(String::new());
    lines.push(format!("{title}:"));
    for item in items {
        lines.push(format!("- {item}"));
    }
}
