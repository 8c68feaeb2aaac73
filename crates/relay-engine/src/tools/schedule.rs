//! Reminder and cron tools over a pluggable schedule store. The store only
//! records entries; firing them is the scheduler's job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_core::ids::ConversationId;
use relay_core::tools::{ExecutionMode, Tool, ToolContext, ToolError, ToolResult};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires once.
    At { at: DateTime<Utc> },
    /// Five-field cron expression.
    Cron { expression: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub conversation_id: ConversationId,
    pub trigger: Trigger,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl ScheduleEntry {
    pub fn is_cron(&self) -> bool {
        matches!(self.trigger, Trigger::Cron { .. })
    }
}

pub trait ScheduleStore: Send + Sync {
    fn add(&self, conversation_id: &ConversationId, trigger: Trigger, text: &str) -> ScheduleEntry;
    fn list(&self, conversation_id: &ConversationId) -> Vec<ScheduleEntry>;
    /// Returns false when the id is unknown for this conversation.
    fn remove(&self, conversation_id: &ConversationId, id: &str) -> bool;
}

#[derive(Default)]
pub struct InMemoryScheduleStore {
    entries: Mutex<Vec<ScheduleEntry>>,
    next_id: AtomicU64,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScheduleStore for InMemoryScheduleStore {
    fn add(&self, conversation_id: &ConversationId, trigger: Trigger, text: &str) -> ScheduleEntry {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let prefix = match trigger {
            Trigger::At { .. } => "rem",
            Trigger::Cron { .. } => "cron",
        };
        let entry = ScheduleEntry {
            id: format!("{prefix}_{n}"),
            conversation_id: conversation_id.clone(),
            trigger,
            text: text.to_string(),
            created_at: Utc::now(),
        };
        self.entries.lock().push(entry.clone());
        entry
    }

    fn list(&self, conversation_id: &ConversationId) -> Vec<ScheduleEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| &e.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    fn remove(&self, conversation_id: &ConversationId, id: &str) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| !(e.id == id && &e.conversation_id == conversation_id));
        entries.len() != before
    }
}

/// (name, min, max) for each cron field, in order.
const CRON_FIELDS: [(&str, u32, u32); 5] = [
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("day of month", 1, 31),
    ("month", 1, 12),
    ("day of week", 0, 7),
];

static CRON_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\*|(\d+)(?:-(\d+))?)(?:/(\d+))?$").unwrap());

/// Syntactic check of a five-field cron expression with numeric ranges.
pub fn validate_cron(expression: &str) -> Result<(), String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!("expected 5 fields, got {}", fields.len()));
    }
    for (field, (name, min, max)) in fields.iter().zip(CRON_FIELDS) {
        for item in field.split(',') {
            let caps = CRON_ITEM
                .captures(item)
                .ok_or_else(|| format!("invalid {name} field: {field}"))?;
            let in_range = |m: Option<regex::Match<'_>>| {
                m.map_or(true, |m| m.as_str().parse::<u32>().is_ok_and(|v| (min..=max).contains(&v)))
            };
            if !in_range(caps.get(2)) || !in_range(caps.get(3)) {
                return Err(format!("{name} out of range {min}-{max}: {item}"));
            }
            if let (Some(lo), Some(hi)) = (caps.get(2), caps.get(3)) {
                if lo.as_str().parse::<u32>().ok() > hi.as_str().parse::<u32>().ok() {
                    return Err(format!("inverted {name} range: {item}"));
                }
            }
            if caps.get(4).is_some_and(|step| step.as_str().parse::<u32>().map_or(true, |s| s == 0)) {
                return Err(format!("invalid {name} step: {item}"));
            }
        }
    }
    Ok(())
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args[key]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("{key} is required")))
}

fn action_arg(args: &Value) -> Result<&str, ToolError> {
    str_arg(args, "action")
}

fn render(entries: &[ScheduleEntry]) -> ToolResult {
    ToolResult::json(&serde_json::to_value(entries).unwrap_or(Value::Null))
}

fn remove(store: &dyn ScheduleStore, args: &Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
    let id = str_arg(args, "id")?;
    if store.remove(&ctx.conversation_id, id) {
        Ok(ToolResult::success(format!("Removed {id}")))
    } else {
        Err(ToolError::InvalidArguments(format!("no schedule entry {id}")))
    }
}

pub struct RemindersTool {
    store: Arc<dyn ScheduleStore>,
}

impl RemindersTool {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for RemindersTool {
    fn name(&self) -> &str {
        "reminders"
    }

    fn description(&self) -> &str {
        "Add, list or remove one-shot reminders for this conversation."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["action"],
            "properties": {
                "action": {"type": "string", "enum": ["add", "list", "remove"]},
                "at": {"type": "string", "description": "RFC 3339 time, e.g. 2026-01-01T09:00:00Z"},
                "text": {"type": "string"},
                "id": {"type": "string"}
            }
        })
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        match action_arg(&args)? {
            "add" => {
                let at = DateTime::parse_from_rfc3339(str_arg(&args, "at")?)
                    .map_err(|e| ToolError::InvalidArguments(format!("at: {e}")))?
                    .with_timezone(&Utc);
                if at <= Utc::now() {
                    return Err(ToolError::InvalidArguments("at must be in the future".into()));
                }
                let entry = self.store.add(&ctx.conversation_id, Trigger::At { at }, str_arg(&args, "text")?);
                Ok(ToolResult::success(format!("Reminder {} set for {}", entry.id, at.to_rfc3339())))
            }
            "list" => {
                let entries: Vec<_> = self
                    .store
                    .list(&ctx.conversation_id)
                    .into_iter()
                    .filter(|e| !e.is_cron())
                    .collect();
                Ok(render(&entries))
            }
            "remove" => remove(self.store.as_ref(), &args, ctx),
            other => Err(ToolError::InvalidArguments(format!("unknown action: {other}"))),
        }
    }
}

pub struct CronTool {
    store: Arc<dyn ScheduleStore>,
}

impl CronTool {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &str {
        "cron"
    }

    fn description(&self) -> &str {
        "Add, list or remove recurring jobs (standard 5-field cron syntax) for this conversation."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "required": ["action"],
            "properties": {
                "action": {"type": "string", "enum": ["add", "list", "remove"]},
                "expression": {"type": "string", "description": "e.g. `0 9 * * 1-5`"},
                "text": {"type": "string"},
                "id": {"type": "string"}
            }
        })
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sequential
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        match action_arg(&args)? {
            "add" => {
                let expression = str_arg(&args, "expression")?.trim();
                validate_cron(expression).map_err(ToolError::InvalidArguments)?;
                let entry = self.store.add(
                    &ctx.conversation_id,
                    Trigger::Cron {
                        expression: expression.to_string(),
                    },
                    str_arg(&args, "text")?,
                );
                Ok(ToolResult::success(format!("Cron job {} added ({expression})", entry.id)))
            }
            "list" => {
                let entries: Vec<_> = self
                    .store
                    .list(&ctx.conversation_id)
                    .into_iter()
                    .filter(ScheduleEntry::is_cron)
                    .collect();
                Ok(render(&entries))
            }
            "remove" => remove(self.store.as_ref(), &args, ctx),
            other => Err(ToolError::InvalidArguments(format!("unknown action: {other}"))),
        }
    }
}
