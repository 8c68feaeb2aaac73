use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    message TEXT NOT NULL,
    fields TEXT,
    conversation_id TEXT,
    provider TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
CREATE INDEX IF NOT EXISTS idx_logs_conversation ON logs(conversation_id);
CREATE INDEX IF NOT EXISTS idx_logs_provider ON logs(provider);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);";

/// A persisted warn+ event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub conversation_id: Option<String>,
    pub provider: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    /// Substring match on the target.
    pub target: Option<String>,
    pub conversation_id: Option<String>,
    pub provider: Option<String>,
    /// RFC 3339 lower bound, inclusive.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite store for warn+ events.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        // Nowhere to report a failed log write; drop it.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, conversation_id, provider)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.conversation_id,
                record.provider,
            ],
        );
    }

    /// Newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, conversation_id, provider
             FROM logs WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();

        let mut filter = |sql: &mut String, clause: &str, value: String| {
            params.push(value);
            sql.push_str(&format!(" AND {clause} ?{}", params.len()));
        };
        if let Some(level) = &q.level {
            filter(&mut sql, "level =", level.to_uppercase());
        }
        if let Some(target) = &q.target {
            filter(&mut sql, "target LIKE", format!("%{target}%"));
        }
        if let Some(conv) = &q.conversation_id {
            filter(&mut sql, "conversation_id =", conv.clone());
        }
        if let Some(provider) = &q.provider {
            filter(&mut sql, "provider =", provider.clone());
        }
        if let Some(since) = &q.since {
            filter(&mut sql, "timestamp >=", since.clone());
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                conversation_id: row.get(6)?,
                provider: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    conversation_id: Option<String>,
    provider: Option<String>,
}

/// tracing layer that writes WARN and ERROR events to a [`SqliteLogSink`].
/// `conversation_id` and `provider` are taken from the event, or else from
/// the nearest enclosing span that recorded them.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    conversation_id: Option<String>,
    provider: Option<String>,
}

impl FieldVisitor {
    fn put(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "conversation_id" => self.conversation_id = Some(value),
            "provider" => self.provider = Some(value),
            other => {
                let _ = self
                    .fields
                    .insert(other.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{value:?}");
        let val = match field.name() {
            "message" => val,
            _ => val.trim_matches('"').to_string(),
        };
        self.put(field.name(), val);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        let _ = self
            .fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        let _ = self
            .fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        let _ = self
            .fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

/// Stored on spans so child events inherit correlation ids.
struct SpanFields {
    conversation_id: Option<String>,
    provider: Option<String>,
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if visitor.conversation_id.is_none() || visitor.provider.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(fields) = extensions.get::<SpanFields>() {
                        if visitor.conversation_id.is_none() {
                            visitor.conversation_id.clone_from(&fields.conversation_id);
                        }
                        if visitor.provider.is_none() {
                            visitor.provider.clone_from(&fields.provider);
                        }
                    }
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            conversation_id: visitor.conversation_id,
            provider: visitor.provider,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if visitor.conversation_id.is_some() || visitor.provider.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanFields {
                    conversation_id: visitor.conversation_id,
                    provider: visitor.provider,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    fn insert(sink: &SqliteLogSink, ts: &str, level: &str, msg: &str, conv: Option<&str>, provider: Option<&str>) {
        sink.insert(&LogInsert {
            timestamp: ts.into(),
            level: level.into(),
            target: "relay_llm::router".into(),
            message: msg.into(),
            fields: None,
            conversation_id: conv.map(String::from),
            provider: provider.map(String::from),
        });
    }

    #[test]
    fn file_backed_sink_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/logs.db");
        let sink = SqliteLogSink::new(&path).unwrap();
        insert(&sink, "2026-01-01T00:00:00Z", "WARN", "x", None, None);
        assert_eq!(sink.count().unwrap(), 1);
        assert!(path.exists());
    }

    #[test]
    fn query_filters_combine() {
        let sink = SqliteLogSink::in_memory().unwrap();
        insert(&sink, "2026-01-01T10:00:00Z", "WARN", "old billing", Some("conv_a"), Some("anthropic"));
        insert(&sink, "2026-01-01T12:00:00Z", "WARN", "billing", Some("conv_a"), Some("anthropic"));
        insert(&sink, "2026-01-01T12:00:01Z", "ERROR", "db", Some("conv_b"), None);
        insert(&sink, "2026-01-01T12:00:02Z", "WARN", "other", None, Some("openai"));

        let by_provider = sink
            .query(&LogQuery {
                provider: Some("anthropic".into()),
                since: Some("2026-01-01T11:00:00Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_provider.len(), 1);
        assert_eq!(by_provider[0].message, "billing");

        let errors = sink
            .query(&LogQuery {
                level: Some("error".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].conversation_id.as_deref(), Some("conv_b"));

        let limited = sink
            .query(&LogQuery {
                limit: Some(2),
                target: Some("router".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].message, "other");
    }

    #[test]
    fn layer_persists_warn_with_span_context() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("turn", conversation_id = "conv_1");
            let _guard = span.enter();
            tracing::info!("not persisted");
            tracing::warn!(provider = "anthropic", reason = "billing", "provider auto-disabled");
            tracing::error!(attempts = 3u64, "all providers unavailable");
        });

        let records = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(records.len(), 2);
        let warn = &records[1];
        assert_eq!(warn.level, "WARN");
        assert_eq!(warn.message, "provider auto-disabled");
        assert_eq!(warn.conversation_id.as_deref(), Some("conv_1"));
        assert_eq!(warn.provider.as_deref(), Some("anthropic"));
        assert!(warn.fields.as_deref().unwrap_or_default().contains("billing"));

        let error = &records[0];
        assert_eq!(error.conversation_id.as_deref(), Some("conv_1"));
        assert!(error.provider.is_none());
        assert!(error.fields.as_deref().unwrap_or_default().contains("\"attempts\":3"));
    }
}
