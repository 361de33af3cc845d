use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use serde::Serialize;
use verbi_core::{Message, Role};
use verbi_observability::Tracer;

/// One persisted chat message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalEntry {
    pub session_id: String,
    pub seq: i64,
    pub created_at_ms: i64,
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at_ms: i64,
    pub last_at_ms: i64,
    pub message_count: i64,
    pub preview: Option<String>,
}

/// SQLite log of every message shown in the shell, grouped by session.
#[derive(Debug, Clone)]
pub struct Journal {
    db_path: PathBuf,
    tracer: Tracer,
}

impl Journal {
    pub fn new(db_path: &Path, tracer: Tracer) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
            tracer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let c = Connection::open(&self.db_path).context("open sqlite failed")?;
        c.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
              session_id TEXT NOT NULL,
              seq INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL,
              role TEXT NOT NULL,
              content TEXT NOT NULL,
              PRIMARY KEY (session_id, seq)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at_ms DESC);
            "#,
        )
        .context("init sqlite schema failed")?;
        Ok(c)
    }

    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        let span = self.tracer.span(
            None,
            "Journal",
            "JOURNAL.append",
            Some(serde_json::json!({
                "session_id": entry.session_id,
                "seq": entry.seq,
                "role": entry.role.as_str(),
                "chars": entry.content.len(),
            })),
        );
        let c = match self.conn() {
            Ok(c) => c,
            Err(e) => {
                span.err_anyhow("db", "E_JOURNAL_CONN", &e, None);
                return Err(e);
            }
        };
        let r = c.execute(
            r#"
            INSERT OR REPLACE INTO messages (session_id, seq, created_at_ms, role, content)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                entry.session_id,
                entry.seq,
                entry.created_at_ms,
                entry.role.as_str(),
                entry.content,
            ],
        );
        match r {
            Ok(_) => {
                span.ok(None);
                Ok(())
            }
            Err(e) => {
                span.err("db", "E_JOURNAL_INSERT", &e.to_string(), None);
                Err(anyhow!(e).context("insert journal entry failed"))
            }
        }
    }

    /// Most recent sessions first.
    pub fn list_sessions(&self, limit: i64) -> Result<Vec<SessionSummary>> {
        let span = self.tracer.span(
            None,
            "Journal",
            "JOURNAL.list_sessions",
            Some(serde_json::json!({"limit": limit})),
        );
        let out = (|| {
            let c = self.conn()?;
            let mut stmt = c
                .prepare(
                    r#"
                    SELECT m.session_id, MIN(m.created_at_ms), MAX(m.created_at_ms), COUNT(*),
                      (SELECT u.content FROM messages u
                        WHERE u.session_id = m.session_id AND u.role = 'user'
                        ORDER BY u.seq ASC LIMIT 1)
                    FROM messages m
                    GROUP BY m.session_id
                    ORDER BY MAX(m.created_at_ms) DESC
                    LIMIT ?1
                    "#,
                )
                .context("prepare session list failed")?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok(SessionSummary {
                        session_id: row.get(0)?,
                        started_at_ms: row.get(1)?,
                        last_at_ms: row.get(2)?,
                        message_count: row.get(3)?,
                        preview: row.get(4)?,
                    })
                })
                .context("query session list failed")?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok::<_, anyhow::Error>(out)
        })();
        match out {
            Ok(v) => {
                span.ok(Some(serde_json::json!({"sessions": v.len()})));
                Ok(v)
            }
            Err(e) => {
                span.err_anyhow("db", "E_JOURNAL_LIST", &e, None);
                Err(e)
            }
        }
    }

    pub fn load_session(&self, session_id: &str) -> Result<Vec<JournalEntry>> {
        let c = self.conn()?;
        let mut stmt = c
            .prepare(
                r#"
                SELECT session_id, seq, created_at_ms, role, content
                FROM messages
                WHERE session_id = ?1
                ORDER BY seq ASC
                "#,
            )
            .context("prepare session load failed")?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                let role: String = row.get(3)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    role,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("query session load failed")?;
        let mut out = Vec::new();
        for r in rows {
            let (session_id, seq, created_at_ms, role, content) = r?;
            let role = Role::parse(&role).ok_or_else(|| anyhow!("unknown role in journal: {role}"))?;
            out.push(JournalEntry {
                session_id,
                seq,
                created_at_ms,
                role,
                content,
            });
        }
        Ok(out)
    }

    pub fn clear(&self) -> Result<()> {
        let span = self.tracer.span(None, "Journal", "JOURNAL.clear", None);
        let r = self
            .conn()
            .and_then(|c| c.execute("DELETE FROM messages", []).context("clear journal failed"));
        match r {
            Ok(n) => {
                span.ok(Some(serde_json::json!({"deleted": n})));
                Ok(())
            }
            Err(e) => {
                span.err_anyhow("db", "E_JOURNAL_CLEAR", &e, None);
                Err(e)
            }
        }
    }
}

pub fn entries_to_messages(entries: &[JournalEntry]) -> Vec<Message> {
    entries
        .iter()
        .map(|e| Message::new(e.role, e.content.clone()))
        .collect()
}
