use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};

use super::models::*;
use crate::ledger::models::{ActionKey, ActionRecord, ActionStatus, ActionUpdate};
use crate::sandbox::models::{SandboxRecord, SandboxStatus};
use crate::util::{format_ts, parse_ts};

/// Async-safe handle to the studio database.
///
/// Wraps `StudioDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StudioDb>>,
}

impl DbHandle {
    pub fn new(db: StudioDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self::new(StudioDb::new(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(StudioDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StudioDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used by CLI one-shots,
    /// startup and tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, StudioDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct StudioDb {
    conn: Connection,
}

const ACTION_COLUMNS: &str = "id, project_id, workflow_id, key, label, detail, metadata, status, attempt, started_at, completed_at, error";
const SANDBOX_COLUMNS: &str = "project_id, sandbox_id, url, status, generation, last_active_at, status_changed_at, expires_at, last_synced_fragment_id, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, project_id, role, kind, content, workflow_id, fragment_id, created_at";
const FRAGMENT_COLUMNS: &str =
    "id, project_id, message_id, sandbox_url, title, summary, files, created_at";
const RUN_COLUMNS: &str = "workflow_id, project_id, message_id, status, input, output, error, started_at, completed_at";

impl StudioDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    role TEXT NOT NULL,
                    kind TEXT NOT NULL DEFAULT 'result',
                    content TEXT NOT NULL,
                    workflow_id TEXT,
                    fragment_id TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS fragments (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                    sandbox_url TEXT NOT NULL,
                    title TEXT NOT NULL,
                    summary TEXT NOT NULL,
                    files TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS conversation_summaries (
                    project_id TEXT PRIMARY KEY,
                    entries TEXT NOT NULL DEFAULT '[]',
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sandboxes (
                    project_id TEXT PRIMARY KEY,
                    sandbox_id TEXT NOT NULL,
                    url TEXT NOT NULL,
                    status TEXT NOT NULL,
                    generation INTEGER NOT NULL DEFAULT 1,
                    last_active_at TEXT NOT NULL,
                    status_changed_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL,
                    last_synced_fragment_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS actions (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    workflow_id TEXT NOT NULL,
                    key TEXT NOT NULL,
                    label TEXT NOT NULL,
                    detail TEXT,
                    metadata TEXT,
                    status TEXT NOT NULL,
                    attempt INTEGER NOT NULL DEFAULT 1,
                    started_at TEXT NOT NULL,
                    completed_at TEXT,
                    error TEXT
                );

                CREATE TABLE IF NOT EXISTS workflow_runs (
                    workflow_id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    message_id TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    input TEXT NOT NULL,
                    output TEXT,
                    error TEXT,
                    started_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS workflow_steps (
                    workflow_id TEXT NOT NULL,
                    step TEXT NOT NULL,
                    output TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 1,
                    completed_at TEXT NOT NULL,
                    PRIMARY KEY (workflow_id, step)
                );

                CREATE INDEX IF NOT EXISTS idx_messages_project ON messages(project_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_messages_workflow ON messages(workflow_id);
                CREATE INDEX IF NOT EXISTS idx_fragments_project ON fragments(project_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_sandboxes_sandbox_id ON sandboxes(sandbox_id);
                CREATE INDEX IF NOT EXISTS idx_actions_project ON actions(project_id, started_at);
                CREATE INDEX IF NOT EXISTS idx_actions_workflow ON actions(workflow_id, key);
                CREATE INDEX IF NOT EXISTS idx_workflow_runs_status ON workflow_runs(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Actions ───────────────────────────────────────────────────────

    pub fn insert_action(&self, rec: &ActionRecord) -> Result<()> {
        let metadata = rec.metadata.as_ref().map(|m| m.to_string());
        self.conn
            .execute(
                "INSERT INTO actions (id, project_id, workflow_id, key, label, detail, metadata, status, attempt, started_at, completed_at, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    rec.id,
                    rec.project_id,
                    rec.workflow_id,
                    rec.key.as_str(),
                    rec.label,
                    rec.detail,
                    metadata,
                    rec.status.as_str(),
                    rec.attempt,
                    format_ts(&rec.started_at),
                    rec.completed_at.as_ref().map(format_ts),
                    rec.error,
                ],
            )
            .context("Failed to insert action")?;
        Ok(())
    }

    pub fn get_action(&self, id: &str) -> Result<Option<ActionRecord>> {
        let sql = format!("SELECT {ACTION_COLUMNS} FROM actions WHERE id = ?1");
        Ok(self.query_actions(&sql, params![id])?.into_iter().next())
    }

    /// The single record for a workflow-level step, if one exists.
    pub fn find_step_action(&self, workflow_id: &str, key: ActionKey) -> Result<Option<ActionRecord>> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM actions WHERE workflow_id = ?1 AND key = ?2
             ORDER BY started_at DESC, rowid DESC LIMIT 1"
        );
        Ok(self
            .query_actions(&sql, params![workflow_id, key.as_str()])?
            .into_iter()
            .next())
    }

    /// Reopen a step record for a retry attempt.
    pub fn restart_action(
        &self,
        id: &str,
        attempt: u32,
        detail: Option<&str>,
        started_at: &DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE actions SET status = 'RUNNING', attempt = ?2, detail = COALESCE(?3, detail),
                 started_at = ?4, completed_at = NULL, error = NULL WHERE id = ?1",
                params![id, attempt, detail, format_ts(started_at)],
            )
            .context("Failed to restart action")?;
        Ok(())
    }

    /// Move a RUNNING record to a terminal status. Returns false when the
    /// record is gone or already terminal.
    pub fn finish_action(
        &self,
        id: &str,
        status: ActionStatus,
        update: &ActionUpdate,
        error: Option<&str>,
        completed_at: &DateTime<Utc>,
    ) -> Result<bool> {
        let metadata = update.metadata.as_ref().map(|m| m.to_string());
        let changed = self
            .conn
            .execute(
                "UPDATE actions SET status = ?2, detail = COALESCE(?3, detail), metadata = COALESCE(?4, metadata),
                 error = ?5, completed_at = ?6
                 WHERE id = ?1 AND status = 'RUNNING'",
                params![
                    id,
                    status.as_str(),
                    update.detail,
                    metadata,
                    error,
                    format_ts(completed_at)
                ],
            )
            .context("Failed to finish action")?;
        Ok(changed > 0)
    }

    pub fn list_actions(&self, project_id: &str) -> Result<Vec<ActionRecord>> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM actions WHERE project_id = ?1 ORDER BY started_at ASC, rowid ASC"
        );
        self.query_actions(&sql, params![project_id])
    }

    pub fn list_workflow_actions(&self, workflow_id: &str) -> Result<Vec<ActionRecord>> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM actions WHERE workflow_id = ?1 ORDER BY started_at ASC, rowid ASC"
        );
        self.query_actions(&sql, params![workflow_id])
    }

    pub fn delete_project_actions(&self, project_id: &str) -> Result<usize> {
        self.conn
            .execute("DELETE FROM actions WHERE project_id = ?1", params![project_id])
            .context("Failed to delete project actions")
    }

    /// Drop every record of the project that belongs to another workflow.
    pub fn delete_superseded_actions(&self, project_id: &str, keep_workflow_id: &str) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM actions WHERE project_id = ?1 AND workflow_id != ?2",
                params![project_id, keep_workflow_id],
            )
            .context("Failed to delete superseded actions")
    }

    pub fn fail_running_actions(
        &self,
        workflow_id: &str,
        reason: &str,
        now: &DateTime<Utc>,
    ) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE actions SET status = 'FAILED', error = ?2, completed_at = ?3
                 WHERE workflow_id = ?1 AND status = 'RUNNING'",
                params![workflow_id, reason, format_ts(now)],
            )
            .context("Failed to fail running actions")
    }

    /// Like [`fail_running_actions`](Self::fail_running_actions), limited to
    /// tool-call records; step records stay with their owner.
    pub fn fail_running_tool_actions(
        &self,
        workflow_id: &str,
        reason: &str,
        now: &DateTime<Utc>,
    ) -> Result<usize> {
        let keys = ActionKey::TOOLS
            .iter()
            .map(|k| format!("'{}'", k.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE actions SET status = 'FAILED', error = ?2, completed_at = ?3
             WHERE workflow_id = ?1 AND status = 'RUNNING' AND key IN ({})",
            keys
        );
        self.conn
            .execute(&sql, params![workflow_id, reason, format_ts(now)])
            .context("Failed to fail running tool actions")
    }

    fn query_actions<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<ActionRecord>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare action query")?;
        let rows = stmt
            .query_map(params, ActionRow::from_row)
            .context("Failed to query actions")?;
        let mut actions = Vec::new();
        for row in rows {
            let r = row.context("Failed to read action row")?;
            actions.push(r.into_action()?);
        }
        Ok(actions)
    }

    // ── Sandboxes ─────────────────────────────────────────────────────

    pub fn get_sandbox(&self, project_id: &str) -> Result<Option<SandboxRecord>> {
        let sql = format!("SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE project_id = ?1");
        Ok(self.query_sandboxes(&sql, params![project_id])?.into_iter().next())
    }

    pub fn find_sandbox_by_id(&self, sandbox_id: &str) -> Result<Option<SandboxRecord>> {
        let sql = format!("SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE sandbox_id = ?1");
        Ok(self.query_sandboxes(&sql, params![sandbox_id])?.into_iter().next())
    }

    pub fn list_sandboxes(&self) -> Result<Vec<SandboxRecord>> {
        let sql = format!("SELECT {SANDBOX_COLUMNS} FROM sandboxes ORDER BY project_id");
        self.query_sandboxes(&sql, [])
    }

    pub fn list_sandboxes_in(&self, statuses: &[SandboxStatus]) -> Result<Vec<SandboxRecord>> {
        let sql = format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE status IN ({}) ORDER BY project_id",
            status_list(statuses)
        );
        self.query_sandboxes(&sql, [])
    }

    /// Install a freshly created sandbox as the project's record.
    ///
    /// With `expected_generation = None` the insert only succeeds when the
    /// project has no record yet; otherwise the row is replaced only if its
    /// generation still equals the one observed. Returns false when another
    /// writer got there first.
    pub fn install_sandbox(
        &self,
        rec: &SandboxRecord,
        expected_generation: Option<i64>,
    ) -> Result<bool> {
        let changed = match expected_generation {
            None => self
                .conn
                .execute(
                    "INSERT OR IGNORE INTO sandboxes (project_id, sandbox_id, url, status, generation, last_active_at, status_changed_at, expires_at, last_synced_fragment_id, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        rec.project_id,
                        rec.sandbox_id,
                        rec.url,
                        rec.status.as_str(),
                        rec.generation,
                        format_ts(&rec.last_active_at),
                        format_ts(&rec.status_changed_at),
                        format_ts(&rec.expires_at),
                        rec.last_synced_fragment_id,
                        format_ts(&rec.created_at),
                        format_ts(&rec.updated_at),
                    ],
                )
                .context("Failed to insert sandbox")?,
            Some(generation) => self
                .conn
                .execute(
                    "UPDATE sandboxes SET sandbox_id = ?2, url = ?3, status = ?4, generation = ?5,
                     last_active_at = ?6, status_changed_at = ?7, expires_at = ?8,
                     last_synced_fragment_id = ?9, updated_at = ?10
                     WHERE project_id = ?1 AND generation = ?11",
                    params![
                        rec.project_id,
                        rec.sandbox_id,
                        rec.url,
                        rec.status.as_str(),
                        rec.generation,
                        format_ts(&rec.last_active_at),
                        format_ts(&rec.status_changed_at),
                        format_ts(&rec.expires_at),
                        rec.last_synced_fragment_id,
                        format_ts(&rec.updated_at),
                        generation,
                    ],
                )
                .context("Failed to replace sandbox")?,
        };
        Ok(changed > 0)
    }

    /// Record a successful connect: the sandbox is RUNNING and active now.
    pub fn mark_sandbox_connected(
        &self,
        project_id: &str,
        sandbox_id: &str,
        url: &str,
        now: &DateTime<Utc>,
        expires_at: &DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE sandboxes SET url = ?3, status = 'RUNNING',
             status_changed_at = CASE WHEN status = 'RUNNING' THEN status_changed_at ELSE ?4 END,
             last_active_at = MAX(last_active_at, ?4), expires_at = MAX(expires_at, ?5), updated_at = ?4
             WHERE project_id = ?1 AND sandbox_id = ?2 AND status NOT IN ({})",
            status_list(&SandboxStatus::TERMINAL)
        );
        let changed = self
            .conn
            .execute(
                &sql,
                params![project_id, sandbox_id, url, format_ts(now), format_ts(expires_at)],
            )
            .context("Failed to mark sandbox connected")?;
        Ok(changed > 0)
    }

    /// Advance `last_active_at`. Never moves it backwards.
    pub fn touch_sandbox(
        &self,
        project_id: &str,
        sandbox_id: &str,
        now: &DateTime<Utc>,
        expires_at: &DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE sandboxes SET last_active_at = ?3, expires_at = MAX(expires_at, ?4), updated_at = ?3
             WHERE project_id = ?1 AND sandbox_id = ?2 AND last_active_at <= ?3
               AND status NOT IN ({})",
            status_list(&SandboxStatus::TERMINAL)
        );
        let changed = self
            .conn
            .execute(
                &sql,
                params![project_id, sandbox_id, format_ts(now), format_ts(expires_at)],
            )
            .context("Failed to touch sandbox")?;
        Ok(changed > 0)
    }

    /// Conditional status change on a specific `sandbox_id`.
    ///
    /// `from` empty means any current status. With `reject_older_than`, the
    /// write is refused when the record has been stamped after that instant.
    pub fn transition_sandbox(
        &self,
        project_id: &str,
        sandbox_id: &str,
        from: &[SandboxStatus],
        to: SandboxStatus,
        at: &DateTime<Utc>,
        reject_older_than: Option<&DateTime<Utc>>,
    ) -> Result<bool> {
        let mut sql = String::from(
            "UPDATE sandboxes SET status = ?3, status_changed_at = MAX(status_changed_at, ?4), updated_at = ?4
             WHERE project_id = ?1 AND sandbox_id = ?2",
        );
        if !from.is_empty() {
            sql.push_str(&format!(" AND status IN ({})", status_list(from)));
        }
        let guard = reject_older_than.map(format_ts);
        if guard.is_some() {
            sql.push_str(" AND last_active_at <= ?5 AND status_changed_at <= ?5");
        } else {
            sql.push_str(" AND ?5 IS NULL");
        }
        let changed = self
            .conn
            .execute(
                &sql,
                params![project_id, sandbox_id, to.as_str(), format_ts(at), guard],
            )
            .context("Failed to transition sandbox")?;
        Ok(changed > 0)
    }

    /// Pause only if nothing touched the record since the sweep observed it.
    pub fn pause_sandbox_if_idle(
        &self,
        project_id: &str,
        sandbox_id: &str,
        observed_last_active: &DateTime<Utc>,
        now: &DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE sandboxes SET status = 'PAUSED', status_changed_at = ?4, updated_at = ?4
                 WHERE project_id = ?1 AND sandbox_id = ?2 AND last_active_at = ?3
                   AND status IN ('RUNNING', 'STARTING')",
                params![
                    project_id,
                    sandbox_id,
                    format_ts(observed_last_active),
                    format_ts(now)
                ],
            )
            .context("Failed to pause sandbox")?;
        Ok(changed > 0)
    }

    pub fn set_sandbox_synced(
        &self,
        project_id: &str,
        sandbox_id: &str,
        fragment_id: Option<&str>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE sandboxes SET last_synced_fragment_id = ?3 WHERE project_id = ?1 AND sandbox_id = ?2",
                params![project_id, sandbox_id, fragment_id],
            )
            .context("Failed to record synced fragment")?;
        Ok(changed > 0)
    }

    fn query_sandboxes<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<SandboxRecord>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare sandbox query")?;
        let rows = stmt
            .query_map(params, SandboxRow::from_row)
            .context("Failed to query sandboxes")?;
        let mut sandboxes = Vec::new();
        for row in rows {
            let r = row.context("Failed to read sandbox row")?;
            sandboxes.push(r.into_sandbox()?);
        }
        Ok(sandboxes)
    }

    // ── Messages & fragments ──────────────────────────────────────────

    pub fn create_user_message(&self, project_id: &str, content: &str) -> Result<Message> {
        let msg = Message {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            role: MessageRole::User,
            kind: MessageKind::Result,
            content: content.to_string(),
            workflow_id: None,
            fragment_id: None,
            created_at: Utc::now(),
        };
        insert_message(&self.conn, &msg)?;
        Ok(msg)
    }

    /// Write the assistant message (and fragment) for a workflow.
    ///
    /// Any earlier assistant output of the same workflow is replaced, so a
    /// replayed `SAVE_RESULT` never produces a second message.
    pub fn save_workflow_result(
        &self,
        project_id: &str,
        workflow_id: &str,
        kind: MessageKind,
        content: &str,
        fragment: Option<&NewFragment>,
    ) -> Result<(Message, Option<Fragment>)> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        tx.execute(
            "DELETE FROM fragments WHERE message_id IN
             (SELECT id FROM messages WHERE workflow_id = ?1 AND role = 'assistant')",
            params![workflow_id],
        )
        .context("Failed to clear previous fragment")?;
        tx.execute(
            "DELETE FROM messages WHERE workflow_id = ?1 AND role = 'assistant'",
            params![workflow_id],
        )
        .context("Failed to clear previous result message")?;

        let now = Utc::now();
        let message_id = uuid::Uuid::new_v4().to_string();
        let fragment = fragment.map(|f| Fragment {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            message_id: message_id.clone(),
            sandbox_url: f.sandbox_url.clone(),
            title: f.title.clone(),
            summary: f.summary.clone(),
            files: f.files.clone(),
            created_at: now,
        });
        let msg = Message {
            id: message_id,
            project_id: project_id.to_string(),
            role: MessageRole::Assistant,
            kind,
            content: content.to_string(),
            workflow_id: Some(workflow_id.to_string()),
            fragment_id: fragment.as_ref().map(|f| f.id.clone()),
            created_at: now,
        };
        insert_message(&tx, &msg)?;
        if let Some(f) = &fragment {
            let files = serde_json::to_string(&f.files).context("Failed to serialize fragment files")?;
            tx.execute(
                "INSERT INTO fragments (id, project_id, message_id, sandbox_url, title, summary, files, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    f.id,
                    f.project_id,
                    f.message_id,
                    f.sandbox_url,
                    f.title,
                    f.summary,
                    files,
                    format_ts(&f.created_at)
                ],
            )
            .context("Failed to insert fragment")?;
        }

        tx.commit().context("Failed to commit workflow result")?;
        Ok((msg, fragment))
    }

    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        Ok(self.query_messages(&sql, params![id])?.into_iter().next())
    }

    pub fn list_messages(&self, project_id: &str) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE project_id = ?1 ORDER BY created_at ASC, rowid ASC"
        );
        self.query_messages(&sql, params![project_id])
    }

    /// The newest `limit` messages of a project, oldest first.
    pub fn recent_messages(&self, project_id: &str, limit: usize) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE project_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2"
        );
        let mut messages = self.query_messages(&sql, params![project_id, limit as i64])?;
        messages.reverse();
        Ok(messages)
    }

    pub fn find_workflow_result(&self, workflow_id: &str) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE workflow_id = ?1 AND role = 'assistant'"
        );
        Ok(self.query_messages(&sql, params![workflow_id])?.into_iter().next())
    }

    pub fn get_fragment(&self, id: &str) -> Result<Option<Fragment>> {
        let sql = format!("SELECT {FRAGMENT_COLUMNS} FROM fragments WHERE id = ?1");
        Ok(self.query_fragments(&sql, params![id])?.into_iter().next())
    }

    pub fn latest_fragment(&self, project_id: &str) -> Result<Option<Fragment>> {
        let sql = format!(
            "SELECT {FRAGMENT_COLUMNS} FROM fragments WHERE project_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        );
        Ok(self.query_fragments(&sql, params![project_id])?.into_iter().next())
    }

    fn query_messages<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Message>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare message query")?;
        let rows = stmt
            .query_map(params, MessageRow::from_row)
            .context("Failed to query messages")?;
        let mut messages = Vec::new();
        for row in rows {
            let r = row.context("Failed to read message row")?;
            messages.push(r.into_message()?);
        }
        Ok(messages)
    }

    fn query_fragments<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Fragment>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare fragment query")?;
        let rows = stmt
            .query_map(params, FragmentRow::from_row)
            .context("Failed to query fragments")?;
        let mut fragments = Vec::new();
        for row in rows {
            let r = row.context("Failed to read fragment row")?;
            fragments.push(r.into_fragment()?);
        }
        Ok(fragments)
    }

    // ── Rolling summaries ─────────────────────────────────────────────

    pub fn get_rolling_summary(&self, project_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT entries FROM conversation_summaries WHERE project_id = ?1")
            .context("Failed to prepare get_rolling_summary")?;
        let mut rows = stmt
            .query_map(params![project_id], |row| row.get::<_, String>(0))
            .context("Failed to query rolling summary")?;
        match rows.next() {
            Some(row) => {
                let raw = row.context("Failed to read rolling summary row")?;
                serde_json::from_str(&raw).context("Failed to parse rolling summary JSON")
            }
            None => Ok(Vec::new()),
        }
    }

    pub fn set_rolling_summary(&self, project_id: &str, entries: &[String]) -> Result<()> {
        let raw = serde_json::to_string(entries).context("Failed to serialize rolling summary")?;
        self.conn
            .execute(
                "INSERT INTO conversation_summaries (project_id, entries, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(project_id) DO UPDATE SET entries = excluded.entries, updated_at = excluded.updated_at",
                params![project_id, raw, format_ts(&Utc::now())],
            )
            .context("Failed to store rolling summary")?;
        Ok(())
    }

    // ── Workflow runs & step checkpoints ──────────────────────────────

    /// Register a run. Returns false if the workflow id already exists.
    pub fn create_workflow_run(&self, run: &WorkflowRun) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO workflow_runs (workflow_id, project_id, message_id, status, input, output, error, started_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run.workflow_id,
                    run.project_id,
                    run.message_id,
                    run.status.as_str(),
                    run.input.to_string(),
                    run.output.as_ref().map(|o| o.to_string()),
                    run.error,
                    format_ts(&run.started_at),
                    run.completed_at.as_ref().map(format_ts),
                ],
            )
            .context("Failed to insert workflow run")?;
        Ok(changed > 0)
    }

    pub fn get_workflow_run(&self, workflow_id: &str) -> Result<Option<WorkflowRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE workflow_id = ?1");
        Ok(self.query_runs(&sql, params![workflow_id])?.into_iter().next())
    }

    pub fn list_workflow_runs(&self, status: RunStatus) -> Result<Vec<WorkflowRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE status = ?1 ORDER BY started_at ASC"
        );
        self.query_runs(&sql, params![status.as_str()])
    }

    /// Close a running workflow. Returns false if it was already closed.
    pub fn finish_workflow_run(
        &self,
        workflow_id: &str,
        status: RunStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE workflow_runs SET status = ?2, output = ?3, error = ?4, completed_at = ?5
                 WHERE workflow_id = ?1 AND status = 'running'",
                params![
                    workflow_id,
                    status.as_str(),
                    output.map(|o| o.to_string()),
                    error,
                    format_ts(&Utc::now())
                ],
            )
            .context("Failed to finish workflow run")?;
        Ok(changed > 0)
    }

    pub fn get_step_checkpoint(&self, workflow_id: &str, step: &str) -> Result<Option<StepCheckpoint>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT workflow_id, step, output, attempts, completed_at FROM workflow_steps
                 WHERE workflow_id = ?1 AND step = ?2",
            )
            .context("Failed to prepare get_step_checkpoint")?;
        let mut rows = stmt
            .query_map(params![workflow_id, step], StepRow::from_row)
            .context("Failed to query step checkpoint")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read step checkpoint row")?;
                Ok(Some(r.into_checkpoint()?))
            }
            None => Ok(None),
        }
    }

    pub fn save_step_checkpoint(&self, cp: &StepCheckpoint) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO workflow_steps (workflow_id, step, output, attempts, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    cp.workflow_id,
                    cp.step,
                    cp.output.to_string(),
                    cp.attempts,
                    format_ts(&cp.completed_at)
                ],
            )
            .context("Failed to save step checkpoint")?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn drop_actions_table_for_test(&self) -> Result<()> {
        self.conn.execute_batch("DROP TABLE actions;")?;
        Ok(())
    }

    fn query_runs<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<WorkflowRun>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare workflow run query")?;
        let rows = stmt
            .query_map(params, RunRow::from_row)
            .context("Failed to query workflow runs")?;
        let mut runs = Vec::new();
        for row in rows {
            let r = row.context("Failed to read workflow run row")?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }
}

fn insert_message(conn: &Connection, msg: &Message) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, project_id, role, kind, content, workflow_id, fragment_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            msg.id,
            msg.project_id,
            msg.role.as_str(),
            msg.kind.as_str(),
            msg.content,
            msg.workflow_id,
            msg.fragment_id,
            format_ts(&msg.created_at)
        ],
    )
    .context("Failed to insert message")?;
    Ok(())
}

/// Inline SQL list of status literals. Values come from the enum, never
/// from user input.
fn status_list(statuses: &[SandboxStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str, what: &str) -> Result<T> {
    T::from_str(raw)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {}", what))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

// ── Internal row helpers ──────────────────────────────────────────────

struct ActionRow {
    id: String,
    project_id: String,
    workflow_id: String,
    key: String,
    label: String,
    detail: Option<String>,
    metadata: Option<String>,
    status: String,
    attempt: u32,
    started_at: String,
    completed_at: Option<String>,
    error: Option<String>,
}

impl ActionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            workflow_id: row.get(2)?,
            key: row.get(3)?,
            label: row.get(4)?,
            detail: row.get(5)?,
            metadata: row.get(6)?,
            status: row.get(7)?,
            attempt: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
            error: row.get(11)?,
        })
    }

    fn into_action(self) -> Result<ActionRecord> {
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse action metadata JSON")?;
        Ok(ActionRecord {
            id: self.id,
            project_id: self.project_id,
            workflow_id: self.workflow_id,
            key: parse_enum(&self.key, "action key")?,
            label: self.label,
            detail: self.detail,
            metadata,
            status: parse_enum(&self.status, "action status")?,
            attempt: self.attempt,
            started_at: parse_ts(&self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            error: self.error,
        })
    }
}

struct SandboxRow {
    project_id: String,
    sandbox_id: String,
    url: String,
    status: String,
    generation: i64,
    last_active_at: String,
    status_changed_at: String,
    expires_at: String,
    last_synced_fragment_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SandboxRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project_id: row.get(0)?,
            sandbox_id: row.get(1)?,
            url: row.get(2)?,
            status: row.get(3)?,
            generation: row.get(4)?,
            last_active_at: row.get(5)?,
            status_changed_at: row.get(6)?,
            expires_at: row.get(7)?,
            last_synced_fragment_id: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_sandbox(self) -> Result<SandboxRecord> {
        Ok(SandboxRecord {
            project_id: self.project_id,
            sandbox_id: self.sandbox_id,
            url: self.url,
            status: parse_enum(&self.status, "sandbox status")?,
            generation: self.generation,
            last_active_at: parse_ts(&self.last_active_at)?,
            status_changed_at: parse_ts(&self.status_changed_at)?,
            expires_at: parse_ts(&self.expires_at)?,
            last_synced_fragment_id: self.last_synced_fragment_id,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct MessageRow {
    id: String,
    project_id: String,
    role: String,
    kind: String,
    content: String,
    workflow_id: Option<String>,
    fragment_id: Option<String>,
    created_at: String,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            role: row.get(2)?,
            kind: row.get(3)?,
            content: row.get(4)?,
            workflow_id: row.get(5)?,
            fragment_id: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: self.id,
            project_id: self.project_id,
            role: parse_enum(&self.role, "message role")?,
            kind: parse_enum(&self.kind, "message kind")?,
            content: self.content,
            workflow_id: self.workflow_id,
            fragment_id: self.fragment_id,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct FragmentRow {
    id: String,
    project_id: String,
    message_id: String,
    sandbox_url: String,
    title: String,
    summary: String,
    files: String,
    created_at: String,
}

impl FragmentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            message_id: row.get(2)?,
            sandbox_url: row.get(3)?,
            title: row.get(4)?,
            summary: row.get(5)?,
            files: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_fragment(self) -> Result<Fragment> {
        Ok(Fragment {
            id: self.id,
            project_id: self.project_id,
            message_id: self.message_id,
            sandbox_url: self.sandbox_url,
            title: self.title,
            summary: self.summary,
            files: serde_json::from_str(&self.files).context("Failed to parse fragment files JSON")?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct RunRow {
    workflow_id: String,
    project_id: String,
    message_id: String,
    status: String,
    input: String,
    output: Option<String>,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            workflow_id: row.get(0)?,
            project_id: row.get(1)?,
            message_id: row.get(2)?,
            status: row.get(3)?,
            input: row.get(4)?,
            output: row.get(5)?,
            error: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun> {
        Ok(WorkflowRun {
            workflow_id: self.workflow_id,
            project_id: self.project_id,
            message_id: self.message_id,
            status: parse_enum(&self.status, "run status")?,
            input: serde_json::from_str(&self.input).context("Failed to parse run input JSON")?,
            output: self
                .output
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Failed to parse run output JSON")?,
            error: self.error,
            started_at: parse_ts(&self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

struct StepRow {
    workflow_id: String,
    step: String,
    output: String,
    attempts: u32,
    completed_at: String,
}

impl StepRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            workflow_id: row.get(0)?,
            step: row.get(1)?,
            output: row.get(2)?,
            attempts: row.get(3)?,
            completed_at: row.get(4)?,
        })
    }

    fn into_checkpoint(self) -> Result<StepCheckpoint> {
        Ok(StepCheckpoint {
            workflow_id: self.workflow_id,
            step: self.step,
            output: serde_json::from_str(&self.output).context("Failed to parse step output JSON")?,
            attempts: self.attempts,
            completed_at: parse_ts(&self.completed_at)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
