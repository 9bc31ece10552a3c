use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use scribe_core::ids::SessionId;
use scribe_core::messages::{MessageRecord, Role};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Archived,
    Deleted,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Archived => write!(f, "archived"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Session attributes as stored in the index. The message bodies live in the
/// append-only log; counters here mirror it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: String,
    pub updated_at: String,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub project_path: Option<String>,
    pub model: Option<String>,
    pub message_count: u64,
    pub token_count: u64,
    pub parent_session_id: Option<SessionId>,
    pub branch_point: Option<u64>,
    pub tags: Vec<String>,
    pub status: SessionStatus,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id,
            created_at: now.clone(),
            updated_at: now,
            title: None,
            summary: None,
            project_path: None,
            model: None,
            message_count: 0,
            token_count: 0,
            parent_session_id: None,
            branch_point: None,
            tags: Vec::new(),
            status: SessionStatus::Active,
        }
    }
}

/// Partial update for session attributes. `None` fields are left untouched;
/// `updated_at` is always bumped.
#[derive(Clone, Debug, Default)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub project_path: Option<String>,
    pub model: Option<String>,
    pub tags: Option<Vec<String>>,
    pub status: Option<SessionStatus>,
}

/// One ranked full-text hit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchHit {
    pub session_id: SessionId,
    pub role: Role,
    /// Bounded excerpt around the first match, hit terms wrapped in >>> <<<.
    pub snippet: String,
    pub timestamp: String,
    pub session_title: Option<String>,
    pub project_path: Option<String>,
}

const SESSION_COLUMNS: &str = "id, created_at, updated_at, title, summary, project_path, model, \
     message_count, token_count, parent_session_id, branch_point, tags, status";

/// Structured session attributes plus a searchable mirror of message content.
/// Secondary and derivable: every mirror row corresponds to a log entry, and
/// no mirror row is ever written without one.
pub struct MetadataIndex {
    db: Database,
}

impl MetadataIndex {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a brand-new session row. Returns false (without writing) when
    /// the id is already taken, so the caller can retry with a fresh token.
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub fn insert_session(&self, session: &Session) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let tags = serde_json::to_string(&session.tags)?;
            let result = write_session_row(conn, "INSERT INTO sessions", session, &tags);
            match result {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Create or fully replace a session row.
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub fn upsert_session(&self, session: &Session) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tags = serde_json::to_string(&session.tags)?;
            write_session_row(conn, "INSERT OR REPLACE INTO sessions", session, &tags)?;
            Ok(())
        })
    }

    /// Fetch a session. Absence is a normal outcome, not an error.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Apply a partial update. Fails with NotFound when the session is gone.
    #[instrument(skip(self, patch), fields(session_id = %id))]
    pub fn update_fields(&self, id: &SessionId, patch: &SessionPatch) -> Result<(), StoreError> {
        let mut sets = vec!["updated_at = ?1".to_string()];
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(Utc::now().to_rfc3339())];

        if let Some(title) = &patch.title {
            sets.push(format!("title = ?{}", params.len() + 1));
            params.push(Box::new(title.clone()));
        }
        if let Some(summary) = &patch.summary {
            sets.push(format!("summary = ?{}", params.len() + 1));
            params.push(Box::new(summary.clone()));
        }
        if let Some(project_path) = &patch.project_path {
            sets.push(format!("project_path = ?{}", params.len() + 1));
            params.push(Box::new(project_path.clone()));
        }
        if let Some(model) = &patch.model {
            sets.push(format!("model = ?{}", params.len() + 1));
            params.push(Box::new(model.clone()));
        }
        if let Some(tags) = &patch.tags {
            sets.push(format!("tags = ?{}", params.len() + 1));
            params.push(Box::new(serde_json::to_string(tags)?));
        }
        if let Some(status) = &patch.status {
            sets.push(format!("status = ?{}", params.len() + 1));
            params.push(Box::new(status.to_string()));
        }

        let sql = format!(
            "UPDATE sessions SET {} WHERE id = ?{}",
            sets.join(", "),
            params.len() + 1
        );
        params.push(Box::new(id.as_str().to_string()));

        self.db.with_conn(|conn| {
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let changed = conn.execute(&sql, param_refs.as_slice())?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("session {id}")));
            }
            Ok(())
        })
    }

    /// Mirror one log entry and bump the session counters, as one
    /// transaction. Returns the post-increment message count. Called only
    /// after the corresponding log append succeeded; there is no index-only
    /// write path.
    #[instrument(skip(self, record), fields(session_id = %session_id, sequence))]
    pub fn append_message_index(
        &self,
        session_id: &SessionId,
        sequence: u64,
        record: &MessageRecord,
    ) -> Result<u64, StoreError> {
        let tool_calls = record
            .tool_calls
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let tool_results = record
            .tool_results
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO messages
                 (session_id, sequence, role, content, tool_calls, tool_results, timestamp, token_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    session_id.as_str(),
                    sequence as i64,
                    record.role.to_string(),
                    record.content,
                    tool_calls,
                    tool_results,
                    record.timestamp,
                    record.token_count as i64,
                ],
            )?;
            tx.execute(
                "UPDATE sessions
                 SET message_count = message_count + 1,
                     token_count = token_count + ?1,
                     updated_at = ?2
                 WHERE id = ?3",
                rusqlite::params![
                    record.token_count as i64,
                    Utc::now().to_rfc3339(),
                    session_id.as_str(),
                ],
            )?;
            let count: i64 = tx.query_row(
                "SELECT message_count FROM sessions WHERE id = ?1",
                [session_id.as_str()],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(count as u64)
        })
    }

    /// List sessions by status, newest activity first.
    #[instrument(skip(self), fields(status = %status))]
    pub fn query_sessions(
        &self,
        status: SessionStatus,
        project_path: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE status = ?1");
            let mut params: Vec<Box<dyn rusqlite::types::ToSql>> =
                vec![Box::new(status.to_string())];

            if let Some(project_path) = project_path {
                sql.push_str(&format!(" AND project_path = ?{}", params.len() + 1));
                params.push(Box::new(project_path.to_string()));
            }
            sql.push_str(&format!(" ORDER BY updated_at DESC LIMIT ?{}", params.len() + 1));
            params.push(Box::new(limit as i64));

            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(param_refs.as_slice())?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
    }

    /// Full-text search over mirrored message content. `query` is FTS5
    /// syntax. Ordering is bm25 rank with rowid as tiebreak, so identical
    /// query + index state always returns the same ranked order.
    #[instrument(skip(self))]
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT
                   m.session_id,
                   m.role,
                   snippet(messages_fts, 0, '>>>', '<<<', '...', 32) AS snippet,
                   m.timestamp,
                   s.title,
                   s.project_path
                 FROM messages_fts
                 JOIN messages m ON messages_fts.rowid = m.id
                 JOIN sessions s ON m.session_id = s.id
                 WHERE messages_fts MATCH ?1
                 ORDER BY rank, m.id
                 LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![query, limit as i64])?;
            let mut hits = Vec::new();
            while let Some(row) = rows.next()? {
                let role_str: String = row_helpers::get(row, 1, "messages", "role")?;
                hits.push(SearchHit {
                    session_id: SessionId::from_raw(row_helpers::get::<String>(
                        row,
                        0,
                        "messages",
                        "session_id",
                    )?),
                    role: row_helpers::parse_enum(&role_str, "messages", "role")?,
                    snippet: row_helpers::get(row, 2, "messages_fts", "snippet")?,
                    timestamp: row_helpers::get(row, 3, "messages", "timestamp")?,
                    session_title: row_helpers::get_opt(row, 4, "sessions", "title")?,
                    project_path: row_helpers::get_opt(row, 5, "sessions", "project_path")?,
                });
            }
            Ok(hits)
        })
    }

    /// Drop every mirror row and the session row itself. The FTS delete
    /// trigger keeps the search index in step.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute("DELETE FROM messages WHERE session_id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            tx.commit()?;
            Ok(())
        })
    }
}

fn write_session_row(
    conn: &rusqlite::Connection,
    verb: &str,
    session: &Session,
    tags: &str,
) -> Result<usize, rusqlite::Error> {
    let sql = format!(
        "{verb}
         (id, created_at, updated_at, title, summary, project_path, model,
          message_count, token_count, parent_session_id, branch_point, tags, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
    );
    conn.execute(
        &sql,
        rusqlite::params![
            session.id.as_str(),
            session.created_at,
            session.updated_at,
            session.title,
            session.summary,
            session.project_path,
            session.model,
            session.message_count as i64,
            session.token_count as i64,
            session.parent_session_id.as_ref().map(|p| p.as_str()),
            session.branch_point.map(|b| b as i64),
            tags,
            session.status.to_string(),
        ],
    )
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let status_str: String = row_helpers::get(row, 12, "sessions", "status")?;
    let tags_str: String = row_helpers::get(row, 11, "sessions", "tags")?;
    let tags: Vec<String> =
        serde_json::from_str(&tags_str).map_err(|e| StoreError::CorruptRecord {
            table: "sessions",
            column: "tags",
            detail: format!("invalid JSON: {e}"),
        })?;

    Ok(Session {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        created_at: row_helpers::get(row, 1, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 2, "sessions", "updated_at")?,
        title: row_helpers::get_opt(row, 3, "sessions", "title")?,
        summary: row_helpers::get_opt(row, 4, "sessions", "summary")?,
        project_path: row_helpers::get_opt(row, 5, "sessions", "project_path")?,
        model: row_helpers::get_opt(row, 6, "sessions", "model")?,
        message_count: row_helpers::get::<i64>(row, 7, "sessions", "message_count")? as u64,
        token_count: row_helpers::get::<i64>(row, 8, "sessions", "token_count")? as u64,
        parent_session_id: row_helpers::get_opt::<String>(row, 9, "sessions", "parent_session_id")?
            .map(SessionId::from_raw),
        branch_point: row_helpers::get_opt::<i64>(row, 10, "sessions", "branch_point")?
            .map(|b| b as u64),
        tags,
        status: row_helpers::parse_enum(&status_str, "sessions", "status")?,
    })
}
