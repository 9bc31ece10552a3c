use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{info, instrument, warn};

use scribe_core::ids::SessionId;
use scribe_core::messages::{Message, MessageRecord, Role};

use crate::database::Database;
use crate::error::StoreError;
use crate::index::{MetadataIndex, Session, SessionPatch, SessionStatus};
use crate::message_log::MessageLog;

/// Attempts to allocate a non-colliding session id before giving up.
const MAX_ID_ATTEMPTS: usize = 5;

/// Title auto-derivation fires when a session reaches this many messages.
const TITLE_AT_MESSAGE_COUNT: u64 = 3;

const TITLE_MAX_CHARS: usize = 50;

/// Options for creating a session. Everything is optional; an untitled
/// session gets its title derived from the conversation later.
#[derive(Clone, Debug, Default)]
pub struct CreateSession {
    pub title: Option<String>,
    pub project_path: Option<String>,
    pub model: Option<String>,
    pub tags: Vec<String>,
    pub parent_session_id: Option<SessionId>,
    pub branch_point: Option<u64>,
}

/// Export rendering for a full session transcript.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Markdown,
}

impl std::str::FromStr for ExportFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "markdown" | "md" => Ok(Self::Markdown),
            other => Err(format!("unknown export format: {other}")),
        }
    }
}

/// Coordinator over the append-only log and the metadata index.
///
/// Every write goes log first, index second. The log is the source of truth:
/// if the index update fails after the log append landed, the error is
/// surfaced but the log entry stays; it is never rolled back. Layout under
/// the base directory:
///
/// ```text
/// <base>/sessions/sessions.db
/// <base>/sessions/<session_id>/messages.jsonl
/// ```
pub struct SessionStore {
    base_dir: PathBuf,
    log: MessageLog,
    index: MetadataIndex,
}

impl SessionStore {
    #[instrument]
    pub fn open(base_dir: &Path) -> Result<Self, StoreError> {
        let sessions_dir = base_dir.join("sessions");
        let db = Database::open(&sessions_dir.join("sessions.db"))?;
        info!(base = %base_dir.display(), "session store opened");
        Ok(Self {
            base_dir: base_dir.to_owned(),
            log: MessageLog::new(&sessions_dir),
            index: MetadataIndex::new(db),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    /// Create a new session with a freshly allocated id.
    #[instrument(skip(self, options))]
    pub fn create(&self, options: CreateSession) -> Result<Session, StoreError> {
        let session = self.insert_new(|id| {
            let mut session = Session::new(id);
            session.title = options.title.clone();
            session.project_path = options.project_path.clone();
            session.model = options.model.clone();
            session.tags = options.tags.clone();
            session.parent_session_id = options.parent_session_id.clone();
            session.branch_point = options.branch_point;
            session
        })?;
        self.log.create(&session.id)?;
        info!(session_id = %session.id, "session created");
        Ok(session)
    }

    /// Append one message to a session. Returns the assigned sequence index.
    ///
    /// The record is durably in the log before the index is touched. An index
    /// failure after that point comes back as an error, but the message is
    /// not lost: the log keeps it and reads fall back to the log.
    #[instrument(skip(self, record), fields(session_id = %session_id))]
    pub fn save_message(
        &self,
        session_id: &SessionId,
        record: &MessageRecord,
    ) -> Result<u64, StoreError> {
        let session = self
            .index
            .get(session_id)?
            .ok_or_else(|| StoreError::Usage(format!("unknown session: {session_id}")))?;

        let sequence = self.log.append(session_id, record)?;

        let count = match self.index.append_message_index(session_id, sequence, record) {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    sequence,
                    error = %e,
                    "message logged but index update failed; log remains authoritative"
                );
                return Err(e);
            }
        };

        if count == TITLE_AT_MESSAGE_COUNT && session.title.is_none() {
            if let Some(title) = self.derive_title(session_id)? {
                self.index.update_fields(
                    session_id,
                    &SessionPatch {
                        title: Some(title),
                        ..Default::default()
                    },
                )?;
            }
        }

        Ok(sequence)
    }

    /// Fetch session metadata. A missing session is `None`, not an error.
    pub fn load(&self, session_id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.index.get(session_id)
    }

    /// Read messages back from the log in sequence order. Returns the page
    /// plus the count of unreadable lines that were skipped.
    pub fn messages(
        &self,
        session_id: &SessionId,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<(Vec<Message>, usize), StoreError> {
        self.log.read(session_id, offset, limit)
    }

    /// Active sessions, most recently updated first.
    pub fn list(
        &self,
        project_path: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Session>, StoreError> {
        self.index
            .query_sessions(SessionStatus::Active, project_path, limit)
    }

    pub fn list_by_status(
        &self,
        status: SessionStatus,
        project_path: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Session>, StoreError> {
        self.index.query_sessions(status, project_path, limit)
    }

    /// The active session with the latest activity, if any.
    pub fn get_most_recent(&self) -> Result<Option<Session>, StoreError> {
        Ok(self.list(None, 1)?.into_iter().next())
    }

    /// Apply a partial metadata update (title, tags, status, ...).
    pub fn update(&self, session_id: &SessionId, patch: &SessionPatch) -> Result<(), StoreError> {
        self.index.update_fields(session_id, patch)
    }

    /// Fork a session into a new one, copying messages up to `at_message`
    /// (exclusive) or the whole transcript. Copied records keep their
    /// original timestamps; the branch records its parent and the cut point.
    #[instrument(skip(self), fields(source = %source_id))]
    pub fn branch(
        &self,
        source_id: &SessionId,
        at_message: Option<u64>,
    ) -> Result<Session, StoreError> {
        let source = self
            .index
            .get(source_id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {source_id}")))?;

        let (messages, skipped) =
            self.log
                .read(source_id, 0, at_message.map(|n| n as usize))?;
        if skipped > 0 {
            warn!(source = %source_id, skipped, "unreadable lines skipped while branching");
        }

        let title_base = source.title.clone().unwrap_or_else(|| source.id.to_string());
        let branch = self.create(CreateSession {
            title: Some(format!("{title_base} (branch)")),
            project_path: source.project_path.clone(),
            model: source.model.clone(),
            tags: source.tags.clone(),
            parent_session_id: Some(source.id.clone()),
            branch_point: Some(messages.len() as u64),
        })?;

        for message in &messages {
            let sequence = self.log.append(&branch.id, &message.record)?;
            self.index
                .append_message_index(&branch.id, sequence, &message.record)?;
        }

        info!(
            source = %source_id,
            branch = %branch.id,
            copied = messages.len(),
            "session branched"
        );
        // Counters moved under us; hand back the settled row.
        self.index
            .get(&branch.id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {}", branch.id)))
    }

    /// Render a full transcript for sharing.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn export(
        &self,
        session_id: &SessionId,
        format: ExportFormat,
    ) -> Result<String, StoreError> {
        let session = self
            .index
            .get(session_id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        let (messages, skipped) = self.log.read(session_id, 0, None)?;
        if skipped > 0 {
            warn!(session_id = %session_id, skipped, "unreadable lines skipped during export");
        }

        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&json!({
                "session": session,
                "messages": messages,
            }))?),
            ExportFormat::Markdown => Ok(render_markdown(&session, &messages)),
        }
    }

    /// Soft delete hides the session from listings; its data stays intact.
    /// Hard delete removes the index rows and the log directory for good.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn delete(&self, session_id: &SessionId, hard: bool) -> Result<(), StoreError> {
        if self.index.get(session_id)?.is_none() {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }

        if hard {
            self.index.delete_session(session_id)?;
            self.log.remove(session_id)?;
            info!(session_id = %session_id, "session hard-deleted");
        } else {
            self.index.update_fields(
                session_id,
                &SessionPatch {
                    status: Some(SessionStatus::Deleted),
                    ..Default::default()
                },
            )?;
            info!(session_id = %session_id, "session soft-deleted");
        }
        Ok(())
    }

    fn insert_new(
        &self,
        build: impl Fn(SessionId) -> Session,
    ) -> Result<Session, StoreError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let session = build(SessionId::new());
            if self.index.insert_session(&session)? {
                return Ok(session);
            }
            warn!(session_id = %session.id, "session id collision, retrying");
        }
        Err(StoreError::Database(
            "could not allocate a unique session id".into(),
        ))
    }

    fn derive_title(&self, session_id: &SessionId) -> Result<Option<String>, StoreError> {
        let (messages, _) = self.log.read(session_id, 0, None)?;
        Ok(messages
            .iter()
            .find(|m| m.record.role == Role::User)
            .map(|m| derive_title_text(&m.record.content)))
    }
}

/// First line of the first user message, capped at 50 chars. Whenever the
/// title is shorter than the full content (cut by the cap or by a line
/// break), it loses trailing sentence punctuation and gains an ellipsis.
fn derive_title_text(content: &str) -> String {
    let head: String = content.chars().take(TITLE_MAX_CHARS).collect();
    let first_line = head.lines().next().unwrap_or_default();
    if first_line.chars().count() < content.chars().count() {
        format!("{}...", first_line.trim_end_matches(['.', '!', '?']))
    } else {
        first_line.to_string()
    }
}

fn render_markdown(session: &Session, messages: &[Message]) -> String {
    let mut out = String::new();
    let heading = session.title.clone().unwrap_or_else(|| session.id.to_string());
    out.push_str(&format!("# Session: {heading}\n\n"));
    out.push_str(&format!("**Created:** {}\n", session.created_at));
    out.push_str(&format!(
        "**Project:** {}\n",
        session.project_path.as_deref().unwrap_or("N/A")
    ));
    out.push_str(&format!(
        "**Model:** {}\n",
        session.model.as_deref().unwrap_or("N/A")
    ));
    // The session counter, not the lines read back: under the degraded mode
    // the log can briefly hold more than the index has counted.
    out.push_str(&format!("**Messages:** {}\n\n---\n\n", session.message_count));

    for message in messages {
        let role = message.record.role.to_string().to_uppercase();
        let ts = &message.record.timestamp;
        let ts_short = &ts[..ts.len().min(19)];
        out.push_str(&format!("## {role} ({ts_short})\n\n"));
        out.push_str(&message.record.content);
        out.push_str("\n\n");
        if let Some(tool_calls) = &message.record.tool_calls {
            let rendered = serde_json::to_string_pretty(tool_calls).unwrap_or_default();
            out.push_str(&format!("```json\n{rendered}\n```\n\n"));
        }
    }
    out
}
