use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{instrument, warn};

use scribe_core::ids::SessionId;
use scribe_core::messages::{Message, MessageRecord};

use crate::error::StoreError;

/// Durable, append-only, per-session message log.
///
/// One `messages.jsonl` per session directory, one JSON object per line.
/// Every append is a single write of one full line followed by fsync, so a
/// crash can only ever produce an unterminated junk tail, never a record
/// that is partially visible as valid. Previously written bytes are never
/// rewritten; a junk tail is terminated by appending a lone newline and is
/// skipped (and counted) by readers.
pub struct MessageLog {
    sessions_dir: PathBuf,
    // Per-session append state: serializes writers and caches the next
    // sequence index so appends stay O(1) after the first scan.
    state: Mutex<HashMap<String, Arc<Mutex<LogState>>>>,
}

#[derive(Default)]
struct LogState {
    next_index: Option<u64>,
}

impl MessageLog {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn log_path(&self, session_id: &SessionId) -> PathBuf {
        self.sessions_dir.join(session_id.as_str()).join("messages.jsonl")
    }

    /// Create the session directory and an empty log file.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn create(&self, session_id: &SessionId) -> Result<(), StoreError> {
        let dir = self.sessions_dir.join(session_id.as_str());
        std::fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Io(format!("create {}: {e}", dir.display())))?;
        let path = dir.join("messages.jsonl");
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::Io(format!("create {}: {e}", path.display())))?;
        Ok(())
    }

    /// Append one record. Returns the assigned sequence index (gapless,
    /// starting at 0). The line is flushed durably before returning.
    #[instrument(skip(self, record), fields(session_id = %session_id))]
    pub fn append(
        &self,
        session_id: &SessionId,
        record: &MessageRecord,
    ) -> Result<u64, StoreError> {
        let state = self.session_state(session_id);
        let mut state = state.lock();

        let path = self.log_path(session_id);
        let (next_index, terminated) = match state.next_index {
            Some(n) => (n, true),
            None => {
                let scan = scan_log(&path)?;
                (scan.valid_records, scan.terminated)
            }
        };

        let mut line = String::new();
        if !terminated {
            // Torn tail from an earlier crash: terminate the junk line so
            // this record starts on a fresh line. Readers skip the junk.
            warn!(session_id = %session_id, "terminating unfinished log line");
            line.push('\n');
        }
        line.push_str(&serde_json::to_string(record)?);
        line.push('\n');

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create {}: {e}", parent.display())))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::Io(format!("open {}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .map_err(|e| StoreError::Io(format!("append {}: {e}", path.display())))?;
        file.sync_all()
            .map_err(|e| StoreError::Io(format!("fsync {}: {e}", path.display())))?;

        state.next_index = Some(next_index + 1);
        Ok(next_index)
    }

    /// Lazy reader over valid records in sequence order. Malformed lines are
    /// skipped and counted, never fatal. A missing log reads as empty.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn iter(
        &self,
        session_id: &SessionId,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<MessageIter, StoreError> {
        let path = self.log_path(session_id);
        let lines = match File::open(&path) {
            Ok(file) => Some(BufReader::new(file).lines()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(StoreError::Io(format!("open {}: {e}", path.display()))),
        };
        Ok(MessageIter {
            lines,
            session_id: session_id.clone(),
            next_valid: 0,
            offset: offset as u64,
            remaining: limit,
            skipped: 0,
        })
    }

    /// Eager read. Returns the records plus the count of skipped lines.
    pub fn read(
        &self,
        session_id: &SessionId,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<(Vec<Message>, usize), StoreError> {
        let mut iter = self.iter(session_id, offset, limit)?;
        let mut messages = Vec::new();
        for message in iter.by_ref() {
            messages.push(message);
        }
        Ok((messages, iter.skipped()))
    }

    /// Count of valid records currently in the log.
    pub fn len(&self, session_id: &SessionId) -> Result<u64, StoreError> {
        Ok(scan_log(&self.log_path(session_id))?.valid_records)
    }

    pub fn is_empty(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        Ok(self.len(session_id)? == 0)
    }

    /// Remove the session directory and its log. Failures surface: an
    /// incomplete irreversible deletion must be known, not hidden.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn remove(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.state.lock().remove(session_id.as_str());
        let dir = self.sessions_dir.join(session_id.as_str());
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(format!("remove {}: {e}", dir.display()))),
        }
    }

    fn session_state(&self, session_id: &SessionId) -> Arc<Mutex<LogState>> {
        self.state
            .lock()
            .entry(session_id.as_str().to_string())
            .or_default()
            .clone()
    }
}

/// Iterator over a session's valid records. `skipped()` reports how many
/// malformed lines were passed over so far.
pub struct MessageIter {
    lines: Option<std::io::Lines<BufReader<File>>>,
    session_id: SessionId,
    next_valid: u64,
    offset: u64,
    remaining: Option<usize>,
    skipped: usize,
}

impl MessageIter {
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for MessageIter {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        if self.remaining == Some(0) {
            return None;
        }
        let lines = self.lines.as_mut()?;
        loop {
            let line = match lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    warn!(session_id = %self.session_id, error = %e, "log read failed mid-file");
                    self.lines = None;
                    return None;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<MessageRecord>(&line) {
                Ok(record) => {
                    let sequence_index = self.next_valid;
                    self.next_valid += 1;
                    if sequence_index < self.offset {
                        continue;
                    }
                    if let Some(remaining) = self.remaining.as_mut() {
                        *remaining -= 1;
                    }
                    return Some(Message {
                        sequence_index,
                        record,
                    });
                }
                Err(e) => {
                    self.skipped += 1;
                    warn!(
                        session_id = %self.session_id,
                        error = %e,
                        "skipping malformed log line"
                    );
                }
            }
        }
    }
}

struct LogScan {
    valid_records: u64,
    /// False when the file ends mid-line (torn write).
    terminated: bool,
}

fn scan_log(path: &Path) -> Result<LogScan, StoreError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LogScan {
                valid_records: 0,
                terminated: true,
            })
        }
        Err(e) => return Err(StoreError::Io(format!("read {}: {e}", path.display()))),
    };

    let terminated = data.is_empty() || data.ends_with(b"\n");
    let text = String::from_utf8_lossy(&data);
    let valid_records = text
        .lines()
        .filter(|line| {
            !line.trim().is_empty() && serde_json::from_str::<MessageRecord>(line).is_ok()
        })
        .count() as u64;

    Ok(LogScan {
        valid_records,
        terminated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::messages::Role;

    fn temp_log() -> MessageLog {
        let dir = std::env::temp_dir().join(format!("scribe-log-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        MessageLog::new(dir)
    }

    #[test]
    fn create_touches_empty_file() {
        let log = temp_log();
        let id = SessionId::new();
        log.create(&id).unwrap();
        assert!(log.log_path(&id).exists());
        assert!(log.is_empty(&id).unwrap());
    }

    #[test]
    fn append_assigns_gapless_indices() {
        let log = temp_log();
        let id = SessionId::new();
        log.create(&id).unwrap();

        for expected in 0..5u64 {
            let idx = log
                .append(&id, &MessageRecord::user(format!("message {expected}")))
                .unwrap();
            assert_eq!(idx, expected);
        }
    }

    #[test]
    fn indices_survive_counter_loss() {
        // A fresh MessageLog (new process) must continue the sequence by
        // scanning the file rather than restarting at 0.
        let dir = std::env::temp_dir().join(format!("scribe-log-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let id = SessionId::new();

        let log = MessageLog::new(&dir);
        log.create(&id).unwrap();
        assert_eq!(log.append(&id, &MessageRecord::user("one")).unwrap(), 0);
        assert_eq!(log.append(&id, &MessageRecord::user("two")).unwrap(), 1);

        let reopened = MessageLog::new(&dir);
        assert_eq!(reopened.append(&id, &MessageRecord::user("three")).unwrap(), 2);
    }

    #[test]
    fn read_returns_records_in_order() {
        let log = temp_log();
        let id = SessionId::new();
        log.create(&id).unwrap();
        log.append(&id, &MessageRecord::user("first")).unwrap();
        log.append(&id, &MessageRecord::assistant("second")).unwrap();

        let (messages, skipped) = log.read(&id, 0, None).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].sequence_index, 0);
        assert_eq!(messages[0].record.content, "first");
        assert_eq!(messages[1].sequence_index, 1);
        assert_eq!(messages[1].record.role, Role::Assistant);
    }

    #[test]
    fn read_applies_offset_and_limit() {
        let log = temp_log();
        let id = SessionId::new();
        log.create(&id).unwrap();
        for i in 0..5 {
            log.append(&id, &MessageRecord::user(format!("m{i}"))).unwrap();
        }

        let (page, _) = log.read(&id, 1, Some(2)).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].record.content, "m1");
        assert_eq!(page[0].sequence_index, 1);
        assert_eq!(page[1].record.content, "m2");
    }

    #[test]
    fn missing_log_reads_empty() {
        let log = temp_log();
        let (messages, skipped) = log.read(&SessionId::new(), 0, None).unwrap();
        assert!(messages.is_empty());
        assert_eq!(skipped, 0);
    }

    #[test]
    fn malformed_lines_are_skipped_and_counted() {
        let log = temp_log();
        let id = SessionId::new();
        log.create(&id).unwrap();
        log.append(&id, &MessageRecord::user("good one")).unwrap();

        // Corruption injected between valid records.
        let path = log.log_path(&id);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"role\": \"user\", truncated garb\n").unwrap();
        drop(file);

        log.append(&id, &MessageRecord::user("good two")).unwrap();

        let (messages, skipped) = log.read(&id, 0, None).unwrap();
        assert_eq!(skipped, 1);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].record.content, "good one");
        assert_eq!(messages[1].record.content, "good two");
        // Indices stay gapless over valid records.
        assert_eq!(messages[1].sequence_index, 1);
    }

    #[test]
    fn torn_tail_is_terminated_not_rewritten() {
        let log = temp_log();
        let id = SessionId::new();
        log.create(&id).unwrap();
        log.append(&id, &MessageRecord::user("complete")).unwrap();

        // Simulate a crash mid-write: a partial line with no newline.
        let path = log.log_path(&id);
        let before = std::fs::read(&path).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"role\":\"user\",\"cont").unwrap();
        drop(file);

        // Next append (fresh scan) terminates the junk and lands cleanly.
        let fresh = MessageLog::new(log.sessions_dir.clone());
        let idx = fresh.append(&id, &MessageRecord::user("after crash")).unwrap();
        assert_eq!(idx, 1);

        let after = std::fs::read(&path).unwrap();
        assert!(after.starts_with(&before), "existing bytes were rewritten");

        let (messages, skipped) = fresh.read(&id, 0, None).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(skipped, 1);
        assert_eq!(messages[1].record.content, "after crash");
    }

    #[test]
    fn iter_is_lazy_and_restartable() {
        let log = temp_log();
        let id = SessionId::new();
        log.create(&id).unwrap();
        for i in 0..3 {
            log.append(&id, &MessageRecord::user(format!("m{i}"))).unwrap();
        }

        let mut first = log.iter(&id, 0, None).unwrap();
        assert_eq!(first.next().unwrap().record.content, "m0");

        // A second iterator starts from the beginning, unaffected.
        let mut second = log.iter(&id, 0, None).unwrap();
        assert_eq!(second.next().unwrap().record.content, "m0");
        assert_eq!(first.next().unwrap().record.content, "m1");
    }

    #[test]
    fn tool_data_round_trips_through_the_log() {
        let log = temp_log();
        let id = SessionId::new();
        log.create(&id).unwrap();
        let record = MessageRecord::assistant("calling a tool")
            .with_token_count(17)
            .with_tool_calls(serde_json::json!([{"name": "bash"}]))
            .with_tool_results(serde_json::json!([{"output": "ok"}]));
        log.append(&id, &record).unwrap();

        let (messages, _) = log.read(&id, 0, None).unwrap();
        assert_eq!(messages[0].record, record);
    }

    #[test]
    fn remove_deletes_session_dir() {
        let log = temp_log();
        let id = SessionId::new();
        log.create(&id).unwrap();
        log.append(&id, &MessageRecord::user("bye")).unwrap();

        log.remove(&id).unwrap();
        assert!(!log.log_path(&id).exists());
        // Removing again is fine.
        log.remove(&id).unwrap();
    }

    #[test]
    fn concurrent_appends_stay_gapless() {
        let log = Arc::new(temp_log());
        let id = SessionId::new();
        log.create(&id).unwrap();

        let mut handles = vec![];
        for i in 0..10 {
            let log = log.clone();
            let id = id.clone();
            handles.push(std::thread::spawn(move || {
                log.append(&id, &MessageRecord::user(format!("thread {i}"))).unwrap()
            }));
        }

        let mut indices: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());

        let (messages, skipped) = log.read(&id, 0, None).unwrap();
        assert_eq!(messages.len(), 10);
        assert_eq!(skipped, 0);
    }
}
