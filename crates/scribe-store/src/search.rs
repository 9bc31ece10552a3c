use tracing::instrument;

use crate::error::StoreError;
use crate::index::{MetadataIndex, SearchHit};

pub const DEFAULT_SEARCH_LIMIT: usize = 20;
pub const MAX_SEARCH_LIMIT: usize = 100;

/// Free-text search over stored conversations.
///
/// Callers hand in plain words; every token is double-quoted before it
/// reaches the full-text index, so FTS5 operators and punctuation in user
/// input are matched literally instead of parsed as query syntax. Quoted
/// tokens combine as an implicit AND.
pub struct SearchEngine<'a> {
    index: &'a MetadataIndex,
}

impl<'a> SearchEngine<'a> {
    pub fn new(index: &'a MetadataIndex) -> Self {
        Self { index }
    }

    /// Search message content. `limit` defaults to 20 and is clamped to
    /// 1..=100. A blank query returns no hits.
    #[instrument(skip(self))]
    pub fn search(
        &self,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let fts_query = sanitize_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT);
        self.index.search(&fts_query, limit)
    }
}

/// Quote each whitespace-separated token for literal matching. Embedded
/// double quotes are doubled, the FTS5 escape for a quote inside a string.
fn sanitize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use scribe_core::ids::SessionId;
    use scribe_core::messages::MessageRecord;

    fn setup() -> MetadataIndex {
        let dir = std::env::temp_dir().join(format!("scribe-search-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        MetadataIndex::new(Database::open(&dir.join("sessions.db")).unwrap())
    }

    fn seed(index: &MetadataIndex, contents: &[&str]) -> SessionId {
        let session = crate::index::Session::new(SessionId::new());
        index.insert_session(&session).unwrap();
        for (i, content) in contents.iter().enumerate() {
            index
                .append_message_index(&session.id, i as u64, &MessageRecord::user(*content))
                .unwrap();
        }
        session.id
    }

    #[test]
    fn sanitize_quotes_each_token() {
        assert_eq!(sanitize_query("hello world"), r#""hello" "world""#);
        assert_eq!(sanitize_query("  spaced   out "), r#""spaced" "out""#);
    }

    #[test]
    fn sanitize_escapes_embedded_quotes() {
        // Wrap plus doubled inner quotes: `"hi"` becomes `"""hi"""`.
        assert_eq!(sanitize_query(r#"say "hi""#), r#""say" """hi""""#);
    }

    #[test]
    fn blank_query_returns_nothing() {
        let index = setup();
        seed(&index, &["some content"]);
        let engine = SearchEngine::new(&index);
        assert!(engine.search("", None).unwrap().is_empty());
        assert!(engine.search("   ", None).unwrap().is_empty());
    }

    #[test]
    fn finds_plain_words() {
        let index = setup();
        let id = seed(&index, &["the tokenizer panics on empty input", "unrelated"]);
        let engine = SearchEngine::new(&index);

        let hits = engine.search("tokenizer panics", None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].session_id, id);
    }

    #[test]
    fn multiple_tokens_all_must_match() {
        let index = setup();
        seed(&index, &["alpha beta", "alpha only"]);
        let engine = SearchEngine::new(&index);

        assert_eq!(engine.search("alpha", None).unwrap().len(), 2);
        assert_eq!(engine.search("alpha beta", None).unwrap().len(), 1);
    }

    #[test]
    fn operator_lookalikes_are_literal() {
        // Raw FTS5 would treat these as syntax; quoting must neutralize them.
        let index = setup();
        seed(&index, &["discussing foo-bar and NOT gates"]);
        let engine = SearchEngine::new(&index);

        assert!(engine.search("foo-bar", None).is_ok());
        assert!(engine.search("NOT", None).is_ok());
        assert!(engine.search("(unbalanced", None).is_ok());
    }

    #[test]
    fn limit_defaults_and_clamps() {
        let index = setup();
        let contents: Vec<String> = (0..30).map(|i| format!("needle number {i}")).collect();
        let refs: Vec<&str> = contents.iter().map(String::as_str).collect();
        seed(&index, &refs);
        let engine = SearchEngine::new(&index);

        assert_eq!(engine.search("needle", None).unwrap().len(), 20);
        assert_eq!(engine.search("needle", Some(5)).unwrap().len(), 5);
        // Zero is bumped to one, oversized is capped.
        assert_eq!(engine.search("needle", Some(0)).unwrap().len(), 1);
        assert_eq!(engine.search("needle", Some(1000)).unwrap().len(), 30);
    }
}
