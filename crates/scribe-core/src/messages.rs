use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Who produced a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One turn as it is written to the append-only log: exactly the JSONL line
/// schema. The sequence index is positional and never stored in the line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub role: Role,
    pub content: String,
    /// RFC-3339 UTC, assigned at append time.
    pub timestamp: String,
    #[serde(default)]
    pub token_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<serde_json::Value>,
}

/// A turn read back from a session, paired with its position in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sequence_index: u64,
    #[serde(flatten)]
    pub record: MessageRecord,
}

impl MessageRecord {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now().to_rfc3339(),
            token_count: 0,
            tool_calls: None,
            tool_results: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_token_count(mut self, token_count: u64) -> Self {
        self.token_count = token_count;
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: serde_json::Value) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    pub fn with_tool_results(mut self, tool_results: serde_json::Value) -> Self {
        self.tool_results = Some(tool_results);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_display_and_parse_roundtrip() {
        for role in [Role::User, Role::Assistant, Role::System, Role::Tool] {
            let s = role.to_string();
            let parsed: Role = s.parse().unwrap();
            assert_eq!(parsed, role);
        }
    }

    #[test]
    fn unknown_role_fails() {
        assert!("robot".parse::<Role>().is_err());
    }

    #[test]
    fn record_line_omits_absent_tool_data() {
        let record = MessageRecord::user("hello");
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("tool_results"));
    }

    #[test]
    fn record_line_includes_tool_data_when_present() {
        let record = MessageRecord::assistant("running a tool")
            .with_tool_calls(json!([{"name": "bash", "args": {"command": "ls"}}]));
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("tool_calls"));
        assert!(json.contains("bash"));
    }

    #[test]
    fn record_serde_roundtrip() {
        let record = MessageRecord::user("fix the parser")
            .with_token_count(42)
            .with_tool_results(json!([{"output": "done"}]));
        let json = serde_json::to_string(&record).unwrap();
        let parsed: MessageRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn message_flattens_record_fields() {
        let message = Message {
            sequence_index: 3,
            record: MessageRecord::user("hi"),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["sequence_index"], 3);
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"], "hi");
    }

    #[test]
    fn record_timestamp_is_rfc3339() {
        let record = MessageRecord::user("hi");
        assert!(chrono::DateTime::parse_from_rfc3339(&record.timestamp).is_ok());
    }
}
