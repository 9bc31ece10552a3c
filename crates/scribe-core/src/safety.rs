use serde::{Deserialize, Serialize};

/// Decision returned by the bash-safety policy engine for one shell command.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum CommandVerdict {
    #[serde(rename = "allow")]
    Allow,
    #[serde(rename = "deny")]
    Deny { reason: String },
}

impl CommandVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::Deny { reason } => Some(reason),
        }
    }
}

/// Capability consulted by the agent loop before any shell tool executes.
/// The rule set lives outside this workspace; the store never calls it.
pub trait SafetyGate {
    fn evaluate(&self, command: &str) -> CommandVerdict;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_has_no_reason() {
        let verdict = CommandVerdict::Allow;
        assert!(verdict.is_allowed());
        assert!(verdict.reason().is_none());
    }

    #[test]
    fn deny_carries_reason() {
        let verdict = CommandVerdict::Deny {
            reason: "rm -rf on a root path".into(),
        };
        assert!(!verdict.is_allowed());
        assert_eq!(verdict.reason(), Some("rm -rf on a root path"));
    }

    #[test]
    fn verdict_serde_tagging() {
        let json = serde_json::to_string(&CommandVerdict::Allow).unwrap();
        assert!(json.contains(r#""action":"allow""#));

        let parsed: CommandVerdict =
            serde_json::from_str(r#"{"action":"deny","reason":"blocked"}"#).unwrap();
        assert_eq!(parsed.reason(), Some("blocked"));
    }
}
