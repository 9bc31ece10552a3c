use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A malformed definition file fails per-file, never the whole load.
#[derive(Debug, thiserror::Error)]
#[error("failed to parse {path}: {detail}")]
pub struct ConfigParseError {
    pub path: PathBuf,
    pub detail: String,
}

/// One named definition (command, skill, or agent) read from a directory scan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub body: String,
    pub source_path: PathBuf,
}

/// A file that was skipped during a load, kept for diagnostics.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of scanning global + project directories. Project entries override
/// global entries of the same name. Skips are reported, not swallowed.
#[derive(Clone, Debug, Default)]
pub struct LoadOutcome {
    pub definitions: BTreeMap<String, ResourceDefinition>,
    pub skipped: Vec<SkippedFile>,
}

impl LoadOutcome {
    /// Merge an overriding layer on top of this one. Definitions in `over`
    /// win on name collision; skip lists concatenate.
    pub fn layered_under(mut self, over: LoadOutcome) -> LoadOutcome {
        self.definitions.extend(over.definitions);
        self.skipped.extend(over.skipped);
        self
    }
}

/// Capability implemented by the command/skill/agent-definition loaders.
/// Out of scope for the store; the agent loop owns the implementations.
pub trait ResourceLoader {
    fn load(
        &self,
        global_dir: &std::path::Path,
        project_dir: &std::path::Path,
        pattern: &str,
    ) -> LoadOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, body: &str) -> ResourceDefinition {
        ResourceDefinition {
            name: name.into(),
            description: None,
            body: body.into(),
            source_path: PathBuf::from(format!("/defs/{name}.md")),
        }
    }

    #[test]
    fn project_layer_overrides_global() {
        let mut global = LoadOutcome::default();
        global.definitions.insert("review".into(), def("review", "global body"));
        global.definitions.insert("deploy".into(), def("deploy", "deploy body"));

        let mut project = LoadOutcome::default();
        project.definitions.insert("review".into(), def("review", "project body"));

        let merged = global.layered_under(project);
        assert_eq!(merged.definitions.len(), 2);
        assert_eq!(merged.definitions["review"].body, "project body");
        assert_eq!(merged.definitions["deploy"].body, "deploy body");
    }

    #[test]
    fn skips_accumulate_across_layers() {
        let mut global = LoadOutcome::default();
        global.skipped.push(SkippedFile {
            path: PathBuf::from("/g/bad.md"),
            reason: "missing frontmatter".into(),
        });
        let mut project = LoadOutcome::default();
        project.skipped.push(SkippedFile {
            path: PathBuf::from("/p/worse.md"),
            reason: "not utf-8".into(),
        });

        let merged = global.layered_under(project);
        assert_eq!(merged.skipped.len(), 2);
    }

    #[test]
    fn config_parse_error_names_the_file() {
        let err = ConfigParseError {
            path: PathBuf::from("/defs/broken.md"),
            detail: "unterminated frontmatter".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("broken.md"));
        assert!(msg.contains("unterminated"));
    }
}
