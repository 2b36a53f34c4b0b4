//! Pipeline stages and per-item stage errors.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Pipeline stage an item-level failure is attributed to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    Discovery,
    Parse,
    Locator,
    Filter,
    Map,
    Shell,
    PostMap,
    Reduce,
    Diff,
    Write,
}

impl StageKind {
    /// Stable name used in output and for error ordering.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Discovery => "discovery",
            StageKind::Parse => "parse",
            StageKind::Locator => "locator",
            StageKind::Filter => "filter",
            StageKind::Map => "map",
            StageKind::Shell => "shell",
            StageKind::PostMap => "post-map",
            StageKind::Reduce => "reduce",
            StageKind::Diff => "diff",
            StageKind::Write => "write",
        }
    }

    /// Whether the stage runs a sandboxed script.
    pub fn is_script(&self) -> bool {
        matches!(
            self,
            StageKind::Filter | StageKind::Map | StageKind::PostMap | StageKind::Reduce
        )
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure of one item at one stage.
///
/// Exactly one of `locator` and `context` is set: `locator` once the item is
/// known by its locator, `context` (usually a relative path) before that.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageError {
    pub stage: StageKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl StageError {
    /// Error for an item identified by its locator.
    pub fn for_locator(stage: StageKind, locator: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            locator: Some(locator.into()),
            context: None,
            message: message.into(),
            details: None,
        }
    }

    /// Error for something not (yet) known by a locator, e.g. a path.
    pub fn for_context(stage: StageKind, context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            locator: None,
            context: Some(context.into()),
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The locator or context this error names.
    pub fn subject(&self) -> &str {
        self.locator
            .as_deref()
            .or(self.context.as_deref())
            .unwrap_or_default()
    }

    /// Canonical ordering: `(stage, locator-or-context, message)`.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.stage
            .as_str()
            .cmp(other.stage.as_str())
            .then_with(|| self.subject().cmp(other.subject()))
            .then_with(|| self.message.cmp(&other.message))
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed for {}: {}", self.stage, self.subject(), self.message)
    }
}

/// Sort errors into canonical order.
pub fn sort_errors(errors: &mut [StageError]) {
    errors.sort_by(StageError::canonical_cmp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_names_are_stable() {
        assert_eq!(StageKind::PostMap.as_str(), "post-map");
        assert_eq!(serde_json::to_value(StageKind::PostMap).unwrap(), json!("post-map"));
        assert_eq!(StageKind::Discovery.to_string(), "discovery");
    }

    #[test]
    fn test_script_stages() {
        assert!(StageKind::Filter.is_script());
        assert!(StageKind::Reduce.is_script());
        assert!(!StageKind::Shell.is_script());
        assert!(!StageKind::Parse.is_script());
    }

    #[test]
    fn test_errors_sort_by_stage_subject_message() {
        let mut errors = vec![
            StageError::for_locator(StageKind::Shell, "b", "exit 1"),
            StageError::for_context(StageKind::Parse, "z.yaml", "too large"),
            StageError::for_locator(StageKind::Map, "a", "boom"),
            StageError::for_locator(StageKind::Shell, "a", "exit 2"),
            StageError::for_locator(StageKind::Shell, "a", "exit 1"),
        ];
        sort_errors(&mut errors);
        let keys: Vec<_> = errors
            .iter()
            .map(|e| format!("{}:{}:{}", e.stage, e.subject(), e.message))
            .collect();
        assert_eq!(
            keys,
            vec![
                "map:a:boom",
                "parse:z.yaml:too large",
                "shell:a:exit 1",
                "shell:a:exit 2",
                "shell:b:exit 1",
            ]
        );
    }

    #[test]
    fn test_serialization_omits_unset_subject() {
        let err = StageError::for_context(StageKind::Discovery, "secret/", "permission denied");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(
            value,
            json!({"stage": "discovery", "context": "secret/", "message": "permission denied"})
        );
    }
}
