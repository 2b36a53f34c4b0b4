//! Per-file diff entries and the summary of a diff run.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::patch::{diff_values, PatchOp};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    /// Existing metadata differs from the desired metadata.
    Modified,
    Unchanged,
    /// The file has no metadata yet.
    Missing,
    /// Metadata exists for a locator that is gone from disk.
    Orphan,
}

/// Which entries a diff report lists.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiffFilter {
    #[default]
    All,
    /// `modified` and `missing` entries.
    Changed,
    Unchanged,
    Orphans,
}

impl DiffFilter {
    pub fn admits(&self, status: DiffStatus) -> bool {
        match self {
            DiffFilter::All => true,
            DiffFilter::Changed => matches!(status, DiffStatus::Modified | DiffStatus::Missing),
            DiffFilter::Unchanged => status == DiffStatus::Unchanged,
            DiffFilter::Orphans => status == DiffStatus::Orphan,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffEntry {
    /// Relative path (or locator, for orphans) of the compared file.
    pub file: String,
    pub status: DiffStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Vec<PatchOp>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

impl DiffEntry {
    /// Compare the metadata on disk with the metadata the run would write.
    pub fn compare(file: impl Into<String>, existing: Option<&Value>, desired: &Value, snapshots: bool) -> Self {
        let (status, patch) = match existing {
            None => (
                DiffStatus::Missing,
                diff_values(&Value::Object(Default::default()), desired),
            ),
            Some(before) => {
                let ops = diff_values(before, desired);
                if ops.is_empty() {
                    (DiffStatus::Unchanged, ops)
                } else {
                    (DiffStatus::Modified, ops)
                }
            }
        };
        Self {
            file: file.into(),
            status,
            patch: (!patch.is_empty()).then_some(patch),
            before: if snapshots { existing.cloned() } else { None },
            after: snapshots.then(|| desired.clone()),
        }
    }

    pub fn orphan(locator: impl Into<String>, existing: &Value, snapshots: bool) -> Self {
        Self {
            file: locator.into(),
            status: DiffStatus::Orphan,
            patch: None,
            before: snapshots.then(|| existing.clone()),
            after: None,
        }
    }
}

/// Counters over every compared entry, regardless of the listing filter.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary {
    /// Files that had existing metadata.
    pub paired: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub missing: usize,
    pub orphans: usize,
}

impl DiffSummary {
    fn count(&mut self, status: DiffStatus) {
        match status {
            DiffStatus::Modified => {
                self.paired += 1;
                self.changed += 1;
            }
            DiffStatus::Unchanged => {
                self.paired += 1;
                self.unchanged += 1;
            }
            DiffStatus::Missing => self.missing += 1,
            DiffStatus::Orphan => self.orphans += 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiffReport {
    pub entries: Vec<DiffEntry>,
    pub summary: DiffSummary,
}

impl DiffReport {
    /// Summarize every entry, then keep the ones `filter` admits, sorted by file.
    pub fn build(mut entries: Vec<DiffEntry>, filter: DiffFilter) -> Self {
        let mut summary = DiffSummary::default();
        for entry in &entries {
            summary.count(entry.status);
        }
        entries.retain(|e| filter.admits(e.status));
        entries.sort_by(|a, b| a.file.cmp(&b.file));
        Self { entries, summary }
    }

    /// Whether anything on disk would change.
    pub fn has_changes(&self) -> bool {
        self.summary.changed + self.summary.missing + self.summary.orphans > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_entries() -> Vec<DiffEntry> {
        vec![
            DiffEntry::compare("b.txt", Some(&json!({"a": 1})), &json!({"a": 2}), false),
            DiffEntry::compare("a.txt", Some(&json!({"a": 1})), &json!({"a": 1}), false),
            DiffEntry::compare("c.txt", None, &json!({"a": 1}), false),
            DiffEntry::orphan("gone.txt", &json!({}), false),
        ]
    }

    #[test]
    fn test_compare_statuses() {
        let entries = sample_entries();
        assert_eq!(entries[0].status, DiffStatus::Modified);
        assert_eq!(entries[0].patch, Some(vec![PatchOp::replace("/a", json!(2))]));
        assert_eq!(entries[1].status, DiffStatus::Unchanged);
        assert!(entries[1].patch.is_none());
        assert_eq!(entries[2].status, DiffStatus::Missing);
        assert_eq!(entries[3].status, DiffStatus::Orphan);
    }

    #[test]
    fn test_summary_ignores_filter() {
        let report = DiffReport::build(sample_entries(), DiffFilter::Orphans);
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].file, "gone.txt");
        assert_eq!(
            report.summary,
            DiffSummary {
                paired: 2,
                changed: 1,
                unchanged: 1,
                missing: 1,
                orphans: 1
            }
        );
        assert!(report.has_changes());
    }

    #[test]
    fn test_changed_filter_lists_modified_and_missing_sorted() {
        let report = DiffReport::build(sample_entries(), DiffFilter::Changed);
        let files: Vec<&str> = report.entries.iter().map(|e| e.file.as_str()).collect();
        assert_eq!(files, vec!["b.txt", "c.txt"]);
    }

    #[test]
    fn test_snapshots_only_when_requested() {
        let entry = DiffEntry::compare("x", Some(&json!({"a": 1})), &json!({"a": 2}), true);
        assert_eq!(entry.before, Some(json!({"a": 1})));
        assert_eq!(entry.after, Some(json!({"a": 2})));
        let value = serde_json::to_value(
            DiffEntry::compare("x", Some(&json!({"a": 1})), &json!({"a": 2}), false),
        )
        .unwrap();
        assert!(value.get("before").is_none());
        assert!(value.get("after").is_none());
    }

    #[test]
    fn test_no_changes() {
        let report = DiffReport::build(
            vec![DiffEntry::compare("a", Some(&json!({})), &json!({}), false)],
            DiffFilter::All,
        );
        assert!(!report.has_changes());
    }
}
