// prompt-store-rs/src/diff.rs
// Line-membership diff between two prompt versions.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use shared_types::PromptVersion;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDiff {
    pub from_version: String,
    pub to_version: String,
    /// Lines of `to` absent from `from`, first occurrence order.
    pub additions: Vec<String>,
    /// Lines of `from` absent from `to`, first occurrence order.
    pub removals: Vec<String>,
    pub field_changes: Vec<FieldChange>,
}

impl VersionDiff {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty() && self.field_changes.is_empty()
    }

    /// Rebuild the line set of `to` from the lines of `from`.
    ///
    /// Removed lines are dropped, surviving lines keep their order and are
    /// deduplicated, and additions are appended.
    pub fn apply_to_lines(&self, from_lines: &[String]) -> Vec<String> {
        let removed: HashSet<&str> = self.removals.iter().map(String::as_str).collect();
        let mut seen = HashSet::new();
        let mut out: Vec<String> = from_lines
            .iter()
            .filter(|l| !removed.contains(l.as_str()))
            .filter(|l| seen.insert(l.as_str()))
            .cloned()
            .collect();
        out.extend(self.additions.iter().cloned());
        out
    }
}

fn membership_delta(base: &[String], other: &[String]) -> Vec<String> {
    let present: HashSet<&str> = base.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    other
        .iter()
        .filter(|l| !present.contains(l.as_str()) && seen.insert(l.as_str()))
        .cloned()
        .collect()
}

pub fn diff_versions(from: &PromptVersion, to: &PromptVersion) -> VersionDiff {
    let from_lines = from.content.render_lines();
    let to_lines = to.content.render_lines();

    let mut field_changes = Vec::new();
    let mut compare = |field: &str, a: Option<&str>, b: Option<&str>| {
        if a != b {
            field_changes.push(FieldChange {
                field: field.to_string(),
                from: a.map(str::to_string),
                to: b.map(str::to_string),
            });
        }
    };
    compare("rationale", Some(&from.rationale), Some(&to.rationale));
    compare("lineage", from.lineage.as_deref(), to.lineage.as_deref());
    compare("status", Some(from.status.as_str()), Some(to.status.as_str()));

    VersionDiff {
        from_version: from.version_id.clone(),
        to_version: to.version_id.clone(),
        additions: membership_delta(&from_lines, &to_lines),
        removals: membership_delta(&to_lines, &from_lines),
        field_changes,
    }
}
