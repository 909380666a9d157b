//! Data model shared by every stage of the repair pipeline.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// One SEARCH/REPLACE instruction as written by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditCommand {
    pub search_text: String,
    pub replace_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line_hint: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line_hint: Option<u32>,
}

impl EditCommand {
    pub fn new(search_text: impl Into<String>, replace_text: impl Into<String>) -> Self {
        Self {
            search_text: search_text.into(),
            replace_text: replace_text.into(),
            start_line_hint: None,
            end_line_hint: None,
        }
    }

    pub fn with_hints(mut self, start: Option<u32>, end: Option<u32>) -> Self {
        self.start_line_hint = start;
        self.end_line_hint = end;
        self
    }
}

/// Ordered mapping from file-path token to the commands declared under it.
///
/// Keys keep first-seen order. Exact duplicate commands under the same key are
/// dropped, so re-parsing a completion that repeats itself is harmless.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileEditBatch {
    files: IndexMap<String, Vec<EditCommand>>,
}

impl FileEditBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the command was already present for `path`.
    pub fn push(&mut self, path: impl Into<String>, command: EditCommand) -> bool {
        let commands = self.files.entry(path.into()).or_default();
        if commands.contains(&command) {
            return false;
        }
        commands.push(command);
        true
    }

    pub fn merge(&mut self, other: FileEditBatch) {
        for (path, commands) in other.files {
            for command in commands {
                self.push(path.clone(), command);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.command_count() == 0
    }

    pub fn file_count(&self) -> usize {
        self.files.values().filter(|c| !c.is_empty()).count()
    }

    pub fn command_count(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    pub fn commands_for(&self, path: &str) -> Option<&[EditCommand]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[EditCommand])> {
        self.files
            .iter()
            .filter(|(_, commands)| !commands.is_empty())
            .map(|(path, commands)| (path.as_str(), commands.as_slice()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    AllCommands,
    OneAtATime,
}

/// One rung of the matcher's retry ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Strategy {
    pub indentation_delta: i32,
    pub match_mode: MatchMode,
}

impl Strategy {
    pub const fn new(indentation_delta: i32, match_mode: MatchMode) -> Self {
        Self {
            indentation_delta,
            match_mode,
        }
    }

    pub fn label(&self) -> String {
        let mode = match self.match_mode {
            MatchMode::AllCommands => "all",
            MatchMode::OneAtATime => "one-at-a-time",
        };
        if self.indentation_delta == 0 {
            format!("direct/{}", mode)
        } else {
            format!("shift{:+}/{}", self.indentation_delta, mode)
        }
    }
}

/// A transient matching attempt for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchCandidate {
    pub file_path: String,
    pub original_content: String,
    pub candidate_content: String,
    pub indentation_delta: i32,
    pub match_mode: MatchMode,
}

impl PatchCandidate {
    pub fn strategy(&self) -> Strategy {
        Strategy::new(self.indentation_delta, self.match_mode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyMethod {
    #[serde(rename = "direct")]
    Direct,
    #[serde(rename = "three-way")]
    ThreeWay,
}

impl ApplyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyMethod::Direct => "direct",
            ApplyMethod::ThreeWay => "three-way",
        }
    }
}

/// A generated diff and what happened when it met the working tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedPatch {
    pub file_path: String,
    pub diff_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_file_location: Option<PathBuf>,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<ApplyMethod>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("no change produced")]
    NoChange,
    #[error("no valid edit could be synthesized")]
    NoValidEdit,
    #[error("file not found")]
    FileNotFound,
    #[error("invalid file path: {0}")]
    InvalidPath(String),
    #[error("diff round-trip mismatch")]
    RoundTripMismatch,
    #[error("apply-failed: {0}")]
    ApplyFailed(String),
    #[error("LLM response timeout")]
    CompletionTimeout,
    #[error("Failed to get LLM response: {0}")]
    CompletionFailed(String),
    #[error("No edit commands found in LLM output")]
    NoEditCommands,
    #[error("Repository path not found: {0}")]
    RepositoryNotFound(String),
    #[error("No diff patches found")]
    NoDiffPatches,
    #[error("Location file not found: {0}")]
    LocationNotFound(String),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    /// `None` for instance-level failures that never reached a file.
    pub file_path: Option<String>,
    pub reason: FailureReason,
}

impl FileFailure {
    pub fn file(path: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            file_path: Some(path.into()),
            reason,
        }
    }

    pub fn instance(reason: FailureReason) -> Self {
        Self {
            file_path: None,
            reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairStatus {
    Success,
    Partial,
    Failed,
}

impl RepairStatus {
    pub fn derive(applied: usize, failed: usize) -> Self {
        match (applied, failed) {
            (0, _) => RepairStatus::Failed,
            (_, 0) => RepairStatus::Success,
            _ => RepairStatus::Partial,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RepairStatus::Success => "success",
            RepairStatus::Partial => "partial",
            RepairStatus::Failed => "failed",
        }
    }
}

/// `org__repo-number` split into its parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceId {
    pub org: String,
    pub repo: String,
    pub number: String,
}

impl InstanceId {
    pub fn parse(instance_id: &str) -> Self {
        if let Some((head, number)) = instance_id.rsplit_once('-') {
            if let Some((org, repo)) = head.split_once("__") {
                return Self {
                    org: org.to_string(),
                    repo: repo.to_string(),
                    number: number.to_string(),
                };
            }
        }

        let flattened = instance_id.replace("__", "_");
        let parts: Vec<&str> = flattened.split('-').collect();
        if parts.len() >= 2 {
            Self {
                org: parts[0].to_string(),
                repo: if parts.len() > 2 {
                    parts[1].to_string()
                } else {
                    String::new()
                },
                number: parts[parts.len() - 1].to_string(),
            }
        } else {
            Self {
                org: String::new(),
                repo: String::new(),
                number: instance_id.to_string(),
            }
        }
    }
}

/// Hand-off record for evaluation harnesses, one JSON line per instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardRecord {
    pub org: String,
    pub repo: String,
    pub number: String,
    pub fix_patch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairResult {
    pub instance_id: String,
    pub org: String,
    pub repo: String,
    pub number: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub raw_output_text: String,
    pub processed_patches: Vec<AppliedPatch>,
    pub applied_files: Vec<String>,
    pub failed_files: Vec<FileFailure>,
    pub status: RepairStatus,
}

impl RepairResult {
    /// Diffs of applied files only, newline separated, with one trailing newline.
    pub fn fix_patch(&self) -> String {
        let joined = self
            .processed_patches
            .iter()
            .filter(|p| p.applied)
            .map(|p| p.diff_text.trim_end_matches('\n'))
            .collect::<Vec<_>>()
            .join("\n");
        let trimmed = joined.trim();
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}\n", trimmed)
        }
    }

    pub fn to_standard_record(&self) -> StandardRecord {
        StandardRecord {
            org: self.org.clone(),
            repo: self.repo.clone(),
            number: self.number.clone(),
            fix_patch: self.fix_patch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_keeps_first_seen_order_and_drops_duplicates() {
        let mut batch = FileEditBatch::new();
        assert!(batch.push("b.py", EditCommand::new("x", "y")));
        assert!(batch.push("a.py", EditCommand::new("1", "2")));
        assert!(!batch.push("b.py", EditCommand::new("x", "y")));
        assert!(batch.push("b.py", EditCommand::new("z", "w")));

        let keys: Vec<&str> = batch.iter().map(|(path, _)| path).collect();
        assert_eq!(keys, vec!["b.py", "a.py"]);
        assert_eq!(batch.command_count(), 3);
        assert_eq!(batch.commands_for("b.py").map(|c| c.len()), Some(2));
    }

    #[test]
    fn batch_merge_appends_under_existing_keys() {
        let mut first = FileEditBatch::new();
        first.push("a.py", EditCommand::new("1", "2"));
        let mut second = FileEditBatch::new();
        second.push("c.py", EditCommand::new("3", "4"));
        second.push("a.py", EditCommand::new("5", "6"));
        second.push("a.py", EditCommand::new("1", "2"));
        first.merge(second);

        let keys: Vec<&str> = first.iter().map(|(path, _)| path).collect();
        assert_eq!(keys, vec!["a.py", "c.py"]);
        assert_eq!(first.commands_for("a.py").map(|c| c.len()), Some(2));
    }

    #[test]
    fn status_is_a_fold_of_file_counts() {
        assert_eq!(RepairStatus::derive(2, 0), RepairStatus::Success);
        assert_eq!(RepairStatus::derive(1, 1), RepairStatus::Partial);
        assert_eq!(RepairStatus::derive(0, 3), RepairStatus::Failed);
        assert_eq!(RepairStatus::derive(0, 0), RepairStatus::Failed);
    }

    #[test]
    fn instance_id_parses_canonical_shape() {
        let id = InstanceId::parse("psf__requests-1234");
        assert_eq!(id.org, "psf");
        assert_eq!(id.repo, "requests");
        assert_eq!(id.number, "1234");

        let dashed = InstanceId::parse("google__go-cmp-77");
        assert_eq!(dashed.org, "google");
        assert_eq!(dashed.repo, "go-cmp");
        assert_eq!(dashed.number, "77");
    }

    #[test]
    fn instance_id_falls_back_without_double_underscore() {
        let id = InstanceId::parse("org-repo-42");
        assert_eq!(id.org, "org");
        assert_eq!(id.repo, "repo");
        assert_eq!(id.number, "42");

        let two = InstanceId::parse("org-42");
        assert_eq!(two.org, "org");
        assert_eq!(two.repo, "");
        assert_eq!(two.number, "42");

        let bare = InstanceId::parse("standalone");
        assert_eq!(bare.org, "");
        assert_eq!(bare.repo, "");
        assert_eq!(bare.number, "standalone");
    }

    #[test]
    fn failure_reasons_render_stable_messages() {
        assert_eq!(FailureReason::NoChange.to_string(), "no change produced");
        assert_eq!(
            FailureReason::NoValidEdit.to_string(),
            "no valid edit could be synthesized"
        );
        assert_eq!(
            FailureReason::ApplyFailed("patch does not apply".into()).to_string(),
            "apply-failed: patch does not apply"
        );
        assert_eq!(
            FailureReason::CompletionTimeout.to_string(),
            "LLM response timeout"
        );
    }

    #[test]
    fn fix_patch_only_includes_applied_diffs() {
        let patch = |path: &str, applied: bool| AppliedPatch {
            file_path: path.to_string(),
            diff_text: format!("diff --git a/{0} b/{0}\n@@ -1 +1 @@\n-a\n+b\n", path),
            diff_file_location: None,
            applied,
            method: applied.then_some(ApplyMethod::Direct),
        };
        let result = RepairResult {
            instance_id: "o__r-1".into(),
            org: "o".into(),
            repo: "r".into(),
            number: "1".into(),
            run_id: "run".into(),
            timestamp: Utc::now(),
            raw_output_text: String::new(),
            processed_patches: vec![patch("a.py", true), patch("b.py", false), patch("c.py", true)],
            applied_files: vec!["a.py".into(), "c.py".into()],
            failed_files: vec![FileFailure::file(
                "b.py",
                FailureReason::ApplyFailed("conflict".into()),
            )],
            status: RepairStatus::Partial,
        };

        let fix = result.fix_patch();
        assert!(fix.contains("a/a.py"));
        assert!(fix.contains("a/c.py"));
        assert!(!fix.contains("a/b.py"));
        assert!(fix.ends_with("+b\n"));
        assert!(!fix.ends_with("\n\n"));
        assert_eq!(result.to_standard_record().number, "1");
    }

    #[test]
    fn apply_method_serializes_with_wire_names() {
        assert_eq!(
            serde_json::to_string(&ApplyMethod::ThreeWay).unwrap(),
            "\"three-way\""
        );
        assert_eq!(
            serde_json::to_string(&RepairStatus::Partial).unwrap(),
            "\"partial\""
        );
    }
}
