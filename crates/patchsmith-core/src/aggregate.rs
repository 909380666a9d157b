//! Folding per-file outcomes into instance results and run summaries.

use crate::protocol::{
    AppliedPatch, FailureReason, FileFailure, InstanceId, RepairResult, RepairStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Applied(AppliedPatch),
    /// `patch` is present when a diff was produced but could not be applied.
    Rejected {
        patch: Option<AppliedPatch>,
        failure: FileFailure,
    },
}

impl FileOutcome {
    pub fn failed(path: impl Into<String>, reason: FailureReason) -> Self {
        FileOutcome::Rejected {
            patch: None,
            failure: FileFailure::file(path, reason),
        }
    }
}

/// Accumulates outcomes for one instance. A file lands in exactly one of the
/// applied or failed lists; recording it again replaces the earlier outcome.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    instance_id: String,
    run_id: String,
    raw_output_text: String,
    processed_patches: Vec<AppliedPatch>,
    applied_files: Vec<String>,
    failed_files: Vec<FileFailure>,
}

impl ResultAggregator {
    pub fn new(instance_id: impl Into<String>, raw_output_text: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            run_id: Uuid::new_v4().to_string(),
            raw_output_text: raw_output_text.into(),
            processed_patches: Vec::new(),
            applied_files: Vec::new(),
            failed_files: Vec::new(),
        }
    }

    fn forget(&mut self, path: &str) {
        self.applied_files.retain(|p| p != path);
        self.failed_files
            .retain(|f| f.file_path.as_deref() != Some(path));
        self.processed_patches.retain(|p| p.file_path != path);
    }

    pub fn record(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Applied(patch) => {
                self.forget(&patch.file_path);
                self.applied_files.push(patch.file_path.clone());
                self.processed_patches.push(patch);
            }
            FileOutcome::Rejected { patch, failure } => {
                if let Some(path) = failure.file_path.clone() {
                    self.forget(&path);
                }
                if let Some(patch) = patch {
                    self.processed_patches.push(patch);
                }
                self.failed_files.push(failure);
            }
        }
    }

    /// Record a failure that never reached any file.
    pub fn record_instance_failure(&mut self, reason: FailureReason) {
        self.failed_files.push(FileFailure::instance(reason));
    }

    pub fn finish(self) -> RepairResult {
        let status = RepairStatus::derive(self.applied_files.len(), self.failed_files.len());
        let id = InstanceId::parse(&self.instance_id);
        RepairResult {
            instance_id: self.instance_id,
            org: id.org,
            repo: id.repo,
            number: id.number,
            run_id: self.run_id,
            timestamp: Utc::now(),
            raw_output_text: self.raw_output_text,
            processed_patches: self.processed_patches,
            applied_files: self.applied_files,
            failed_files: self.failed_files,
            status,
        }
    }
}

/// Counts over a set of instance results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_instances: usize,
    pub success_instances: usize,
    pub partial_instances: usize,
    pub failed_instances: usize,
    pub success_rate: f64,
    pub total_files_patched: usize,
    pub total_applied_patches: usize,
}

impl RunSummary {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a RepairResult>) -> Self {
        let mut summary = RunSummary::default();
        for result in results {
            summary.total_instances += 1;
            match result.status {
                RepairStatus::Success => summary.success_instances += 1,
                RepairStatus::Partial => summary.partial_instances += 1,
                RepairStatus::Failed => summary.failed_instances += 1,
            }
            summary.total_files_patched += result.processed_patches.len();
            summary.total_applied_patches += result.applied_files.len();
        }
        if summary.total_instances > 0 {
            summary.success_rate =
                summary.success_instances as f64 / summary.total_instances as f64 * 100.0;
        }
        summary
    }

    pub fn render(&self) -> String {
        format!(
            "instances: {}\nsuccess: {} ({:.1}%)\npartial: {}\nfailed: {}\nfile patches: {}\napplied: {}",
            self.total_instances,
            self.success_instances,
            self.success_rate,
            self.partial_instances,
            self.failed_instances,
            self.total_files_patched,
            self.total_applied_patches
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ApplyMethod;

    fn applied(path: &str) -> AppliedPatch {
        AppliedPatch {
            file_path: path.to_string(),
            diff_text: format!("diff --git a/{0} b/{0}\n", path),
            diff_file_location: None,
            applied: true,
            method: Some(ApplyMethod::Direct),
        }
    }

    #[test]
    fn all_applied_is_success() {
        let mut agg = ResultAggregator::new("psf__requests-1", "raw");
        agg.record(FileOutcome::Applied(applied("a.py")));
        agg.record(FileOutcome::Applied(applied("b.py")));
        let result = agg.finish();
        assert_eq!(result.status, RepairStatus::Success);
        assert_eq!(result.org, "psf");
        assert_eq!(result.repo, "requests");
        assert_eq!(result.number, "1");
        assert_eq!(result.applied_files, vec!["a.py", "b.py"]);
    }

    #[test]
    fn mixed_outcomes_are_partial_and_disjoint() {
        let mut agg = ResultAggregator::new("o__r-2", "raw");
        agg.record(FileOutcome::Applied(applied("a.py")));
        let mut rejected = applied("b.py");
        rejected.applied = false;
        rejected.method = None;
        agg.record(FileOutcome::Rejected {
            patch: Some(rejected),
            failure: FileFailure::file("b.py", FailureReason::ApplyFailed("conflict".into())),
        });
        let result = agg.finish();
        assert_eq!(result.status, RepairStatus::Partial);
        assert_eq!(result.processed_patches.len(), 2);
        assert_eq!(result.failed_files.len(), 1);
        assert!(!result.applied_files.contains(&"b.py".to_string()));
        assert!(!result.fix_patch().contains("b.py"));
    }

    #[test]
    fn re_recording_a_file_replaces_its_outcome() {
        let mut agg = ResultAggregator::new("o__r-3", "raw");
        agg.record(FileOutcome::failed("a.py", FailureReason::NoChange));
        agg.record(FileOutcome::Applied(applied("a.py")));
        let result = agg.finish();
        assert_eq!(result.status, RepairStatus::Success);
        assert!(result.failed_files.is_empty());
    }

    #[test]
    fn instance_failure_without_files_is_failed() {
        let mut agg = ResultAggregator::new("o__r-4", "");
        agg.record_instance_failure(FailureReason::NoEditCommands);
        let result = agg.finish();
        assert_eq!(result.status, RepairStatus::Failed);
        assert_eq!(result.failed_files[0].file_path, None);
        assert_eq!(result.fix_patch(), "");
    }

    #[test]
    fn summary_counts_statuses() {
        let mut ok = ResultAggregator::new("o__r-1", "");
        ok.record(FileOutcome::Applied(applied("a.py")));
        let mut bad = ResultAggregator::new("o__r-2", "");
        bad.record(FileOutcome::failed("a.py", FailureReason::NoValidEdit));
        let results = vec![ok.finish(), bad.finish()];

        let summary = RunSummary::from_results(&results);
        assert_eq!(summary.total_instances, 2);
        assert_eq!(summary.success_instances, 1);
        assert_eq!(summary.failed_instances, 1);
        assert_eq!(summary.total_applied_patches, 1);
        assert!((summary.success_rate - 50.0).abs() < f64::EPSILON);
        assert!(summary.render().contains("success: 1 (50.0%)"));
    }
}
