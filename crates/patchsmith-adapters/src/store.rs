//! On-disk artifacts for a run directory.
//!
//! ```text
//! <root>/<instance_id>.patch                      verbatim completion
//! <root>/diff_patches/<instance_id>_<path>.diff   one diff per file
//! <root>/results/<instance_id>.json               full RepairResult
//! <root>/patch_results.jsonl                      StandardRecord per instance
//! ```

use crate::lock::{FileLock, DEFAULT_LOCK_TIMEOUT};
use crate::util::{sanitize_component, write_atomic};
use anyhow::{Context, Result};
use patchsmith_core::aggregate::{FileOutcome, ResultAggregator, RunSummary};
use patchsmith_core::diff::parse_unified_diff;
use patchsmith_core::{
    AppliedPatch, ApplyMethod, FailureReason, RepairResult, RepairStatus, StandardRecord,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const DIFF_DIR: &str = "diff_patches";
pub const RESULTS_DIR: &str = "results";
pub const STANDARD_JSONL: &str = "patch_results.jsonl";
const RAW_EXTENSION: &str = "patch";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.root.join(".locks")
    }

    pub fn raw_output_path(&self, instance_id: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", sanitize_component(instance_id), RAW_EXTENSION))
    }

    pub fn diff_path(&self, instance_id: &str, file_path: &str) -> PathBuf {
        self.root.join(DIFF_DIR).join(format!(
            "{}.diff",
            sanitize_component(&format!("{}_{}", instance_id, file_path))
        ))
    }

    pub fn result_path(&self, instance_id: &str) -> PathBuf {
        self.root
            .join(RESULTS_DIR)
            .join(format!("{}.json", sanitize_component(instance_id)))
    }

    pub fn standard_path(&self) -> PathBuf {
        self.root.join(STANDARD_JSONL)
    }

    pub fn save_raw(&self, instance_id: &str, text: &str) -> Result<PathBuf> {
        let path = self.raw_output_path(instance_id);
        write_atomic(&path, text)
            .with_context(|| format!("Failed to write raw output '{}'", path.display()))?;
        Ok(path)
    }

    pub fn load_raw(&self, instance_id: &str) -> Result<Option<String>> {
        let path = self.raw_output_path(instance_id);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .with_context(|| format!("Failed to read '{}'", path.display()))
    }

    pub fn save_diff(&self, instance_id: &str, file_path: &str, diff: &str) -> Result<PathBuf> {
        let path = self.diff_path(instance_id, file_path);
        write_atomic(&path, diff)
            .with_context(|| format!("Failed to write diff '{}'", path.display()))?;
        Ok(path)
    }

    pub fn save_result(&self, result: &RepairResult) -> Result<PathBuf> {
        let path = self.result_path(&result.instance_id);
        let content =
            serde_json::to_string_pretty(result).context("Failed to serialize repair result")?;
        write_atomic(&path, &content)
            .with_context(|| format!("Failed to write result '{}'", path.display()))?;
        Ok(path)
    }

    /// Every readable result record, ordered by instance id. Unreadable
    /// records are skipped with a warning.
    pub fn load_results(&self) -> Result<Vec<RepairResult>> {
        let dir = self.root.join(RESULTS_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for entry in WalkDir::new(&dir).max_depth(1).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to list '{}'", dir.display()))?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }
            let parsed = fs::read_to_string(path)
                .map_err(anyhow::Error::from)
                .and_then(|c| {
                    serde_json::from_str::<RepairResult>(&c).map_err(anyhow::Error::from)
                });
            match parsed {
                Ok(result) => results.push(result),
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "skipping unreadable result"
                    )
                }
            }
        }
        results.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(results)
    }

    /// Replace (or add) this instance's line in `patch_results.jsonl`.
    pub fn upsert_standard(&self, result: &RepairResult) -> Result<()> {
        let path = self.standard_path();
        let _lock = FileLock::acquire(
            &self.lock_dir().join("patch_results.lock"),
            DEFAULT_LOCK_TIMEOUT,
        )?;

        let record = result.to_standard_record();
        let key = standard_key(&record);
        let mut lines: Vec<String> = Vec::new();
        let mut replaced = false;

        if path.exists() {
            let existing = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read '{}'", path.display()))?;
            for line in existing.lines().filter(|l| !l.trim().is_empty()) {
                let same = serde_json::from_str::<StandardRecord>(line)
                    .map(|r| standard_key(&r) == key)
                    .unwrap_or(false);
                if same {
                    if !replaced {
                        lines.push(serde_json::to_string(&record)?);
                        replaced = true;
                    }
                } else {
                    lines.push(line.to_string());
                }
            }
        }
        if !replaced {
            lines.push(serde_json::to_string(&record)?);
        }

        let mut content = lines.join("\n");
        content.push('\n');
        write_atomic(&path, &content)
            .with_context(|| format!("Failed to write '{}'", path.display()))
    }

    /// Persist a finished result: the full record plus its standard line.
    pub fn record_result(&self, result: &RepairResult) -> Result<()> {
        self.save_result(result)?;
        self.upsert_standard(result)
    }

    pub fn summary(&self) -> Result<RunSummary> {
        let results = self.load_results()?;
        Ok(RunSummary::from_results(&results))
    }

    /// Write successful results with a non-empty fix patch as JSONL.
    pub fn export_standard(&self, out: &Path) -> Result<usize> {
        let results = self.load_results()?;
        let mut lines = Vec::new();
        for result in &results {
            if result.status != RepairStatus::Success || result.processed_patches.is_empty() {
                continue;
            }
            let record = result.to_standard_record();
            if record.fix_patch.trim().is_empty() {
                continue;
            }
            lines.push(serde_json::to_string(&record)?);
        }

        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        write_atomic(out, &content)
            .with_context(|| format!("Failed to write '{}'", out.display()))?;
        Ok(lines.len())
    }

    /// Build results for raw outputs that have diff files but no result
    /// record, treating every found diff as applied.
    pub fn collect_untracked(&self) -> Result<Vec<RepairResult>> {
        let mut collected = Vec::new();
        for instance_id in self.raw_output_ids()? {
            if self.result_path(&instance_id).exists() {
                continue;
            }
            let raw = self.load_raw(&instance_id)?.unwrap_or_default();
            let mut aggregator = ResultAggregator::new(&instance_id, raw);

            let diffs = self.diff_files_for(&instance_id)?;
            if diffs.is_empty() {
                aggregator.record_instance_failure(FailureReason::NoDiffPatches);
            }
            for diff_file in diffs {
                let diff_text = fs::read_to_string(&diff_file)
                    .with_context(|| format!("Failed to read '{}'", diff_file.display()))?;
                let file_path = match parse_unified_diff(&diff_text) {
                    Ok(parsed) => parsed.new_path,
                    Err(err) => {
                        tracing::warn!(
                            path = %diff_file.display(),
                            error = %err,
                            "skipping unparsable diff"
                        );
                        continue;
                    }
                };
                aggregator.record(FileOutcome::Applied(AppliedPatch {
                    file_path,
                    diff_text,
                    diff_file_location: Some(diff_file),
                    applied: true,
                    method: Some(ApplyMethod::Direct),
                }));
            }

            let result = aggregator.finish();
            self.record_result(&result)?;
            tracing::info!(
                instance_id = %result.instance_id,
                patches = result.processed_patches.len(),
                "collected"
            );
            collected.push(result);
        }
        Ok(collected)
    }

    fn raw_output_ids(&self) -> Result<BTreeSet<String>> {
        let mut ids = BTreeSet::new();
        if !self.root.exists() {
            return Ok(ids);
        }
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| format!("Failed to list '{}'", self.root.display()))?;
            let path = entry.path();
            if entry.file_type().is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(RAW_EXTENSION)
            {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.insert(stem.to_string());
                }
            }
        }
        Ok(ids)
    }

    fn diff_files_for(&self, instance_id: &str) -> Result<Vec<PathBuf>> {
        let dir = self.root.join(DIFF_DIR);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_", sanitize_component(instance_id));
        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to list '{}'", dir.display()))?;
            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_file() && name.starts_with(&prefix) && name.ends_with(".diff") {
                files.push(entry.path().to_path_buf());
            }
        }
        Ok(files)
    }
}

fn standard_key(record: &StandardRecord) -> (String, String, String) {
    (
        record.org.clone(),
        record.repo.clone(),
        record.number.clone(),
    )
}
