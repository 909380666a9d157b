//! Per-instance repair: completion → edits → candidates → diffs → working tree.

use crate::llm::client::CompletionService;
use crate::llm::prompts::{build_prompt, Localization, PromptProfile};
use anyhow::{Context, Result};
use patchsmith_adapters::config::Config;
use patchsmith_adapters::git_ops::{applier_for, ApplyRequest, PatchApplier};
use patchsmith_adapters::store::ArtifactStore;
use patchsmith_adapters::util::resolve_in_worktree;
use patchsmith_adapters::{WorktreeLease, WorktreeLocks};
use patchsmith_core::aggregate::{FileOutcome, ResultAggregator};
use patchsmith_core::diff::{round_trips, unified_diff_with_index};
use patchsmith_core::edits::{parse_completion, sanitize_edit_path};
use patchsmith_core::matcher::PatchMatcher;
use patchsmith_core::syntax::{Language, SyntaxValidator, TreeSitterValidator};
use patchsmith_core::{
    AppliedPatch, EditCommand, FailureReason, FileEditBatch, FileFailure, RepairResult,
};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RepairSettings {
    pub sandbox_prefixes: Vec<String>,
    pub completion_timeout: Duration,
    pub git_timeout: Duration,
}

impl RepairSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sandbox_prefixes: config.sandbox_prefixes.clone(),
            completion_timeout: config.completion_timeout(),
            git_timeout: config.git_timeout(),
        }
    }
}

impl Default for RepairSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// One unit of work: which instance, which tree, which language.
#[derive(Debug, Clone)]
pub struct InstanceRequest {
    pub instance_id: String,
    pub repo_path: PathBuf,
    pub language: Language,
}

impl InstanceRequest {
    pub fn new(
        instance_id: impl Into<String>,
        repo_path: impl Into<PathBuf>,
        language: Language,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            repo_path: repo_path.into(),
            language,
        }
    }

    fn profile(&self) -> PromptProfile {
        PromptProfile::for_language(self.language)
    }
}

#[derive(Clone)]
pub struct RepairPipeline {
    store: ArtifactStore,
    settings: RepairSettings,
    validator: Arc<dyn SyntaxValidator>,
    locks: WorktreeLocks,
}

impl RepairPipeline {
    pub fn new(store: ArtifactStore, settings: RepairSettings) -> Self {
        let locks = WorktreeLocks::new(store.lock_dir());
        Self {
            store,
            settings,
            validator: Arc::new(TreeSitterValidator),
            locks,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Build the prompt from `<locations_dir>/<instance_id>.json`, then run
    /// [`Self::process_instance`].
    pub async fn repair_from_locations(
        &self,
        request: &InstanceRequest,
        locations_dir: &Path,
        completion: &dyn CompletionService,
    ) -> Result<RepairResult> {
        let localization = match Localization::load_for(locations_dir, &request.instance_id) {
            Ok(loc) => loc,
            Err(err) => {
                tracing::warn!(
                    instance_id = %request.instance_id,
                    error = %err,
                    "localization unavailable"
                );
                let path = locations_dir.join(format!("{}.json", request.instance_id));
                return self.fail_instance(
                    request,
                    FailureReason::LocationNotFound(path.display().to_string()),
                );
            }
        };
        let prompt = build_prompt(&localization, &request.profile());
        self.process_instance(request, &prompt, completion).await
    }

    /// Ask the completion service for edits and apply them. Always yields a
    /// populated result; only persistence failures are errors.
    pub async fn process_instance(
        &self,
        request: &InstanceRequest,
        prompt: &str,
        completion: &dyn CompletionService,
    ) -> Result<RepairResult> {
        if !request.repo_path.is_dir() {
            return self.fail_instance(
                request,
                FailureReason::RepositoryNotFound(request.repo_path.display().to_string()),
            );
        }

        tracing::info!(
            instance_id = %request.instance_id,
            prompt_chars = prompt.len(),
            "requesting completion"
        );
        let raw = match tokio::time::timeout(
            self.settings.completion_timeout,
            completion.complete(prompt),
        )
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => {
                tracing::warn!(
                    instance_id = %request.instance_id,
                    error = %err,
                    "completion failed"
                );
                return self
                    .fail_instance(request, FailureReason::CompletionFailed(err.to_string()));
            }
            Err(_) => {
                tracing::warn!(
                    instance_id = %request.instance_id,
                    timeout_secs = self.settings.completion_timeout.as_secs(),
                    "completion timed out"
                );
                return self.fail_instance(request, FailureReason::CompletionTimeout);
            }
        };

        self.process_raw_output(request, raw).await
    }

    /// Apply an already-obtained completion to the instance's tree.
    pub async fn process_raw_output(
        &self,
        request: &InstanceRequest,
        raw: String,
    ) -> Result<RepairResult> {
        self.store.save_raw(&request.instance_id, &raw)?;

        if !request.repo_path.is_dir() {
            let mut aggregator = ResultAggregator::new(&request.instance_id, raw);
            aggregator.record_instance_failure(FailureReason::RepositoryNotFound(
                request.repo_path.display().to_string(),
            ));
            return self.finish(aggregator);
        }

        let lease = match self.locks.acquire(&request.repo_path).await {
            Ok(lease) => lease,
            Err(err) => {
                let mut aggregator = ResultAggregator::new(&request.instance_id, raw);
                aggregator.record_instance_failure(FailureReason::Io(err.to_string()));
                return self.finish(aggregator);
            }
        };

        let pipeline = self.clone();
        let request = request.clone();
        let result =
            tokio::task::spawn_blocking(move || pipeline.apply_completion(&request, &raw, lease))
                .await
                .context("Patch application task panicked")?;

        self.store.record_result(&result)?;
        log_result(&result);
        Ok(result)
    }

    pub(crate) fn fail_instance(
        &self,
        request: &InstanceRequest,
        reason: FailureReason,
    ) -> Result<RepairResult> {
        let mut aggregator = ResultAggregator::new(&request.instance_id, "");
        aggregator.record_instance_failure(reason);
        self.finish(aggregator)
    }

    fn finish(&self, aggregator: ResultAggregator) -> Result<RepairResult> {
        let result = aggregator.finish();
        self.store.record_result(&result)?;
        log_result(&result);
        Ok(result)
    }

    /// Blocking half of the pipeline; runs while the worktree lease is held.
    fn apply_completion(
        &self,
        request: &InstanceRequest,
        raw: &str,
        lease: WorktreeLease,
    ) -> RepairResult {
        let mut aggregator = ResultAggregator::new(&request.instance_id, raw);
        let worktree = lease.worktree().to_path_buf();

        let parsed = parse_completion(raw, request.profile().code_block_tag());
        for warning in &parsed.warnings {
            tracing::debug!(instance_id = %request.instance_id, %warning, "edit block issue");
        }
        if parsed.batch.is_empty() {
            aggregator.record_instance_failure(FailureReason::NoEditCommands);
            return aggregator.finish();
        }

        let batch = self.regroup(&parsed.batch, &mut aggregator);
        let applier = applier_for(&worktree, self.settings.git_timeout);
        tracing::debug!(
            instance_id = %request.instance_id,
            files = batch.file_count(),
            commands = batch.command_count(),
            applier = applier.name(),
            "applying edits"
        );

        for (path, commands) in batch.iter() {
            let outcome = self.process_file(
                &request.instance_id,
                &worktree,
                path,
                commands,
                applier.as_ref(),
            );
            aggregator.record(outcome);
        }

        drop(lease);
        aggregator.finish()
    }

    /// Key commands by sanitized path so spellings of the same file merge.
    fn regroup(&self, batch: &FileEditBatch, aggregator: &mut ResultAggregator) -> FileEditBatch {
        let mut regrouped = FileEditBatch::new();
        for (token, commands) in batch.iter() {
            match sanitize_edit_path(token, &self.settings.sandbox_prefixes) {
                Ok(path) => {
                    for command in commands {
                        regrouped.push(path.clone(), command.clone());
                    }
                }
                Err(err) => aggregator.record(FileOutcome::failed(
                    token,
                    FailureReason::InvalidPath(err.to_string()),
                )),
            }
        }
        regrouped
    }

    fn process_file(
        &self,
        instance_id: &str,
        worktree: &Path,
        path: &str,
        commands: &[EditCommand],
        applier: &dyn PatchApplier,
    ) -> FileOutcome {
        let target = match resolve_in_worktree(worktree, path) {
            Ok(target) => target,
            Err(err) => return FileOutcome::failed(path, FailureReason::InvalidPath(err)),
        };
        let original = match fs::read_to_string(&target) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::info!(instance_id, file = path, "file not found");
                return FileOutcome::failed(path, FailureReason::FileNotFound);
            }
            Err(err) => return FileOutcome::failed(path, FailureReason::Io(err.to_string())),
        };

        let language = Language::from_path(Path::new(path));
        let matcher = PatchMatcher::new(self.validator.as_ref(), language);
        let candidate = match matcher.synthesize(path, &original, commands) {
            Ok(candidate) => candidate,
            Err(reason) => {
                tracing::info!(instance_id, file = path, %reason, "no usable candidate");
                return FileOutcome::failed(path, reason);
            }
        };

        let index = applier.blob_index(path, &original, &candidate.candidate_content);
        let diff = unified_diff_with_index(
            path,
            &original,
            &candidate.candidate_content,
            index.as_ref(),
        );
        if diff.is_empty() {
            return FileOutcome::failed(path, FailureReason::NoChange);
        }
        if !round_trips(&original, &candidate.candidate_content, &diff) {
            tracing::warn!(
                instance_id,
                file = path,
                "generated diff does not reproduce the candidate"
            );
            return FileOutcome::failed(path, FailureReason::RoundTripMismatch);
        }

        let diff_file = match self.store.save_diff(instance_id, path, &diff) {
            Ok(location) => location,
            Err(err) => return FileOutcome::failed(path, FailureReason::Io(format!("{:#}", err))),
        };

        let request = ApplyRequest {
            file_path: path,
            original: &original,
            diff_text: &diff,
            diff_file: &diff_file,
        };
        let mut patch = AppliedPatch {
            file_path: path.to_string(),
            diff_text: diff.clone(),
            diff_file_location: Some(diff_file.clone()),
            applied: false,
            method: None,
        };

        match applier.apply(&request) {
            Ok(method) => {
                tracing::info!(
                    instance_id,
                    file = path,
                    strategy = %candidate.strategy().label(),
                    method = method.as_str(),
                    "patch applied"
                );
                patch.applied = true;
                patch.method = Some(method);
                FileOutcome::Applied(patch)
            }
            Err(err) => {
                tracing::warn!(instance_id, file = path, error = %err, "patch did not apply");
                FileOutcome::Rejected {
                    patch: Some(patch),
                    failure: FileFailure::file(path, FailureReason::ApplyFailed(err)),
                }
            }
        }
    }
}

fn log_result(result: &RepairResult) {
    tracing::info!(
        instance_id = %result.instance_id,
        status = result.status.as_str(),
        applied = result.applied_files.len(),
        failed = result.failed_files.len(),
        "instance finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::CompletionFuture;
    use patchsmith_core::{ApplyMethod, RepairStatus};
    use tempfile::tempdir;

    struct Canned(String);

    impl CompletionService for Canned {
        fn complete<'a>(&'a self, _prompt: &'a str) -> CompletionFuture<'a> {
            let text = self.0.clone();
            Box::pin(async move { Ok(text) })
        }
    }

    struct Stalled;

    impl CompletionService for Stalled {
        fn complete<'a>(&'a self, _prompt: &'a str) -> CompletionFuture<'a> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(String::new())
            })
        }
    }

    struct Broken;

    impl CompletionService for Broken {
        fn complete<'a>(&'a self, _prompt: &'a str) -> CompletionFuture<'a> {
            Box::pin(async move { Err(anyhow::anyhow!("connection reset")) })
        }
    }

    fn pipeline(out: &Path) -> RepairPipeline {
        RepairPipeline::new(ArtifactStore::new(out), RepairSettings::default())
    }

    fn completion(path: &str, search: &str, replace: &str) -> String {
        format!(
            "Fix below.\n```python\n### {}\n<<<<<<< SEARCH\n{}\n=======\n{}\n>>>>>>> REPLACE\n```\n",
            path, search, replace
        )
    }

    #[tokio::test]
    async fn test_applies_edit_to_plain_directory() {
        let repo = tempdir().unwrap();
        let out = tempdir().unwrap();
        fs::create_dir_all(repo.path().join("pkg")).unwrap();
        fs::write(repo.path().join("pkg/mod.py"), "def f():\n    return 1\n").unwrap();

        let request = InstanceRequest::new("acme__widgets-4", repo.path(), Language::Python);
        let raw = completion("playground/widgets/pkg/mod.py", "    return 1", "    return 2");
        let result = pipeline(out.path())
            .process_instance(&request, "prompt", &Canned(raw.clone()))
            .await
            .unwrap();

        assert_eq!(result.status, RepairStatus::Success);
        assert_eq!(result.applied_files, vec!["pkg/mod.py".to_string()]);
        assert_eq!(result.processed_patches[0].method, Some(ApplyMethod::Direct));
        assert_eq!(
            fs::read_to_string(repo.path().join("pkg/mod.py")).unwrap(),
            "def f():\n    return 2\n"
        );

        let store = ArtifactStore::new(out.path());
        assert_eq!(store.load_raw("acme__widgets-4").unwrap().as_deref(), Some(raw.as_str()));
        assert!(store.diff_path("acme__widgets-4", "pkg/mod.py").exists());
        assert!(store.result_path("acme__widgets-4").exists());
    }

    #[tokio::test]
    async fn test_missing_repository_fails_without_completion() {
        let out = tempdir().unwrap();
        let request = InstanceRequest::new("o__r-1", out.path().join("missing"), Language::Python);
        let result = pipeline(out.path())
            .process_instance(&request, "prompt", &Broken)
            .await
            .unwrap();
        assert_eq!(result.status, RepairStatus::Failed);
        assert!(matches!(
            result.failed_files[0].reason,
            FailureReason::RepositoryNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_completion_timeout_is_reported() {
        let repo = tempdir().unwrap();
        let out = tempdir().unwrap();
        let settings = RepairSettings {
            completion_timeout: Duration::from_millis(50),
            ..RepairSettings::default()
        };
        let pipeline = RepairPipeline::new(ArtifactStore::new(out.path()), settings);
        let request = InstanceRequest::new("o__r-2", repo.path(), Language::Python);

        let result = pipeline.process_instance(&request, "p", &Stalled).await.unwrap();
        assert_eq!(result.failed_files[0].reason, FailureReason::CompletionTimeout);
        assert_eq!(result.failed_files[0].reason.to_string(), "LLM response timeout");
    }

    #[tokio::test]
    async fn test_completion_error_is_reported() {
        let repo = tempdir().unwrap();
        let out = tempdir().unwrap();
        let request = InstanceRequest::new("o__r-3", repo.path(), Language::Python);
        let result = pipeline(out.path())
            .process_instance(&request, "p", &Broken)
            .await
            .unwrap();
        assert_eq!(
            result.failed_files[0].reason.to_string(),
            "Failed to get LLM response: connection reset"
        );
    }

    #[tokio::test]
    async fn test_prose_without_edits_is_no_edit_commands() {
        let repo = tempdir().unwrap();
        let out = tempdir().unwrap();
        let request = InstanceRequest::new("o__r-4", repo.path(), Language::Python);
        let result = pipeline(out.path())
            .process_raw_output(&request, "I could not find the bug.".to_string())
            .await
            .unwrap();
        assert_eq!(result.status, RepairStatus::Failed);
        assert_eq!(result.failed_files[0].reason, FailureReason::NoEditCommands);
        assert_eq!(result.failed_files[0].file_path, None);
    }

    #[tokio::test]
    async fn test_sibling_files_fail_independently() {
        let repo = tempdir().unwrap();
        let out = tempdir().unwrap();
        fs::write(repo.path().join("a.py"), "x = 1\n").unwrap();
        let raw = format!(
            "{}{}{}",
            completion("a.py", "x = 1", "x = 2"),
            completion("missing.py", "y = 1", "y = 2"),
            completion("../escape.py", "z = 1", "z = 2"),
        );
        let request = InstanceRequest::new("o__r-5", repo.path(), Language::Python);
        let result = pipeline(out.path())
            .process_raw_output(&request, raw)
            .await
            .unwrap();

        assert_eq!(result.status, RepairStatus::Partial);
        assert_eq!(result.applied_files, vec!["a.py".to_string()]);
        let reasons: Vec<String> = result
            .failed_files
            .iter()
            .map(|f| f.reason.to_string())
            .collect();
        assert!(reasons.contains(&"file not found".to_string()));
        assert!(reasons.iter().any(|r| r.starts_with("invalid file path")));
    }

    #[tokio::test]
    async fn test_missing_location_file_fails_instance() {
        let repo = tempdir().unwrap();
        let out = tempdir().unwrap();
        let request = InstanceRequest::new("o__r-6", repo.path(), Language::Python);
        let result = pipeline(out.path())
            .repair_from_locations(&request, &out.path().join("locations"), &Broken)
            .await
            .unwrap();
        assert!(matches!(
            result.failed_files[0].reason,
            FailureReason::LocationNotFound(_)
        ));
    }
}
