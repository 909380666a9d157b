//! Bounded-parallel repair over a manifest of instances.

use crate::llm::client::CompletionService;
use crate::pipeline::{InstanceRequest, RepairPipeline};
use anyhow::{anyhow, Context, Result};
use patchsmith_core::aggregate::ResultAggregator;
use patchsmith_core::syntax::Language;
use patchsmith_core::{FailureReason, RepairResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchManifest {
    pub schema_version: u32,
    #[serde(default, rename = "instance")]
    pub instances: Vec<BatchInstance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInstance {
    pub id: String,
    pub repo_path: PathBuf,
    #[serde(default)]
    pub language: Option<String>,
    /// Completion text already on disk; skips the completion service.
    #[serde(default)]
    pub raw_output: Option<PathBuf>,
}

impl BatchManifest {
    /// Relative paths in the manifest resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read batch manifest '{}'", path.display()))?;
        let mut manifest: BatchManifest = toml::from_str(&content)
            .with_context(|| format!("Failed to parse batch manifest TOML '{}'", path.display()))?;
        manifest.validate()?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for instance in &mut manifest.instances {
            if instance.repo_path.is_relative() {
                instance.repo_path = base.join(&instance.repo_path);
            }
            if let Some(raw) = instance.raw_output.as_mut() {
                if raw.is_relative() {
                    *raw = base.join(&*raw);
                }
            }
        }
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != 1 {
            return Err(anyhow!(
                "Unsupported batch manifest schema_version={} (expected 1)",
                self.schema_version
            ));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for instance in &self.instances {
            if instance.id.trim().is_empty() {
                return Err(anyhow!("Batch instance id must not be empty"));
            }
            let id_ok = instance
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
            if !id_ok || instance.id.starts_with('.') {
                return Err(anyhow!(
                    "Batch instance id '{}' contains unsupported characters (allowed: a-zA-Z0-9_.-)",
                    instance.id
                ));
            }
            if !seen.insert(instance.id.as_str()) {
                return Err(anyhow!("Duplicate batch instance id '{}'", instance.id));
            }
            if instance.repo_path.as_os_str().is_empty() {
                return Err(anyhow!(
                    "Batch instance '{}' repo_path must not be empty",
                    instance.id
                ));
            }
        }
        Ok(())
    }
}

pub struct BatchRunner {
    pipeline: RepairPipeline,
    completion: Option<Arc<dyn CompletionService>>,
    locations_dir: Option<PathBuf>,
    default_language: Language,
    workers: usize,
}

impl BatchRunner {
    pub fn new(pipeline: RepairPipeline, workers: usize) -> Self {
        Self {
            pipeline,
            completion: None,
            locations_dir: None,
            default_language: Language::Python,
            workers: workers.max(1),
        }
    }

    pub fn with_completion(
        mut self,
        completion: Arc<dyn CompletionService>,
        locations_dir: PathBuf,
    ) -> Self {
        self.completion = Some(completion);
        self.locations_dir = Some(locations_dir);
        self
    }

    pub fn with_default_language(mut self, language: Language) -> Self {
        self.default_language = language;
        self
    }

    /// Run every instance, at most `workers` at a time. Results come back in
    /// manifest order.
    pub async fn run(&self, manifest: &BatchManifest) -> Vec<RepairResult> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(manifest.instances.len());

        for instance in manifest.instances.iter().cloned() {
            let semaphore = semaphore.clone();
            let pipeline = self.pipeline.clone();
            let completion = self.completion.clone();
            let locations_dir = self.locations_dir.clone();
            let language = instance
                .language
                .as_deref()
                .map(Language::from_tag)
                .filter(|l| *l != Language::Unknown)
                .unwrap_or(self.default_language);

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let id = instance.id.clone();
                let outcome = run_instance(
                    &pipeline,
                    completion.as_deref(),
                    locations_dir.as_deref(),
                    instance,
                    language,
                )
                .await;
                match outcome {
                    Ok(result) => result,
                    Err(err) => {
                        let detail = format!("{:#}", err);
                        tracing::error!(
                            instance_id = %id,
                            error = %detail,
                            "instance could not be recorded"
                        );
                        unrecorded_failure(&id, FailureReason::Io(detail))
                    }
                }
            }));
        }

        let ids: Vec<String> = manifest.instances.iter().map(|i| i.id.clone()).collect();
        futures::future::join_all(handles)
            .await
            .into_iter()
            .zip(ids)
            .map(|(joined, id)| match joined {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(instance_id = %id, error = %err, "instance task failed");
                    let detail = format!("instance task failed: {}", err);
                    unrecorded_failure(&id, FailureReason::Io(detail))
                }
            })
            .collect()
    }
}

async fn run_instance(
    pipeline: &RepairPipeline,
    completion: Option<&dyn CompletionService>,
    locations_dir: Option<&Path>,
    instance: BatchInstance,
    language: Language,
) -> Result<RepairResult> {
    let request = InstanceRequest::new(instance.id, instance.repo_path, language);

    if let Some(raw_path) = instance.raw_output {
        return match std::fs::read_to_string(&raw_path) {
            Ok(raw) => pipeline.process_raw_output(&request, raw).await,
            Err(err) => pipeline.fail_instance(
                &request,
                FailureReason::Io(format!("Failed to read '{}': {}", raw_path.display(), err)),
            ),
        };
    }

    match (completion, locations_dir) {
        (Some(completion), Some(locations_dir)) => {
            pipeline
                .repair_from_locations(&request, locations_dir, completion)
                .await
        }
        _ => pipeline.fail_instance(
            &request,
            FailureReason::CompletionFailed(
                "no completion service configured and no raw_output given".to_string(),
            ),
        ),
    }
}

fn unrecorded_failure(instance_id: &str, reason: FailureReason) -> RepairResult {
    let mut aggregator = ResultAggregator::new(instance_id, "");
    aggregator.record_instance_failure(reason);
    aggregator.finish()
}
