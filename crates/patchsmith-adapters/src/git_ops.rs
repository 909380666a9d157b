//! Applying generated diffs to a working tree.
//!
//! Git checkouts go through `git apply`, first directly and then with a
//! three-way merge against the original blob. Plain directories fall back to
//! the in-process applier, which has no merge tier.

use crate::util::{resolve_in_worktree, run_command_with_timeout, write_atomic, CommandRunResult};
use anyhow::{Context, Result};
use git2::{ObjectType, Oid, Repository};
use patchsmith_core::diff::{apply_diff_text, BlobIndex, Tolerance};
use patchsmith_core::ApplyMethod;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

const DEFAULT_FILE_MODE: &str = "100644";

/// Everything an applier needs to bring one file's diff into the tree.
#[derive(Debug, Clone, Copy)]
pub struct ApplyRequest<'a> {
    /// Sanitized, worktree-relative path.
    pub file_path: &'a str,
    /// The content the diff was computed from.
    pub original: &'a str,
    pub diff_text: &'a str,
    /// Where the diff was saved on disk.
    pub diff_file: &'a Path,
}

pub trait PatchApplier: Send + Sync {
    /// Blob ids and mode for the diff's `index` line, when the tree has them.
    fn blob_index(&self, file_path: &str, original: &str, candidate: &str) -> Option<BlobIndex>;

    /// Apply the diff, returning how it landed or the underlying error text.
    fn apply(&self, request: &ApplyRequest<'_>) -> std::result::Result<ApplyMethod, String>;

    fn name(&self) -> &'static str;
}

/// Open a repository by discovering from the given path.
pub fn open_repo_discover(repo_path: &Path) -> Result<Repository> {
    Repository::discover(repo_path).with_context(|| {
        format!(
            "Failed to open repository from path '{}'",
            repo_path.display()
        )
    })
}

/// Run git in `dir` with prompts disabled.
pub fn run_git(dir: &Path, args: &[&str], timeout: Duration) -> Result<CommandRunResult> {
    let mut cmd = Command::new("git");
    cmd.current_dir(dir)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_ASKPASS", "/bin/true");
    run_command_with_timeout(&mut cmd, timeout)
        .map_err(|e| anyhow::anyhow!("Failed to run git {}: {}", args.join(" "), e))
}

/// Checked once per process; later calls reuse the first answer.
pub fn git_cli_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(check_git_cli)
}

fn check_git_cli() -> bool {
    let mut cmd = Command::new("git");
    cmd.arg("--version");
    run_command_with_timeout(&mut cmd, Duration::from_secs(10))
        .map(|r| r.success())
        .unwrap_or(false)
}

/// Pick the applier for a worktree: git when it is a checkout and the git CLI
/// is present, in-process otherwise.
pub fn applier_for(worktree: &Path, git_timeout: Duration) -> Box<dyn PatchApplier> {
    if git_cli_available() {
        match GitApplier::open(worktree, git_timeout) {
            Ok(applier) => return Box::new(applier),
            Err(err) => {
                tracing::debug!(
                    worktree = %worktree.display(),
                    error = %err,
                    "not a git checkout; applying in-process"
                );
            }
        }
    }
    Box::new(InProcessApplier::new(worktree))
}

pub struct GitApplier {
    worktree: PathBuf,
    repo_root: PathBuf,
    git_dir: PathBuf,
    /// Worktree location inside the repository, for `--directory`.
    prefix: Option<String>,
    timeout: Duration,
}

impl GitApplier {
    pub fn open(worktree: &Path, timeout: Duration) -> Result<Self> {
        let repo = open_repo_discover(worktree)?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| anyhow::anyhow!("Repository at '{}' is bare", worktree.display()))?;
        let repo_root = workdir
            .canonicalize()
            .with_context(|| format!("Failed to resolve '{}'", workdir.display()))?;
        let worktree = worktree
            .canonicalize()
            .with_context(|| format!("Failed to resolve '{}'", worktree.display()))?;

        let prefix = worktree
            .strip_prefix(&repo_root)
            .ok()
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            .filter(|rel| !rel.is_empty());

        Ok(Self {
            git_dir: repo.path().to_path_buf(),
            worktree,
            repo_root,
            prefix,
            timeout,
        })
    }

    fn repo(&self) -> Result<Repository> {
        open_repo_discover(&self.repo_root)
    }

    fn repo_relative(&self, file_path: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, file_path),
            None => file_path.to_string(),
        }
    }

    fn file_mode(&self, repo: &Repository, file_path: &str) -> String {
        let rel = self.repo_relative(file_path);
        repo.index()
            .ok()
            .and_then(|index| index.get_path(Path::new(&rel), 0))
            .map(|entry| format!("{:o}", entry.mode))
            .unwrap_or_else(|| DEFAULT_FILE_MODE.to_string())
    }

    fn apply_args(&self, extra: &[&str], diff_file: &str) -> Vec<String> {
        let mut args = vec!["apply".to_string()];
        args.extend(extra.iter().map(|s| s.to_string()));
        args.push("--whitespace=nowarn".to_string());
        if let Some(prefix) = &self.prefix {
            args.push(format!("--directory={}", prefix));
        }
        args.push(diff_file.to_string());
        args
    }

    fn git_apply(&self, extra: &[&str], diff_file: &Path) -> std::result::Result<(), String> {
        let diff_file = diff_file.to_string_lossy().to_string();
        let args = self.apply_args(extra, &diff_file);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = run_git(&self.repo_root, &arg_refs, self.timeout).map_err(|e| e.to_string())?;
        if result.timed_out {
            return Err(format!("git apply timed out after {}s", self.timeout.as_secs()));
        }
        if result.success() {
            Ok(())
        } else {
            Err(result.diagnostics())
        }
    }

    /// Make sure the pre-edit blob exists so `--3way` has a merge base.
    fn store_original_blob(&self, original: &str) {
        match self.repo() {
            Ok(repo) => {
                if let Err(err) = repo.blob(original.as_bytes()) {
                    tracing::warn!(error = %err, "failed to write original blob");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to open repository for blob write"),
        }
    }
}

impl PatchApplier for GitApplier {
    fn blob_index(&self, file_path: &str, original: &str, candidate: &str) -> Option<BlobIndex> {
        let old_id = Oid::hash_object(ObjectType::Blob, original.as_bytes()).ok()?;
        let new_id = Oid::hash_object(ObjectType::Blob, candidate.as_bytes()).ok()?;
        let mode = match self.repo() {
            Ok(repo) => self.file_mode(&repo, file_path),
            Err(_) => DEFAULT_FILE_MODE.to_string(),
        };
        Some(BlobIndex {
            old_id: old_id.to_string(),
            new_id: new_id.to_string(),
            mode,
        })
    }

    fn apply(&self, request: &ApplyRequest<'_>) -> std::result::Result<ApplyMethod, String> {
        let target = resolve_in_worktree(&self.worktree, request.file_path)?;
        self.store_original_blob(request.original);

        let direct_err = match self.git_apply(&["--ignore-whitespace"], request.diff_file) {
            Ok(()) => return Ok(ApplyMethod::Direct),
            Err(err) => err,
        };
        tracing::debug!(
            file = request.file_path,
            error = %direct_err,
            "direct apply failed; trying three-way"
        );

        let index_path = self.git_dir.join("index");
        let index_backup = fs::read(&index_path).ok();
        let file_backup = fs::read(&target).ok();

        match self.git_apply(&["--3way"], request.diff_file) {
            Ok(()) => Ok(ApplyMethod::ThreeWay),
            Err(three_way_err) => {
                restore_bytes(&index_path, index_backup.as_deref());
                restore_bytes(&target, file_backup.as_deref());
                Err(if three_way_err.is_empty() {
                    direct_err
                } else {
                    three_way_err
                })
            }
        }
    }

    fn name(&self) -> &'static str {
        "git"
    }
}

fn restore_bytes(path: &Path, content: Option<&[u8]>) {
    let result = match content {
        Some(bytes) => fs::write(path, bytes),
        None if path.exists() => fs::remove_file(path),
        None => Ok(()),
    };
    if let Err(err) = result {
        tracing::warn!(
            path = %path.display(),
            error = %err,
            "failed to restore after three-way apply"
        );
    }
}

/// Whitespace-tolerant in-memory application for trees without git.
pub struct InProcessApplier {
    worktree: PathBuf,
}

impl InProcessApplier {
    pub fn new(worktree: &Path) -> Self {
        Self {
            worktree: worktree.to_path_buf(),
        }
    }
}

impl PatchApplier for InProcessApplier {
    fn blob_index(&self, _file_path: &str, _original: &str, _candidate: &str) -> Option<BlobIndex> {
        None
    }

    fn apply(&self, request: &ApplyRequest<'_>) -> std::result::Result<ApplyMethod, String> {
        let target = resolve_in_worktree(&self.worktree, request.file_path)?;
        let current = fs::read_to_string(&target)
            .map_err(|e| format!("Failed to read {}: {}", request.file_path, e))?;
        let patched = apply_diff_text(&current, request.diff_text, Tolerance::IgnoreWhitespace)
            .map_err(|e| e.to_string())?;
        write_atomic(&target, &patched).map_err(|e| e.to_string())?;
        Ok(ApplyMethod::Direct)
    }

    fn name(&self) -> &'static str {
        "in-process"
    }
}
