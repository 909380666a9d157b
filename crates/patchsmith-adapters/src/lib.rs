//! Runtime adapters for patchsmith (config, git apply, artifacts, locking).

pub mod config;
pub mod git_ops;
pub mod lock;
pub mod store;
pub mod util;

pub use config::Config;
pub use git_ops::{applier_for, ApplyRequest, GitApplier, InProcessApplier, PatchApplier};
pub use lock::{WorktreeLease, WorktreeLocks};
pub use store::ArtifactStore;
