//! Orchestration for patchsmith: completion client, prompts, the per-instance
//! repair pipeline and the batch runner.

pub mod batch;
pub mod llm;
pub mod pipeline;

pub use batch::{BatchInstance, BatchManifest, BatchRunner};
pub use llm::{ChatCompletionClient, CompletionService};
pub use pipeline::{InstanceRequest, RepairPipeline, RepairSettings};
