pub mod client;
pub mod prompts;

pub use client::{ChatCompletionClient, CompletionFuture, CompletionService};
pub use prompts::{build_prompt, Localization, PromptProfile};
