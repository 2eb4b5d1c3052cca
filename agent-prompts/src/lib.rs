//! Prompt templates for agents.
//!
//! [`PromptTemplate`] renders `{{variable}}` placeholders in a single pass;
//! [`PromptSet`] bundles the templates the step loop uses for system
//! prompts, planning, best-effort answers and delegation.

#![warn(missing_docs, clippy::pedantic)]

mod prompts;
pub mod template;

pub use prompts::PromptSet;
pub use template::{PromptTemplate, TemplateError, TemplateResult, Vars};
