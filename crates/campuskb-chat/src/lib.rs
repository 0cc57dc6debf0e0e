//! CampusKB chat: bounded prompt assembly and response generation.
//!
//! The assembler turns retrieval results, session history and a persona into
//! a prompt that never exceeds its character budget. Generators invoke an
//! external LLM (OpenAI, Anthropic, Groq or any OpenAI-compatible endpoint)
//! under a hard timeout and report failures as `GenerationError`. The
//! capability router answers arithmetic locally and marks programming
//! questions for code-support prompting.

pub mod assembler;
pub mod capabilities;
pub mod config;
pub mod extractive;
pub mod generator;
pub mod persona;
pub mod providers;
pub mod types;

pub use assembler::ContextAssembler;
pub use capabilities::{Capability, CodeQuestion, MathSolution};
pub use config::LLMConfig;
pub use extractive::ExtractiveGenerator;
pub use generator::{LlmGenerator, ResponseGenerator};
pub use types::*;
