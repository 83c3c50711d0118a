//! Parley is a streaming chat client for several LLM provider families.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`api`] defines the wire payloads of the Gemini, OpenAI-compatible and
//!   Anthropic-compatible protocols, plus model listing and balance lookups.
//! - [`core`] owns configuration, provider resolution, the streaming
//!   adapter with its retry and error translation, local knowledge
//!   retrieval, the per-lane chat engine and the two-lane orchestrator.
//! - [`cli`] parses arguments and drives the engine from the terminal.
//! - [`utils`] holds URL and authentication-header helpers.
//!
//! The binary (`src/main.rs`) routes straight into [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod utils;
