pub mod builtin_providers;
pub mod chat_stream;
pub mod config;
pub mod engine;
pub mod errors;
pub mod lanes;
pub mod message;
pub mod providers;
pub mod retrieval;
pub mod retry;
