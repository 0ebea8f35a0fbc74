//! # maint-assist core
//!
//! Runtime-agnostic logic for the maintenance assistant: data models, the
//! adapter traits (knowledge store, key-value store, embedder, language
//! model) with in-memory implementations, vector utilities, conversation
//! namespacing, prompt composition, and technician name canonicalization.
//!
//! This crate has no sqlx, redis, HTTP, or filesystem dependencies. The
//! `maint-assist` app crate supplies the networked backends.

pub mod conversation;
pub mod embedding;
pub mod error;
pub mod kv;
pub mod llm;
pub mod models;
pub mod names;
pub mod prompt;
pub mod store;

pub use error::AdapterError;
