//! # maint-assist
//!
//! Asynchronous retrieval-augmented assistant for maintenance interventions.
//!
//! A stateless HTTP gateway answers from a reply cache when it can;
//! otherwise it publishes a correlated job onto a work queue and waits,
//! bounded, for the matching reply. Independent worker processes consume
//! jobs: they embed the query, retrieve similar interventions from the
//! knowledge store, prompt a language model with the user's recent
//! history, and publish the reply. Every dependency can be missing; the
//! pipeline degrades instead of failing.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐   ┌──────────┐  job   ┌─────────┐   ┌──────────────┐
//! │ Client │──▶│ Gateway  │──────▶│ Broker  │──▶│   Worker(s)   │
//! └────────┘   │  (HTTP)  │◀──────│ (Redis) │◀──│ embed+search  │
//!              └────┬─────┘ reply └─────────┘   │ prompt+LLM    │
//!                   │                           └──┬─────────┬──┘
//!                   ▼                              ▼         ▼
//!              ┌──────────┐                  ┌─────────┐ ┌────────┐
//!              │  Cache   │◀─── history ─────│  KV     │ │ SQLite │
//!              └──────────┘                  └─────────┘ └────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | Tracing subscriber setup |
//! | [`context`] | Adapter wiring and health |
//! | [`broker`] | Work queue with reply correlation |
//! | [`gateway`] | Cache check, publish, bounded wait |
//! | [`worker`] | Job consumption and answering |
//! | [`indexer`] | Intervention lifecycle and bulk indexing |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | Chat-completion client |
//! | [`sqlite_store`] | SQLite knowledge store |
//! | [`redis_kv`] | Redis cache/history store |
//! | [`stats`] | Knowledge store statistics |
//! | [`server`] | HTTP endpoints |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod broker;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod gateway;
pub mod indexer;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod redis_kv;
pub mod server;
pub mod sqlite_store;
pub mod stats;
pub mod worker;
