//! # Repo Lens
//!
//! Ingests a source code repository, splits it into token-bounded chunks,
//! optionally indexes them for vector similarity search, and answers
//! natural-language questions grounded in the retrieved code.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌─────────┐   ┌──────────────┐
//! │ git clone │──▶│ Collector │──▶│ Chunker │──▶│ SQLite store │
//! └───────────┘   └───────────┘   └────┬────┘   └──────┬───────┘
//!                                      │ (optional)    │
//!                                      ▼               ▼
//!                               ┌─────────────┐  ┌───────────┐
//!                               │ Vector index│─▶│ Retriever │──▶ answer
//!                               └─────────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error types per seam |
//! | [`models`] | Core data types |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`store`] | Relational store contract |
//! | [`collector`] | Bounded file collection |
//! | [`chunk`] | Token-window chunking |
//! | [`vector_index`] | Per-repository flat L2 index registry |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`generation`] | Chat completion provider |
//! | [`fetch`] | Shallow git checkout |
//! | [`stats`] | Ingestion statistics snapshots |
//! | [`ingest`] | Ingestion orchestrator |
//! | [`queue`] | Background ingestion workers |
//! | [`retrieve`] | Vector + lexical retrieval |
//! | [`cache_key`] | Answer cache keys |
//! | [`answer`] | Question answering |
//! | [`app`] | Service wiring |

pub mod answer;
pub mod app;
pub mod cache_key;
pub mod chunk;
pub mod collector;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod fetch;
pub mod generation;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod retrieve;
pub mod stats;
pub mod store;
pub mod vector_index;
