//! chatvault — offline chat-export archive explorer.
//!
//! Ingests an official chat-history export ZIP into a single-file SQLite
//! store with an FTS5 index, and exposes the corpus for browsing, ranked
//! search, deterministic chunking, dataset-shaped exports, and asynchronous
//! AI-pattern jobs executed by out-of-process workers.
//!
//! The binary in `main.rs` is a thin CLI over these modules; the HTTP
//! server in [`server`] is the collaborator surface for UIs and scripts.

pub mod archive;
pub mod chunk;
pub mod config;
pub mod db;
pub mod export;
pub mod ingest;
pub mod jobs;
pub mod migrate;
pub mod models;
pub mod redact;
pub mod search;
pub mod server;
pub mod stats;
pub mod store;
pub mod worker;
