//! # meme-search core
//!
//! Runtime-agnostic logic for meme-search: the data model, weighted
//! reciprocal rank fusion, the query orchestrator that fans a query out to
//! retrieval channels, and the idempotent ingestion worker.
//!
//! This crate contains no tokio, HTTP, database, or filesystem code. Every
//! external system is reached through the collaborator traits in
//! [`store`]; the `meme-search` application crate provides the concrete
//! Weaviate, Elasticsearch, model-server and SQLite implementations.

pub mod embedding;
pub mod fusion;
pub mod ingest;
pub mod models;
pub mod retrieve;
pub mod store;
