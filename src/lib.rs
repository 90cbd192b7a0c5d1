//! # Meme Search
//!
//! Multi-channel meme retrieval with weighted reciprocal rank fusion, and
//! an idempotent pipeline for loading precomputed embeddings into Weaviate.
//!
//! The retrieval and ingestion logic lives in the runtime-agnostic
//! [`meme_search_core`] crate. This crate supplies the concrete
//! collaborators (Weaviate, Elasticsearch, the model server, the SQLite
//! label catalog), the record sources, and the `memes` CLI and HTTP server.
//!
//! ## Architecture
//!
//! ```text
//!                   ┌──────────────┐
//!   text / image ──▶│  Retriever   │──▶ fused image names
//!                   └──────┬───────┘
//!         ┌──────────┬─────┴─────┬───────────┐
//!         ▼          ▼           ▼           ▼
//!   ┌──────────┐ ┌────────┐ ┌─────────┐ ┌──────────┐
//!   │ Weaviate │ │Elastic │ │ SQLite  │ │  Model   │
//!   │ vectors  │ │captions│ │ labels  │ │  server  │
//!   └────▲─────┘ └────────┘ └─────────┘ └──────────┘
//!        │
//!   ┌────┴─────┐
//!   │  ingest  │◀── .npy directories / JSONL
//!   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! memes init                    # create the label catalog
//! memes import-labels labels.csv # fill labels and captions
//! memes ingest all              # load vectors into Weaviate
//! memes search "boromir one does not simply" --explain
//! memes serve                   # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Label catalog schema |
//! | [`labels`] | Label catalog queries |
//! | [`label_import`] | `memes import-labels` |
//! | [`weaviate`] | Weaviate vector store client |
//! | [`elastic`] | Elasticsearch caption client |
//! | [`model_server`] | Query analysis, embedding and text removal client |
//! | [`npy`] | `.npy` vector reader |
//! | [`sources`] | Ingestion record sources |
//! | [`ingest`] | `memes ingest` |
//! | [`search`] | Retriever wiring and `memes search` |
//! | [`stats`] | `memes stats` |
//! | [`server`] | HTTP retrieval server |

pub mod config;
pub mod db;
pub mod elastic;
pub mod ingest;
pub mod label_import;
pub mod labels;
pub mod migrate;
pub mod model_server;
pub mod npy;
pub mod search;
pub mod server;
pub mod sources;
pub mod stats;
pub mod weaviate;
