//! # SmartDrive
//!
//! Discovery and incremental sync of OneDrive documents into a vector index.
//!
//! SmartDrive walks a drive folder tree under persisted per-folder decisions,
//! skips files the index already holds unchanged, extracts text from many
//! formats (with an OCR fallback chain for scanned PDFs and images), and
//! upserts embeddings plus metadata so the documents can be searched.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌────────────┐   ┌──────────┐
//! │ Discovery  │──▶│  Planner   │──▶│  Extractor │──▶│  Upload  │
//! │ + Policy   │   │ (unchanged │   │  + OCR     │   │ embed +  │
//! │            │   │   skip)    │   │            │   │ upsert   │
//! └────────────┘   └────────────┘   └────────────┘   └────┬─────┘
//!                                                         ▼
//!                                                  ┌────────────┐
//!                                                  │ Vector idx │
//!                                                  │ Blob store │
//!                                                  └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! smartdrive login                     # device-code sign-in
//! smartdrive crawl --mode preflight    # choose folders, then sync
//! smartdrive crawl --mode unattended   # later runs
//! smartdrive search "2023 w-2"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`auth`] | Token cache, device-code flow, silent refresh |
//! | [`drive`] | Remote drive API |
//! | [`discovery`] | Folder discovery walker |
//! | [`policy`] | Persisted per-folder decisions |
//! | [`planner`] | Unchanged detection and stable identities |
//! | [`extract`] | Per-format text extraction |
//! | [`ocr`] | OCR fallback chain and document intelligence |
//! | [`crawl`] | Crawl orchestrator |
//! | [`upload`] | Embedding and batched upsert |
//! | [`search`] | Query command |
//! | [`maintenance`] | Folder deletion and cache upkeep |

pub mod auth;
pub mod config;
pub mod crawl;
pub mod discovery;
pub mod drive;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod logging;
pub mod maintenance;
pub mod models;
pub mod ocr;
pub mod planner;
pub mod policy;
pub mod progress;
pub mod prompt;
pub mod search;
pub mod sparse;
pub mod storage;
pub mod upload;
