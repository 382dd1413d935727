//! # Doc Governance
//!
//! A tiered document governance pipeline. Every ingested document carries a
//! confidentiality classification, that classification survives each
//! transformation stage, and retrieval returns only what the caller is
//! authorized to see.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────┐  enrich  ┌──────────┐  index  ┌─────────┐
//! │ Ingest/Sync│──▶│ Raw │─────────▶│ Enriched │────────▶│ Indexed │
//! │ Synthesizer│   └─────┘ validate └──────────┘ represent└────┬────┘
//! └────────────┘           classify              carry level   │
//!                          chunk                               ▼
//!                                                     ┌───────────────┐
//!                                                     │ Access Filter │
//!                                                     └───────────────┘
//! ```
//!
//! Classification only ever tightens as a document moves through the tiers.
//! The sole loosening path is an explicitly authorized re-ingest.
//!
//! ## Quick Start
//!
//! ```bash
//! dgov init                                   # create the store
//! dgov ingest report.txt --attr confidentiality_level=internal
//! dgov sync                                   # bulk-sync the filesystem connector
//! dgov process all                            # Raw → Enriched → Indexed
//! dgov query "budget" --level public --level internal
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Classification levels, tiers, metadata records, tier entries |
//! | [`error`] | Governance error taxonomy |
//! | [`config`] | TOML configuration with declared defaults |
//! | [`logging`] | Tracing subscriber setup |
//! | [`metadata`] | Metadata synthesizer and attribute parsing |
//! | [`store`] | Layered store trait, SQLite and in-memory backends |
//! | [`policy`] | Versioned classification policy |
//! | [`chunk`] | Paragraph-boundary chunker |
//! | [`representation`] | Representation generators (hashing, summary, OpenAI) |
//! | [`enrich`] | Raw → Enriched stage |
//! | [`index`] | Enriched → Indexed stage |
//! | [`access`] | Access filter over the Indexed tier |
//! | [`ingest`] | Ingestion endpoint with downgrade guard |
//! | [`connector_fs`] | Filesystem bulk synchronization |
//! | [`pipeline`] | Stage orchestration, audit, status, purge |
//! | [`progress`] | Stage progress reporting |

pub mod access;
pub mod chunk;
pub mod config;
pub mod connector_fs;
pub mod enrich;
pub mod error;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod metadata;
pub mod models;
pub mod pipeline;
pub mod policy;
pub mod progress;
pub mod representation;
pub mod store;
