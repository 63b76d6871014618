//! # Awesome Index
//!
//! An indexing and search service for curated "awesome list" registries.
//!
//! Awesome Index discovers registry sub-repositories from a meta-repository
//! archive, fetches each registry's generated data file, normalizes the
//! entries into a relational SQLite store, and serves ranked faceted search
//! over a cached index snapshot via a CLI and a JSON HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────┐   ┌───────────┐
//! │ Fetcher  │──▶│ Normalizer │──▶│  SQLite   │──▶│   Index   │
//! │ zip+HTTP │   │  upserts   │   │  store    │   │ snapshot  │
//! └──────────┘   └────────────┘   └────┬─────┘   └─────┬─────┘
//!       ▲                              │               │
//!       │        ┌─────────────┐       │               ▼
//!       └────────│ Orchestrator│       │         ┌──────────┐
//!                │  run loop   │       └────────▶│  Search   │
//!                └─────────────┘    (fallback)   └────┬─────┘
//!                                                     │
//!                                         ┌───────────┤
//!                                         ▼           ▼
//!                                    ┌────────┐  ┌────────┐
//!                                    │  CLI   │  │  HTTP  │
//!                                    │ (awix) │  │  API   │
//!                                    └────────┘  └────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! awix init                    # create database
//! awix index                   # run a full indexing pass
//! awix search "gin" --registry go
//! awix serve                   # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`fetch`] | Registry discovery and data-file fetching |
//! | [`normalize`] | Document-to-relational normalization |
//! | [`orchestrate`] | Indexing run state machine |
//! | [`cache`] | Snapshot cache collaborator |
//! | [`index`] | Search index snapshot building |
//! | [`search`] | Ranked faceted search and facet enumeration |
//! | [`server`] | JSON HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod index;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod orchestrate;
pub mod search;
pub mod server;
