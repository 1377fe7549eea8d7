//! # Manual Copilot
//!
//! A retrieval-augmented assistant for equipment manuals. Each unit's
//! manual is chunked, embedded and indexed in its own collection; chat
//! questions are answered from the passages retrieved for the units they
//! mention, with `[Unit | file | Page]` citations checked against what was
//! retrieved.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────┐   ┌────────────────┐
//! │  Upload  │──▶│ Extract + Chunk  │──▶│ SQLite per-unit │
//! │ PDF/text │   │ + Embed          │   │ collections     │
//! └──────────┘   └──────────────────┘   └───────┬────────┘
//!                                               │
//!                   ┌───────────────────────────┤
//!                   ▼                           ▼
//!              ┌──────────┐               ┌──────────┐
//!              │   CLI    │               │   HTTP   │
//!              │(copilot) │               │  server  │
//!              └──────────┘               └──────────┘
//! ```
//!
//! The chunking, retrieval and answer logic lives in
//! [`manual_copilot_core`]; this crate supplies storage, extraction,
//! service clients and the two front ends.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | Per-unit vector collections in SQLite |
//! | [`registry`] | Manual registry and lifecycle status |
//! | [`extract`] | PDF and text page extraction |
//! | [`http`] | Shared retrying JSON client |
//! | [`embedding`] | Embedding providers |
//! | [`generation`] | Generation providers |
//! | [`ingest`] | Upload, re-index and delete |
//! | [`chat`] | One chat turn |
//! | [`server`] | HTTP server |
//! | [`stats`] | Index statistics |

pub mod app;
pub mod chat;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extract;
pub mod generation;
pub mod http;
pub mod ingest;
pub mod locks;
pub mod migrate;
pub mod registry;
pub mod server;
pub mod sqlite_store;
pub mod stats;
