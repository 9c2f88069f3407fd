//! Dual-chain ingestion engine for chainflow.
//!
//! This crate ingests block and transaction records from Bitcoin and Solana
//! into an analytics store, preserving strict per-chain ordering and
//! surviving restarts without gaps or duplicates.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │  Supervisor (one per process)                  │
//! │                                                │
//! │  ┌────────────────┐      ┌────────────────┐    │
//! │  │ Collector: BTC │      │ Collector: SOL │    │
//! │  │  (tokio task)  │      │  (tokio task)  │    │
//! │  └───────┬────────┘      └───────┬────────┘    │
//! │          │                       │             │
//! │   SourceRouter               SolanaClient      │
//! │   ┌──────┴──────┐                │             │
//! │   │local │public│                │             │
//! │   └──────┬──────┘                │             │
//! │          │       Validator       │             │
//! │          └─────────┬─────────────┘             │
//! │               ┌────▼─────┐                     │
//! │               │ Storage  │  ← SQLite           │
//! │               │ (sink +  │    records + cursor │
//! │               │  cursor) │    in one txn       │
//! │               └──────────┘                     │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! Each collector loops discover → plan → fetch → validate → commit →
//! throttle until stopped or a safety budget trips. Commits always cover the
//! longest contiguous prefix of fetched positions, so committed positions per
//! chain form a gap-free range ending at the cursor.

#![warn(clippy::all)]

pub mod collector;
pub mod config;
pub mod rpc;
pub mod storage;
pub mod supervisor;
pub mod validator;

pub use collector::{ChainRuntime, Collector, CollectorPhase, CollectorSettings};
pub use config::Config;
pub use rpc::{ChainClient, ChainClients};
pub use storage::Storage;
pub use supervisor::{
    BackfillProgress, ChainHealth, HealthLevel, HealthReport, StartOutcome, StatusReport,
    StopOutcome, Supervisor,
};
