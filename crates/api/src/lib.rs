//! HTTP control plane for the chainflow ingestion engine.
//!
//! The engine is steered by a small JSON-over-HTTP surface backed by the
//! in-process [`Supervisor`](chainflow_collector::Supervisor):
//!
//! - `GET /`: service name and version
//! - `POST /start`: begin a collection run (409 if already running, 503 if
//!   the store is unreachable)
//! - `POST /stop`: stop the active run (409 if not running)
//! - `GET /status`: run state and per-chain counters; always answers
//! - `GET /health`: healthy/degraded/unhealthy classification per chain
//! - `GET /backfill-progress`: per-chain start/current/target/percent

#![warn(clippy::all)]

pub mod server;

pub use server::{build_app, run_with_config, AppState};
