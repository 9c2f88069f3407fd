//! Core types for the chainflow ingestion engine.
//!
//! This crate holds the domain vocabulary shared by the collector engine and
//! the control plane: chain identifiers, block/transaction records, cursors,
//! quality verdicts, run bookkeeping, and the upstream error taxonomy. It is
//! deliberately free of I/O; everything async lives in `chainflow-collector`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{FetchError, Result};
pub use types::*;
