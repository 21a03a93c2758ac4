//! Shared domain types, error taxonomy and the canonical SQLite store for
//! the quiz-night ingestion pipeline.

pub mod common;
pub mod db;
pub mod domain;
pub mod normalize;

pub use common::error::{IngestError, Result};
pub use db::Database;
