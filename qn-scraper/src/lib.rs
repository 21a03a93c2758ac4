//! Multi-source quiz-night ingestion: converts raw listings from
//! independent directories into canonical, deduplicated Venue and Event
//! records through repeated idempotent runs.

pub mod assets;
pub mod config;
pub mod geocode;
pub mod http;
pub mod observability;
pub mod pipeline;
pub mod sources;

pub use config::AppConfig;
pub use pipeline::coordinator::Pipeline;
