pub mod coordinator;
pub mod dedup;
pub mod merge;
pub mod resolver;
pub mod scheduler;
pub mod upserter;
