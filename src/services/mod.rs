pub mod image_source;
pub mod inference;
pub mod memory_store;
pub mod queue;
pub mod rate_limit;
pub mod redis_store;
pub mod retry;
pub mod webhook;
pub mod worker;
