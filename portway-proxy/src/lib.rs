pub mod cache;
pub mod engine;
pub mod rewrite;
pub mod single_flight;

pub use cache::{CachedResponse, MemoryResponseCache, ResponseCache};
pub use engine::{ProxyEngine, ProxyRequest};
pub use single_flight::KeyedLocks;
