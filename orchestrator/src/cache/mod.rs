//! In-memory caches

pub mod lru_ttl;
pub mod resource;

pub use lru_ttl::LruTtlCache;
pub use resource::ResourceCache;
