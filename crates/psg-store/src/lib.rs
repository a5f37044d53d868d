//! Access to the PSG property stores: the synchronous read-only property
//! cache, and the asynchronous blob storage engine.
//!
//! Both are expressed as traits. The real deployments sit on an embedded
//! key/value cache and a Cassandra cluster; this crate ships in-memory
//! implementations with the same observable behavior, used by tests and by
//! the server's local mode.

mod backend;
mod cache;
mod fetch;
mod memory;

pub use backend::{BioseqInfoQuery, FetchEvent, Storage};
pub use cache::{CacheLookup, MemoryCache, PropCache};
pub use fetch::{Fetch, FetchError, FetchState};
pub use memory::{MemoryStorage, MemoryStorageBuilder};
