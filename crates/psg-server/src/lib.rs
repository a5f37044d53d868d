//! The PubSeq Gateway server: an HTTP front-end that resolves sequence
//! identifiers and streams blob data out of the property cache and the
//! blob storage engine, framed in the PSG reply-chunk protocol.

pub mod app;
pub mod config;
pub mod http;
pub mod processor;
pub mod reply;
pub mod resolver;
pub mod retry;

pub use app::{AppContext, AppCounters};
pub use config::Config;
