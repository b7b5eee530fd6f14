//! Transport and storage building blocks shared by the MyInfo crates.

#![warn(missing_docs)]

/// HTTP client abstraction used by the MyInfo client.
pub mod http_client;
/// Locked key-value storage for persisted client state.
pub mod store;

pub use http_client::HttpClient;
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};
