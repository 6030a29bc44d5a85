//! KVGrid Store - Document store request/execution layer
//!
//! This crate translates domain operations into the external document
//! store's query and update primitives: point lookups, create-if-absent,
//! full replaces, atomic conditional updates, deletes, and searches with
//! offset or cursor ("scroll") pagination. It also carries the thin HTTP
//! client for the per-key value backend.

pub mod api;
pub mod http;
pub mod memory;
pub mod query;
pub mod value;

// Re-exports
pub use api::{
    ConditionalUpdate, Doc, DocStore, PageMode, SearchPage, SearchRequest, UpdateOutcome,
    scan_all,
};
pub use http::HttpDocStore;
pub use memory::MemoryDocStore;
pub use value::ValueClient;
