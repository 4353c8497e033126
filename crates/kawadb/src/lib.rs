//! kawadb: an embedded, multi-version, copy-on-write key-value storage
//! engine. Multiple named ordered maps share one append-structured file;
//! each commit writes a chunk of copy-on-write B-tree pages and publishes
//! the new map roots atomically. Readers never block, writers coordinate
//! per map through atomic root swaps, and background housekeeping rewrites
//! and relocates chunks to reclaim space.

pub mod cache;
pub mod config;
pub mod dump;
pub mod housekeeping;
pub mod store;

#[cfg(test)]
mod test;

pub use btree::{
    BytesType, Cursor, DataType, Decision, DecisionMaker, MvMap, StringType, U64Type,
};
pub use config::{Compression, StoreConfig};
pub use storage::{Result, StoreError};
pub use store::Store;
