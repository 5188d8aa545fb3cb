// src/core/sharding/mod.rs

//! Horizontal sharding: the catalog of mappings, tables, shards, and ranges,
//! the key-routing algorithms, and the shard lifecycle protocols.

pub mod catalog;
pub mod lifecycle;
pub mod lookup;

pub use catalog::{LookupTarget, ShardingCatalog};
pub use lookup::{KeyPredicate, KeyRange, ShardingKey};
