//! Storage layer for ferret
//!
//! SQLite holds feed items, their embeddings, the FTS5 lexical index and the
//! search history with per-query result snapshots.

pub mod migrations;
pub mod pool;
pub mod sqlite;

pub use pool::Store;
pub use sqlite::{
    Database, EmbeddedItem, HistoryEntry, HistoryResult, ItemId, ItemRecord, LexicalHit,
    NewHistory, NewItem,
};
