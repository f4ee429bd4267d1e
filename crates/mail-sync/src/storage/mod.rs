//! Storage traits and implementations
//!
//! The sync engine writes through [`SyncStore`]; the in-memory backend serves
//! tests, the SQLite backend is what the daemon runs on.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemorySyncStore;
pub use sqlite::SqliteSyncStore;
pub use traits::{MessageBody, SyncStore, Upserted};
