#![forbid(unsafe_code)]
//! SQLite backend for TreeDB.
//! [`SqliteNodeStore`] runs hierarchy operations against an ordinary table
//! with id, parent and order columns; [`SqliteBackend`] opens such tables for
//! sessions, creating them on first use when the configuration allows it.

mod backend;
mod introspect;
mod storage;

pub use backend::SqliteBackend;
pub use storage::{SqliteNodeStore, SqliteTx};
