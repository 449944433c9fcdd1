//! Uniform connection access for [`crate::collection::Collection`],
//! whether it is bound to the database's own connection or to one borrowed
//! by an in-flight [`crate::transaction::Transaction`].

use rusqlite::Connection;

use docbase_core::error::Result;

/// A source of connection access. Implemented once for the database's own
/// mutex-guarded connection, and once for a transaction's borrowed
/// connection — both give every [`crate::collection::Collection`] method
/// the same `with_conn` entry point regardless of which owns it.
pub trait ConnSource: Send + Sync {
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T>;
}
