//! Scoped transactions (§4.8): a [`Transaction`] borrows the database's
//! connection for its lifetime and exposes the same collection API, just
//! without per-operation retry (a transaction is already one atomic unit).

use rusqlite::Connection;

use docbase_core::error::Result;
use docbase_core::schema::SchemaDefinition;

use crate::collection::{Collection, CollectionOptions};
use crate::conn::ConnSource;
use crate::database::Database;
use crate::retry::RetryPolicy;

/// Wraps a transaction's already-borrowed connection; never locks, since
/// the surrounding [`Database::transaction`] call already holds the mutex
/// for the whole scope.
#[derive(Clone, Copy)]
pub(crate) struct TxConn<'t>(pub(crate) &'t Connection);

impl<'t> ConnSource for TxConn<'t> {
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        f(self.0)
    }
}

/// A handle into an in-flight transaction. Dropping it without the
/// enclosing [`Database::transaction`] call returning `Ok` rolls back.
pub struct Transaction<'t> {
    conn: TxConn<'t>,
    database: &'t Database,
}

impl<'t> Transaction<'t> {
    pub(crate) fn new(conn: &'t Connection, database: &'t Database) -> Self {
        Self {
            conn: TxConn(conn),
            database,
        }
    }

    /// Returns a handle to `name` bound to this transaction's connection.
    /// Shares the same template cache and event emitter as the database's
    /// own `collection(name)` handle (§3 "Ownership").
    pub fn collection(&self, name: impl Into<String>, schema: SchemaDefinition) -> Result<Collection<TxConn<'t>>> {
        let name = name.into();
        let state = self
            .database
            .collection_state_with_conn(self.conn.0, &name, schema, CollectionOptions::default())?;
        Ok(Collection::new(
            name,
            state,
            self.conn,
            self.database.id_factory.clone(),
            RetryPolicy::disabled(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::collection::OperationOptions;
    use crate::database::{Database, DatabaseOptions};
    use docbase_core::schema::SchemaBuilder;

    #[test]
    fn collection_opened_for_the_first_time_inside_a_transaction_does_not_deadlock() {
        let db = Database::open_in_memory(DatabaseOptions::default()).unwrap();
        let inserted = db
            .transaction(|tx| {
                let users = tx.collection("users", SchemaBuilder::new().build())?;
                users.insert_one(json!({"email": "a@b.c"}), OperationOptions::new())
            })
            .unwrap();
        assert_eq!(inserted["email"], json!("a@b.c"));

        let users = db.collection("users", SchemaBuilder::new().build()).unwrap();
        assert_eq!(users.estimated_document_count(OperationOptions::new()).unwrap(), 1);
    }
}
