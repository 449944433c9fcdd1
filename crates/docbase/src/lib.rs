//! The SQLite-backed runtime for the docbase embedded document store:
//! connection lifecycle, the collection runtime, query compilation wiring,
//! transactions, retry/backoff, and post-commit events.
//!
//! The pure pieces — the filter AST, schema model, and error taxonomy —
//! live in `docbase-core`; the filter/options-to-SQL translator lives in
//! `docbase-query`. This crate is where both meet `rusqlite`.

pub mod collection;
pub mod compiler;
pub mod conn;
pub mod database;
pub mod events;
pub mod retry;
pub mod transaction;

pub use collection::{
    BulkError, Collection, CollectionOptions, DeleteResult, FilterArg, InsertManyResult, OperationOptions,
    UpdateResult,
};
pub use database::{Database, DatabaseOptions};
pub use events::{CollectionEvent, EventEmitter, ListenerHandle};
pub use retry::{FailedAttempt, RetryPolicy};
pub use transaction::Transaction;

pub use docbase_core::cancel::CancellationToken;
pub use docbase_core::error::{Error, Result};
pub use docbase_core::filter::{FieldCondition, FieldOp, Filter};
pub use docbase_core::options::{
    Cursor, FindOneAndModifyOptions, FindOptions, InsertManyOptions, ProjectionInputs, ProjectionSpec,
    ReturnDocument, Sort, SortDirection, TextSearchOptions, UpdateOptions,
};
pub use docbase_core::schema::{
    CompoundIndex, FieldOptions, SchemaBuilder, SchemaDefinition, SchemaField, StorageType,
};
