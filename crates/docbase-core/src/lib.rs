//! Foundational types shared by the query translator and the SQLite runtime:
//! the closed error taxonomy, cooperative cancellation, monotonic timestamps,
//! `_id` generation, the schema model, the filter AST, and query options.

pub mod cancel;
pub mod error;
pub mod filter;
pub mod idgen;
pub mod options;
pub mod schema;
pub mod time;

pub use cancel::{race_with_abort, sleep_interruptible, CancellationToken};
pub use error::{classify_rusqlite_error, Error, Result};
pub use filter::{FieldCondition, FieldOp, Filter};
pub use idgen::{generate_id, DefaultIdFactory, IdFactory};
pub use options::{
    Cursor, FindOneAndModifyOptions, FindOptions, InsertManyOptions, ProjectionInputs,
    ProjectionSpec, ReturnDocument, Sort, SortDirection, TextSearchOptions, UpdateOptions,
};
pub use schema::{
    CompoundIndex, SchemaBuilder, SchemaDefinition, SchemaField, StorageType, Validator,
    CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD,
};
