//! The database handle (§4.8): owns the SQL connection, the `_id` factory,
//! the default retry policy, and the set of collections opened against it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info};

use docbase_core::error::{classify_rusqlite_error, Error, Result};
use docbase_core::idgen::{DefaultIdFactory, IdFactory};
use docbase_core::schema::SchemaDefinition;
use docbase_query::param::Param;
use docbase_query::TemplateCache;

use crate::collection::{Collection, CollectionOptions, CollectionState};
use crate::conn::ConnSource;
use crate::events::EventEmitter;
use crate::retry::RetryPolicy;
use crate::transaction::Transaction;

/// Builder of [`Database::open`]/[`Database::open_in_memory`] options
/// (§10.3). No external config-file format — this is an in-process
/// builder, consistent with an embedded library rather than an application.
pub struct DatabaseOptions {
    pub id_generator: Arc<dyn IdFactory>,
    pub retry: RetryPolicy,
    pub enable_cache: bool,
    pub cache_capacity: usize,
    pub on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            id_generator: Arc::new(DefaultIdFactory),
            retry: RetryPolicy::default(),
            enable_cache: true,
            cache_capacity: docbase_query::DEFAULT_CACHE_CAPACITY,
            on_close: None,
        }
    }
}

impl DatabaseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id_generator(mut self, factory: impl IdFactory + 'static) -> Self {
        self.id_generator = Arc::new(factory);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn enable_cache(mut self, enabled: bool) -> Self {
        self.enable_cache = enabled;
        self
    }

    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }
}

/// Shares the database's mutex-guarded connection with every non-
/// transactional [`Collection`] opened against it.
#[derive(Clone)]
pub(crate) struct DbConn(pub(crate) Arc<Mutex<Option<Connection>>>);

impl ConnSource for DbConn {
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.0.lock().map_err(|e| Error::Connection(format!("mutex poisoned: {e}")))?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(Error::Connection("database is closed".to_string())),
        }
    }
}

/// Owns the connection, the default `_id` factory and retry policy, and
/// every collection opened against this handle.
pub struct Database {
    pub(crate) conn: DbConn,
    pub(crate) id_factory: Arc<dyn IdFactory>,
    pub(crate) default_retry: RetryPolicy,
    pub(crate) enable_cache: bool,
    pub(crate) cache_capacity: usize,
    collections: Mutex<HashMap<String, Arc<CollectionState>>>,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Database {
    /// Opens (or creates) a database file at `path`.
    pub fn open(path: impl AsRef<Path>, options: DatabaseOptions) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening docbase database");
        let conn = Connection::open(path)
            .map_err(|e| Error::Connection(format!("failed to open {}: {e}", path.display())))?;
        Self::from_connection(conn, options)
    }

    /// Opens a `:memory:` database, useful for tests and ephemeral stores.
    pub fn open_in_memory(options: DatabaseOptions) -> Result<Self> {
        debug!("opening in-memory docbase database");
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Connection(format!("failed to open in-memory database: {e}")))?;
        Self::from_connection(conn, options)
    }

    fn from_connection(conn: Connection, options: DatabaseOptions) -> Result<Self> {
        configure_connection(&conn)?;
        Ok(Self {
            conn: DbConn(Arc::new(Mutex::new(Some(conn)))),
            id_factory: options.id_generator,
            default_retry: options.retry,
            enable_cache: options.enable_cache,
            cache_capacity: options.cache_capacity,
            collections: Mutex::new(HashMap::new()),
            on_close: Mutex::new(options.on_close),
        })
    }

    /// Returns a handle to `name`, creating its backing table (and any
    /// generated columns/indexes) on first use. Subsequent calls with the
    /// same name return a handle sharing the same template cache and event
    /// emitter (§3 "Ownership").
    pub fn collection(&self, name: impl Into<String>, schema: SchemaDefinition) -> Result<Collection<DbConn>> {
        self.collection_with_options(name, schema, CollectionOptions::default())
    }

    /// As [`Self::collection`], with a per-collection override (§10.5) of
    /// the database's default retry policy and cache enablement.
    pub fn collection_with_options(
        &self,
        name: impl Into<String>,
        schema: SchemaDefinition,
        options: CollectionOptions,
    ) -> Result<Collection<DbConn>> {
        let name = name.into();
        let state = self.collection_state(&name, schema, options)?;
        Ok(Collection::new(
            name,
            state,
            self.conn.clone(),
            self.id_factory.clone(),
            self.default_retry.clone(),
        ))
    }

    pub(crate) fn collection_state(
        &self,
        name: &str,
        schema: SchemaDefinition,
        options: CollectionOptions,
    ) -> Result<Arc<CollectionState>> {
        self.conn.with_conn(|conn| self.collection_state_with_conn(conn, name, schema, options))
    }

    /// As [`Self::collection_state`], but against an already-borrowed
    /// connection rather than locking `self.conn` itself. Used by
    /// [`Transaction::collection`](crate::transaction::Transaction::collection)
    /// so that creating a collection for the first time inside a
    /// transaction reuses the connection the enclosing
    /// [`Self::transaction`] call already holds, instead of deadlocking on
    /// the same mutex (§4.8 "Nested calls ... never open a new
    /// engine-level transaction").
    pub(crate) fn collection_state_with_conn(
        &self,
        conn: &Connection,
        name: &str,
        schema: SchemaDefinition,
        options: CollectionOptions,
    ) -> Result<Arc<CollectionState>> {
        let mut collections = self.collections.lock().map_err(|e| Error::Connection(format!("mutex poisoned: {e}")))?;
        if let Some(existing) = collections.get(name) {
            return Ok(existing.clone());
        }

        conn.execute_batch(&crate::compiler::create_table_sql(name, &schema))
            .map_err(|e| classify_rusqlite_error(e, None))?;
        for stmt in crate::compiler::create_index_statements(name, &schema) {
            conn.execute_batch(&stmt).map_err(|e| classify_rusqlite_error(e, None))?;
        }

        info!(collection = name, "collection ready");
        let enable_cache = options.enable_cache.unwrap_or(self.enable_cache);
        let cache_capacity = if enable_cache { self.cache_capacity } else { 0 };
        let state = Arc::new(CollectionState {
            schema: Arc::new(schema),
            cache: Mutex::new(TemplateCache::new(cache_capacity.max(1))),
            events: EventEmitter::new(),
            retry: options.retry,
        });
        collections.insert(name.to_string(), state.clone());
        Ok(state)
    }

    /// Runs `f` inside a single transaction (§4.8). Collections obtained
    /// via the [`Transaction`] share the connection locked for the
    /// duration of this call; the transaction commits if `f` returns `Ok`,
    /// and rolls back (including on scope exit without an explicit commit)
    /// otherwise.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let guard = self.conn.0.lock().map_err(|e| Error::Connection(format!("mutex poisoned: {e}")))?;
        let conn = guard.as_ref().ok_or_else(|| Error::Connection("database is closed".to_string()))?;

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::Transaction(format!("failed to begin: {e}")))?;

        let handle = Transaction::new(&tx, self);
        match f(&handle) {
            Ok(value) => {
                tx.commit().map_err(|e| Error::Transaction(format!("failed to commit: {e}")))?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    /// Raw parameterised SQL escape hatch (§6). Intended for statements
    /// the collection API does not cover; always logged at debug.
    pub fn execute_raw(&self, sql: &str, params: &[Param]) -> Result<usize> {
        debug!(sql, "executing raw SQL");
        self.conn.with_conn(|conn| {
            let values: Vec<rusqlite::types::Value> = params.iter().map(param_to_value).collect();
            conn.execute(sql, rusqlite::params_from_iter(values))
                .map_err(|e| classify_rusqlite_error(e, None))
        })
    }

    /// Invokes the configured `onClose` hook, then releases the
    /// connection. All subsequent operations on this handle fail with
    /// [`Error::Connection`].
    pub fn close(&self) -> Result<()> {
        info!("closing docbase database");
        if let Some(hook) = self.on_close.lock().map_err(|e| Error::Connection(format!("mutex poisoned: {e}")))?.take() {
            hook();
        }
        let mut guard = self.conn.0.lock().map_err(|e| Error::Connection(format!("mutex poisoned: {e}")))?;
        *guard = None;
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

/// Converts a translator [`Param`] into a `rusqlite` bindable value.
pub(crate) fn param_to_value(param: &Param) -> rusqlite::types::Value {
    use rusqlite::types::Value as RV;
    match param {
        Param::Text(s) => RV::Text(s.clone()),
        Param::Integer(i) => RV::Integer(*i),
        Param::Real(r) => RV::Real(*r),
        Param::Bool(b) => RV::Integer(if *b { 1 } else { 0 }),
        Param::Null => RV::Null,
    }
}

/// Sets connection pragmas (WAL mode, foreign keys, busy timeout), mirroring
/// the teacher workspace's `configure_connection` pattern.
fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(|e| Error::Connection(format!("failed to set pragmas: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use docbase_core::schema::{FieldOptions, SchemaBuilder, StorageType};

    fn sample_schema() -> SchemaDefinition {
        SchemaBuilder::new()
            .field(
                "email",
                StorageType::Text,
                FieldOptions {
                    indexed: true,
                    unique: true,
                    ..Default::default()
                },
            )
            .timestamps(true)
            .build()
    }

    #[test]
    fn open_in_memory_creates_collection_table() {
        let db = Database::open_in_memory(DatabaseOptions::default()).unwrap();
        let _collection = db.collection("users", sample_schema()).unwrap();
        let count: i64 = db
            .conn
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
                    .map_err(|e| Error::Connection(e.to_string()))
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn repeated_collection_calls_share_state() {
        let db = Database::open_in_memory(DatabaseOptions::default()).unwrap();
        let a = db.collection("users", sample_schema()).unwrap();
        let b = db.collection("users", sample_schema()).unwrap();
        assert!(Arc::ptr_eq(&a.state, &b.state));
    }

    #[test]
    fn close_makes_further_access_fail() {
        let db = Database::open_in_memory(DatabaseOptions::default()).unwrap();
        db.close().unwrap();
        let err = db.collection("users", sample_schema()).unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[test]
    fn file_backed_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docbase.sqlite3");

        {
            let db = Database::open(&path, DatabaseOptions::default()).unwrap();
            let users = db.collection("users", sample_schema()).unwrap();
            users
                .insert_one(
                    serde_json::json!({"email": "a@b.c"}),
                    crate::collection::OperationOptions::new(),
                )
                .unwrap();
            db.close().unwrap();
        }

        let db = Database::open(&path, DatabaseOptions::default()).unwrap();
        let count: i64 = db
            .conn
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
                    .map_err(|e| Error::Connection(e.to_string()))
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn on_close_hook_runs_once() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let db = Database::open_in_memory(DatabaseOptions::new().on_close(move || {
            ran2.store(true, Ordering::SeqCst);
        }))
        .unwrap();
        db.close().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
