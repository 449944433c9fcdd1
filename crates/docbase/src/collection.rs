//! The collection runtime (§4.5): CRUD, bulk insert, atomic find-and-modify,
//! projection, pagination, distinct, and estimated-count operations. Every
//! method runs through the retry/cancellation envelope (§4.6) and, on
//! success, delivers a post-commit event to the collection's emitter (§4.7).

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value};

use docbase_core::cancel::CancellationToken;
use docbase_core::error::{classify_rusqlite_error, Error, Result};
use docbase_core::filter::{FieldOp, Filter};
use docbase_core::idgen::IdFactory;
use docbase_core::options::{
    Cursor, FindOneAndModifyOptions, FindOptions, InsertManyOptions, ReturnDocument, Sort,
    TextSearchOptions, UpdateOptions,
};
use docbase_core::schema::{default_path, SchemaDefinition, CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD};
use docbase_core::time::now_millis;
use docbase_query::cache::TemplateCache;
use docbase_query::translate::CompiledQuery;
use docbase_query::{cursor as cursor_query, resolve_column, textsearch, translate};

use crate::conn::ConnSource;
use crate::database::param_to_value;
use crate::events::{CollectionEvent, EventEmitter};
use crate::retry::{with_retry, RetryPolicy};

/// Shared, once-owned state behind every [`Collection`] handle opened
/// against one name (§3 "Ownership"): the schema it was compiled from, its
/// query template cache, and its lazily-populated event emitter.
pub(crate) struct CollectionState {
    pub(crate) schema: Arc<SchemaDefinition>,
    pub(crate) cache: Mutex<TemplateCache>,
    pub(crate) events: EventEmitter,
    /// Per-collection `RetryPolicy` override (§10.5), merged ahead of the
    /// database's default and behind any per-operation override.
    pub(crate) retry: Option<RetryPolicy>,
}

/// Per-collection override of the database's defaults (§10.5), mirroring
/// the retry-policy merge order in §4.6 (operation > collection >
/// database).
#[derive(Debug, Clone, Default)]
pub struct CollectionOptions {
    pub retry: Option<RetryPolicy>,
    pub enable_cache: Option<bool>,
}

impl CollectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_enable_cache(mut self, enabled: bool) -> Self {
        self.enable_cache = Some(enabled);
        self
    }
}

/// A filter argument accepted at the operation boundary (§6): a bare
/// string is implicitly `{_id: string}`. Recognising this shape lets
/// write methods skip the translator entirely for the common case of
/// addressing one document by id (§9 "ID-only fast paths").
#[derive(Debug, Clone)]
pub enum FilterArg {
    Id(String),
    Filter(Filter),
}

impl FilterArg {
    fn as_id(&self) -> Option<&str> {
        match self {
            FilterArg::Id(id) => Some(id),
            FilterArg::Filter(f) => f.as_id_only(),
        }
    }

    fn into_filter(self) -> Filter {
        match self {
            FilterArg::Id(id) => Filter::by_id(id),
            FilterArg::Filter(f) => f,
        }
    }
}

impl From<&str> for FilterArg {
    fn from(s: &str) -> Self {
        FilterArg::Id(s.to_string())
    }
}

impl From<String> for FilterArg {
    fn from(s: String) -> Self {
        FilterArg::Id(s)
    }
}

impl From<Filter> for FilterArg {
    fn from(f: Filter) -> Self {
        FilterArg::Filter(f)
    }
}

/// Per-call cancellation/retry override (§4.6). An absent `signal` behaves
/// like a token that is never cancelled; an absent `retry` falls back to
/// the collection's effective policy.
#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    pub signal: Option<CancellationToken>,
    pub retry: Option<RetryPolicy>,
}

impl OperationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// One failed element of an unordered `insertMany` (§4.5).
#[derive(Debug, Clone)]
pub struct BulkError {
    pub index: usize,
    pub message: String,
}

/// Result of `insertMany` (§4.5).
#[derive(Debug, Clone, Default)]
pub struct InsertManyResult {
    pub inserted: Vec<Value>,
    pub inserted_ids: Vec<String>,
    pub errors: Vec<BulkError>,
}

/// Result of `updateOne`/`updateMany`/`replaceOne` (§4.5).
#[derive(Debug, Clone, Default)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<String>,
}

/// Result of `deleteOne`/`deleteMany` (§4.5).
#[derive(Debug, Clone, Default)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// A handle to one document collection, bound either to a [`crate::database::Database`]'s
/// own connection or to an in-flight [`crate::transaction::Transaction`]'s
/// borrowed one — `C` abstracts over which.
pub struct Collection<C: ConnSource> {
    name: String,
    pub(crate) state: Arc<CollectionState>,
    conn: C,
    id_factory: Arc<dyn IdFactory>,
    retry: RetryPolicy,
}

impl<C: ConnSource> Collection<C> {
    pub(crate) fn new(
        name: String,
        state: Arc<CollectionState>,
        conn: C,
        id_factory: Arc<dyn IdFactory>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            name,
            state,
            conn,
            id_factory,
            retry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &SchemaDefinition {
        &self.state.schema
    }

    /// The lazily-populated event emitter (§4.7). Registering a listener
    /// here is what causes this collection to start constructing event
    /// payloads on mutating operations.
    pub fn events(&self) -> &EventEmitter {
        &self.state.events
    }

    // -- retry/cancellation envelope (§4.6) ---------------------------------

    fn execute<T>(&self, opts: &OperationOptions, mut op: impl FnMut(&CancellationToken) -> Result<T>) -> Result<T> {
        let token = opts.signal.clone().unwrap_or_default();
        let policy = RetryPolicy::merge(&self.retry, self.state.retry.as_ref(), opts.retry.as_ref());
        with_retry(&policy, &token, None, || op(&token))
    }

    fn cache_guard(&self) -> Result<MutexGuard<'_, TemplateCache>> {
        self.state
            .cache
            .lock()
            .map_err(|e| Error::Connection(format!("mutex poisoned: {e}")))
    }

    fn emit_if_listening(&self, build: impl FnOnce() -> CollectionEvent) {
        if self.state.events.listener_count() > 0 {
            self.state.events.emit(build());
        }
    }

    // -- read path -----------------------------------------------------------

    /// `SELECT body WHERE _id = ?` (§4.5 `findById`).
    pub fn find_by_id(&self, id: impl Into<String>, opts: OperationOptions) -> Result<Option<Value>> {
        let id = id.into();
        self.execute(&opts, |token| {
            token.throw_if_aborted()?;
            self.conn.with_conn(|conn| self.load_by_id(conn, &id))
        })
    }

    fn load_by_id(&self, conn: &Connection, id: &str) -> Result<Option<Value>> {
        let body: Option<String> = conn
            .query_row(&format!("SELECT body FROM {} WHERE _id = ?", self.name), [id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| classify_rusqlite_error(e, None))?;
        body.map(|b| self.decode_body(b)).transpose()
    }

    /// Resolves `filter_arg` to at most one document: the `_id` fast path
    /// when the shape allows it, else a translated `LIMIT 1` find (§9).
    fn load_one(&self, conn: &Connection, filter_arg: FilterArg) -> Result<Option<Value>> {
        if let Some(id) = filter_arg.as_id() {
            return self.load_by_id(conn, id);
        }
        let filter = self.resolve_filter(conn, filter_arg.into_filter(), &FindOptions::new())?;
        let mut options = FindOptions::new();
        options.limit = Some(1);
        let compiled = {
            let mut cache = self.cache_guard()?;
            translate::translate(&filter, &options, &self.state.schema, Some(&mut cache))?
        };
        let mut docs = self.run_select(conn, &compiled)?;
        Ok(if docs.is_empty() { None } else { Some(docs.remove(0)) })
    }

    /// As [`Self::load_one`], but honouring a `findOneAnd*` sort spec —
    /// which requires going through the translator even when the filter
    /// is an id-only shape, since the caller asked for a specific order.
    fn load_one_sorted(&self, conn: &Connection, filter_arg: FilterArg, sort: &Sort) -> Result<Option<Value>> {
        if sort.is_empty() {
            return self.load_one(conn, filter_arg);
        }
        let filter = self.resolve_filter(conn, filter_arg.into_filter(), &FindOptions::new())?;
        let mut options = FindOptions::new().with_sort(sort.clone());
        options.limit = Some(1);
        let compiled = {
            let mut cache = self.cache_guard()?;
            translate::translate(&filter, &options, &self.state.schema, Some(&mut cache))?
        };
        let mut docs = self.run_select(conn, &compiled)?;
        Ok(if docs.is_empty() { None } else { Some(docs.remove(0)) })
    }

    pub fn find_one(&self, filter: impl Into<FilterArg>, mut options: FindOptions, opts: OperationOptions) -> Result<Option<Value>> {
        let filter_arg = filter.into();
        if let Some(id) = filter_arg.as_id() {
            if options.cursor.is_none() && options.text_search.is_none() {
                return self.find_by_id(id.to_string(), opts);
            }
        }
        options.limit = Some(1);
        let mut docs = self.find(filter_arg, options, opts)?;
        Ok(if docs.is_empty() { None } else { Some(docs.remove(0)) })
    }

    pub fn find(&self, filter: impl Into<FilterArg>, options: FindOptions, opts: OperationOptions) -> Result<Vec<Value>> {
        let filter_arg = filter.into();
        self.execute(&opts, |token| {
            token.throw_if_aborted()?;
            self.conn.with_conn(|conn| {
                let filter = self.resolve_filter(conn, filter_arg.clone().into_filter(), &options)?;
                let compiled = {
                    let mut cache = self.cache_guard()?;
                    translate::translate(&filter, &options, &self.state.schema, Some(&mut cache))?
                };
                self.run_select(conn, &compiled)
            })
        })
    }

    pub fn search(
        &self,
        text: impl Into<String>,
        fields: Vec<String>,
        case_sensitive: bool,
        mut options: FindOptions,
        opts: OperationOptions,
    ) -> Result<Vec<Value>> {
        options.text_search = Some(TextSearchOptions {
            text: text.into(),
            fields,
            case_sensitive,
        });
        self.find(Filter::MatchAll, options, opts)
    }

    pub fn count(&self, filter: impl Into<FilterArg>, opts: OperationOptions) -> Result<i64> {
        let filter_arg = filter.into();
        self.execute(&opts, |token| {
            token.throw_if_aborted()?;
            self.conn.with_conn(|conn| {
                let filter = self.resolve_filter(conn, filter_arg.clone().into_filter(), &FindOptions::new())?;
                let compiled = {
                    let mut cache = self.cache_guard()?;
                    translate::translate(&filter, &FindOptions::new(), &self.state.schema, Some(&mut cache))?
                };
                let values: Vec<rusqlite::types::Value> = compiled.params.iter().map(param_to_value).collect();
                let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", self.name, compiled.where_sql);
                conn.query_row(&sql, rusqlite::params_from_iter(values), |row| row.get(0))
                    .map_err(|e| classify_rusqlite_error(e, None))
            })
        })
    }

    /// `SELECT COUNT(*) FROM <table>` — no filter, no WHERE clause (§4.5).
    pub fn estimated_document_count(&self, opts: OperationOptions) -> Result<i64> {
        self.execute(&opts, |token| {
            token.throw_if_aborted()?;
            self.conn.with_conn(|conn| {
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", self.name), [], |row| row.get(0))
                    .map_err(|e| classify_rusqlite_error(e, None))
            })
        })
    }

    pub fn distinct(&self, field: &str, filter: Option<Filter>, opts: OperationOptions) -> Result<Vec<Value>> {
        let filter_arg: FilterArg = filter.unwrap_or(Filter::MatchAll).into();
        let column = resolve_column(field, &self.state.schema);
        self.execute(&opts, |token| {
            token.throw_if_aborted()?;
            self.conn.with_conn(|conn| {
                let filter = self.resolve_filter(conn, filter_arg.clone().into_filter(), &FindOptions::new())?;
                let compiled = {
                    let mut cache = self.cache_guard()?;
                    translate::translate(&filter, &FindOptions::new(), &self.state.schema, Some(&mut cache))?
                };
                let values: Vec<rusqlite::types::Value> = compiled.params.iter().map(param_to_value).collect();
                let sql = format!("SELECT DISTINCT {column} FROM {} WHERE {}", self.name, compiled.where_sql);
                let mut stmt = conn.prepare(&sql).map_err(|e| classify_rusqlite_error(e, None))?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(values), |row| row.get::<_, rusqlite::types::Value>(0))
                    .map_err(|e| classify_rusqlite_error(e, None))?;

                let mut out = Vec::new();
                for row in rows {
                    let raw = row.map_err(|e| classify_rusqlite_error(e, None))?;
                    out.push(sqlite_value_to_json(raw));
                }
                out.sort_by(json_value_cmp);
                out.dedup();
                Ok(out)
            })
        })
    }

    fn run_select(&self, conn: &Connection, compiled: &CompiledQuery) -> Result<Vec<Value>> {
        let sql = build_select_sql(&self.name, compiled);
        let values: Vec<rusqlite::types::Value> = compiled.params.iter().map(param_to_value).collect();
        let mut stmt = conn.prepare(&sql).map_err(|e| classify_rusqlite_error(e, None))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), |row| row.get::<_, String>(0))
            .map_err(|e| classify_rusqlite_error(e, None))?;

        let mut docs = Vec::new();
        for row in rows {
            let body = row.map_err(|e| classify_rusqlite_error(e, None))?;
            let mut doc = self.decode_body(body)?;
            compiled.projection.apply(&mut doc);
            docs.push(doc);
        }
        Ok(docs)
    }

    /// Merges text-search and cursor synthesis into `filter` (§4.2). The
    /// cursor branch reads the anchor document, so this needs `conn`.
    fn resolve_filter(&self, conn: &Connection, filter: Filter, options: &FindOptions) -> Result<Filter> {
        let mut merged = filter;
        if let Some(search) = &options.text_search {
            merged = merged.merge_and(textsearch::build_filter(search));
        }
        if let Some(cursor) = &options.cursor {
            let anchor_id = match cursor {
                Cursor::After(id) | Cursor::Before(id) => id.clone(),
            };
            let anchor_values = self.load_sort_values(conn, &anchor_id, &options.sort)?;
            let cursor_filter = cursor_query::build_filter(&options.sort, cursor, &anchor_id, &anchor_values)?;
            merged = merged.merge_and(cursor_filter);
        }
        Ok(merged)
    }

    fn sort_value_path(&self, field: &str) -> String {
        match field {
            ID_FIELD => "$._id".to_string(),
            CREATED_AT_FIELD => "$.createdAt".to_string(),
            UPDATED_AT_FIELD => "$.updatedAt".to_string(),
            _ => self
                .state
                .schema
                .field(field)
                .map(|f| f.path.clone())
                .unwrap_or_else(|| default_path(field)),
        }
    }

    fn load_sort_values(&self, conn: &Connection, anchor_id: &str, sort: &Sort) -> Result<Vec<Value>> {
        let anchor = self
            .load_by_id(conn, anchor_id)?
            .ok_or_else(|| Error::not_found("document", anchor_id))?;
        Ok(sort
            .0
            .iter()
            .map(|(field, _)| extract_by_path(&anchor, &self.sort_value_path(field)))
            .collect())
    }

    fn decode_body(&self, body: String) -> Result<Value> {
        serde_json::from_str(&body).map_err(json_decode_err)
    }

    // -- write path ------------------------------------------------------------

    pub fn insert_one(&self, input: Value, opts: OperationOptions) -> Result<Value> {
        self.execute(&opts, |token| {
            token.throw_if_aborted()?;
            let doc = self.prepare_insert_doc(input.clone())?;
            self.conn.with_conn(|conn| self.exec_insert(conn, &doc))?;
            self.emit_if_listening(|| CollectionEvent::Insert(doc.clone()));
            Ok(doc)
        })
    }

    pub fn insert_many(&self, inputs: Vec<Value>, bulk_opts: InsertManyOptions, opts: OperationOptions) -> Result<InsertManyResult> {
        if bulk_opts.ordered {
            let result = self.execute(&opts, |token| {
                token.throw_if_aborted()?;
                self.conn.with_conn(|conn| {
                    let tx = conn
                        .unchecked_transaction()
                        .map_err(|e| Error::Transaction(format!("failed to begin: {e}")))?;
                    let mut inserted = Vec::with_capacity(inputs.len());
                    let mut ids = Vec::with_capacity(inputs.len());
                    for input in &inputs {
                        token.throw_if_aborted()?;
                        let doc = self.prepare_insert_doc(input.clone())?;
                        self.exec_insert(&tx, &doc)?;
                        ids.push(doc.get(ID_FIELD).and_then(Value::as_str).unwrap().to_string());
                        inserted.push(doc);
                    }
                    tx.commit().map_err(|e| Error::Transaction(format!("failed to commit: {e}")))?;
                    Ok(InsertManyResult {
                        inserted,
                        inserted_ids: ids,
                        errors: Vec::new(),
                    })
                })
            })?;
            if !result.inserted.is_empty() {
                self.emit_if_listening(|| CollectionEvent::InsertMany(result.inserted.clone()));
            }
            Ok(result)
        } else {
            let mut inserted = Vec::new();
            let mut ids = Vec::new();
            let mut errors = Vec::new();

            for (index, input) in inputs.into_iter().enumerate() {
                let outcome = self.execute(&opts, |token| {
                    token.throw_if_aborted()?;
                    let doc = self.prepare_insert_doc(input.clone())?;
                    self.conn.with_conn(|conn| self.exec_insert(conn, &doc))?;
                    Ok(doc)
                });
                match outcome {
                    Ok(doc) => {
                        ids.push(doc.get(ID_FIELD).and_then(Value::as_str).unwrap().to_string());
                        inserted.push(doc);
                    }
                    Err(err) => errors.push(BulkError {
                        index,
                        message: err.to_string(),
                    }),
                }
            }
            if !inserted.is_empty() {
                self.emit_if_listening(|| CollectionEvent::InsertMany(inserted.clone()));
            }
            Ok(InsertManyResult {
                inserted,
                inserted_ids: ids,
                errors,
            })
        }
    }

    fn prepare_insert_doc(&self, input: Value) -> Result<Value> {
        let Value::Object(mut map) = input else {
            return Err(Error::query("insert input must be a JSON object"));
        };
        let id = map
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.id_factory.generate());
        map.insert(ID_FIELD.to_string(), Value::String(id));

        if self.state.schema.timestamps {
            let now = Value::Number(now_millis().into());
            map.insert(CREATED_AT_FIELD.to_string(), now.clone());
            map.insert(UPDATED_AT_FIELD.to_string(), now);
        }

        let doc = Value::Object(map);
        self.state.schema.validate(&doc)?;
        Ok(doc)
    }

    fn exec_insert(&self, conn: &Connection, doc: &Value) -> Result<()> {
        let id = doc.get(ID_FIELD).and_then(Value::as_str).expect("prepared doc always has _id");
        let body = serde_json::to_string(doc).map_err(json_encode_err)?;

        let result = if self.state.schema.timestamps {
            let created = doc.get(CREATED_AT_FIELD).and_then(Value::as_i64).unwrap_or_else(now_millis);
            let updated = doc.get(UPDATED_AT_FIELD).and_then(Value::as_i64).unwrap_or(created);
            conn.execute(
                &format!("INSERT INTO {} (_id, body, createdAt, updatedAt) VALUES (?, ?, ?, ?)", self.name),
                rusqlite::params![id, body, created, updated],
            )
        } else {
            conn.execute(
                &format!("INSERT INTO {} (_id, body) VALUES (?, ?)", self.name),
                rusqlite::params![id, body],
            )
        };

        result.map(|_| ()).map_err(|e| self.classify_insert_error(e, doc))
    }

    fn classify_insert_error(&self, err: rusqlite::Error, doc: &Value) -> Error {
        match classify_rusqlite_error(err, None) {
            Error::UniqueConstraint { field, .. } => {
                let value = doc.get(&field).cloned().unwrap_or(Value::Null);
                Error::UniqueConstraint {
                    field,
                    value: render_value(&value),
                }
            }
            other => other,
        }
    }

    fn exec_update_body(&self, conn: &Connection, doc: &Value) -> Result<()> {
        let id = doc.get(ID_FIELD).and_then(Value::as_str).expect("doc has _id");
        let body = serde_json::to_string(doc).map_err(json_encode_err)?;
        let result = if self.state.schema.timestamps {
            let updated = doc.get(UPDATED_AT_FIELD).and_then(Value::as_i64).unwrap_or_else(now_millis);
            conn.execute(
                &format!("UPDATE {} SET body = ?, updatedAt = ? WHERE _id = ?", self.name),
                rusqlite::params![body, updated, id],
            )
        } else {
            conn.execute(&format!("UPDATE {} SET body = ? WHERE _id = ?", self.name), rusqlite::params![body, id])
        };
        result.map(|_| ()).map_err(|e| classify_rusqlite_error(e, None))
    }

    /// Re-asserts the invariants a merge/replace must never violate: `_id`
    /// never changes, and `createdAt` (when timestamps are enabled) is
    /// carried forward from the pre-update document rather than whatever
    /// the caller's payload happened to contain.
    fn reassert_invariants(&self, doc: &mut Value, before: &Value) {
        let Some(map) = doc.as_object_mut() else { return };
        if let Some(id) = before.get(ID_FIELD) {
            map.insert(ID_FIELD.to_string(), id.clone());
        }
        if self.state.schema.timestamps {
            if let Some(created) = before.get(CREATED_AT_FIELD) {
                map.insert(CREATED_AT_FIELD.to_string(), created.clone());
            }
        }
    }

    pub fn update_one(&self, filter: impl Into<FilterArg>, update: Value, update_opts: UpdateOptions, opts: OperationOptions) -> Result<UpdateResult> {
        let filter_arg = filter.into();
        let (result, event) = self.execute(&opts, |token| {
            token.throw_if_aborted()?;
            self.conn.with_conn(|conn| self.apply_update(conn, filter_arg.clone(), &update, update_opts.upsert))
        })?;
        if let Some(event) = event {
            self.emit_if_listening(|| event);
        }
        Ok(result)
    }

    /// Shared by `updateOne` and `findOneAndUpdate`'s non-transactional
    /// sibling: resolves the target, merges or upserts, and reports both
    /// the public result and the event payload to emit (built eagerly
    /// here since the caller already decided whether listeners exist is
    /// irrelevant at this layer — `emit_if_listening` still gates the
    /// actual delivery).
    fn apply_update(&self, conn: &Connection, filter_arg: FilterArg, update: &Value, upsert: bool) -> Result<(UpdateResult, Option<CollectionEvent>)> {
        match self.load_one(conn, filter_arg.clone())? {
            Some(before) => {
                let patch = update_patch(update);
                let mut doc = before.clone();
                deep_merge(&mut doc, &patch);
                self.reassert_invariants(&mut doc, &before);
                if self.state.schema.timestamps {
                    doc.as_object_mut()
                        .unwrap()
                        .insert(UPDATED_AT_FIELD.to_string(), Value::Number(now_millis().into()));
                }
                self.state.schema.validate(&doc)?;
                self.exec_update_body(conn, &doc)?;
                let result = UpdateResult {
                    matched_count: 1,
                    modified_count: 1,
                    upserted_id: None,
                };
                Ok((
                    result,
                    Some(CollectionEvent::Update {
                        before: Some(before),
                        after: doc,
                    }),
                ))
            }
            None if upsert => {
                let seed = self.upsert_seed(&filter_arg, update);
                let doc = self.prepare_insert_doc(seed)?;
                self.exec_insert(conn, &doc)?;
                let id = doc.get(ID_FIELD).and_then(Value::as_str).unwrap().to_string();
                let result = UpdateResult {
                    matched_count: 0,
                    modified_count: 0,
                    upserted_id: Some(id),
                };
                Ok((result, Some(CollectionEvent::Insert(doc))))
            }
            None => Ok((UpdateResult::default(), None)),
        }
    }

    pub fn update_many(&self, filter: impl Into<FilterArg>, update: Value, opts: OperationOptions) -> Result<UpdateResult> {
        let filter_arg = filter.into();
        let (count, docs) = self.execute(&opts, |token| {
            token.throw_if_aborted()?;
            self.conn.with_conn(|conn| {
                let tx = conn
                    .unchecked_transaction()
                    .map_err(|e| Error::Transaction(format!("failed to begin: {e}")))?;
                let filter = self.resolve_filter(&tx, filter_arg.clone().into_filter(), &FindOptions::new())?;
                let compiled = {
                    let mut cache = self.cache_guard()?;
                    translate::translate(&filter, &FindOptions::new(), &self.state.schema, Some(&mut cache))?
                };
                let targets = self.run_select(&tx, &compiled)?;
                let patch = update_patch(&update);

                let mut updated = Vec::with_capacity(targets.len());
                for before in targets {
                    token.throw_if_aborted()?;
                    let mut doc = before.clone();
                    deep_merge(&mut doc, &patch);
                    self.reassert_invariants(&mut doc, &before);
                    if self.state.schema.timestamps {
                        doc.as_object_mut()
                            .unwrap()
                            .insert(UPDATED_AT_FIELD.to_string(), Value::Number(now_millis().into()));
                    }
                    self.state.schema.validate(&doc)?;
                    self.exec_update_body(&tx, &doc)?;
                    updated.push(doc);
                }
                tx.commit().map_err(|e| Error::Transaction(format!("failed to commit: {e}")))?;
                Ok((updated.len() as u64, updated))
            })
        })?;
        if !docs.is_empty() {
            self.emit_if_listening(|| CollectionEvent::UpdateMany(docs));
        }
        Ok(UpdateResult {
            matched_count: count,
            modified_count: count,
            upserted_id: None,
        })
    }

    pub fn replace_one(&self, filter: impl Into<FilterArg>, document: Value, update_opts: UpdateOptions, opts: OperationOptions) -> Result<UpdateResult> {
        let filter_arg = filter.into();
        let (result, event) = self.execute(&opts, |token| {
            token.throw_if_aborted()?;
            self.conn.with_conn(|conn| {
                match self.load_one(conn, filter_arg.clone())? {
                    Some(before) => {
                        let doc = self.stamp_replacement(document.clone(), &before)?;
                        self.state.schema.validate(&doc)?;
                        self.exec_update_body(conn, &doc)?;
                        let result = UpdateResult {
                            matched_count: 1,
                            modified_count: 1,
                            upserted_id: None,
                        };
                        Ok((
                            result,
                            Some(CollectionEvent::Replace {
                                before,
                                after: doc,
                            }),
                        ))
                    }
                    None if update_opts.upsert => {
                        let seed = self.replace_upsert_seed(&filter_arg, &document);
                        let doc = self.prepare_insert_doc(seed)?;
                        self.exec_insert(conn, &doc)?;
                        let id = doc.get(ID_FIELD).and_then(Value::as_str).unwrap().to_string();
                        let result = UpdateResult {
                            matched_count: 0,
                            modified_count: 0,
                            upserted_id: Some(id),
                        };
                        Ok((result, Some(CollectionEvent::Insert(doc))))
                    }
                    None => Ok((UpdateResult::default(), None)),
                }
            })
        })?;
        if let Some(event) = event {
            self.emit_if_listening(|| event);
        }
        Ok(result)
    }

    /// Preserves `_id` (and `createdAt`, when timestamps are enabled) from
    /// `before` onto a caller-supplied replacement document, stamping a
    /// fresh `updatedAt`.
    fn stamp_replacement(&self, document: Value, before: &Value) -> Result<Value> {
        let Value::Object(mut map) = document else {
            return Err(Error::query("replace document must be a JSON object"));
        };
        if let Some(id) = before.get(ID_FIELD) {
            map.insert(ID_FIELD.to_string(), id.clone());
        }
        if self.state.schema.timestamps {
            if let Some(created) = before.get(CREATED_AT_FIELD) {
                map.insert(CREATED_AT_FIELD.to_string(), created.clone());
            }
            map.insert(UPDATED_AT_FIELD.to_string(), Value::Number(now_millis().into()));
        }
        Ok(Value::Object(map))
    }

    /// Seed document for an `updateOne`/`findOneAndUpdate` upsert (§4.5):
    /// the filter's equality map (if it is one), merged with the update.
    fn upsert_seed(&self, filter_arg: &FilterArg, update: &Value) -> Value {
        let mut map = Map::new();
        match filter_arg {
            FilterArg::Id(id) => {
                map.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            }
            FilterArg::Filter(f) => collect_equality_map(f, &mut map),
        }
        let mut seed = Value::Object(map);
        deep_merge(&mut seed, &update_patch(update));
        seed
    }

    /// Seed document for a `replaceOne`/`findOneAndReplace` upsert: the
    /// caller's replacement document, filled in with the filter's
    /// equality map for any field it doesn't already set.
    fn replace_upsert_seed(&self, filter_arg: &FilterArg, document: &Value) -> Value {
        let mut seed = document.clone();
        let Value::Object(map) = &mut seed else {
            return seed;
        };
        match filter_arg {
            FilterArg::Id(id) => {
                map.entry(ID_FIELD.to_string()).or_insert_with(|| Value::String(id.clone()));
            }
            FilterArg::Filter(f) => {
                let mut eq = Map::new();
                collect_equality_map(f, &mut eq);
                for (k, v) in eq {
                    map.entry(k).or_insert(v);
                }
            }
        }
        seed
    }

    pub fn delete_one(&self, filter: impl Into<FilterArg>, opts: OperationOptions) -> Result<DeleteResult> {
        let filter_arg = filter.into();
        let deleted = self.execute(&opts, |token| {
            token.throw_if_aborted()?;
            self.conn.with_conn(|conn| match self.load_one(conn, filter_arg.clone())? {
                Some(doc) => {
                    let id = doc.get(ID_FIELD).and_then(Value::as_str).unwrap();
                    conn.execute(&format!("DELETE FROM {} WHERE _id = ?", self.name), [id])
                        .map_err(|e| classify_rusqlite_error(e, None))?;
                    Ok(Some(doc))
                }
                None => Ok(None),
            })
        })?;
        let deleted_count = if deleted.is_some() { 1 } else { 0 };
        if let Some(doc) = deleted {
            self.emit_if_listening(|| CollectionEvent::Delete(doc));
        }
        Ok(DeleteResult { deleted_count })
    }

    pub fn delete_many(&self, filter: impl Into<FilterArg>, opts: OperationOptions) -> Result<DeleteResult> {
        let filter_arg = filter.into();
        let (count, docs) = self.execute(&opts, |token| {
            token.throw_if_aborted()?;
            self.conn.with_conn(|conn| {
                let filter = self.resolve_filter(conn, filter_arg.clone().into_filter(), &FindOptions::new())?;
                let compiled = {
                    let mut cache = self.cache_guard()?;
                    translate::translate(&filter, &FindOptions::new(), &self.state.schema, Some(&mut cache))?
                };
                let victims = if self.state.events.listener_count() > 0 {
                    self.run_select(conn, &compiled)?
                } else {
                    Vec::new()
                };
                let values: Vec<rusqlite::types::Value> = compiled.params.iter().map(param_to_value).collect();
                let sql = format!("DELETE FROM {} WHERE {}", self.name, compiled.where_sql);
                let n = conn
                    .execute(&sql, rusqlite::params_from_iter(values))
                    .map_err(|e| classify_rusqlite_error(e, None))?;
                Ok((n as u64, victims))
            })
        })?;
        if !docs.is_empty() {
            self.emit_if_listening(|| CollectionEvent::DeleteMany(docs));
        }
        Ok(DeleteResult { deleted_count: count })
    }

    pub fn find_one_and_delete(&self, filter: impl Into<FilterArg>, fm_opts: FindOneAndModifyOptions, opts: OperationOptions) -> Result<Option<Value>> {
        let filter_arg = filter.into();
        let deleted = self.execute(&opts, |token| {
            token.throw_if_aborted()?;
            self.conn.with_conn(|conn| {
                let tx = conn
                    .unchecked_transaction()
                    .map_err(|e| Error::Transaction(format!("failed to begin: {e}")))?;
                let target = self.load_one_sorted(&tx, filter_arg.clone(), &fm_opts.sort)?;
                if let Some(doc) = &target {
                    let id = doc.get(ID_FIELD).and_then(Value::as_str).unwrap();
                    tx.execute(&format!("DELETE FROM {} WHERE _id = ?", self.name), [id])
                        .map_err(|e| classify_rusqlite_error(e, None))?;
                }
                tx.commit().map_err(|e| Error::Transaction(format!("failed to commit: {e}")))?;
                Ok(target)
            })
        })?;
        self.emit_if_listening(|| CollectionEvent::FindOneAndDelete(deleted.clone()));
        Ok(deleted)
    }

    pub fn find_one_and_update(
        &self,
        filter: impl Into<FilterArg>,
        update: Value,
        fm_opts: FindOneAndModifyOptions,
        opts: OperationOptions,
    ) -> Result<Option<Value>> {
        let filter_arg = filter.into();
        let return_document = fm_opts.return_document;
        let (before, after) = self.execute(&opts, |token| {
            token.throw_if_aborted()?;
            self.conn.with_conn(|conn| {
                let tx = conn
                    .unchecked_transaction()
                    .map_err(|e| Error::Transaction(format!("failed to begin: {e}")))?;
                let outcome = match self.load_one_sorted(&tx, filter_arg.clone(), &fm_opts.sort)? {
                    Some(before) => {
                        let patch = update_patch(&update);
                        let mut doc = before.clone();
                        deep_merge(&mut doc, &patch);
                        self.reassert_invariants(&mut doc, &before);
                        if self.state.schema.timestamps {
                            doc.as_object_mut()
                                .unwrap()
                                .insert(UPDATED_AT_FIELD.to_string(), Value::Number(now_millis().into()));
                        }
                        self.state.schema.validate(&doc)?;
                        self.exec_update_body(&tx, &doc)?;
                        (Some(before), Some(doc))
                    }
                    None if fm_opts.upsert => {
                        let seed = self.upsert_seed(&filter_arg, &update);
                        let doc = self.prepare_insert_doc(seed)?;
                        self.exec_insert(&tx, &doc)?;
                        (None, Some(doc))
                    }
                    None => (None, None),
                };
                tx.commit().map_err(|e| Error::Transaction(format!("failed to commit: {e}")))?;
                Ok(outcome)
            })
        })?;
        self.emit_if_listening(|| CollectionEvent::FindOneAndUpdate {
            before: before.clone(),
            after: after.clone(),
        });
        Ok(match return_document {
            ReturnDocument::Before => before,
            ReturnDocument::After => after,
        })
    }

    pub fn find_one_and_replace(
        &self,
        filter: impl Into<FilterArg>,
        document: Value,
        fm_opts: FindOneAndModifyOptions,
        opts: OperationOptions,
    ) -> Result<Option<Value>> {
        let filter_arg = filter.into();
        let return_document = fm_opts.return_document;
        let (before, after) = self.execute(&opts, |token| {
            token.throw_if_aborted()?;
            self.conn.with_conn(|conn| {
                let tx = conn
                    .unchecked_transaction()
                    .map_err(|e| Error::Transaction(format!("failed to begin: {e}")))?;
                let outcome = match self.load_one_sorted(&tx, filter_arg.clone(), &fm_opts.sort)? {
                    Some(before) => {
                        let doc = self.stamp_replacement(document.clone(), &before)?;
                        self.state.schema.validate(&doc)?;
                        self.exec_update_body(&tx, &doc)?;
                        (Some(before), Some(doc))
                    }
                    None if fm_opts.upsert => {
                        let seed = self.replace_upsert_seed(&filter_arg, &document);
                        let doc = self.prepare_insert_doc(seed)?;
                        self.exec_insert(&tx, &doc)?;
                        (None, Some(doc))
                    }
                    None => (None, None),
                };
                tx.commit().map_err(|e| Error::Transaction(format!("failed to commit: {e}")))?;
                Ok(outcome)
            })
        })?;
        self.emit_if_listening(|| CollectionEvent::FindOneAndReplace {
            before: before.clone(),
            after: after.clone(),
        });
        Ok(match return_document {
            ReturnDocument::Before => before,
            ReturnDocument::After => after,
        })
    }

    /// `DROP TABLE IF EXISTS`, then tears down this collection's event
    /// emitter and invalidates its template cache (§4.5, §3 "Ownership").
    pub fn drop(&self) -> Result<()> {
        self.conn.with_conn(|conn| {
            conn.execute_batch(&crate::compiler::drop_table_sql(&self.name))
                .map_err(|e| classify_rusqlite_error(e, None))
        })?;
        self.emit_if_listening(|| CollectionEvent::Drop);
        self.state.events.remove_all_listeners();
        self.cache_guard()?.clear();
        Ok(())
    }

    /// Runs the schema validator against `doc` without writing it.
    pub fn validate(&self, doc: &Value) -> Result<()> {
        self.state.schema.validate(doc)
    }

    /// Identical to [`Self::validate`] — the distilled spec names both a
    /// throwing and a promise-returning variant; this runtime has no
    /// async boundary, so there is nothing for the second name to add.
    pub fn validate_sync(&self, doc: &Value) -> Result<()> {
        self.validate(doc)
    }
}

fn build_select_sql(table: &str, compiled: &CompiledQuery) -> String {
    let mut sql = format!("SELECT body FROM {table} WHERE {}", compiled.where_sql);
    if let Some(order_by) = &compiled.order_by_sql {
        sql.push_str(" ORDER BY ");
        sql.push_str(order_by);
    }
    match (compiled.limit, compiled.skip) {
        (Some(limit), Some(skip)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {skip}")),
        (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
        (None, Some(skip)) => sql.push_str(&format!(" LIMIT -1 OFFSET {skip}")),
        (None, None) => {}
    }
    sql
}

fn extract_by_path(doc: &Value, path: &str) -> Value {
    let pointer = path.trim_start_matches('$').replace('.', "/");
    doc.pointer(&pointer).cloned().unwrap_or(Value::Null)
}

/// Unwraps a top-level `$set` (§4.9/§9 "Deep merge semantics"); any other
/// shape is treated as the partial document itself. Nested `$set` is
/// intentionally not special-cased.
fn update_patch(update: &Value) -> Value {
    if let Value::Object(map) = update {
        if let Some(set_value) = map.get("$set") {
            return set_value.clone();
        }
    }
    update.clone()
}

/// JSON Merge Patch (RFC 7396) semantics: objects merge key-wise
/// recursively, arrays and scalars replace wholesale, and an explicit
/// `null` in the patch removes the key — the closest JSON-native reading
/// of "explicit `undefined` removes the key" (JSON itself has no
/// `undefined`).
fn deep_merge(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch) {
        (Some(target_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                if value.is_null() {
                    target_map.remove(key);
                    continue;
                }
                match target_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => deep_merge(existing, value),
                    _ => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

/// Walks a filter tree collecting its plain `{field: {$eq: v}}` leaves —
/// used to seed an upsert document from a filter that is itself an
/// equality map (§4.5 "insert a new document whose fields come from the
/// filter").
fn collect_equality_map(filter: &Filter, map: &mut Map<String, Value>) {
    match filter {
        Filter::Field(name, cond) => {
            if let [FieldOp::Eq(value)] = cond.ops.as_slice() {
                map.insert(name.clone(), value.clone());
            }
        }
        Filter::And(filters) => {
            for f in filters {
                collect_equality_map(f, map);
            }
        }
        _ => {}
    }
}

fn json_value_cmp(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (x, y) => x.to_string().cmp(&y.to_string()),
    }
}

/// Converts a raw column value back into JSON for `distinct` (§4.5), which
/// reads a generated column or `json_extract` result whose SQLite storage
/// class may be Integer/Real/Text/Null depending on the field's declared
/// type — not just Text.
fn sqlite_value_to_json(value: rusqlite::types::Value) -> Value {
    use rusqlite::types::Value as RV;
    match value {
        RV::Null => Value::Null,
        RV::Integer(i) => Value::Number(i.into()),
        RV::Real(r) => serde_json::Number::from_f64(r).map(Value::Number).unwrap_or(Value::Null),
        RV::Text(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        RV::Blob(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_decode_err(e: serde_json::Error) -> Error {
    Error::Database {
        code: "JSON_DECODE".into(),
        message: e.to_string(),
    }
}

fn json_encode_err(e: serde_json::Error) -> Error {
    Error::Database {
        code: "JSON_ENCODE".into(),
        message: e.to_string(),
    }
}
