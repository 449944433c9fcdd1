//! The query translator (§4.2): a pure function from (filter, options,
//! schema) to a parameterised SQL tail and a post-fetch projection plan.
//!
//! Cursor and text-search synthesis happen one level up (see
//! [`crate::cursor`] and [`crate::textsearch`]) because the cursor anchor
//! lookup requires a database read; this module only ever walks data it is
//! handed.

use docbase_core::error::{Error, Result};
use docbase_core::filter::{FieldCondition, FieldOp, Filter};
use docbase_core::options::{FindOptions, SortDirection};
use docbase_core::schema::{default_path, SchemaDefinition, StorageType, CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD};
use serde_json::Value;

use crate::cache::{Template, TemplateCache};
use crate::param::Param;
use crate::projection::ProjectionPlan;

/// The compiled output of [`translate`]: a `WHERE` body, an `ORDER BY`
/// body, bound parameters in positional order, and the post-fetch
/// projection plan.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    /// The boolean expression to place after `WHERE`. Never empty — an
    /// unconditional match renders as `1=1`.
    pub where_sql: String,
    /// The column list to place after `ORDER BY`, or `None` for unsorted.
    pub order_by_sql: Option<String>,
    pub limit: Option<i64>,
    pub skip: Option<i64>,
    pub params: Vec<Param>,
    pub projection: ProjectionPlan,
}

/// Translates `filter` and `options` against `schema`, consulting and
/// populating `cache` when the filter's shape is cacheable (§4.2 "Template
/// cache"). Pass `None` to always perform a full translation.
pub fn translate(
    filter: &Filter,
    options: &FindOptions,
    schema: &SchemaDefinition,
    mut cache: Option<&mut TemplateCache>,
) -> Result<CompiledQuery> {
    let projection = ProjectionPlan::from_spec(options.projection.resolve())?;

    let cacheable = filter.is_cacheable();
    let shape_key = cacheable.then(|| shape_key(filter, options));

    let (where_sql, order_by_sql) = if let (Some(key), Some(cache)) = (&shape_key, cache.as_deref()) {
        if let Some(template) = cache.get(key) {
            (template.where_sql.clone(), template.order_by_sql.clone())
        } else {
            compile_sql(filter, options, schema)?
        }
    } else {
        compile_sql(filter, options, schema)?
    };

    if let (Some(key), Some(cache)) = (shape_key, cache.as_mut()) {
        if cache.get(&key).is_none() {
            cache.insert(
                key,
                Template {
                    where_sql: where_sql.clone(),
                    order_by_sql: order_by_sql.clone(),
                },
            );
        }
    }

    let params = collect_params(filter);

    Ok(CompiledQuery {
        where_sql,
        order_by_sql,
        limit: options.limit,
        skip: options.skip,
        params,
        projection,
    })
}

fn compile_sql(
    filter: &Filter,
    options: &FindOptions,
    schema: &SchemaDefinition,
) -> Result<(String, Option<String>)> {
    // Cursor pagination (§4.4) compares every sort-key field with `>`/`<`
    // regardless of its declared type (a TEXT sort key is ordered
    // lexicographically, which is well-defined SQL) — these fields are
    // exempted from the range-type check the same way `_id` always is.
    let cursor_fields: Vec<&str> = if options.cursor.is_some() {
        options.sort.0.iter().map(|(f, _)| f.as_str()).collect()
    } else {
        Vec::new()
    };
    let where_sql = translate_filter(filter, schema, false, &cursor_fields)?;
    let order_by_sql = translate_sort(options, schema);
    Ok((where_sql, order_by_sql))
}

/// Derives a cache key from the *shape* of `filter`/`options`: operator
/// identities, field names, and null-vs-nonnull per leaf, but never the
/// leaf values themselves.
fn shape_key(filter: &Filter, options: &FindOptions) -> String {
    let mut out = String::new();
    filter_shape(filter, &mut out);
    out.push('|');
    for (field, dir) in &options.sort.0 {
        out.push_str(field);
        out.push(match dir {
            SortDirection::Asc => '+',
            SortDirection::Desc => '-',
        });
    }
    out.push('|');
    out.push(if options.limit.is_some() { 'L' } else { '_' });
    out.push(if options.skip.is_some() { 'S' } else { '_' });
    out
}

fn filter_shape(filter: &Filter, out: &mut String) {
    match filter {
        Filter::MatchAll => out.push_str("*"),
        Filter::Field(name, cond) => {
            out.push('{');
            out.push_str(name);
            for op in &cond.ops {
                out.push(':');
                op_shape(op, out);
            }
            out.push('}');
        }
        Filter::And(fs) => group_shape("AND", fs, out),
        Filter::Or(fs) => group_shape("OR", fs, out),
        Filter::Nor(fs) => group_shape("NOR", fs, out),
        Filter::Not(f) => {
            out.push_str("NOT(");
            filter_shape(f, out);
            out.push(')');
        }
    }
}

fn group_shape(tag: &str, fs: &[Filter], out: &mut String) {
    out.push_str(tag);
    out.push('(');
    for f in fs {
        filter_shape(f, out);
        out.push(',');
    }
    out.push(')');
}

fn op_shape(op: &FieldOp, out: &mut String) {
    let (tag, nullness): (&str, Option<bool>) = match op {
        FieldOp::Eq(v) => ("eq", Some(v.is_null())),
        FieldOp::Ne(v) => ("ne", Some(v.is_null())),
        FieldOp::Gt(_) => ("gt", None),
        FieldOp::Gte(_) => ("gte", None),
        FieldOp::Lt(_) => ("lt", None),
        FieldOp::Lte(_) => ("lte", None),
        FieldOp::In(vs) => {
            out.push_str("in#");
            out.push_str(&vs.len().to_string());
            return;
        }
        FieldOp::Nin(vs) => {
            out.push_str("nin#");
            out.push_str(&vs.len().to_string());
            return;
        }
        FieldOp::Exists(b) => {
            out.push_str(if *b { "exists:t" } else { "exists:f" });
            return;
        }
        FieldOp::Like(_) => ("like", None),
        FieldOp::ILike(_) => ("ilike", None),
        FieldOp::Contains(_) => ("contains", None),
        FieldOp::StartsWith(_) => ("startswith", None),
        FieldOp::EndsWith(_) => ("endswith", None),
        FieldOp::Size(_) => ("size", None),
        // These never reach here: `is_cacheable` excludes them up front.
        FieldOp::All(_) | FieldOp::ElemMatch(_) | FieldOp::Index { .. } => ("uncacheable", None),
    };
    out.push_str(tag);
    if let Some(is_null) = nullness {
        out.push(if is_null { 'n' } else { 'v' });
    }
}

/// Re-walks `filter` in the same traversal order as [`translate_filter`] to
/// collect bound parameter values, without rebuilding any SQL text. Used on
/// a template-cache hit (§4.2 "On a hit, only value extraction is re-run").
fn collect_params(filter: &Filter) -> Vec<Param> {
    let mut params = Vec::new();
    collect_params_into(filter, &mut params);
    params
}

fn collect_params_into(filter: &Filter, params: &mut Vec<Param>) {
    match filter {
        Filter::MatchAll => {}
        Filter::Field(_, cond) => {
            for op in &cond.ops {
                collect_op_params(op, params);
            }
        }
        Filter::And(fs) | Filter::Or(fs) | Filter::Nor(fs) => {
            for f in fs {
                collect_params_into(f, params);
            }
        }
        Filter::Not(f) => collect_params_into(f, params),
    }
}

fn collect_op_params(op: &FieldOp, params: &mut Vec<Param>) {
    match op {
        FieldOp::Eq(v) | FieldOp::Ne(v) => {
            if !v.is_null() {
                params.push(Param::from_value(v));
            }
        }
        FieldOp::Gt(v) | FieldOp::Gte(v) | FieldOp::Lt(v) | FieldOp::Lte(v) => {
            params.push(Param::from_value(v));
        }
        FieldOp::In(vs) | FieldOp::Nin(vs) | FieldOp::All(vs) => {
            for v in vs {
                params.push(Param::from_value(v));
            }
        }
        FieldOp::Exists(_) => {}
        FieldOp::Like(s) => params.push(Param::Text(s.clone())),
        FieldOp::ILike(s) => params.push(Param::Text(s.clone())),
        FieldOp::Contains(s) => params.push(Param::Text(format!("%{}%", escape_like(s)))),
        FieldOp::StartsWith(s) => params.push(Param::Text(format!("{}%", escape_like(s)))),
        FieldOp::EndsWith(s) => params.push(Param::Text(format!("%{}", escape_like(s)))),
        FieldOp::Size(n) => params.push(Param::Integer(*n)),
        FieldOp::ElemMatch(f) => collect_params_into(f, params),
        FieldOp::Index { value, .. } => params.push(Param::from_value(value)),
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Resolves a field name to the SQL expression used to read it, per the
/// `<col>` resolution rule in §4.2. Exposed beyond this module so the
/// runtime can build a matching expression for `distinct` (§4.5), which
/// has no filter tree to walk.
pub fn resolve_column(field: &str, schema: &SchemaDefinition) -> String {
    if let Some(reserved) = schema.resolve_reserved(field) {
        return reserved.to_string();
    }
    if field == ID_FIELD {
        return ID_FIELD.to_string();
    }
    match schema.field(field) {
        Some(f) if f.needs_generated_column() => f.column_name(),
        Some(f) => format!("json_extract(body, '{}')", f.path),
        None => format!("json_extract(body, '{}')", default_path(field)),
    }
}

fn field_path(field: &str, schema: &SchemaDefinition) -> String {
    match schema.field(field) {
        Some(f) => f.path.clone(),
        None => default_path(field),
    }
}

fn declared_type(field: &str, schema: &SchemaDefinition) -> Option<StorageType> {
    match field {
        ID_FIELD => Some(StorageType::Text),
        CREATED_AT_FIELD | UPDATED_AT_FIELD => Some(StorageType::Integer),
        _ => schema.field(field).map(|f| f.storage_type),
    }
}

fn check_range_type(field: &str, schema: &SchemaDefinition, operator: &str, cursor_fields: &[&str]) -> Result<()> {
    // `_id` is the cursor tie-breaker (§4.4) and is compared with `>`/`<`
    // even though its declared type is TEXT; lexicographic ordering on the
    // primary key is well-defined SQL, so it is exempt from the
    // string-fields-reject-range rule that applies to user-declared fields.
    // The same reasoning applies to every field named in the active sort
    // spec when cursor pagination is in play: cursor synthesis (§4.4)
    // compares each sort key with `>`/`<` regardless of its declared type.
    if field == ID_FIELD || cursor_fields.contains(&field) {
        return Ok(());
    }
    if let Some(t) = declared_type(field, schema) {
        if !t.supports_range() {
            return Err(Error::type_mismatch(operator, field, t));
        }
    }
    Ok(())
}

fn check_string_type(field: &str, schema: &SchemaDefinition, operator: &str) -> Result<()> {
    if let Some(t) = declared_type(field, schema) {
        if !t.supports_string_ops() {
            return Err(Error::type_mismatch(operator, field, t));
        }
    }
    Ok(())
}

/// Translates a filter tree into a boolean SQL expression. `in_elem_match`
/// switches field resolution to operate against the `value` column bound
/// by an enclosing `json_each` (§4.2 `$elemMatch`), where an empty field
/// name addresses the array element itself rather than a sub-key of it.
/// `cursor_fields` names the sort-key fields exempt from the range-type
/// check because the active query paginates by cursor (§4.4) — empty
/// whenever no cursor is in play.
fn translate_filter(filter: &Filter, schema: &SchemaDefinition, in_elem_match: bool, cursor_fields: &[&str]) -> Result<String> {
    match filter {
        Filter::MatchAll => Ok("1=1".to_string()),
        Filter::Field(name, cond) => {
            let clauses: Vec<String> = cond
                .ops
                .iter()
                .map(|op| translate_op(name, op, schema, in_elem_match, cursor_fields))
                .collect::<Result<_>>()?;
            Ok(clauses.join(" AND "))
        }
        Filter::And(fs) => {
            if fs.is_empty() {
                return Ok("1=1".to_string());
            }
            let parts: Vec<String> = fs
                .iter()
                .map(|f| translate_filter(f, schema, in_elem_match, cursor_fields))
                .collect::<Result<_>>()?;
            Ok(format!("({})", parts.join(" AND ")))
        }
        Filter::Or(fs) => {
            if fs.is_empty() {
                return Ok("1=0".to_string());
            }
            let parts: Vec<String> = fs
                .iter()
                .map(|f| translate_filter(f, schema, in_elem_match, cursor_fields))
                .collect::<Result<_>>()?;
            Ok(format!("({})", parts.join(" OR ")))
        }
        Filter::Nor(fs) => {
            let or = translate_filter(&Filter::Or(fs.clone()), schema, in_elem_match, cursor_fields)?;
            Ok(format!("NOT ({or})"))
        }
        Filter::Not(f) => {
            let inner = translate_filter(f, schema, in_elem_match, cursor_fields)?;
            Ok(format!("NOT ({inner})"))
        }
    }
}

fn translate_op(field: &str, op: &FieldOp, schema: &SchemaDefinition, in_elem_match: bool, cursor_fields: &[&str]) -> Result<String> {
    let col = if in_elem_match {
        if field.is_empty() {
            "value".to_string()
        } else {
            format!("json_extract(value, '$.{field}')")
        }
    } else {
        resolve_column(field, schema)
    };

    match op {
        FieldOp::Eq(v) => Ok(if v.is_null() {
            format!("{col} IS NULL")
        } else {
            format!("{col} = ?")
        }),
        FieldOp::Ne(v) => Ok(if v.is_null() {
            format!("{col} IS NOT NULL")
        } else {
            format!("({col} <> ? OR {col} IS NULL)")
        }),
        FieldOp::Gt(_) => {
            if !in_elem_match {
                check_range_type(field, schema, "$gt", cursor_fields)?;
            }
            Ok(format!("{col} > ?"))
        }
        FieldOp::Gte(_) => {
            if !in_elem_match {
                check_range_type(field, schema, "$gte", cursor_fields)?;
            }
            Ok(format!("{col} >= ?"))
        }
        FieldOp::Lt(_) => {
            if !in_elem_match {
                check_range_type(field, schema, "$lt", cursor_fields)?;
            }
            Ok(format!("{col} < ?"))
        }
        FieldOp::Lte(_) => {
            if !in_elem_match {
                check_range_type(field, schema, "$lte", cursor_fields)?;
            }
            Ok(format!("{col} <= ?"))
        }
        FieldOp::In(vs) => {
            if vs.is_empty() {
                Ok("1=0".to_string())
            } else {
                Ok(format!("{col} IN ({})", placeholders(vs.len())))
            }
        }
        FieldOp::Nin(vs) => {
            if vs.is_empty() {
                Ok("1=1".to_string())
            } else {
                Ok(format!(
                    "({col} NOT IN ({}) OR {col} IS NULL)",
                    placeholders(vs.len())
                ))
            }
        }
        FieldOp::Exists(want) => {
            let path = field_path(field, schema);
            let keyword = if *want { "IS NOT NULL" } else { "IS NULL" };
            Ok(format!("json_type(body, '{path}') {keyword}"))
        }
        FieldOp::Like(_) => {
            if !in_elem_match {
                check_string_type(field, schema, "$like")?;
            }
            Ok(format!("{col} LIKE ?"))
        }
        FieldOp::ILike(_) => {
            if !in_elem_match {
                check_string_type(field, schema, "$ilike")?;
            }
            Ok(format!("LOWER({col}) LIKE LOWER(?) ESCAPE '\\'"))
        }
        FieldOp::Contains(_) | FieldOp::StartsWith(_) | FieldOp::EndsWith(_) => {
            let operator = match op {
                FieldOp::Contains(_) => "$contains",
                FieldOp::StartsWith(_) => "$startsWith",
                _ => "$endsWith",
            };
            if !in_elem_match {
                check_string_type(field, schema, operator)?;
            }
            Ok(format!("{col} LIKE ? ESCAPE '\\'"))
        }
        FieldOp::Size(_) => Ok(format!("json_array_length({col}) = ?")),
        FieldOp::All(vs) => {
            let clauses: Vec<String> = vs
                .iter()
                .map(|_| format!("EXISTS (SELECT 1 FROM json_each({col}) WHERE value = ?)"))
                .collect();
            Ok(clauses.join(" AND "))
        }
        FieldOp::ElemMatch(inner) => {
            let inner_sql = translate_filter(inner, schema, true, cursor_fields)?;
            Ok(format!("EXISTS (SELECT 1 FROM json_each({col}) WHERE {inner_sql})"))
        }
        FieldOp::Index { index, .. } => {
            let path = if *index < 0 {
                format!("$[#-{}]", index.unsigned_abs())
            } else {
                format!("$[{index}]")
            };
            Ok(format!("json_extract({col}, '{path}') = ?"))
        }
    }
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(", ")
}

fn translate_sort(options: &FindOptions, schema: &SchemaDefinition) -> Option<String> {
    if options.sort.is_empty() {
        return None;
    }
    let mut parts: Vec<String> = options
        .sort
        .0
        .iter()
        .map(|(field, dir)| format!("{} {}", resolve_column(field, schema), dir.sql_keyword()))
        .collect();

    if options.cursor.is_some() {
        let last_dir = options.sort.0.last().map(|(_, d)| *d).unwrap_or(SortDirection::Asc);
        parts.push(format!("{ID_FIELD} {}", last_dir.sql_keyword()));
    }

    Some(parts.join(", "))
}

/// Whether a filter value is a JSON null, used by call sites that build
/// filters programmatically (cursor/text-search synthesis).
pub fn is_null(v: &Value) -> bool {
    v.is_null()
}

#[cfg(test)]
mod tests {
    use super::*;
    use docbase_core::options::{Cursor, Sort};
    use docbase_core::schema::{FieldOptions, SchemaBuilder};
    use serde_json::json;

    fn schema() -> SchemaDefinition {
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
            .field(
                "age",
                StorageType::Integer,
                FieldOptions {
                    indexed: true,
                    ..Default::default()
                },
            )
            .field("tags", StorageType::Text, FieldOptions::default())
            .timestamps(true)
            .build()
    }

    #[test]
    fn eq_against_generated_column() {
        let sql = translate_filter(&Filter::eq("email", json!("a@b.c")), &schema(), false, &[]).unwrap();
        assert_eq!(sql, "_email = ?");
    }

    #[test]
    fn eq_null_renders_is_null() {
        let sql = translate_filter(&Filter::eq("email", Value::Null), &schema(), false, &[]).unwrap();
        assert_eq!(sql, "_email IS NULL");
    }

    #[test]
    fn range_on_text_field_is_type_mismatch() {
        let filter = Filter::field(
            "email",
            FieldCondition::single(FieldOp::Gt(json!(1))),
        );
        let err = translate_filter(&filter, &schema(), false, &[]).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn range_on_undeclared_field_skips_type_check() {
        let filter = Filter::field("mystery", FieldCondition::single(FieldOp::Gt(json!(1))));
        let sql = translate_filter(&filter, &schema(), false, &[]).unwrap();
        assert!(sql.contains("json_extract(body, '$.mystery')"));
    }

    #[test]
    fn empty_in_is_always_false() {
        let filter = Filter::field("age", FieldCondition::single(FieldOp::In(vec![])));
        let sql = translate_filter(&filter, &schema(), false, &[]).unwrap();
        assert_eq!(sql, "1=0");
    }

    #[test]
    fn empty_nin_is_always_true() {
        let filter = Filter::field("age", FieldCondition::single(FieldOp::Nin(vec![])));
        let sql = translate_filter(&filter, &schema(), false, &[]).unwrap();
        assert_eq!(sql, "1=1");
    }

    #[test]
    fn and_or_nor_not_render_correctly() {
        let and = Filter::and([Filter::eq("age", json!(1)), Filter::eq("email", json!("x"))]);
        assert_eq!(
            translate_filter(&and, &schema(), false, &[]).unwrap(),
            "(_age = ? AND _email = ?)"
        );

        let or = Filter::or([Filter::eq("age", json!(1))]);
        assert_eq!(translate_filter(&or, &schema(), false, &[]).unwrap(), "(_age = ?)");

        let nor = Filter::nor([Filter::eq("age", json!(1))]);
        assert_eq!(translate_filter(&nor, &schema(), false, &[]).unwrap(), "NOT ((_age = ?))");

        let not = Filter::not(Filter::eq("age", json!(1)));
        assert_eq!(translate_filter(&not, &schema(), false, &[]).unwrap(), "NOT (_age = ?)");
    }

    #[test]
    fn elem_match_resolves_against_value() {
        let filter = Filter::field(
            "tags",
            FieldCondition::single(FieldOp::ElemMatch(Box::new(Filter::eq("", json!("x"))))),
        );
        let sql = translate_filter(&filter, &schema(), false, &[]).unwrap();
        assert!(sql.contains("json_each(json_extract(body, '$.tags'))"));
        assert!(sql.contains("value = ?"));
    }

    #[test]
    fn index_operator_handles_negative_index() {
        let filter = Filter::field(
            "tags",
            FieldCondition::single(FieldOp::Index { index: -1, value: json!("x") }),
        );
        let sql = translate_filter(&filter, &schema(), false, &[]).unwrap();
        assert!(sql.contains("$[#-1]"));
    }

    #[test]
    fn exists_uses_json_type_against_body() {
        let filter = Filter::field("email", FieldCondition::single(FieldOp::Exists(true)));
        let sql = translate_filter(&filter, &schema(), false, &[]).unwrap();
        assert_eq!(sql, "json_type(body, '$.email') IS NOT NULL");
    }

    #[test]
    fn collect_params_matches_traversal_order() {
        let filter = Filter::and([Filter::eq("age", json!(1)), Filter::eq("email", json!("x"))]);
        let params = collect_params(&filter);
        assert_eq!(params, vec![Param::Integer(1), Param::Text("x".into())]);
    }

    #[test]
    fn cursor_comparison_on_text_sort_key_skips_type_check() {
        // `email` is TEXT and normally rejects `$gt`/`$lt` — but cursor
        // synthesis (§4.4) compares the sort key this way regardless of
        // declared type, so it must not raise TYPE_MISMATCH here.
        let filter = Filter::field("email", FieldCondition::single(FieldOp::Gt(json!("a@b.c"))));
        let options = FindOptions::new()
            .with_sort(Sort::new([("email", SortDirection::Asc)]))
            .with_cursor(Cursor::After("id1".into()));
        let sql = translate_filter(&filter, &schema(), false, &["email"]).unwrap();
        assert_eq!(sql, "_email > ?");

        let (where_sql, _) = compile_sql(&filter, &options, &schema()).unwrap();
        assert_eq!(where_sql, "_email > ?");
    }

    #[test]
    fn range_on_text_field_without_cursor_still_rejected() {
        let filter = Filter::field("email", FieldCondition::single(FieldOp::Gt(json!("a@b.c"))));
        let options = FindOptions::new().with_sort(Sort::new([("email", SortDirection::Asc)]));
        let err = compile_sql(&filter, &options, &schema()).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn translate_full_query_reuses_cache_on_second_call() {
        let schema = schema();
        let mut cache = TemplateCache::new(10);
        let filter1 = Filter::eq("age", json!(1));
        let filter2 = Filter::eq("age", json!(2));
        let options = FindOptions::new();

        let first = translate(&filter1, &options, &schema, Some(&mut cache)).unwrap();
        let second = translate(&filter2, &options, &schema, Some(&mut cache)).unwrap();

        assert_eq!(first.where_sql, second.where_sql);
        assert_eq!(second.params, vec![Param::Integer(2)]);
    }
}
