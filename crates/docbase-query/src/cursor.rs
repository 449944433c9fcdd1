//! Cursor pagination filter synthesis (§4.4).
//!
//! The anchor document lookup itself is I/O and happens in the runtime;
//! this module only turns the anchor's already-fetched sort-key tuple into
//! the tuple-comparison [`Filter`] that makes pagination stable under ties.

use docbase_core::error::{Error, Result};
use docbase_core::filter::Filter;
use docbase_core::options::{Cursor, Sort, SortDirection};
use docbase_core::schema::ID_FIELD;
use serde_json::Value;

/// Builds the tuple-comparison filter for page `cursor` given the sort
/// spec `sort` and the anchor document's `anchor_id` and sort-key values
/// `anchor_values` (one per entry in `sort`, same order).
///
/// `(k1 CMP1 v1) OR (k1=v1 AND k2 CMP2 v2) OR ... OR (k1=v1 AND ... AND _id CMP id)`
pub fn build_filter(sort: &Sort, cursor: &Cursor, anchor_id: &str, anchor_values: &[Value]) -> Result<Filter> {
    if sort.is_empty() {
        return Err(Error::query(
            "cursor pagination requires a non-empty sort spec",
        ));
    }
    if sort.0.len() != anchor_values.len() {
        return Err(Error::query(format!(
            "cursor anchor has {} values but sort spec has {} keys",
            anchor_values.len(),
            sort.0.len()
        )));
    }

    let invert = matches!(cursor, Cursor::Before(_));
    let mut branches = Vec::with_capacity(sort.0.len() + 1);

    for i in 0..sort.0.len() {
        let mut clauses = Vec::with_capacity(i + 1);
        for (field, _) in &sort.0[..i] {
            clauses.push(equality(field, &anchor_values[sort_index(sort, field)]));
        }
        let (field, dir) = &sort.0[i];
        let effective_dir = if invert { dir.reversed() } else { *dir };
        clauses.push(comparison(field, effective_dir, &anchor_values[i]));
        branches.push(Filter::and(clauses));
    }

    let mut tail_clauses: Vec<Filter> = sort
        .0
        .iter()
        .enumerate()
        .map(|(i, (field, _))| equality(field, &anchor_values[i]))
        .collect();
    tail_clauses.push(id_comparison(invert, anchor_id));
    branches.push(Filter::and(tail_clauses));

    Ok(Filter::or(branches))
}

fn sort_index(sort: &Sort, field: &str) -> usize {
    sort.0.iter().position(|(f, _)| f == field).unwrap_or(0)
}

fn equality(field: &str, value: &Value) -> Filter {
    Filter::eq(field, value.clone())
}

fn comparison(field: &str, dir: SortDirection, value: &Value) -> Filter {
    use docbase_core::filter::{FieldCondition, FieldOp};
    let op = match dir {
        SortDirection::Asc => FieldOp::Gt(value.clone()),
        SortDirection::Desc => FieldOp::Lt(value.clone()),
    };
    Filter::field(field, FieldCondition::single(op))
}

fn id_comparison(invert: bool, anchor_id: &str) -> Filter {
    use docbase_core::filter::{FieldCondition, FieldOp};
    let op = if invert {
        FieldOp::Lt(Value::String(anchor_id.to_string()))
    } else {
        FieldOp::Gt(Value::String(anchor_id.to_string()))
    };
    Filter::field(ID_FIELD, FieldCondition::single(op))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docbase_core::filter::FieldOp;
    use serde_json::json;

    #[test]
    fn requires_nonempty_sort() {
        let sort = Sort::default();
        let err = build_filter(&sort, &Cursor::After("id1".into()), "id1", &[]).unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    #[test]
    fn single_key_after_produces_two_branches() {
        let sort = Sort::new([("age", SortDirection::Asc)]);
        let filter = build_filter(&sort, &Cursor::After("id1".into()), "id1", &[json!(30)]).unwrap();
        match filter {
            Filter::Or(branches) => assert_eq!(branches.len(), 2),
            _ => panic!("expected Or"),
        }
    }

    #[test]
    fn before_inverts_comparisons() {
        let sort = Sort::new([("age", SortDirection::Asc)]);
        let filter = build_filter(&sort, &Cursor::Before("id1".into()), "id1", &[json!(30)]).unwrap();
        match filter {
            Filter::Or(branches) => match &branches[0] {
                Filter::And(clauses) => match &clauses[0] {
                    Filter::Field(_, cond) => assert!(matches!(cond.ops[0], FieldOp::Lt(_))),
                    _ => panic!("expected Field"),
                },
                _ => panic!("expected And"),
            },
            _ => panic!("expected Or"),
        }
    }

    #[test]
    fn rejects_mismatched_value_count() {
        let sort = Sort::new([("age", SortDirection::Asc), ("name", SortDirection::Asc)]);
        let err = build_filter(&sort, &Cursor::After("id1".into()), "id1", &[json!(30)]).unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }
}
