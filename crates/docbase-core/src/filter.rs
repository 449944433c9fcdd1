//! The typed filter tree (§4.2 "Filter grammar").
//!
//! A [`Filter`] is the pure, engine-agnostic AST the query translator
//! compiles into SQL. Building one directly (rather than deserialising it
//! from an untyped map) keeps the operator set closed and catches typos in
//! operator names at compile time instead of as a runtime `QUERY` error.

use serde_json::Value;

/// A single operator applied to one field. Several of these, collected
/// under the same field name, are implicitly AND-ed together (e.g.
/// `{age: {$gte: 18, $lt: 65}}`).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Like(String),
    ILike(String),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    Size(i64),
    All(Vec<Value>),
    /// Matches if at least one array element satisfies the nested filter.
    ElemMatch(Box<Filter>),
    /// Matches if the array element at `index` (negative counts from the
    /// end) equals `value`.
    Index { index: i64, value: Value },
}

/// The set of operators applied to one field, implicitly AND-ed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldCondition {
    pub ops: Vec<FieldOp>,
}

impl FieldCondition {
    pub fn single(op: FieldOp) -> Self {
        Self { ops: vec![op] }
    }
}

/// The recursive filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `{ field: ... }` — one or more operators applied to `field`.
    Field(String, FieldCondition),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Not(Box<Filter>),
    /// Matches every document. The identity element for `And`.
    MatchAll,
}

impl Filter {
    /// `{ field: value }` plain equality (or `IS NULL` if `value` is null).
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Field(field.into(), FieldCondition::single(FieldOp::Eq(value.into())))
    }

    /// The `{_id: id}` fast-path filter recognised at the operation
    /// boundary (§9 "ID-only fast paths").
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::eq(crate::schema::ID_FIELD, Value::String(id.into()))
    }

    /// Returns the bare `_id` string this filter matches, if it is exactly
    /// `{_id: "..."}` with no other clauses — the shape that lets the
    /// runtime skip the translator entirely.
    pub fn as_id_only(&self) -> Option<&str> {
        match self {
            Self::Field(field, cond) if field == crate::schema::ID_FIELD => match cond.ops.as_slice() {
                [FieldOp::Eq(Value::String(id))] => Some(id.as_str()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn field(field: impl Into<String>, condition: FieldCondition) -> Self {
        Self::Field(field.into(), condition)
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::Or(filters.into_iter().collect())
    }

    pub fn nor(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::Nor(filters.into_iter().collect())
    }

    pub fn not(filter: Filter) -> Self {
        Self::Not(Box::new(filter))
    }

    /// Combines `self` and `other` with AND, flattening nested `And`
    /// nodes so repeated merging (cursor/text-search synthesis, §4.2)
    /// doesn't build up deep nesting.
    pub fn merge_and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::MatchAll, rhs) => rhs,
            (lhs, Filter::MatchAll) => lhs,
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            }
            (Filter::And(mut a), rhs) => {
                a.push(rhs);
                Filter::And(a)
            }
            (lhs, Filter::And(mut b)) => {
                b.insert(0, lhs);
                Filter::And(b)
            }
            (lhs, rhs) => Filter::And(vec![lhs, rhs]),
        }
    }

    /// Whether this filter tree contains a construct the template cache
    /// cannot key on (§4.2 "Template cache"): `$elemMatch`, `$index`, or
    /// `$all`, whose *value shapes* vary between instances.
    pub fn is_cacheable(&self) -> bool {
        match self {
            Filter::MatchAll => true,
            Filter::Field(_, cond) => cond.ops.iter().all(|op| {
                !matches!(op, FieldOp::ElemMatch(_) | FieldOp::Index { .. } | FieldOp::All(_))
            }),
            Filter::And(fs) | Filter::Or(fs) | Filter::Nor(fs) => fs.iter().all(Filter::is_cacheable),
            Filter::Not(f) => f.is_cacheable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eq_with_null_value_is_still_eq_op() {
        let f = Filter::eq("email", Value::Null);
        match f {
            Filter::Field(name, cond) => {
                assert_eq!(name, "email");
                assert_eq!(cond.ops, vec![FieldOp::Eq(Value::Null)]);
            }
            _ => panic!("expected Field"),
        }
    }

    #[test]
    fn as_id_only_recognises_bare_id_equality() {
        let f = Filter::by_id("doc-1");
        assert_eq!(f.as_id_only(), Some("doc-1"));

        let f2 = Filter::and([Filter::by_id("doc-1"), Filter::eq("x", json!(1))]);
        assert_eq!(f2.as_id_only(), None);
    }

    #[test]
    fn merge_and_flattens_nested_and_nodes() {
        let f = Filter::and([Filter::eq("a", json!(1)), Filter::eq("b", json!(2))]);
        let merged = f.merge_and(Filter::eq("c", json!(3)));
        match merged {
            Filter::And(items) => assert_eq!(items.len(), 3),
            _ => panic!("expected And"),
        }
    }

    #[test]
    fn merge_and_with_match_all_is_identity() {
        let f = Filter::eq("a", json!(1));
        assert_eq!(f.clone().merge_and(Filter::MatchAll), f);
        assert_eq!(Filter::MatchAll.merge_and(f.clone()), f);
    }

    #[test]
    fn cacheability_excludes_elem_match_index_all() {
        assert!(Filter::eq("a", json!(1)).is_cacheable());
        assert!(!Filter::field("tags", FieldCondition::single(FieldOp::All(vec![json!("x")]))).is_cacheable());
        assert!(!Filter::field(
            "tags",
            FieldCondition::single(FieldOp::ElemMatch(Box::new(Filter::eq("x", json!(1)))))
        )
        .is_cacheable());
        assert!(!Filter::field(
            "tags",
            FieldCondition::single(FieldOp::Index { index: 0, value: json!("x") })
        )
        .is_cacheable());
    }
}
