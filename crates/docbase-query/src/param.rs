//! Parameter values produced by the translator.
//!
//! The translator never touches `rusqlite` — it is a pure function over
//! typed data (§4.2) — so parameter slots are carried as this small closed
//! enum instead of `Box<dyn ToSql>`. The `docbase` crate converts each
//! [`Param`] to its engine binding at the point of execution.

use serde_json::Value;

/// One bound value in a compiled statement's parameter list, in positional
/// order (`?1`, `?2`, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Text(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
    Null,
}

impl Param {
    /// Converts a filter leaf value into a bound parameter. Arrays/objects
    /// are stored as their JSON text form — used only by `$in`/`$all`
    /// element comparisons against scalar-typed columns; the translator
    /// rejects array/object leaves against declared scalar fields earlier
    /// via the type-mismatch check.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Param::Null,
            Value::Bool(b) => Param::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Param::Integer(i)
                } else {
                    Param::Real(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => Param::Text(s.clone()),
            other => Param::Text(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_scalars() {
        assert_eq!(Param::from_value(&json!(null)), Param::Null);
        assert_eq!(Param::from_value(&json!(true)), Param::Bool(true));
        assert_eq!(Param::from_value(&json!(42)), Param::Integer(42));
        assert_eq!(Param::from_value(&json!(1.5)), Param::Real(1.5));
        assert_eq!(Param::from_value(&json!("x")), Param::Text("x".into()));
    }
}
