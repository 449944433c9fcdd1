//! Post-fetch projection (§4.3): shaping a decoded document after SQL
//! execution. Unlike the WHERE/ORDER BY/LIMIT clauses, projection never
//! reaches SQL — it runs against the already-decoded `serde_json::Value`.

use docbase_core::error::{Error, Result};
use docbase_core::options::ProjectionSpec;
use docbase_core::schema::ID_FIELD;
use serde_json::Value;

/// A resolved projection, ready to apply to any number of documents.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionPlan {
    /// No projection: the document passes through unchanged.
    Identity,
    Include { fields: Vec<String>, keep_id: bool },
    Exclude { fields: Vec<String> },
}

impl ProjectionPlan {
    /// Resolves a raw [`ProjectionSpec`] into a plan, rejecting mixed
    /// include/exclude specs (§4.3's one documented query error).
    pub fn from_spec(spec: Option<ProjectionSpec>) -> Result<Self> {
        match spec {
            None => Ok(Self::Identity),
            Some(ProjectionSpec::Include { fields, keep_id }) => {
                Ok(Self::Include { fields, keep_id })
            }
            Some(ProjectionSpec::Exclude { fields }) => Ok(Self::Exclude { fields }),
        }
    }

    /// Applies this plan to a decoded document in place.
    pub fn apply(&self, doc: &mut Value) {
        let Value::Object(map) = doc else {
            return;
        };
        match self {
            Self::Identity => {}
            Self::Include { fields, keep_id } => {
                let id = map.get(ID_FIELD).cloned();
                map.retain(|key, _| fields.iter().any(|f| f == key));
                if *keep_id {
                    if let Some(id) = id {
                        map.insert(ID_FIELD.to_string(), id);
                    }
                } else {
                    map.remove(ID_FIELD);
                }
            }
            Self::Exclude { fields } => {
                map.retain(|key, _| !fields.iter().any(|f| f == key));
            }
        }
    }
}

/// Validates that a projection spec built directly (not via the
/// include/select/omit precedence resolution) does not mix include and
/// exclude entries, e.g. `{a: 1, b: 0}` with `b` not `_id`.
pub fn validate_not_mixed(include: &[String], exclude: &[String]) -> Result<()> {
    let exclude_is_just_id = exclude.iter().all(|f| f == ID_FIELD);
    if !include.is_empty() && !exclude.is_empty() && !exclude_is_just_id {
        return Err(Error::query(
            "projection cannot mix include and exclude fields (except `_id: 0`)",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn include_keeps_id_by_default() {
        let plan = ProjectionPlan::Include {
            fields: vec!["name".into()],
            keep_id: true,
        };
        let mut doc = json!({"_id": "1", "name": "a", "age": 9});
        plan.apply(&mut doc);
        assert_eq!(doc, json!({"_id": "1", "name": "a"}));
    }

    #[test]
    fn include_drops_id_when_explicit() {
        let plan = ProjectionPlan::Include {
            fields: vec!["name".into()],
            keep_id: false,
        };
        let mut doc = json!({"_id": "1", "name": "a", "age": 9});
        plan.apply(&mut doc);
        assert_eq!(doc, json!({"name": "a"}));
    }

    #[test]
    fn exclude_drops_listed_fields() {
        let plan = ProjectionPlan::Exclude {
            fields: vec!["age".into()],
        };
        let mut doc = json!({"_id": "1", "name": "a", "age": 9});
        plan.apply(&mut doc);
        assert_eq!(doc, json!({"_id": "1", "name": "a"}));
    }

    #[test]
    fn identity_is_noop() {
        let plan = ProjectionPlan::Identity;
        let mut doc = json!({"_id": "1", "name": "a"});
        let before = doc.clone();
        plan.apply(&mut doc);
        assert_eq!(doc, before);
    }

    #[test]
    fn mixed_non_id_exclude_rejected() {
        assert!(validate_not_mixed(&["a".to_string()], &["b".to_string()]).is_err());
        assert!(validate_not_mixed(&["a".to_string()], &["_id".to_string()]).is_ok());
    }
}
