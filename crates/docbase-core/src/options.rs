//! Typed query options (§4.2 "Options"): sort, pagination, projection,
//! text search, and cursor pagination.

use serde_json::Value;

/// Ascending or descending sort direction (+1/-1 in the distilled spec).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn sql_keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    pub fn reversed(self) -> Self {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }
}

/// An ordered sort specification: `[(field, direction), ...]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sort(pub Vec<(String, SortDirection)>);

impl Sort {
    pub fn new(spec: impl IntoIterator<Item = (impl Into<String>, SortDirection)>) -> Self {
        Self(spec.into_iter().map(|(f, d)| (f.into(), d)).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Projection precedence, per §4.2: `projection > select > omit`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionSpec {
    /// `{f: 1, ...}` — include mode. `keep_id` tracks whether `_id: 0` was
    /// explicit in an include-mode spec.
    Include { fields: Vec<String>, keep_id: bool },
    /// `{f: 0, ...}` — exclude mode.
    Exclude { fields: Vec<String> },
}

/// The three ways a caller can shape the result document, combined by
/// [`FindOptions::resolve_projection`] per the precedence rule.
#[derive(Debug, Clone, Default)]
pub struct ProjectionInputs {
    pub projection: Option<ProjectionSpec>,
    pub select: Option<Vec<String>>,
    pub omit: Option<Vec<String>>,
}

impl ProjectionInputs {
    /// Resolves `projection > select > omit` into a single spec.
    pub fn resolve(&self) -> Option<ProjectionSpec> {
        if let Some(p) = &self.projection {
            return Some(p.clone());
        }
        if let Some(select) = &self.select {
            return Some(ProjectionSpec::Include {
                fields: select.clone(),
                keep_id: true,
            });
        }
        if let Some(omit) = &self.omit {
            return Some(ProjectionSpec::Exclude {
                fields: omit.clone(),
            });
        }
        None
    }
}

/// Multi-field `LIKE`-style text search (§4.2 "textSearch").
#[derive(Debug, Clone, PartialEq)]
pub struct TextSearchOptions {
    pub text: String,
    pub fields: Vec<String>,
    pub case_sensitive: bool,
}

/// Cursor pagination anchor (§4.4). At most one direction is meaningful
/// per call.
#[derive(Debug, Clone, PartialEq)]
pub enum Cursor {
    After(String),
    Before(String),
}

/// The full options record accepted by `find`/`findOne`/`search` (§4.2,
/// §4.5). All fields are optional; an empty `FindOptions::default()` means
/// "no sort, no limit, no projection".
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Sort,
    pub limit: Option<i64>,
    pub skip: Option<i64>,
    pub projection: ProjectionInputs,
    pub text_search: Option<TextSearchOptions>,
    pub cursor: Option<Cursor>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: i64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn with_text_search(mut self, search: TextSearchOptions) -> Self {
        self.text_search = Some(search);
        self
    }
}

/// Which side of a `findOneAnd*` transaction the caller wants returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnDocument {
    Before,
    #[default]
    After,
}

/// Options shared by `findOneAndUpdate`/`findOneAndReplace`/`findOneAndDelete`.
#[derive(Debug, Clone, Default)]
pub struct FindOneAndModifyOptions {
    pub sort: Sort,
    pub upsert: bool,
    pub return_document: ReturnDocument,
}

/// Options accepted by `updateOne`/`replaceOne` (§4.5).
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub upsert: bool,
}

/// Options accepted by `insertMany` (§4.5).
#[derive(Debug, Clone)]
pub struct InsertManyOptions {
    pub ordered: bool,
}

impl Default for InsertManyOptions {
    fn default() -> Self {
        Self { ordered: true }
    }
}

/// Convenience: wraps a bare JSON scalar as a `serde_json::Value`, used by
/// call sites that build filters/updates inline.
pub fn scalar(v: impl Into<Value>) -> Value {
    v.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_precedence_projection_wins() {
        let inputs = ProjectionInputs {
            projection: Some(ProjectionSpec::Exclude {
                fields: vec!["a".into()],
            }),
            select: Some(vec!["b".into()]),
            omit: Some(vec!["c".into()]),
        };
        assert_eq!(
            inputs.resolve(),
            Some(ProjectionSpec::Exclude {
                fields: vec!["a".into()]
            })
        );
    }

    #[test]
    fn projection_precedence_select_over_omit() {
        let inputs = ProjectionInputs {
            projection: None,
            select: Some(vec!["b".into()]),
            omit: Some(vec!["c".into()]),
        };
        assert_eq!(
            inputs.resolve(),
            Some(ProjectionSpec::Include {
                fields: vec!["b".into()],
                keep_id: true
            })
        );
    }

    #[test]
    fn projection_precedence_omit_alone() {
        let inputs = ProjectionInputs {
            projection: None,
            select: None,
            omit: Some(vec!["c".into()]),
        };
        assert_eq!(
            inputs.resolve(),
            Some(ProjectionSpec::Exclude {
                fields: vec!["c".into()]
            })
        );
    }

    #[test]
    fn sort_direction_reverses() {
        assert_eq!(SortDirection::Asc.reversed(), SortDirection::Desc);
        assert_eq!(SortDirection::Desc.reversed(), SortDirection::Asc);
    }
}
