//! The schema model (§3, §4.1): field declarations, compound indexes, the
//! timestamps toggle, and the validator hook. This module is pure data —
//! no SQL and no engine I/O. The `docbase` crate's `sqlite::compiler`
//! module turns a [`SchemaDefinition`] into DDL; `docbase-query` turns it,
//! together with a filter, into a `WHERE` clause.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};

/// The three reserved columns every table carries. Filters and sorts
/// against these names resolve directly to the physical column, bypassing
/// the generated-column / `json_extract` machinery (§4.2).
pub const ID_FIELD: &str = "_id";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Declared storage type of a schema field, used both for the generated
/// column's type affinity and for the query translator's type checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageType {
    Text,
    Integer,
    Real,
    Boolean,
    Numeric,
    Blob,
}

impl StorageType {
    /// The SQLite column-affinity keyword used when declaring the
    /// generated column.
    pub fn sql_affinity(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Boolean => "BOOLEAN",
            Self::Numeric => "NUMERIC",
            Self::Blob => "BLOB",
        }
    }

    /// Whether range operators (`$gt`/`$gte`/`$lt`/`$lte`) are legal
    /// against a field of this type (§4.2 "Type checks").
    pub fn supports_range(self) -> bool {
        matches!(self, Self::Integer | Self::Real | Self::Numeric)
    }

    /// Whether string operators (`$like`, `$contains`, ...) are legal
    /// against a field of this type.
    pub fn supports_string_ops(self) -> bool {
        matches!(self, Self::Text)
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_affinity())
    }
}

/// One declared field of a collection's schema.
#[derive(Debug, Clone)]
pub struct SchemaField {
    /// User-visible field name; may contain dots for nested access
    /// (e.g. `"address.city"`).
    pub name: String,
    /// JSON path used to extract this field from the document body.
    /// Defaults to `$.` plus `name` with dots rewritten to path segments.
    pub path: String,
    pub storage_type: StorageType,
    pub nullable: bool,
    pub indexed: bool,
    pub unique: bool,
    pub default: Option<Value>,
}

impl SchemaField {
    /// The sanitised identifier used for this field's generated column:
    /// `_<name>` with dots replaced by underscores.
    pub fn column_name(&self) -> String {
        format!("_{}", sanitize_identifier(&self.name))
    }

    /// Whether this field requires a physical generated column (either it
    /// was declared indexed/unique, or a later compound index references
    /// it and the compiler injects one — see `docbase::sqlite::compiler`).
    pub fn needs_generated_column(&self) -> bool {
        self.indexed || self.unique
    }
}

/// Rewrites a dotted field name into a sanitised SQL identifier fragment.
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Derives the default JSON path for a field name: `"a.b"` -> `"$.a.b"`.
pub fn default_path(name: &str) -> String {
    format!("$.{name}")
}

/// A multi-column index over generated columns.
#[derive(Debug, Clone)]
pub struct CompoundIndex {
    pub name: String,
    pub fields: Vec<String>,
    pub unique: bool,
}

/// A predicate applied to a candidate document before it is written.
/// Treated as opaque by the core — concrete adapters (standard-schema,
/// a hand-written closure, ...) are an external collaborator (§9).
pub type Validator = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// An immutable, compiled collection schema (§3 `SchemaDefinition`).
#[derive(Clone)]
pub struct SchemaDefinition {
    pub fields: Vec<SchemaField>,
    pub compound_indexes: Vec<CompoundIndex>,
    pub timestamps: bool,
    pub validator: Option<Validator>,
}

impl fmt::Debug for SchemaDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaDefinition")
            .field("fields", &self.fields)
            .field("compound_indexes", &self.compound_indexes)
            .field("timestamps", &self.timestamps)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl SchemaDefinition {
    /// Looks up a declared field by its user-visible name. The three
    /// reserved columns are not declared fields and are not found here —
    /// callers check for them separately (see [`Self::resolve_reserved`]).
    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Resolves one of the three reserved columns, if `name` names one.
    pub fn resolve_reserved(&self, name: &str) -> Option<&'static str> {
        match name {
            ID_FIELD => Some(ID_FIELD),
            CREATED_AT_FIELD if self.timestamps => Some(CREATED_AT_FIELD),
            UPDATED_AT_FIELD if self.timestamps => Some(UPDATED_AT_FIELD),
            _ => None,
        }
    }

    /// Runs the validator, if any, against a candidate document.
    pub fn validate(&self, doc: &Value) -> Result<()> {
        if let Some(validator) = &self.validator {
            validator(doc).map_err(|message| Error::validation("<document>", message))?;
        }
        Ok(())
    }
}

/// Builder for [`SchemaDefinition`] (§4.1 "Public contract").
#[derive(Default)]
pub struct SchemaBuilder {
    fields: Vec<SchemaField>,
    compound_indexes: Vec<CompoundIndex>,
    timestamps: bool,
    validator: Option<Validator>,
}

/// Options accepted by [`SchemaBuilder::field`].
#[derive(Default, Clone)]
pub struct FieldOptions {
    pub indexed: bool,
    pub unique: bool,
    pub nullable: bool,
    pub default: Option<Value>,
    pub path: Option<String>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one field. `name` accepts dot notation; if `path` is
    /// omitted in `opts`, it is derived by prefixing `$.` to `name`.
    pub fn field(
        mut self,
        name: impl Into<String>,
        storage_type: StorageType,
        opts: FieldOptions,
    ) -> Self {
        let name = name.into();
        let path = opts.path.unwrap_or_else(|| default_path(&name));
        self.fields.push(SchemaField {
            name,
            path,
            storage_type,
            nullable: opts.nullable,
            indexed: opts.indexed,
            unique: opts.unique,
            default: opts.default,
        });
        self
    }

    /// Registers a multi-column index. Every listed field must already be
    /// declared via [`Self::field`].
    pub fn compound_index(
        mut self,
        name: impl Into<String>,
        fields: impl IntoIterator<Item = impl Into<String>>,
        unique: bool,
    ) -> Result<Self> {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        for f in &fields {
            if !self.fields.iter().any(|sf| &sf.name == f) {
                return Err(Error::query(format!(
                    "compound index references undeclared field `{f}` — declare it with .field() first"
                )));
            }
        }
        self.compound_indexes.push(CompoundIndex {
            name: name.into(),
            fields,
            unique,
        });
        Ok(self)
    }

    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    pub fn validate(mut self, validator: impl Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Finalises the schema. Injects a generated column for any field that
    /// is referenced only by a compound index (§4.1 edge case).
    pub fn build(mut self) -> SchemaDefinition {
        let compound_fields: Vec<String> = self
            .compound_indexes
            .iter()
            .flat_map(|ci| ci.fields.iter().cloned())
            .collect();
        for name in compound_fields {
            if let Some(field) = self.fields.iter_mut().find(|f| f.name == name) {
                if !field.needs_generated_column() {
                    field.indexed = true;
                }
            }
        }
        SchemaDefinition {
            fields: self.fields,
            compound_indexes: self.compound_indexes,
            timestamps: self.timestamps,
            validator: self.validator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_rewrites_dots() {
        assert_eq!(default_path("email"), "$.email");
        assert_eq!(default_path("address.city"), "$.address.city");
    }

    #[test]
    fn column_name_sanitises_dots() {
        let field = SchemaField {
            name: "address.city".into(),
            path: "$.address.city".into(),
            storage_type: StorageType::Text,
            nullable: true,
            indexed: true,
            unique: false,
            default: None,
        };
        assert_eq!(field.column_name(), "_address_city");
    }

    #[test]
    fn builder_rejects_compound_index_on_undeclared_field() {
        let result = SchemaBuilder::new()
            .field("email", StorageType::Text, FieldOptions::default())
            .compound_index("ix", ["email", "age"], false);
        assert!(result.is_err());
    }

    #[test]
    fn builder_injects_generated_column_for_compound_only_field() {
        let schema = SchemaBuilder::new()
            .field(
                "email",
                StorageType::Text,
                FieldOptions {
                    indexed: true,
                    unique: true,
                    ..Default::default()
                },
            )
            .field("age", StorageType::Integer, FieldOptions::default())
            .compound_index("ix_age_email", ["age", "email"], false)
            .unwrap()
            .timestamps(true)
            .build();

        let age = schema.field("age").unwrap();
        assert!(age.needs_generated_column());
        assert!(age.indexed);
    }

    #[test]
    fn storage_type_range_and_string_support() {
        assert!(StorageType::Integer.supports_range());
        assert!(!StorageType::Text.supports_range());
        assert!(StorageType::Text.supports_string_ops());
        assert!(!StorageType::Integer.supports_string_ops());
    }

    #[test]
    fn validator_runs_on_validate() {
        let schema = SchemaBuilder::new()
            .validate(|doc| {
                if doc.get("email").is_some() {
                    Ok(())
                } else {
                    Err("email is required".to_string())
                }
            })
            .build();

        assert!(schema.validate(&serde_json::json!({"email": "a@b.c"})).is_ok());
        assert!(schema.validate(&serde_json::json!({})).is_err());
    }
}
