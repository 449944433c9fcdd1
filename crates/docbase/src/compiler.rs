//! Schema-to-DDL compiler (§4.1): turns a [`SchemaDefinition`] into the
//! `CREATE TABLE` / `CREATE INDEX` statements that back one collection.

use docbase_core::schema::{sanitize_identifier, SchemaDefinition};

/// Builds the `CREATE TABLE IF NOT EXISTS` statement for `table`.
pub fn create_table_sql(table: &str, schema: &SchemaDefinition) -> String {
    let mut columns = vec!["_id TEXT PRIMARY KEY".to_string(), "body BLOB NOT NULL".to_string()];

    if schema.timestamps {
        columns.push("createdAt INTEGER NOT NULL".to_string());
        columns.push("updatedAt INTEGER NOT NULL".to_string());
    }

    for field in &schema.fields {
        if field.needs_generated_column() {
            columns.push(format!(
                "{} {} GENERATED ALWAYS AS (json_extract(body, '{}')) VIRTUAL",
                field.column_name(),
                field.storage_type.sql_affinity(),
                field.path
            ));
        }
    }

    format!("CREATE TABLE IF NOT EXISTS {table} (\n    {}\n)", columns.join(",\n    "))
}

/// Builds one `CREATE [UNIQUE] INDEX IF NOT EXISTS` statement per indexed
/// or uniqued field, plus one per compound index.
pub fn create_index_statements(table: &str, schema: &SchemaDefinition) -> Vec<String> {
    let mut statements = Vec::new();

    for field in &schema.fields {
        if field.indexed || field.unique {
            let unique_kw = if field.unique { "UNIQUE " } else { "" };
            let index_name = format!("ix_{table}_{}", sanitize_identifier(&field.name));
            statements.push(format!(
                "CREATE {unique_kw}INDEX IF NOT EXISTS {index_name} ON {table}({})",
                field.column_name()
            ));
        }
    }

    for compound in &schema.compound_indexes {
        let unique_kw = if compound.unique { "UNIQUE " } else { "" };
        let index_name = format!("ix_{table}_{}", sanitize_identifier(&compound.name));
        let columns: Vec<String> = compound
            .fields
            .iter()
            .map(|name| match schema.field(name) {
                Some(field) => field.column_name(),
                None => format!("_{}", sanitize_identifier(name)),
            })
            .collect();
        statements.push(format!(
            "CREATE {unique_kw}INDEX IF NOT EXISTS {index_name} ON {table}({})",
            columns.join(", ")
        ));
    }

    statements
}

/// Builds the statement that tears down a collection's table (§4.5 `drop`).
pub fn drop_table_sql(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {table}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use docbase_core::schema::{FieldOptions, SchemaBuilder, StorageType};
    use pretty_assertions::assert_eq;

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
            .field(
                "age",
                StorageType::Integer,
                FieldOptions {
                    indexed: true,
                    ..Default::default()
                },
            )
            .field("bio", StorageType::Text, FieldOptions::default())
            .compound_index("ix_age_email", ["age", "email"], false)
            .unwrap()
            .timestamps(true)
            .build()
    }

    #[test]
    fn create_table_includes_timestamps_and_generated_columns() {
        let sql = create_table_sql("users", &sample_schema());
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS users"));
        assert!(sql.contains("_id TEXT PRIMARY KEY"));
        assert!(sql.contains("createdAt INTEGER NOT NULL"));
        assert!(sql.contains("updatedAt INTEGER NOT NULL"));
        assert!(sql.contains("_email TEXT GENERATED ALWAYS AS (json_extract(body, '$.email')) VIRTUAL"));
        assert!(sql.contains("_age INTEGER GENERATED ALWAYS AS (json_extract(body, '$.age')) VIRTUAL"));
        assert!(!sql.contains("_bio"));
    }

    #[test]
    fn indexes_cover_unique_indexed_and_compound_fields() {
        let statements = create_index_statements("users", &sample_schema());
        assert!(statements.iter().any(|s| s.contains("UNIQUE INDEX IF NOT EXISTS ix_users_email")));
        assert!(statements.iter().any(|s| s.contains("INDEX IF NOT EXISTS ix_users_age") && !s.contains("UNIQUE")));
        assert!(statements
            .iter()
            .any(|s| s.contains("ix_users_ix_age_email") && s.contains("_age, _email")));
    }

    #[test]
    fn dotted_field_name_sanitises_identifier_but_keeps_path() {
        let schema = SchemaBuilder::new()
            .field(
                "address.city",
                StorageType::Text,
                FieldOptions {
                    indexed: true,
                    ..Default::default()
                },
            )
            .build();
        let sql = create_table_sql("users", &schema);
        assert!(sql.contains("_address_city TEXT GENERATED ALWAYS AS (json_extract(body, '$.address.city')) VIRTUAL"));
    }

    #[test]
    fn drop_table_statement() {
        assert_eq!(drop_table_sql("users"), "DROP TABLE IF EXISTS users");
    }
}
