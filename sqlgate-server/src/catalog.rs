// Catalog introspection queries
//
// These run as fixed internal statements and never pass through the caller
// SQL validator, which would reject the pg_catalog references.

pub const SERVER_VERSION: &str = "SELECT version()";
pub const CURRENT_DATABASE: &str = "SELECT current_database()";
pub const CURRENT_USER: &str = "SELECT current_user::text";
pub const PING: &str = "SELECT 1";

pub const WRITE_TEST_CREATE: &str =
    "CREATE TEMP TABLE IF NOT EXISTS sqlgate_connection_test (id int)";
pub const WRITE_TEST_INSERT: &str = "INSERT INTO sqlgate_connection_test (id) VALUES (1)";
pub const WRITE_TEST_SELECT: &str = "SELECT id FROM sqlgate_connection_test LIMIT 1";
pub const WRITE_TEST_DROP: &str = "DROP TABLE IF EXISTS sqlgate_connection_test";

pub const LIST_DATABASES: &str = r#"
SELECT
    d.datname::text AS database_name,
    pg_catalog.pg_get_userbyid(d.datdba)::text AS owner,
    pg_catalog.pg_encoding_to_char(d.encoding)::text AS encoding,
    d.datcollate::text AS collation,
    d.datctype::text AS ctype,
    pg_catalog.array_to_string(d.datacl, E'\n') AS access_privileges,
    CASE
        WHEN pg_catalog.has_database_privilege(d.datname, 'CONNECT')
            THEN pg_catalog.pg_size_pretty(pg_catalog.pg_database_size(d.datname))
        ELSE 'No Access'
    END AS size,
    pg_catalog.shobj_description(d.oid, 'pg_database') AS comment
FROM pg_catalog.pg_database d
ORDER BY 1
"#;

pub const LIST_SCHEMAS: &str = r#"
SELECT
    n.nspname::text AS schema_name,
    pg_catalog.pg_get_userbyid(n.nspowner)::text AS owner,
    pg_catalog.array_to_string(n.nspacl, E'\n') AS access_privileges,
    pg_catalog.obj_description(n.oid, 'pg_namespace') AS comment
FROM pg_catalog.pg_namespace n
WHERE n.nspname !~ '^pg_' AND n.nspname <> 'information_schema'
ORDER BY 1
"#;

const TABLE_COLUMNS: &str = r#"
SELECT
    t.table_schema::text AS schema_name,
    t.table_name::text AS table_name,
    t.table_type::text AS table_type,
    pg_catalog.pg_get_userbyid(c.relowner)::text AS owner,
    pg_catalog.pg_size_pretty(pg_catalog.pg_total_relation_size(c.oid)) AS size,
    c.reltuples::bigint AS estimated_rows,
    pg_catalog.obj_description(c.oid, 'pg_class') AS comment
FROM information_schema.tables t
JOIN pg_catalog.pg_class c ON c.relname = t.table_name
JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace AND n.nspname = t.table_schema
"#;

pub fn list_tables() -> String {
    format!(
        "{}WHERE t.table_schema NOT IN ('pg_catalog', 'information_schema')\nORDER BY t.table_schema, t.table_name",
        TABLE_COLUMNS
    )
}

pub fn list_tables_in_schema() -> String {
    format!("{}WHERE t.table_schema = $1\nORDER BY t.table_name", TABLE_COLUMNS)
}
