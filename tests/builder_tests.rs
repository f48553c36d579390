// Statement builder tests through the public API

use serde_json::json;
use sqlgate_core::builder::{
    build_count, build_delete, build_insert, build_select, build_select_by_id, build_update,
};
use sqlgate_core::{
    sanitize_schema, sanitize_table, Error, JsonRow, OperationMode, OrderBy, RecordId,
    SanitizedIdentifier, SelectOptions, SqlValidator, SqlValue,
};

fn users() -> (SanitizedIdentifier, SanitizedIdentifier) {
    (sanitize_schema("public").unwrap(), sanitize_table("users").unwrap())
}

fn row(value: serde_json::Value) -> JsonRow {
    value.as_object().cloned().unwrap()
}

// ============================================================================
// BUILDER OUTPUT SHAPE
// ============================================================================

#[test]
fn test_insert_has_one_placeholder_per_field() {
    let (schema, table) = users();
    let stmt = build_insert(&schema, &table, &row(json!({"name": "A", "age": 1}))).unwrap();
    assert_eq!(stmt.placeholder_count(), 2);
    assert_eq!(stmt.parameters(), &[SqlValue::Text("A".to_string()), SqlValue::Int(1)]);
    assert!(stmt.returns_rows());
}

#[test]
fn test_update_binds_id_then_fields() {
    let (schema, table) = users();
    let stmt = build_update(&schema, &table, &RecordId::coerce("5"), &row(json!({"age": 2}))).unwrap();
    assert!(stmt.sql().contains("SET age = $2 WHERE id = $1"));
    assert_eq!(stmt.parameters(), &[SqlValue::Int(5), SqlValue::Int(2)]);
}

#[test]
fn test_nested_values_bind_as_documents_and_lists() {
    let (schema, table) = users();
    let stmt = build_insert(
        &schema,
        &table,
        &row(json!({"profile": {"a": 1}, "tags": ["x", "y"], "note": null})),
    )
    .unwrap();
    assert_eq!(
        stmt.parameters(),
        &[
            SqlValue::Json(json!({"a": 1})),
            SqlValue::List(vec![SqlValue::Text("x".into()), SqlValue::Text("y".into())]),
            SqlValue::Null,
        ]
    );
}

#[test]
fn test_string_ids_stay_strings() {
    let (schema, table) = users();
    let stmt = build_select_by_id(&schema, &table, &RecordId::coerce("a1b2"));
    assert_eq!(stmt.parameters(), &[SqlValue::Text("a1b2".to_string())]);

    let stmt = build_delete(&schema, &table, &RecordId::coerce("-17"));
    assert_eq!(stmt.parameters(), &[SqlValue::Int(-17)]);
}

#[test]
fn test_bad_columns_never_reach_sql() {
    let (schema, table) = users();
    for column in ["name--", "a b", "1col", "x.y", ""] {
        let mut data = JsonRow::new();
        data.insert(column.to_string(), json!(1));
        let err = build_insert(&schema, &table, &data).unwrap_err();
        assert!(matches!(err, Error::InvalidIdentifier(_)), "accepted column {:?}", column);
    }
}

// ============================================================================
// BUILDER OUTPUT AGAINST THE VALIDATOR
// ============================================================================

#[test]
fn test_generated_reads_pass_read_validation() {
    let validator = SqlValidator::new();
    let (schema, table) = users();
    let options = SelectOptions {
        order_by: Some(OrderBy::parse("created_at DESC").unwrap()),
        limit: Some(100),
        offset: Some(0),
        ..Default::default()
    };
    for stmt in [
        build_select(&schema, &table, &options).unwrap(),
        build_select_by_id(&schema, &table, &RecordId::Int(1)),
        build_count(&schema, &table, None),
    ] {
        assert!(validator.validate(stmt.sql(), OperationMode::Read).is_ok(), "{}", stmt.sql());
    }
}

#[test]
fn test_generated_writes_pass_write_validation() {
    let validator = SqlValidator::new();
    let (schema, table) = users();
    let data = row(json!({"name": "A", "updated_at": "2024-01-01T00:00:00Z"}));
    for stmt in [
        build_insert(&schema, &table, &data).unwrap(),
        build_update(&schema, &table, &RecordId::Int(1), &data).unwrap(),
        build_delete(&schema, &table, &RecordId::Int(1)),
    ] {
        assert!(validator.validate(stmt.sql(), OperationMode::Write).is_ok(), "{}", stmt.sql());
    }
}
