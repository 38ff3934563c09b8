use docform_model::{FieldDefinition, FieldId, FieldType, Schema, SchemaError, Value};
use pretty_assertions::assert_eq;

fn sample_schema() -> Schema {
    Schema::from_fields([
        FieldDefinition::new("price", FieldType::Number).required(true),
        FieldDefinition::new("qty", FieldType::Number),
        FieldDefinition::new("total", FieldType::Number).with_formula("{{price}} * {{qty}}"),
        FieldDefinition::new("kind", FieldType::Choice).with_options(["a", "b"]),
    ])
    .unwrap()
}

#[test]
fn schema_preserves_registration_order() {
    let schema = sample_schema();
    let ids: Vec<&str> = schema.ids().map(FieldId::as_str).collect();
    assert_eq!(ids, vec!["price", "qty", "total", "kind"]);
    assert!(schema.field("total").unwrap().is_formula());
    assert!(!schema.contains("missing"));
}

#[test]
fn duplicate_and_empty_ids_are_rejected() {
    let mut schema = sample_schema();
    let err = schema
        .add_field(FieldDefinition::new("qty", FieldType::Text))
        .unwrap_err();
    assert_eq!(err, SchemaError::DuplicateField(FieldId::from("qty")));

    let err = schema
        .add_field(FieldDefinition::new("  ", FieldType::Text))
        .unwrap_err();
    assert_eq!(err, SchemaError::EmptyFieldId);
}

#[test]
fn schema_json_is_a_plain_field_list() {
    let schema = sample_schema();
    let json = serde_json::to_value(&schema).unwrap();
    assert!(json.is_array());
    assert_eq!(json[2]["formula"], "{{price}} * {{qty}}");
    assert_eq!(json[0]["required"], true);
    assert!(json[1].get("required").is_none());

    let back: Schema = serde_json::from_value(json).unwrap();
    assert_eq!(back, schema);
}

#[test]
fn schema_json_with_duplicates_fails_to_deserialize() {
    let json = r#"[
        {"id": "a", "field_type": "text"},
        {"id": "a", "field_type": "number"}
    ]"#;
    let err = serde_json::from_str::<Schema>(json).unwrap_err();
    assert!(err.to_string().contains("duplicate field: a"), "{err}");
}

#[test]
fn values_use_a_tagged_json_layout() {
    let json = serde_json::to_string(&Value::Number(1.5)).unwrap();
    assert_eq!(json, r#"{"type":"number","value":1.5}"#);
    let json = serde_json::to_string(&Value::Null).unwrap();
    assert_eq!(json, r#"{"type":"null"}"#);
}
