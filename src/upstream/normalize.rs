//! Raw upstream records → schema-typed [`Entity`] values.
//!
//! Only properties declared in the entity's schema survive. Values that do
//! not coerce to the declared type are dropped (treated as missing) rather
//! than failing the record.

use std::collections::HashMap;

use serde_json::Value;

use super::RawRecord;
use crate::model::dates::{from_epoch, parse_date_input};
use crate::model::{Entity, FieldValue};
use crate::schema::{EntitySchema, FieldDescriptor, ValueType};

pub fn normalize_record(schema: &EntitySchema, raw: &RawRecord) -> Entity {
    let mut entity = Entity::new(schema.entity, raw.id.clone());

    for field in &schema.fields {
        let Some(value) = raw.properties.get(field.raw_name()) else {
            continue;
        };
        match coerce(field, value) {
            Some(typed) => entity.properties.insert(field.name.clone(), typed),
            None if !is_blank(value) => {
                tracing::debug!(
                    entity = %schema.entity,
                    id = %raw.id,
                    field = %field.name,
                    "dropping value that does not match declared type"
                );
            }
            None => {}
        }
    }

    if let Some(disc) = &schema.discriminator
        && let Some(raw_value) = raw.properties.get(disc.raw_name()).and_then(scalar_text)
    {
        let canonical = disc.canonicalize(&raw_value);
        if !canonical.is_empty() {
            entity
                .properties
                .insert(disc.field.clone(), FieldValue::Text(canonical.clone()));
            entity.discriminator = Some(canonical);
        }
    }

    entity
}

/// Normalize a batch keyed by id. On duplicate ids the first record wins.
pub fn normalize_all(schema: &EntitySchema, records: &[RawRecord]) -> HashMap<String, Entity> {
    let mut out = HashMap::with_capacity(records.len());
    for raw in records {
        if out.contains_key(&raw.id) {
            tracing::debug!(entity = %schema.entity, id = %raw.id, "duplicate record ignored");
            continue;
        }
        out.insert(raw.id.clone(), normalize_record(schema, raw));
    }
    out
}

fn coerce(field: &FieldDescriptor, value: &Value) -> Option<FieldValue> {
    match field.value_type {
        ValueType::String | ValueType::Enum if field.multi_valued => {
            let items = list_items(value, field.delimiter());
            (!items.is_empty()).then_some(FieldValue::List(items))
        }
        ValueType::String | ValueType::Enum => scalar_text(value)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(FieldValue::Text),
        ValueType::Number => match value {
            Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
            Value::String(s) => parse_number(s),
            _ => None,
        }
        .map(FieldValue::Number),
        ValueType::Bool => match value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            Value::String(s) => parse_bool(s),
            _ => None,
        }
        .map(FieldValue::Bool),
        ValueType::Date => match value {
            Value::Number(n) => n.as_i64().and_then(from_epoch),
            Value::String(s) => parse_date_input(s),
            _ => None,
        }
        .map(FieldValue::Date),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn list_items(value: &Value, delimiter: &str) -> Vec<String> {
    let raw: Vec<String> = match value {
        Value::Array(items) => items.iter().filter_map(scalar_text).collect(),
        Value::String(s) => s.split(delimiter).map(str::to_string).collect(),
        other => scalar_text(other).into_iter().collect(),
    };
    let mut items: Vec<String> = Vec::with_capacity(raw.len());
    for item in raw {
        let item = item.trim();
        if !item.is_empty() && !items.iter().any(|i| i == item) {
            items.push(item.to_string());
        }
    }
    items
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Lenient numeric parse: tolerates currency symbols and thousands
/// separators.
fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches(['$', '€', '£'])
        .chars()
        .filter(|c| !matches!(c, ',' | '_' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "on" => Some(true),
        "false" | "no" | "n" | "0" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;
    use crate::schema::{DiscriminatorSpec, FieldDescriptor};
    use chrono::NaiveDate;
    use serde_json::json;

    fn program_schema() -> EntitySchema {
        let mut schema = EntitySchema::new(EntityKind::Program);
        let mut name = FieldDescriptor::new("name", ValueType::String);
        name.raw_name = Some("program_name".into());
        let kind = FieldDescriptor::new("kind", ValueType::Enum);
        let mut topics = FieldDescriptor::new("topics", ValueType::Enum);
        topics.multi_valued = true;
        let fee = FieldDescriptor::new("fee", ValueType::Number);
        let starts = FieldDescriptor::new("starts", ValueType::Date);
        let featured = FieldDescriptor::new("featured", ValueType::Bool);
        schema.fields = vec![name, kind, topics, fee, starts, featured];
        schema.discriminator = Some(DiscriminatorSpec {
            field: "kind".into(),
            raw_name: Some("program_type".into()),
            values: [("Summer Camp".to_string(), "camp".to_string())]
                .into_iter()
                .collect(),
        });
        schema
    }

    fn raw(properties: Value) -> RawRecord {
        serde_json::from_value(json!({ "id": "p1", "properties": properties })).unwrap()
    }

    #[test]
    fn maps_raw_names_and_types() {
        let entity = normalize_record(
            &program_schema(),
            &raw(json!({
                "program_name": "  Robotics ",
                "topics": "stem; art ;stem;",
                "fee": "$1,250.50",
                "starts": "2025-06-10",
                "featured": "yes",
                "undeclared": "ignored"
            })),
        );
        assert_eq!(entity.properties.text("name"), Some("Robotics"));
        assert_eq!(
            entity.get("topics"),
            Some(&FieldValue::List(vec!["stem".into(), "art".into()]))
        );
        assert_eq!(entity.get("fee"), Some(&FieldValue::Number(1250.5)));
        assert_eq!(
            entity.get("starts").and_then(FieldValue::as_date),
            NaiveDate::from_ymd_opt(2025, 6, 10)
        );
        assert_eq!(entity.get("featured"), Some(&FieldValue::Bool(true)));
        assert!(entity.get("undeclared").is_none());
    }

    #[test]
    fn discriminator_is_canonicalized() {
        let entity = normalize_record(
            &program_schema(),
            &raw(json!({ "program_type": "summer camp" })),
        );
        assert_eq!(entity.discriminator.as_deref(), Some("camp"));
        assert_eq!(entity.properties.text("kind"), Some("camp"));
    }

    #[test]
    fn uncoercible_values_are_dropped() {
        let entity = normalize_record(
            &program_schema(),
            &raw(json!({ "fee": "call us", "starts": "soon-ish", "featured": "maybe", "program_name": null })),
        );
        assert!(entity.properties.is_empty());
        assert!(entity.discriminator.is_none());
    }

    #[test]
    fn epoch_millis_dates() {
        let entity = normalize_record(
            &program_schema(),
            &raw(json!({ "starts": 1_749_513_600_000i64 })),
        );
        assert_eq!(
            entity.get("starts").and_then(FieldValue::as_date),
            NaiveDate::from_ymd_opt(2025, 6, 10)
        );
    }

    #[test]
    fn duplicate_ids_keep_first() {
        let records = vec![
            serde_json::from_value(json!({ "id": "1", "properties": { "program_name": "First" } }))
                .unwrap(),
            serde_json::from_value(json!({ "id": "1", "properties": { "program_name": "Second" } }))
                .unwrap(),
        ];
        let all = normalize_all(&program_schema(), &records);
        assert_eq!(all.len(), 1);
        assert_eq!(all["1"].properties.text("name"), Some("First"));
    }

    #[test]
    fn number_parsing() {
        assert_eq!(parse_number("1_000"), Some(1000.0));
        assert_eq!(parse_number("-3.5"), Some(-3.5));
        assert_eq!(parse_number("NaN"), None);
        assert_eq!(parse_number(""), None);
    }
}
