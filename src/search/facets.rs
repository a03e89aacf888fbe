//! Facet counts over a filtered result set.
//!
//! A value's count is the number of results in which it occurs: a program
//! or partner value counts once per result, a session value counts once
//! per result however many of its matching sessions carry it.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::model::{Entity, EntityKind, FieldValue};
use crate::schema::{FieldDescriptor, FieldRole, SchemaRegistry, ValueType};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetValue {
    pub value: String,
    pub label: String,
    pub count: usize,
    pub selected: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FacetResult {
    pub entity: EntityKind,
    pub field: String,
    pub label: String,
    pub values: Vec<FacetValue>,
}

/// The entities contributing to one result.
#[derive(Debug, Clone, Copy)]
pub struct FacetRow<'a> {
    pub program: &'a Entity,
    pub partner: Option<&'a Entity>,
    pub sessions: &'a [&'a Entity],
}

/// Values the request currently selects, keyed by `(entity, field)`.
pub type Selections = HashMap<(EntityKind, String), Vec<String>>;

pub fn compute_facets(
    schema: &SchemaRegistry,
    rows: &[FacetRow<'_>],
    selections: &Selections,
    discriminator: Option<&str>,
) -> Vec<FacetResult> {
    let mut facets = Vec::new();
    for kind in EntityKind::ALL {
        for field in schema.fields_for(kind, FieldRole::Facet) {
            if discriminator.is_some() && !field.applies_to_discriminator(discriminator) {
                continue;
            }
            let selected = selections
                .get(&(kind, field.name.clone()))
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            facets.push(FacetResult {
                entity: kind,
                field: field.name.clone(),
                label: field.label().to_string(),
                values: facet_values(field, kind, rows, selected),
            });
        }
    }
    facets
}

fn facet_values(
    field: &FieldDescriptor,
    kind: EntityKind,
    rows: &[FacetRow<'_>],
    selected: &[String],
) -> Vec<FacetValue> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let entities: Vec<&Entity> = match kind {
            EntityKind::Program => vec![row.program],
            EntityKind::Partner => row.partner.into_iter().collect(),
            EntityKind::Session => row.sessions.to_vec(),
        };
        let keys: BTreeSet<String> = entities
            .iter()
            .filter_map(|e| e.get(&field.name))
            .flat_map(|v| facet_keys(field, v))
            .collect();
        for key in keys {
            *counts.entry(key).or_default() += 1;
        }
    }

    let is_selected = |value: &str| selected.iter().any(|s| s.eq_ignore_ascii_case(value));
    let mut values = Vec::new();

    // Declared order first: enum options or numeric buckets.
    let declared: Vec<(String, String)> = if !field.options.is_empty() {
        field
            .sorted_options()
            .into_iter()
            .map(|o| (o.value.clone(), o.label().to_string()))
            .collect()
    } else {
        field
            .buckets
            .iter()
            .map(|b| (b.label.clone(), b.label.clone()))
            .collect()
    };
    for (value, label) in &declared {
        let count = counts.remove(value).unwrap_or(0);
        let selected = is_selected(value);
        if count > 0 || selected {
            values.push(FacetValue {
                value: value.clone(),
                label: label.clone(),
                count,
                selected,
            });
        }
    }

    // Then anything discovered dynamically.
    let mut dynamic: Vec<(String, usize)> = counts.into_iter().collect();
    dynamic.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    for (value, count) in dynamic {
        values.push(FacetValue {
            label: field.option_label(&value).unwrap_or(&value).to_string(),
            selected: is_selected(&value),
            value,
            count,
        });
    }

    for value in selected {
        if !values.iter().any(|v| v.value.eq_ignore_ascii_case(value)) {
            values.push(FacetValue {
                value: value.clone(),
                label: field.option_label(value).unwrap_or(value).to_string(),
                count: 0,
                selected: true,
            });
        }
    }

    values
}

/// Facet keys contributed by one value. Numbers with buckets map to bucket
/// labels; lists contribute each element.
fn facet_keys(field: &FieldDescriptor, value: &FieldValue) -> Vec<String> {
    match value {
        FieldValue::Number(n) if field.value_type == ValueType::Number && !field.buckets.is_empty() => {
            field
                .buckets
                .iter()
                .filter(|b| b.contains(*n))
                .map(|b| b.label.clone())
                .collect()
        }
        other => other.values(),
    }
}
