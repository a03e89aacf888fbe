//! Filter trees.
//!
//! Requests carry a loosely typed [`FilterGroupSpec`]. [`FilterExpr::compile`]
//! checks it against the schema (field exists, operator allowed, value has
//! the right shape) and produces a typed tree that evaluates without any
//! further string dispatch.
//!
//! Evaluation is per hierarchy level: a tree is asked "does this Program
//! pass?", "does this Session pass?", and so on. Leaves aimed at other
//! levels abstain, so an `or` group mixing kinds only combines the leaves
//! that concern the level being checked.

use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RequestError;
use crate::model::dates::{from_epoch, parse_date_input};
use crate::model::{Entity, EntityKind, FieldValue};
use crate::schema::{FieldDescriptor, Operator, SchemaRegistry, ValueType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupOp {
    #[default]
    #[serde(alias = "AND", alias = "all")]
    And,
    #[serde(alias = "OR", alias = "any")]
    Or,
}

/// Wire form of a filter group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterGroupSpec {
    #[serde(default, alias = "logic", alias = "operator")]
    pub op: GroupOp,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub groups: Vec<FilterGroupSpec>,
}

fn default_entity() -> EntityKind {
    EntityKind::Program
}

/// Wire form of one predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default = "default_entity", alias = "entityKind")]
    pub entity: EntityKind,
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

impl FilterSpec {
    pub fn new(entity: EntityKind, field: &str, operator: &str, value: Value) -> Self {
        Self {
            entity,
            field: field.to_string(),
            operator: operator.to_string(),
            value,
        }
    }
}

/// Typed comparison operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Text(String),
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
}

impl Scalar {
    pub fn display(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Number(n) => crate::model::types::format_number(*n),
            Self::Bool(b) => b.to_string(),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }

    fn equals(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (Self::Text(a), FieldValue::Text(b)) => a.eq_ignore_ascii_case(b),
            (Self::Text(a), FieldValue::List(items)) => {
                items.iter().any(|i| i.eq_ignore_ascii_case(a))
            }
            (Self::Number(a), FieldValue::Number(b)) => a == b,
            (Self::Bool(a), FieldValue::Bool(b)) => a == b,
            (Self::Date(a), FieldValue::Date(_)) => value.as_date() == Some(*a),
            (Self::Text(a), other) => other.display().eq_ignore_ascii_case(a),
            _ => false,
        }
    }

    /// `value` compared to `self`.
    fn compare(&self, value: &FieldValue) -> Option<Ordering> {
        match (self, value) {
            (Self::Number(a), FieldValue::Number(b)) => b.partial_cmp(a),
            (Self::Date(a), FieldValue::Date(_)) => value.as_date().map(|d| d.cmp(a)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Explicit `null`; only valid with `eq`/`neq`.
    Null,
    One(Scalar),
    Range(Option<Scalar>, Option<Scalar>),
    Set(Vec<Scalar>),
}

/// One compiled leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub entity: EntityKind,
    pub field: FieldDescriptor,
    pub op: Operator,
    pub operand: Operand,
    /// The value exactly as the request sent it.
    pub raw: Value,
}

impl Predicate {
    /// Whether the value (or its absence) satisfies this predicate.
    pub fn matches(&self, value: Option<&FieldValue>) -> bool {
        let Some(value) = value else {
            return match self.operand {
                Operand::Null => self.op == Operator::Eq,
                _ => {
                    self.op.is_ordering()
                        && (self.field.open_bound || self.field.value_type == ValueType::Date)
                }
            };
        };

        match (&self.operand, self.op) {
            (Operand::Null, op) => op == Operator::Neq,
            (Operand::One(s), Operator::Eq) => s.equals(value),
            (Operand::One(s), Operator::Neq) => !s.equals(value),
            (Operand::One(s), Operator::Gt) => s.compare(value) == Some(Ordering::Greater),
            (Operand::One(s), Operator::Gte) => {
                matches!(s.compare(value), Some(Ordering::Greater | Ordering::Equal))
            }
            (Operand::One(s), Operator::Lt) => s.compare(value) == Some(Ordering::Less),
            (Operand::One(s), Operator::Lte) => {
                matches!(s.compare(value), Some(Ordering::Less | Ordering::Equal))
            }
            (Operand::One(Scalar::Text(needle)), Operator::Contains) => value
                .values()
                .iter()
                .any(|v| v.to_lowercase().contains(needle.as_str())),
            (Operand::Range(lo, hi), Operator::Between) => {
                let above = lo.as_ref().is_none_or(|lo| {
                    matches!(lo.compare(value), Some(Ordering::Greater | Ordering::Equal))
                });
                let below = hi.as_ref().is_none_or(|hi| {
                    matches!(hi.compare(value), Some(Ordering::Less | Ordering::Equal))
                });
                above && below
            }
            (Operand::Set(items), Operator::In) => items.iter().any(|s| s.equals(value)),
            _ => false,
        }
    }

    /// Values an `eq`/`in` leaf selects, for facet "selected" flags.
    pub fn selected_values(&self) -> Vec<String> {
        match (&self.operand, self.op) {
            (Operand::One(s), Operator::Eq) => vec![s.display()],
            (Operand::Set(items), Operator::In) => items.iter().map(Scalar::display).collect(),
            _ => Vec::new(),
        }
    }

    fn compile(schema: &SchemaRegistry, spec: &FilterSpec) -> Result<Self, RequestError> {
        let field = schema
            .field(spec.entity, &spec.field)
            .filter(|f| f.filterable)
            .ok_or_else(|| RequestError::UnknownField {
                entity: spec.entity,
                field: spec.field.clone(),
            })?;
        let op: Operator = spec
            .operator
            .parse()
            .map_err(RequestError::UnknownOperator)?;
        if !field.allows(op) {
            return Err(RequestError::OperatorNotAllowed {
                entity: spec.entity,
                field: field.name.clone(),
                op,
            });
        }

        let invalid = |reason: String| RequestError::InvalidValue {
            entity: spec.entity,
            field: field.name.clone(),
            reason,
        };

        let operand = match op {
            Operator::Eq | Operator::Neq if spec.value.is_null() => Operand::Null,
            Operator::Contains => {
                let needle = text_of(&spec.value)
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| invalid("expected non-empty text".into()))?;
                Operand::One(Scalar::Text(needle))
            }
            Operator::Between => {
                let (lo, hi) = range_bounds(&spec.value)
                    .ok_or_else(|| invalid("expected [min, max] or {\"min\", \"max\"}".into()))?;
                let lo = bound(field, lo).map_err(invalid)?;
                let hi = bound(field, hi).map_err(invalid)?;
                if lo.is_none() && hi.is_none() {
                    return Err(invalid("at least one bound is required".into()));
                }
                Operand::Range(lo, hi)
            }
            Operator::In => {
                let items: Vec<&Value> = match &spec.value {
                    Value::Array(items) => items.iter().collect(),
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                let set = items
                    .into_iter()
                    .map(|v| scalar(field, v))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(invalid)?;
                if set.is_empty() {
                    return Err(invalid("expected at least one value".into()));
                }
                Operand::Set(set)
            }
            _ => Operand::One(scalar(field, &spec.value).map_err(invalid)?),
        };

        Ok(Self {
            entity: spec.entity,
            field: field.clone(),
            op,
            operand,
            raw: spec.value.clone(),
        })
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn scalar(field: &FieldDescriptor, value: &Value) -> Result<Scalar, String> {
    let parsed = match field.value_type {
        ValueType::String | ValueType::Enum => text_of(value).map(Scalar::Text),
        ValueType::Number => match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|f| f.is_finite())
        .map(Scalar::Number),
        ValueType::Bool => match value {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
        .map(Scalar::Bool),
        ValueType::Date => match value {
            Value::String(s) => parse_date_input(s),
            Value::Number(n) => n.as_i64().and_then(from_epoch),
            _ => None,
        }
        .map(|dt| Scalar::Date(dt.date_naive())),
    };
    parsed.ok_or_else(|| format!("expected a {} value, got {value}", field.value_type))
}

fn bound(field: &FieldDescriptor, value: &Value) -> Result<Option<Scalar>, String> {
    if value.is_null() {
        return Ok(None);
    }
    scalar(field, value).map(Some)
}

fn range_bounds(value: &Value) -> Option<(&Value, &Value)> {
    static NULL: Value = Value::Null;
    match value {
        Value::Array(items) if items.len() == 2 => Some((&items[0], &items[1])),
        Value::Object(map) => {
            let lo = map.get("min").or_else(|| map.get("from")).unwrap_or(&NULL);
            let hi = map.get("max").or_else(|| map.get("to")).unwrap_or(&NULL);
            Some((lo, hi))
        }
        _ => None,
    }
}

/// Compiled filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Leaf(Predicate),
    All(Vec<FilterExpr>),
    Any(Vec<FilterExpr>),
}

impl Default for FilterExpr {
    fn default() -> Self {
        Self::All(Vec::new())
    }
}

impl FilterExpr {
    pub fn compile(schema: &SchemaRegistry, spec: &FilterGroupSpec) -> Result<Self, RequestError> {
        let mut children = Vec::with_capacity(spec.filters.len() + spec.groups.len());
        for leaf in &spec.filters {
            children.push(Self::Leaf(Predicate::compile(schema, leaf)?));
        }
        for group in &spec.groups {
            children.push(Self::compile(schema, group)?);
        }
        Ok(match spec.op {
            GroupOp::And => Self::All(children),
            GroupOp::Or => Self::Any(children),
        })
    }

    /// Does `entity` (of `kind`) pass? `None` entity means the record is
    /// absent; leaves then apply their missing-value rules. Fields that do
    /// not apply to `discriminator` pass.
    pub fn evaluate(
        &self,
        kind: EntityKind,
        entity: Option<&Entity>,
        discriminator: Option<&str>,
    ) -> bool {
        self.eval(kind, entity, discriminator).unwrap_or(true)
    }

    /// `None` when no leaf concerns `kind`.
    fn eval(
        &self,
        kind: EntityKind,
        entity: Option<&Entity>,
        discriminator: Option<&str>,
    ) -> Option<bool> {
        match self {
            Self::Leaf(p) if p.entity != kind => None,
            Self::Leaf(p) if !p.field.applies_to_discriminator(discriminator) => Some(true),
            Self::Leaf(p) => Some(p.matches(entity.and_then(|e| e.get(&p.field.name)))),
            Self::All(children) => {
                let mut seen = false;
                for child in children {
                    match child.eval(kind, entity, discriminator) {
                        Some(false) => return Some(false),
                        Some(true) => seen = true,
                        None => {}
                    }
                }
                seen.then_some(true)
            }
            Self::Any(children) => {
                let mut seen = false;
                for child in children {
                    match child.eval(kind, entity, discriminator) {
                        Some(true) => return Some(true),
                        Some(false) => seen = true,
                        None => {}
                    }
                }
                seen.then_some(false)
            }
        }
    }

    /// Whether any leaf targets `kind`.
    pub fn targets(&self, kind: EntityKind) -> bool {
        self.leaves().iter().any(|p| p.entity == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.leaves().is_empty()
    }

    pub fn leaves(&self) -> Vec<&Predicate> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Predicate>) {
        match self {
            Self::Leaf(p) => out.push(p),
            Self::All(children) | Self::Any(children) => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
        }
    }
}
