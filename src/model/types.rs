//! Core entity types shared by the cache, the upstream layer and search.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// The three levels of the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Partner,
    Program,
    Session,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Partner, EntityKind::Program, EntityKind::Session];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Partner => "partner",
            Self::Program => "program",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "partner" | "partners" => Ok(Self::Partner),
            "program" | "programs" => Ok(Self::Program),
            "session" | "sessions" => Ok(Self::Session),
            other => Err(format!("unknown entity kind '{other}'")),
        }
    }
}

/// A typed property value. Which variant a field holds is decided by its
/// schema descriptor at normalization time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    Date(DateTime<Utc>),
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Calendar date, ignoring time of day.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(dt) => Some(dt.date_naive()),
            _ => None,
        }
    }

    /// Individual display values. Lists yield one entry per element.
    pub fn values(&self) -> Vec<String> {
        match self {
            Self::List(items) => items.clone(),
            other => vec![other.display()],
        }
    }

    pub fn display(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::Date(dt) => dt.date_naive().format("%Y-%m-%d").to_string(),
            Self::Text(s) => s.clone(),
            Self::List(items) => items.join(", "),
        }
    }
}

/// Integral numbers print without a trailing ".0".
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Canonical field name → typed value. Only fields declared in the schema
/// for the owning entity kind are ever inserted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PropertyBag(BTreeMap<String, FieldValue>);

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: FieldValue) {
        self.0.insert(field.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_text)
    }
}

impl FromIterator<(String, FieldValue)> for PropertyBag {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A normalized Partner, Program or Session record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub id: String,
    pub kind: EntityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
    pub properties: PropertyBag,
}

impl Entity {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            discriminator: None,
            properties: PropertyBag::new(),
        }
    }

    pub fn with(mut self, field: &str, value: FieldValue) -> Self {
        self.properties.insert(field, value);
        self
    }

    pub fn with_discriminator(mut self, value: impl Into<String>) -> Self {
        self.discriminator = Some(value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.properties.get(field)
    }
}
