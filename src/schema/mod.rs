//! Schema registry.
//!
//! Field metadata for each entity kind is read from one JSON document per
//! kind (`partner.json`, `program.json`, `session.json`). The registry is
//! immutable once loaded; every query-time decision about types, operators,
//! facet options and discriminator applicability is answered from here.
//!
//! # Example Document
//!
//! ```json
//! {
//!   "entity": "program",
//!   "title_field": "name",
//!   "discriminator": {
//!     "field": "kind",
//!     "raw_name": "program_type",
//!     "values": { "Summer Camp": "camp", "After School": "after_school" }
//!   },
//!   "fields": [
//!     { "name": "name", "label": "Program", "type": "string", "searchable": true },
//!     { "name": "kind", "label": "Type", "type": "enum", "facetable": true,
//!       "options": [{ "value": "camp", "label": "Camp", "order": 1 }] },
//!     { "name": "capacity", "type": "number", "applies_to": ["camp"],
//!       "buckets": [{ "label": "Small", "max": 10 }, { "label": "Large", "min": 11 }] }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::EntityKind;

/// Errors raised while loading or validating schema documents.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to read schema file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse schema document {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Schema validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    #[serde(alias = "text")]
    String,
    Number,
    #[serde(alias = "boolean")]
    Bool,
    #[serde(alias = "datetime")]
    Date,
    Enum,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Date => "date",
            Self::Enum => "enum",
        };
        f.write_str(s)
    }
}

/// Filter operators. Request tokens are mapped onto this enum at the
/// request boundary; unknown tokens are rejected there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Between,
    Contains,
    In,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Between => "between",
            Self::Contains => "contains",
            Self::In => "in",
        }
    }

    /// Range-style operators that compare by order.
    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            Self::Gt | Self::Gte | Self::Lt | Self::Lte | Self::Between
        )
    }

    fn compatible_with(self, value_type: ValueType) -> bool {
        match self {
            Self::Contains => matches!(value_type, ValueType::String | ValueType::Enum),
            op if op.is_ordering() => matches!(value_type, ValueType::Number | ValueType::Date),
            _ => true,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eq" | "=" | "==" | "equals" => Ok(Self::Eq),
            "neq" | "ne" | "!=" | "not_equals" => Ok(Self::Neq),
            "gt" | ">" => Ok(Self::Gt),
            "gte" | ">=" => Ok(Self::Gte),
            "lt" | "<" => Ok(Self::Lt),
            "lte" | "<=" => Ok(Self::Lte),
            "between" | "range" => Ok(Self::Between),
            "contains" | "like" => Ok(Self::Contains),
            "in" | "any_of" => Ok(Self::In),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumOption {
    pub value: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
}

impl EnumOption {
    pub fn label(&self) -> &str {
        if self.label.is_empty() {
            &self.value
        } else {
            &self.label
        }
    }
}

/// Inclusive numeric range used to facet number fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericBucket {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl NumericBucket {
    pub fn contains(&self, value: f64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    /// Upstream property name when it differs from `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_name: Option<String>,
    /// Explicit operator list. Empty means type defaults.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operators: Vec<Operator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<EnumOption>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buckets: Vec<NumericBucket>,
    /// Discriminator values this field is relevant for. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applies_to: Vec<String>,
    #[serde(default)]
    pub multi_valued: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
    #[serde(default = "default_true")]
    pub filterable: bool,
    #[serde(default)]
    pub facetable: bool,
    #[serde(default)]
    pub searchable: bool,
    /// A missing value is an open bound and passes ordering comparisons.
    #[serde(default)]
    pub open_bound: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            label: String::new(),
            value_type,
            raw_name: None,
            operators: Vec::new(),
            options: Vec::new(),
            buckets: Vec::new(),
            applies_to: Vec::new(),
            multi_valued: false,
            delimiter: None,
            filterable: true,
            facetable: false,
            searchable: false,
            open_bound: false,
        }
    }

    pub fn raw_name(&self) -> &str {
        self.raw_name.as_deref().unwrap_or(&self.name)
    }

    pub fn label(&self) -> &str {
        if self.label.is_empty() {
            &self.name
        } else {
            &self.label
        }
    }

    pub fn delimiter(&self) -> &str {
        self.delimiter.as_deref().unwrap_or(";")
    }

    /// Configured operators, or the defaults for the field's type.
    pub fn allowed_operators(&self) -> Vec<Operator> {
        if !self.operators.is_empty() {
            return self.operators.clone();
        }
        default_operators(self.value_type, self.multi_valued)
    }

    pub fn allows(&self, op: Operator) -> bool {
        self.allowed_operators().contains(&op)
    }

    /// Whether the field is relevant for the given discriminator value. An
    /// unknown discriminator never excludes a field.
    pub fn applies_to_discriminator(&self, discriminator: Option<&str>) -> bool {
        match discriminator {
            None => true,
            Some(_) if self.applies_to.is_empty() => true,
            Some(d) => self.applies_to.iter().any(|a| a.eq_ignore_ascii_case(d)),
        }
    }

    pub fn option_label(&self, value: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.value == value)
            .map(EnumOption::label)
    }

    /// Options in declared display order. Unordered options keep their
    /// position after all ordered ones.
    pub fn sorted_options(&self) -> Vec<&EnumOption> {
        let mut options: Vec<_> = self.options.iter().collect();
        options.sort_by_key(|o| o.order.unwrap_or(i64::MAX));
        options
    }

    fn has_role(&self, role: FieldRole) -> bool {
        match role {
            FieldRole::Filter => self.filterable,
            FieldRole::Facet => self.facetable,
            FieldRole::Search => self.searchable,
            FieldRole::Any => true,
        }
    }
}

/// Type-based operator defaults when a field does not configure its own.
pub fn default_operators(value_type: ValueType, multi_valued: bool) -> Vec<Operator> {
    use Operator::*;
    match value_type {
        ValueType::String => vec![Eq, Contains],
        ValueType::Number | ValueType::Date => vec![Eq, Gte, Lte, Between],
        ValueType::Bool => vec![Eq],
        ValueType::Enum if multi_valued => vec![In, Eq],
        ValueType::Enum => vec![Eq, In],
    }
}

/// Selects which subset of fields `fields_for` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    Filter,
    Facet,
    Search,
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscriminatorSpec {
    /// Canonical field name on Program.
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_name: Option<String>,
    /// Upstream raw value → canonical discriminator.
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

impl DiscriminatorSpec {
    pub fn raw_name(&self) -> &str {
        self.raw_name.as_deref().unwrap_or(&self.field)
    }

    /// Maps a raw upstream value onto its canonical discriminator.
    pub fn canonicalize(&self, raw: &str) -> String {
        let raw = raw.trim();
        if let Some((_, canonical)) = self
            .values
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(raw))
        {
            return canonical.clone();
        }
        if let Some(canonical) = self.values.values().find(|v| v.eq_ignore_ascii_case(raw)) {
            return canonical.clone();
        }
        slug(raw)
    }

    pub fn canonical_values(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.values
            .values()
            .filter(|v| seen.insert(v.as_str()))
            .cloned()
            .collect()
    }
}

fn slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Schema document for one entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub entity: EntityKind,
    /// Field holding the display name (ranked with its own weight).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_field: Option<String>,
    /// Date field used for "earliest upcoming" ordering (sessions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<DiscriminatorSpec>,
    /// Extra raw properties to request upstream that no field maps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_properties: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

impl EntitySchema {
    pub fn new(entity: EntityKind) -> Self {
        Self {
            entity,
            title_field: None,
            start_field: None,
            discriminator: None,
            extra_properties: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let entity = self.entity;
        let mut names = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(SchemaError::Validation(format!(
                    "{entity}: field name cannot be empty"
                )));
            }
            if !names.insert(field.name.as_str()) {
                return Err(SchemaError::Validation(format!(
                    "{entity}: duplicate field '{}'",
                    field.name
                )));
            }
            if let Some(op) = field
                .operators
                .iter()
                .find(|op| !op.compatible_with(field.value_type))
            {
                return Err(SchemaError::Validation(format!(
                    "{entity}.{}: operator '{op}' is not valid for type {}",
                    field.name, field.value_type
                )));
            }
            if !field.options.is_empty() && field.value_type != ValueType::Enum {
                return Err(SchemaError::Validation(format!(
                    "{entity}.{}: options are only allowed on enum fields",
                    field.name
                )));
            }
            if !field.buckets.is_empty() && field.value_type != ValueType::Number {
                return Err(SchemaError::Validation(format!(
                    "{entity}.{}: buckets are only allowed on number fields",
                    field.name
                )));
            }
            if let Some(bucket) = field
                .buckets
                .iter()
                .find(|b| matches!((b.min, b.max), (Some(min), Some(max)) if min > max))
            {
                return Err(SchemaError::Validation(format!(
                    "{entity}.{}: bucket '{}' has min > max",
                    field.name, bucket.label
                )));
            }
        }

        if let Some(title) = &self.title_field
            && self.field(title).is_none()
        {
            return Err(SchemaError::Validation(format!(
                "{entity}: title_field '{title}' is not a declared field"
            )));
        }

        if let Some(start) = &self.start_field {
            match self.field(start) {
                Some(f) if f.value_type == ValueType::Date => {}
                Some(_) => {
                    return Err(SchemaError::Validation(format!(
                        "{entity}: start_field '{start}' must be a date field"
                    )));
                }
                None => {
                    return Err(SchemaError::Validation(format!(
                        "{entity}: start_field '{start}' is not a declared field"
                    )));
                }
            }
        }

        if let Some(disc) = &self.discriminator {
            if entity != EntityKind::Program {
                return Err(SchemaError::Validation(format!(
                    "{entity}: only programs may declare a discriminator"
                )));
            }
            if self.field(&disc.field).is_none() {
                return Err(SchemaError::Validation(format!(
                    "{entity}: discriminator field '{}' is not a declared field",
                    disc.field
                )));
            }
        }

        Ok(())
    }
}

/// Parsed, validated field metadata for all three entity kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaRegistry {
    partner: EntitySchema,
    program: EntitySchema,
    session: EntitySchema,
}

impl SchemaRegistry {
    /// Load `partner.json`, `program.json` and `session.json` from `dir`.
    ///
    /// Loading is a pure parse; calling it twice on the same directory yields
    /// equal registries.
    pub fn load_dir(dir: &Path) -> Result<Self, SchemaError> {
        let mut docs = Vec::with_capacity(3);
        for kind in EntityKind::ALL {
            let path = dir.join(format!("{}.json", kind.as_str()));
            let text = std::fs::read_to_string(&path).map_err(|source| SchemaError::Read {
                path: path.clone(),
                source,
            })?;
            docs.push(parse_document(&text, &path.display().to_string())?);
        }
        let registry = Self::from_documents(docs)?;
        tracing::debug!(dir = %dir.display(), "schema loaded");
        Ok(registry)
    }

    /// Build from already-parsed documents; exactly one per entity kind.
    pub fn from_documents(docs: Vec<EntitySchema>) -> Result<Self, SchemaError> {
        let mut partner = None;
        let mut program = None;
        let mut session = None;
        for doc in docs {
            doc.validate()?;
            let slot = match doc.entity {
                EntityKind::Partner => &mut partner,
                EntityKind::Program => &mut program,
                EntityKind::Session => &mut session,
            };
            if slot.is_some() {
                return Err(SchemaError::Validation(format!(
                    "duplicate schema document for {}",
                    doc.entity
                )));
            }
            *slot = Some(doc);
        }

        let missing = |kind: EntityKind| {
            SchemaError::Validation(format!("missing schema document for {kind}"))
        };
        Ok(Self {
            partner: partner.ok_or_else(|| missing(EntityKind::Partner))?,
            program: program.ok_or_else(|| missing(EntityKind::Program))?,
            session: session.ok_or_else(|| missing(EntityKind::Session))?,
        })
    }

    pub fn entity(&self, kind: EntityKind) -> &EntitySchema {
        match kind {
            EntityKind::Partner => &self.partner,
            EntityKind::Program => &self.program,
            EntityKind::Session => &self.session,
        }
    }

    pub fn field(&self, kind: EntityKind, name: &str) -> Option<&FieldDescriptor> {
        self.entity(kind).field(name)
    }

    pub fn fields_for(&self, kind: EntityKind, role: FieldRole) -> Vec<&FieldDescriptor> {
        self.entity(kind)
            .fields
            .iter()
            .filter(|f| f.has_role(role))
            .collect()
    }

    /// Allowed operators for a field, `None` if the field is unknown.
    pub fn operators_for(&self, kind: EntityKind, name: &str) -> Option<Vec<Operator>> {
        self.field(kind, name).map(FieldDescriptor::allowed_operators)
    }

    pub fn discriminator(&self) -> Option<&DiscriminatorSpec> {
        self.program.discriminator.as_ref()
    }

    pub fn title_field(&self, kind: EntityKind) -> Option<&str> {
        self.entity(kind).title_field.as_deref()
    }

    pub fn session_start_field(&self) -> Option<&str> {
        self.session.start_field.as_deref()
    }

    /// Raw property names to request from the upstream for `kind`.
    pub fn upstream_properties(&self, kind: EntityKind) -> Vec<String> {
        let schema = self.entity(kind);
        let mut seen = HashSet::new();
        schema
            .fields
            .iter()
            .map(|f| f.raw_name())
            .chain(schema.discriminator.iter().map(|d| d.raw_name()))
            .chain(schema.extra_properties.iter().map(String::as_str))
            .filter(|name| seen.insert(*name))
            .map(str::to_string)
            .collect()
    }

    /// Structured description for the presentation layer.
    pub fn describe(&self) -> SchemaDescription {
        let entities = EntityKind::ALL
            .iter()
            .map(|&kind| EntityDescription {
                entity: kind,
                title_field: self.title_field(kind).map(str::to_string),
                filters: self
                    .fields_for(kind, FieldRole::Filter)
                    .into_iter()
                    .map(FieldDescription::from)
                    .collect(),
                facets: self
                    .fields_for(kind, FieldRole::Facet)
                    .into_iter()
                    .map(FieldDescription::from)
                    .collect(),
            })
            .collect();

        let discriminator = self.discriminator().map(|d| DiscriminatorDescription {
            field: d.field.clone(),
            values: d.canonical_values(),
        });

        SchemaDescription {
            discriminator,
            entities,
        }
    }
}

/// Parse a single schema document.
pub fn parse_document(text: &str, origin: &str) -> Result<EntitySchema, SchemaError> {
    serde_json::from_str(text).map_err(|source| SchemaError::Parse {
        origin: origin.to_string(),
        source,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaDescription {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<DiscriminatorDescription>,
    pub entities: Vec<EntityDescription>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscriminatorDescription {
    pub field: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityDescription {
    pub entity: EntityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_field: Option<String>,
    pub filters: Vec<FieldDescription>,
    pub facets: Vec<FieldDescription>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldDescription {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub operators: Vec<Operator>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<EnumOption>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub buckets: Vec<NumericBucket>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub applies_to: Vec<String>,
    pub multi_valued: bool,
}

impl From<&FieldDescriptor> for FieldDescription {
    fn from(f: &FieldDescriptor) -> Self {
        Self {
            name: f.name.clone(),
            label: f.label().to_string(),
            value_type: f.value_type,
            operators: f.allowed_operators(),
            options: f
                .sorted_options()
                .into_iter()
                .map(|o| EnumOption {
                    value: o.value.clone(),
                    label: o.label().to_string(),
                    order: o.order,
                })
                .collect(),
            buckets: f.buckets.clone(),
            applies_to: f.applies_to.clone(),
            multi_valued: f.multi_valued,
        }
    }
}
