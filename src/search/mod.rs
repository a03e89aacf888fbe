//! Search layer facade.
//!
//! - **[`filter`]**: filter tree compilation and per-level evaluation.
//! - **[`query`]**: request/response types and the search pipeline
//!   (prune → rank → facet → paginate).
//! - **[`facets`]**: facet counts over the filtered result set.
//! - **[`rank`]**: fuzzy text scoring and default ordering.

pub mod facets;
pub mod filter;
pub mod query;
pub mod rank;

use thiserror::Error;

use crate::model::EntityKind;
use crate::schema::Operator;

pub use filter::{FilterExpr, FilterGroupSpec, FilterSpec, GroupOp};
pub use query::{SearchEngine, SearchRequest, SearchResponse, SearchSettings};

/// A malformed request. Raised before the cache is consulted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("unknown {entity} field '{field}'")]
    UnknownField { entity: EntityKind, field: String },

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("operator '{op}' is not allowed on {entity}.{field}")]
    OperatorNotAllowed {
        entity: EntityKind,
        field: String,
        op: Operator,
    },

    #[error("invalid value for {entity}.{field}: {reason}")]
    InvalidValue {
        entity: EntityKind,
        field: String,
        reason: String,
    },

    #[error("invalid pagination: {0}")]
    InvalidPage(String),
}

#[derive(Error, Debug)]
pub enum SearchError {
    /// The cache has no data yet; retry shortly.
    #[error("search index not ready: {0}")]
    NotReady(String),

    #[error(transparent)]
    Request(#[from] RequestError),
}

impl SearchError {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady(_))
    }
}
