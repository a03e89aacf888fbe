//! Search requests, responses and the pipeline between them.
//!
//! A request is compiled against the schema first, so malformed input is
//! rejected before the cache is touched. Execution then walks programs in
//! id order:
//!
//! 1. discriminator restriction and program predicates;
//! 2. session predicates (matching vs total sessions);
//! 3. partner predicates, which also drop programs without a partner;
//! 4. childless programs are dropped unless `include_childless`.
//!
//! Survivors are ranked (or ordered by next upcoming session), faceted and
//! paginated.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::facets::{FacetResult, FacetRow, Selections, compute_facets};
use super::filter::{FilterExpr, FilterGroupSpec};
use super::rank::{self, RankWeights, SearchDocument, TextRole};
use super::{RequestError, SearchError};
use crate::cache::{CacheStore, Snapshot};
use crate::model::{Entity, EntityKind, FieldValue};
use crate::schema::{FieldRole, Operator, SchemaRegistry};
use crate::upstream::Credentials;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub default_page_size: usize,
    pub max_page_size: usize,
    /// Minimum similarity for a free-text hit.
    pub fuzzy_threshold: f64,
    pub weights: RankWeights,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
            fuzzy_threshold: 0.8,
            weights: RankWeights::default(),
        }
    }
}

/// Inbound search request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchRequest {
    #[serde(alias = "freeTextQuery", skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(alias = "filterGroup", skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterGroupSpec>,
    /// Restrict to programs with this discriminator value.
    #[serde(alias = "discriminatorValue", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    #[serde(alias = "includeChildlessResults")]
    pub include_childless: bool,
}

impl SearchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_filters(mut self, filters: FilterGroupSpec) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_page(mut self, page: usize, page_size: usize) -> Self {
        self.page = Some(page);
        self.page_size = Some(page_size);
        self
    }

    pub fn including_childless(mut self) -> Self {
        self.include_childless = true;
        self
    }
}

/// One leaf of the request echoed back with its label.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedFilter {
    pub entity: EntityKind,
    pub field: String,
    pub label: String,
    pub operator: Operator,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub program: Entity,
    pub partner: Option<Entity>,
    /// Matching sessions only.
    pub sessions: Vec<Entity>,
    pub matching_session_count: usize,
    pub total_session_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub next_start: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub total_count: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub facets: Vec<FacetResult>,
    pub applied_filters: Vec<AppliedFilter>,
    pub search_duration_ms: u64,
}

/// A request checked against the schema.
#[derive(Debug, Clone)]
pub struct CompiledRequest {
    pub query: Option<String>,
    pub filter: FilterExpr,
    pub discriminator: Option<String>,
    pub page: usize,
    pub page_size: usize,
    pub include_childless: bool,
    pub applied: Vec<AppliedFilter>,
    pub selections: Selections,
}

struct Candidate<'a> {
    program: &'a Entity,
    partner: Option<&'a Entity>,
    sessions: Vec<&'a Entity>,
    total_sessions: usize,
    score: Option<f64>,
    next_start: Option<NaiveDate>,
}

impl Candidate<'_> {
    fn into_hit(self) -> SearchHit {
        SearchHit {
            program: self.program.clone(),
            partner: self.partner.cloned(),
            matching_session_count: self.sessions.len(),
            total_session_count: self.total_sessions,
            sessions: self.sessions.into_iter().cloned().collect(),
            score: self.score,
            next_start: self.next_start,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchEngine {
    schema: Arc<SchemaRegistry>,
    settings: SearchSettings,
}

impl SearchEngine {
    pub fn new(schema: Arc<SchemaRegistry>, settings: SearchSettings) -> Self {
        Self { schema, settings }
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    /// Full flow: validate, make sure the cache is usable, search it.
    pub async fn search(
        &self,
        cache: &CacheStore,
        creds: &Credentials,
        request: &SearchRequest,
    ) -> Result<SearchResponse, SearchError> {
        let compiled = self.compile(request)?;
        let readiness = cache
            .ensure_ready(creds, cache.settings().ready_timeout())
            .await;
        if !readiness.ready {
            return Err(SearchError::NotReady(
                readiness
                    .message
                    .unwrap_or_else(|| "cache is not ready".to_string()),
            ));
        }
        let snapshot = cache.snapshot();
        Ok(self.execute(&snapshot, &compiled, Utc::now().date_naive()))
    }

    /// Search a given snapshot directly.
    pub fn search_snapshot(
        &self,
        snapshot: &Snapshot,
        request: &SearchRequest,
        today: NaiveDate,
    ) -> Result<SearchResponse, RequestError> {
        let compiled = self.compile(request)?;
        Ok(self.execute(snapshot, &compiled, today))
    }

    pub fn compile(&self, request: &SearchRequest) -> Result<CompiledRequest, RequestError> {
        let page = request.page.unwrap_or(1);
        if page == 0 {
            return Err(RequestError::InvalidPage("page must be at least 1".into()));
        }
        let page_size = request
            .page_size
            .unwrap_or(self.settings.default_page_size);
        if page_size == 0 || page_size > self.settings.max_page_size {
            return Err(RequestError::InvalidPage(format!(
                "page size must be between 1 and {}",
                self.settings.max_page_size
            )));
        }

        let filter = match &request.filters {
            Some(spec) => FilterExpr::compile(&self.schema, spec)?,
            None => FilterExpr::default(),
        };

        let discriminator = match request.kind.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                let spec = self.schema.discriminator().ok_or_else(|| {
                    RequestError::InvalidValue {
                        entity: EntityKind::Program,
                        field: "kind".into(),
                        reason: "programs have no discriminator".into(),
                    }
                })?;
                Some(spec.canonicalize(raw))
            }
        };

        let mut applied = Vec::new();
        let mut selections = Selections::new();
        for leaf in filter.leaves() {
            let selected = leaf.selected_values();
            if !selected.is_empty() {
                selections
                    .entry((leaf.entity, leaf.field.name.clone()))
                    .or_default()
                    .extend(selected);
            }
            applied.push(AppliedFilter {
                entity: leaf.entity,
                field: leaf.field.name.clone(),
                label: leaf.field.label().to_string(),
                operator: leaf.op,
                value: leaf.raw.clone(),
            });
        }

        Ok(CompiledRequest {
            query: request
                .query
                .as_deref()
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string),
            filter,
            discriminator,
            page,
            page_size,
            include_childless: request.include_childless,
            applied,
            selections,
        })
    }

    /// Run a compiled request. `today` anchors "upcoming" session ordering.
    pub fn execute(
        &self,
        snapshot: &Snapshot,
        request: &CompiledRequest,
        today: NaiveDate,
    ) -> SearchResponse {
        let started = Instant::now();
        let mut candidates = self.collect(snapshot, request, today);

        match &request.query {
            Some(query) => {
                let weights = self.settings.weights;
                let threshold = self.settings.fuzzy_threshold;
                candidates.retain_mut(|c| {
                    c.score = rank::score(query, &self.document(c), &weights, threshold);
                    c.score.is_some()
                });
                candidates.sort_by(|a, b| {
                    rank::compare_scores(a.score, b.score).then_with(|| self.tie_break(a, b))
                });
            }
            None => candidates.sort_by(|a, b| {
                rank::compare_upcoming(a.next_start, b.next_start)
                    .then_with(|| self.tie_break(a, b))
            }),
        }

        let rows: Vec<FacetRow<'_>> = candidates
            .iter()
            .map(|c| FacetRow {
                program: c.program,
                partner: c.partner,
                sessions: &c.sessions,
            })
            .collect();
        let facets = compute_facets(
            &self.schema,
            &rows,
            &request.selections,
            request.discriminator.as_deref(),
        );

        let total_count = candidates.len();
        let total_pages = total_count.div_ceil(request.page_size);
        let results: Vec<SearchHit> = candidates
            .into_iter()
            .skip((request.page - 1).saturating_mul(request.page_size))
            .take(request.page_size)
            .map(Candidate::into_hit)
            .collect();

        let search_duration_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            results = total_count,
            page = request.page,
            duration_ms = search_duration_ms,
            "search completed"
        );

        SearchResponse {
            results,
            total_count,
            page: request.page,
            page_size: request.page_size,
            total_pages,
            facets,
            applied_filters: request.applied.clone(),
            search_duration_ms,
        }
    }

    /// Hierarchy pruning.
    fn collect<'a>(
        &self,
        snapshot: &'a Snapshot,
        request: &CompiledRequest,
        today: NaiveDate,
    ) -> Vec<Candidate<'a>> {
        let filter = &request.filter;
        let partner_filtered = filter.targets(EntityKind::Partner);
        let start_field = self.schema.session_start_field();
        let links = snapshot.links();

        let mut candidates = Vec::new();
        for program in snapshot.programs() {
            let discriminator = program.discriminator.as_deref();
            if let Some(wanted) = request.discriminator.as_deref()
                && discriminator != Some(wanted)
            {
                continue;
            }
            if !filter.evaluate(EntityKind::Program, Some(program), discriminator) {
                continue;
            }

            let all: Vec<&Entity> = links
                .sessions_of(&program.id)
                .iter()
                .filter_map(|id| snapshot.session(id))
                .collect();
            let sessions: Vec<&Entity> = all
                .iter()
                .copied()
                .filter(|s| filter.evaluate(EntityKind::Session, Some(*s), discriminator))
                .collect();

            let partner = links
                .partner_of(&program.id)
                .and_then(|id| snapshot.partner(id));
            if partner_filtered {
                match partner {
                    Some(p) if filter.evaluate(EntityKind::Partner, Some(p), discriminator) => {}
                    _ => continue,
                }
            }

            if sessions.is_empty() && !request.include_childless {
                continue;
            }

            let next_start = start_field.and_then(|field| {
                sessions
                    .iter()
                    .filter_map(|s| s.get(field).and_then(FieldValue::as_date))
                    .filter(|d| *d >= today)
                    .min()
            });

            candidates.push(Candidate {
                program,
                partner,
                total_sessions: all.len(),
                sessions,
                score: None,
                next_start,
            });
        }
        candidates
    }

    fn document(&self, candidate: &Candidate<'_>) -> SearchDocument {
        let mut doc = SearchDocument::new();
        let mut add = |kind: EntityKind, entity: &Entity, title_role: TextRole| {
            let title = self.schema.title_field(kind);
            for field in self.schema.fields_for(kind, FieldRole::Search) {
                if let Some(value) = entity.get(&field.name) {
                    let role = if title == Some(field.name.as_str()) {
                        title_role
                    } else {
                        TextRole::Other
                    };
                    doc.push(role, value.display());
                }
            }
        };

        add(EntityKind::Program, candidate.program, TextRole::Title);
        if let Some(partner) = candidate.partner {
            add(EntityKind::Partner, partner, TextRole::Partner);
        }
        for session in candidate.sessions.iter().copied() {
            add(EntityKind::Session, session, TextRole::Other);
        }
        doc
    }

    fn title_of(&self, program: &Entity) -> String {
        self.schema
            .title_field(EntityKind::Program)
            .and_then(|f| program.get(f))
            .map(|v| v.display().to_lowercase())
            .unwrap_or_default()
    }

    fn tie_break(&self, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
        self.title_of(a.program)
            .cmp(&self.title_of(b.program))
            .then_with(|| a.program.id.cmp(&b.program.id))
    }
}
