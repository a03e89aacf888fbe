//! In-memory snapshot of the CRM plus the two-phase refresh.
//!
//! # Architecture
//!
//! - **Snapshot**: partners, programs and sessions keyed by id, plus a
//!   relationship index. Phase 1 builds a fresh one and swaps the pointer;
//!   readers holding the old `Arc` keep a consistent view.
//! - **Relationship index**: the one part of a snapshot mutated in place.
//!   Phase 2 applies each association batch under a single write guard, so
//!   a batch is either fully visible or not at all.
//! - **Flags**: `refreshing` (Phase 1) and `linking` (Phase 2) are atomics
//!   claimed with compare-exchange and released on drop.
//!
//! Refresh progress is broadcast on a `watch` channel; `ensure_ready` waits
//! on it with a hard timeout and never cancels the refresh itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::model::{Entity, EntityKind};
use crate::schema::SchemaRegistry;
use crate::upstream::normalize::normalize_all;
use crate::upstream::{
    AssociationFetcher, AssociationPolicy, BatchLinks, CrmClient, Credentials, LinkReport,
    ObjectFetcher, UpstreamError,
};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache refresh failed: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("a cache refresh is already in progress")]
    RefreshInProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub ready_timeout_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            ready_timeout_ms: 10_000,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// Program → Partner (single parent) and Program → Sessions (ordered).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationshipIndex {
    program_partner: HashMap<String, String>,
    program_sessions: HashMap<String, Vec<String>>,
}

impl RelationshipIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.program_partner.is_empty() && self.program_sessions.is_empty()
    }

    pub fn partner_of(&self, program_id: &str) -> Option<&str> {
        self.program_partner.get(program_id).map(String::as_str)
    }

    pub fn sessions_of(&self, program_id: &str) -> &[String] {
        self.program_sessions
            .get(program_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn programs_with_sessions(&self) -> usize {
        self.program_sessions.values().filter(|s| !s.is_empty()).count()
    }

    pub fn programs_with_partner(&self) -> usize {
        self.program_partner.len()
    }

    /// First link wins; later calls for the same program are ignored.
    pub fn link_partner(&mut self, program_id: &str, partner_id: &str) -> bool {
        if self.program_partner.contains_key(program_id) {
            return false;
        }
        self.program_partner
            .insert(program_id.to_string(), partner_id.to_string());
        true
    }

    /// Appends a session unless it is already linked to the program.
    pub fn link_session(&mut self, program_id: &str, session_id: &str) -> bool {
        let sessions = self
            .program_sessions
            .entry(program_id.to_string())
            .or_default();
        if sessions.iter().any(|s| s == session_id) {
            return false;
        }
        sessions.push(session_id.to_string());
        true
    }

    fn replace_partner(&mut self, program_id: &str, partner_id: Option<String>) {
        match partner_id {
            Some(id) => {
                self.program_partner.insert(program_id.to_string(), id);
            }
            None => {
                self.program_partner.remove(program_id);
            }
        }
    }

    fn replace_sessions(&mut self, program_id: &str, sessions: Vec<String>) {
        if sessions.is_empty() {
            self.program_sessions.remove(program_id);
        } else {
            self.program_sessions.insert(program_id.to_string(), sessions);
        }
    }

    /// Drop links whose endpoints are not in `snapshot`.
    fn retain_known(&mut self, snapshot: &Snapshot) {
        self.program_partner.retain(|program, partner| {
            snapshot.programs.contains_key(program) && snapshot.partners.contains_key(partner)
        });
        self.program_sessions.retain(|program, sessions| {
            if !snapshot.programs.contains_key(program) {
                return false;
            }
            sessions.retain(|s| snapshot.sessions.contains_key(s));
            !sessions.is_empty()
        });
    }
}

/// Everything cached as of one refresh generation.
#[derive(Debug, Default)]
pub struct Snapshot {
    generation: u64,
    refreshed_at: Option<DateTime<Utc>>,
    partners: HashMap<String, Entity>,
    programs: HashMap<String, Entity>,
    sessions: HashMap<String, Entity>,
    links: RwLock<RelationshipIndex>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from normalized entities, routed by their kind.
    pub fn from_entities(generation: u64, entities: impl IntoIterator<Item = Entity>) -> Self {
        let mut snapshot = Self {
            generation,
            refreshed_at: Some(Utc::now()),
            ..Self::default()
        };
        for entity in entities {
            let map = match entity.kind {
                EntityKind::Partner => &mut snapshot.partners,
                EntityKind::Program => &mut snapshot.programs,
                EntityKind::Session => &mut snapshot.sessions,
            };
            map.entry(entity.id.clone()).or_insert(entity);
        }
        snapshot
    }

    fn from_maps(
        generation: u64,
        partners: HashMap<String, Entity>,
        programs: HashMap<String, Entity>,
        sessions: HashMap<String, Entity>,
    ) -> Self {
        Self {
            generation,
            refreshed_at: Some(Utc::now()),
            partners,
            programs,
            sessions,
            links: RwLock::new(RelationshipIndex::default()),
        }
    }

    /// Install a relationship index, pruned to ids present here.
    pub fn with_links(self, mut links: RelationshipIndex) -> Self {
        links.retain_known(&self);
        *self.links.write() = links;
        self
    }

    pub fn with_refreshed_at(mut self, at: DateTime<Utc>) -> Self {
        self.refreshed_at = Some(at);
        self
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }

    /// No programs loaded.
    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.refreshed_at
            .map(|at| (now - at).to_std().unwrap_or(Duration::ZERO))
    }

    /// A snapshot that was never refreshed counts as stale.
    pub fn is_stale_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.age_at(now).is_none_or(|age| age > ttl)
    }

    pub fn partner(&self, id: &str) -> Option<&Entity> {
        self.partners.get(id)
    }

    pub fn program(&self, id: &str) -> Option<&Entity> {
        self.programs.get(id)
    }

    pub fn session(&self, id: &str) -> Option<&Entity> {
        self.sessions.get(id)
    }

    /// Programs ordered by id.
    pub fn programs(&self) -> Vec<&Entity> {
        let mut programs: Vec<_> = self.programs.values().collect();
        programs.sort_by(|a, b| a.id.cmp(&b.id));
        programs
    }

    pub fn program_ids(&self) -> Vec<String> {
        self.programs().into_iter().map(|p| p.id.clone()).collect()
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Partner => self.partners.len(),
            EntityKind::Program => self.programs.len(),
            EntityKind::Session => self.sessions.len(),
        }
    }

    pub fn counts(&self) -> EntityCounts {
        EntityCounts {
            partners: self.partners.len(),
            programs: self.programs.len(),
            sessions: self.sessions.len(),
        }
    }

    /// Read access to the relationship index. Hold it for one evaluation,
    /// never across an await.
    pub fn links(&self) -> RwLockReadGuard<'_, RelationshipIndex> {
        self.links.read()
    }

    /// Apply one Program → Partner batch. Returns programs linked.
    pub fn apply_partner_links(&self, batch: &BatchLinks) -> usize {
        let mut links = self.links.write();
        let mut linked = 0;
        for program_id in batch.answered() {
            if !self.programs.contains_key(program_id) {
                continue;
            }
            let known: Vec<&String> = batch
                .links
                .get(program_id)
                .into_iter()
                .flatten()
                .filter(|id| self.partners.contains_key(*id))
                .collect();
            if known.len() > 1 {
                tracing::debug!(
                    program = %program_id,
                    partners = known.len(),
                    "multiple partners reported; keeping the first"
                );
            }
            let partner = known.first().map(|id| (*id).clone());
            linked += usize::from(partner.is_some());
            links.replace_partner(program_id, partner);
        }
        linked
    }

    /// Apply one Program → Sessions batch. Returns programs with sessions.
    pub fn apply_session_links(&self, batch: &BatchLinks) -> usize {
        let mut links = self.links.write();
        let mut linked = 0;
        for program_id in batch.answered() {
            if !self.programs.contains_key(program_id) {
                continue;
            }
            let mut sessions: Vec<String> = Vec::new();
            for id in batch.links.get(program_id).into_iter().flatten() {
                if self.sessions.contains_key(id) && !sessions.contains(id) {
                    sessions.push(id.clone());
                }
            }
            linked += usize::from(!sessions.is_empty());
            links.replace_sessions(program_id, sessions);
        }
        linked
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    pub partners: usize,
    pub programs: usize,
    pub sessions: usize,
}

/// Broadcast on every refresh transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshEvent {
    Idle,
    Started,
    Loaded { generation: u64 },
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AssociationSummary {
    pub partners: LinkReport,
    pub sessions: LinkReport,
}

/// Result of a completed Phase 1. `associations` is the running Phase 2
/// task, or `None` when one was already in flight.
#[derive(Debug)]
pub struct RefreshOutcome {
    pub generation: u64,
    pub counts: EntityCounts,
    pub associations: Option<JoinHandle<AssociationSummary>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Readiness {
    fn ready() -> Self {
        Self {
            ready: true,
            message: None,
        }
    }

    fn not_ready(message: impl Into<String>) -> Self {
        Self {
            ready: false,
            message: Some(message.into()),
        }
    }
}

/// Operational view of the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatus {
    pub counts: EntityCounts,
    pub programs_with_sessions: usize,
    pub programs_with_partner: usize,
    pub generation: u64,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub age_secs: Option<u64>,
    pub stale: bool,
    pub refresh_in_progress: bool,
    pub associations_in_progress: bool,
}

/// Releases a claimed flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    schema: Arc<SchemaRegistry>,
    objects: ObjectFetcher,
    associations: AssociationFetcher,
    settings: CacheSettings,
    current: RwLock<Arc<Snapshot>>,
    refreshing: AtomicBool,
    linking: AtomicBool,
    generation: AtomicU64,
    events: watch::Sender<RefreshEvent>,
}

/// Shared handle to the cache. Clones refer to the same state.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl CacheStore {
    pub fn new(
        schema: Arc<SchemaRegistry>,
        client: CrmClient,
        policy: AssociationPolicy,
        settings: CacheSettings,
    ) -> Self {
        let (events, _) = watch::channel(RefreshEvent::Idle);
        Self {
            inner: Arc::new(Inner {
                schema,
                objects: ObjectFetcher::new(client.clone()),
                associations: AssociationFetcher::new(client, policy),
                settings,
                current: RwLock::new(Arc::new(Snapshot::empty())),
                refreshing: AtomicBool::new(false),
                linking: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.inner.schema
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    /// The current snapshot. Cheap; the returned `Arc` stays valid after a
    /// swap.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.current.read())
    }

    /// Replace the current snapshot wholesale.
    pub fn install_snapshot(&self, snapshot: Snapshot) {
        self.inner
            .generation
            .fetch_max(snapshot.generation(), Ordering::AcqRel);
        *self.inner.current.write() = Arc::new(snapshot);
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn is_stale(&self) -> bool {
        self.snapshot()
            .is_stale_at(self.inner.settings.ttl(), Utc::now())
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.refreshing.load(Ordering::Acquire)
    }

    pub fn is_linking(&self) -> bool {
        self.inner.linking.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> watch::Receiver<RefreshEvent> {
        self.inner.events.subscribe()
    }

    /// Phase 1 now, Phase 2 in the background.
    ///
    /// On failure the previous snapshot stays current and the error is
    /// returned to the caller.
    pub async fn refresh(&self, creds: &Credentials) -> Result<RefreshOutcome, CacheError> {
        let Some(_busy) = FlagGuard::claim(&self.inner.refreshing) else {
            return Err(CacheError::RefreshInProgress);
        };
        self.inner.events.send_replace(RefreshEvent::Started);

        let started = Instant::now();
        let snapshot = match self.load_objects(creds).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::error!(error = %err, "cache refresh failed; keeping previous snapshot");
                self.inner
                    .events
                    .send_replace(RefreshEvent::Failed(err.to_string()));
                return Err(err.into());
            }
        };

        let generation = snapshot.generation();
        let counts = snapshot.counts();
        let carried = self.swap_in(snapshot);
        tracing::info!(
            generation,
            partners = counts.partners,
            programs = counts.programs,
            sessions = counts.sessions,
            carried_links = carried,
            duration_ms = started.elapsed().as_millis() as u64,
            "objects loaded"
        );
        self.inner
            .events
            .send_replace(RefreshEvent::Loaded { generation });
        drop(_busy);

        let associations = self.spawn_associations(creds.clone());
        Ok(RefreshOutcome {
            generation,
            counts,
            associations,
        })
    }

    /// Fire-and-forget refresh. `None` if one is already running.
    pub fn spawn_refresh(
        &self,
        creds: Credentials,
    ) -> Option<JoinHandle<Result<RefreshOutcome, CacheError>>> {
        if self.is_refreshing() {
            return None;
        }
        let store = self.clone();
        Some(tokio::spawn(async move { store.refresh(&creds).await }))
    }

    /// Start Phase 2 unless it is already running.
    pub fn spawn_associations(&self, creds: Credentials) -> Option<JoinHandle<AssociationSummary>> {
        if self
            .inner
            .linking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("association refresh already running");
            return None;
        }
        let store = self.clone();
        Some(tokio::spawn(async move {
            let _busy = FlagGuard(&store.inner.linking);
            store.refresh_associations(&creds).await
        }))
    }

    /// Phase 2 body. Each batch lands on whichever snapshot is current when
    /// it completes.
    pub async fn refresh_associations(&self, creds: &Credentials) -> AssociationSummary {
        let started = Instant::now();
        let program_ids = self.snapshot().program_ids();

        let partners = self
            .inner
            .associations
            .fetch_links_with(
                creds,
                EntityKind::Program,
                EntityKind::Partner,
                &program_ids,
                |batch| {
                    let current = self.inner.current.read();
                    current.apply_partner_links(&batch);
                },
            )
            .await;

        let sessions = self
            .inner
            .associations
            .fetch_links_with(
                creds,
                EntityKind::Program,
                EntityKind::Session,
                &program_ids,
                |batch| {
                    let current = self.inner.current.read();
                    current.apply_session_links(&batch);
                },
            )
            .await;

        let snapshot = self.snapshot();
        let links = snapshot.links();
        tracing::info!(
            generation = snapshot.generation(),
            programs_with_partner = links.programs_with_partner(),
            programs_with_sessions = links.programs_with_sessions(),
            skipped_batches = partners.skipped + sessions.skipped,
            duration_ms = started.elapsed().as_millis() as u64,
            "associations loaded"
        );
        AssociationSummary { partners, sessions }
    }

    /// Make the cache usable for a search.
    ///
    /// Empty: refresh and wait up to `timeout`. Stale: refresh in the
    /// background and answer immediately.
    pub async fn ensure_ready(&self, creds: &Credentials, timeout: Duration) -> Readiness {
        if !self.is_empty() {
            if self.is_stale() && self.spawn_refresh(creds.clone()).is_some() {
                tracing::debug!("snapshot stale; refreshing in background");
            }
            return Readiness::ready();
        }

        let mut events = self.subscribe();
        events.borrow_and_update();
        self.spawn_refresh(creds.clone());

        let wait = async {
            loop {
                if !self.is_empty() {
                    return Ok(());
                }
                if events.changed().await.is_err() {
                    return Err("refresh channel closed".to_string());
                }
                if let RefreshEvent::Failed(message) = &*events.borrow_and_update() {
                    return Err(message.clone());
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(())) => Readiness::ready(),
            Ok(Err(message)) if self.is_empty() => {
                Readiness::not_ready(format!("cache refresh failed: {message}"))
            }
            Ok(Err(_)) => Readiness::ready(),
            Err(_) => {
                tracing::debug!(timeout_ms = timeout.as_millis() as u64, "cache not ready in time");
                Readiness::not_ready("cache is still loading; try again shortly")
            }
        }
    }

    pub fn status(&self) -> CacheStatus {
        let snapshot = self.snapshot();
        let now = Utc::now();
        let links = snapshot.links();
        CacheStatus {
            counts: snapshot.counts(),
            programs_with_sessions: links.programs_with_sessions(),
            programs_with_partner: links.programs_with_partner(),
            generation: snapshot.generation(),
            refreshed_at: snapshot.refreshed_at(),
            age_secs: snapshot.age_at(now).map(|a| a.as_secs()),
            stale: snapshot.is_stale_at(self.inner.settings.ttl(), now),
            refresh_in_progress: self.is_refreshing(),
            associations_in_progress: self.is_linking(),
        }
    }

    async fn load_objects(&self, creds: &Credentials) -> Result<Snapshot, UpstreamError> {
        let schema = &self.inner.schema;
        let objects = &self.inner.objects;
        let partner_props = schema.upstream_properties(EntityKind::Partner);
        let program_props = schema.upstream_properties(EntityKind::Program);
        let session_props = schema.upstream_properties(EntityKind::Session);

        let (partners, programs, sessions) = tokio::try_join!(
            objects.fetch_all(creds, EntityKind::Partner, &partner_props),
            objects.fetch_all(creds, EntityKind::Program, &program_props),
            objects.fetch_all(creds, EntityKind::Session, &session_props),
        )?;

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(Snapshot::from_maps(
            generation,
            normalize_all(schema.entity(EntityKind::Partner), &partners),
            normalize_all(schema.entity(EntityKind::Program), &programs),
            normalize_all(schema.entity(EntityKind::Session), &sessions),
        ))
    }

    /// Swap in a Phase 1 snapshot, carrying the previous links forward.
    /// Returns the number of carried program links.
    fn swap_in(&self, snapshot: Snapshot) -> usize {
        let mut current = self.inner.current.write();
        let previous = current.links().clone();
        let snapshot = if previous.is_empty() {
            snapshot
        } else {
            snapshot.with_links(previous)
        };
        let carried = {
            let links = snapshot.links();
            links.programs_with_partner() + links.programs_with_sessions()
        };
        *current = Arc::new(snapshot);
        carried
    }
}
