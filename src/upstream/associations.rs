//! Association Fetcher.
//!
//! Relationships are read in fixed-size batches with a pause between
//! batches. A batch that keeps failing is logged and skipped; it never
//! aborts the run, so callers always get whatever resolved.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{CrmClient, Credentials, deserialize_id};
use crate::model::EntityKind;

/// Batching, pacing and retry knobs for association reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationPolicy {
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
    /// First backoff after HTTP 429; doubles per retry.
    pub base_backoff_ms: u64,
    pub max_retries: u32,
    /// Flat delay after any other failure.
    pub retry_delay_ms: u64,
}

impl Default for AssociationPolicy {
    fn default() -> Self {
        Self {
            batch_size: 100,
            inter_batch_delay_ms: 150,
            base_backoff_ms: 1000,
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

impl AssociationPolicy {
    /// Backoff before retry number `retry` (0-based) after a 429.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// All delays zeroed; for tests that only care about call counts.
    pub fn without_delays(mut self) -> Self {
        self.inter_batch_delay_ms = 0;
        self.base_backoff_ms = 0;
        self.retry_delay_ms = 0;
        self
    }
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    inputs: Vec<BatchInput<'a>>,
}

#[derive(Debug, Serialize)]
struct BatchInput<'a> {
    id: &'a str,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    results: Vec<BatchResult>,
    /// Per-item failures reported alongside a 207.
    #[serde(default)]
    errors: Vec<BatchItemError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchItemError {
    #[serde(default)]
    category: String,
    #[serde(default)]
    sub_category: Option<String>,
    #[serde(default)]
    context: ErrorContext,
}

impl BatchItemError {
    /// The upstream's way of saying "this record has no associations".
    fn is_no_associations(&self) -> bool {
        [Some(self.category.as_str()), self.sub_category.as_deref()]
            .into_iter()
            .flatten()
            .any(|c| c.ends_with("NO_ASSOCIATIONS_FOUND"))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorContext {
    #[serde(default)]
    from_object_id: Vec<ObjectId>,
}

#[derive(Debug, Deserialize)]
struct ObjectId(#[serde(deserialize_with = "deserialize_id")] String);

#[derive(Debug, Deserialize)]
struct BatchResult {
    from: ObjectRef,
    #[serde(default)]
    to: Vec<AssociatedObject>,
}

#[derive(Debug, Deserialize)]
struct ObjectRef {
    #[serde(deserialize_with = "deserialize_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct AssociatedObject {
    #[serde(rename = "toObjectId", deserialize_with = "deserialize_id")]
    to_object_id: String,
}

/// Links resolved by one successful batch.
///
/// Ids in `requested` that are neither in `links` nor in `unresolved` have
/// no association upstream. `unresolved` ids failed individually and their
/// links are unknown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchLinks {
    pub index: usize,
    pub requested: Vec<String>,
    pub links: HashMap<String, Vec<String>>,
    pub unresolved: Vec<String>,
}

impl BatchLinks {
    /// Requested ids the upstream gave a definite answer for.
    pub fn answered(&self) -> impl Iterator<Item = &String> {
        self.requested
            .iter()
            .filter(|id| !self.unresolved.contains(id))
    }
}

/// Summary of one association run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkReport {
    pub batches: usize,
    pub resolved: usize,
    pub skipped: usize,
    pub links: usize,
    /// Ids inside resolved batches that failed individually.
    pub unresolved: usize,
}

impl LinkReport {
    pub fn is_complete(&self) -> bool {
        self.skipped == 0
    }
}

#[derive(Debug, Clone)]
pub struct AssociationFetcher {
    client: CrmClient,
    policy: AssociationPolicy,
}

impl AssociationFetcher {
    pub fn new(client: CrmClient, policy: AssociationPolicy) -> Self {
        Self { client, policy }
    }

    /// Resolve `from → to` links for `from_ids`, handing each successful
    /// batch to `on_batch` as soon as it lands.
    pub async fn fetch_links_with<F>(
        &self,
        creds: &Credentials,
        from: EntityKind,
        to: EntityKind,
        from_ids: &[String],
        mut on_batch: F,
    ) -> LinkReport
    where
        F: FnMut(BatchLinks),
    {
        let batch_size = self.policy.batch_size.max(1);
        let total = from_ids.len().div_ceil(batch_size);
        let url = self.client.url(&format!(
            "/crm/v4/associations/{}/{}/batch/read",
            self.client.object_type(from),
            self.client.object_type(to)
        ));

        let mut report = LinkReport {
            batches: total,
            ..LinkReport::default()
        };

        for (index, chunk) in from_ids.chunks(batch_size).enumerate() {
            match self.read_batch(creds, &url, chunk, index + 1, total).await {
                Some((links, unresolved)) => {
                    report.resolved += 1;
                    report.unresolved += unresolved.len();
                    report.links += links.values().map(Vec::len).sum::<usize>();
                    on_batch(BatchLinks {
                        index,
                        requested: chunk.to_vec(),
                        links,
                        unresolved,
                    });
                }
                None => report.skipped += 1,
            }

            if index + 1 < total {
                tokio::time::sleep(self.policy.inter_batch_delay()).await;
            }
        }

        tracing::info!(
            from = %from,
            to = %to,
            batches = report.batches,
            resolved = report.resolved,
            skipped = report.skipped,
            links = report.links,
            "association fetch finished"
        );
        report
    }

    /// Collecting variant of [`fetch_links_with`](Self::fetch_links_with).
    pub async fn fetch_links(
        &self,
        creds: &Credentials,
        from: EntityKind,
        to: EntityKind,
        from_ids: &[String],
    ) -> (HashMap<String, Vec<String>>, LinkReport) {
        let mut all = HashMap::new();
        let report = self
            .fetch_links_with(creds, from, to, from_ids, |batch| all.extend(batch.links))
            .await;
        (all, report)
    }

    async fn read_batch(
        &self,
        creds: &Credentials,
        url: &str,
        ids: &[String],
        batch: usize,
        total: usize,
    ) -> Option<(HashMap<String, Vec<String>>, Vec<String>)> {
        let body = BatchRequest {
            inputs: ids.iter().map(|id| BatchInput { id }).collect(),
        };

        let mut retries = 0u32;
        loop {
            let delay = match self.client.post_json(creds, url, &body).await {
                Ok(response) if response.status().is_success() => {
                    match response.json::<BatchResponse>().await {
                        Ok(parsed) => {
                            let (links, unresolved) = collect_links(parsed, ids);
                            tracing::info!(
                                batch,
                                total,
                                requested = ids.len(),
                                linked = links.len(),
                                unresolved = unresolved.len(),
                                "association batch resolved"
                            );
                            return Some((links, unresolved));
                        }
                        Err(err) => {
                            tracing::warn!(batch, total, error = %err, "association batch undecodable");
                            self.policy.retry_delay()
                        }
                    }
                }
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    let delay = self.policy.backoff_delay(retries);
                    tracing::warn!(
                        batch,
                        total,
                        retry = retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "association batch rate limited"
                    );
                    delay
                }
                Ok(response) => {
                    tracing::warn!(
                        batch,
                        total,
                        status = response.status().as_u16(),
                        "association batch failed"
                    );
                    self.policy.retry_delay()
                }
                Err(err) => {
                    tracing::warn!(batch, total, error = %err, "association batch request error");
                    self.policy.retry_delay()
                }
            };

            if retries >= self.policy.max_retries {
                tracing::warn!(
                    batch,
                    total,
                    attempts = retries + 1,
                    "association batch skipped after retries"
                );
                return None;
            }
            retries += 1;
            tokio::time::sleep(delay).await;
        }
    }
}

/// Keep only answers for requested ids; targets de-duplicated in order.
/// Also returns requested ids that failed for any reason other than
/// having no associations.
fn collect_links(
    response: BatchResponse,
    requested: &[String],
) -> (HashMap<String, Vec<String>>, Vec<String>) {
    let mut links: HashMap<String, Vec<String>> = HashMap::new();
    for result in response.results {
        if !requested.contains(&result.from.id) {
            continue;
        }
        let targets = links.entry(result.from.id).or_default();
        for target in result.to {
            if !targets.contains(&target.to_object_id) {
                targets.push(target.to_object_id);
            }
        }
    }
    links.retain(|_, targets| !targets.is_empty());

    let mut unresolved: Vec<String> = Vec::new();
    for error in response.errors.iter().filter(|e| !e.is_no_associations()) {
        for ObjectId(id) in &error.context.from_object_id {
            if requested.contains(id) && !links.contains_key(id) && !unresolved.contains(id) {
                unresolved.push(id.clone());
            }
        }
    }
    (links, unresolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamConfig;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn fetcher(server: &MockServer, policy: AssociationPolicy) -> AssociationFetcher {
        let config = UpstreamConfig {
            base_url: server.uri(),
            ..Default::default()
        };
        AssociationFetcher::new(CrmClient::new(&config).unwrap(), policy)
    }

    fn ids(n: usize) -> Vec<String> {
        (1..=n).map(|i| i.to_string()).collect()
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let policy = AssociationPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(8000));
        assert!(policy.backoff_delay(200) >= policy.backoff_delay(3));
    }

    #[test]
    fn collect_links_dedups_and_ignores_unrequested() {
        let response: BatchResponse = serde_json::from_value(json!({
            "results": [
                { "from": { "id": "1" }, "to": [{ "toObjectId": 10 }, { "toObjectId": 11 }, { "toObjectId": 10 }] },
                { "from": { "id": "99" }, "to": [{ "toObjectId": 12 }] },
                { "from": { "id": "2" }, "to": [] }
            ]
        }))
        .unwrap();
        let (links, unresolved) = collect_links(response, &["1".to_string(), "2".to_string()]);
        assert_eq!(links.len(), 1);
        assert_eq!(links["1"], vec!["10", "11"]);
        assert!(unresolved.is_empty());
    }

    #[test]
    fn item_errors_mark_ids_unresolved_unless_no_associations() {
        let response: BatchResponse = serde_json::from_value(json!({
            "results": [{ "from": { "id": "1" }, "to": [{ "toObjectId": 10 }] }],
            "errors": [
                { "category": "RATE_LIMITS", "context": { "fromObjectId": ["2", 1] } },
                {
                    "category": "OBJECT_NOT_FOUND",
                    "subCategory": "crm.associations.NO_ASSOCIATIONS_FOUND",
                    "context": { "fromObjectId": ["3"] }
                },
                { "category": "INTERNAL_ERROR", "context": { "fromObjectId": [4, "99"] } }
            ]
        }))
        .unwrap();
        let requested: Vec<String> = ids(4);
        let (links, unresolved) = collect_links(response, &requested);
        assert_eq!(links["1"], vec!["10"]);
        assert_eq!(unresolved, vec!["2", "4"]);

        let batch = BatchLinks {
            requested,
            links,
            unresolved,
            ..Default::default()
        };
        let answered: Vec<&String> = batch.answered().collect();
        assert_eq!(answered, ["1", "3"]);
    }

    #[tokio::test]
    async fn issues_one_call_per_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/crm/v4/associations/programs/sessions/batch/read"))
            .and(header("authorization", "Bearer t"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{ "from": { "id": "1" }, "to": [{ "toObjectId": "s1" }] }]
            })))
            .expect(3)
            .mount(&server)
            .await;

        let fetcher = fetcher(&server, AssociationPolicy::default().with_batch_size(2).without_delays());
        let mut seen = Vec::new();
        let report = fetcher
            .fetch_links_with(
                &Credentials::bearer("t"),
                EntityKind::Program,
                EntityKind::Session,
                &ids(5),
                |batch| seen.push((batch.index, batch.requested.len())),
            )
            .await;

        assert_eq!(report.batches, 3);
        assert_eq!(report.resolved, 3);
        assert!(report.is_complete());
        assert_eq!(seen, vec![(0, 2), (1, 2), (2, 1)]);
    }

    #[tokio::test]
    async fn multi_status_counts_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(207).set_body_json(json!({
                "results": [{ "from": { "id": 1 }, "to": [{ "toObjectId": 7 }] }],
                "errors": [{ "status": "error", "message": "partial" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (links, report) = fetcher(&server, AssociationPolicy::default().without_delays())
            .fetch_links(&Credentials::bearer("t"), EntityKind::Program, EntityKind::Partner, &ids(1))
            .await;
        assert_eq!(report.resolved, 1);
        assert_eq!(links["1"], vec!["7"]);
    }

    #[tokio::test]
    async fn multi_status_item_failures_reach_the_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(207).set_body_json(json!({
                "results": [],
                "errors": [{ "category": "RATE_LIMITS", "context": { "fromObjectId": ["1"] } }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut batches = Vec::new();
        let report = fetcher(&server, AssociationPolicy::default().without_delays())
            .fetch_links_with(
                &Credentials::bearer("t"),
                EntityKind::Program,
                EntityKind::Session,
                &ids(2),
                |batch| batches.push(batch),
            )
            .await;
        assert_eq!(report.resolved, 1);
        assert_eq!(report.unresolved, 1);
        assert_eq!(batches[0].unresolved, vec!["1"]);
        assert_eq!(batches[0].answered().collect::<Vec<_>>(), ["2"]);
    }

    #[tokio::test]
    async fn persistent_rate_limit_skips_batch_without_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(4)
            .mount(&server)
            .await;

        let policy = AssociationPolicy::default()
            .with_max_retries(3)
            .without_delays();
        let mut called = false;
        let report = fetcher(&server, policy)
            .fetch_links_with(
                &Credentials::bearer("t"),
                EntityKind::Program,
                EntityKind::Session,
                &ids(3),
                |_| called = true,
            )
            .await;

        assert!(!called);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.resolved, 0);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn rate_limit_retries_wait_longer_each_time() {
        let arrivals = Arc::new(Mutex::new(Vec::<Instant>::new()));
        let server = MockServer::start().await;
        let seen = arrivals.clone();
        Mock::given(method("POST"))
            .respond_with(move |_: &Request| {
                seen.lock().unwrap().push(Instant::now());
                ResponseTemplate::new(429)
            })
            .expect(4)
            .mount(&server)
            .await;

        let policy = AssociationPolicy {
            base_backoff_ms: 40,
            max_retries: 3,
            inter_batch_delay_ms: 0,
            retry_delay_ms: 0,
            ..AssociationPolicy::default()
        };
        let report = fetcher(&server, policy)
            .fetch_links_with(
                &Credentials::bearer("t"),
                EntityKind::Program,
                EntityKind::Session,
                &ids(1),
                |_| {},
            )
            .await;
        assert_eq!(report.skipped, 1);

        let arrivals = arrivals.lock().unwrap();
        let gaps: Vec<Duration> = arrivals.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 3);
        for (retry, gap) in gaps.iter().enumerate() {
            assert!(
                *gap >= policy.backoff_delay(retry as u32),
                "retry {retry} waited only {gap:?}"
            );
        }
        assert!(gaps[0] < gaps[1] && gaps[1] < gaps[2], "{gaps:?}");
    }

    #[tokio::test]
    async fn recovers_after_transient_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{ "from": { "id": "2" }, "to": [{ "toObjectId": "p9" }] }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (links, report) = fetcher(&server, AssociationPolicy::default().without_delays())
            .fetch_links(&Credentials::bearer("t"), EntityKind::Program, EntityKind::Partner, &ids(2))
            .await;
        assert_eq!(report.resolved, 1);
        assert_eq!(links.get("2"), Some(&vec!["p9".to_string()]));
        assert!(!links.contains_key("1"));
    }

    #[tokio::test]
    async fn server_errors_retry_on_flat_delay_then_skip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let policy = AssociationPolicy::default()
            .with_max_retries(1)
            .without_delays();
        let (links, report) = fetcher(&server, policy)
            .fetch_links(&Credentials::bearer("t"), EntityKind::Program, EntityKind::Session, &ids(1))
            .await;
        assert!(links.is_empty());
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (links, report) = fetcher(&server, AssociationPolicy::default())
            .fetch_links(&Credentials::bearer("t"), EntityKind::Program, EntityKind::Session, &[])
            .await;
        assert!(links.is_empty());
        assert_eq!(report.batches, 0);
    }
}
