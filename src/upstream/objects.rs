//! Object Fetcher: cursor-paginated bulk reads.

use serde::Deserialize;

use super::{CrmClient, Credentials, RawRecord, UpstreamError};
use crate::model::EntityKind;

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    results: Vec<RawRecord>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    next: Option<NextPage>,
}

#[derive(Debug, Deserialize)]
struct NextPage {
    after: String,
}

/// Retrieves every record of one kind. No retries: a failed page fails the
/// whole fetch and the caller decides what to do.
#[derive(Debug, Clone)]
pub struct ObjectFetcher {
    client: CrmClient,
}

impl ObjectFetcher {
    pub fn new(client: CrmClient) -> Self {
        Self { client }
    }

    #[tracing::instrument(name = "fetch_objects", level = "debug", skip_all, fields(entity = %kind))]
    pub async fn fetch_all(
        &self,
        creds: &Credentials,
        kind: EntityKind,
        properties: &[String],
    ) -> Result<Vec<RawRecord>, UpstreamError> {
        let url = self
            .client
            .url(&format!("/crm/v3/objects/{}", self.client.object_type(kind)));
        let property_list = properties.join(",");

        let mut records = Vec::new();
        let mut after: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let mut query = vec![
                ("limit", self.client.page_size().to_string()),
                ("archived", "false".to_string()),
            ];
            if !property_list.is_empty() {
                query.push(("properties", property_list.clone()));
            }
            if let Some(cursor) = &after {
                query.push(("after", cursor.clone()));
            }

            let page: Page = self.client.get_json(creds, &url, &query).await?;
            pages += 1;
            records.extend(page.results);
            tracing::debug!(page = pages, records = records.len(), "object page fetched");

            match page.paging.and_then(|p| p.next) {
                Some(next) if !next.after.is_empty() && after.as_deref() != Some(&next.after) => {
                    after = Some(next.after);
                }
                _ => break,
            }
        }

        tracing::info!(entity = %kind, pages, records = records.len(), "objects fetched");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamConfig;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(server: &MockServer) -> ObjectFetcher {
        let config = UpstreamConfig {
            base_url: server.uri(),
            page_size: 2,
            ..Default::default()
        };
        ObjectFetcher::new(CrmClient::new(&config).unwrap())
    }

    #[tokio::test]
    async fn follows_cursor_until_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/crm/v3/objects/partners"))
            .and(header("authorization", "Bearer t"))
            .and(query_param("properties", "name,city"))
            .and(query_param("limit", "2"))
            .and(query_param_is_missing("after"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{ "id": "1" }, { "id": "2" }],
                "paging": { "next": { "after": "c2" } }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/crm/v3/objects/partners"))
            .and(query_param("after", "c2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{ "id": "3" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let records = fetcher(&server)
            .fetch_all(
                &Credentials::bearer("t"),
                EntityKind::Partner,
                &["name".to_string(), "city".to_string()],
            )
            .await
            .unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
    }

    #[tokio::test]
    async fn repeated_cursor_stops_paging() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{ "id": "1" }],
                "paging": { "next": { "after": "same" } }
            })))
            .expect(2)
            .mount(&server)
            .await;

        let records = fetcher(&server)
            .fetch_all(&Credentials::bearer("t"), EntityKind::Program, &[])
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_fetches_log_under_their_own_span() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .without_time()
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let server = MockServer::start().await;
        for (object_type, delay_ms) in [("partners", 80), ("programs", 20)] {
            Mock::given(method("GET"))
                .and(path(format!("/crm/v3/objects/{object_type}")))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_json(json!({ "results": [{ "id": "1" }] }))
                        .set_delay(std::time::Duration::from_millis(delay_ms)),
                )
                .mount(&server)
                .await;
        }

        let fetcher = fetcher(&server);
        let creds = Credentials::bearer("t");
        let (partners, programs) = tokio::join!(
            fetcher.fetch_all(&creds, EntityKind::Partner, &[]),
            fetcher.fetch_all(&creds, EntityKind::Program, &[]),
        );
        assert!(partners.is_ok() && programs.is_ok());

        let out = String::from_utf8_lossy(&captured.0.lock().unwrap()).to_string();
        let finished: Vec<&str> = out.lines().filter(|l| l.contains("objects fetched")).collect();
        assert_eq!(finished.len(), 2, "{out}");
        for line in finished {
            let (spans, event) = line.split_once("objects fetched").unwrap();
            let entity = event
                .split_whitespace()
                .find_map(|kv| kv.strip_prefix("entity="))
                .unwrap();
            assert_eq!(spans.matches("fetch_objects").count(), 1, "{line}");
            assert!(spans.contains(&format!("fetch_objects{{entity={entity}}}")), "{line}");
        }
    }

    #[tokio::test]
    async fn non_success_status_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(&server)
            .await;

        let err = fetcher(&server)
            .fetch_all(&Credentials::bearer("t"), EntityKind::Session, &[])
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(502));
    }
}
