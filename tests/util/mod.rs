use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use partner_search::cache::{CacheSettings, CacheStore, RelationshipIndex, Snapshot};
use partner_search::model::{Entity, EntityKind};
use partner_search::schema::SchemaRegistry;
use partner_search::upstream::normalize::normalize_all;
use partner_search::upstream::{AssociationPolicy, Credentials, CrmClient, RawRecord, UpstreamConfig};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

/// The sample schema shipped in `schema/`.
#[allow(dead_code)]
pub fn schema_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("schema")
}

#[allow(dead_code)]
pub fn schema() -> Arc<SchemaRegistry> {
    Arc::new(SchemaRegistry::load_dir(&schema_dir()).expect("sample schema"))
}

#[allow(dead_code)]
pub fn creds() -> Credentials {
    Credentials::bearer("test-token")
}

#[allow(dead_code)]
pub fn record(id: &str, properties: Value) -> Value {
    json!({ "id": id, "properties": properties })
}

/// Upstream records for the reference hierarchy:
///
/// - partners A, B and "Camp Co" (C, linked to nothing)
/// - P1 → A with s1 (2025-06-10) and s2 (2025-05-15)
/// - P2 → A with no sessions
/// - P3 → B with s3 (no start date)
#[allow(dead_code)]
pub fn partner_records() -> Vec<Value> {
    vec![
        record("A", json!({ "name": "Acme Arts", "city": "Austin", "accreditations": "acs;state_licensed" })),
        record("B", json!({ "name": "Bright Minds", "city": "Boston" })),
        record("C", json!({ "name": "Camp Co", "city": "Austin" })),
    ]
}

#[allow(dead_code)]
pub fn program_records() -> Vec<Value> {
    vec![
        record("P1", json!({
            "name": "Pottery Basics",
            "program_type": "Summer Camp",
            "topics": "art;ceramics",
            "is_overnight": "yes",
            "scholarships": "true"
        })),
        record("P2", json!({
            "name": "Painting Club",
            "program_type": "After School",
            "topics": "art"
        })),
        record("P3", json!({
            "name": "Junior Robotics",
            "program_type": "Workshop",
            "topics": "stem",
            "scholarships": "false"
        })),
    ]
}

#[allow(dead_code)]
pub fn session_records() -> Vec<Value> {
    vec![
        record("s1", json!({ "name": "June Week", "start_date": "2025-06-10", "age_max": "12", "price": "$0", "days": "Mon;Wed" })),
        record("s2", json!({ "name": "May Week", "start_date": "2025-05-15", "age_min": "8", "price": "250" })),
        record("s3", json!({ "name": "Saturday Lab", "age_min": 10, "price": "45.50", "days": "Sat" })),
    ]
}

#[allow(dead_code)]
pub fn partner_links() -> Vec<(&'static str, Vec<&'static str>)> {
    vec![("P1", vec!["A"]), ("P2", vec!["A"]), ("P3", vec!["B"])]
}

#[allow(dead_code)]
pub fn session_links() -> Vec<(&'static str, Vec<&'static str>)> {
    vec![("P1", vec!["s1", "s2"]), ("P3", vec!["s3"])]
}

#[allow(dead_code)]
fn normalize(schema: &SchemaRegistry, kind: EntityKind, records: Vec<Value>) -> Vec<Entity> {
    let raw: Vec<RawRecord> = records
        .into_iter()
        .map(|r| serde_json::from_value(r).expect("raw record"))
        .collect();
    normalize_all(schema.entity(kind), &raw).into_values().collect()
}

/// The reference hierarchy as a fully linked snapshot, no network involved.
#[allow(dead_code)]
pub fn reference_snapshot(schema: &SchemaRegistry) -> Snapshot {
    let mut entities = normalize(schema, EntityKind::Partner, partner_records());
    entities.extend(normalize(schema, EntityKind::Program, program_records()));
    entities.extend(normalize(schema, EntityKind::Session, session_records()));

    let mut links = RelationshipIndex::new();
    for (program, partners) in partner_links() {
        for partner in partners {
            links.link_partner(program, partner);
        }
    }
    for (program, sessions) in session_links() {
        for session in sessions {
            links.link_session(program, session);
        }
    }
    Snapshot::from_entities(1, entities).with_links(links)
}

/// Serves one page of records for `object_type`.
#[allow(dead_code)]
pub async fn mount_objects(server: &MockServer, object_type: &str, records: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path(format!("/crm/v3/objects/{object_type}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": records })))
        .mount(server)
        .await;
}

/// Mounts all three object endpoints with the reference records.
#[allow(dead_code)]
pub async fn mount_reference_objects(server: &MockServer) {
    mount_objects(server, "partners", partner_records()).await;
    mount_objects(server, "programs", program_records()).await;
    mount_objects(server, "sessions", session_records()).await;
}

/// Answers program → `to_type` batch reads from `links`, echoing only the
/// ids each request asks for.
#[allow(dead_code)]
pub async fn mount_associations(
    server: &MockServer,
    to_type: &str,
    links: Vec<(&'static str, Vec<&'static str>)>,
) {
    let links: HashMap<String, Vec<String>> = links
        .into_iter()
        .map(|(from, to)| (from.to_string(), to.into_iter().map(String::from).collect()))
        .collect();

    Mock::given(method("POST"))
        .and(path(format!("/crm/v4/associations/programs/{to_type}/batch/read")))
        .respond_with(move |request: &Request| {
            let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
            let results: Vec<Value> = body["inputs"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|input| input["id"].as_str())
                .filter_map(|id| {
                    links.get(id).map(|to| {
                        json!({
                            "from": { "id": id },
                            "to": to.iter().map(|t| json!({ "toObjectId": t })).collect::<Vec<_>>()
                        })
                    })
                })
                .collect();
            ResponseTemplate::new(200).set_body_json(json!({ "results": results }))
        })
        .mount(server)
        .await;
}

#[allow(dead_code)]
pub fn upstream_config(server: &MockServer) -> UpstreamConfig {
    UpstreamConfig {
        base_url: server.uri(),
        ..Default::default()
    }
}

/// A store pointed at `server` with no artificial delays.
#[allow(dead_code)]
pub fn store(server: &MockServer, schema: Arc<SchemaRegistry>, settings: CacheSettings) -> CacheStore {
    let client = CrmClient::new(&upstream_config(server)).expect("client");
    let policy = AssociationPolicy::default()
        .with_batch_size(2)
        .with_max_retries(1)
        .without_delays();
    CacheStore::new(schema, client, policy, settings)
}
