//! Upstream CRM access.
//!
//! - **[`objects`]**: paginated bulk reads of Partner/Program/Session records.
//! - **[`associations`]**: batched, rate-limited relationship reads.
//! - **[`normalize`]**: raw property bags → schema-typed entities.
//!
//! Every call carries a caller-supplied bearer credential; nothing here
//! stores one.

pub mod associations;
pub mod normalize;
pub mod objects;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::model::EntityKind;

pub use associations::{AssociationFetcher, AssociationPolicy, BatchLinks, LinkReport};
pub use objects::ObjectFetcher;

/// Environment variable holding the bearer token.
pub const TOKEN_ENV: &str = "PPSEARCH_TOKEN";

/// Bearer credential for the CRM. `Debug` never prints the token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Reads [`TOKEN_ENV`]; blank values count as absent.
    pub fn from_env() -> Option<Self> {
        std::env::var(TOKEN_ENV)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(Self::bearer)
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("upstream returned HTTP {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Upstream object type identifiers per entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectTypes {
    pub partner: String,
    pub program: String,
    pub session: String,
}

impl Default for ObjectTypes {
    fn default() -> Self {
        Self {
            partner: "partners".into(),
            program: "programs".into(),
            session: "sessions".into(),
        }
    }
}

impl ObjectTypes {
    pub fn for_kind(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Partner => &self.partner,
            EntityKind::Program => &self.program,
            EntityKind::Session => &self.session,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Records requested per object page.
    pub page_size: usize,
    pub timeout_secs: u64,
    pub object_types: ObjectTypes,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.hubapi.com".into(),
            page_size: 100,
            timeout_secs: 30,
            object_types: ObjectTypes::default(),
        }
    }
}

/// A record exactly as the CRM returned it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
}

/// Accepts ids encoded as JSON strings or numbers.
pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

/// Thin HTTP wrapper shared by both fetchers. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CrmClient {
    http: reqwest::Client,
    base_url: String,
    page_size: usize,
    object_types: ObjectTypes,
}

impl CrmClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(UpstreamError::Client)?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_size: config.page_size.max(1),
            object_types: config.object_types.clone(),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn object_type(&self, kind: EntityKind) -> &str {
        self.object_types.for_kind(kind)
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET and decode; any non-success status is an error.
    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        creds: &Credentials,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, UpstreamError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(creds.token())
            .query(query)
            .send()
            .await
            .map_err(|source| UpstreamError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body: truncate_body(&body),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|source| UpstreamError::Decode {
                url: url.to_string(),
                source,
            })
    }

    /// POST a JSON body; status handling is left to the caller.
    pub(crate) async fn post_json<B: Serialize + ?Sized>(
        &self,
        creds: &Credentials,
        url: &str,
        body: &B,
    ) -> Result<reqwest::Response, UpstreamError> {
        self.http
            .post(url)
            .bearer_auth(creds.token())
            .json(body)
            .send()
            .await
            .map_err(|source| UpstreamError::Transport {
                url: url.to_string(),
                source,
            })
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 300;
    if body.chars().count() <= MAX {
        return body.to_string();
    }
    let mut out: String = body.chars().take(MAX).collect();
    out.push_str("...");
    out
}
