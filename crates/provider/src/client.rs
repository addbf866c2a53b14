use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use domainlink_util::ProviderConfig;

use crate::retry::{parse_retry_after, RetryPolicy};

const LIST_LIMIT: &str = "100";

/// Custom domain as known to the upstream provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderDomain {
    pub id: String,
    pub name: String,
    pub verified: bool,
}

/// Result of asking the provider to (re)verify a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerifyOutcome {
    pub verified: bool,
}

/// Custom domain operations exposed by a hosting provider.
#[async_trait]
pub trait DomainProvider: Send + Sync {
    async fn add(&self, name: &str) -> Result<ProviderDomain, ProviderError>;

    async fn verify(&self, id: &str) -> Result<VerifyOutcome, ProviderError>;

    async fn list(&self) -> Result<Vec<ProviderDomain>, ProviderError>;

    /// Returns `false` when the provider no longer knows the domain.
    async fn remove(&self, id: &str) -> Result<bool, ProviderError>;

    /// Linear scan over one `list` page.
    async fn find_by_name(&self, name: &str) -> Result<Option<ProviderDomain>, ProviderError> {
        let domains = self.list().await?;
        Ok(domains
            .into_iter()
            .find(|domain| domain.name.eq_ignore_ascii_case(name)))
    }
}

/// REST client for the provider's `/services/{id}/custom-domains` API.
#[derive(Clone)]
pub struct ProviderClient {
    http: Client,
    base_url: Url,
    api_key: String,
    service_id: String,
    retry: RetryPolicy,
}

impl ProviderClient {
    /// Creates a client, failing fast when credentials are missing.
    pub fn new(config: &ProviderConfig, http: Client) -> Result<Self, ProviderError> {
        if config.api_key.trim().is_empty() {
            return Err(ProviderError::Configuration(
                "provider API key is missing".to_string(),
            ));
        }
        if config.service_id.trim().is_empty() {
            return Err(ProviderError::Configuration(
                "provider service id is missing".to_string(),
            ));
        }

        let base_url = Url::parse(&config.base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(ProviderError::Configuration(format!(
                "provider base url cannot carry paths: {}",
                config.base_url
            )));
        }

        Ok(Self {
            http,
            base_url,
            api_key: config.api_key.clone(),
            service_id: config.service_id.clone(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, extra: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["services", self.service_id.as_str(), "custom-domains"])
                .extend(extra);
        }
        url
    }

    /// Sends a request, retrying `429` responses according to the retry policy.
    async fn send<F>(&self, op: &'static str, build: F) -> Result<Response, ProviderError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            counter!("provider_requests_total", "op" => op).increment(1);
            let response = build().bearer_auth(&self.api_key).send().await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            let retry_after = parse_retry_after(response.headers(), Utc::now());
            if attempt >= self.retry.max_retries {
                counter!("provider_rate_limited_total", "op" => op).increment(1);
                warn!(
                    stage = "provider",
                    op,
                    attempts = attempt + 1,
                    "provider rate limit persisted after retries"
                );
                return Err(ProviderError::RateLimited {
                    attempts: attempt + 1,
                    retry_after,
                });
            }

            let delay = self.retry.delay_for(attempt, retry_after);
            debug!(
                stage = "provider",
                op,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                honored_retry_after = retry_after.is_some(),
                "provider rate limited, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl DomainProvider for ProviderClient {
    async fn add(&self, name: &str) -> Result<ProviderDomain, ProviderError> {
        let url = self.endpoint(&[]);
        let body = serde_json::json!({ "name": name });
        let response = self
            .send("add", || self.http.request(Method::POST, url.clone()).json(&body))
            .await?;

        let payload = parse_json::<Value>(response).await?;
        let domains = domains_from_value(payload)?;
        domains
            .iter()
            .find(|domain| domain.name.eq_ignore_ascii_case(name))
            .or_else(|| domains.first())
            .cloned()
            .ok_or_else(|| ProviderError::UnexpectedPayload("add returned no domains".to_string()))
    }

    async fn verify(&self, id: &str) -> Result<VerifyOutcome, ProviderError> {
        let url = self.endpoint(&[id, "verify"]);
        let response = self
            .send("verify", || self.http.request(Method::POST, url.clone()))
            .await?;

        let body = read_success_body(response).await?;
        if body.trim().is_empty() {
            return Ok(VerifyOutcome { verified: false });
        }
        let value: Value = serde_json::from_str(&body)?;
        let verified = domains_from_value(value)?
            .first()
            .map(|domain| domain.verified)
            .unwrap_or(false);
        Ok(VerifyOutcome { verified })
    }

    async fn list(&self) -> Result<Vec<ProviderDomain>, ProviderError> {
        let mut url = self.endpoint(&[]);
        url.query_pairs_mut().append_pair("limit", LIST_LIMIT);
        let response = self
            .send("list", || self.http.request(Method::GET, url.clone()))
            .await?;

        let payload = parse_json::<Value>(response).await?;
        domains_from_value(payload)
    }

    async fn remove(&self, id: &str) -> Result<bool, ProviderError> {
        let url = self.endpoint(&[id]);
        let response = self
            .send("remove", || self.http.request(Method::DELETE, url.clone()))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        read_success_body(response).await?;
        Ok(true)
    }
}

/// Wire shape of a custom domain. The provider nests list entries under
/// `customDomain` and reports verification either as a flag or a status string.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDomain {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    verified: Option<bool>,
    #[serde(default)]
    verification_status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Wrapped {
        #[serde(rename = "customDomain")]
        custom_domain: RawDomain,
    },
    Bare(RawDomain),
}

impl From<RawEntry> for ProviderDomain {
    fn from(entry: RawEntry) -> Self {
        let raw = match entry {
            RawEntry::Wrapped { custom_domain } => custom_domain,
            RawEntry::Bare(raw) => raw,
        };
        let verified = raw.verified.unwrap_or(false)
            || raw
                .verification_status
                .as_deref()
                .is_some_and(|status| status.eq_ignore_ascii_case("verified"));
        Self {
            id: raw.id,
            name: raw.name.to_ascii_lowercase(),
            verified,
        }
    }
}

fn domains_from_value(value: Value) -> Result<Vec<ProviderDomain>, ProviderError> {
    let entries: Vec<RawEntry> = match value {
        Value::Array(_) => serde_json::from_value(value)?,
        Value::Object(_) => vec![serde_json::from_value(value)?],
        other => {
            return Err(ProviderError::UnexpectedPayload(format!(
                "expected object or array, got {other}"
            )))
        }
    };
    Ok(entries.into_iter().map(ProviderDomain::from).collect())
}

/// Errors produced by provider calls.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider configuration error: {0}")]
    Configuration(String),
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider api error {status}: {message}")]
    Api { status: StatusCode, message: String },
    #[error("provider rate limit exceeded after {attempts} attempts")]
    RateLimited {
        attempts: u32,
        retry_after: Option<std::time::Duration>,
    },
    #[error("failed to decode provider response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected provider response: {0}")]
    UnexpectedPayload(String),
}

impl ProviderError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

async fn read_success_body(response: Response) -> Result<String, ProviderError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<unavailable>"));
    if !status.is_success() {
        return Err(ProviderError::Api {
            status,
            message: error_message(&body).unwrap_or(body),
        });
    }
    Ok(body)
}

async fn parse_json<T>(response: Response) -> Result<T, ProviderError>
where
    T: serde::de::DeserializeOwned,
{
    let body = read_success_body(response).await?;
    Ok(serde_json::from_str(&body)?)
}

/// Extracts the provider's `message`/`error` field from an error body.
fn error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["message", "error"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .map(str::to_string)
}
