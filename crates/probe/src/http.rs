use std::{error::Error as _, time::Duration};

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, CONNECTION, LOCATION},
    redirect::Policy,
    Client, StatusCode,
};
use serde::Serialize;
use tracing::{debug, instrument};
use url::Url;

use crate::ProbeError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_REDIRECTS: u32 = 3;
const USER_AGENT: &str = "domainlink-health/0.1";

/// Error fragments that mark a failed TLS handshake or an unusable certificate.
const TLS_MARKERS: &[&str] = &[
    "certificate",
    "tls",
    "ssl",
    "handshake",
    "unknownissuer",
    "notvalidforname",
    "alert",
];

/// Error fragments that mark a hostname that did not resolve.
const RESOLUTION_MARKERS: &[&str] = &[
    "dns error",
    "failed to lookup address",
    "name or service not known",
    "no such host",
    "nodename nor servname",
    "name resolution",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Https,
    Http,
}

/// Result of probing a domain over HTTPS with HTTP fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub status_code: Option<u16>,
    pub protocol_used: Option<Protocol>,
    pub ssl_ready: bool,
    pub final_url: Option<String>,
    pub redirect_count: u32,
    pub error: Option<String>,
    /// Plain HTTP answers but the certificate has not propagated yet.
    pub propagation_retry_needed: bool,
}

impl HealthReport {
    fn unhealthy(error: String) -> Self {
        Self {
            healthy: false,
            status_code: None,
            protocol_used: None,
            ssl_ready: false,
            final_url: None,
            redirect_count: 0,
            error: Some(error),
            propagation_retry_needed: false,
        }
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check_health(&self, domain: &str) -> HealthReport;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Tls,
    Timeout,
    Connect,
    Other,
}

/// What a single GET chain ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Response {
        status: u16,
        final_url: String,
        redirects: u32,
    },
    Failed {
        kind: FailureKind,
        message: String,
        redirects: u32,
    },
}

impl FetchOutcome {
    fn is_tls_failure(&self) -> bool {
        matches!(
            self,
            FetchOutcome::Failed {
                kind: FailureKind::Tls,
                ..
            }
        )
    }

    fn describe(&self) -> String {
        match self {
            FetchOutcome::Response { status, .. } => format!("status {status}"),
            FetchOutcome::Failed { message, .. } => message.clone(),
        }
    }
}

/// HTTP reachability probe. Redirects are followed by hand so the chain length is observable.
#[derive(Clone)]
pub struct HttpHealthProbe {
    client: Client,
    max_redirects: u32,
}

impl HttpHealthProbe {
    pub fn new() -> Result<Self, ProbeError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, ProbeError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/html,*/*"));
        headers.insert(CONNECTION, HeaderValue::from_static("close"));

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .redirect(Policy::none())
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|err| ProbeError::Client(err.to_string()))?;

        Ok(Self {
            client,
            max_redirects: MAX_REDIRECTS,
        })
    }

    /// GETs `url`, following at most three redirects. A chain that is still
    /// redirecting after that ends with the last 3xx response.
    pub async fn fetch(&self, url: Url) -> FetchOutcome {
        let mut current = url;
        let mut redirects = 0;

        loop {
            let response = match self.client.get(current.clone()).send().await {
                Ok(response) => response,
                Err(err) => {
                    let kind = classify(&err);
                    return FetchOutcome::Failed {
                        kind,
                        message: error_chain(&err),
                        redirects,
                    };
                }
            };

            let status = response.status();
            if status.is_redirection() && redirects < self.max_redirects {
                let next = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|location| current.join(location).ok());
                if let Some(next) = next {
                    debug!(stage = "probe", from = %current, to = %next, "following redirect");
                    current = next;
                    redirects += 1;
                    continue;
                }
            }

            return FetchOutcome::Response {
                status: status.as_u16(),
                final_url: current.to_string(),
                redirects,
            };
        }
    }

    async fn check_urls(&self, https: Url, http: Url) -> HealthReport {
        let secure = self.fetch(https).await;
        let fallback = if secure.is_tls_failure() {
            Some(self.fetch(http).await)
        } else {
            None
        };
        assess(secure, fallback)
    }
}

#[async_trait]
impl HealthCheck for HttpHealthProbe {
    #[instrument(skip(self))]
    async fn check_health(&self, domain: &str) -> HealthReport {
        let https = Url::parse(&format!("https://{domain}/"));
        let http = Url::parse(&format!("http://{domain}/"));
        match (https, http) {
            (Ok(https), Ok(http)) => self.check_urls(https, http).await,
            (Err(err), _) | (_, Err(err)) => {
                HealthReport::unhealthy(format!("invalid domain {domain}: {err}"))
            }
        }
    }
}

/// Folds the HTTPS attempt and the optional plain HTTP fallback into a report.
pub fn assess(https: FetchOutcome, http: Option<FetchOutcome>) -> HealthReport {
    match https {
        FetchOutcome::Response {
            status,
            final_url,
            redirects,
        } => {
            let healthy = status == StatusCode::OK.as_u16();
            HealthReport {
                healthy,
                status_code: Some(status),
                protocol_used: Some(Protocol::Https),
                ssl_ready: true,
                final_url: Some(final_url),
                redirect_count: redirects,
                error: (!healthy).then(|| format!("HTTPS returned status {status}")),
                propagation_retry_needed: false,
            }
        }
        FetchOutcome::Failed {
            kind: FailureKind::Tls,
            message,
            ..
        } => match http {
            Some(FetchOutcome::Response {
                status,
                final_url,
                redirects,
            }) if status == StatusCode::OK.as_u16() => HealthReport {
                healthy: true,
                status_code: Some(status),
                protocol_used: Some(Protocol::Http),
                ssl_ready: false,
                final_url: Some(final_url),
                redirect_count: redirects,
                error: Some(format!("HTTPS unavailable: {message}")),
                propagation_retry_needed: false,
            },
            Some(ref fallback) if looks_like_https_redirect(fallback) => {
                let (status_code, redirect_count) = match fallback {
                    FetchOutcome::Response {
                        status, redirects, ..
                    } => (Some(*status), *redirects),
                    FetchOutcome::Failed { redirects, .. } => (None, *redirects),
                };
                HealthReport {
                    healthy: true,
                    status_code,
                    protocol_used: Some(Protocol::Http),
                    ssl_ready: false,
                    final_url: None,
                    redirect_count,
                    error: Some("SSL certificate propagating, HTTP redirects to HTTPS".to_string()),
                    propagation_retry_needed: true,
                }
            }
            Some(fallback) => HealthReport::unhealthy(format!(
                "HTTPS: {message}; HTTP: {}",
                fallback.describe()
            )),
            None => HealthReport::unhealthy(format!("HTTPS: {message}")),
        },
        FetchOutcome::Failed { message, .. } => HealthReport::unhealthy(message),
    }
}

fn looks_like_https_redirect(outcome: &FetchOutcome) -> bool {
    match outcome {
        FetchOutcome::Response { status, .. } => (300..400).contains(status),
        FetchOutcome::Failed { kind, .. } => *kind == FailureKind::Tls,
    }
}

fn classify(err: &reqwest::Error) -> FailureKind {
    if err.is_timeout() {
        return FailureKind::Timeout;
    }
    // reqwest's own message embeds the URL, so only the sources are inspected
    let causes = cause_chain(err);
    if is_resolution_message(&causes) {
        return FailureKind::Connect;
    }
    if has_invalid_data_source(err) || is_tls_message(&causes) {
        return FailureKind::Tls;
    }
    if err.is_connect() {
        FailureKind::Connect
    } else {
        FailureKind::Other
    }
}

pub fn is_tls_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TLS_MARKERS.iter().any(|marker| lowered.contains(marker))
}

pub fn is_resolution_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    RESOLUTION_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// rustls surfaces handshake failures as `InvalidData` I/O errors.
fn has_invalid_data_source(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::InvalidData {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

fn cause_chain(err: &reqwest::Error) -> String {
    let mut causes = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }
    causes.join(": ")
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
