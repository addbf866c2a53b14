//! DNS and HTTP probes used by the monitoring cycle.

pub mod dns;
pub mod http;

use thiserror::Error;

pub use dns::{DnsLookup, DnsProbe, DualCheck, DualRecordVerifier, HickoryLookup, RecordCheck};
pub use http::{FetchOutcome, HealthCheck, HealthReport, HttpHealthProbe, Protocol};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("DNS lookup failed: {0}")]
    Lookup(String),
    #[error("resolver configuration error: {0}")]
    Resolver(String),
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}
