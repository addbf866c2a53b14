use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use async_trait::async_trait;
use hickory_resolver::{
    error::ResolveErrorKind, proto::rr::RecordType, system_conf::read_system_conf,
    TokioAsyncResolver,
};
use serde::Serialize;
use tracing::{debug, instrument};

use domainlink_core::hostname::{apex_form, www_form};
use domainlink_util::DnsConfig;

use crate::ProbeError;

/// Default timeout for DNS queries.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Record lookups the probes depend on.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// First CNAME target for `name`, `None` when the name has no CNAME.
    async fn cname(&self, name: &str) -> Result<Option<String>, ProbeError>;

    /// IPv4 addresses for `name`; empty when no A record exists.
    async fn ipv4(&self, name: &str) -> Result<Vec<Ipv4Addr>, ProbeError>;
}

/// [`DnsLookup`] backed by the system configured nameservers.
#[derive(Clone)]
pub struct HickoryLookup {
    resolver: TokioAsyncResolver,
}

impl HickoryLookup {
    pub fn from_system_conf() -> Result<Self, ProbeError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, ProbeError> {
        let (config, mut opts) =
            read_system_conf().map_err(|err| ProbeError::Resolver(err.to_string()))?;
        opts.timeout = timeout;
        opts.attempts = 2;
        // every cycle re-probes from scratch
        opts.cache_size = 0;

        Ok(Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        })
    }
}

#[async_trait]
impl DnsLookup for HickoryLookup {
    async fn cname(&self, name: &str) -> Result<Option<String>, ProbeError> {
        match self.resolver.lookup(name, RecordType::CNAME).await {
            Ok(lookup) => Ok(lookup
                .record_iter()
                .filter_map(|record| record.data().and_then(|data| data.as_cname()))
                .map(|cname| normalize_target(&cname.to_string()))
                .next()),
            Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(None),
            Err(err) => Err(ProbeError::Lookup(format!("CNAME {name}: {err}"))),
        }
    }

    async fn ipv4(&self, name: &str) -> Result<Vec<Ipv4Addr>, ProbeError> {
        match self.resolver.ipv4_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .filter_map(|addr| addr.to_string().parse().ok())
                .collect()),
            Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                Ok(Vec::new())
            }
            Err(err) => Err(ProbeError::Lookup(format!("A {name}: {err}"))),
        }
    }
}

/// Outcome of checking one record against the provider's expected target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordCheck {
    pub verified: bool,
    pub target: Option<String>,
    pub expected_target: String,
    pub error: Option<String>,
}

impl RecordCheck {
    fn failed(expected_target: String, error: String) -> Self {
        Self {
            verified: false,
            target: None,
            expected_target,
            error: Some(error),
        }
    }
}

/// Checks that a tenant domain points at the provider.
#[derive(Clone)]
pub struct DnsProbe {
    lookup: Arc<dyn DnsLookup>,
    expected_target: String,
    apex_ip: Ipv4Addr,
    lenient_markers: Vec<String>,
}

impl DnsProbe {
    pub fn new(lookup: Arc<dyn DnsLookup>, config: &DnsConfig) -> Self {
        Self {
            lookup,
            expected_target: normalize_target(&config.cname_target),
            apex_ip: config.apex_ip,
            lenient_markers: if config.lenient {
                config.lenient_markers()
            } else {
                Vec::new()
            },
        }
    }

    /// Returns the first CNAME target, trailing dot stripped. Lookup failures read as `None`.
    pub async fn resolve_cname(&self, domain: &str) -> Option<String> {
        match self.lookup.cname(domain).await {
            Ok(target) => target,
            Err(err) => {
                debug!(stage = "probe", domain, error = %err, "CNAME resolution failed");
                None
            }
        }
    }

    /// Verifies the CNAME of `domain`, falling back to the apex A record when
    /// the name carries no CNAME.
    #[instrument(skip(self), fields(expected = %self.expected_target))]
    pub async fn verify_cname(&self, domain: &str) -> RecordCheck {
        let target = match self.lookup.cname(domain).await {
            Ok(target) => target,
            Err(err) => return RecordCheck::failed(self.expected_target.clone(), err.to_string()),
        };

        match target {
            Some(target) => {
                let verified = self.target_matches(&target);
                debug!(stage = "probe", domain, %target, verified, "CNAME resolved");
                RecordCheck {
                    verified,
                    error: (!verified).then(|| {
                        format!(
                            "CNAME points to {target}, expected {}",
                            self.expected_target
                        )
                    }),
                    target: Some(target),
                    expected_target: self.expected_target.clone(),
                }
            }
            None => {
                let apex = self.verify_apex(domain).await;
                if apex.verified {
                    return apex;
                }
                RecordCheck {
                    verified: false,
                    target: None,
                    expected_target: self.expected_target.clone(),
                    error: Some("No CNAME record found".to_string()),
                }
            }
        }
    }

    /// Verifies that the bare domain's A records include the provider's anycast IP.
    pub async fn verify_apex(&self, domain: &str) -> RecordCheck {
        let expected = self.apex_ip.to_string();
        let addresses = match self.lookup.ipv4(domain).await {
            Ok(addresses) => addresses,
            Err(err) => return RecordCheck::failed(expected, err.to_string()),
        };

        let verified = addresses.contains(&self.apex_ip);
        let target = if verified {
            Some(expected.clone())
        } else {
            addresses.first().map(Ipv4Addr::to_string)
        };
        let error = match (&target, verified) {
            (_, true) => None,
            (None, false) => Some("No A record found".to_string()),
            (Some(found), false) => Some(format!("A record points to {found}, expected {expected}")),
        };

        debug!(stage = "probe", domain, verified, records = addresses.len(), "A records resolved");
        RecordCheck {
            verified,
            target,
            expected_target: expected,
            error,
        }
    }

    fn target_matches(&self, target: &str) -> bool {
        if target.eq_ignore_ascii_case(&self.expected_target) {
            return true;
        }
        let lowered = target.to_ascii_lowercase();
        self.lenient_markers
            .iter()
            .any(|marker| lowered.contains(marker.as_str()))
    }
}

/// Apex and `www` results for one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DualCheck {
    pub overall_verified: bool,
    pub apex: RecordCheck,
    pub www: RecordCheck,
}

/// Checks both the apex (A record) and `www` (CNAME) forms of a domain.
#[derive(Clone)]
pub struct DualRecordVerifier {
    probe: DnsProbe,
}

impl DualRecordVerifier {
    pub fn new(probe: DnsProbe) -> Self {
        Self { probe }
    }

    pub async fn verify_both(&self, domain: &str) -> DualCheck {
        let apex = self.probe.verify_apex(apex_form(domain)).await;
        let www = self.probe.verify_cname(&www_form(domain)).await;
        DualCheck {
            overall_verified: apex.verified && www.verified,
            apex,
            www,
        }
    }
}

fn normalize_target(target: &str) -> String {
    target.trim_end_matches('.').to_ascii_lowercase()
}
