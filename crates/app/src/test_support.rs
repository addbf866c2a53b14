//! Hand-written fakes for the collaborator seams.

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;

use domainlink_core::{CanonicalPreference, Owner, TenantDomainRecord};
use domainlink_probe::{
    DnsLookup, DnsProbe, HealthCheck, HealthReport, Protocol, ProbeError,
};
use domainlink_provider::{DomainProvider, ProviderDomain, ProviderError, VerifyOutcome};
use domainlink_util::DnsConfig;

use crate::notify::Notifier;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::Clock;

pub const CNAME_TARGET: &str = "provider.example.net";

pub fn now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn fixed_clock() -> Clock {
    Arc::new(now)
}

pub fn healthy() -> HealthReport {
    HealthReport {
        healthy: true,
        status_code: Some(200),
        protocol_used: Some(Protocol::Https),
        ssl_ready: true,
        final_url: Some("https://example.com/".into()),
        redirect_count: 0,
        error: None,
        propagation_retry_needed: false,
    }
}

pub fn unhealthy() -> HealthReport {
    HealthReport {
        healthy: false,
        status_code: None,
        protocol_used: None,
        ssl_ready: false,
        final_url: None,
        redirect_count: 0,
        error: Some("connection refused".into()),
        propagation_retry_needed: false,
    }
}

/// Entitled record for `tenant-1` still on the platform subdomain.
pub fn subdomain_record() -> TenantDomainRecord {
    let mut record = TenantDomainRecord::new("rec-1", "tenant-1", "tenant-1.platform.test", now());
    record.custom_domains_enabled = true;
    record.owner_email = Some("owner@tenant-1.test".into());
    record
}

pub fn monitoring_record(hostname: &str) -> TenantDomainRecord {
    let mut record = subdomain_record();
    record.begin_setup(hostname.to_string(), CanonicalPreference::Apex, now());
    record.mark_provider_registered(now());
    record.mark_pending(now()).unwrap();
    record.start_monitoring(now()).unwrap();
    record
}

pub fn dns_config() -> DnsConfig {
    DnsConfig {
        cname_target: CNAME_TARGET.into(),
        apex_ip: Ipv4Addr::new(216, 24, 57, 1),
        lenient: false,
        platform_name: "storefront".into(),
    }
}

#[derive(Default)]
pub struct StaticLookup {
    cnames: HashMap<String, String>,
}

#[async_trait]
impl DnsLookup for StaticLookup {
    async fn cname(&self, name: &str) -> Result<Option<String>, ProbeError> {
        Ok(self.cnames.get(name).cloned())
    }

    async fn ipv4(&self, _name: &str) -> Result<Vec<Ipv4Addr>, ProbeError> {
        Ok(Vec::new())
    }
}

/// DNS probe whose resolver points `domain` at the provider when `ok`.
pub fn probe_for(domain: &str, ok: bool) -> DnsProbe {
    let mut lookup = StaticLookup::default();
    if ok {
        lookup.cnames.insert(domain.to_string(), CNAME_TARGET.to_string());
    }
    DnsProbe::new(Arc::new(lookup), &dns_config())
}

/// In-memory provider that logs every call.
#[derive(Default)]
pub struct FakeProvider {
    domains: Mutex<Vec<ProviderDomain>>,
    calls: Mutex<Vec<String>>,
    verified: AtomicBool,
    fail_all: AtomicBool,
    fail_remove: AtomicBool,
}

impl FakeProvider {
    pub fn with_verified(verified: bool) -> Self {
        let provider = Self::default();
        provider.verified.store(verified, Ordering::SeqCst);
        provider
    }

    pub fn seed(&self, name: &str) {
        self.domains.lock().unwrap().push(ProviderDomain {
            id: format!("dom-{name}"),
            name: name.to_string(),
            verified: false,
        });
    }

    pub fn fail_all(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    pub fn fail_remove(&self) {
        self.fail_remove.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.domains
            .lock()
            .unwrap()
            .iter()
            .map(|domain| domain.name.clone())
            .collect()
    }

    fn log(&self, call: String) -> Result<(), ProviderError> {
        self.calls.lock().unwrap().push(call);
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(ProviderError::Api {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "upstream unavailable".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DomainProvider for FakeProvider {
    async fn add(&self, name: &str) -> Result<ProviderDomain, ProviderError> {
        self.log(format!("add:{name}"))?;
        let domain = ProviderDomain {
            id: format!("dom-{name}"),
            name: name.to_string(),
            verified: false,
        };
        self.domains.lock().unwrap().push(domain.clone());
        Ok(domain)
    }

    async fn verify(&self, id: &str) -> Result<VerifyOutcome, ProviderError> {
        self.log(format!("verify:{id}"))?;
        Ok(VerifyOutcome {
            verified: self.verified.load(Ordering::SeqCst),
        })
    }

    async fn list(&self) -> Result<Vec<ProviderDomain>, ProviderError> {
        self.log("list".into())?;
        Ok(self.domains.lock().unwrap().clone())
    }

    async fn remove(&self, id: &str) -> Result<bool, ProviderError> {
        self.log(format!("remove:{id}"))?;
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(ProviderError::Api {
                status: StatusCode::BAD_GATEWAY,
                message: "remove failed".into(),
            });
        }
        let mut domains = self.domains.lock().unwrap();
        let before = domains.len();
        domains.retain(|domain| domain.id != id);
        Ok(domains.len() != before)
    }
}

pub struct StaticHealth(pub HealthReport);

#[async_trait]
impl HealthCheck for StaticHealth {
    async fn check_health(&self, _domain: &str) -> HealthReport {
        self.0.clone()
    }
}

/// Health check that never answers within a cycle.
pub struct SlowHealth(pub Duration);

#[async_trait]
impl HealthCheck for SlowHealth {
    async fn check_health(&self, _domain: &str) -> HealthReport {
        tokio::time::sleep(self.0).await;
        healthy()
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(&'static str, String, Owner)>>,
}

impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().unwrap().iter().map(|(kind, _, _)| *kind).collect()
    }

    pub fn owners(&self) -> Vec<Owner> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, owner)| owner.clone())
            .collect()
    }

    fn push(&self, kind: &'static str, record: &TenantDomainRecord, owner: &Owner) {
        self.sent
            .lock()
            .unwrap()
            .push((kind, record.id.clone(), owner.clone()));
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn setup_instructions(&self, record: &TenantDomainRecord, owner: &Owner) {
        self.push("setup_instructions", record, owner);
    }

    async fn activation_success(&self, record: &TenantDomainRecord, owner: &Owner) {
        self.push("activation_success", record, owner);
    }

    async fn timeout(&self, record: &TenantDomainRecord, owner: &Owner) {
        self.push("timeout", record, owner);
    }

    async fn monitoring_restarted(&self, record: &TenantDomainRecord, owner: &Owner) {
        self.push("monitoring_restarted", record, owner);
    }

    async fn domain_removed(&self, record: &TenantDomainRecord, owner: &Owner) {
        self.push("domain_removed", record, owner);
    }
}

/// Scheduler that only remembers what it was asked to do.
#[derive(Default)]
pub struct RecordingScheduler {
    scheduled: Mutex<Vec<(Duration, String)>>,
    closed: AtomicBool,
}

impl RecordingScheduler {
    pub fn closed() -> Self {
        let scheduler = Self::default();
        scheduler.closed.store(true, Ordering::SeqCst);
        scheduler
    }

    pub fn scheduled(&self) -> Vec<(Duration, String)> {
        self.scheduled.lock().unwrap().clone()
    }
}

impl Scheduler for RecordingScheduler {
    fn schedule_after(&self, delay: Duration, record_id: &str) -> Result<(), SchedulerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Closed);
        }
        self.scheduled
            .lock()
            .unwrap()
            .push((delay, record_id.to_string()));
        Ok(())
    }
}
