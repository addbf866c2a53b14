use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use domainlink_core::{
    normalize_hostname, CanonicalPreference, HostnameError, TenantDomainRecord, TransitionError,
};
use domainlink_probe::{DnsProbe, DualCheck, DualRecordVerifier, HealthCheck};
use domainlink_provider::DomainProvider;
use domainlink_storage::{TenantDomainError, TenantDomainRepository};
use domainlink_util::MonitoringConfig;

use crate::monitor::{CycleReport, MonitorError, MonitoringCoordinator};
use crate::notify::Notifier;
use crate::removal::RemovalOrchestrator;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::setup::SetupOrchestrator;
use crate::Clock;

/// External seams the service is wired to.
pub struct Collaborators {
    pub provider: Arc<dyn DomainProvider>,
    pub health: Arc<dyn HealthCheck>,
    pub notifier: Arc<dyn Notifier>,
    pub scheduler: Arc<dyn Scheduler>,
    pub dns: DnsProbe,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionRequest {
    pub tenant_id: String,
    pub subdomain: String,
    #[serde(default)]
    pub owner_email: Option<String>,
    #[serde(default)]
    pub custom_domains_enabled: bool,
}

/// Record plus values derived for display.
#[derive(Debug, Clone, Serialize)]
pub struct DomainView {
    #[serde(flatten)]
    pub record: TenantDomainRecord,
    pub canonical_domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_seconds_remaining: Option<u64>,
}

/// `{success, record_id, hostname, message?, error?}` returned by every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResponse {
    pub success: bool,
    pub record_id: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationResponse {
    fn ok(record: &TenantDomainRecord, message: impl Into<String>) -> Self {
        Self {
            success: true,
            record_id: record.id.clone(),
            hostname: record.hostname.clone(),
            message: Some(message.into()),
            error: None,
        }
    }

    fn failed(record_id: &str, hostname: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            record_id: record_id.to_string(),
            hostname: hostname.to_string(),
            message: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("domain record {0} not found")]
    NotFound(String),
    #[error("tenant already has a domain record")]
    Duplicate,
    #[error("invalid hostname: {0}")]
    InvalidHostname(#[from] HostnameError),
    #[error("domain record {0} has no custom domain")]
    NoCustomDomain(String),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("storage error: {0}")]
    Storage(#[from] TenantDomainError),
}

/// Serialises every mutation of a record behind that record's lock and
/// persists the result.
#[derive(Clone)]
pub struct DomainService {
    repo: TenantDomainRepository,
    setup: SetupOrchestrator,
    removal: RemovalOrchestrator,
    monitor: MonitoringCoordinator,
    verifier: DualRecordVerifier,
    scheduler: Arc<dyn Scheduler>,
    monitoring: MonitoringConfig,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    clock: Clock,
}

impl DomainService {
    pub fn new(
        repo: TenantDomainRepository,
        collaborators: Collaborators,
        monitoring: MonitoringConfig,
        clock: Clock,
    ) -> Self {
        let Collaborators {
            provider,
            health,
            notifier,
            scheduler,
            dns,
        } = collaborators;

        Self {
            setup: SetupOrchestrator::new(
                provider.clone(),
                scheduler.clone(),
                notifier.clone(),
                monitoring,
                clock.clone(),
            ),
            removal: RemovalOrchestrator::new(provider.clone(), notifier.clone(), clock.clone()),
            monitor: MonitoringCoordinator::new(
                dns.clone(),
                provider,
                health,
                notifier,
                clock.clone(),
            ),
            verifier: DualRecordVerifier::new(dns),
            repo,
            scheduler,
            monitoring,
            locks: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Creates the record a tenant starts with, serving from its subdomain.
    pub async fn provision(
        &self,
        request: ProvisionRequest,
    ) -> Result<TenantDomainRecord, ServiceError> {
        let subdomain = normalize_hostname(&request.subdomain)?;
        if self
            .repo
            .fetch_by_tenant(&request.tenant_id)
            .await?
            .is_some()
        {
            return Err(ServiceError::Duplicate);
        }
        let mut record = TenantDomainRecord::new(
            Uuid::new_v4().to_string(),
            request.tenant_id,
            subdomain,
            (self.clock)(),
        );
        record.owner_email = request.owner_email.filter(|email| !email.trim().is_empty());
        record.custom_domains_enabled = request.custom_domains_enabled;

        match self.repo.insert(&record).await {
            Ok(()) => {}
            Err(TenantDomainError::Duplicate) => return Err(ServiceError::Duplicate),
            Err(err) => return Err(err.into()),
        }
        info!(stage = "app", record_id = %record.id, tenant_id = %record.tenant_id, "tenant domain record provisioned");
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<DomainView, ServiceError> {
        let record = self.load(id).await?;
        Ok(DomainView {
            canonical_domain: record.canonical_domain(),
            estimated_seconds_remaining: record
                .estimated_time_remaining(self.monitoring.check_interval)
                .map(|remaining| remaining.as_secs()),
            record,
        })
    }

    /// Live apex and `www` DNS status, used to render setup instructions.
    pub async fn dns_status(&self, id: &str) -> Result<DualCheck, ServiceError> {
        let record = self.load(id).await?;
        if record.hostname == record.subdomain {
            return Err(ServiceError::NoCustomDomain(record.id));
        }
        Ok(self.verifier.verify_both(&record.hostname).await)
    }

    pub async fn setup(
        &self,
        id: &str,
        hostname: &str,
        preference: CanonicalPreference,
    ) -> Result<OperationResponse, ServiceError> {
        let hostname = normalize_hostname(hostname)?;
        let _guard = self.lock(id).await;
        let mut record = self.load(id).await?;

        match self
            .setup
            .start_setup(&mut record, hostname.clone(), preference)
            .await
        {
            Ok(summary) => {
                self.repo.save(&record).await?;
                Ok(OperationResponse::ok(&record, summary.message))
            }
            Err(err) => {
                if !err.is_eligibility() {
                    self.repo.save(&record).await?;
                }
                Ok(OperationResponse::failed(id, &hostname, err.to_string()))
            }
        }
    }

    /// Entry point for the scheduler. Returns `None` when the cycle was dropped.
    pub async fn run_scheduled_cycle(&self, id: &str) -> Result<Option<CycleReport>, ServiceError> {
        let _guard = self.lock(id).await;
        let Some(mut record) = self.repo.fetch(id).await? else {
            debug!(stage = "monitor", record_id = %id, "scheduled cycle for unknown record dropped");
            return Ok(None);
        };

        let report = match self
            .monitor
            .run_cycle_within(&mut record, self.monitoring.cycle_timeout)
            .await
        {
            Ok(report) => report,
            Err(MonitorError::State(reason)) => {
                info!(stage = "monitor", record_id = %id, %reason, "scheduled cycle dropped");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        self.repo.save(&record).await?;

        if report.should_continue {
            if let Err(err) = self
                .scheduler
                .schedule_after(self.monitoring.check_interval, id)
            {
                error!(stage = "monitor", record_id = %id, error = %err, "failed to re-arm monitoring");
            }
        }
        Ok(Some(report))
    }

    pub async fn restart(&self, id: &str) -> Result<OperationResponse, ServiceError> {
        let _guard = self.lock(id).await;
        let mut record = self.load(id).await?;
        self.monitor.restart(&mut record).await?;
        self.arm(&record).await?;
        Ok(OperationResponse::ok(&record, "monitoring restarted"))
    }

    pub async fn enable(&self, id: &str) -> Result<OperationResponse, ServiceError> {
        let _guard = self.lock(id).await;
        let mut record = self.load(id).await?;
        self.monitor.enable(&mut record).await?;
        self.arm(&record).await?;
        Ok(OperationResponse::ok(&record, "custom domain re-enabled"))
    }

    pub async fn disable(&self, id: &str) -> Result<OperationResponse, ServiceError> {
        let _guard = self.lock(id).await;
        let mut record = self.load(id).await?;
        self.removal.disable_domain(&mut record)?;
        self.repo.save(&record).await?;
        Ok(OperationResponse::ok(&record, "custom domain disabled"))
    }

    pub async fn remove(&self, id: &str) -> Result<OperationResponse, ServiceError> {
        let _guard = self.lock(id).await;
        let mut record = self.load(id).await?;
        let summary = self.removal.remove_domain(&mut record).await;
        self.repo.save(&record).await?;

        let mut message = format!("reverted to {}", summary.reverted_to);
        if !summary.provider_failures.is_empty() {
            message.push_str(&format!(
                "; provider cleanup failed for {}",
                summary.provider_failures.join(", ")
            ));
        }
        Ok(OperationResponse::ok(&record, message))
    }

    /// Schedules a first cycle for every record whose monitoring survived a restart.
    pub async fn rearm_monitoring(&self) -> Result<usize, ServiceError> {
        let records = self.repo.list_monitoring().await?;
        for record in &records {
            self.scheduler
                .schedule_after(self.monitoring.first_check_delay, &record.id)?;
        }
        info!(stage = "monitor", count = records.len(), "monitoring re-armed");
        Ok(records.len())
    }

    /// Runs scheduled cycles as record ids arrive. Cycles for different
    /// records run concurrently.
    pub fn spawn_dispatcher(self, mut rx: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(record_id) = rx.recv().await {
                let service = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = service.run_scheduled_cycle(&record_id).await {
                        error!(stage = "monitor", %record_id, error = %err, "scheduled cycle failed");
                        if let Err(err) = service
                            .scheduler
                            .schedule_after(service.monitoring.check_interval, &record_id)
                        {
                            warn!(stage = "monitor", %record_id, error = %err, "failed to re-arm after error");
                        }
                    }
                });
            }
            debug!(stage = "monitor", "dispatcher stopped");
        })
    }

    async fn arm(&self, record: &TenantDomainRecord) -> Result<(), ServiceError> {
        self.repo.save(record).await?;
        self.scheduler
            .schedule_after(self.monitoring.first_check_delay, &record.id)?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<TenantDomainRecord, ServiceError> {
        self.repo
            .fetch(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(id.to_string()).or_default().clone()
        };
        entry.lock_owned().await
    }
}
