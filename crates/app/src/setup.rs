use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

use domainlink_core::{
    hostname::{apex_form, www_form},
    CanonicalPreference, TenantDomainRecord, TransitionError,
};
use domainlink_provider::{DomainProvider, ProviderDomain, ProviderError};
use domainlink_util::MonitoringConfig;

use crate::notify::Notifier;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::Clock;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("custom domain {0} is already active")]
    AlreadyActive(String),
    #[error("provider request failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("failed to schedule monitoring: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl SetupError {
    /// Eligibility failures are raised before anything is touched.
    pub fn is_eligibility(&self) -> bool {
        matches!(self, Self::InvalidConfiguration(_) | Self::AlreadyActive(_))
    }
}

/// Successful setup summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupSummary {
    pub registered: Vec<String>,
    pub message: String,
}

/// Registers a tenant's hostname with the provider and arms monitoring.
#[derive(Clone)]
pub struct SetupOrchestrator {
    provider: Arc<dyn DomainProvider>,
    scheduler: Arc<dyn Scheduler>,
    notifier: Arc<dyn Notifier>,
    monitoring: MonitoringConfig,
    clock: Clock,
}

impl SetupOrchestrator {
    pub fn new(
        provider: Arc<dyn DomainProvider>,
        scheduler: Arc<dyn Scheduler>,
        notifier: Arc<dyn Notifier>,
        monitoring: MonitoringConfig,
        clock: Clock,
    ) -> Self {
        Self {
            provider,
            scheduler,
            notifier,
            monitoring,
            clock,
        }
    }

    /// Points `record` at `hostname` and runs setup. Failures after
    /// validation undo what this call registered and restore the record:
    /// a first setup reverts to subdomain hosting, a re-setup of an already
    /// registered domain returns to its previous state.
    pub async fn start_setup(
        &self,
        record: &mut TenantDomainRecord,
        hostname: String,
        preference: CanonicalPreference,
    ) -> Result<SetupSummary, SetupError> {
        if let Err(err) = validate(record, &hostname) {
            counter!("domain_setup_total", "result" => "rejected").increment(1);
            warn!(stage = "setup", record_id = %record.id, %hostname, error = %err, "setup rejected");
            return Err(err);
        }

        let before = record.clone();
        record.begin_setup(hostname, preference, (self.clock)());

        let mut progress = Progress::default();
        match self.register_and_arm(record, &mut progress).await {
            Ok(summary) => {
                counter!("domain_setup_total", "result" => "success").increment(1);
                info!(
                    stage = "setup",
                    record_id = %record.id,
                    hostname = %record.hostname,
                    canonical = record.canonical_preference.as_str(),
                    "custom domain setup started"
                );
                Ok(summary)
            }
            Err(err) => {
                counter!("domain_setup_total", "result" => "failed").increment(1);
                warn!(
                    stage = "setup",
                    record_id = %record.id,
                    hostname = %record.hostname,
                    error = %err,
                    "setup failed, rolling back"
                );
                self.rollback(record, before, &progress.added).await;
                Err(err)
            }
        }
    }

    async fn register_and_arm(
        &self,
        record: &mut TenantDomainRecord,
        progress: &mut Progress,
    ) -> Result<SetupSummary, SetupError> {
        let canonical = record.canonical_domain();

        let primary = match self.provider.find_by_name(&canonical).await? {
            Some(existing) => {
                info!(stage = "setup", record_id = %record.id, domain = %canonical, "domain already registered with provider");
                existing
            }
            None => {
                let added = self.provider.add(&canonical).await?;
                progress.added.push(added.clone());
                added
            }
        };
        progress.registered.push(primary.name.clone());
        record.mark_provider_registered((self.clock)());

        self.try_verify(&record.id, &primary).await;

        // the provider adds the www redirect itself when the apex is primary
        if record.canonical_preference == CanonicalPreference::Apex {
            let companion = www_form(&canonical);
            match self.provider.find_by_name(&companion).await {
                Ok(Some(found)) => {
                    progress.registered.push(found.name.clone());
                    tokio::time::sleep(self.monitoring.companion_verify_delay).await;
                    self.try_verify(&record.id, &found).await;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(stage = "setup", record_id = %record.id, domain = %companion, error = %err, "companion lookup failed");
                }
            }
        }

        let now = (self.clock)();
        record.mark_pending(now)?;

        let owner = record.owner();
        self.notifier.setup_instructions(record, &owner).await;
        record.setup_notification_sent_at = Some(now);

        record.start_monitoring(now)?;
        self.scheduler
            .schedule_after(self.monitoring.first_check_delay, &record.id)?;

        Ok(SetupSummary {
            registered: progress.registered.clone(),
            message: format!(
                "Setup started for {canonical}; first verification in {}s",
                self.monitoring.first_check_delay.as_secs()
            ),
        })
    }

    async fn try_verify(&self, record_id: &str, domain: &ProviderDomain) {
        match self.provider.verify(&domain.id).await {
            Ok(outcome) => {
                info!(stage = "setup", %record_id, domain = %domain.name, verified = outcome.verified, "initial provider verification");
            }
            Err(err) => {
                warn!(stage = "setup", %record_id, domain = %domain.name, error = %err, "initial provider verification failed");
            }
        }
    }

    /// Removes the provider domains this setup added and restores `record`.
    /// Domains that were registered before the setup are left alone.
    /// Provider failures are logged and swallowed.
    async fn rollback(
        &self,
        record: &mut TenantDomainRecord,
        before: TenantDomainRecord,
        added: &[ProviderDomain],
    ) {
        let now = (self.clock)();
        if before.provider_domain_registered {
            *record = before;
            record.updated_at = now;
        } else {
            record.revert_to_subdomain(now);
        }

        for domain in added {
            match self.provider.remove(&domain.id).await {
                Ok(removed) => {
                    info!(stage = "setup", record_id = %record.id, domain = %domain.name, removed, "rolled back provider domain");
                }
                Err(err) => {
                    warn!(stage = "setup", record_id = %record.id, domain = %domain.name, error = %err, "rollback removal failed");
                }
            }
        }
    }
}

/// Provider side effects of one setup call.
#[derive(Debug, Default)]
struct Progress {
    registered: Vec<String>,
    added: Vec<ProviderDomain>,
}

fn validate(record: &TenantDomainRecord, hostname: &str) -> Result<(), SetupError> {
    if !record.custom_domains_enabled {
        return Err(SetupError::InvalidConfiguration(
            "custom domains are not enabled for this tenant".to_string(),
        ));
    }
    if record.is_active() {
        return Err(SetupError::AlreadyActive(record.hostname.clone()));
    }
    if hostname.trim().is_empty() || hostname == record.subdomain {
        return Err(SetupError::InvalidConfiguration(
            "no custom hostname configured".to_string(),
        ));
    }
    if record.provider_domain_registered && apex_form(&record.hostname) != apex_form(hostname) {
        return Err(SetupError::InvalidConfiguration(format!(
            "{} is still registered with the provider; remove it before setting up {hostname}",
            record.hostname
        )));
    }
    Ok(())
}
