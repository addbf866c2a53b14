use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

use domainlink_core::{DomainStatus, TenantDomainRecord, TransitionError};
use domainlink_provider::DomainProvider;

use crate::notify::Notifier;
use crate::Clock;

/// Outcome of removing a custom domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalSummary {
    pub success: bool,
    pub reverted_to: String,
    pub removed: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub provider_failures: Vec<String>,
}

/// Tears custom domains down, fully or reversibly.
#[derive(Clone)]
pub struct RemovalOrchestrator {
    provider: Arc<dyn DomainProvider>,
    notifier: Arc<dyn Notifier>,
    clock: Clock,
}

impl RemovalOrchestrator {
    pub fn new(provider: Arc<dyn DomainProvider>, notifier: Arc<dyn Notifier>, clock: Clock) -> Self {
        Self {
            provider,
            notifier,
            clock,
        }
    }

    /// Removes both domain forms from the provider and reverts the record to
    /// its platform subdomain. Each provider form fails independently.
    pub async fn remove_domain(&self, record: &mut TenantDomainRecord) -> RemovalSummary {
        record.stop_monitoring((self.clock)());

        let mut removed = Vec::new();
        let mut provider_failures = Vec::new();
        if record.hostname != record.subdomain {
            for name in record.domain_forms() {
                match self.remove_form(&record.id, &name).await {
                    Ok(true) => removed.push(name),
                    Ok(false) => {}
                    Err(message) => provider_failures.push(format!("{name}: {message}")),
                }
            }
        }

        let owner = record.owner();
        let hostname = record.hostname.clone();
        record.revert_to_subdomain((self.clock)());
        counter!("domain_removal_total", "kind" => "remove").increment(1);
        info!(
            stage = "removal",
            record_id = %record.id,
            %hostname,
            reverted_to = %record.subdomain,
            removed = removed.len(),
            failures = provider_failures.len(),
            "custom domain removed"
        );

        self.notifier.domain_removed(record, &owner).await;

        RemovalSummary {
            success: true,
            reverted_to: record.subdomain.clone(),
            removed,
            provider_failures,
        }
    }

    async fn remove_form(&self, record_id: &str, name: &str) -> Result<bool, String> {
        let found = match self.provider.find_by_name(name).await {
            Ok(Some(found)) => found,
            Ok(None) => return Ok(false),
            Err(err) => {
                warn!(stage = "removal", %record_id, domain = %name, error = %err, "provider lookup failed");
                return Err(err.to_string());
            }
        };

        match self.provider.remove(&found.id).await {
            Ok(removed) => Ok(removed),
            Err(err) => {
                warn!(stage = "removal", %record_id, domain = %name, error = %err, "provider removal failed");
                Err(err.to_string())
            }
        }
    }

    /// Stops monitoring and parks the record in `disabled`, keeping the
    /// hostname and provider registration for a later re-enable.
    pub fn disable_domain(&self, record: &mut TenantDomainRecord) -> Result<(), TransitionError> {
        if record.status == DomainStatus::SubdomainActive {
            return Err(TransitionError::Illegal {
                from: record.status,
                to: DomainStatus::Disabled,
            });
        }

        record.disable((self.clock)());
        counter!("domain_removal_total", "kind" => "disable").increment(1);
        info!(stage = "removal", record_id = %record.id, hostname = %record.hostname, "custom domain disabled");
        Ok(())
    }
}
