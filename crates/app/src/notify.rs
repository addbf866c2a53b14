use async_trait::async_trait;
use tracing::info;

use domainlink_core::types::{Owner, TenantDomainRecord};

/// Outbound tenant notifications. Delivery is fire-and-forget.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn setup_instructions(&self, record: &TenantDomainRecord, owner: &Owner);

    async fn activation_success(&self, record: &TenantDomainRecord, owner: &Owner);

    async fn timeout(&self, record: &TenantDomainRecord, owner: &Owner);

    async fn monitoring_restarted(&self, record: &TenantDomainRecord, owner: &Owner);

    async fn domain_removed(&self, record: &TenantDomainRecord, owner: &Owner);
}

/// Notifier that only writes structured log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotifier;

impl LoggingNotifier {
    fn emit(kind: &'static str, record: &TenantDomainRecord, owner: &Owner) {
        info!(
            stage = "notify",
            kind,
            record_id = %record.id,
            tenant_id = %owner.tenant_id,
            email = owner.email.as_deref().unwrap_or("-"),
            hostname = %record.hostname,
            status = %record.status,
            "tenant notification"
        );
    }
}

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn setup_instructions(&self, record: &TenantDomainRecord, owner: &Owner) {
        Self::emit("setup_instructions", record, owner);
    }

    async fn activation_success(&self, record: &TenantDomainRecord, owner: &Owner) {
        Self::emit("activation_success", record, owner);
    }

    async fn timeout(&self, record: &TenantDomainRecord, owner: &Owner) {
        Self::emit("timeout", record, owner);
    }

    async fn monitoring_restarted(&self, record: &TenantDomainRecord, owner: &Owner) {
        Self::emit("monitoring_restarted", record, owner);
    }

    async fn domain_removed(&self, record: &TenantDomainRecord, owner: &Owner) {
        Self::emit("domain_removed", record, owner);
    }
}
