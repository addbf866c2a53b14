use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hostname::{apex_form, www_form};

/// Number of monitoring cycles after which a pending domain times out.
pub const MAX_CHECK_ATTEMPTS: u32 = 12;

/// Hosting status of a tenant's storefront domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    SubdomainActive,
    CnamePending,
    CnameMonitoring,
    CnameActive,
    CnameTimeout,
    Disabled,
}

impl DomainStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SubdomainActive => "subdomain_active",
            Self::CnamePending => "cname_pending",
            Self::CnameMonitoring => "cname_monitoring",
            Self::CnameActive => "cname_active",
            Self::CnameTimeout => "cname_timeout",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "subdomain_active" => Ok(Self::SubdomainActive),
            "cname_pending" => Ok(Self::CnamePending),
            "cname_monitoring" => Ok(Self::CnameMonitoring),
            "cname_active" => Ok(Self::CnameActive),
            "cname_timeout" => Ok(Self::CnameTimeout),
            "disabled" => Ok(Self::Disabled),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Which form of the domain is registered as primary with the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalPreference {
    #[default]
    Apex,
    Www,
}

impl CanonicalPreference {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apex => "apex",
            Self::Www => "www",
        }
    }
}

impl FromStr for CanonicalPreference {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "apex" => Ok(Self::Apex),
            "www" => Ok(Self::Www),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Raised when a persisted enum value cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);

/// Identity that receives notifications about a tenant domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Owner {
    pub tenant_id: String,
    pub email: Option<String>,
}

/// Persistent custom domain state for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantDomainRecord {
    pub id: String,
    pub tenant_id: String,
    /// Platform host the storefront falls back to.
    pub subdomain: String,
    pub hostname: String,
    pub status: DomainStatus,
    pub monitoring_active: bool,
    pub check_attempts: u32,
    pub provider_domain_registered: bool,
    pub canonical_preference: CanonicalPreference,
    pub custom_domains_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_notification_sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitoring_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TenantDomainRecord {
    /// Creates a record serving from the platform subdomain.
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        subdomain: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let subdomain = subdomain.into();
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            hostname: subdomain.clone(),
            subdomain,
            status: DomainStatus::SubdomainActive,
            monitoring_active: false,
            check_attempts: 0,
            provider_domain_registered: false,
            canonical_preference: CanonicalPreference::Apex,
            custom_domains_enabled: false,
            owner_email: None,
            last_status_reason: None,
            setup_notification_sent_at: None,
            monitoring_started_at: None,
            last_checked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn owner(&self) -> Owner {
        Owner {
            tenant_id: self.tenant_id.clone(),
            email: self.owner_email.clone(),
        }
    }

    /// Hostname without the `www.` label.
    pub fn apex_domain(&self) -> &str {
        apex_form(&self.hostname)
    }

    pub fn www_domain(&self) -> String {
        www_form(&self.hostname)
    }

    /// The form registered as primary with the provider.
    pub fn canonical_domain(&self) -> String {
        match self.canonical_preference {
            CanonicalPreference::Apex => self.apex_domain().to_string(),
            CanonicalPreference::Www => self.www_domain(),
        }
    }

    /// Both forms of the domain, apex first.
    pub fn domain_forms(&self) -> [String; 2] {
        [self.apex_domain().to_string(), self.www_domain()]
    }

    pub fn is_active(&self) -> bool {
        self.status == DomainStatus::CnameActive
    }

    /// Whether a monitoring cycle may run against this record.
    pub fn can_run_cycle(&self) -> Result<(), TransitionError> {
        if !self.monitoring_active {
            return Err(TransitionError::MonitoringInactive);
        }
        if self.status != DomainStatus::CnameMonitoring {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: DomainStatus::CnameMonitoring,
            });
        }
        if self.check_attempts >= MAX_CHECK_ATTEMPTS {
            return Err(TransitionError::AttemptsExhausted(self.check_attempts));
        }
        if !self.provider_domain_registered {
            return Err(TransitionError::ProviderNotRegistered);
        }
        Ok(())
    }

    /// Records the requested hostname and canonical form ahead of provider registration.
    pub fn begin_setup(
        &mut self,
        hostname: String,
        preference: CanonicalPreference,
        now: DateTime<Utc>,
    ) {
        self.hostname = hostname;
        self.canonical_preference = preference;
        self.touch(now);
    }

    pub fn mark_provider_registered(&mut self, now: DateTime<Utc>) {
        self.provider_domain_registered = true;
        self.touch(now);
    }

    /// Moves the record into `cname_pending` with a fresh attempt budget.
    pub fn mark_pending(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status == DomainStatus::CnameActive {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: DomainStatus::CnamePending,
            });
        }
        self.status = DomainStatus::CnamePending;
        self.monitoring_active = false;
        self.check_attempts = 0;
        self.last_status_reason = Some("waiting for DNS configuration".to_string());
        self.touch(now);
        Ok(())
    }

    /// First arm of the monitoring loop after setup.
    pub fn start_monitoring(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != DomainStatus::CnamePending {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: DomainStatus::CnameMonitoring,
            });
        }
        self.enter_monitoring(now)
    }

    /// Explicit restart from `cname_monitoring` or `cname_timeout`.
    pub fn restart_monitoring(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !matches!(
            self.status,
            DomainStatus::CnameMonitoring | DomainStatus::CnameTimeout
        ) {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: DomainStatus::CnameMonitoring,
            });
        }
        self.enter_monitoring(now)
    }

    /// Re-enables a disabled record whose provider registration was preserved.
    pub fn enable(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != DomainStatus::Disabled {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: DomainStatus::CnameMonitoring,
            });
        }
        self.enter_monitoring(now)
    }

    fn enter_monitoring(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.provider_domain_registered {
            return Err(TransitionError::ProviderNotRegistered);
        }
        self.status = DomainStatus::CnameMonitoring;
        self.monitoring_active = true;
        self.check_attempts = 0;
        self.monitoring_started_at = Some(now);
        self.touch(now);
        Ok(())
    }

    /// Counts one monitoring cycle.
    pub fn record_attempt(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.check_attempts = self.check_attempts.saturating_add(1);
        self.last_status_reason = Some(reason.into());
        self.last_checked_at = Some(now);
        self.touch(now);
    }

    pub fn activate(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.finish_monitoring(DomainStatus::CnameActive, now)
    }

    pub fn time_out(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.finish_monitoring(DomainStatus::CnameTimeout, now)
    }

    fn finish_monitoring(
        &mut self,
        to: DomainStatus,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status != DomainStatus::CnameMonitoring {
            return Err(TransitionError::Illegal {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.monitoring_active = false;
        self.touch(now);
        Ok(())
    }

    /// Clears the monitoring flag. A record left in `cname_monitoring` stays
    /// there until restarted.
    pub fn stop_monitoring(&mut self, now: DateTime<Utc>) {
        if self.monitoring_active {
            self.monitoring_active = false;
            self.touch(now);
        }
    }

    /// Turns the custom domain off while keeping the provider registration.
    pub fn disable(&mut self, now: DateTime<Utc>) {
        self.status = DomainStatus::Disabled;
        self.monitoring_active = false;
        self.last_status_reason = Some("custom domain disabled".to_string());
        self.touch(now);
    }

    /// Returns the record to platform subdomain hosting, clearing every
    /// custom domain field.
    pub fn revert_to_subdomain(&mut self, now: DateTime<Utc>) {
        self.status = DomainStatus::SubdomainActive;
        self.hostname = self.subdomain.clone();
        self.monitoring_active = false;
        self.check_attempts = 0;
        self.provider_domain_registered = false;
        self.canonical_preference = CanonicalPreference::Apex;
        self.last_status_reason = None;
        self.setup_notification_sent_at = None;
        self.monitoring_started_at = None;
        self.last_checked_at = None;
        self.touch(now);
    }

    /// Remaining monitoring time assuming cycles continue at `interval`.
    pub fn estimated_time_remaining(&self, interval: Duration) -> Option<Duration> {
        if self.status != DomainStatus::CnameMonitoring {
            return None;
        }
        let remaining = MAX_CHECK_ATTEMPTS.saturating_sub(self.check_attempts);
        Some(interval * remaining)
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// Rejected record state changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot move domain from {from} to {to}")]
    Illegal { from: DomainStatus, to: DomainStatus },
    #[error("monitoring is not active")]
    MonitoringInactive,
    #[error("check attempts exhausted ({0})")]
    AttemptsExhausted(u32),
    #[error("domain is not registered with the provider")]
    ProviderNotRegistered,
}
