use std::{sync::Arc, time::Duration};

use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use domainlink_core::{
    policy::REASON_MAX_ATTEMPTS, PolicyDecision, TenantDomainRecord, TransitionError,
    VerificationPolicy, VerificationSignals,
};
use domainlink_probe::{DnsProbe, HealthCheck, HealthReport, RecordCheck};
use domainlink_provider::DomainProvider;

use crate::notify::Notifier;
use crate::Clock;

const REASON_CYCLE_EXPIRED: &str = "verification cycle timed out";

/// Raw probe results of one cycle, before they touch the record.
#[derive(Debug, Clone)]
struct Observation {
    dns: RecordCheck,
    provider_verified: bool,
    health: HealthReport,
    expired: bool,
}

/// Where a cycle left the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    Activated,
    TimedOut,
    Pending,
}

impl CycleOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Activated => "activated",
            Self::TimedOut => "timeout",
            Self::Pending => "pending",
        }
    }
}

/// What one monitoring cycle saw and decided.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub record_id: String,
    pub domain: String,
    pub attempts: u32,
    pub verified: bool,
    pub should_continue: bool,
    pub reason: String,
    pub signals: VerificationSignals,
    pub dns: RecordCheck,
    pub health: HealthReport,
    pub timed_out: bool,
}

#[derive(Debug, Error)]
pub enum MonitorError {
    /// The record is not in a state that allows a cycle to run.
    #[error("monitoring precondition failed: {0}")]
    State(TransitionError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Drives the `cname_monitoring` state machine one cycle at a time.
#[derive(Clone)]
pub struct MonitoringCoordinator {
    dns: DnsProbe,
    provider: Arc<dyn DomainProvider>,
    health: Arc<dyn HealthCheck>,
    notifier: Arc<dyn Notifier>,
    policy: VerificationPolicy,
    clock: Clock,
}

impl MonitoringCoordinator {
    pub fn new(
        dns: DnsProbe,
        provider: Arc<dyn DomainProvider>,
        health: Arc<dyn HealthCheck>,
        notifier: Arc<dyn Notifier>,
        clock: Clock,
    ) -> Self {
        Self {
            dns,
            provider,
            health,
            notifier,
            policy: VerificationPolicy::default(),
            clock,
        }
    }

    /// Runs one verification cycle and applies its outcome to `record`.
    ///
    /// `check_attempts` grows by exactly one per successful call. A failed
    /// precondition leaves the record untouched.
    pub async fn run_cycle(
        &self,
        record: &mut TenantDomainRecord,
    ) -> Result<CycleReport, MonitorError> {
        record.can_run_cycle().map_err(MonitorError::State)?;
        let observation = self.observe(record).await;
        self.apply(record, observation).await
    }

    /// Same as [`run_cycle`](Self::run_cycle) but gives up on the probes after
    /// `limit`. An expired cycle still counts as an attempt.
    pub async fn run_cycle_within(
        &self,
        record: &mut TenantDomainRecord,
        limit: Duration,
    ) -> Result<CycleReport, MonitorError> {
        record.can_run_cycle().map_err(MonitorError::State)?;
        let observation = match timeout(limit, self.observe(record)).await {
            Ok(observation) => observation,
            Err(_) => {
                warn!(
                    stage = "monitor",
                    record_id = %record.id,
                    limit_secs = limit.as_secs(),
                    "monitoring cycle exceeded its time limit"
                );
                Observation::expired()
            }
        };
        self.apply(record, observation).await
    }

    /// Re-enters monitoring from `cname_monitoring` or `cname_timeout` with a fresh budget.
    pub async fn restart(&self, record: &mut TenantDomainRecord) -> Result<(), MonitorError> {
        record.restart_monitoring((self.clock)())?;
        info!(stage = "monitor", record_id = %record.id, hostname = %record.hostname, "monitoring restarted");
        let owner = record.owner();
        self.notifier.monitoring_restarted(record, &owner).await;
        Ok(())
    }

    /// Re-enables a disabled record and resumes monitoring.
    pub async fn enable(&self, record: &mut TenantDomainRecord) -> Result<(), MonitorError> {
        record.enable((self.clock)())?;
        info!(stage = "monitor", record_id = %record.id, hostname = %record.hostname, "custom domain re-enabled");
        let owner = record.owner();
        self.notifier.monitoring_restarted(record, &owner).await;
        Ok(())
    }

    async fn observe(&self, record: &TenantDomainRecord) -> Observation {
        let domain = record.canonical_domain();

        let dns = self.dns.verify_cname(&domain).await;
        let provider_verified = self.provider_verified(&record.id, &domain).await;

        let started = Instant::now();
        let health = self.health.check_health(&domain).await;
        histogram!("probe_http_seconds").record(started.elapsed().as_secs_f64());

        Observation {
            dns,
            provider_verified,
            health,
            expired: false,
        }
    }

    async fn provider_verified(&self, record_id: &str, domain: &str) -> bool {
        let found = match self.provider.find_by_name(domain).await {
            Ok(Some(found)) => found,
            Ok(None) => {
                warn!(stage = "monitor", %record_id, %domain, "domain missing at provider");
                return false;
            }
            Err(err) => {
                warn!(stage = "monitor", %record_id, %domain, error = %err, "provider lookup failed");
                return false;
            }
        };

        match self.provider.verify(&found.id).await {
            Ok(outcome) => outcome.verified,
            Err(err) => {
                warn!(stage = "monitor", %record_id, %domain, error = %err, "provider verify failed");
                false
            }
        }
    }

    async fn apply(
        &self,
        record: &mut TenantDomainRecord,
        observation: Observation,
    ) -> Result<CycleReport, MonitorError> {
        let now = (self.clock)();
        let signals = VerificationSignals {
            dns_verified: observation.dns.verified,
            provider_verified: observation.provider_verified,
            http_healthy: observation.health.healthy,
            ssl_ready: observation.health.ssl_ready,
        };
        let decision = self.policy.decide(signals, record.check_attempts);
        let reason = cycle_reason(&decision, observation.expired);

        record.record_attempt(reason, now);

        let outcome = if decision.verified {
            record.activate(now)?;
            CycleOutcome::Activated
        } else if decision.is_timeout() {
            record.time_out(now)?;
            CycleOutcome::TimedOut
        } else {
            CycleOutcome::Pending
        };
        counter!("domain_monitor_cycles_total", "outcome" => outcome.as_str()).increment(1);

        info!(
            stage = "monitor",
            record_id = %record.id,
            hostname = %record.hostname,
            attempts = record.check_attempts,
            dns = signals.dns_verified,
            provider = signals.provider_verified,
            http = signals.http_healthy,
            ssl = signals.ssl_ready,
            expired = observation.expired,
            outcome = outcome.as_str(),
            reason,
            "monitoring cycle finished"
        );

        let owner = record.owner();
        match outcome {
            CycleOutcome::Activated => self.notifier.activation_success(record, &owner).await,
            CycleOutcome::TimedOut => self.notifier.timeout(record, &owner).await,
            CycleOutcome::Pending => {}
        }

        Ok(CycleReport {
            record_id: record.id.clone(),
            domain: record.canonical_domain(),
            attempts: record.check_attempts,
            verified: decision.verified,
            should_continue: decision.should_continue,
            reason: reason.to_string(),
            signals,
            dns: observation.dns,
            health: observation.health,
            timed_out: observation.expired,
        })
    }
}

impl Observation {
    fn expired() -> Self {
        let error = Some(REASON_CYCLE_EXPIRED.to_string());
        Self {
            dns: RecordCheck {
                verified: false,
                target: None,
                expected_target: String::new(),
                error: error.clone(),
            },
            provider_verified: false,
            health: HealthReport {
                healthy: false,
                status_code: None,
                protocol_used: None,
                ssl_ready: false,
                final_url: None,
                redirect_count: 0,
                error,
                propagation_retry_needed: false,
            },
            expired: true,
        }
    }
}

fn cycle_reason(decision: &PolicyDecision, expired: bool) -> &'static str {
    if expired && decision.reason != REASON_MAX_ATTEMPTS {
        REASON_CYCLE_EXPIRED
    } else {
        decision.reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domainlink_core::{DomainStatus, MAX_CHECK_ATTEMPTS};

    use crate::test_support::{
        fixed_clock, healthy, monitoring_record, probe_for, unhealthy, FakeProvider,
        RecordingNotifier, SlowHealth, StaticHealth,
    };

    struct Harness {
        coordinator: MonitoringCoordinator,
        provider: Arc<FakeProvider>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness(cname_ok: bool, provider_verified: bool, health: HealthReport) -> Harness {
        let provider = Arc::new(FakeProvider::with_verified(provider_verified));
        provider.seed("example.com");
        let notifier = Arc::new(RecordingNotifier::default());
        let coordinator = MonitoringCoordinator::new(
            probe_for("example.com", cname_ok),
            provider.clone(),
            Arc::new(StaticHealth(health)),
            notifier.clone(),
            fixed_clock(),
        );
        Harness {
            coordinator,
            provider,
            notifier,
        }
    }

    #[tokio::test]
    async fn all_signals_activate_the_domain() {
        let h = harness(true, true, healthy());
        let mut record = monitoring_record("example.com");

        let report = h.coordinator.run_cycle(&mut record).await.unwrap();

        assert!(report.verified);
        assert_eq!(record.status, DomainStatus::CnameActive);
        assert!(!record.monitoring_active);
        assert_eq!(record.check_attempts, 1);
        assert_eq!(h.notifier.kinds(), vec!["activation_success"]);
    }

    #[tokio::test]
    async fn http_without_certificate_keeps_monitoring() {
        let mut health = healthy();
        health.ssl_ready = false;
        let h = harness(true, true, health);
        let mut record = monitoring_record("example.com");

        let report = h.coordinator.run_cycle(&mut record).await.unwrap();

        assert!(!report.verified);
        assert!(report.should_continue);
        assert_eq!(report.reason, "certificate provisioning in progress");
        assert_eq!(record.status, DomainStatus::CnameMonitoring);
        assert!(record.monitoring_active);
        assert!(h.notifier.kinds().is_empty());
    }

    #[tokio::test]
    async fn each_cycle_adds_exactly_one_attempt() {
        let h = harness(false, false, unhealthy());
        let mut record = monitoring_record("example.com");

        for expected in 1..=5 {
            let before = record.check_attempts;
            h.coordinator.run_cycle(&mut record).await.unwrap();
            assert_eq!(record.check_attempts, before + 1);
            assert_eq!(record.check_attempts, expected);
        }
    }

    #[tokio::test]
    async fn twelve_failed_cycles_time_out() {
        let h = harness(true, false, healthy());
        let mut record = monitoring_record("example.com");

        for _ in 0..MAX_CHECK_ATTEMPTS {
            h.coordinator.run_cycle(&mut record).await.unwrap();
        }

        assert_eq!(record.status, DomainStatus::CnameTimeout);
        assert!(!record.monitoring_active);
        assert_eq!(record.check_attempts, MAX_CHECK_ATTEMPTS);
        assert_eq!(
            record.last_status_reason.as_deref(),
            Some("maximum attempts reached")
        );
        assert_eq!(h.notifier.kinds(), vec!["timeout"]);

        let err = h.coordinator.run_cycle(&mut record).await.unwrap_err();
        assert!(matches!(err, MonitorError::State(_)));
        assert_eq!(record.check_attempts, MAX_CHECK_ATTEMPTS);
    }

    #[tokio::test]
    async fn precondition_failure_leaves_record_untouched() {
        let h = harness(true, true, healthy());
        let mut record = monitoring_record("example.com");
        record.stop_monitoring(record.updated_at);
        let before = record.clone();

        let err = h.coordinator.run_cycle(&mut record).await.unwrap_err();

        assert!(matches!(
            err,
            MonitorError::State(TransitionError::MonitoringInactive)
        ));
        assert_eq!(record, before);
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn unregistered_record_cannot_cycle() {
        let h = harness(true, true, healthy());
        let mut record = monitoring_record("example.com");
        record.provider_domain_registered = false;

        let err = h.coordinator.run_cycle(&mut record).await.unwrap_err();
        assert!(matches!(
            err,
            MonitorError::State(TransitionError::ProviderNotRegistered)
        ));
        assert_eq!(record.check_attempts, 0);
    }

    #[tokio::test]
    async fn provider_is_looked_up_then_verified() {
        let h = harness(true, true, healthy());
        let mut record = monitoring_record("example.com");

        h.coordinator.run_cycle(&mut record).await.unwrap();

        assert_eq!(h.provider.calls(), vec!["list", "verify:dom-example.com"]);
    }

    #[tokio::test]
    async fn provider_failures_read_as_unverified() {
        let h = harness(true, true, healthy());
        h.provider.fail_all();
        let mut record = monitoring_record("example.com");

        let report = h.coordinator.run_cycle(&mut record).await.unwrap();

        assert!(!report.signals.provider_verified);
        assert!(report.should_continue);
        assert_eq!(record.check_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_cycle_still_counts_the_attempt() {
        let provider = Arc::new(FakeProvider::with_verified(true));
        provider.seed("example.com");
        let notifier = Arc::new(RecordingNotifier::default());
        let coordinator = MonitoringCoordinator::new(
            probe_for("example.com", true),
            provider,
            Arc::new(SlowHealth(Duration::from_secs(600))),
            notifier.clone(),
            fixed_clock(),
        );
        let mut record = monitoring_record("example.com");

        let report = coordinator
            .run_cycle_within(&mut record, Duration::from_secs(90))
            .await
            .unwrap();

        assert!(report.timed_out);
        assert!(report.should_continue);
        assert_eq!(record.check_attempts, 1);
        assert_eq!(
            record.last_status_reason.as_deref(),
            Some("verification cycle timed out")
        );

        record.check_attempts = MAX_CHECK_ATTEMPTS - 1;
        let report = coordinator
            .run_cycle_within(&mut record, Duration::from_secs(90))
            .await
            .unwrap();
        assert!(!report.should_continue);
        assert_eq!(record.status, DomainStatus::CnameTimeout);
        assert_eq!(notifier.kinds(), vec!["timeout"]);
    }

    #[tokio::test]
    async fn restart_resets_budget_and_notifies() {
        let h = harness(false, false, unhealthy());
        let mut record = monitoring_record("example.com");
        for _ in 0..MAX_CHECK_ATTEMPTS {
            h.coordinator.run_cycle(&mut record).await.unwrap();
        }
        assert_eq!(record.status, DomainStatus::CnameTimeout);

        h.coordinator.restart(&mut record).await.unwrap();

        assert_eq!(record.status, DomainStatus::CnameMonitoring);
        assert!(record.monitoring_active);
        assert_eq!(record.check_attempts, 0);
        assert_eq!(h.notifier.kinds(), vec!["timeout", "monitoring_restarted"]);
    }

    #[tokio::test]
    async fn enable_requires_disabled_record() {
        let h = harness(true, true, healthy());
        let mut record = monitoring_record("example.com");
        assert!(h.coordinator.enable(&mut record).await.is_err());

        record.disable(record.updated_at);
        h.coordinator.enable(&mut record).await.unwrap();
        assert_eq!(record.status, DomainStatus::CnameMonitoring);
        assert!(record.monitoring_active);
        assert_eq!(h.notifier.kinds(), vec!["monitoring_restarted"]);
    }

    #[test]
    fn cycle_outcomes_use_stable_metric_labels() {
        assert_eq!(CycleOutcome::Activated.as_str(), "activated");
        assert_eq!(CycleOutcome::TimedOut.as_str(), "timeout");
        assert_eq!(CycleOutcome::Pending.as_str(), "pending");
    }
}
