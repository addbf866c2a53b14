use serde::Serialize;

use crate::types::MAX_CHECK_ATTEMPTS;

pub const REASON_VERIFIED: &str = "fully verified and serving HTTPS";
pub const REASON_CERTIFICATE_PENDING: &str = "certificate provisioning in progress";
pub const REASON_MAX_ATTEMPTS: &str = "maximum attempts reached";
pub const REASON_IN_PROGRESS: &str = "verification in progress";

/// Status reasons keyed by `dns | provider | http | ssl` bits, most significant first.
const REASONS: [(u8, &str); 16] = [
    (0b0000, "waiting for DNS configuration, provider verification and health check"),
    (0b0001, "certificate detected, waiting for DNS, provider verification and health check"),
    (0b0010, "domain responding over HTTP, waiting for DNS and provider verification"),
    (0b0011, "domain serving HTTPS, waiting for DNS and provider verification"),
    (0b0100, "provider verified, waiting for DNS configuration and health check"),
    (0b0101, "provider verified with certificate, waiting for DNS configuration and health check"),
    (0b0110, "provider verified and domain responding, waiting for DNS configuration"),
    (0b0111, "provider verified and serving HTTPS, waiting for DNS configuration"),
    (0b1000, "DNS configured, waiting for provider verification and health check"),
    (0b1001, "DNS configured with certificate, waiting for provider verification and health check"),
    (0b1010, "DNS configured and domain responding, waiting for provider verification"),
    (0b1011, "DNS configured and serving HTTPS, waiting for provider verification"),
    (0b1100, "DNS and provider verified, waiting for health check"),
    (0b1101, "DNS and provider verified with certificate, waiting for health check"),
    (0b1110, REASON_CERTIFICATE_PENDING),
    (0b1111, REASON_VERIFIED),
];

/// Signals gathered by one monitoring cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct VerificationSignals {
    pub dns_verified: bool,
    pub provider_verified: bool,
    pub http_healthy: bool,
    pub ssl_ready: bool,
}

impl VerificationSignals {
    pub fn all(self) -> bool {
        self.dns_verified && self.provider_verified && self.http_healthy && self.ssl_ready
    }

    fn mask(self) -> u8 {
        (u8::from(self.dns_verified) << 3)
            | (u8::from(self.provider_verified) << 2)
            | (u8::from(self.http_healthy) << 1)
            | u8::from(self.ssl_ready)
    }
}

/// Outcome of fusing the cycle signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub verified: bool,
    pub should_continue: bool,
    pub reason: &'static str,
}

impl PolicyDecision {
    /// `true` when monitoring ends without activation.
    pub fn is_timeout(&self) -> bool {
        !self.verified && !self.should_continue
    }
}

/// Combines DNS, provider and HTTP signals into a single verification decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationPolicy {
    max_attempts: u32,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self::new(MAX_CHECK_ATTEMPTS)
    }
}

impl VerificationPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether the domain is verified and whether monitoring should continue.
    ///
    /// `attempts_so_far` is the attempt count before the current cycle is
    /// counted. Activation needs all four signals; the attempt cap is checked
    /// before the certificate-pending rule so the final cycle always terminates.
    pub fn decide(&self, signals: VerificationSignals, attempts_so_far: u32) -> PolicyDecision {
        if signals.all() {
            return PolicyDecision {
                verified: true,
                should_continue: false,
                reason: REASON_VERIFIED,
            };
        }

        if attempts_so_far.saturating_add(1) >= self.max_attempts {
            return PolicyDecision {
                verified: false,
                should_continue: false,
                reason: REASON_MAX_ATTEMPTS,
            };
        }

        PolicyDecision {
            verified: false,
            should_continue: true,
            reason: reason_for(signals),
        }
    }
}

/// Looks up the human readable status for a signal combination.
pub fn reason_for(signals: VerificationSignals) -> &'static str {
    let mask = signals.mask();
    REASONS
        .iter()
        .find(|(key, _)| *key == mask)
        .map(|(_, reason)| *reason)
        .unwrap_or(REASON_IN_PROGRESS)
}
