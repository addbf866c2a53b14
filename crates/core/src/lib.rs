pub mod hostname;
pub mod policy;
pub mod types;

pub use hostname::{apex_form, normalize_hostname, www_form, HostnameError};
pub use policy::{PolicyDecision, VerificationPolicy, VerificationSignals};
pub use types::{
    CanonicalPreference, DomainStatus, Owner, TenantDomainRecord, TransitionError, UnknownVariant,
    MAX_CHECK_ATTEMPTS,
};
