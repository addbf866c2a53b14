pub mod client;
pub mod retry;

pub use client::{DomainProvider, ProviderClient, ProviderDomain, ProviderError, VerifyOutcome};
pub use retry::{parse_retry_after, RetryPolicy};
