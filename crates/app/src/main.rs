mod monitor;
mod notify;
mod problem;
mod removal;
mod router;
mod scheduler;
mod service;
mod setup;
mod telemetry;
#[cfg(test)]
mod test_support;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use domainlink_probe::{DnsProbe, HickoryLookup, HttpHealthProbe};
use domainlink_provider::ProviderClient;
use domainlink_storage::Database;
use domainlink_util::{load_env_file, AppConfig};

use crate::notify::LoggingNotifier;
use crate::scheduler::TokioScheduler;
use crate::service::{Collaborators, DomainService};

/// Source of "now" shared by every component that stamps records.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const PROVIDER_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let provider = ProviderClient::new(
        &config.provider,
        reqwest::Client::builder()
            .timeout(PROVIDER_HTTP_TIMEOUT)
            .build()?,
    )?;
    let dns = DnsProbe::new(Arc::new(HickoryLookup::from_system_conf()?), &config.dns);
    let (scheduler, due) = TokioScheduler::new();
    let clock: Clock = Arc::new(Utc::now);

    let service = DomainService::new(
        database.tenant_domains(),
        Collaborators {
            provider: Arc::new(provider),
            health: Arc::new(HttpHealthProbe::new()?),
            notifier: Arc::new(LoggingNotifier),
            scheduler: Arc::new(scheduler),
            dns,
        },
        config.monitoring,
        clock,
    );

    let rearmed = service.rearm_monitoring().await?;
    let _dispatcher = service.clone().spawn_dispatcher(due);

    if config.admin_token.is_none() {
        warn!(stage = "app", "ADMIN_TOKEN not set; domain management routes are disabled");
    }
    let state = router::AppState::new(metrics, service, config.admin_token.clone());

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), rearmed, "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
