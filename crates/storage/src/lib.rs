use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;
use tracing::debug;

use domainlink_core::types::{
    CanonicalPreference, DomainStatus, TenantDomainRecord, UnknownVariant,
};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the tenant domain records.
    pub fn tenant_domains(&self) -> TenantDomainRepository {
        TenantDomainRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `tenant_domains` table.
#[derive(Clone)]
pub struct TenantDomainRepository {
    pool: SqlitePool,
}

const SELECT_COLUMNS: &str = "SELECT id, tenant_id, subdomain, hostname, status, monitoring_active, \
     check_attempts, provider_domain_registered, canonical_preference, custom_domains_enabled, \
     owner_email, last_status_reason, \
     setup_notification_sent_at, monitoring_started_at, last_checked_at, created_at, updated_at \
     FROM tenant_domains";

impl TenantDomainRepository {
    /// Inserts a freshly provisioned record.
    pub async fn insert(&self, record: &TenantDomainRecord) -> Result<(), TenantDomainError> {
        let result = sqlx::query(
            "INSERT INTO tenant_domains \
             (id, tenant_id, subdomain, hostname, status, monitoring_active, check_attempts, \
              provider_domain_registered, canonical_preference, custom_domains_enabled, owner_email, \
              last_status_reason, setup_notification_sent_at, monitoring_started_at, last_checked_at, \
              created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.tenant_id)
        .bind(&record.subdomain)
        .bind(&record.hostname)
        .bind(record.status.as_str())
        .bind(record.monitoring_active)
        .bind(i64::from(record.check_attempts))
        .bind(record.provider_domain_registered)
        .bind(record.canonical_preference.as_str())
        .bind(record.custom_domains_enabled)
        .bind(&record.owner_email)
        .bind(&record.last_status_reason)
        .bind(record.setup_notification_sent_at.map(to_rfc3339))
        .bind(record.monitoring_started_at.map(to_rfc3339))
        .bind(record.last_checked_at.map(to_rfc3339))
        .bind(to_rfc3339(record.created_at))
        .bind(to_rfc3339(record.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if matches!(db_err.code().as_deref(), Some("1555") | Some("2067")) =>
            {
                Err(TenantDomainError::Duplicate)
            }
            Err(err) => Err(TenantDomainError::Database(err)),
        }
    }

    /// Loads a record by id.
    pub async fn fetch(&self, id: &str) -> Result<Option<TenantDomainRecord>, TenantDomainError> {
        let row = sqlx::query_as::<_, TenantDomainRow>(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TenantDomainRow::into_domain).transpose()
    }

    pub async fn fetch_by_tenant(
        &self,
        tenant_id: &str,
    ) -> Result<Option<TenantDomainRecord>, TenantDomainError> {
        let row = sqlx::query_as::<_, TenantDomainRow>(&format!(
            "{SELECT_COLUMNS} WHERE tenant_id = ?"
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TenantDomainRow::into_domain).transpose()
    }

    /// Writes every mutable column of `record` back to its row.
    pub async fn save(&self, record: &TenantDomainRecord) -> Result<(), TenantDomainError> {
        let result = sqlx::query(
            "UPDATE tenant_domains \
             SET hostname = ?, status = ?, monitoring_active = ?, check_attempts = ?, \
                 provider_domain_registered = ?, canonical_preference = ?, custom_domains_enabled = ?, \
                 owner_email = ?, last_status_reason = ?, setup_notification_sent_at = ?, \
                 monitoring_started_at = ?, last_checked_at = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&record.hostname)
        .bind(record.status.as_str())
        .bind(record.monitoring_active)
        .bind(i64::from(record.check_attempts))
        .bind(record.provider_domain_registered)
        .bind(record.canonical_preference.as_str())
        .bind(record.custom_domains_enabled)
        .bind(&record.owner_email)
        .bind(&record.last_status_reason)
        .bind(record.setup_notification_sent_at.map(to_rfc3339))
        .bind(record.monitoring_started_at.map(to_rfc3339))
        .bind(record.last_checked_at.map(to_rfc3339))
        .bind(to_rfc3339(record.updated_at))
        .bind(&record.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TenantDomainError::NotFound(record.id.clone()));
        }

        debug!(
            stage = "storage",
            record_id = %record.id,
            status = %record.status,
            attempts = record.check_attempts,
            "tenant domain saved"
        );
        Ok(())
    }

    /// Records with an armed monitoring loop, oldest first.
    pub async fn list_monitoring(&self) -> Result<Vec<TenantDomainRecord>, TenantDomainError> {
        let rows = sqlx::query_as::<_, TenantDomainRow>(&format!(
            "{SELECT_COLUMNS} WHERE monitoring_active = 1 ORDER BY monitoring_started_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TenantDomainRow::into_domain).collect()
    }
}

/// Errors raised by [`TenantDomainRepository`].
#[derive(Debug, Error)]
pub enum TenantDomainError {
    #[error("tenant domain record already exists")]
    Duplicate,
    #[error("tenant domain record {0} not found")]
    NotFound(String),
    #[error("corrupt tenant domain row: {0}")]
    Corrupt(#[from] UnknownVariant),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct TenantDomainRow {
    id: String,
    tenant_id: String,
    subdomain: String,
    hostname: String,
    status: String,
    monitoring_active: bool,
    check_attempts: i64,
    provider_domain_registered: bool,
    canonical_preference: String,
    custom_domains_enabled: bool,
    owner_email: Option<String>,
    last_status_reason: Option<String>,
    setup_notification_sent_at: Option<DateTime<Utc>>,
    monitoring_started_at: Option<DateTime<Utc>>,
    last_checked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TenantDomainRow {
    fn into_domain(self) -> Result<TenantDomainRecord, TenantDomainError> {
        let status: DomainStatus = self.status.parse()?;
        let canonical_preference: CanonicalPreference = self.canonical_preference.parse()?;
        Ok(TenantDomainRecord {
            id: self.id,
            tenant_id: self.tenant_id,
            subdomain: self.subdomain,
            hostname: self.hostname,
            status,
            monitoring_active: self.monitoring_active,
            check_attempts: u32::try_from(self.check_attempts).unwrap_or(u32::MAX),
            provider_domain_registered: self.provider_domain_registered,
            canonical_preference,
            custom_domains_enabled: self.custom_domains_enabled,
            owner_email: self.owner_email,
            last_status_reason: self.last_status_reason,
            setup_notification_sent_at: self.setup_notification_sent_at,
            monitoring_started_at: self.monitoring_started_at,
            last_checked_at: self.last_checked_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn record(id: &str, tenant: &str) -> TenantDomainRecord {
        let mut record = TenantDomainRecord::new(id, tenant, format!("{tenant}.platform.test"), now());
        record.custom_domains_enabled = true;
        record.owner_email = Some(format!("owner@{tenant}.test"));
        record
    }

    fn monitoring(id: &str, tenant: &str, started: DateTime<Utc>) -> TenantDomainRecord {
        let mut record = record(id, tenant);
        record.begin_setup(format!("{tenant}.com"), CanonicalPreference::Www, started);
        record.mark_provider_registered(started);
        record.mark_pending(started).unwrap();
        record.start_monitoring(started).unwrap();
        record
    }

    #[tokio::test]
    async fn migrations_apply() {
        let db = setup_db().await;
        let tables: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'tenant_domains'",
        )
        .fetch_one(db.pool())
        .await
        .expect("fetch tables");
        assert_eq!(tables.0, 1);
    }

    #[tokio::test]
    async fn insert_and_fetch_round_trip_every_field() {
        let db = setup_db().await;
        let repo = db.tenant_domains();
        let mut record = monitoring("rec-1", "acme", now());
        record.record_attempt("DNS configured, waiting", now() + Duration::minutes(5));
        record.setup_notification_sent_at = Some(now());

        repo.insert(&record).await.expect("insert");
        let loaded = repo.fetch("rec-1").await.expect("fetch").expect("present");
        assert_eq!(loaded, record);

        let by_tenant = repo
            .fetch_by_tenant("acme")
            .await
            .expect("fetch by tenant")
            .expect("present");
        assert_eq!(by_tenant.id, "rec-1");
    }

    #[tokio::test]
    async fn fetch_missing_returns_none() {
        let db = setup_db().await;
        assert!(db.tenant_domains().fetch("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids_and_tenants() {
        let db = setup_db().await;
        let repo = db.tenant_domains();
        repo.insert(&record("rec-1", "acme")).await.unwrap();

        let same_id = repo.insert(&record("rec-1", "other")).await;
        assert!(matches!(same_id, Err(TenantDomainError::Duplicate)));

        let same_tenant = repo.insert(&record("rec-2", "acme")).await;
        assert!(matches!(same_tenant, Err(TenantDomainError::Duplicate)));
    }

    #[tokio::test]
    async fn save_persists_transitions() {
        let db = setup_db().await;
        let repo = db.tenant_domains();
        let mut record = monitoring("rec-1", "acme", now());
        repo.insert(&record).await.unwrap();

        let later = now() + Duration::hours(1);
        record.activate(later).unwrap();
        repo.save(&record).await.expect("save");

        let loaded = repo.fetch("rec-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, DomainStatus::CnameActive);
        assert!(!loaded.monitoring_active);
        assert_eq!(loaded.updated_at, later);
    }

    #[tokio::test]
    async fn save_unknown_record_is_not_found() {
        let db = setup_db().await;
        let err = db
            .tenant_domains()
            .save(&record("ghost", "ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, TenantDomainError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn list_monitoring_only_returns_armed_records() {
        let db = setup_db().await;
        let repo = db.tenant_domains();
        repo.insert(&monitoring("rec-late", "late", now() + Duration::minutes(10)))
            .await
            .unwrap();
        repo.insert(&monitoring("rec-early", "early", now()))
            .await
            .unwrap();
        repo.insert(&record("rec-idle", "idle")).await.unwrap();

        let ids: Vec<String> = repo
            .list_monitoring()
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.id)
            .collect();
        assert_eq!(ids, vec!["rec-early".to_string(), "rec-late".to_string()]);
    }
}
