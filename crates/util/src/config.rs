use std::{env, fmt, net::Ipv4Addr, net::SocketAddr, time::Duration};

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://domainlink.db?mode=rwc";
pub const DEFAULT_PROVIDER_BASE_URL: &str = "https://api.render.com/v1/";
pub const DEFAULT_PROVIDER_APEX_IP: Ipv4Addr = Ipv4Addr::new(216, 24, 57, 1);
pub const DEFAULT_PLATFORM_NAME: &str = "onrender";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Credentials and addressing for the upstream hosting provider.
#[derive(Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub service_id: String,
    pub base_url: String,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &"<redacted>")
            .field("service_id", &self.service_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Expected DNS targets for tenant domains.
#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub cname_target: String,
    pub apex_ip: Ipv4Addr,
    /// Accept loopback and platform-named targets. Never enabled in production.
    pub lenient: bool,
    pub platform_name: String,
}

impl DnsConfig {
    /// Substrings that make a CNAME target acceptable in lenient mode.
    pub fn lenient_markers(&self) -> Vec<String> {
        let mut markers = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        if !self.platform_name.is_empty() {
            markers.push(self.platform_name.to_ascii_lowercase());
        }
        markers
    }
}

/// Cadence of the verification loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoringConfig {
    pub check_interval: Duration,
    pub first_check_delay: Duration,
    pub cycle_timeout: Duration,
    /// Pause before verifying a `www` companion registered alongside an apex domain.
    pub companion_verify_delay: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            first_check_delay: Duration::from_secs(60),
            cycle_timeout: Duration::from_secs(90),
            companion_verify_delay: Duration::from_secs(30),
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub admin_token: Option<String>,
    pub provider: ProviderConfig,
    pub dns: DnsConfig,
    pub monitoring: MonitoringConfig,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        Self::from_source(bind_addr, |key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_source<F>(bind_addr: SocketAddr, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let required = |key: &'static str| optional(key).ok_or(ConfigError::Missing(key));

        let env_value = optional("APP_ENV").unwrap_or_else(|| "development".to_string());
        let environment = Environment::from_str(&env_value)?;

        let provider = ProviderConfig {
            api_key: required("PROVIDER_API_KEY")?,
            service_id: required("PROVIDER_SERVICE_ID")?,
            base_url: optional("PROVIDER_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_PROVIDER_BASE_URL.to_string()),
        };

        let apex_ip = match optional("PROVIDER_APEX_IP") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid("PROVIDER_APEX_IP", raw))?,
            None => DEFAULT_PROVIDER_APEX_IP,
        };
        let dns = DnsConfig {
            cname_target: required("PROVIDER_CNAME_TARGET")?
                .trim_end_matches('.')
                .to_ascii_lowercase(),
            apex_ip,
            lenient: !environment.is_production(),
            platform_name: optional("PLATFORM_NAME")
                .unwrap_or_else(|| DEFAULT_PLATFORM_NAME.to_string()),
        };

        let defaults = MonitoringConfig::default();
        let monitoring = MonitoringConfig {
            check_interval: seconds(&optional, "MONITOR_INTERVAL_SECS", defaults.check_interval)?,
            first_check_delay: seconds(
                &optional,
                "MONITOR_FIRST_DELAY_SECS",
                defaults.first_check_delay,
            )?,
            cycle_timeout: seconds(
                &optional,
                "MONITOR_CYCLE_TIMEOUT_SECS",
                defaults.cycle_timeout,
            )?,
            companion_verify_delay: defaults.companion_verify_delay,
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url: optional("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            admin_token: optional("ADMIN_TOKEN"),
            provider,
            dns,
            monitoring,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            environment: Environment::Test,
            database_url: "sqlite::memory:".to_string(),
            admin_token: Some("admin-token".to_string()),
            provider: ProviderConfig {
                api_key: "test-key".to_string(),
                service_id: "srv-test".to_string(),
                base_url: DEFAULT_PROVIDER_BASE_URL.to_string(),
            },
            dns: DnsConfig {
                cname_target: "provider.example.net".to_string(),
                apex_ip: DEFAULT_PROVIDER_APEX_IP,
                lenient: false,
                platform_name: DEFAULT_PLATFORM_NAME.to_string(),
            },
            monitoring: MonitoringConfig {
                check_interval: Duration::from_secs(300),
                first_check_delay: Duration::from_secs(60),
                cycle_timeout: Duration::from_secs(90),
                companion_verify_delay: Duration::ZERO,
            },
        }
    }
}

fn seconds<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::Invalid(key, raw)),
        None => Ok(default),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    Missing(&'static str),
    Invalid(&'static str, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::Missing(key) => write!(f, "{key} must be set"),
            Self::Invalid(key, value) => write!(f, "invalid {key} value: {value}"),
        }
    }
}

impl std::error::Error for ConfigError {}
