use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc, Weekday};
use sepa_storage::{BackoffPolicy, HttpClientConfig};
use thiserror::Error;

/// Problems that abort a run before any I/O happens.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{name} has an invalid value: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("DATABASE_URL is required unless running as a dry run")]
    MissingDatabaseUrl,
    #[error("reading source table {path}: {source}")]
    SourceTableIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing source table {path}: {source}")]
    SourceTableParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("source table has unknown weekday key {0:?}")]
    UnknownWeekday(String),
    #[error("source #{index} for {weekday} has an empty url")]
    EmptyUrl { weekday: Weekday, index: usize },
    #[error("no source is mapped for {weekday} ({date})")]
    UnmappedWeekday { weekday: Weekday, date: NaiveDate },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub sources_path: PathBuf,
    pub work_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_max_retries: usize,
    pub run_budget: Duration,
    pub lock_margin: Duration,
    pub load_batch_size: usize,
    pub normalize_workers: usize,
    pub allowed_chains: BTreeSet<String>,
    pub utc_offset_hours: i32,
    pub scheduler_cron: String,
    pub dry_run: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            sources_path: PathBuf::from("./sources.yaml"),
            work_dir: std::env::temp_dir(),
            reports_dir: PathBuf::from("./reports"),
            user_agent: format!("sepa-sync/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 300,
            fetch_max_retries: BackoffPolicy::default().max_retries,
            run_budget: Duration::from_secs(3300),
            lock_margin: Duration::from_secs(600),
            load_batch_size: 1000,
            normalize_workers: 4,
            allowed_chains: BTreeSet::new(),
            utc_offset_hours: -3,
            scheduler_cron: "0 0 9 * * *".to_string(),
            dry_run: false,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset or blank variables keep defaults.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Ok(Self {
            database_url: var("DATABASE_URL"),
            sources_path: var("SEPA_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_path),
            work_dir: var("SEPA_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            reports_dir: var("SEPA_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            user_agent: var("SEPA_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: parsed(
                "SEPA_HTTP_TIMEOUT_SECS",
                var("SEPA_HTTP_TIMEOUT_SECS"),
                defaults.http_timeout_secs,
            )?,
            fetch_max_retries: parsed(
                "SEPA_FETCH_MAX_RETRIES",
                var("SEPA_FETCH_MAX_RETRIES"),
                defaults.fetch_max_retries,
            )?,
            run_budget: Duration::from_secs(parsed(
                "SEPA_RUN_BUDGET_SECS",
                var("SEPA_RUN_BUDGET_SECS"),
                defaults.run_budget.as_secs(),
            )?),
            lock_margin: Duration::from_secs(parsed(
                "SEPA_LOCK_MARGIN_SECS",
                var("SEPA_LOCK_MARGIN_SECS"),
                defaults.lock_margin.as_secs(),
            )?),
            load_batch_size: positive(
                "SEPA_LOAD_BATCH_SIZE",
                var("SEPA_LOAD_BATCH_SIZE"),
                defaults.load_batch_size,
            )?,
            normalize_workers: positive(
                "SEPA_NORMALIZE_WORKERS",
                var("SEPA_NORMALIZE_WORKERS"),
                defaults.normalize_workers,
            )?,
            allowed_chains: var("SEPA_ALLOWED_CHAINS")
                .map(|v| parse_chain_list(&v))
                .unwrap_or_default(),
            utc_offset_hours: parsed(
                "SEPA_UTC_OFFSET_HOURS",
                var("SEPA_UTC_OFFSET_HOURS"),
                defaults.utc_offset_hours,
            )?,
            scheduler_cron: var("SEPA_SCHEDULER_CRON").unwrap_or(defaults.scheduler_cron),
            dry_run: false,
        })
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigurationError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigurationError::MissingDatabaseUrl)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: self.backoff(),
            ..Default::default()
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.fetch_max_retries,
            ..Default::default()
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        self.run_budget + self.lock_margin
    }

    pub fn publisher_offset(&self) -> Result<FixedOffset, ConfigurationError> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).ok_or_else(|| {
            ConfigurationError::InvalidValue {
                name: "SEPA_UTC_OFFSET_HOURS",
                value: self.utc_offset_hours.to_string(),
            }
        })
    }

    /// Calendar day at the publisher for the instant `now`.
    pub fn run_date_at(&self, now: DateTime<Utc>) -> Result<NaiveDate, ConfigurationError> {
        Ok(now.with_timezone(&self.publisher_offset()?).date_naive())
    }
}

fn parsed<T: FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigurationError> {
    match value {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigurationError::InvalidValue { name, value }),
        None => Ok(default),
    }
}

fn positive(
    name: &'static str,
    value: Option<String>,
    default: usize,
) -> Result<usize, ConfigurationError> {
    match parsed(name, value, default)? {
        0 => Err(ConfigurationError::InvalidValue {
            name,
            value: "0".to_string(),
        }),
        n => Ok(n),
    }
}

pub fn parse_chain_list(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn config(vars: &[(&str, &str)]) -> Result<SyncConfig, ConfigurationError> {
        let vars: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]).expect("config");
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.http_timeout_secs, 300);
        assert_eq!(cfg.load_batch_size, 1000);
        assert_eq!(cfg.normalize_workers, 4);
        assert_eq!(cfg.lock_ttl(), Duration::from_secs(3900));
        assert!(cfg.allowed_chains.is_empty());
        assert!(matches!(
            cfg.require_database_url(),
            Err(ConfigurationError::MissingDatabaseUrl)
        ));
    }

    #[test]
    fn reads_overrides() {
        let cfg = config(&[
            ("DATABASE_URL", "postgres://sepa@localhost/sepa"),
            ("SEPA_ALLOWED_CHAINS", " 9, 12,,15 "),
            ("SEPA_LOAD_BATCH_SIZE", "250"),
            ("SEPA_RUN_BUDGET_SECS", "60"),
        ])
        .expect("config");
        assert_eq!(cfg.require_database_url().ok(), Some("postgres://sepa@localhost/sepa"));
        assert_eq!(
            cfg.allowed_chains.into_iter().collect::<Vec<_>>(),
            vec!["12", "15", "9"]
        );
        assert_eq!(cfg.load_batch_size, 250);
        assert_eq!(cfg.run_budget, Duration::from_secs(60));
    }

    #[test]
    fn rejects_malformed_numbers() {
        let err = config(&[("SEPA_NORMALIZE_WORKERS", "many")]).expect_err("invalid");
        assert!(matches!(
            err,
            ConfigurationError::InvalidValue { name: "SEPA_NORMALIZE_WORKERS", .. }
        ));
        assert!(config(&[("SEPA_LOAD_BATCH_SIZE", "0")]).is_err());
    }

    #[test]
    fn run_date_uses_publisher_offset() {
        let cfg = config(&[]).expect("config");
        let late_utc = Utc.with_ymd_and_hms(2024, 10, 15, 1, 30, 0).unwrap();
        assert_eq!(
            cfg.run_date_at(late_utc).expect("offset"),
            NaiveDate::from_ymd_opt(2024, 10, 14).unwrap()
        );
    }
}
