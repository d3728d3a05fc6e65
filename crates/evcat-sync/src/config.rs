//! `catalog.yaml` loading, environment overrides and startup validation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use evcat_adapters::{AdapterError, FetchQuery, SourceKind};
use evcat_storage::{HttpClientConfig, RetryPolicy, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const WEIGHT_TOLERANCE: f64 = 1e-6;
/// Upper bound for every configured wait: one week.
const MAX_WAIT_MS: u64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent adapter invocations.
    pub workers: usize,
    pub call_timeout_ms: u64,
    pub cycle_timeout_ms: u64,
    /// Longest wait for a rate-limit token before the attempt counts as a timeout.
    pub rate_limit_wait_ms: u64,
    pub per_source_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            call_timeout_ms: 15_000,
            cycle_timeout_ms: 300_000,
            rate_limit_wait_ms: 10_000,
            per_source_limit: 100,
        }
    }
}

impl OrchestratorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_millis(self.cycle_timeout_ms)
    }

    pub fn rate_limit_wait(&self) -> Duration {
        Duration::from_millis(self.rate_limit_wait_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub title: f64,
    pub location: f64,
    pub date: f64,
    pub description: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            title: 0.40,
            location: 0.30,
            date: 0.20,
            description: 0.10,
        }
    }
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.title + self.location + self.date + self.description
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoreWeights,
    /// Start times this close count as identical.
    pub date_tolerance_minutes: u32,
    /// Start times this far apart score zero.
    pub date_window_hours: u32,
    /// locationSim for a same-city pair before venue, address and coordinate refinement.
    pub location_base: f64,
    pub geo_cutoff_km: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            date_tolerance_minutes: 120,
            date_window_hours: 48,
            location_base: 0.6,
            geo_cutoff_km: 5.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub merge_threshold: f64,
    pub review_threshold: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            merge_threshold: 0.85,
            review_threshold: 0.60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationConfig {
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    pub country: String,
}

impl LocationConfig {
    pub fn new(city: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            state: None,
            country: country.into(),
        }
    }

    pub fn query(&self, limit: usize) -> FetchQuery {
        FetchQuery {
            city: self.city.clone(),
            state: self.state.clone(),
            country: self.country.clone(),
            limit,
        }
    }

    pub fn label(&self) -> String {
        match &self.state {
            Some(state) => format!("{}, {}, {}", self.city, state, self.country),
            None => format!("{}, {}", self.city, self.country),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_confidence() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher priority sources are merged first within a cycle.
    #[serde(default)]
    pub priority: i32,
    /// Field-level trust used when refining canonical values.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub rate_limit: TokenBucketConfig,
    pub kind: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Six-field cron expressions (seconds first).
    pub crons: Vec<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            crons: vec!["0 0 6 * * *".to_string(), "0 0 18 * * *".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PersistenceConfig {
    #[default]
    Memory,
    File { root: PathBuf },
    Postgres { database_url: String },
}

impl PersistenceConfig {
    pub fn label(&self) -> &'static str {
        match self {
            PersistenceConfig::Memory => "memory",
            PersistenceConfig::File { .. } => "file",
            PersistenceConfig::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub user_agent: String,
    pub max_sessions: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            user_agent: "evcat-bot/0.1".to_string(),
            max_sessions: 16,
        }
    }
}

impl HttpSettings {
    pub fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_sessions: self.max_sessions,
        }
    }
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("reports")
}

fn default_rules_dir() -> PathBuf {
    PathBuf::from("rules")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    #[serde(default = "default_rules_dir")]
    pub rules_dir: PathBuf,
    /// Directory relative paths resolve against. Set by the loader.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            retry: RetryPolicy::default(),
            scoring: ScoringConfig::default(),
            merge: MergeConfig::default(),
            http: HttpSettings::default(),
            locations: Vec::new(),
            sources: Vec::new(),
            schedule: ScheduleConfig::default(),
            persistence: PersistenceConfig::default(),
            reports_dir: default_reports_dir(),
            rules_dir: default_rules_dir(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl CatalogConfig {
    /// Read, apply process environment overrides, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut config: CatalogConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.base_dir = base_dir.to_path_buf();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without touching the environment. Still validated.
    pub fn from_yaml_str(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let mut config: CatalogConfig =
            serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        config.base_dir = base_dir.into();
        config.validate()?;
        Ok(config)
    }

    /// `DATABASE_URL`, `EVCAT_REPORTS_DIR` and `EVCAT_WORKERS`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.persistence = PersistenceConfig::Postgres { database_url: url };
        }
        if let Some(dir) = lookup("EVCAT_REPORTS_DIR").filter(|v| !v.trim().is_empty()) {
            self.reports_dir = PathBuf::from(dir);
        }
        if let Some(workers) = lookup("EVCAT_WORKERS") {
            self.orchestrator.workers = workers.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("EVCAT_WORKERS must be a positive integer, got {workers:?}"))
            })?;
        }
        Ok(())
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn reports_path(&self) -> PathBuf {
        self.resolve(&self.reports_dir)
    }

    pub fn rules_path(&self) -> PathBuf {
        self.resolve(&self.rules_dir)
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let w = &self.scoring.weights;

        for (name, value) in [
            ("title", w.title),
            ("location", w.location),
            ("date", w.date),
            ("description", w.description),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("scoring weight {name} must be non-negative, got {value}"));
            }
        }
        if (w.sum() - 1.0).abs() > WEIGHT_TOLERANCE {
            return invalid(format!("scoring weights must sum to 1.0, got {}", w.sum()));
        }

        let m = &self.merge;
        for (name, value) in [("merge_threshold", m.merge_threshold), ("review_threshold", m.review_threshold)] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be within [0, 1], got {value}"));
            }
        }
        if m.review_threshold > m.merge_threshold {
            return invalid(format!(
                "review_threshold {} exceeds merge_threshold {}",
                m.review_threshold, m.merge_threshold
            ));
        }

        let s = &self.scoring;
        if !(0.0..=1.0).contains(&s.location_base) {
            return invalid(format!("location_base must be within [0, 1], got {}", s.location_base));
        }
        if !(s.geo_cutoff_km.is_finite() && s.geo_cutoff_km > 0.0) {
            return invalid(format!("geo_cutoff_km must be positive, got {}", s.geo_cutoff_km));
        }
        if u64::from(s.date_window_hours) * 60 <= u64::from(s.date_tolerance_minutes) {
            return invalid("date_window_hours must be longer than date_tolerance_minutes".to_string());
        }

        let o = &self.orchestrator;
        if o.workers == 0 {
            return invalid("orchestrator.workers must be at least 1".to_string());
        }
        if o.call_timeout_ms == 0 || o.cycle_timeout_ms == 0 {
            return invalid("orchestrator timeouts must be positive".to_string());
        }
        for (name, value) in [
            ("call_timeout_ms", o.call_timeout_ms),
            ("cycle_timeout_ms", o.cycle_timeout_ms),
            ("rate_limit_wait_ms", o.rate_limit_wait_ms),
        ] {
            if value > MAX_WAIT_MS {
                return invalid(format!("orchestrator.{name} must be at most {MAX_WAIT_MS}, got {value}"));
            }
        }
        if o.per_source_limit == 0 {
            return invalid("orchestrator.per_source_limit must be at least 1".to_string());
        }

        let r = &self.retry;
        if r.base_delay_ms > MAX_WAIT_MS || r.max_delay_ms > MAX_WAIT_MS {
            return invalid(format!("retry delays must be at most {MAX_WAIT_MS} ms"));
        }
        if r.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".to_string());
        }
        if !(r.multiplier.is_finite() && r.multiplier >= 1.0) {
            return invalid(format!("retry.multiplier must be >= 1.0, got {}", r.multiplier));
        }
        if !(0.0..=1.0).contains(&r.jitter) {
            return invalid(format!("retry.jitter must be within [0, 1], got {}", r.jitter));
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return invalid("source name must not be empty".to_string());
            }
            if !names.insert(source.name.trim().to_ascii_lowercase()) {
                return invalid(format!("duplicate source name {}", source.name));
            }
            if !(0.0..=1.0).contains(&source.confidence) {
                return invalid(format!(
                    "source {} confidence must be within [0, 1], got {}",
                    source.name, source.confidence
                ));
            }
            if source.rate_limit.capacity == 0 {
                return invalid(format!("source {} rate_limit.capacity must be positive", source.name));
            }
            if !(source.rate_limit.refill_per_second.is_finite() && source.rate_limit.refill_per_second >= 0.0) {
                return invalid(format!(
                    "source {} rate_limit.refill_per_second must be non-negative",
                    source.name
                ));
            }
        }

        for location in &self.locations {
            if location.city.trim().is_empty() {
                return invalid("location city must not be empty".to_string());
            }
        }
        Ok(())
    }
}
