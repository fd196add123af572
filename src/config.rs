//! Runtime settings.
//!
//! Defaults are usable as-is against the production endpoints. Every field can
//! be overridden through a `SYNTHECA_*` environment variable, and the CLI layers
//! its own flags on top.

use crate::error::{Result, SynthecaError};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SYNTHECA_";

/// OpenAlex institution id whose presence among the corresponding
/// institutions earns a candidate the trust bonus.
pub const DEFAULT_INSTITUTION_ID: &str = "https://openalex.org/I94624287";

#[derive(Debug, Clone)]
pub struct Settings {
    pub user_agent: String,
    pub default_timeout: Duration,
    pub oai_base_url: String,
    pub oai_metadata_prefix: String,
    /// Prepended to the collection name to form the OAI `set` parameter
    pub oai_set_prefix: String,
    pub openalex_base_url: String,
    pub openalex_mailto: Option<String>,
    pub cache_dir: PathBuf,
    /// Consult the cache before network retrieval
    pub use_cache_for_retrieval: bool,
    /// Write successful harvests and lookups to the cache
    pub persist_intermediate: bool,
    pub max_concurrent_windows: usize,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub fuzzy_threshold: f64,
    pub trust_bonus: f64,
    pub institution_id: String,
    pub corrections_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_agent: "rustsyntheca/0.1 (mailto:syntheca@example.org)".to_string(),
            default_timeout: Duration::from_secs(10),
            oai_base_url: "https://ris.utwente.nl/ws/oai".to_string(),
            oai_metadata_prefix: "oai_cerif_openaire".to_string(),
            oai_set_prefix: "openaire_cris_".to_string(),
            openalex_base_url: "https://api.openalex.org".to_string(),
            openalex_mailto: None,
            cache_dir: default_cache_dir(),
            use_cache_for_retrieval: false,
            persist_intermediate: true,
            max_concurrent_windows: 10,
            queue_capacity: 10,
            max_attempts: 4,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(20),
            fuzzy_threshold: 0.9,
            trust_bonus: 0.05,
            institution_id: DEFAULT_INSTITUTION_ID.to_string(),
            corrections_path: None,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|p| p.join("syntheca"))
        .unwrap_or_else(|| PathBuf::from(".cache"))
}

impl Settings {
    /// Defaults overridden by `SYNTHECA_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `SYNTHECA_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut s = Self::default();

        if let Some(v) = get("USER_AGENT") {
            s.user_agent = v;
        }
        if let Some(v) = get("DEFAULT_TIMEOUT") {
            s.default_timeout = Duration::try_from_secs_f64(parse_value("DEFAULT_TIMEOUT", &v)?)
                .map_err(|e| SynthecaError::Config(format!("{ENV_PREFIX}DEFAULT_TIMEOUT: {e}")))?;
        }
        if let Some(v) = get("OAI_BASE_URL") {
            s.oai_base_url = v;
        }
        if let Some(v) = get("OAI_METADATA_PREFIX") {
            s.oai_metadata_prefix = v;
        }
        if let Some(v) = get("OAI_SET_PREFIX") {
            s.oai_set_prefix = v;
        }
        if let Some(v) = get("OPENALEX_BASE_URL") {
            s.openalex_base_url = v;
        }
        if let Some(v) = get("OPENALEX_MAILTO") {
            s.openalex_mailto = Some(v).filter(|m| !m.is_empty());
        }
        if let Some(v) = get("CACHE_DIR") {
            s.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = get("USE_CACHE_FOR_RETRIEVAL") {
            s.use_cache_for_retrieval = parse_bool("USE_CACHE_FOR_RETRIEVAL", &v)?;
        }
        if let Some(v) = get("PERSIST_INTERMEDIATE") {
            s.persist_intermediate = parse_bool("PERSIST_INTERMEDIATE", &v)?;
        }
        if let Some(v) = get("MAX_CONCURRENT_WINDOWS") {
            s.max_concurrent_windows = parse_value("MAX_CONCURRENT_WINDOWS", &v)?;
        }
        if let Some(v) = get("QUEUE_CAPACITY") {
            s.queue_capacity = parse_value("QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            s.max_attempts = parse_value("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("INITIAL_BACKOFF_MS") {
            s.initial_backoff = Duration::from_millis(parse_value("INITIAL_BACKOFF_MS", &v)?);
        }
        if let Some(v) = get("MAX_BACKOFF_MS") {
            s.max_backoff = Duration::from_millis(parse_value("MAX_BACKOFF_MS", &v)?);
        }
        if let Some(v) = get("FUZZY_THRESHOLD") {
            s.fuzzy_threshold = parse_value("FUZZY_THRESHOLD", &v)?;
        }
        if let Some(v) = get("TRUST_BONUS") {
            s.trust_bonus = parse_value("TRUST_BONUS", &v)?;
        }
        if let Some(v) = get("INSTITUTION_ID") {
            s.institution_id = v;
        }
        if let Some(v) = get("CORRECTIONS_PATH") {
            s.corrections_path = Some(PathBuf::from(v));
        }

        s.validate()?;
        Ok(s)
    }

    /// Reject values the harvester and matcher cannot work with.
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("oai_base_url", &self.oai_base_url),
            ("openalex_base_url", &self.openalex_base_url),
        ] {
            url::Url::parse(url)
                .map_err(|e| SynthecaError::Config(format!("{name} {url:?}: {e}")))?;
        }
        if self.max_concurrent_windows == 0 {
            return Err(SynthecaError::Config("max_concurrent_windows must be > 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(SynthecaError::Config("queue_capacity must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(SynthecaError::Config("max_attempts must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.fuzzy_threshold) {
            return Err(SynthecaError::Config(format!(
                "fuzzy_threshold {} outside [0, 1]",
                self.fuzzy_threshold
            )));
        }
        if self.trust_bonus < 0.0 {
            return Err(SynthecaError::Config("trust_bonus must be >= 0".into()));
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| SynthecaError::Config(format!("{ENV_PREFIX}{name}={raw:?}: {e}")))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(SynthecaError::Config(format!(
            "{ENV_PREFIX}{name}={other:?}: expected a boolean"
        ))),
    }
}
