//! Runtime settings
//!
//! Everything is read from the process environment. Binaries load `.env`
//! through `dotenv` before calling [`Settings::from_env`].

use crate::error::OrchestrationError;
use crate::Result;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchProviderKind {
    Serper,
    Tavily,
    Disabled,
}

impl FromStr for SearchProviderKind {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "serper" => Ok(Self::Serper),
            "tavily" => Ok(Self::Tavily),
            "none" | "off" | "disabled" => Ok(Self::Disabled),
            other => Err(OrchestrationError::ConfigError(format!(
                "SEARCH_PROVIDER must be serper, tavily or none (got '{}')",
                other
            ))),
        }
    }
}

/// Pacing knobs shared by the batch tools.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    /// Delay between items / chunks of a batch tool
    pub batch_delay: Duration,
    /// Transactions per classification call
    pub classify_batch_size: usize,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            batch_delay: Duration::from_millis(1000),
            classify_batch_size: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub gemini_api_key: String,
    pub model_name: String,
    pub parser_model_name: String,
    pub classifier_model_name: String,
    pub insights_model_name: String,

    pub database_url: Option<String>,

    pub search_provider: SearchProviderKind,
    pub serper_api_key: String,
    pub tavily_api_key: String,

    pub input_folder: Option<PathBuf>,

    pub ref_store_ttl: Duration,
    pub ref_store_capacity: usize,
    pub pacing: Pacing,
    pub history_window: usize,

    pub log_path: PathBuf,
    pub log_stdout: bool,
    pub api_port: u16,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup (tests feed a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let model_name = get("MODEL_NAME").unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let database_url = get("DATABASE_URL")
            .or_else(|| get("POSTGRES_URL"))
            .or_else(|| {
                let db = get("POSTGRES_DB")?;
                Some(format!(
                    "postgres://{}:{}@{}:{}/{}",
                    get("POSTGRES_USER").unwrap_or_default(),
                    get("POSTGRES_PASSWORD").unwrap_or_default(),
                    get("POSTGRES_HOST").unwrap_or_else(|| "localhost".to_string()),
                    get("POSTGRES_PORT").unwrap_or_else(|| "5432".to_string()),
                    db
                ))
            });

        let search_provider = match get("SEARCH_PROVIDER") {
            Some(v) => v.parse()?,
            None => SearchProviderKind::Serper,
        };

        let pacing = Pacing {
            batch_delay: Duration::from_millis(parse_or(&get, "BATCH_DELAY_MS", 1000u64)?),
            classify_batch_size: parse_or(&get, "CLASSIFY_BATCH_SIZE", 10usize)?.max(1),
        };

        Ok(Self {
            gemini_api_key: get("GEMINI_API_KEY").unwrap_or_default(),
            parser_model_name: get("PARSER_MODEL_NAME").unwrap_or_else(|| model_name.clone()),
            classifier_model_name: get("CLASSIFIER_MODEL_NAME")
                .unwrap_or_else(|| model_name.clone()),
            insights_model_name: get("INSIGHTS_MODEL_NAME").unwrap_or_else(|| model_name.clone()),
            model_name,
            database_url,
            search_provider,
            serper_api_key: get("SERPER_API_KEY").unwrap_or_default(),
            tavily_api_key: get("TAVILY_API_KEY").unwrap_or_default(),
            input_folder: get("INPUT_FOLDER").map(PathBuf::from),
            ref_store_ttl: Duration::from_secs(parse_or(&get, "REF_STORE_TTL_SECS", 600u64)?),
            ref_store_capacity: parse_or(&get, "REF_STORE_CAPACITY", 100usize)?.max(1),
            pacing,
            history_window: parse_or(&get, "HISTORY_WINDOW", 20usize)?,
            log_path: get("FINNIE_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("finnie.log")),
            log_stdout: matches!(get("FINNIE_LOG_STDOUT").as_deref(), Some("1" | "true")),
            api_port: match get("PORT").or_else(|| get("API_PORT")) {
                Some(v) => v.parse().map_err(|_| {
                    OrchestrationError::ConfigError(format!("PORT is not a valid port: {}", v))
                })?,
                None => 8080,
            },
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            OrchestrationError::ConfigError(format!("{} has an invalid value: {}", key, raw))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.model_name, DEFAULT_MODEL);
        assert_eq!(s.parser_model_name, DEFAULT_MODEL);
        assert_eq!(s.ref_store_ttl, Duration::from_secs(600));
        assert_eq!(s.ref_store_capacity, 100);
        assert_eq!(s.pacing.classify_batch_size, 10);
        assert_eq!(s.search_provider, SearchProviderKind::Serper);
        assert!(s.database_url.is_none());
        assert_eq!(s.api_port, 8080);
    }

    #[test]
    fn test_postgres_parts_build_url() {
        let s = settings(&[
            ("POSTGRES_DB", "finance"),
            ("POSTGRES_USER", "finnie"),
            ("POSTGRES_PASSWORD", "pw"),
        ])
        .unwrap();
        assert_eq!(
            s.database_url.as_deref(),
            Some("postgres://finnie:pw@localhost:5432/finance")
        );
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = settings(&[("REF_STORE_TTL_SECS", "ten")]).unwrap_err();
        assert!(err.to_string().contains("REF_STORE_TTL_SECS"));
    }

    #[test]
    fn test_unknown_search_provider_is_rejected() {
        assert!(settings(&[("SEARCH_PROVIDER", "bing")]).is_err());
        let s = settings(&[("SEARCH_PROVIDER", "none")]).unwrap();
        assert_eq!(s.search_provider, SearchProviderKind::Disabled);
    }
}
