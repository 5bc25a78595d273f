//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use cv_pipeline_core::{
    AnalysisConfig, Backoff, PipelineConfig, PollPolicy, RetryPolicy, SelectorConfig,
    TextThresholds, MAX_CONCURRENT_RUNS,
};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// Absent means documents live in process memory only.
    pub database_url: Option<String>,
    pub log_filter: String,
    pub openai_api_key: Option<String>,
    pub analysis_model: String,
    pub vision_api_key: Option<String>,
    pub vision_endpoint: String,
    pub allowed_origin: String,
    pub max_concurrent_runs: usize,
    pub queue_capacity: usize,
    pub poll: PollPolicy,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        // --- Server and storage ---
        let bind_address = parse(&var, "BIND_ADDRESS", SocketAddr::from(([0, 0, 0, 0], 3000)))?;
        let database_url = var("DATABASE_URL");
        let log_filter = var("RUST_LOG").unwrap_or_else(|| "info".to_string());
        let allowed_origin =
            var("ALLOWED_ORIGIN").unwrap_or_else(|| "http://localhost:3000".to_string());

        // --- Vendor credentials ---
        let openai_api_key = var("OPENAI_API_KEY");
        let analysis_model = var("ANALYSIS_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
        let vision_api_key = var("GOOGLE_VISION_API_KEY");
        let vision_endpoint = var("VISION_ENDPOINT")
            .unwrap_or_else(|| "https://vision.googleapis.com".to_string())
            .trim_end_matches('/')
            .to_string();

        // --- Pipeline policy ---
        let selector_defaults = SelectorConfig::default();
        let selector = SelectorConfig {
            weak_text_chars: parse(&var, "WEAK_TEXT_CHARS", selector_defaults.weak_text_chars)?,
            combined_retry_chars: parse(
                &var,
                "COMBINED_RETRY_CHARS",
                selector_defaults.combined_retry_chars,
            )?,
            language_hints: var("OCR_LANGUAGE_HINTS")
                .map(|v| split_list(&v))
                .unwrap_or(selector_defaults.language_hints),
            fallback_language_hints: var("OCR_FALLBACK_LANGUAGE_HINTS")
                .map(|v| split_list(&v))
                .unwrap_or(selector_defaults.fallback_language_hints),
        };

        let retry_defaults = RetryPolicy::default();
        let max_attempts = parse(&var, "PAGE_RETRY_ATTEMPTS", retry_defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "PAGE_RETRY_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let retry = RetryPolicy {
            max_attempts,
            backoff: Backoff::Linear,
            base_delay: Duration::from_millis(parse(
                &var,
                "PAGE_RETRY_DELAY_MS",
                retry_defaults.base_delay.as_millis() as u64,
            )?),
            accept_chars: parse(&var, "MIN_TEXT_CHARS", retry_defaults.accept_chars)?,
        };

        let analysis = AnalysisConfig {
            max_tokens: parse(&var, "ANALYSIS_MAX_TOKENS", AnalysisConfig::default().max_tokens)?,
            ..AnalysisConfig::default()
        };

        let thresholds = TextThresholds {
            min_text_chars: parse(&var, "MIN_TEXT_CHARS", TextThresholds::default().min_text_chars)?,
        };

        // Zero disables the run budget.
        let run_timeout_secs: u64 = parse(&var, "RUN_TIMEOUT_SECS", 300)?;
        let run_timeout = (run_timeout_secs > 0).then(|| Duration::from_secs(run_timeout_secs));

        let pipeline = PipelineConfig {
            selector,
            retry,
            analysis,
            thresholds,
            run_timeout,
        };

        // --- Background execution and polling ---
        let max_concurrent_runs =
            parse(&var, "MAX_CONCURRENT_RUNS", 4usize)?.clamp(1, MAX_CONCURRENT_RUNS);
        let queue_capacity = parse(&var, "QUEUE_CAPACITY", 64usize)?.max(1);
        let poll_defaults = PollPolicy::default();
        let poll = PollPolicy {
            interval: Duration::from_millis(parse(
                &var,
                "POLL_INTERVAL_MS",
                poll_defaults.interval.as_millis() as u64,
            )?),
            max_attempts: parse(&var, "POLL_MAX_ATTEMPTS", poll_defaults.max_attempts)?,
        };

        Ok(Self {
            bind_address,
            database_url,
            log_filter,
            openai_api_key,
            analysis_model,
            vision_api_key,
            vision_endpoint,
            allowed_origin,
            max_concurrent_runs,
            queue_capacity,
            poll,
            pipeline,
        })
    }
}

fn parse<T, F>(var: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn require_openai_api_key(&self) -> Result<&str, ConfigError> {
        self.openai_api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))
    }

    pub fn require_vision_api_key(&self) -> Result<&str, ConfigError> {
        self.vision_api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVar("GOOGLE_VISION_API_KEY".to_string()))
    }
}
