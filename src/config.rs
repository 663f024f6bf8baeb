//! Configuration management for the report agent.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Required. Your OpenRouter API key.
//! - `DEFAULT_MODEL` - Optional. The LLM model to use. Defaults to `openai/gpt-4o-mini`.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `WORKER_COUNT` - Optional. Tasks run concurrently. Defaults to `4`.
//! - `STALL_THRESHOLD_SECS` - Optional. Idle seconds before a call is stalled. Defaults to `60`.
//! - `STALL_RETRIES` - Optional. Extra attempts for a stalled step. Defaults to `1`.
//! - `PLAN_MAX_ATTEMPTS` - Optional. Planning attempts per round. Defaults to `3`.
//! - `MAX_PLAN_STEPS` - Optional. Step cap per plan. Defaults to `8`.
//! - `MAX_CONTEXT_TABLES` - Optional. Tables kept in a context. Defaults to `20`.
//! - `MAX_COLUMNS_PER_TABLE` - Optional. Columns kept per table. Defaults to `30`.
//! - `MAX_RESULT_ROWS` - Optional. Rows kept from a query. Defaults to `500`.
//! - `FATAL_TOOLS` - Optional. `kind=tool,...;...` overrides of the fatal tool policy.
//! - `CATALOG_PATH` - Optional. YAML/JSON catalog of templates, schedules and data sources.
//! - `CHART_OUTPUT_DIR` - Optional. Where chart specs are written. Defaults to `<DATA_DIR>/charts`.
//! - `TASK_RETENTION_SECS` - Optional. Seconds a finished task stays in memory. Defaults to `600`.
//! - `MAX_RETAINED_TASKS` - Optional. Finished tasks kept in memory at most. Defaults to `1000`.
//! - `TASK_STORE` - Optional. `memory` or `sqlite`. Defaults to `sqlite`.
//! - `DATA_DIR` - Optional. Directory for the task database. Defaults to `./data`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::context::ContextLimits;
use crate::orchestrator::{FatalToolPolicy, OrchestratorConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key
    pub api_key: String,

    /// LLM model identifier (OpenRouter format)
    pub default_model: String,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Orchestrator tuning
    pub orchestrator: OrchestratorConfig,

    /// Rows kept from one query result
    pub max_result_rows: usize,

    /// Catalog of templates, schedules and data sources
    pub catalog_path: Option<PathBuf>,

    pub chart_output_dir: PathBuf,

    /// `memory` or `sqlite`
    pub task_store: String,

    pub data_dir: PathBuf,
}

fn env_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set,
    /// and `ConfigError::InvalidValue` for any value that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let default_model = std::env::var("DEFAULT_MODEL")
            .unwrap_or_else(|_| "openai/gpt-4o-mini".to_string());

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_or("PORT", 3000u16)?;

        let defaults = OrchestratorConfig::default();
        let limits = ContextLimits::default();

        let worker_count: usize = env_or("WORKER_COUNT", defaults.worker_count)?;
        if worker_count == 0 {
            return Err(ConfigError::InvalidValue(
                "WORKER_COUNT".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let stall_secs: u64 = env_or("STALL_THRESHOLD_SECS", defaults.stall_threshold.as_secs())?;
        if stall_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "STALL_THRESHOLD_SECS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let fatal_tools = match std::env::var("FATAL_TOOLS") {
            Ok(raw) => FatalToolPolicy::parse(&raw)
                .map_err(|e| ConfigError::InvalidValue("FATAL_TOOLS".to_string(), e))?,
            Err(_) => defaults.fatal_tools.clone(),
        };

        let orchestrator = OrchestratorConfig {
            worker_count,
            stall_threshold: Duration::from_secs(stall_secs),
            stall_retries: env_or("STALL_RETRIES", defaults.stall_retries)?,
            plan_max_attempts: env_or("PLAN_MAX_ATTEMPTS", defaults.plan_max_attempts)?.max(1),
            max_plan_steps: env_or("MAX_PLAN_STEPS", defaults.max_plan_steps)?.max(1),
            context_limits: ContextLimits {
                max_tables: env_or("MAX_CONTEXT_TABLES", limits.max_tables)?,
                max_columns_per_table: env_or("MAX_COLUMNS_PER_TABLE", limits.max_columns_per_table)?,
                ..limits
            },
            fatal_tools,
            retention: Duration::from_secs(env_or(
                "TASK_RETENTION_SECS",
                defaults.retention.as_secs(),
            )?),
            max_retained: env_or("MAX_RETAINED_TASKS", defaults.max_retained)?,
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let chart_output_dir = std::env::var("CHART_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("charts"));

        let task_store = std::env::var("TASK_STORE")
            .unwrap_or_else(|_| "sqlite".to_string())
            .to_lowercase();
        if task_store != "memory" && task_store != "sqlite" {
            return Err(ConfigError::InvalidValue(
                "TASK_STORE".to_string(),
                format!("expected `memory` or `sqlite`, got `{}`", task_store),
            ));
        }

        Ok(Self {
            api_key,
            default_model,
            host,
            port,
            orchestrator,
            max_result_rows: env_or("MAX_RESULT_ROWS", 500usize)?.max(1),
            catalog_path: std::env::var("CATALOG_PATH").ok().map(PathBuf::from),
            chart_output_dir,
            task_store,
            data_dir,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, default_model: String, data_dir: PathBuf) -> Self {
        Self {
            api_key,
            default_model,
            host: "127.0.0.1".to_string(),
            port: 3000,
            orchestrator: OrchestratorConfig::default(),
            max_result_rows: 500,
            catalog_path: None,
            chart_output_dir: data_dir.join("charts"),
            task_store: "memory".to_string(),
            data_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_and_reports_bad_values() {
        std::env::remove_var("AUTOREPORT_TEST_UNSET");
        assert_eq!(env_or("AUTOREPORT_TEST_UNSET", 7u32).expect("default"), 7);

        std::env::set_var("AUTOREPORT_TEST_BAD", "seven");
        let err = env_or("AUTOREPORT_TEST_BAD", 7u32).expect_err("bad value");
        assert!(err.to_string().starts_with("Invalid value for AUTOREPORT_TEST_BAD"));
        std::env::remove_var("AUTOREPORT_TEST_BAD");
    }

    #[test]
    fn new_uses_embedded_defaults() {
        let config = Config::new("key".into(), "model".into(), PathBuf::from("/tmp/x"));
        assert_eq!(config.chart_output_dir, PathBuf::from("/tmp/x/charts"));
        assert_eq!(config.orchestrator.worker_count, 4);
        assert_eq!(config.task_store, "memory");
    }
}
