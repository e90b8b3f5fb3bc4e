//! Run configuration.
//!
//! Defaults are overridden by environment variables, which the CLI then
//! overrides with explicit flags:
//! - `DATABASE_PATH`: SQLite knowledge-graph file (default: "kgdedup.db")
//! - `DEDUP_EMBEDDING_THRESHOLD`: cosine threshold for vector candidates (default: 0.85)
//! - `DEDUP_USE_EMBEDDINGS`: enable vector candidates (default: true)
//! - `DEDUP_WORKERS`: verification workers (default: 8)
//! - `DEDUP_ORACLE_TIMEOUT_SECS`: per-call oracle timeout (default: 60)
//! - `DEDUP_ORACLE_RETRIES`: extra attempts after a failed call (default: 1)
//! - `DEDUP_RELATED_DOCUMENTS`: document titles shown to the oracle (default: 5)
//! - `DEDUP_AUDIT_LOG`: audit log file (default: "dedup_audit.json")
//! - `DEDUP_ORACLE`: "llm" or "heuristic" (default: "llm")
//! - `DEDUP_LLM_TYPE`: "ollama" or "openai" (default: "ollama")
//! - `DEDUP_LLM_MODEL`: model name (default: "llama3")
//! - `DEDUP_LLM_TEMPERATURE`: sampling temperature (default: 0.0)
//! - `OLLAMA_HOST`, `OLLAMA_PORT`: Ollama endpoint (default: localhost:11434)
//! - `OPENAI_API_KEY`: required when `DEDUP_LLM_TYPE` is "openai"

use async_openai::{config::OpenAIConfig, Client as OpenAIClient};
use ollama_rs::Ollama;
use serde::Serialize;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::db::Database;
use crate::dedup::{CandidateSettings, VerificationSettings};
use crate::entity::EntityNormalizer;
use crate::error::{DedupError, Result};
use crate::oracle::heuristic::DEFAULT_STRICT_EMBEDDING_THRESHOLD;
use crate::oracle::{HeuristicOracle, LlmOracle, VerificationOracle};
use crate::{LLMClient, LLMParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OracleBackend {
    Llm,
    Heuristic,
}

impl FromStr for OracleBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "llm" => Ok(OracleBackend::Llm),
            "heuristic" | "rules" => Ok(OracleBackend::Heuristic),
            other => Err(format!("unknown oracle '{}' (expected llm or heuristic)", other)),
        }
    }
}

impl fmt::Display for OracleBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OracleBackend::Llm => write!(f, "llm"),
            OracleBackend::Heuristic => write!(f, "heuristic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    Ollama,
    OpenAI,
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(LlmBackend::Ollama),
            "openai" => Ok(LlmBackend::OpenAI),
            other => Err(format!("unknown LLM type '{}' (expected ollama or openai)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub database_path: String,
    pub embedding_threshold: f64,
    pub use_embeddings: bool,
    pub workers: usize,
    pub oracle_timeout: Duration,
    pub oracle_retries: u32,
    pub related_documents: usize,
    pub audit_log_path: PathBuf,
    pub oracle: OracleBackend,
    pub llm_type: LlmBackend,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub ollama_host: String,
    pub ollama_port: u16,
    pub openai_api_key: Option<String>,
    pub dry_run: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            database_path: "kgdedup.db".to_string(),
            embedding_threshold: 0.85,
            use_embeddings: true,
            workers: 8,
            oracle_timeout: Duration::from_secs(60),
            oracle_retries: 1,
            related_documents: 5,
            audit_log_path: PathBuf::from("dedup_audit.json"),
            oracle: OracleBackend::Llm,
            llm_type: LlmBackend::Ollama,
            llm_model: "llama3".to_string(),
            llm_temperature: 0.0,
            ollama_host: "localhost".to_string(),
            ollama_port: 11434,
            openai_api_key: None,
            dry_run: false,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>>
where
    T::Err: fmt::Display,
{
    match raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => value.parse::<T>().map(Some).map_err(|e| {
            DedupError::Configuration(format!("invalid {} '{}': {}", key, value, e))
        }),
    }
}

fn parse_flag(key: &str, raw: Option<String>) -> Result<Option<bool>> {
    match raw.map(|v| v.trim().to_lowercase()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => match value.as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(DedupError::Configuration(format!(
                "invalid {} '{}': expected true or false",
                key, value
            ))),
        },
    }
}

impl DedupConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = parse_var::<String>("DATABASE_PATH", lookup("DATABASE_PATH"))? {
            config.database_path = path;
        }
        if let Some(v) = parse_var("DEDUP_EMBEDDING_THRESHOLD", lookup("DEDUP_EMBEDDING_THRESHOLD"))? {
            config.embedding_threshold = v;
        }
        if let Some(v) = parse_flag("DEDUP_USE_EMBEDDINGS", lookup("DEDUP_USE_EMBEDDINGS"))? {
            config.use_embeddings = v;
        }
        if let Some(v) = parse_var("DEDUP_WORKERS", lookup("DEDUP_WORKERS"))? {
            config.workers = v;
        }
        if let Some(secs) = parse_var::<u64>("DEDUP_ORACLE_TIMEOUT_SECS", lookup("DEDUP_ORACLE_TIMEOUT_SECS"))? {
            config.oracle_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = parse_var("DEDUP_ORACLE_RETRIES", lookup("DEDUP_ORACLE_RETRIES"))? {
            config.oracle_retries = v;
        }
        if let Some(v) = parse_var("DEDUP_RELATED_DOCUMENTS", lookup("DEDUP_RELATED_DOCUMENTS"))? {
            config.related_documents = v;
        }
        if let Some(v) = parse_var::<String>("DEDUP_AUDIT_LOG", lookup("DEDUP_AUDIT_LOG"))? {
            config.audit_log_path = PathBuf::from(v);
        }
        if let Some(v) = parse_var("DEDUP_ORACLE", lookup("DEDUP_ORACLE"))? {
            config.oracle = v;
        }
        if let Some(v) = parse_var("DEDUP_LLM_TYPE", lookup("DEDUP_LLM_TYPE"))? {
            config.llm_type = v;
        }
        if let Some(v) = parse_var::<String>("DEDUP_LLM_MODEL", lookup("DEDUP_LLM_MODEL"))? {
            config.llm_model = v;
        }
        if let Some(v) = parse_var("DEDUP_LLM_TEMPERATURE", lookup("DEDUP_LLM_TEMPERATURE"))? {
            config.llm_temperature = v;
        }
        if let Some(v) = parse_var::<String>("OLLAMA_HOST", lookup("OLLAMA_HOST"))? {
            config.ollama_host = v;
        }
        if let Some(v) = parse_var("OLLAMA_PORT", lookup("OLLAMA_PORT"))? {
            config.ollama_port = v;
        }
        config.openai_api_key = parse_var::<String>("OPENAI_API_KEY", lookup("OPENAI_API_KEY"))?;

        Ok(config)
    }

    /// Reject settings that would make a run meaningless, before touching the store
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.embedding_threshold) {
            return Err(DedupError::Configuration(format!(
                "embedding threshold {} is outside [0, 1]",
                self.embedding_threshold
            )));
        }
        if self.workers == 0 {
            return Err(DedupError::Configuration(
                "at least one verification worker is required".to_string(),
            ));
        }
        if self.oracle_timeout.is_zero() {
            return Err(DedupError::Configuration(
                "oracle timeout must be greater than zero".to_string(),
            ));
        }
        if self.database_path.trim().is_empty() {
            return Err(DedupError::Configuration("database path is empty".to_string()));
        }
        if self.oracle == OracleBackend::Llm
            && self.llm_type == LlmBackend::OpenAI
            && self.openai_api_key.is_none()
        {
            return Err(DedupError::Configuration(
                "OPENAI_API_KEY must be set to use the openai LLM".to_string(),
            ));
        }
        Ok(())
    }

    pub fn candidate_settings(&self) -> CandidateSettings {
        CandidateSettings {
            embedding_threshold: self.embedding_threshold,
            use_embeddings: self.use_embeddings,
            normalizer: EntityNormalizer::new(),
        }
    }

    pub fn verification_settings(&self) -> VerificationSettings {
        VerificationSettings {
            workers: self.workers.clamp(1, 64),
            call_timeout: self.oracle_timeout,
            retries: self.oracle_retries,
            related_documents: self.related_documents,
            ..VerificationSettings::default()
        }
    }

    fn ollama_url(&self) -> String {
        if self.ollama_host.contains("://") {
            self.ollama_host.clone()
        } else {
            format!("http://{}", self.ollama_host)
        }
    }

    pub fn llm_params(&self) -> Result<LLMParams> {
        let llm_client = match self.llm_type {
            LlmBackend::OpenAI => {
                let api_key = self.openai_api_key.clone().ok_or_else(|| {
                    DedupError::Configuration("OPENAI_API_KEY must be set".to_string())
                })?;
                let config = OpenAIConfig::new().with_api_key(api_key);
                LLMClient::OpenAI(OpenAIClient::with_config(config))
            }
            LlmBackend::Ollama => {
                info!("Connecting to Ollama at {}:{}", self.ollama_url(), self.ollama_port);
                LLMClient::Ollama(Ollama::new(self.ollama_url(), self.ollama_port))
            }
        };

        Ok(LLMParams {
            llm_client,
            model: self.llm_model.clone(),
            temperature: self.llm_temperature,
        })
    }

    /// Build the configured verification oracle
    pub fn build_oracle(&self, db: &Database) -> Result<Arc<dyn VerificationOracle>> {
        let oracle: Arc<dyn VerificationOracle> = match self.oracle {
            OracleBackend::Llm => Arc::new(LlmOracle::new(self.llm_params()?)),
            OracleBackend::Heuristic => {
                let oracle = HeuristicOracle::new(EntityNormalizer::new());
                if self.use_embeddings {
                    Arc::new(oracle.with_embeddings(db.clone(), DEFAULT_STRICT_EMBEDDING_THRESHOLD))
                } else {
                    Arc::new(oracle)
                }
            }
        };
        Ok(oracle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<DedupConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DedupConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.database_path, "kgdedup.db");
        assert_eq!(config.workers, 8);
        assert_eq!(config.oracle_timeout, Duration::from_secs(60));
        assert_eq!(config.oracle, OracleBackend::Llm);
        assert_eq!(config.llm_type, LlmBackend::Ollama);
        assert!(config.use_embeddings);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_environment_overrides() {
        let config = config_from(&[
            ("DEDUP_EMBEDDING_THRESHOLD", "0.9"),
            ("DEDUP_USE_EMBEDDINGS", "false"),
            ("DEDUP_WORKERS", "16"),
            ("DEDUP_ORACLE", "heuristic"),
            ("DEDUP_AUDIT_LOG", "/tmp/audit.json"),
            ("OLLAMA_PORT", "11500"),
        ])
        .unwrap();
        assert_eq!(config.embedding_threshold, 0.9);
        assert!(!config.use_embeddings);
        assert_eq!(config.workers, 16);
        assert_eq!(config.oracle, OracleBackend::Heuristic);
        assert_eq!(config.audit_log_path, PathBuf::from("/tmp/audit.json"));
        assert_eq!(config.ollama_port, 11500);
    }

    #[test]
    fn test_invalid_values_are_configuration_errors() {
        assert!(matches!(
            config_from(&[("DEDUP_WORKERS", "many")]),
            Err(DedupError::Configuration(_))
        ));
        assert!(matches!(
            config_from(&[("DEDUP_USE_EMBEDDINGS", "maybe")]),
            Err(DedupError::Configuration(_))
        ));

        let mut config = DedupConfig::default();
        config.embedding_threshold = 1.5;
        assert!(matches!(config.validate(), Err(DedupError::Configuration(_))));

        let mut config = DedupConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_openai_requires_key() {
        let config = config_from(&[("DEDUP_LLM_TYPE", "openai")]).unwrap();
        assert!(matches!(config.validate(), Err(DedupError::Configuration(_))));

        let config = config_from(&[("DEDUP_LLM_TYPE", "openai"), ("DEDUP_ORACLE", "heuristic")]).unwrap();
        assert!(config.validate().is_ok());

        let config = config_from(&[("DEDUP_LLM_TYPE", "openai"), ("OPENAI_API_KEY", "sk-test")]).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_count_is_clamped() {
        let mut config = DedupConfig::default();
        config.workers = 500;
        assert_eq!(config.verification_settings().workers, 64);
    }
}
