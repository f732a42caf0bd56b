use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const ENV_PREFIX: &str = "API_CRAWLER";
const DEFAULT_CONFIG_FILE: &str = "api_crawler";

/// Fetcher settings. Built once and handed to the fetcher at construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Total attempts per URL, including the first.
    pub max_retries: u32,
    pub backoff_base_secs: f64,
    pub timeout_secs: f64,
    pub user_agent: String,
    /// Explicit proxy URL. System proxy variables are not consulted.
    pub proxy: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            max_retries: 3,
            backoff_base_secs: 1.0,
            timeout_secs: 30.0,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0 Safari/537.36"
                .to_string(),
            proxy: None,
        }
    }
}

/// Chat-completions endpoint used by the model-backed stages.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Page text is cut to this many characters before prompting.
    pub max_content_chars: usize,
    /// Attempts per request on timeouts, quota and transport errors.
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o".to_string(),
            timeout_secs: 30,
            max_tokens: 1500,
            temperature: 0.1,
            max_content_chars: 4000,
            max_retries: 3,
        }
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl LlmConfig {
    pub fn has_credentials(&self) -> bool {
        self.api_key
            .as_deref()
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub max_attempts: u32,
    /// Minimum confidence for accepting an API-name match without asking the model.
    pub confidence_threshold: f64,
    pub checkpoint_db: PathBuf,
    pub data_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            workers: 8,
            batch_size: 50,
            max_attempts: 3,
            confidence_threshold: 0.7,
            checkpoint_db: PathBuf::from("data/checkpoints.sqlite"),
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub fetch: FetchConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
}

impl Settings {
    /// Layer defaults, an optional config file and `API_CRAWLER_*` env vars.
    ///
    /// An explicit `path` must exist; otherwise `api_crawler.{toml,json,yaml}`
    /// in the working directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(p) => builder.add_source(config::File::from(p).required(true)),
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };
        let settings: Settings = builder
            .add_source(env)
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            bail!("pipeline.workers must be at least 1");
        }
        if self.pipeline.batch_size == 0 {
            bail!("pipeline.batch_size must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.pipeline.confidence_threshold) {
            bail!(
                "pipeline.confidence_threshold must be within [0, 1], got {}",
                self.pipeline.confidence_threshold
            );
        }
        if self.fetch.max_retries == 0 {
            bail!("fetch.max_retries must be at least 1");
        }
        if !(self.fetch.timeout_secs > 0.0) {
            bail!("fetch.timeout_secs must be positive");
        }
        if self.fetch.backoff_base_secs < 0.0 {
            bail!("fetch.backoff_base_secs must not be negative");
        }
        if self.llm.timeout_secs == 0 {
            bail!("llm.timeout_secs must be at least 1");
        }
        Ok(())
    }

    /// Model settings for stages that cannot run without the service.
    pub fn require_llm(&self) -> Result<&LlmConfig> {
        if !self.llm.has_credentials() {
            bail!(
                "No model credentials configured: set {}_LLM__API_KEY or llm.api_key",
                ENV_PREFIX
            );
        }
        Ok(&self.llm)
    }
}

/// `API_CRAWLER_LLM__API_KEY` → `llm.api_key`.
fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let s = Settings::default();
        s.validate().unwrap();
        assert_eq!(s.fetch.max_retries, 3);
        assert_eq!(s.pipeline.workers, 8);
        assert!(s.require_llm().is_err());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawler.toml");
        std::fs::write(
            &path,
            "[pipeline]\nworkers = 4\nconfidence_threshold = 0.85\n\n[llm]\napi_key = \"sk-test\"\n",
        )
        .unwrap();
        let s = Settings::load(Some(&path)).unwrap();
        assert_eq!(s.pipeline.workers, 4);
        assert_eq!(s.pipeline.batch_size, 50);
        assert!((s.pipeline.confidence_threshold - 0.85).abs() < 1e-9);
        assert!(s.require_llm().is_ok());
        assert!(!format!("{:?}", s.llm).contains("sk-test"));
    }

    #[test]
    fn out_of_range_threshold_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[pipeline]\nconfidence_threshold = 1.5\n").unwrap();
        assert!(Settings::load(Some(&path)).is_err());
    }

    #[test]
    fn missing_explicit_file_is_fatal() {
        assert!(Settings::load(Some(Path::new("/nonexistent/crawler.toml"))).is_err());
    }

    #[test]
    fn documented_env_vars_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawler.toml");
        std::fs::write(&path, "[pipeline]\nworkers = 4\n").unwrap();

        let vars: config::Map<String, String> = [
            ("API_CRAWLER_LLM__API_KEY", "sk-env"),
            ("API_CRAWLER_PIPELINE__WORKERS", "3"),
            ("API_CRAWLER_FETCH__MAX_RETRIES", "5"),
            ("OTHER_APP_PIPELINE__WORKERS", "99"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let s = Settings::load_with_env(Some(&path), environment().source(Some(vars))).unwrap();
        assert_eq!(s.pipeline.workers, 3);
        assert_eq!(s.fetch.max_retries, 5);
        assert_eq!(s.require_llm().unwrap().api_key.as_deref(), Some("sk-env"));
    }
}
