use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

use crate::hazards::CoercionPolicy;
use crate::llm::{LlamaCppBackend, LocalServerBackend, MockBackend, SharedBackend};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub llm: LlmConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[default]
    None,
    LocalServer,
    Llamacpp,
    Mock,
}

impl LlmProvider {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "none" => Some(LlmProvider::None),
            "local_server" | "ollama" | "openai_compatible" => Some(LlmProvider::LocalServer),
            "llamacpp" | "llama_cpp" => Some(LlmProvider::Llamacpp),
            "mock" => Some(LlmProvider::Mock),
            _ => None,
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LlmProvider::None => "none",
            LlmProvider::LocalServer => "local_server",
            LlmProvider::Llamacpp => "llamacpp",
            LlmProvider::Mock => "mock",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default)]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    pub api_key: Option<String>,
}

fn default_timeout() -> u64 {
    120
}

/// Tunables for the generation stages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    pub batch_token_budget: usize,
    pub max_chunk_tokens: usize,
    pub dedup_threshold: f64,
    pub heuristic_confidence: f64,
    pub max_consecutive_failures: usize,
    pub hazard_batch_size: usize,
    pub weak_link_threshold: f64,
    pub coercion: CoercionPolicy,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            batch_token_budget: 3000,
            max_chunk_tokens: 1500,
            dedup_threshold: 0.85,
            heuristic_confidence: 0.3,
            max_consecutive_failures: 2,
            hazard_batch_size: 5,
            weak_link_threshold: 0.7,
            coercion: CoercionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub directory: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig {
                provider: LlmProvider::None,
                model: String::new(),
                base_url: None,
                timeout: default_timeout(),
                api_key: std::env::var("MEDTRACE_API_KEY").ok(),
            },
            analysis: AnalysisConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(".medtrace"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.yml"))
    }

    /// Load `~/.medtrace/config.yml`, writing the defaults on first use.
    pub async fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?).await
    }

    pub async fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let content = fs::read_to_string(config_path).await?;
            let config: Config = serde_yaml::from_str(&content)?;
            debug!(path = %config_path.display(), provider = %config.llm.provider, "loaded configuration");
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(config_path).await?;
            Ok(config)
        }
    }

    pub async fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?).await
    }

    pub async fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_yaml::to_string(self)?;
        fs::write(config_path, content).await?;

        Ok(())
    }

    pub fn set_api_key(&mut self, api_key: String) {
        self.llm.api_key = Some(api_key);
    }

    pub fn set_model(&mut self, model: String) {
        self.llm.model = model;
    }

    pub fn set_base_url(&mut self, base_url: String) {
        self.llm.base_url = Some(base_url);
    }

    pub fn set_provider(&mut self, provider: LlmProvider) {
        self.llm.provider = provider;

        match provider {
            LlmProvider::LocalServer => {
                if self.llm.base_url.is_none() {
                    self.llm.base_url = Some("http://localhost:11434".to_string());
                }
                if self.llm.model.is_empty() {
                    self.llm.model = "llama3.1:8b".to_string();
                }
            }
            LlmProvider::Llamacpp => {
                if self.llm.base_url.is_none() {
                    self.llm.base_url = Some("http://localhost:8080".to_string());
                }
            }
            LlmProvider::Mock | LlmProvider::None => {
                self.llm.base_url = None;
            }
        }
    }

    pub fn is_llm_configured(&self) -> bool {
        match self.llm.provider {
            LlmProvider::None => false,
            LlmProvider::LocalServer => !self.llm.model.is_empty() && self.llm.base_url.is_some(),
            LlmProvider::Llamacpp => self.llm.base_url.is_some(),
            LlmProvider::Mock => true,
        }
    }

    pub fn cache_directory(&self) -> Result<PathBuf> {
        match &self.cache.directory {
            Some(directory) => Ok(directory.clone()),
            None => Ok(Self::config_dir()?.join("cache")),
        }
    }

    /// Pick the backend implementation once, from configuration.
    /// `None` means every stage runs its heuristic fallback.
    pub fn build_backend(&self) -> Option<SharedBackend> {
        let base_url = self.llm.base_url.as_deref();
        match self.llm.provider {
            LlmProvider::None => None,
            LlmProvider::LocalServer => {
                let backend = LocalServerBackend::new(
                    base_url.unwrap_or("http://localhost:11434"),
                    &self.llm.model,
                    self.llm.timeout,
                )
                .with_api_key(self.llm.api_key.clone());
                Some(Arc::new(backend))
            }
            LlmProvider::Llamacpp => Some(Arc::new(LlamaCppBackend::new(
                base_url.unwrap_or("http://localhost:8080"),
                self.llm.timeout,
            ))),
            // Unscripted, so it reports itself offline and stages go straight to fallbacks.
            LlmProvider::Mock => Some(Arc::new(MockBackend::unavailable())),
        }
    }

    pub fn validate(&self) -> ValidationResult {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        match self.llm.provider {
            LlmProvider::LocalServer => {
                if self.llm.model.is_empty() {
                    issues.push("Model name is required for the local server provider".to_string());
                }
                if self.llm.base_url.is_none() {
                    warnings.push("No base URL set, using http://localhost:11434".to_string());
                }
            }
            LlmProvider::Llamacpp => {
                if self.llm.base_url.is_none() {
                    warnings.push("No base URL set, using http://localhost:8080".to_string());
                }
            }
            LlmProvider::Mock => {
                warnings.push("Mock provider selected: every stage will use heuristic fallbacks".to_string());
            }
            LlmProvider::None => {
                warnings.push(
                    "LLM features are disabled. Configure a provider to enable model-driven analysis"
                        .to_string(),
                );
            }
        }

        if let Some(base_url) = &self.llm.base_url {
            if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                issues.push(format!("Base URL must start with http:// or https://: {}", base_url));
            }
        }

        if self.llm.timeout == 0 {
            warnings.push("Timeout is set to 0, which may cause immediate timeouts".to_string());
        } else if self.llm.timeout > 600 {
            warnings.push("Timeout is very high (>10 minutes), consider reducing it".to_string());
        }

        let analysis = &self.analysis;
        for (name, value) in [
            ("dedup_threshold", analysis.dedup_threshold),
            ("heuristic_confidence", analysis.heuristic_confidence),
            ("weak_link_threshold", analysis.weak_link_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                issues.push(format!("{} must be between 0.0 and 1.0", name));
            }
        }
        if analysis.batch_token_budget == 0 {
            issues.push("batch_token_budget must be greater than 0".to_string());
        }
        if analysis.max_chunk_tokens > analysis.batch_token_budget {
            warnings.push("max_chunk_tokens exceeds batch_token_budget; large chunks will be batched alone".to_string());
        }
        if analysis.hazard_batch_size == 0 {
            issues.push("hazard_batch_size must be greater than 0".to_string());
        }
        if analysis.max_consecutive_failures == 0 {
            warnings.push("max_consecutive_failures is 0: the first failed batch switches to heuristics".to_string());
        }

        ValidationResult {
            is_valid: issues.is_empty(),
            issues,
            warnings,
        }
    }
}

#[derive(Debug)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}
