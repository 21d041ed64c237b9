use medtrace::config::*;
use medtrace::llm::LlmBackend;
use std::env;

#[tokio::test]
async fn test_default_config() {
    let config = Config::default();

    assert_eq!(config.llm.provider, LlmProvider::None);
    assert_eq!(config.llm.timeout, 120);
    assert_eq!(config.analysis.dedup_threshold, 0.85);
    assert_eq!(config.analysis.weak_link_threshold, 0.7);
    assert_eq!(config.analysis.hazard_batch_size, 5);
    assert!(config.cache.enabled);
    assert!(!config.is_llm_configured());
    assert!(config.build_backend().is_none());
}

#[tokio::test]
async fn test_config_with_env_var() {
    env::set_var("MEDTRACE_API_KEY", "test-key-123");
    let config = Config::default();
    assert_eq!(config.llm.api_key, Some("test-key-123".to_string()));
    env::remove_var("MEDTRACE_API_KEY");
}

#[tokio::test]
async fn test_config_modification() {
    let mut config = Config::default();

    config.set_provider(LlmProvider::LocalServer);
    assert_eq!(config.llm.base_url.as_deref(), Some("http://localhost:11434"));
    assert_eq!(config.llm.model, "llama3.1:8b");

    config.set_model("qwen2.5-coder:7b".to_string());
    config.set_base_url("http://gpu-box:11434".to_string());
    assert_eq!(config.llm.model, "qwen2.5-coder:7b");
    assert_eq!(config.llm.base_url.as_deref(), Some("http://gpu-box:11434"));
    assert!(config.is_llm_configured());
    assert!(config.build_backend().is_some());

    config.set_provider(LlmProvider::None);
    assert!(config.llm.base_url.is_none());
}

#[test]
fn test_config_path() {
    let path = Config::config_path().unwrap();
    assert!(path.to_string_lossy().contains(".medtrace"));
    assert!(path.to_string_lossy().contains("config.yml"));
}

#[test]
fn test_provider_parsing() {
    assert_eq!(LlmProvider::parse("ollama"), Some(LlmProvider::LocalServer));
    assert_eq!(LlmProvider::parse("local-server"), Some(LlmProvider::LocalServer));
    assert_eq!(LlmProvider::parse("llama_cpp"), Some(LlmProvider::Llamacpp));
    assert_eq!(LlmProvider::parse("gpt"), None);
    assert_eq!(LlmProvider::LocalServer.to_string(), "local_server");
}

#[tokio::test]
async fn test_load_writes_defaults_and_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.yml");

    let created = Config::load_from(&path).await.unwrap();
    assert!(path.exists());
    assert_eq!(created.llm.provider, LlmProvider::None);

    let mut config = created.clone();
    config.set_provider(LlmProvider::Llamacpp);
    config.analysis.hazard_batch_size = 3;
    config.cache.enabled = false;
    config.save_to(&path).await.unwrap();

    let reloaded = Config::load_from(&path).await.unwrap();
    assert_eq!(reloaded, config);
}

#[tokio::test]
async fn test_partial_file_uses_section_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yml");
    std::fs::write(&path, "llm:\n  provider: llamacpp\n  base_url: http://localhost:9000\n  api_key: null\n").unwrap();

    let config = Config::load_from(&path).await.unwrap();
    assert_eq!(config.llm.provider, LlmProvider::Llamacpp);
    assert_eq!(config.llm.timeout, 120);
    assert_eq!(config.analysis, AnalysisConfig::default());
    assert!(config.cache.enabled);
}

#[test]
fn test_validation_flags_bad_values() {
    let mut config = Config::default();
    config.set_provider(LlmProvider::LocalServer);
    config.set_model(String::new());
    config.set_base_url("localhost:11434".to_string());
    config.analysis.weak_link_threshold = 1.5;
    config.analysis.hazard_batch_size = 0;

    let result = config.validate();
    assert!(!result.is_valid);
    assert!(result.issues.iter().any(|i| i.contains("Model name")));
    assert!(result.issues.iter().any(|i| i.contains("http://")));
    assert!(result.issues.iter().any(|i| i.contains("weak_link_threshold")));
    assert!(result.issues.iter().any(|i| i.contains("hazard_batch_size")));
}

#[test]
fn test_validation_warns_when_llm_disabled() {
    let result = Config::default().validate();
    assert!(result.is_valid);
    assert!(result.warnings.iter().any(|w| w.contains("disabled")));
}

#[test]
fn test_cache_directory_override() {
    let mut config = Config::default();
    config.cache.directory = Some("/tmp/medtrace-cache".into());
    assert_eq!(config.cache_directory().unwrap(), std::path::PathBuf::from("/tmp/medtrace-cache"));
}

#[tokio::test]
async fn test_mock_provider_backend_reports_unavailable() {
    let mut config = Config::default();
    config.set_provider(LlmProvider::Mock);
    assert!(config.is_llm_configured());

    let backend = config.build_backend().unwrap();
    assert_eq!(backend.name(), "mock");
    assert!(!backend.is_available().await);
    assert!(medtrace::llm::available_backend(Some(&backend)).await.is_none());
}
