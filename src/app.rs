use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

use crate::cli::{Commands, OutputFormat, ProviderArg};
use crate::config::{Config, LlmProvider};
use crate::error_handler::ErrorSummary;
use crate::ingestion::SourceIngestor;
use crate::llm::available_backend;
use crate::models::RiskLevel;
use crate::orchestrator::{spawn_analysis, AnalysisOrchestrator, AnalysisRequest, AnalysisResults};
use crate::persistence::{FileRunStore, MemoryRunStore, RunStore};
use crate::progress::ConsoleProgress;
use crate::template_engine::TemplateEngine;

pub struct App {
    config: Config,
}

impl App {
    pub async fn new() -> Result<Self> {
        let config = Config::load().await?;
        Ok(Self { config })
    }

    pub fn with_config(config: Config) -> Self {
        Self { config }
    }

    pub async fn run_command(&mut self, command: Commands) -> Result<()> {
        match command {
            Commands::Analyze {
                path,
                file,
                description,
                output,
                format,
                no_cache,
            } => {
                self.analyze(path, file, description, output, format, no_cache).await?;
            }
            Commands::Config {
                provider,
                model,
                base_url,
                api_key,
                show,
                validate,
                test,
            } => {
                let mut changed = false;
                if let Some(provider) = provider {
                    self.config.set_provider(provider_from_arg(provider));
                    println!("✅ Provider set to: {}", self.config.llm.provider);
                    changed = true;
                }
                if let Some(model) = model {
                    self.config.set_model(model);
                    println!("✅ Model set to: {}", self.config.llm.model);
                    changed = true;
                }
                if let Some(base_url) = base_url {
                    self.config.set_base_url(base_url);
                    println!("✅ Base URL updated");
                    changed = true;
                }
                if let Some(api_key) = api_key {
                    self.config.set_api_key(api_key);
                    println!("✅ API key updated");
                    changed = true;
                }
                if changed {
                    self.config.save().await?;
                    println!("💾 Configuration saved to {}", Config::config_path()?.display());
                }

                if show {
                    self.show_config()?;
                }
                if validate {
                    self.validate_config();
                }
                if test {
                    self.test_backend().await;
                }
                if !changed && !show && !validate && !test {
                    println!("💡 Use --show to view the configuration, or --help for available options");
                }
            }
        }
        Ok(())
    }

    async fn analyze(
        &self,
        path: PathBuf,
        files: Vec<PathBuf>,
        description: Option<String>,
        output: Option<PathBuf>,
        format: OutputFormat,
        no_cache: bool,
    ) -> Result<()> {
        println!("🔍 Analyzing {}", path.display());
        if !self.config.is_llm_configured() {
            println!("💡 No LLM configured, heuristic analysis only. Run 'medtrace config --provider local-server' to enable one.");
        }

        let ingestor = Arc::new(SourceIngestor::new().context("Failed to build source parser")?);
        let mut orchestrator =
            AnalysisOrchestrator::new(ingestor, self.config.build_backend(), self.config.analysis.clone());
        orchestrator = orchestrator.with_store(self.run_store()?);
        if no_cache {
            orchestrator = orchestrator.without_cache_lookup();
        }

        let request = AnalysisRequest::new(path)
            .with_files(files)
            .with_description(description.unwrap_or_default());
        let mut handle = spawn_analysis(Arc::new(orchestrator), request);

        let console = ConsoleProgress::new(true);
        let cancel = handle.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("\n⏹️  Cancelling after the current stage...");
                cancel.cancel();
            }
        });
        while let Some(event) = handle.progress.recv().await {
            console.render(&event);
        }

        let outcome = match handle.join().await {
            Ok(outcome) => outcome,
            Err(failure) => {
                if failure.is_cancelled() {
                    println!("⏹️  Analysis cancelled during {}", failure.stage);
                } else {
                    println!("❌ Analysis failed during {}: {}", failure.stage, failure.source);
                }
                return Err(failure.into());
            }
        };
        let results = outcome.results;
        console.finish(&format!("Analysis {}", results.completion_summary()));
        if outcome.from_cache {
            println!("💾 Results served from cache (run {}). Use --no-cache to analyze afresh.", results.run.run_id);
        }

        self.print_summary(&results);

        let engine = TemplateEngine::new()?;
        match format {
            OutputFormat::Json => println!("{}", results.export_to_json()?),
            OutputFormat::Markdown => println!("\n{}", results.render_markdown(&engine)?),
        }

        if let Some(output) = output {
            let written = write_exports(&results, &engine, &output).await?;
            println!("📁 Wrote {} files to {}", written.len(), output.display());
            for file in written {
                println!("   • {}", file.display());
            }
        }

        Ok(())
    }

    fn run_store(&self) -> Result<Arc<dyn RunStore>> {
        if self.config.cache.enabled {
            let directory = self.config.cache_directory()?;
            debug!(directory = %directory.display(), "using on-disk run store");
            Ok(Arc::new(FileRunStore::new(directory)))
        } else {
            Ok(Arc::new(MemoryRunStore::new()))
        }
    }

    fn print_summary(&self, results: &AnalysisResults) {
        println!("\n📊 Analysis Summary");
        println!("   Run: {}", results.run.run_id);
        println!("   Status: {}", results.completion_summary());
        println!("   Files: {}", results.project.selected_files.len());
        println!("   Code chunks: {}", results.chunks.len());
        println!(
            "   Features: {} (confidence {:.0}%)",
            results.features.len(),
            results.feature_confidence * 100.0
        );
        println!(
            "   Requirements: {} user, {} software",
            results.user_requirements.len(),
            results.software_requirements.len()
        );

        let risks = results.risk_register.summary();
        println!(
            "   Risks: {} ({} unacceptable, {} undesirable, {} acceptable, {} negligible)",
            risks.total,
            risks.count(RiskLevel::Unacceptable),
            risks.count(RiskLevel::Undesirable),
            risks.count(RiskLevel::Acceptable),
            risks.count(RiskLevel::Negligible)
        );
        println!(
            "   Test cases: {} ({:.1}% requirement coverage)",
            results.test_outline.test_cases.len(),
            results.test_outline.coverage.coverage_percentage
        );
        println!(
            "   Traceability: {} rows, {} gaps",
            results.traceability.summary.total_rows, results.traceability.summary.gap_rows
        );

        let shortfalls = results.shortfalls();
        if !shortfalls.is_empty() {
            println!("\n⚠️  Stages that fell short:");
            for stage in shortfalls {
                match &stage.note {
                    Some(note) => println!("   • {} ({:?}): {}", stage.stage, stage.outcome, note),
                    None => println!("   • {} ({:?})", stage.stage, stage.outcome),
                }
            }
        }
        let errors = ErrorSummary::from_run(&results.run.pipeline_errors, &results.run.warnings);
        if errors.total_errors > 0 {
            println!("\n❌ Errors recorded: {}", errors.total_errors);
            for (kind, count) in &errors.error_counts {
                println!("   {:?}: {}", kind, count);
            }
            for error in results.run.pipeline_errors.iter().take(10) {
                println!("   • [{}] {}", error.stage, error.message);
            }
        }
        if errors.total_warnings > 0 {
            println!("\n⚠️  Warnings: {}", errors.total_warnings);
            for warning in &results.run.warnings {
                println!("   {}", warning);
            }
        }
    }

    fn show_config(&self) -> Result<()> {
        println!("📋 Current Configuration:");
        println!("   Config file: {}", Config::config_path()?.display());
        println!("   LLM provider: {}", self.config.llm.provider);
        if !self.config.llm.model.is_empty() {
            println!("   Model: {}", self.config.llm.model);
        }
        if let Some(base_url) = &self.config.llm.base_url {
            println!("   Base URL: {}", base_url);
        }
        println!("   Timeout: {}s", self.config.llm.timeout);
        println!(
            "   API key: {}",
            if self.config.llm.api_key.is_some() { "set" } else { "not set" }
        );
        println!("   Hazard batch size: {}", self.config.analysis.hazard_batch_size);
        println!("   Dedup threshold: {}", self.config.analysis.dedup_threshold);
        println!("   Weak link threshold: {}", self.config.analysis.weak_link_threshold);
        println!(
            "   Cache: {}",
            if self.config.cache.enabled { "enabled" } else { "disabled" }
        );
        if self.config.cache.enabled {
            println!("   Cache directory: {}", self.config.cache_directory()?.display());
        }
        Ok(())
    }

    fn validate_config(&self) {
        println!("🔍 Validating configuration...");
        let result = self.config.validate();

        if result.is_valid {
            println!("✅ Configuration is valid!");
        } else {
            println!("❌ Configuration issues found:");
            for issue in &result.issues {
                println!("   • {}", issue);
            }
        }

        if !result.warnings.is_empty() {
            println!("⚠️  Warnings:");
            for warning in &result.warnings {
                println!("   • {}", warning);
            }
        }
    }

    async fn test_backend(&self) {
        println!("🧪 Testing LLM backend...");
        let Some(backend) = self.config.build_backend() else {
            println!("⚠️  No LLM provider configured; analysis will use heuristics.");
            return;
        };
        match available_backend(Some(&backend)).await {
            Some(backend) => println!("✅ {} backend is reachable", backend.name()),
            None => {
                warn!(backend = backend.name(), "backend availability check failed");
                println!("❌ {} backend is not reachable", backend.name());
                println!("💡 Check that the server is running and the base URL is correct");
            }
        }
    }
}

fn provider_from_arg(provider: ProviderArg) -> LlmProvider {
    match provider {
        ProviderArg::None => LlmProvider::None,
        ProviderArg::LocalServer => LlmProvider::LocalServer,
        ProviderArg::Llamacpp => LlmProvider::Llamacpp,
        ProviderArg::Mock => LlmProvider::Mock,
    }
}

/// Write every artifact of a run into `directory`, returning the paths written.
pub async fn write_exports(results: &AnalysisResults, engine: &TemplateEngine, directory: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(directory)
        .await
        .with_context(|| format!("Failed to create output directory {}", directory.display()))?;

    let requirements = serde_json::json!({
        "user_requirements": results.user_requirements,
        "software_requirements": results.software_requirements,
    });
    let outline = &results.test_outline;
    let artifacts: Vec<(&str, String)> = vec![
        ("analysis.json", results.export_to_json()?),
        ("features.json", serde_json::to_string_pretty(&results.features)?),
        ("requirements.json", serde_json::to_string_pretty(&requirements)?),
        ("risk_register.csv", results.risk_register.export_to_csv()),
        ("risk_register.json", results.risk_register.export_to_json()?),
        ("traceability.csv", results.traceability.export_to_csv()),
        ("traceability.json", results.traceability.export_to_json()?),
        ("test_cases.txt", outline.export_to_text(engine)?),
        ("test_cases.json", outline.export_to_json()?),
        ("test_cases.xml", outline.export_to_xml()),
        ("test_cases.csv", outline.export_to_csv()),
        ("report.md", results.render_markdown(engine)?),
    ];

    let mut written = Vec::with_capacity(artifacts.len());
    for (name, content) in artifacts {
        let path = directory.join(name);
        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
