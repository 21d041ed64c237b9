//! End-to-end analysis pipeline.
//!
//! Stages run strictly in sequence, each consuming the previous stage's
//! output. Ingestion and parsing are critical: their failure ends the run.
//! Every later stage degrades instead of failing the run, and the run
//! records which stages fell short and why.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AnalysisConfig;
use crate::error_handler::{AnalysisError, ErrorKind, ErrorLog, PipelineError, StageIssue};
use crate::features::{ExtractionSettings, FeatureExtractor};
use crate::hazards::HazardIdentifier;
use crate::ingestion::ProjectIngestor;
use crate::llm::{available_backend, SharedBackend};
use crate::models::{CodeChunk, Feature, ProjectStructure, Requirement, TestOutline};
use crate::persistence::{compute_fingerprint, RunStore};
use crate::progress::{ProgressEvent, ProgressReporter, StageStatus};
use crate::requirements::RequirementsGenerator;
use crate::risk_register::{RiskRegister, RiskRegisterBuilder};
use crate::template_engine::{ReportError, TemplateEngine, ANALYSIS_REPORT_TEMPLATE};
use crate::test_generator::CaseGenerator;
use crate::traceability::{TraceabilityBuilder, TraceabilityInputs, TraceabilityMatrix};

pub const TOTAL_STAGES: usize = 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Idle,
    Ingesting,
    Parsing,
    ExtractingFeatures,
    GeneratingRequirements,
    IdentifyingHazards,
    BuildingRiskRegister,
    GeneratingTests,
    BuildingTraceability,
    CompilingResults,
    Completed,
    Failed,
}

impl PipelineState {
    /// The stages counted in `stages_completed / total_stages`.
    pub const SCORED: [PipelineState; TOTAL_STAGES] = [
        PipelineState::Ingesting,
        PipelineState::Parsing,
        PipelineState::ExtractingFeatures,
        PipelineState::GeneratingRequirements,
        PipelineState::IdentifyingHazards,
        PipelineState::BuildingRiskRegister,
        PipelineState::GeneratingTests,
        PipelineState::BuildingTraceability,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::Ingesting => "Ingesting project",
            PipelineState::Parsing => "Parsing source",
            PipelineState::ExtractingFeatures => "Extracting features",
            PipelineState::GeneratingRequirements => "Generating requirements",
            PipelineState::IdentifyingHazards => "Identifying hazards",
            PipelineState::BuildingRiskRegister => "Building risk register",
            PipelineState::GeneratingTests => "Generating test outlines",
            PipelineState::BuildingTraceability => "Building traceability matrix",
            PipelineState::CompilingResults => "Compiling results",
            PipelineState::Completed => "Completed",
            PipelineState::Failed => "Failed",
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, PipelineState::Ingesting | PipelineState::Parsing)
    }

    pub fn percent(&self) -> u8 {
        match self {
            PipelineState::Idle => 0,
            PipelineState::Ingesting => 5,
            PipelineState::Parsing => 15,
            PipelineState::ExtractingFeatures => 30,
            PipelineState::GeneratingRequirements => 45,
            PipelineState::IdentifyingHazards => 60,
            PipelineState::BuildingRiskRegister => 70,
            PipelineState::GeneratingTests => 80,
            PipelineState::BuildingTraceability => 90,
            PipelineState::CompilingResults => 95,
            PipelineState::Completed | PipelineState::Failed => 100,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Succeeded,
    /// Produced output, but through fallbacks or with recoverable errors.
    Degraded,
    /// Nothing to work on because an upstream stage came up empty.
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    pub stage: PipelineState,
    pub outcome: StageOutcome,
    pub items: usize,
    pub duration_ms: u64,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisRun {
    pub run_id: String,
    /// Project fingerprint; empty when the project could not be fingerprinted.
    pub project_id: String,
    pub project_path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub status: RunStatus,
    pub state: PipelineState,
    pub stage_results: Vec<StageResult>,
    pub pipeline_errors: Vec<PipelineError>,
    pub warnings: Vec<String>,
    pub failure: Option<PipelineError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResults {
    pub run: AnalysisRun,
    pub project: ProjectStructure,
    pub chunks: Vec<CodeChunk>,
    pub features: Vec<Feature>,
    pub feature_confidence: f64,
    pub user_requirements: Vec<Requirement>,
    pub software_requirements: Vec<Requirement>,
    pub risk_register: RiskRegister,
    pub test_outline: TestOutline,
    pub traceability: TraceabilityMatrix,
    pub generation_method: String,
    pub stages_completed: usize,
    pub total_stages: usize,
}

impl AnalysisResults {
    fn empty(run: AnalysisRun, project: ProjectStructure) -> Self {
        Self {
            run,
            project,
            chunks: Vec::new(),
            features: Vec::new(),
            feature_confidence: 0.0,
            user_requirements: Vec::new(),
            software_requirements: Vec::new(),
            risk_register: RiskRegister::empty(),
            test_outline: TestOutline::default(),
            traceability: TraceabilityMatrix::default(),
            generation_method: "none".to_string(),
            stages_completed: 0,
            total_stages: TOTAL_STAGES,
        }
    }

    pub fn is_fully_analyzed(&self) -> bool {
        self.stages_completed == self.total_stages
    }

    /// "fully analyzed" or "analyzed with N/8 stages succeeded".
    pub fn completion_summary(&self) -> String {
        if self.is_fully_analyzed() {
            "fully analyzed".to_string()
        } else {
            format!(
                "analyzed with {}/{} stages succeeded",
                self.stages_completed, self.total_stages
            )
        }
    }

    /// Stages that did not fully succeed, with the recorded reason.
    pub fn shortfalls(&self) -> Vec<&StageResult> {
        self.run
            .stage_results
            .iter()
            .filter(|r| r.outcome != StageOutcome::Succeeded)
            .collect()
    }

    pub fn export_to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_markdown(&self, engine: &TemplateEngine) -> Result<String, ReportError> {
        let project_name = self
            .project
            .root_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.project.root_path.display().to_string());
        let data = serde_json::json!({
            "project_name": project_name,
            "run_id": self.run.run_id,
            "generated": self.run.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            "status": self.completion_summary(),
            "stages_completed": self.stages_completed,
            "total_stages": self.total_stages,
            "generation_method": self.generation_method,
            "features": self.features,
            "user_requirements": self.user_requirements,
            "software_requirements": self.software_requirements,
            "risks": self.risk_register.risks,
            "traceability": self.traceability.summary,
            "test_coverage": self.test_outline.coverage.coverage_percentage,
            "errors": self.run.pipeline_errors,
        });
        engine.render(ANALYSIS_REPORT_TEMPLATE, &data)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    pub results: AnalysisResults,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisRequest {
    pub root: PathBuf,
    /// Empty selects every source file under `root`.
    pub selected_files: Vec<PathBuf>,
    pub description: String,
}

impl AnalysisRequest {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.selected_files = files;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A run that ended FAILED, with the stage that stopped it.
#[derive(Debug, Error)]
#[error("analysis failed during {stage}: {source}")]
pub struct RunFailure {
    pub stage: PipelineState,
    #[source]
    pub source: AnalysisError,
    pub run: Option<Box<AnalysisRun>>,
}

impl RunFailure {
    pub fn is_cancelled(&self) -> bool {
        self.source.kind() == ErrorKind::Cancelled
    }
}

/// Read-only inputs shared by every stage of one run.
pub struct StageContext<'a> {
    pub run_id: &'a str,
    pub description: &'a str,
    pub backend: Option<&'a SharedBackend>,
    pub settings: &'a AnalysisConfig,
}

/// Mutable bookkeeping for one run. Only the orchestrator touches it.
struct RunRecorder<'a> {
    run: AnalysisRun,
    log: ErrorLog,
    progress: &'a ProgressReporter,
}

impl<'a> RunRecorder<'a> {
    fn enter(&mut self, stage: PipelineState) -> Instant {
        self.run.state = stage;
        debug!(run_id = %self.run.run_id, stage = %stage, "entering stage");
        self.progress.emit(stage, StageStatus::Started, stage.label());
        Instant::now()
    }

    fn finish(
        &mut self,
        stage: PipelineState,
        started: Instant,
        outcome: StageOutcome,
        items: usize,
        issues: &[StageIssue],
    ) {
        self.log.record_issues(stage, issues);
        let note = match outcome {
            StageOutcome::Succeeded => None,
            _ => issues.first().map(|issue| issue.message.clone()),
        };
        let (status, message) = match outcome {
            StageOutcome::Succeeded => (StageStatus::Completed, stage.label().to_string()),
            StageOutcome::Degraded => (
                StageStatus::Degraded,
                note.clone().unwrap_or_else(|| "completed with fallbacks".to_string()),
            ),
            StageOutcome::Skipped => (
                StageStatus::Skipped,
                note.clone().unwrap_or_else(|| "nothing to process".to_string()),
            ),
            StageOutcome::Failed => (
                StageStatus::Failed,
                note.clone().unwrap_or_else(|| "stage failed".to_string()),
            ),
        };
        self.progress.emit(stage, status, message);
        self.run.stage_results.push(StageResult {
            stage,
            outcome,
            items,
            duration_ms: started.elapsed().as_millis() as u64,
            note,
        });
    }

    fn stages_completed(&self) -> usize {
        self.run
            .stage_results
            .iter()
            .filter(|r| r.outcome == StageOutcome::Succeeded && PipelineState::SCORED.contains(&r.stage))
            .count()
    }
}

fn outcome_for(input_empty: bool, output_empty: bool, degraded: bool) -> StageOutcome {
    if input_empty {
        StageOutcome::Skipped
    } else if output_empty {
        StageOutcome::Failed
    } else if degraded {
        StageOutcome::Degraded
    } else {
        StageOutcome::Succeeded
    }
}

fn skipped_issue(stage: PipelineState, upstream: &str) -> Vec<StageIssue> {
    vec![StageIssue::new(
        ErrorKind::StageFailure,
        format!("{} skipped: no {} to work from", stage.label(), upstream),
    )]
}

fn empty_output_issue(what: &str) -> StageIssue {
    StageIssue::new(ErrorKind::StageFailure, format!("no {} produced", what))
}

fn next_run_id() -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    format!(
        "run-{}-{:04}",
        Utc::now().format("%Y%m%dT%H%M%S%3f"),
        SEQUENCE.fetch_add(1, Ordering::Relaxed)
    )
}

pub struct AnalysisOrchestrator {
    ingestor: Arc<dyn ProjectIngestor>,
    backend: Option<SharedBackend>,
    store: Option<Arc<dyn RunStore>>,
    settings: AnalysisConfig,
    use_cache: bool,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AnalysisOrchestrator {
    pub fn new(ingestor: Arc<dyn ProjectIngestor>, backend: Option<SharedBackend>, settings: AnalysisConfig) -> Self {
        Self {
            ingestor,
            backend,
            store: None,
            settings,
            use_cache: true,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Always analyze afresh. Finished runs are still stored.
    pub fn without_cache_lookup(mut self) -> Self {
        self.use_cache = false;
        self
    }

    async fn run_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut in_flight = self.in_flight.lock().await;
        Arc::clone(in_flight.entry(key.to_string()).or_default())
    }

    /// Drop the lock entry once no other run holds or waits on it.
    async fn release_run_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().await;
        // One reference in the map, one in `lock`.
        if Arc::strong_count(&lock) == 2 {
            in_flight.remove(key);
        }
    }

    pub async fn analyze(
        &self,
        request: AnalysisRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<AnalysisOutcome, RunFailure> {
        progress.emit(PipelineState::Idle, StageStatus::Started, "Preparing analysis");
        let candidates = self.ingestor.candidate_files(&request.root, &request.selected_files);
        let fingerprint = match compute_fingerprint(&request.root, &candidates).await {
            Ok(fingerprint) => Some(fingerprint),
            Err(e) => {
                debug!(root = %request.root.display(), error = %e, "project could not be fingerprinted");
                None
            }
        };

        // At most one in-flight run per fingerprint.
        let lock_key = fingerprint
            .clone()
            .unwrap_or_else(|| request.root.display().to_string());
        let lock = self.run_lock(&lock_key).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.analyze_locked(request, fingerprint, progress, cancel).await
        };
        self.release_run_lock(&lock_key, lock).await;
        outcome
    }

    async fn analyze_locked(
        &self,
        request: AnalysisRequest,
        fingerprint: Option<String>,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<AnalysisOutcome, RunFailure> {
        if let (true, Some(store), Some(fingerprint)) = (self.use_cache, &self.store, &fingerprint) {
            match store.load_latest_completed(fingerprint).await {
                Ok(Some(results)) => {
                    info!(run_id = %results.run.run_id, fingerprint = %fingerprint, "using cached analysis");
                    progress.emit(
                        PipelineState::Completed,
                        StageStatus::Cached,
                        format!("Loaded cached analysis {}", results.run.run_id),
                    );
                    return Ok(AnalysisOutcome {
                        results,
                        from_cache: true,
                    });
                }
                Ok(None) => debug!(fingerprint = %fingerprint, "no cached analysis"),
                Err(e) => warn!(error = %e, "cache lookup failed, analyzing afresh"),
            }
        }

        let run = AnalysisRun {
            run_id: next_run_id(),
            project_id: fingerprint.clone().unwrap_or_default(),
            project_path: request.root.clone(),
            timestamp: Utc::now(),
            status: RunStatus::Running,
            state: PipelineState::Idle,
            stage_results: Vec::new(),
            pipeline_errors: Vec::new(),
            warnings: Vec::new(),
            failure: None,
        };
        info!(run_id = %run.run_id, root = %request.root.display(), "analysis started");
        let mut recorder = RunRecorder {
            run,
            log: ErrorLog::new(),
            progress,
        };

        let results = self
            .run_stages(&mut recorder, &request, fingerprint.as_deref(), cancel)
            .await;
        match results {
            Ok(results) => Ok(AnalysisOutcome {
                results,
                from_cache: false,
            }),
            Err((stage, error)) => Err(self.fail(recorder, &request, fingerprint.as_deref(), stage, error).await),
        }
    }

    async fn run_stages(
        &self,
        recorder: &mut RunRecorder<'_>,
        request: &AnalysisRequest,
        fingerprint: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResults, (PipelineState, AnalysisError)> {
        let check_cancel = |stage: PipelineState| {
            if cancel.is_cancelled() {
                Err((stage, AnalysisError::Cancelled))
            } else {
                Ok(())
            }
        };

        check_cancel(PipelineState::Ingesting)?;
        let started = recorder.enter(PipelineState::Ingesting);
        let project = self
            .ingestor
            .ingest(&request.root, &request.selected_files, &request.description)
            .await
            .map_err(|e| (PipelineState::Ingesting, AnalysisError::from(e)))?;
        recorder.finish(
            PipelineState::Ingesting,
            started,
            StageOutcome::Succeeded,
            project.selected_files.len(),
            &[],
        );

        check_cancel(PipelineState::Parsing)?;
        let started = recorder.enter(PipelineState::Parsing);
        let chunks = self
            .ingestor
            .parse(&project)
            .await
            .map_err(|e| (PipelineState::Parsing, AnalysisError::from(e)))?;
        recorder.finish(PipelineState::Parsing, started, StageOutcome::Succeeded, chunks.len(), &[]);

        // One availability check per run; stages share the answer.
        let backend = available_backend(self.backend.as_ref()).await;
        if self.backend.is_some() && backend.is_none() {
            warn!("LLM backend configured but unreachable, stages will use fallbacks");
        }
        let run_id = recorder.run.run_id.clone();
        let ctx = StageContext {
            run_id: &run_id,
            description: &request.description,
            backend: backend.as_ref(),
            settings: &self.settings,
        };

        check_cancel(PipelineState::ExtractingFeatures)?;
        let started = recorder.enter(PipelineState::ExtractingFeatures);
        let extraction = FeatureExtractor::new(ctx.backend.cloned(), ExtractionSettings::from(ctx.settings))
            .assume_checked()
            .extract(&chunks, ctx.description)
            .await;
        let mut issues = extraction.errors.clone();
        if extraction.features.is_empty() {
            issues.push(empty_output_issue("features"));
        }
        for warning in &extraction.warnings {
            recorder.log.add_warning(warning.clone());
        }
        let outcome = outcome_for(
            chunks.is_empty(),
            extraction.features.is_empty(),
            extraction.used_fallback || !extraction.errors.is_empty(),
        );
        recorder.finish(
            PipelineState::ExtractingFeatures,
            started,
            outcome,
            extraction.features.len(),
            &issues,
        );
        let features = extraction.features;

        check_cancel(PipelineState::GeneratingRequirements)?;
        let started = recorder.enter(PipelineState::GeneratingRequirements);
        let requirements = if features.is_empty() {
            recorder.finish(
                PipelineState::GeneratingRequirements,
                started,
                StageOutcome::Skipped,
                0,
                &skipped_issue(PipelineState::GeneratingRequirements, "features"),
            );
            Default::default()
        } else {
            let generated = RequirementsGenerator::new(ctx.backend.cloned())
                .assume_checked()
                .generate(&features, ctx.description)
                .await;
            let mut issues = generated.errors.clone();
            if generated.software_requirements.is_empty() {
                issues.push(empty_output_issue("software requirements"));
            }
            let outcome = outcome_for(
                false,
                generated.software_requirements.is_empty(),
                generated.used_fallback || !generated.errors.is_empty(),
            );
            recorder.finish(
                PipelineState::GeneratingRequirements,
                started,
                outcome,
                generated.user_requirements.len() + generated.software_requirements.len(),
                &issues,
            );
            generated
        };
        let user_requirements = requirements.user_requirements;
        let software_requirements = requirements.software_requirements;

        check_cancel(PipelineState::IdentifyingHazards)?;
        let started = recorder.enter(PipelineState::IdentifyingHazards);
        let mut generation_method = "none";
        let risks = if software_requirements.is_empty() {
            recorder.finish(
                PipelineState::IdentifyingHazards,
                started,
                StageOutcome::Skipped,
                0,
                &skipped_issue(PipelineState::IdentifyingHazards, "software requirements"),
            );
            Vec::new()
        } else {
            let hazards = HazardIdentifier::new(
                ctx.backend.cloned(),
                ctx.settings.hazard_batch_size,
                ctx.settings.coercion,
            )
            .assume_checked()
            .identify(&software_requirements, ctx.description)
            .await;
            if hazards.coerced_values > 0 {
                recorder.log.add_warning(format!(
                    "{} severity/probability value(s) coerced by policy",
                    hazards.coerced_values
                ));
            }
            generation_method = if hazards.used_fallback { "rule_based" } else { "llm" };
            let mut issues = hazards.errors.clone();
            if hazards.risks.is_empty() {
                issues.push(empty_output_issue("risks"));
            }
            let outcome = outcome_for(
                false,
                hazards.risks.is_empty(),
                hazards.used_fallback || !hazards.errors.is_empty(),
            );
            recorder.finish(PipelineState::IdentifyingHazards, started, outcome, hazards.risks.len(), &issues);
            hazards.risks
        };

        check_cancel(PipelineState::BuildingRiskRegister)?;
        let started = recorder.enter(PipelineState::BuildingRiskRegister);
        let mut risk_register = RiskRegisterBuilder::build(risks, generation_method);
        risk_register.sort_by_priority();
        recorder.finish(
            PipelineState::BuildingRiskRegister,
            started,
            StageOutcome::Succeeded,
            risk_register.risks.len(),
            &[],
        );

        check_cancel(PipelineState::GeneratingTests)?;
        let started = recorder.enter(PipelineState::GeneratingTests);
        let all_requirements: Vec<Requirement> = user_requirements
            .iter()
            .chain(software_requirements.iter())
            .cloned()
            .collect();
        let test_outline = if all_requirements.is_empty() {
            recorder.finish(
                PipelineState::GeneratingTests,
                started,
                StageOutcome::Skipped,
                0,
                &skipped_issue(PipelineState::GeneratingTests, "requirements"),
            );
            TestOutline::default()
        } else {
            let generated = CaseGenerator::new(ctx.backend.cloned())
                .assume_checked()
                .generate(&all_requirements)
                .await;
            let mut issues = generated.errors.clone();
            issues.extend(
                generated
                    .outline
                    .validation_errors
                    .iter()
                    .map(|e| StageIssue::validation(e.clone())),
            );
            let outcome = outcome_for(
                false,
                generated.outline.test_cases.is_empty(),
                generated.outline.used_fallback || !issues.is_empty(),
            );
            recorder.finish(
                PipelineState::GeneratingTests,
                started,
                outcome,
                generated.outline.test_cases.len(),
                &issues,
            );
            generated.outline
        };

        check_cancel(PipelineState::BuildingTraceability)?;
        let started = recorder.enter(PipelineState::BuildingTraceability);
        let traceability = TraceabilityBuilder::new(ctx.settings.weak_link_threshold).build(
            ctx.run_id,
            TraceabilityInputs {
                chunks: &chunks,
                features: &features,
                user_requirements: &user_requirements,
                software_requirements: &software_requirements,
                risks: &risk_register.risks,
                test_cases: &test_outline.test_cases,
            },
        );
        recorder.finish(
            PipelineState::BuildingTraceability,
            started,
            StageOutcome::Succeeded,
            traceability.rows.len(),
            &[],
        );

        check_cancel(PipelineState::CompilingResults)?;
        recorder.enter(PipelineState::CompilingResults);
        let stages_completed = recorder.stages_completed();
        recorder.run.status = RunStatus::Completed;
        recorder.run.state = PipelineState::Completed;
        let (errors, warnings) = std::mem::take(&mut recorder.log).into_parts();
        recorder.run.pipeline_errors = errors;
        recorder.run.warnings = warnings;

        let mut results = AnalysisResults {
            run: recorder.run.clone(),
            project,
            chunks,
            feature_confidence: extraction.confidence_score,
            features,
            user_requirements,
            software_requirements,
            risk_register,
            test_outline,
            traceability,
            generation_method: generation_method.to_string(),
            stages_completed,
            total_stages: TOTAL_STAGES,
        };

        if let (Some(store), Some(fingerprint)) = (&self.store, fingerprint) {
            if let Err(e) = store.save_run(fingerprint, &results).await {
                let error = PipelineError::persistence(format!("results not cached: {}", e));
                warn!(error = %e, "could not store analysis run");
                results.run.pipeline_errors.push(error);
            }
        }

        info!(
            run_id = %results.run.run_id,
            stages_completed,
            total_stages = TOTAL_STAGES,
            errors = results.run.pipeline_errors.len(),
            "analysis completed"
        );
        recorder.progress.emit(
            PipelineState::Completed,
            StageStatus::Completed,
            format!("Analysis {}", results.completion_summary()),
        );
        Ok(results)
    }

    async fn fail(
        &self,
        mut recorder: RunRecorder<'_>,
        request: &AnalysisRequest,
        fingerprint: Option<&str>,
        stage: PipelineState,
        error: AnalysisError,
    ) -> RunFailure {
        let failure = PipelineError::from_error(stage, &error);
        warn!(run_id = %recorder.run.run_id, stage = %stage, error = %error, "analysis failed");
        recorder.progress.emit(stage, StageStatus::Failed, error.to_string());
        recorder.progress.emit(PipelineState::Failed, StageStatus::Failed, failure.message.clone());

        let (errors, warnings) = std::mem::take(&mut recorder.log).into_parts();
        recorder.run.pipeline_errors = errors;
        recorder.run.warnings = warnings;
        recorder.run.status = RunStatus::Failed;
        recorder.run.state = PipelineState::Failed;
        recorder.run.failure = Some(failure);

        // Failed runs are kept for the audit trail; they never satisfy a cache lookup.
        if let (Some(store), Some(fingerprint)) = (&self.store, fingerprint) {
            let project = ProjectStructure {
                root_path: request.root.clone(),
                selected_files: request.selected_files.clone(),
                description: request.description.clone(),
                metadata: Default::default(),
            };
            let record = AnalysisResults::empty(recorder.run.clone(), project);
            if let Err(e) = store.save_run(fingerprint, &record).await {
                warn!(error = %e, "could not store failed run");
            }
        }

        RunFailure {
            stage,
            source: error,
            run: Some(Box::new(recorder.run)),
        }
    }
}

/// A pipeline running on its own task.
pub struct AnalysisHandle {
    pub progress: UnboundedReceiver<ProgressEvent>,
    pub cancel: CancellationToken,
    task: JoinHandle<Result<AnalysisOutcome, RunFailure>>,
}

impl AnalysisHandle {
    /// Takes effect at the next stage boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<AnalysisOutcome, RunFailure> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(RunFailure {
                stage: PipelineState::Failed,
                source: AnalysisError::Stage(format!("analysis task aborted: {}", e)),
                run: None,
            }),
        }
    }
}

pub fn spawn_analysis(orchestrator: Arc<AnalysisOrchestrator>, request: AnalysisRequest) -> AnalysisHandle {
    let (reporter, progress) = ProgressReporter::channel();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move { orchestrator.analyze(request, &reporter, &token).await });
    AnalysisHandle { progress, cancel, task }
}
