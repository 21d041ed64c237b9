use medtrace::config::AnalysisConfig;
use medtrace::ingestion::SourceIngestor;
use medtrace::llm::{MockBackend, SharedBackend};
use medtrace::models::{RiskLevel, Severity};
use medtrace::orchestrator::{
    spawn_analysis, AnalysisOrchestrator, AnalysisRequest, PipelineState, RunStatus, StageOutcome,
};
use medtrace::persistence::{compute_fingerprint, FileRunStore, MemoryRunStore, RunStore};
use medtrace::progress::{ProgressReporter, StageStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const RATE_C: &str = r#"#include "pump.h"

/* Reject rates outside the configured limits. */
int validate_rate(int rate)
{
    if (rate < 0 || rate > 999) {
        return -1;
    }
    return 0;
}
"#;

const PUMP_C: &str = r#"int validate_rate(int rate)
{
    return rate >= 0 && rate <= 999;
}

void raise_alarm(int level)
{
    buzzer_on(level);
}

int compute_dose(int weight, int rate)
{
    return weight * rate;
}
"#;

const FEATURES_RESPONSE: &str = r#"{"features": [{"description": "validate_rate rejects infusion rates outside limits", "category": "Input Validation", "confidence": 0.9}]}"#;
const USER_REQUIREMENT_RESPONSE: &str = r#"{"text": "The user shall be able to rely on infusion rate limits", "acceptance_criteria": ["Rates outside limits are refused"], "derived_from": ["FEAT_0001"]}"#;
const SOFTWARE_REQUIREMENTS_RESPONSE: &str = r#"```json
{"software_requirements": [{"text": "The software shall reject infusion rates above the configured maximum", "acceptance_criteria": ["A rate above the maximum returns an error"]}]}
```"#;
const HAZARDS_RESPONSE: &str = r#"{"hazards": [{"requirement_id": "SR_0001", "hazard": "Over-infusion", "cause": "Rate limit not enforced", "effect": "Drug overdose", "severity": "CATASTROPHIC", "probability": "LOW", "mitigation": "Range check before delivery", "verification": "Boundary value test"}]}"#;
const TEST_CASE_RESPONSE: &str = r#"{"description": "Boundary check of rate limits", "preconditions": ["Pump is idle"], "steps": [{"action": "Enter a rate of 1000", "expected_result": "The rate is rejected"}]}"#;

fn project(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
    dir
}

fn scripted_backend() -> Arc<MockBackend> {
    Arc::new(
        MockBackend::new()
            .with_response("Identify the user-visible", FEATURES_RESPONSE)
            .with_response("Write ONE user requirement", USER_REQUIREMENT_RESPONSE)
            .with_response("Derive 1 to 3 verifiable", SOFTWARE_REQUIREMENTS_RESPONSE)
            .with_response("Identify the hazards", HAZARDS_RESPONSE)
            .with_response("manual verification test outline", TEST_CASE_RESPONSE),
    )
}

fn orchestrator(backend: Option<SharedBackend>, store: Arc<dyn RunStore>) -> AnalysisOrchestrator {
    AnalysisOrchestrator::new(
        Arc::new(SourceIngestor::new().unwrap()),
        backend,
        AnalysisConfig::default(),
    )
    .with_store(store)
}

async fn run(orchestrator: &AnalysisOrchestrator, root: &Path) -> medtrace::orchestrator::AnalysisOutcome {
    orchestrator
        .analyze(
            AnalysisRequest::new(root).with_description("Infusion pump"),
            &ProgressReporter::silent(),
            &CancellationToken::new(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_scripted_llm_run_is_fully_analyzed() {
    let dir = project(&[("src/rate.c", RATE_C)]);
    let backend = scripted_backend();
    let orchestrator = orchestrator(Some(backend.clone() as SharedBackend), Arc::new(MemoryRunStore::new()));

    let outcome = run(&orchestrator, dir.path()).await;
    let results = outcome.results;

    assert!(!outcome.from_cache);
    assert_eq!(results.run.status, RunStatus::Completed);
    assert_eq!(results.completion_summary(), "fully analyzed");
    assert!(results.shortfalls().is_empty());
    assert_eq!(results.generation_method, "llm");

    assert_eq!(results.features.len(), 1);
    assert_eq!(results.features[0].id, "FEAT_0001");
    assert_eq!(results.features[0].evidence[0].start_line, 4);
    assert_eq!(results.user_requirements[0].derived_from, vec!["FEAT_0001"]);
    assert_eq!(results.software_requirements[0].id, "SR_0001");
    assert_eq!(results.software_requirements[0].derived_from, vec!["UR_0001"]);

    let risk = &results.risk_register.risks[0];
    assert_eq!(risk.severity, Severity::Catastrophic);
    assert_eq!(risk.risk_level, RiskLevel::Undesirable);
    assert_eq!(risk.related_requirements, vec!["SR_0001"]);

    assert_eq!(results.test_outline.test_cases.len(), 2);
    assert_eq!(results.test_outline.coverage.coverage_percentage, 100.0);
    assert!(results.traceability.gaps().is_empty());
    assert!(backend.call_count() >= 5);
    assert_eq!(backend.availability_checks(), 1);
}

#[tokio::test]
async fn test_partial_llm_failure_still_gives_every_chunk_a_feature() {
    let dir = project(&[("pump.c", PUMP_C)]);
    let backend = Arc::new(
        MockBackend::new()
            .with_sequence(&[
                "The first function validates input.",
                "As said, it validates input.",
                r#"{"features": [{"description": "Audible alarm raised at the requested level", "category": "Alarms and Alerts", "confidence": 0.8}]}"#,
                r#"{"features": [{"description": "Dose computed from patient weight and rate", "category": "Dosing", "confidence": 0.85}]}"#,
            ])
            .with_response("Write ONE user requirement", USER_REQUIREMENT_RESPONSE)
            .with_response("Derive 1 to 3 verifiable", SOFTWARE_REQUIREMENTS_RESPONSE)
            .with_response("Identify the hazards", HAZARDS_RESPONSE)
            .with_response("manual verification test outline", TEST_CASE_RESPONSE),
    );
    let settings = AnalysisConfig {
        batch_token_budget: 1,
        ..AnalysisConfig::default()
    };
    let orchestrator = AnalysisOrchestrator::new(
        Arc::new(SourceIngestor::new().unwrap()),
        Some(backend.clone() as SharedBackend),
        settings,
    );

    let results = run(&orchestrator, dir.path()).await.results;

    assert_eq!(results.chunks.len(), 3);
    for chunk in &results.chunks {
        assert!(
            results.features.iter().any(|f| f.evidence.contains(&chunk.reference())),
            "no feature covers {}",
            chunk.reference()
        );
    }
    assert_eq!(results.features.len(), 3);
    assert_eq!(results.features.iter().filter(|f| f.confidence == 0.3).count(), 1);

    let extraction = results
        .run
        .stage_results
        .iter()
        .find(|r| r.stage == PipelineState::ExtractingFeatures)
        .unwrap();
    assert_eq!(extraction.outcome, StageOutcome::Degraded);
    assert!(results
        .run
        .pipeline_errors
        .iter()
        .any(|e| e.stage == PipelineState::ExtractingFeatures && e.message.starts_with("batch 1:")));
}

#[tokio::test]
async fn test_unavailable_llm_degrades_to_heuristics() {
    let dir = project(&[("pump.c", PUMP_C)]);
    let orchestrator = orchestrator(Some(Arc::new(MockBackend::unavailable()) as SharedBackend), Arc::new(MemoryRunStore::new()));

    let results = run(&orchestrator, dir.path()).await.results;

    assert_eq!(results.chunks.len(), 3);
    assert_eq!(results.features.len(), 3);
    assert!(results.features.iter().all(|f| f.confidence == 0.3));
    assert!(!results.user_requirements.is_empty());
    assert_eq!(results.software_requirements.len(), 3);
    assert_eq!(results.risk_register.risks.len(), 3);
    assert_eq!(results.generation_method, "rule_based");
    assert!(!results.test_outline.test_cases.is_empty());

    assert_eq!(results.run.status, RunStatus::Completed);
    assert_eq!(results.stages_completed, 4);
    assert_eq!(results.completion_summary(), "analyzed with 4/8 stages succeeded");
    let degraded: Vec<PipelineState> = results
        .shortfalls()
        .iter()
        .filter(|r| r.outcome == StageOutcome::Degraded)
        .map(|r| r.stage)
        .collect();
    assert!(degraded.contains(&PipelineState::ExtractingFeatures));
    assert!(degraded.contains(&PipelineState::IdentifyingHazards));
    assert!(!results.run.pipeline_errors.is_empty());
}

#[tokio::test]
async fn test_second_run_served_from_cache_without_llm_calls() {
    let dir = project(&[("src/rate.c", RATE_C)]);
    let cache = tempfile::tempdir().unwrap();
    let backend = scripted_backend();
    let orchestrator = orchestrator(Some(backend.clone() as SharedBackend), Arc::new(FileRunStore::new(cache.path())));

    let first = run(&orchestrator, dir.path()).await;
    let calls_after_first = backend.call_count();
    assert!(!first.from_cache);
    assert!(calls_after_first > 0);

    let second = run(&orchestrator, dir.path()).await;
    assert!(second.from_cache);
    assert_eq!(backend.call_count(), calls_after_first);
    assert_eq!(second.results, first.results);
}

#[tokio::test]
async fn test_changed_source_or_no_cache_runs_afresh() {
    let dir = project(&[("src/rate.c", RATE_C)]);
    let store: Arc<MemoryRunStore> = Arc::new(MemoryRunStore::new());
    let backend = scripted_backend();
    let cached = orchestrator(Some(backend.clone() as SharedBackend), store.clone());

    let first = run(&cached, dir.path()).await;
    std::fs::write(dir.path().join("src/rate.c"), format!("{}\n/* revised */\n", RATE_C)).unwrap();
    let second = run(&cached, dir.path()).await;
    assert!(!second.from_cache);
    assert_ne!(second.results.run.project_id, first.results.run.project_id);

    let fresh = orchestrator(Some(backend.clone() as SharedBackend), store.clone()).without_cache_lookup();
    let third = run(&fresh, dir.path()).await;
    assert!(!third.from_cache);
    assert_ne!(third.results.run.run_id, second.results.run.run_id);
    assert_eq!(store.run_count(&second.results.run.project_id).await, 2);
}

#[tokio::test]
async fn test_concurrent_runs_on_same_project_analyze_once() {
    let dir = project(&[("pump.c", PUMP_C)]);
    let store = Arc::new(MemoryRunStore::new());
    let orchestrator = Arc::new(orchestrator(None, store.clone()));

    let (a, b) = tokio::join!(run(&orchestrator, dir.path()), run(&orchestrator, dir.path()));

    assert_eq!([a.from_cache, b.from_cache].iter().filter(|c| **c).count(), 1);
    assert_eq!(a.results.run.run_id, b.results.run.run_id);
    assert_eq!(store.run_count(&a.results.run.project_id).await, 1);
}

#[tokio::test]
async fn test_cancelled_run_fails_and_is_never_cached() {
    let dir = project(&[("pump.c", PUMP_C)]);
    let store = Arc::new(MemoryRunStore::new());
    let orchestrator = orchestrator(None, store.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let failure = orchestrator
        .analyze(AnalysisRequest::new(dir.path()), &ProgressReporter::silent(), &cancel)
        .await
        .unwrap_err();
    assert!(failure.is_cancelled());
    assert_eq!(failure.stage, PipelineState::Ingesting);
    let failed_run = failure.run.unwrap();
    assert_eq!(failed_run.status, RunStatus::Failed);
    assert_eq!(store.run_count(&failed_run.project_id).await, 1);

    let retry = run(&orchestrator, dir.path()).await;
    assert!(!retry.from_cache);
    assert_eq!(store.run_count(&failed_run.project_id).await, 2);
}

#[tokio::test]
async fn test_missing_project_fails_at_ingestion() {
    let orchestrator = orchestrator(None, Arc::new(MemoryRunStore::new()));
    let failure = orchestrator
        .analyze(
            AnalysisRequest::new("/no/such/project"),
            &ProgressReporter::silent(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(failure.stage, PipelineState::Ingesting);
    assert!(!failure.is_cancelled());
    assert!(failure.to_string().contains("not found"));
}

#[tokio::test]
async fn test_project_without_sources_fails_at_ingestion() {
    let dir = project(&[("README.md", "# pump\n")]);
    let orchestrator = orchestrator(None, Arc::new(MemoryRunStore::new()));
    let failure = orchestrator
        .analyze(AnalysisRequest::new(dir.path()), &ProgressReporter::silent(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failure.stage, PipelineState::Ingesting);
    assert_eq!(failure.run.unwrap().failure.unwrap().stage, PipelineState::Ingesting);
}

#[tokio::test]
async fn test_selected_files_limit_the_analysis() {
    let dir = project(&[("pump.c", PUMP_C), ("src/rate.c", RATE_C)]);
    let orchestrator = orchestrator(None, Arc::new(MemoryRunStore::new()));

    let outcome = orchestrator
        .analyze(
            AnalysisRequest::new(dir.path()).with_files(vec![PathBuf::from("src/rate.c")]),
            &ProgressReporter::silent(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.results.project.selected_files, vec![PathBuf::from("src/rate.c")]);
    assert_eq!(outcome.results.chunks.len(), 1);
}

#[tokio::test]
async fn test_spawned_analysis_streams_progress() {
    let dir = project(&[("pump.c", PUMP_C)]);
    let orchestrator = Arc::new(orchestrator(None, Arc::new(MemoryRunStore::new())));

    let mut handle = spawn_analysis(orchestrator, AnalysisRequest::new(dir.path()));
    let mut events = Vec::new();
    while let Some(event) = handle.progress.recv().await {
        events.push(event);
    }
    let outcome = handle.join().await.unwrap();

    assert!(!outcome.from_cache);
    assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
    let last = events.last().unwrap();
    assert_eq!(last.stage, PipelineState::Completed);
    assert_eq!(last.status, StageStatus::Completed);
    assert_eq!(last.percent, 100);
    assert!(events
        .iter()
        .any(|e| e.stage == PipelineState::BuildingTraceability && e.status == StageStatus::Started));
}

#[tokio::test]
async fn test_file_store_rejects_duplicate_runs_and_skips_failed() {
    let dir = project(&[("pump.c", PUMP_C)]);
    let cache = tempfile::tempdir().unwrap();
    let store = Arc::new(FileRunStore::new(cache.path()));
    let orchestrator = orchestrator(None, store.clone());

    let results = run(&orchestrator, dir.path()).await.results;
    let fingerprint = compute_fingerprint(dir.path(), &[PathBuf::from("pump.c")]).await.unwrap();
    assert_eq!(results.run.project_id, fingerprint);

    let duplicate = store.save_run(&fingerprint, &results).await.unwrap_err();
    assert!(duplicate.to_string().contains(&results.run.run_id));

    let mut failed = results.clone();
    failed.run.run_id = "run-failed".to_string();
    failed.run.status = RunStatus::Failed;
    failed.run.timestamp = results.run.timestamp + chrono::Duration::seconds(60);
    store.save_run(&fingerprint, &failed).await.unwrap();

    let latest = store.load_latest_completed(&fingerprint).await.unwrap().unwrap();
    assert_eq!(latest.run.run_id, results.run.run_id);
    assert!(store.load_latest_completed("unknown").await.unwrap().is_none());
}
