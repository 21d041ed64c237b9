//! Test-case outlines from requirements. Steps always come from the
//! acceptance criteria; a reachable LLM only enriches their wording.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::error_handler::StageIssue;
use crate::export::{csv_line, escape_xml};
use crate::llm::params::Operation;
use crate::llm::response_parser::{one_or_many, ExpectedShape};
use crate::llm::{request_json, CallFailure, LlmBackend, SharedBackend, StageBackend};
use crate::models::{
    Requirement, RequirementType, TestCase, TestCategory, TestCoverage, TestOutline, TestPriority, TestStep,
};
use crate::requirements::IdAllocator;
use crate::template_engine::{ReportError, TemplateEngine, TEST_OUTLINE_TEMPLATE};

pub const CSV_HEADER: [&str; 9] = [
    "TestCaseID",
    "Name",
    "RequirementID",
    "Priority",
    "Category",
    "Preconditions",
    "StepNumber",
    "Action",
    "ExpectedResult",
];

const SAFETY_KEYWORDS: &[&str] = &[
    "alarm", "alert", "dose", "dosage", "infusion", "safety", "safe", "hazard", "limit", "fault", "fail",
    "emergency", "critical", "occlusion", "overdose",
];

const NAME_LIMIT: usize = 60;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestGenerationResult {
    pub outline: TestOutline,
    pub errors: Vec<StageIssue>,
}

#[derive(Deserialize)]
struct EnrichedCase {
    #[serde(default)]
    description: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    preconditions: Vec<String>,
    #[serde(default)]
    steps: Vec<StepCandidate>,
}

#[derive(Deserialize)]
struct StepCandidate {
    #[serde(alias = "step", alias = "description")]
    action: String,
    #[serde(default, alias = "expected", alias = "expected_outcome")]
    expected_result: String,
}

pub struct CaseGenerator {
    backend: StageBackend,
}

impl CaseGenerator {
    pub fn new(backend: Option<SharedBackend>) -> Self {
        Self {
            backend: StageBackend::unchecked(backend),
        }
    }

    /// Use the backend as already checked for this run.
    pub fn assume_checked(mut self) -> Self {
        self.backend = self.backend.into_checked();
        self
    }

    pub async fn generate(&self, requirements: &[Requirement]) -> TestGenerationResult {
        let mut result = TestGenerationResult::default();
        let mut backend = self.backend.resolve().await;
        if backend.is_none() && self.backend.is_configured() {
            result
                .errors
                .push(StageIssue::llm_unavailable("LLM unavailable: test steps taken from acceptance criteria"));
        }
        result.outline.used_fallback = backend.is_none();

        let mut ids = IdAllocator::new("TC");
        for requirement in requirements {
            if requirement.id.trim().is_empty() {
                let message = format!("requirement '{}' has no id, no test case generated", requirement.text);
                warn!("{}", message);
                result.outline.validation_errors.push(message);
                continue;
            }

            let mut case = base_case(ids.next_id(), requirement);
            if let Some(active) = &backend {
                match enrich(active.as_ref(), &mut case, requirement).await {
                    Ok(()) => {}
                    Err(failure) => {
                        warn!(requirement = %requirement.id, error = %failure, "test case kept unenriched");
                        result.outline.used_fallback = true;
                        // A backend that stopped answering is not asked again.
                        if matches!(failure, CallFailure::Llm(_)) {
                            backend = None;
                        }
                        result.errors.push(failure.into());
                    }
                }
            }
            result.outline.test_cases.push(case);
        }

        result
            .outline
            .validation_errors
            .extend(validate_cases(&result.outline.test_cases, requirements));
        result.outline.coverage = compute_coverage(&result.outline.test_cases, requirements);

        info!(
            test_cases = result.outline.test_cases.len(),
            coverage = result.outline.coverage.coverage_percentage,
            invalid = result.outline.validation_errors.len(),
            "test outline generated"
        );
        result
    }
}

fn base_case(id: String, requirement: &Requirement) -> TestCase {
    let safety_related = is_safety_related(&requirement.text);
    let category = match (requirement.requirement_type, safety_related) {
        (_, true) => TestCategory::Safety,
        (RequirementType::User, false) => TestCategory::Acceptance,
        (RequirementType::Software, false) => TestCategory::Functional,
    };
    let priority = match (category, requirement.requirement_type) {
        (TestCategory::Safety, _) => TestPriority::High,
        (_, RequirementType::Software) => TestPriority::Medium,
        (_, RequirementType::User) => TestPriority::Low,
    };

    let steps: Vec<TestStep> = if requirement.acceptance_criteria.is_empty() {
        vec![TestStep {
            step_number: 1,
            action: format!("Exercise the behaviour described in {}: {}", requirement.id, requirement.text),
            expected_result: format!("The software behaves as specified in {}", requirement.id),
        }]
    } else {
        requirement
            .acceptance_criteria
            .iter()
            .enumerate()
            .map(|(index, criterion)| TestStep {
                step_number: index + 1,
                action: format!("Verify: {}", criterion.trim()),
                expected_result: format!("Observed behaviour satisfies: {}", criterion.trim()),
            })
            .collect()
    };

    let mut preconditions = vec!["Software build under test is installed on the target or simulator".to_string()];
    if !requirement.code_references.is_empty() {
        let references: Vec<String> = requirement.code_references.iter().map(|r| r.to_string()).collect();
        preconditions.push(format!("Code under test: {}", references.join(", ")));
    }

    TestCase {
        id,
        name: case_name(&requirement.text),
        description: format!("Verifies {} ({})", requirement.id, requirement.text),
        requirement_id: requirement.id.clone(),
        preconditions,
        expected_results: steps.iter().map(|s| s.expected_result.clone()).collect(),
        steps,
        priority,
        category,
    }
}

async fn enrich(backend: &dyn LlmBackend, case: &mut TestCase, requirement: &Requirement) -> Result<(), CallFailure> {
    let data = request_json(
        backend,
        Operation::TestCaseGeneration,
        &enrichment_prompt(requirement),
        &[],
        ExpectedShape::Object,
    )
    .await?;
    let enriched: EnrichedCase = serde_json::from_value(data).map_err(|e| CallFailure::Malformed(e.to_string()))?;

    let steps: Vec<StepCandidate> = enriched
        .steps
        .into_iter()
        .filter(|s| !s.action.trim().is_empty())
        .collect();
    if steps.len() < case.steps.len() {
        debug!(
            requirement = %requirement.id,
            offered = steps.len(),
            needed = case.steps.len(),
            "LLM returned fewer steps than acceptance criteria, keeping criterion steps"
        );
    } else {
        case.steps = steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| TestStep {
                step_number: index + 1,
                action: step.action.trim().to_string(),
                expected_result: if step.expected_result.trim().is_empty() {
                    "Behaviour matches the requirement".to_string()
                } else {
                    step.expected_result.trim().to_string()
                },
            })
            .collect();
        case.expected_results = case.steps.iter().map(|s| s.expected_result.clone()).collect();
    }

    for precondition in enriched.preconditions {
        let precondition = precondition.trim().to_string();
        if !precondition.is_empty() && !case.preconditions.contains(&precondition) {
            case.preconditions.push(precondition);
        }
    }
    if let Some(description) = enriched.description.filter(|d| !d.trim().is_empty()) {
        case.description = description.trim().to_string();
    }
    Ok(())
}

fn enrichment_prompt(requirement: &Requirement) -> String {
    let criteria = if requirement.acceptance_criteria.is_empty() {
        "(none)".to_string()
    } else {
        requirement
            .acceptance_criteria
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "Write a manual verification test outline for this medical device software requirement.\n\n\
         Requirement {}: {}\nAcceptance criteria:\n{}\n\n\
         Provide at least one step per acceptance criterion. Do not write executable code.\n\
         Return a JSON object: {{\"description\": \"...\", \"preconditions\": [\"...\"], \
         \"steps\": [{{\"action\": \"...\", \"expected_result\": \"...\"}}]}}",
        requirement.id, requirement.text, criteria
    )
}

fn is_safety_related(text: &str) -> bool {
    let lowered = text.to_lowercase();
    SAFETY_KEYWORDS.iter().any(|keyword| {
        lowered
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| word == *keyword)
    })
}

fn case_name(text: &str) -> String {
    let text = text.trim().trim_end_matches('.');
    if text.chars().count() <= NAME_LIMIT {
        return format!("Verify: {}", text);
    }
    let shortened: String = text.chars().take(NAME_LIMIT).collect();
    format!("Verify: {}...", shortened.trim_end())
}

/// A case is invalid when its requirement id does not resolve or it has no steps.
pub fn validate_cases(cases: &[TestCase], requirements: &[Requirement]) -> Vec<String> {
    let known: BTreeSet<&str> = requirements.iter().map(|r| r.id.as_str()).collect();
    let mut errors = Vec::new();
    for case in cases {
        if !known.contains(case.requirement_id.as_str()) {
            errors.push(format!("{}: requirement '{}' does not exist", case.id, case.requirement_id));
        }
        if case.steps.is_empty() {
            errors.push(format!("{}: no test steps", case.id));
        }
    }
    errors
}

pub fn compute_coverage(cases: &[TestCase], requirements: &[Requirement]) -> TestCoverage {
    let covered: BTreeSet<&str> = cases
        .iter()
        .filter(|case| !case.steps.is_empty())
        .map(|case| case.requirement_id.as_str())
        .collect();
    let uncovered_requirements: Vec<String> = requirements
        .iter()
        .filter(|r| !covered.contains(r.id.as_str()))
        .map(|r| r.id.clone())
        .collect();
    let total_requirements = requirements.len();
    let covered_requirements = total_requirements - uncovered_requirements.len();
    TestCoverage {
        total_requirements,
        covered_requirements,
        coverage_percentage: if total_requirements == 0 {
            0.0
        } else {
            covered_requirements as f64 / total_requirements as f64 * 100.0
        },
        uncovered_requirements,
    }
}

#[derive(Serialize)]
struct OutlineView<'a> {
    generated: String,
    #[serde(flatten)]
    outline: &'a TestOutline,
}

impl TestOutline {
    pub fn export_to_text(&self, engine: &TemplateEngine) -> Result<String, ReportError> {
        engine.render(
            TEST_OUTLINE_TEMPLATE,
            &OutlineView {
                generated: Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                outline: self,
            },
        )
    }

    pub fn export_to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn export_to_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<test_outline>\n");
        xml.push_str(&format!(
            "  <coverage total_requirements=\"{}\" covered_requirements=\"{}\" percentage=\"{:.1}\"/>\n",
            self.coverage.total_requirements, self.coverage.covered_requirements, self.coverage.coverage_percentage
        ));
        for case in &self.test_cases {
            xml.push_str(&format!(
                "  <test_case id=\"{}\" requirement_id=\"{}\" priority=\"{}\" category=\"{}\">\n",
                escape_xml(&case.id),
                escape_xml(&case.requirement_id),
                case.priority,
                case.category
            ));
            xml.push_str(&format!("    <name>{}</name>\n", escape_xml(&case.name)));
            xml.push_str(&format!("    <description>{}</description>\n", escape_xml(&case.description)));
            xml.push_str("    <preconditions>\n");
            for precondition in &case.preconditions {
                xml.push_str(&format!("      <precondition>{}</precondition>\n", escape_xml(precondition)));
            }
            xml.push_str("    </preconditions>\n    <steps>\n");
            for step in &case.steps {
                xml.push_str(&format!(
                    "      <step number=\"{}\">\n        <action>{}</action>\n        <expected_result>{}</expected_result>\n      </step>\n",
                    step.step_number,
                    escape_xml(&step.action),
                    escape_xml(&step.expected_result)
                ));
            }
            xml.push_str("    </steps>\n  </test_case>\n");
        }
        xml.push_str("</test_outline>\n");
        xml
    }

    /// One line per test step.
    pub fn export_to_csv(&self) -> String {
        let mut csv = csv_line(&CSV_HEADER);
        csv.push('\n');
        for case in &self.test_cases {
            let priority = case.priority.to_string();
            let category = case.category.to_string();
            let preconditions = case.preconditions.join(";");
            for step in &case.steps {
                let number = step.step_number.to_string();
                csv.push_str(&csv_line(&[
                    case.id.as_str(),
                    &case.name,
                    &case.requirement_id,
                    &priority,
                    &category,
                    &preconditions,
                    &number,
                    &step.action,
                    &step.expected_result,
                ]));
                csv.push('\n');
            }
        }
        csv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_handler::{ErrorKind, LlmError};
    use crate::export::parse_csv;
    use crate::llm::MockBackend;
    use std::sync::Arc;

    fn requirement(id: &str, kind: RequirementType, text: &str, criteria: &[&str]) -> Requirement {
        Requirement {
            id: id.to_string(),
            requirement_type: kind,
            text: text.to_string(),
            acceptance_criteria: criteria.iter().map(|c| c.to_string()).collect(),
            derived_from: vec!["UR_0001".to_string()],
            code_references: vec![],
        }
    }

    #[tokio::test]
    async fn test_empty_criteria_still_yield_a_step() {
        let requirements = vec![requirement(
            "SR_0001",
            RequirementType::Software,
            "The software shall log every bolus request",
            &[],
        )];
        let result = CaseGenerator::new(None).generate(&requirements).await;

        let case = &result.outline.test_cases[0];
        assert_eq!(case.id, "TC_0001");
        assert_eq!(case.steps.len(), 1);
        assert!(case.steps[0].action.contains("SR_0001"));
        assert!(result.outline.validation_errors.is_empty());
        assert_eq!(result.outline.coverage.coverage_percentage, 100.0);
        assert!(result.outline.used_fallback);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_one_step_per_criterion_and_classification() {
        let requirements = vec![
            requirement(
                "SR_0001",
                RequirementType::Software,
                "The software shall raise an alarm when occlusion is detected",
                &["Alarm sounds within 2 s", "Infusion stops"],
            ),
            requirement("UR_0001", RequirementType::User, "The user shall see the pump status", &["Status shown"]),
        ];
        let result = CaseGenerator::new(None).generate(&requirements).await;
        let cases = &result.outline.test_cases;

        assert_eq!(cases[0].steps.len(), 2);
        assert_eq!(cases[0].steps[1].step_number, 2);
        assert_eq!(cases[0].category, TestCategory::Safety);
        assert_eq!(cases[0].priority, TestPriority::High);
        assert_eq!(cases[1].category, TestCategory::Acceptance);
        assert_eq!(cases[1].priority, TestPriority::Low);
    }

    #[tokio::test]
    async fn test_llm_enrichment_and_short_answers() {
        let backend = Arc::new(
            MockBackend::new()
                .with_response(
                    "SR_0001",
                    r#"{"description": "Checks the rate limit", "preconditions": ["Pump primed"],
                        "steps": [{"action": "Request 600 ml/h", "expected_result": "Request rejected"},
                                  {"action": "Request 50 ml/h", "expected": "Request accepted"}]}"#,
                )
                .with_response("SR_0002", r#"{"steps": []}"#),
        );
        let requirements = vec![
            requirement(
                "SR_0001",
                RequirementType::Software,
                "The software shall limit the infusion rate",
                &["Rates above 500 ml/h are rejected"],
            ),
            requirement("SR_0002", RequirementType::Software, "The software shall store logs", &["Logs persist"]),
        ];
        let result = CaseGenerator::new(Some(backend)).generate(&requirements).await;
        let cases = &result.outline.test_cases;

        assert_eq!(cases[0].steps.len(), 2);
        assert_eq!(cases[0].steps[1].expected_result, "Request accepted");
        assert_eq!(cases[0].description, "Checks the rate limit");
        assert!(cases[0].preconditions.contains(&"Pump primed".to_string()));
        // Too few steps offered: criterion steps kept.
        assert_eq!(cases[1].steps[0].action, "Verify: Logs persist");
        assert!(!result.outline.used_fallback);
    }

    #[tokio::test]
    async fn test_backend_failure_stops_further_calls() {
        let backend = Arc::new(MockBackend::new().failing(LlmError::Timeout(30)));
        let requirements = vec![
            requirement("SR_0001", RequirementType::Software, "a", &["x"]),
            requirement("SR_0002", RequirementType::Software, "b", &["y"]),
        ];
        let result = CaseGenerator::new(Some(backend.clone())).generate(&requirements).await;

        assert_eq!(result.outline.test_cases.len(), 2);
        assert_eq!(backend.call_count(), 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, ErrorKind::LlmUnavailable);
        assert!(result.outline.used_fallback);
    }

    #[tokio::test]
    async fn test_invalid_cases_are_collected() {
        let requirements = vec![
            requirement("", RequirementType::Software, "orphan", &[]),
            requirement("SR_0002", RequirementType::Software, "b", &["y"]),
        ];
        let result = CaseGenerator::new(None).generate(&requirements).await;
        assert_eq!(result.outline.test_cases.len(), 1);
        assert_eq!(result.outline.validation_errors.len(), 1);

        let mut stray = result.outline.test_cases[0].clone();
        stray.requirement_id = "SR_9999".to_string();
        stray.steps.clear();
        let errors = validate_cases(&[stray], &requirements);
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn test_exports() {
        let requirements = vec![requirement(
            "SR_0001",
            RequirementType::Software,
            "Dose < 10 & \"safe\"",
            &["Bolus, capped", "Alarm"],
        )];
        let outline = CaseGenerator::new(None).generate(&requirements).await.outline;

        let csv = outline.export_to_csv();
        let records = parse_csv(&csv);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0][0], "TestCaseID");
        assert_eq!(records[1][7], "Verify: Bolus, capped");

        let xml = outline.export_to_xml();
        assert!(xml.contains("Dose &lt; 10 &amp; &quot;safe&quot;"));
        assert!(xml.contains("<step number=\"2\">"));

        let text = outline.export_to_text(&TemplateEngine::new().unwrap()).unwrap();
        assert!(text.contains("TC_0001: Verify: Dose < 10"));
        assert!(text.contains("Coverage: 100.0%"));
        assert!(text.contains("2. Verify: Alarm"));

        let json = outline.export_to_json().unwrap();
        let back: TestOutline = serde_json::from_str(&json).unwrap();
        assert_eq!(back.test_cases.len(), 1);
    }
}
