//! ISO 14971 hazard identification over software requirements.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::error_handler::StageIssue;
use crate::features::split_words;
use crate::llm::params::Operation;
use crate::llm::response_parser::{one_or_many, ExpectedShape, LlmResponseParser};
use crate::llm::{request_json, CallFailure, LlmBackend, SharedBackend, StageBackend};
use crate::models::{Probability, Requirement, RiskItem, Severity};
use crate::requirements::IdAllocator;

const SEVERITY_KEYWORDS: &[(Severity, &[&str])] = &[
    (Severity::Catastrophic, &["catastrophic", "death", "fatal", "lethal", "threatening"]),
    (Severity::Serious, &["serious", "major", "critical", "high", "severe", "significant"]),
    (Severity::Minor, &["minor", "negligible", "low", "trivial", "cosmetic"]),
];

const PROBABILITY_KEYWORDS: &[(Probability, &[&str])] = &[
    (Probability::High, &["high", "frequent", "likely", "probable", "often"]),
    (Probability::Medium, &["medium", "moderate", "occasional", "possible"]),
    (Probability::Low, &["low", "rare", "remote", "unlikely", "improbable"]),
];

/// What unrecognised severity/probability values become.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoercionPolicy {
    pub default_severity: Severity,
    pub default_probability: Probability,
}

impl Default for CoercionPolicy {
    fn default() -> Self {
        Self {
            default_severity: Severity::Serious,
            default_probability: Probability::Medium,
        }
    }
}

impl CoercionPolicy {
    /// Returns the value and whether it had to be coerced.
    pub fn coerce_severity(&self, raw: &str) -> (Severity, bool) {
        if let Some(exact) = Severity::parse_exact(raw) {
            return (exact, false);
        }
        (match_keywords(raw, SEVERITY_KEYWORDS).unwrap_or(self.default_severity), true)
    }

    pub fn coerce_probability(&self, raw: &str) -> (Probability, bool) {
        if let Some(exact) = Probability::parse_exact(raw) {
            return (exact, false);
        }
        (match_keywords(raw, PROBABILITY_KEYWORDS).unwrap_or(self.default_probability), true)
    }
}

fn match_keywords<T: Copy>(raw: &str, table: &[(T, &[&str])]) -> Option<T> {
    let words = split_words(raw);
    table
        .iter()
        .find(|(_, keywords)| words.iter().any(|word| keywords.contains(&word.as_str())))
        .map(|(value, _)| *value)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HazardAnalysisResult {
    pub risks: Vec<RiskItem>,
    pub errors: Vec<StageIssue>,
    /// Severity or probability values that were not exact enum names.
    pub coerced_values: usize,
    pub used_fallback: bool,
}

#[derive(Deserialize)]
struct HazardCandidate {
    #[serde(alias = "name")]
    hazard: String,
    #[serde(default)]
    cause: String,
    #[serde(default)]
    effect: String,
    #[serde(default, deserialize_with = "lenient_string")]
    severity: String,
    #[serde(default, deserialize_with = "lenient_string")]
    probability: String,
    #[serde(default)]
    mitigation: Option<String>,
    #[serde(default)]
    verification: Option<String>,
    #[serde(
        default,
        alias = "requirement_id",
        alias = "requirement_ids",
        alias = "requirement",
        deserialize_with = "one_or_many"
    )]
    related_requirements: Vec<String>,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    })
}

pub struct HazardIdentifier {
    backend: StageBackend,
    batch_size: usize,
    coercion: CoercionPolicy,
}

impl HazardIdentifier {
    pub fn new(backend: Option<SharedBackend>, batch_size: usize, coercion: CoercionPolicy) -> Self {
        Self {
            backend: StageBackend::unchecked(backend),
            batch_size: batch_size.max(1),
            coercion,
        }
    }

    /// Use the backend as already checked for this run.
    pub fn assume_checked(mut self) -> Self {
        self.backend = self.backend.into_checked();
        self
    }

    pub async fn identify(&self, software_requirements: &[Requirement], description: &str) -> HazardAnalysisResult {
        let mut result = HazardAnalysisResult::default();
        if software_requirements.is_empty() {
            return result;
        }

        let mut ids = IdAllocator::new("RISK");
        let backend = self.backend.resolve().await;
        if backend.is_none() {
            warn!("LLM unavailable, using rule-based hazard stubs");
            result
                .errors
                .push(StageIssue::llm_unavailable("LLM unavailable: rule-based hazards used"));
            result.used_fallback = true;
        }

        for batch in software_requirements.chunks(self.batch_size) {
            let Some(backend) = &backend else {
                self.fallback_batch(batch, &mut ids, &mut result);
                continue;
            };

            match self.identify_batch(backend.as_ref(), batch, description, &mut ids, &mut result).await {
                Ok(0) => {
                    warn!(batch_start = %batch[0].id, "no valid hazards in batch, using rule-based stubs");
                    result.used_fallback = true;
                    self.fallback_batch(batch, &mut ids, &mut result);
                }
                Ok(_) => {}
                Err(failure) => {
                    warn!(batch_start = %batch[0].id, error = %failure, "hazard batch failed");
                    result.errors.push(failure.into());
                    result.used_fallback = true;
                    self.fallback_batch(batch, &mut ids, &mut result);
                }
            }
        }

        info!(
            risks = result.risks.len(),
            coerced = result.coerced_values,
            used_fallback = result.used_fallback,
            "hazard identification finished"
        );
        result
    }

    async fn identify_batch(
        &self,
        backend: &dyn LlmBackend,
        batch: &[Requirement],
        description: &str,
        ids: &mut IdAllocator,
        result: &mut HazardAnalysisResult,
    ) -> Result<usize, CallFailure> {
        let data = request_json(
            backend,
            Operation::HazardIdentification,
            &hazard_prompt(batch, description),
            &[],
            ExpectedShape::ArrayField("hazards"),
        )
        .await?;
        let (candidates, rejected) =
            LlmResponseParser::deserialize_items::<HazardCandidate>(data).map_err(CallFailure::Malformed)?;
        for reason in rejected {
            result.errors.push(StageIssue::validation(format!("hazard {}", reason)));
        }

        let batch_ids: BTreeSet<&str> = batch.iter().map(|r| r.id.as_str()).collect();
        let mut accepted = 0;

        for candidate in candidates {
            if candidate.hazard.trim().is_empty() {
                result
                    .errors
                    .push(StageIssue::validation("hazard item without a hazard description skipped"));
                continue;
            }
            let related: Vec<String> = candidate
                .related_requirements
                .iter()
                .filter(|id| batch_ids.contains(id.as_str()))
                .cloned()
                .collect();
            if related.is_empty() {
                result.errors.push(StageIssue::validation(format!(
                    "hazard '{}' references no requirement of this batch ({:?})",
                    candidate.hazard.trim(),
                    candidate.related_requirements
                )));
                continue;
            }

            let (severity, severity_coerced) = self.coercion.coerce_severity(&candidate.severity);
            let (probability, probability_coerced) = self.coercion.coerce_probability(&candidate.probability);
            for (field, raw, coerced, value) in [
                ("severity", &candidate.severity, severity_coerced, severity.as_str()),
                ("probability", &candidate.probability, probability_coerced, probability.as_str()),
            ] {
                if coerced {
                    warn!(field, raw = %raw, coerced_to = value, hazard = %candidate.hazard, "coerced enum value");
                    result.coerced_values += 1;
                }
            }

            let cause = non_empty_or(&candidate.cause, "Unspecified software fault");
            let effect = non_empty_or(&candidate.effect, "Unspecified harm to the patient or user");
            let mitigation = candidate
                .mitigation
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| mitigation_template(&cause));
            let verification = candidate
                .verification
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| verification_template(&cause));

            result.risks.push(RiskItem::new(
                ids.next_id(),
                candidate.hazard.trim().to_string(),
                cause,
                effect,
                severity,
                probability,
                mitigation,
                verification,
                related,
            ));
            accepted += 1;
        }
        Ok(accepted)
    }

    fn fallback_batch(&self, batch: &[Requirement], ids: &mut IdAllocator, result: &mut HazardAnalysisResult) {
        for requirement in batch {
            result.risks.push(fallback_hazard(requirement, ids.next_id()));
        }
    }
}

struct HazardRule {
    keywords: &'static [&'static str],
    hazard: &'static str,
    cause: &'static str,
    effect: &'static str,
    severity: Severity,
    probability: Probability,
}

const FALLBACK_RULES: &[HazardRule] = &[
    HazardRule {
        keywords: &["alarm", "alert"],
        hazard: "Missed or delayed alarm",
        cause: "Alarm condition is not detected or not annunciated",
        effect: "A hazardous condition goes unnoticed by the clinician",
        severity: Severity::Catastrophic,
        probability: Probability::Low,
    },
    HazardRule {
        keywords: &["dose", "dosing", "infusion", "infuse", "bolus", "delivery"],
        hazard: "Over- or under-delivery of therapy",
        cause: "Incorrect dose calculation or delivery control",
        effect: "Patient receives too much or too little medication",
        severity: Severity::Catastrophic,
        probability: Probability::Medium,
    },
    HazardRule {
        keywords: &["display", "screen", "show", "ui"],
        hazard: "Misleading display",
        cause: "Incorrect or stale information is displayed",
        effect: "User takes a wrong clinical action based on displayed values",
        severity: Severity::Serious,
        probability: Probability::Medium,
    },
    HazardRule {
        keywords: &["communication", "communicate", "network", "transmit", "wireless", "bluetooth", "serial"],
        hazard: "Communication loss",
        cause: "Messages are lost, delayed or corrupted in transit",
        effect: "Remote monitoring or control becomes unavailable",
        severity: Severity::Serious,
        probability: Probability::Medium,
    },
    HazardRule {
        keywords: &["data", "record", "records", "storage", "store", "log"],
        hazard: "Data integrity loss",
        cause: "Stored or transmitted data is corrupted or lost",
        effect: "Clinical decisions are based on incorrect data",
        severity: Severity::Serious,
        probability: Probability::Medium,
    },
];

/// Rule-based stub for one software requirement.
pub fn fallback_hazard(requirement: &Requirement, id: String) -> RiskItem {
    let words = split_words(&requirement.text);
    let rule = FALLBACK_RULES
        .iter()
        .find(|rule| words.iter().any(|word| rule.keywords.contains(&word.as_str())));

    let (hazard, cause, effect, severity, probability) = match rule {
        Some(rule) => (
            rule.hazard.to_string(),
            format!("{} ({})", rule.cause, requirement.id),
            rule.effect.to_string(),
            rule.severity,
            rule.probability,
        ),
        None => (
            "Software malfunction".to_string(),
            format!("Defect in the implementation of {}", requirement.id),
            "Device behaves contrary to its specification".to_string(),
            Severity::Serious,
            Probability::Low,
        ),
    };

    RiskItem::new(
        id,
        hazard,
        cause.clone(),
        effect,
        severity,
        probability,
        mitigation_template(&cause),
        verification_template(&cause),
        vec![requirement.id.clone()],
    )
}

fn mitigation_template(cause: &str) -> String {
    format!("Implement software controls that detect and prevent: {}", cause)
}

fn verification_template(cause: &str) -> String {
    format!("Verify by test that the following cause is detected and handled safely: {}", cause)
}

fn non_empty_or(value: &str, default: &str) -> String {
    match value.trim() {
        "" => default.to_string(),
        trimmed => trimmed.to_string(),
    }
}

fn hazard_prompt(batch: &[Requirement], description: &str) -> String {
    let requirement_lines: Vec<String> = batch.iter().map(|r| format!("- {}: {}", r.id, r.text)).collect();
    format!(
        "Project description: {}\nSoftware requirements:\n{}\n\n\
Identify the hazards (ISO 14971) that could arise if each software requirement is not met or is \
implemented incorrectly. Every hazard must name the requirement_id it relates to, taken from the list above.\n\
severity is one of CATASTROPHIC, SERIOUS, MINOR. probability is one of HIGH, MEDIUM, LOW.\n\
Respond with JSON only:\n\
{{\"hazards\": [{{\"requirement_id\": \"SR_0001\", \"hazard\": \"...\", \"cause\": \"...\", \"effect\": \"...\", \
\"severity\": \"SERIOUS\", \"probability\": \"MEDIUM\", \"mitigation\": \"...\", \"verification\": \"...\"}}]}}",
        description.trim(),
        requirement_lines.join("\n")
    )
}
