//! Features to User Requirements, then User Requirements to Software
//! Requirements.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::error_handler::StageIssue;
use crate::features::GENERAL_CATEGORY;
use crate::llm::params::Operation;
use crate::llm::response_parser::{one_or_many, ExpectedShape, LlmResponseParser};
use crate::llm::{request_json, CallFailure, LlmBackend, SharedBackend, StageBackend};
use crate::models::{CodeReference, Feature, Requirement, RequirementType};

const MAX_SRS_PER_UR: usize = 3;

/// Hands out `PREFIX_%04d` ids in order. Ids are never reused.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    prefix: &'static str,
    next: usize,
}

impl IdAllocator {
    pub fn new(prefix: &'static str) -> Self {
        Self { prefix, next: 1 }
    }

    pub fn next_id(&mut self) -> String {
        let id = format!("{}_{:04}", self.prefix, self.next);
        self.next += 1;
        id
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequirementsResult {
    pub user_requirements: Vec<Requirement>,
    pub software_requirements: Vec<Requirement>,
    pub errors: Vec<StageIssue>,
    pub used_fallback: bool,
}

impl RequirementsResult {
    pub fn all(&self) -> impl Iterator<Item = &Requirement> {
        self.user_requirements.iter().chain(self.software_requirements.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.user_requirements.is_empty() && self.software_requirements.is_empty()
    }
}

#[derive(Deserialize)]
struct UserRequirementCandidate {
    #[serde(alias = "requirement", alias = "description")]
    text: String,
    #[serde(default, deserialize_with = "one_or_many")]
    acceptance_criteria: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    derived_from: Vec<String>,
}

#[derive(Deserialize)]
struct SoftwareRequirementCandidate {
    #[serde(alias = "requirement", alias = "description")]
    text: String,
    #[serde(default, deserialize_with = "one_or_many")]
    acceptance_criteria: Vec<String>,
}

pub struct RequirementsGenerator {
    backend: StageBackend,
}

impl RequirementsGenerator {
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

    pub async fn generate(&self, features: &[Feature], description: &str) -> RequirementsResult {
        let mut result = RequirementsResult::default();
        if features.is_empty() {
            return result;
        }

        let backend = self.backend.resolve().await;
        if backend.is_none() {
            warn!("LLM unavailable, generating template requirements");
            result
                .errors
                .push(StageIssue::llm_unavailable("LLM unavailable: template requirements used"));
            result.used_fallback = true;
        }

        let mut ur_ids = IdAllocator::new("UR");
        let mut sr_ids = IdAllocator::new("SR");

        for (category, group) in group_by_category(features) {
            let id = ur_ids.next_id();
            let user_requirement = match &backend {
                Some(backend) => {
                    match self.user_requirement_via_llm(backend.as_ref(), &id, &category, &group, description).await {
                        Ok(requirement) => requirement,
                        Err(failure) => {
                            warn!(category = %category, error = %failure, "user requirement fell back to template");
                            result.errors.push(failure.into());
                            result.used_fallback = true;
                            fallback_user_requirement(id, &category, &group)
                        }
                    }
                }
                None => fallback_user_requirement(id, &category, &group),
            };
            result.user_requirements.push(user_requirement);
        }

        let feature_index: BTreeMap<&str, &Feature> =
            features.iter().map(|f| (f.id.as_str(), f)).collect();

        for user_requirement in &result.user_requirements {
            let sources: Vec<&Feature> = user_requirement
                .derived_from
                .iter()
                .filter_map(|id| feature_index.get(id.as_str()).copied())
                .collect();

            let drafts = match &backend {
                Some(backend) => {
                    match self.software_requirements_via_llm(backend.as_ref(), user_requirement, &sources).await {
                        Ok(drafts) => drafts,
                        Err(failure) => {
                            warn!(ur = %user_requirement.id, error = %failure, "software requirements fell back to template");
                            result.errors.push(failure.into());
                            result.used_fallback = true;
                            fallback_software_drafts(&sources)
                        }
                    }
                }
                None => fallback_software_drafts(&sources),
            };

            let shared_references = aggregate_references(&sources);
            for draft in drafts {
                result.software_requirements.push(Requirement {
                    id: sr_ids.next_id(),
                    requirement_type: RequirementType::Software,
                    text: draft.text,
                    acceptance_criteria: draft.acceptance_criteria,
                    derived_from: vec![user_requirement.id.clone()],
                    code_references: draft.code_references.unwrap_or_else(|| shared_references.clone()),
                });
            }
        }

        for violation in check_links(features, &result.user_requirements, &result.software_requirements) {
            result.errors.push(StageIssue::validation(violation));
        }

        info!(
            user_requirements = result.user_requirements.len(),
            software_requirements = result.software_requirements.len(),
            used_fallback = result.used_fallback,
            "requirements generated"
        );
        result
    }

    async fn user_requirement_via_llm(
        &self,
        backend: &dyn LlmBackend,
        id: &str,
        category: &str,
        group: &[&Feature],
        description: &str,
    ) -> Result<Requirement, CallFailure> {
        let data = request_json(
            backend,
            Operation::UserRequirements,
            &user_requirement_prompt(category, group, description),
            &[],
            ExpectedShape::Object,
        )
        .await?;
        let candidate: UserRequirementCandidate =
            serde_json::from_value(data).map_err(|e| CallFailure::Malformed(e.to_string()))?;
        if candidate.text.trim().is_empty() {
            return Err(CallFailure::Malformed("user requirement text is empty".to_string()));
        }

        let group_ids: Vec<String> = group.iter().map(|f| f.id.clone()).collect();
        let claimed: BTreeSet<&str> = candidate.derived_from.iter().map(String::as_str).collect();
        let mut derived_from: Vec<String> = group_ids
            .iter()
            .filter(|id| claimed.contains(id.as_str()))
            .cloned()
            .collect();
        if derived_from.is_empty() {
            debug!(ur = id, "LLM derived_from matched no group feature; using the whole group");
            derived_from = group_ids;
        }

        Ok(Requirement {
            id: id.to_string(),
            requirement_type: RequirementType::User,
            text: candidate.text.trim().to_string(),
            acceptance_criteria: candidate.acceptance_criteria,
            derived_from,
            code_references: aggregate_references(group),
        })
    }

    async fn software_requirements_via_llm(
        &self,
        backend: &dyn LlmBackend,
        user_requirement: &Requirement,
        sources: &[&Feature],
    ) -> Result<Vec<SoftwareDraft>, CallFailure> {
        let data = request_json(
            backend,
            Operation::SoftwareRequirements,
            &software_requirement_prompt(user_requirement, sources),
            &[],
            ExpectedShape::ArrayField("software_requirements"),
        )
        .await?;
        let (candidates, rejected) =
            LlmResponseParser::deserialize_items::<SoftwareRequirementCandidate>(data)
                .map_err(CallFailure::Malformed)?;
        for reason in rejected {
            debug!(ur = %user_requirement.id, "{}", reason);
        }

        let drafts: Vec<SoftwareDraft> = candidates
            .into_iter()
            .filter(|c| !c.text.trim().is_empty())
            .take(MAX_SRS_PER_UR)
            .map(|c| SoftwareDraft {
                text: c.text.trim().to_string(),
                acceptance_criteria: c.acceptance_criteria,
                code_references: None,
            })
            .collect();
        if drafts.is_empty() {
            return Err(CallFailure::Malformed("no software requirements in response".to_string()));
        }
        Ok(drafts)
    }
}

struct SoftwareDraft {
    text: String,
    acceptance_criteria: Vec<String>,
    /// `None` inherits the references of every source feature.
    code_references: Option<Vec<CodeReference>>,
}

fn group_by_category(features: &[Feature]) -> BTreeMap<String, Vec<&Feature>> {
    let mut groups: BTreeMap<String, Vec<&Feature>> = BTreeMap::new();
    for feature in features {
        let category = match feature.category.trim() {
            "" => GENERAL_CATEGORY.to_string(),
            category => category.to_string(),
        };
        groups.entry(category).or_default().push(feature);
    }
    groups
}

fn aggregate_references(features: &[&Feature]) -> Vec<CodeReference> {
    features
        .iter()
        .flat_map(|f| f.evidence.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn fallback_user_requirement(id: String, category: &str, group: &[&Feature]) -> Requirement {
    Requirement {
        id,
        requirement_type: RequirementType::User,
        text: format!("The system shall provide {} features", category),
        acceptance_criteria: group
            .iter()
            .map(|f| format!("{} is available to the user", f.description))
            .collect(),
        derived_from: group.iter().map(|f| f.id.clone()).collect(),
        code_references: aggregate_references(group),
    }
}

fn fallback_software_drafts(sources: &[&Feature]) -> Vec<SoftwareDraft> {
    let drafts: Vec<SoftwareDraft> = sources
        .iter()
        .take(MAX_SRS_PER_UR)
        .map(|feature| {
            let behaviour = lowercase_first(feature.description.trim());
            SoftwareDraft {
                text: format!("The software shall implement {}", behaviour),
                acceptance_criteria: vec![
                    format!("Given valid input, {} produces the specified result", behaviour),
                    format!("Given invalid input, {} reports an error without corrupting state", behaviour),
                ],
                code_references: Some(feature.evidence.clone()),
            }
        })
        .collect();

    if drafts.is_empty() {
        return vec![SoftwareDraft {
            text: "The software shall implement the behaviour described by its user requirement".to_string(),
            acceptance_criteria: vec!["The behaviour is demonstrated under nominal conditions".to_string()],
            code_references: None,
        }];
    }
    drafts
}

fn lowercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn user_requirement_prompt(category: &str, group: &[&Feature], description: &str) -> String {
    let feature_lines: Vec<String> = group
        .iter()
        .map(|f| format!("- {}: {} (confidence {:.2})", f.id, f.description, f.confidence))
        .collect();
    format!(
        "Project description: {}\nFeature category: {}\nFeatures:\n{}\n\n\
Write ONE user requirement that covers these features from the perspective of the device user. \
List the ids of the features it is derived from.\n\
Respond with JSON only:\n\
{{\"text\": \"The user shall be able to ...\", \"acceptance_criteria\": [\"...\"], \"derived_from\": [\"FEAT_0001\"]}}",
        description.trim(),
        category,
        feature_lines.join("\n")
    )
}

fn software_requirement_prompt(user_requirement: &Requirement, sources: &[&Feature]) -> String {
    let feature_lines: Vec<String> = sources
        .iter()
        .map(|f| {
            let evidence: Vec<String> = f.evidence.iter().map(|e| e.to_string()).collect();
            format!("- {}: {} [{}]", f.id, f.description, evidence.join(", "))
        })
        .collect();
    format!(
        "User requirement {}: {}\nAcceptance criteria:\n{}\nImplementing features:\n{}\n\n\
Derive 1 to 3 verifiable software requirements (IEC 62304 style, \"The software shall ...\") \
with testable acceptance criteria.\n\
Respond with JSON only:\n\
{{\"software_requirements\": [{{\"text\": \"The software shall ...\", \"acceptance_criteria\": [\"...\"]}}]}}",
        user_requirement.id,
        user_requirement.text,
        user_requirement
            .acceptance_criteria
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n"),
        feature_lines.join("\n")
    )
}

/// Link violations: URs citing unknown features, SRs without a resolvable UR.
pub fn check_links(
    features: &[Feature],
    user_requirements: &[Requirement],
    software_requirements: &[Requirement],
) -> Vec<String> {
    let feature_ids: BTreeSet<&str> = features.iter().map(|f| f.id.as_str()).collect();
    let ur_ids: BTreeSet<&str> = user_requirements.iter().map(|r| r.id.as_str()).collect();
    let mut violations = Vec::new();

    for ur in user_requirements {
        for source in &ur.derived_from {
            if !feature_ids.contains(source.as_str()) {
                violations.push(format!("{} derives from unknown feature {}", ur.id, source));
            }
        }
    }
    for sr in software_requirements {
        if sr.derived_from.is_empty() {
            violations.push(format!("{} has no parent user requirement", sr.id));
        }
        for source in &sr.derived_from {
            if !ur_ids.contains(source.as_str()) {
                violations.push(format!("{} derives from unknown user requirement {}", sr.id, source));
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockBackend;
    use std::sync::Arc;

    fn feature(id: &str, description: &str, category: &str, line: usize) -> Feature {
        Feature {
            id: id.to_string(),
            description: description.to_string(),
            confidence: 0.8,
            evidence: vec![CodeReference::new("src/pump.c", line, line + 9)],
            category: category.to_string(),
        }
    }

    fn sample_features() -> Vec<Feature> {
        vec![
            feature("FEAT_0001", "Validate infusion rate", "Input Validation", 1),
            feature("FEAT_0002", "Raise occlusion alarm", "Alarms and Alerts", 20),
            feature("FEAT_0003", "Check dose limits", "Input Validation", 40),
        ]
    }

    #[test]
    fn test_id_allocator_is_monotonic() {
        let mut ids = IdAllocator::new("SR");
        assert_eq!(ids.next_id(), "SR_0001");
        assert_eq!(ids.next_id(), "SR_0002");
    }

    #[tokio::test]
    async fn test_fallback_requirements_are_linked() {
        let features = sample_features();
        let result = RequirementsGenerator::new(None).generate(&features, "Infusion pump").await;

        assert!(result.used_fallback);
        assert_eq!(result.user_requirements.len(), 2);
        let alarms = &result.user_requirements[0];
        assert_eq!(alarms.id, "UR_0001");
        assert_eq!(alarms.text, "The system shall provide Alarms and Alerts features");
        assert_eq!(alarms.derived_from, vec!["FEAT_0002"]);

        let validation = &result.user_requirements[1];
        assert_eq!(validation.derived_from, vec!["FEAT_0001", "FEAT_0003"]);

        assert_eq!(result.software_requirements.len(), 3);
        for sr in &result.software_requirements {
            assert_eq!(sr.derived_from.len(), 1);
            assert!(!sr.acceptance_criteria.is_empty());
            assert!(!sr.code_references.is_empty());
        }
        assert_eq!(result.software_requirements[2].id, "SR_0003");
        assert_eq!(result.software_requirements[2].derived_from, vec!["UR_0002"]);
        assert!(check_links(&features, &result.user_requirements, &result.software_requirements).is_empty());
    }

    #[tokio::test]
    async fn test_llm_derived_from_is_intersected_with_group() {
        let mock = MockBackend::new()
            .with_response(
                "Feature category: Input Validation",
                r#"{"text": "The clinician shall be protected from entering unsafe rates",
                    "acceptance_criteria": "Rates above the limit are rejected",
                    "derived_from": ["FEAT_0003", "FEAT_9999"]}"#,
            )
            .with_response(
                "Feature category",
                r#"{"text": "The user shall be alerted", "derived_from": ["FEAT_4242"]}"#,
            )
            .with_response(
                "User requirement UR_",
                r#"{"software_requirements": [
                    {"text": "The software shall do A", "acceptance_criteria": ["A"]},
                    {"text": "The software shall do B"},
                    {"text": "The software shall do C", "acceptance_criteria": ["C"]},
                    {"text": "The software shall do D", "acceptance_criteria": ["D"]}
                ]}"#,
            );
        let backend: SharedBackend = Arc::new(mock);
        let features = sample_features();
        let result = RequirementsGenerator::new(Some(backend)).generate(&features, "pump").await;

        assert!(!result.used_fallback);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        // Empty intersection resets to the whole group.
        assert_eq!(result.user_requirements[0].derived_from, vec!["FEAT_0002"]);
        assert_eq!(result.user_requirements[1].derived_from, vec!["FEAT_0003"]);
        assert_eq!(
            result.user_requirements[1].acceptance_criteria,
            vec!["Rates above the limit are rejected"]
        );

        // Three per user requirement at most.
        assert_eq!(result.software_requirements.len(), 6);
        let ids: Vec<_> = result.software_requirements.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["SR_0001", "SR_0002", "SR_0003", "SR_0004", "SR_0005", "SR_0006"]);
        assert_eq!(result.software_requirements[3].derived_from, vec!["UR_0002"]);
        assert_eq!(
            result.software_requirements[3].code_references,
            vec![CodeReference::new("src/pump.c", 40, 49)]
        );
    }

    #[tokio::test]
    async fn test_malformed_sr_response_falls_back_per_user_requirement() {
        let mock = MockBackend::new()
            .with_response("Feature category", r#"{"text": "The user shall be served"}"#)
            .with_default_response("sorry");
        let backend: SharedBackend = Arc::new(mock);
        let result = RequirementsGenerator::new(Some(backend))
            .generate(&sample_features(), "pump")
            .await;

        assert!(result.used_fallback);
        assert_eq!(result.software_requirements.len(), 3);
        assert_eq!(result.errors.len(), 2);
        assert!(result.software_requirements[0].text.starts_with("The software shall implement"));
    }
}
