use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

use crate::export::csv_line;
use crate::models::{CodeChunk, CodeReference, Feature, Requirement, RiskItem, TestCase};

pub const CSV_HEADER: &str =
    "RequirementID,RequirementType,RequirementText,DerivedFromFeatureIDs,CodeReferences,TestCaseIDs,RiskIDs";

pub const DEFAULT_WEAK_LINK_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GapSeverity {
    High,
    Medium,
    Low,
}

/// One denormalized code -> feature -> UR -> SR -> risk chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceabilityTableRow {
    pub code_reference: Option<CodeReference>,
    pub feature_id: Option<String>,
    pub feature_description: Option<String>,
    pub user_requirement_id: Option<String>,
    pub software_requirement_id: Option<String>,
    pub risk_id: Option<String>,
    pub confidence: f64,
    pub is_gap: bool,
    pub gap_severity: Option<GapSeverity>,
    pub gap_reasons: Vec<String>,
}

impl TraceabilityTableRow {
    fn has_requirement(&self) -> bool {
        self.user_requirement_id.is_some() || self.software_requirement_id.is_some()
    }

    fn assess(&mut self, weak_link_threshold: f64) {
        let mut reasons = Vec::new();
        if self.code_reference.is_none() {
            reasons.push("no code reference".to_string());
        }
        if !self.has_requirement() {
            reasons.push("code has no requirement link".to_string());
        }
        if self.risk_id.is_none() {
            reasons.push("no risk assessment".to_string());
        }
        let weak = self.confidence < weak_link_threshold;
        if weak {
            reasons.push(format!("weak automated link (confidence {:.2})", self.confidence));
        }

        self.gap_severity = if self.software_requirement_id.is_some() && self.risk_id.is_none() {
            Some(GapSeverity::High)
        } else if self.code_reference.is_none() || !self.has_requirement() || self.risk_id.is_none() {
            Some(GapSeverity::Medium)
        } else if weak {
            Some(GapSeverity::Low)
        } else {
            None
        };
        self.is_gap = !reasons.is_empty();
        self.gap_reasons = reasons;
    }
}

/// Per-requirement view used for the CSV export.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequirementTrace {
    pub requirement_id: String,
    pub requirement_type: String,
    pub requirement_text: String,
    pub feature_ids: Vec<String>,
    pub code_references: Vec<CodeReference>,
    pub test_case_ids: Vec<String>,
    pub risk_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TraceabilitySummary {
    pub total_rows: usize,
    pub gap_rows: usize,
    pub gaps_by_severity: BTreeMap<GapSeverity, usize>,
    pub total_requirements: usize,
    pub requirements_with_risks: usize,
    pub requirements_with_tests: usize,
    pub code_chunks: usize,
    pub covered_code_chunks: usize,
    pub code_coverage_percentage: f64,
    pub average_confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TraceabilityMatrix {
    pub run_id: String,
    pub rows: Vec<TraceabilityTableRow>,
    pub requirements: Vec<RequirementTrace>,
    pub summary: TraceabilitySummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    RequirementId,
    /// Weakest links first.
    Confidence,
    /// High gaps first, complete rows last.
    GapSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Code,
    Feature,
    UserRequirement,
    SoftwareRequirement,
    Risk,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFilter {
    /// `Some(true)` keeps only gaps, `Some(false)` only complete rows.
    pub gaps: Option<bool>,
    pub min_confidence: Option<f64>,
    pub element: Option<ElementType>,
}

/// Everything the matrix is built from.
#[derive(Debug, Clone, Copy)]
pub struct TraceabilityInputs<'a> {
    pub chunks: &'a [CodeChunk],
    pub features: &'a [Feature],
    pub user_requirements: &'a [Requirement],
    pub software_requirements: &'a [Requirement],
    pub risks: &'a [RiskItem],
    pub test_cases: &'a [TestCase],
}

pub struct TraceabilityBuilder {
    weak_link_threshold: f64,
}

impl Default for TraceabilityBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_WEAK_LINK_THRESHOLD)
    }
}

impl TraceabilityBuilder {
    pub fn new(weak_link_threshold: f64) -> Self {
        Self { weak_link_threshold }
    }

    pub fn build(&self, run_id: &str, inputs: TraceabilityInputs<'_>) -> TraceabilityMatrix {
        let mut rows = Vec::new();
        let mut linked_srs: BTreeSet<&str> = BTreeSet::new();

        for feature in inputs.features {
            let base = TraceabilityTableRow {
                code_reference: None,
                feature_id: Some(feature.id.clone()),
                feature_description: Some(feature.description.clone()),
                user_requirement_id: None,
                software_requirement_id: None,
                risk_id: None,
                confidence: feature.confidence,
                is_gap: false,
                gap_severity: None,
                gap_reasons: Vec::new(),
            };

            let mut chains = Vec::new();
            let urs: Vec<&Requirement> = inputs
                .user_requirements
                .iter()
                .filter(|ur| ur.derived_from.contains(&feature.id))
                .collect();
            if urs.is_empty() {
                chains.push(base.clone());
            }
            for ur in urs {
                let ur_row = TraceabilityTableRow {
                    user_requirement_id: Some(ur.id.clone()),
                    ..base.clone()
                };
                let srs: Vec<&Requirement> = inputs
                    .software_requirements
                    .iter()
                    .filter(|sr| sr.derived_from.contains(&ur.id))
                    .collect();
                if srs.is_empty() {
                    chains.push(ur_row);
                    continue;
                }
                for sr in srs {
                    linked_srs.insert(sr.id.as_str());
                    let sr_row = TraceabilityTableRow {
                        software_requirement_id: Some(sr.id.clone()),
                        ..ur_row.clone()
                    };
                    chains.extend(expand_risks(sr_row, &sr.id, inputs.risks));
                }
            }

            // Every evidence range gets its own copy of the feature's chains.
            if feature.evidence.is_empty() {
                rows.extend(chains);
                continue;
            }
            for reference in &feature.evidence {
                rows.extend(chains.iter().map(|row| TraceabilityTableRow {
                    code_reference: Some(reference.clone()),
                    ..row.clone()
                }));
            }
        }

        // Requirements reachable from no feature.
        for sr in inputs.software_requirements {
            if linked_srs.contains(sr.id.as_str()) {
                continue;
            }
            let row = TraceabilityTableRow {
                code_reference: sr.code_references.first().cloned(),
                feature_id: None,
                feature_description: None,
                user_requirement_id: sr.derived_from.first().cloned(),
                software_requirement_id: Some(sr.id.clone()),
                risk_id: None,
                confidence: 1.0,
                is_gap: false,
                gap_severity: None,
                gap_reasons: Vec::new(),
            };
            rows.extend(expand_risks(row, &sr.id, inputs.risks));
        }

        // Code no feature accounts for.
        let evidence: Vec<&CodeReference> = inputs.features.iter().flat_map(|f| f.evidence.iter()).collect();
        let mut covered_chunks = 0;
        for chunk in inputs.chunks {
            let reference = chunk.reference();
            if evidence.iter().any(|e| e.overlaps(&reference)) {
                covered_chunks += 1;
                continue;
            }
            rows.push(TraceabilityTableRow {
                code_reference: Some(reference),
                feature_id: None,
                feature_description: None,
                user_requirement_id: None,
                software_requirement_id: None,
                risk_id: None,
                confidence: 0.0,
                is_gap: false,
                gap_severity: None,
                gap_reasons: Vec::new(),
            });
        }

        for row in &mut rows {
            row.assess(self.weak_link_threshold);
        }

        let requirements = requirement_traces(&inputs);
        let summary = summarize(&rows, &requirements, inputs.chunks.len(), covered_chunks);
        info!(
            run_id,
            rows = summary.total_rows,
            gaps = summary.gap_rows,
            "traceability matrix built"
        );

        TraceabilityMatrix {
            run_id: run_id.to_string(),
            rows,
            requirements,
            summary,
        }
    }
}

fn expand_risks(row: TraceabilityTableRow, sr_id: &str, risks: &[RiskItem]) -> Vec<TraceabilityTableRow> {
    let related: Vec<&RiskItem> = risks
        .iter()
        .filter(|risk| risk.related_requirements.iter().any(|id| id == sr_id))
        .collect();
    if related.is_empty() {
        return vec![row];
    }
    related
        .into_iter()
        .map(|risk| TraceabilityTableRow {
            risk_id: Some(risk.id.clone()),
            ..row.clone()
        })
        .collect()
}

fn requirement_traces(inputs: &TraceabilityInputs<'_>) -> Vec<RequirementTrace> {
    let tests_for = |id: &str| -> Vec<String> {
        inputs
            .test_cases
            .iter()
            .filter(|tc| tc.requirement_id == id)
            .map(|tc| tc.id.clone())
            .collect()
    };
    let risks_for = |sr_ids: &[&str]| -> Vec<String> {
        inputs
            .risks
            .iter()
            .filter(|risk| risk.related_requirements.iter().any(|id| sr_ids.contains(&id.as_str())))
            .map(|risk| risk.id.clone())
            .collect()
    };
    let ur_features: BTreeMap<&str, &Vec<String>> = inputs
        .user_requirements
        .iter()
        .map(|ur| (ur.id.as_str(), &ur.derived_from))
        .collect();

    let mut traces = Vec::new();
    for ur in inputs.user_requirements {
        let child_srs: Vec<&str> = inputs
            .software_requirements
            .iter()
            .filter(|sr| sr.derived_from.contains(&ur.id))
            .map(|sr| sr.id.as_str())
            .collect();
        traces.push(RequirementTrace {
            requirement_id: ur.id.clone(),
            requirement_type: ur.requirement_type.to_string(),
            requirement_text: ur.text.clone(),
            feature_ids: ur.derived_from.clone(),
            code_references: ur.code_references.clone(),
            test_case_ids: tests_for(&ur.id),
            risk_ids: risks_for(&child_srs),
        });
    }
    for sr in inputs.software_requirements {
        let feature_ids: BTreeSet<String> = sr
            .derived_from
            .iter()
            .filter_map(|ur_id| ur_features.get(ur_id.as_str()))
            .flat_map(|ids| ids.iter().cloned())
            .collect();
        traces.push(RequirementTrace {
            requirement_id: sr.id.clone(),
            requirement_type: sr.requirement_type.to_string(),
            requirement_text: sr.text.clone(),
            feature_ids: feature_ids.into_iter().collect(),
            code_references: sr.code_references.clone(),
            test_case_ids: tests_for(&sr.id),
            risk_ids: risks_for(&[sr.id.as_str()]),
        });
    }
    traces
}

fn summarize(
    rows: &[TraceabilityTableRow],
    requirements: &[RequirementTrace],
    code_chunks: usize,
    covered_code_chunks: usize,
) -> TraceabilitySummary {
    let mut gaps_by_severity = BTreeMap::new();
    for severity in rows.iter().filter_map(|row| row.gap_severity) {
        *gaps_by_severity.entry(severity).or_insert(0) += 1;
    }
    TraceabilitySummary {
        total_rows: rows.len(),
        gap_rows: rows.iter().filter(|row| row.is_gap).count(),
        gaps_by_severity,
        total_requirements: requirements.len(),
        requirements_with_risks: requirements.iter().filter(|r| !r.risk_ids.is_empty()).count(),
        requirements_with_tests: requirements.iter().filter(|r| !r.test_case_ids.is_empty()).count(),
        code_chunks,
        covered_code_chunks,
        code_coverage_percentage: if code_chunks == 0 {
            0.0
        } else {
            covered_code_chunks as f64 / code_chunks as f64 * 100.0
        },
        average_confidence: if rows.is_empty() {
            0.0
        } else {
            rows.iter().map(|row| row.confidence).sum::<f64>() / rows.len() as f64
        },
    }
}

impl TraceabilityMatrix {
    pub fn gaps(&self) -> Vec<&TraceabilityTableRow> {
        self.rows.iter().filter(|row| row.is_gap).collect()
    }

    pub fn sort_rows(&mut self, key: SortKey) {
        match key {
            SortKey::RequirementId => self.rows.sort_by(|a, b| {
                requirement_sort_key(a).cmp(&requirement_sort_key(b))
            }),
            SortKey::Confidence => self.rows.sort_by(|a, b| a.confidence.total_cmp(&b.confidence)),
            SortKey::GapSeverity => self.rows.sort_by_key(|row| match row.gap_severity {
                Some(severity) => severity as u8,
                None => u8::MAX,
            }),
        }
    }

    pub fn filter(&self, filter: &RowFilter) -> Vec<&TraceabilityTableRow> {
        self.rows
            .iter()
            .filter(|row| filter.gaps.map_or(true, |gaps| row.is_gap == gaps))
            .filter(|row| filter.min_confidence.map_or(true, |min| row.confidence >= min))
            .filter(|row| match filter.element {
                None => true,
                Some(ElementType::Code) => row.code_reference.is_some(),
                Some(ElementType::Feature) => row.feature_id.is_some(),
                Some(ElementType::UserRequirement) => row.user_requirement_id.is_some(),
                Some(ElementType::SoftwareRequirement) => row.software_requirement_id.is_some(),
                Some(ElementType::Risk) => row.risk_id.is_some(),
            })
            .collect()
    }

    /// One line per requirement, multi-valued cells joined with `;`.
    pub fn export_to_csv(&self) -> String {
        let mut csv = String::from(CSV_HEADER);
        csv.push('\n');
        for trace in &self.requirements {
            let code_references: Vec<String> = trace.code_references.iter().map(|r| r.to_string()).collect();
            csv.push_str(&csv_line(&[
                trace.requirement_id.clone(),
                trace.requirement_type.clone(),
                trace.requirement_text.clone(),
                trace.feature_ids.join(";"),
                code_references.join(";"),
                trace.test_case_ids.join(";"),
                trace.risk_ids.join(";"),
            ]));
            csv.push('\n');
        }
        csv
    }

    pub fn export_to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn requirement_sort_key(row: &TraceabilityTableRow) -> (bool, String, bool, String) {
    // Rows without a requirement sort last.
    (
        row.software_requirement_id.is_none(),
        row.software_requirement_id.clone().unwrap_or_default(),
        row.user_requirement_id.is_none(),
        row.user_requirement_id.clone().unwrap_or_default(),
    )
}
