use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::export::{csv_line, parse_csv};
use crate::models::{Probability, RiskItem, RiskLevel, Severity};

pub const CSV_HEADER: [&str; 11] = [
    "RiskID",
    "Hazard",
    "Cause",
    "Effect",
    "Severity",
    "Probability",
    "RiskLevel",
    "RiskScore",
    "Mitigation",
    "Verification",
    "RelatedRequirements",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskRegisterMetadata {
    pub generation_method: String,
    pub total_risks: usize,
    pub timestamp: DateTime<Utc>,
    pub iso_14971_compliant: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskRegister {
    pub risks: Vec<RiskItem>,
    pub metadata: RiskRegisterMetadata,
}

#[derive(Debug, Error, PartialEq)]
pub enum RiskImportError {
    #[error("risk register CSV is empty")]
    Empty,

    #[error("risk register CSV is missing column {0}")]
    MissingColumn(&'static str),

    #[error("line {line}: invalid {field} '{value}'")]
    InvalidValue {
        line: usize,
        field: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiskSummary {
    pub total: usize,
    pub by_level: BTreeMap<RiskLevel, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub highest_score: u8,
}

impl RiskSummary {
    pub fn count(&self, level: RiskLevel) -> usize {
        self.by_level.get(&level).copied().unwrap_or(0)
    }
}

/// Pure aggregation of hazard analysis output. No LLM involvement.
pub struct RiskRegisterBuilder;

impl RiskRegisterBuilder {
    pub fn build(risks: Vec<RiskItem>, generation_method: &str) -> RiskRegister {
        let mut register = RiskRegister {
            metadata: RiskRegisterMetadata {
                generation_method: generation_method.to_string(),
                total_risks: risks.len(),
                timestamp: Utc::now(),
                iso_14971_compliant: true,
            },
            risks,
        };
        for risk in &mut register.risks {
            risk.rederive();
        }
        register
    }
}

impl RiskRegister {
    pub fn empty() -> Self {
        RiskRegisterBuilder::build(Vec::new(), "none")
    }

    pub fn filter_by_severity(&self, severity: Severity) -> Vec<&RiskItem> {
        self.risks.iter().filter(|r| r.severity == severity).collect()
    }

    pub fn filter_by_risk_level(&self, level: RiskLevel) -> Vec<&RiskItem> {
        self.risks.iter().filter(|r| r.risk_level == level).collect()
    }

    /// Highest score first; equal scores ordered by id.
    pub fn sort_by_priority(&mut self) {
        self.risks
            .sort_by(|a, b| b.risk_score().cmp(&a.risk_score()).then_with(|| a.id.cmp(&b.id)));
    }

    pub fn summary(&self) -> RiskSummary {
        let mut summary = RiskSummary {
            total: self.risks.len(),
            ..RiskSummary::default()
        };
        for risk in &self.risks {
            *summary.by_level.entry(risk.risk_level).or_insert(0) += 1;
            *summary.by_severity.entry(risk.severity).or_insert(0) += 1;
            summary.highest_score = summary.highest_score.max(risk.risk_score());
        }
        summary
    }

    pub fn export_to_csv(&self) -> String {
        let mut csv = csv_line(&CSV_HEADER);
        csv.push('\n');
        for risk in &self.risks {
            let score = risk.risk_score().to_string();
            let related = risk.related_requirements.join(";");
            csv.push_str(&csv_line(&[
                risk.id.as_str(),
                &risk.hazard,
                &risk.cause,
                &risk.effect,
                risk.severity.as_str(),
                risk.probability.as_str(),
                risk.risk_level.as_str(),
                &score,
                &risk.mitigation,
                &risk.verification,
                &related,
            ]));
            csv.push('\n');
        }
        csv
    }

    pub fn export_to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Re-read an exported register. The stored risk level column is
    /// ignored and re-derived from severity and probability.
    pub fn from_csv(text: &str) -> Result<Self, RiskImportError> {
        let mut records = parse_csv(text).into_iter();
        let header = records.next().ok_or(RiskImportError::Empty)?;
        let column = |name: &'static str| {
            header
                .iter()
                .position(|h| h.trim() == name)
                .ok_or(RiskImportError::MissingColumn(name))
        };
        let id_col = column("RiskID")?;
        let hazard_col = column("Hazard")?;
        let cause_col = column("Cause")?;
        let effect_col = column("Effect")?;
        let severity_col = column("Severity")?;
        let probability_col = column("Probability")?;
        let mitigation_col = column("Mitigation").ok();
        let verification_col = column("Verification").ok();
        let related_col = column("RelatedRequirements").ok();

        let mut risks = Vec::new();
        for (offset, record) in records.enumerate() {
            let line = offset + 2;
            let field = |index: usize| record.get(index).map(String::as_str).unwrap_or("");
            let optional = |index: Option<usize>| index.map(field).unwrap_or("").to_string();

            let severity = Severity::parse_exact(field(severity_col)).ok_or_else(|| RiskImportError::InvalidValue {
                line,
                field: "Severity",
                value: field(severity_col).to_string(),
            })?;
            let probability =
                Probability::parse_exact(field(probability_col)).ok_or_else(|| RiskImportError::InvalidValue {
                    line,
                    field: "Probability",
                    value: field(probability_col).to_string(),
                })?;

            risks.push(RiskItem::new(
                field(id_col).to_string(),
                field(hazard_col).to_string(),
                field(cause_col).to_string(),
                field(effect_col).to_string(),
                severity,
                probability,
                optional(mitigation_col),
                optional(verification_col),
                optional(related_col)
                    .split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            ));
        }

        Ok(RiskRegisterBuilder::build(risks, "csv_import"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn risk(id: &str, severity: Severity, probability: Probability) -> RiskItem {
        RiskItem::new(
            id.to_string(),
            format!("Hazard {}", id),
            "Valve stuck, \"open\" position".to_string(),
            "Overdose\nand injury".to_string(),
            severity,
            probability,
            "Add a valve position sensor".to_string(),
            "Inject fault, observe alarm".to_string(),
            vec!["SR_0001".to_string(), "SR_0002".to_string()],
        )
    }

    fn sample() -> RiskRegister {
        RiskRegisterBuilder::build(
            vec![
                risk("RISK_0003", Severity::Minor, Probability::Low),
                risk("RISK_0002", Severity::Catastrophic, Probability::High),
                risk("RISK_0001", Severity::Serious, Probability::Medium),
                risk("RISK_0004", Severity::Minor, Probability::High),
            ],
            "llm",
        )
    }

    #[test]
    fn test_metadata() {
        let register = sample();
        assert_eq!(register.metadata.total_risks, 4);
        assert!(register.metadata.iso_14971_compliant);
        assert_eq!(RiskRegister::empty().summary().total, 0);
    }

    #[test]
    fn test_sort_by_priority_breaks_ties_by_id() {
        let mut register = sample();
        register.sort_by_priority();
        let order: Vec<_> = register.risks.iter().map(|r| r.id.as_str()).collect();
        // Scores: 9, 4, 3, 1. RISK_0001 (2x2) and RISK_0004 (1x3) differ.
        assert_eq!(order, vec!["RISK_0002", "RISK_0001", "RISK_0004", "RISK_0003"]);

        let mut tied = RiskRegisterBuilder::build(
            vec![
                risk("RISK_0009", Severity::Serious, Probability::Medium),
                risk("RISK_0005", Severity::Serious, Probability::Medium),
            ],
            "llm",
        );
        tied.sort_by_priority();
        assert_eq!(tied.risks[0].id, "RISK_0005");
    }

    #[test]
    fn test_filters_and_summary() {
        let register = sample();
        assert_eq!(register.filter_by_severity(Severity::Minor).len(), 2);
        assert_eq!(register.filter_by_risk_level(RiskLevel::Unacceptable).len(), 1);

        let summary = register.summary();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.count(RiskLevel::Undesirable), 2);
        assert_eq!(summary.count(RiskLevel::Negligible), 1);
        assert_eq!(summary.count(RiskLevel::Acceptable), 0);
        assert_eq!(summary.highest_score, 9);
    }

    #[test]
    fn test_csv_export_reimports_same_assessments() {
        let register = sample();
        let csv = register.export_to_csv();
        assert!(csv.starts_with("RiskID,Hazard,Cause,Effect,Severity,Probability,RiskLevel,RiskScore,"));

        let reparsed = RiskRegister::from_csv(&csv).unwrap();
        let key = |r: &RiskItem| (r.id.clone(), r.severity, r.probability, r.risk_level);
        let original: BTreeSet<_> = register.risks.iter().map(key).collect();
        let roundtrip: BTreeSet<_> = reparsed.risks.iter().map(key).collect();
        assert_eq!(original, roundtrip);
        assert_eq!(reparsed.risks[0].cause, "Valve stuck, \"open\" position");
        assert_eq!(reparsed.risks[0].related_requirements, vec!["SR_0001", "SR_0002"]);
    }

    #[test]
    fn test_from_csv_rejects_bad_values() {
        let csv = "RiskID,Hazard,Cause,Effect,Severity,Probability\nRISK_0001,h,c,e,DEADLY,LOW\n";
        assert_eq!(
            RiskRegister::from_csv(csv),
            Err(RiskImportError::InvalidValue {
                line: 2,
                field: "Severity",
                value: "DEADLY".to_string()
            })
        );
        assert_eq!(
            RiskRegister::from_csv("RiskID,Hazard\n"),
            Err(RiskImportError::MissingColumn("Cause"))
        );
    }

    #[test]
    fn test_json_export_recomputes_level_on_load() {
        let json = sample().export_to_json().unwrap();
        let tampered = json.replace("\"Negligible\"", "\"Unacceptable\"");
        let loaded: RiskRegister = serde_json::from_str(&tampered).unwrap();
        assert_eq!(loaded.risks[0].risk_level, RiskLevel::Negligible);
    }
}
