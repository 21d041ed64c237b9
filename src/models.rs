use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkType {
    Function,
    Class,
    Module,
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkType::Function => write!(f, "FUNCTION"),
            ChunkType::Class => write!(f, "CLASS"),
            ChunkType::Module => write!(f, "MODULE"),
        }
    }
}

/// A contiguous region of a source file produced by the ingestion parser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeChunk {
    pub file_path: PathBuf,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub function_name: Option<String>,
    pub chunk_type: ChunkType,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CodeChunk {
    pub fn reference(&self) -> CodeReference {
        CodeReference::new(self.file_path.clone(), self.start_line, self.end_line)
    }

    /// Rough token estimate (4 characters per token).
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.content)
    }

    pub fn display_name(&self) -> String {
        match &self.function_name {
            Some(name) => name.clone(),
            None => self
                .file_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "module".to_string()),
        }
    }
}

pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() + 3) / 4
}

/// A file and inclusive line range. Used both as feature evidence and as
/// requirement code references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeReference {
    pub file_path: PathBuf,
    pub start_line: usize,
    pub end_line: usize,
}

impl CodeReference {
    pub fn new(file_path: impl Into<PathBuf>, start_line: usize, end_line: usize) -> Self {
        let (start_line, end_line) = if end_line < start_line {
            (end_line, start_line)
        } else {
            (start_line, end_line)
        };
        Self {
            file_path: file_path.into(),
            start_line,
            end_line,
        }
    }

    pub fn overlaps(&self, other: &CodeReference) -> bool {
        self.file_path == other.file_path
            && self.start_line <= other.end_line
            && other.start_line <= self.end_line
    }
}

impl fmt::Display for CodeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}",
            self.file_path.display().to_string().replace('\\', "/"),
            self.start_line,
            self.end_line
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    pub id: String,
    pub description: String,
    pub confidence: f64,
    pub evidence: Vec<CodeReference>,
    pub category: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequirementType {
    User,
    Software,
}

impl fmt::Display for RequirementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequirementType::User => write!(f, "USER"),
            RequirementType::Software => write!(f, "SOFTWARE"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Requirement {
    pub id: String,
    #[serde(rename = "type")]
    pub requirement_type: RequirementType,
    pub text: String,
    pub acceptance_criteria: Vec<String>,
    /// Feature ids for user requirements, user requirement ids for software requirements.
    pub derived_from: Vec<String>,
    pub code_references: Vec<CodeReference>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Catastrophic,
    Serious,
    Minor,
}

impl Severity {
    pub const ALL: [Severity; 3] = [Severity::Catastrophic, Severity::Serious, Severity::Minor];

    pub fn weight(&self) -> u8 {
        match self {
            Severity::Catastrophic => 3,
            Severity::Serious => 2,
            Severity::Minor => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Catastrophic => "CATASTROPHIC",
            Severity::Serious => "SERIOUS",
            Severity::Minor => "MINOR",
        }
    }

    /// Exact (case-insensitive) name match only.
    pub fn parse_exact(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Probability {
    High,
    Medium,
    Low,
}

impl Probability {
    pub const ALL: [Probability; 3] = [Probability::High, Probability::Medium, Probability::Low];

    pub fn weight(&self) -> u8 {
        match self {
            Probability::High => 3,
            Probability::Medium => 2,
            Probability::Low => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Probability::High => "HIGH",
            Probability::Medium => "MEDIUM",
            Probability::Low => "LOW",
        }
    }

    pub fn parse_exact(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

impl fmt::Display for Probability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RiskLevel {
    Unacceptable,
    Undesirable,
    Acceptable,
    Negligible,
}

impl RiskLevel {
    /// ISO 14971 style severity x probability lookup.
    pub fn from_matrix(severity: Severity, probability: Probability) -> Self {
        use Probability::*;
        use Severity::*;
        match (severity, probability) {
            (Catastrophic, High) | (Catastrophic, Medium) | (Serious, High) => RiskLevel::Unacceptable,
            (Catastrophic, Low) | (Serious, Medium) | (Minor, High) => RiskLevel::Undesirable,
            (Serious, Low) | (Minor, Medium) => RiskLevel::Acceptable,
            (Minor, Low) => RiskLevel::Negligible,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Unacceptable => "Unacceptable",
            RiskLevel::Undesirable => "Undesirable",
            RiskLevel::Acceptable => "Acceptable",
            RiskLevel::Negligible => "Negligible",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            RiskLevel::Unacceptable,
            RiskLevel::Undesirable,
            RiskLevel::Acceptable,
            RiskLevel::Negligible,
        ]
        .into_iter()
        .find(|l| l.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single ISO 14971 risk entry. `risk_level` is always derived from
/// severity and probability, including on deserialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "RiskItemRecord")]
pub struct RiskItem {
    pub id: String,
    pub hazard: String,
    pub cause: String,
    pub effect: String,
    pub severity: Severity,
    pub probability: Probability,
    pub risk_level: RiskLevel,
    pub mitigation: String,
    pub verification: String,
    pub related_requirements: Vec<String>,
}

#[derive(Deserialize)]
struct RiskItemRecord {
    id: String,
    hazard: String,
    cause: String,
    effect: String,
    severity: Severity,
    probability: Probability,
    #[serde(default)]
    mitigation: String,
    #[serde(default)]
    verification: String,
    #[serde(default)]
    related_requirements: Vec<String>,
}

impl From<RiskItemRecord> for RiskItem {
    fn from(record: RiskItemRecord) -> Self {
        RiskItem {
            risk_level: RiskLevel::from_matrix(record.severity, record.probability),
            id: record.id,
            hazard: record.hazard,
            cause: record.cause,
            effect: record.effect,
            severity: record.severity,
            probability: record.probability,
            mitigation: record.mitigation,
            verification: record.verification,
            related_requirements: record.related_requirements,
        }
    }
}

impl RiskItem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        hazard: String,
        cause: String,
        effect: String,
        severity: Severity,
        probability: Probability,
        mitigation: String,
        verification: String,
        related_requirements: Vec<String>,
    ) -> Self {
        Self {
            id,
            hazard,
            cause,
            effect,
            severity,
            probability,
            risk_level: RiskLevel::from_matrix(severity, probability),
            mitigation,
            verification,
            related_requirements,
        }
    }

    /// Severity weight x probability weight, in 1..=9.
    pub fn risk_score(&self) -> u8 {
        self.severity.weight() * self.probability.weight()
    }

    pub fn rederive(&mut self) {
        self.risk_level = RiskLevel::from_matrix(self.severity, self.probability);
    }

    pub fn set_assessment(&mut self, severity: Severity, probability: Probability) {
        self.severity = severity;
        self.probability = probability;
        self.rederive();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestStep {
    pub step_number: usize,
    pub action: String,
    pub expected_result: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum TestPriority {
    High,
    Medium,
    Low,
}

impl fmt::Display for TestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestPriority::High => write!(f, "High"),
            TestPriority::Medium => write!(f, "Medium"),
            TestPriority::Low => write!(f, "Low"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TestCategory {
    Functional,
    Safety,
    Acceptance,
}

impl fmt::Display for TestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestCategory::Functional => write!(f, "Functional"),
            TestCategory::Safety => write!(f, "Safety"),
            TestCategory::Acceptance => write!(f, "Acceptance"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    pub id: String,
    pub name: String,
    pub description: String,
    pub requirement_id: String,
    pub preconditions: Vec<String>,
    pub steps: Vec<TestStep>,
    pub expected_results: Vec<String>,
    pub priority: TestPriority,
    pub category: TestCategory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TestCoverage {
    pub total_requirements: usize,
    pub covered_requirements: usize,
    pub coverage_percentage: f64,
    pub uncovered_requirements: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TestOutline {
    pub test_cases: Vec<TestCase>,
    pub coverage: TestCoverage,
    pub validation_errors: Vec<String>,
    pub used_fallback: bool,
}

/// What the ingestion layer hands to the parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectStructure {
    pub root_path: PathBuf,
    pub selected_files: Vec<PathBuf>,
    pub description: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}
