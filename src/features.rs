//! Feature extraction: code chunks to [`Feature`]s, by LLM where possible and
//! by function-name heuristics otherwise.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AnalysisConfig;
use crate::error_handler::StageIssue;
use crate::llm::params::Operation;
use crate::llm::response_parser::{ExpectedShape, LlmResponseParser};
use crate::llm::{request_json, CallFailure, LlmBackend, SharedBackend, StageBackend};
use crate::models::{estimate_tokens, ChunkType, CodeChunk, CodeReference, Feature};

const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("Input Validation", &["validat", "check", "verify", "sanitiz", "bound", "limit"]),
    ("Alarms and Alerts", &["alarm", "alert", "warn", "beep", "buzz", "notify"]),
    ("Dosing", &["dose", "dosing", "infus", "bolus", "pump", "deliver", "flow"]),
    ("Calculation", &["calc", "compute", "average", "sum", "convert", "score"]),
    ("Logging and Audit", &["log", "audit", "record", "history", "event", "trace"]),
    ("User Interface", &["display", "render", "screen", "button", "view", "show", "menu", "gui"]),
    ("Communication", &["send", "receive", "comm", "network", "socket", "serial", "uart", "transmit", "packet", "http", "bluetooth"]),
    ("Configuration", &["config", "setting", "setup", "init", "option", "param"]),
    ("Sensor Acquisition", &["sensor", "sample", "measure", "adc", "temperature", "pressure", "acquire", "read"]),
    ("Security", &["auth", "login", "password", "encrypt", "crypt", "token", "permission", "secur"]),
    ("Data Management", &["save", "load", "store", "persist", "database", "cache", "data", "file"]),
];

pub const GENERAL_CATEGORY: &str = "General";

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionSettings {
    pub batch_token_budget: usize,
    pub max_chunk_tokens: usize,
    pub dedup_threshold: f64,
    pub heuristic_confidence: f64,
    pub max_consecutive_failures: usize,
}

impl From<&AnalysisConfig> for ExtractionSettings {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            batch_token_budget: config.batch_token_budget.max(1),
            max_chunk_tokens: config.max_chunk_tokens.max(1),
            dedup_threshold: config.dedup_threshold,
            heuristic_confidence: config.heuristic_confidence,
            max_consecutive_failures: config.max_consecutive_failures.max(1),
        }
    }
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self::from(&AnalysisConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureExtractionResult {
    pub features: Vec<Feature>,
    /// Mean confidence over `features`.
    pub confidence_score: f64,
    pub processing_time_ms: u64,
    pub errors: Vec<StageIssue>,
    pub warnings: Vec<String>,
    pub used_fallback: bool,
}

#[derive(Deserialize)]
struct FeatureCandidate {
    #[serde(alias = "name", alias = "feature")]
    description: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    evidence: Vec<EvidenceCandidate>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EvidenceCandidate {
    Structured {
        #[serde(alias = "file_path", alias = "path")]
        file: String,
        #[serde(default)]
        start_line: Option<usize>,
        #[serde(default)]
        end_line: Option<usize>,
        #[serde(default)]
        line: Option<usize>,
    },
    Text(String),
}

impl EvidenceCandidate {
    fn to_reference(&self) -> Option<(String, usize, usize)> {
        match self {
            EvidenceCandidate::Structured {
                file,
                start_line,
                end_line,
                line,
            } => {
                let start = start_line.or(*line)?;
                Some((file.clone(), start, end_line.unwrap_or(start)))
            }
            EvidenceCandidate::Text(text) => {
                let (file, range) = text.trim().rsplit_once(':')?;
                let (start, end) = match range.split_once('-') {
                    Some((s, e)) => (s.trim().parse().ok()?, e.trim().parse().ok()?),
                    None => {
                        let line = range.trim().parse().ok()?;
                        (line, line)
                    }
                };
                Some((file.to_string(), start, end))
            }
        }
    }
}

struct BatchItem {
    index: usize,
    text: String,
}

pub struct FeatureExtractor {
    backend: StageBackend,
    settings: ExtractionSettings,
}

impl FeatureExtractor {
    pub fn new(backend: Option<SharedBackend>, settings: ExtractionSettings) -> Self {
        Self {
            backend: StageBackend::unchecked(backend),
            settings,
        }
    }

    /// Use the backend as already checked for this run.
    pub fn assume_checked(mut self) -> Self {
        self.backend = self.backend.into_checked();
        self
    }

    pub async fn extract(&self, chunks: &[CodeChunk], description: &str) -> FeatureExtractionResult {
        let started = Instant::now();
        let mut result = FeatureExtractionResult::default();
        if chunks.is_empty() {
            return result;
        }

        let batches = self.make_batches(chunks, &mut result.warnings);
        let mut covered = vec![false; chunks.len()];

        match self.backend.resolve().await {
            None => {
                warn!("LLM unavailable, extracting features heuristically");
                result
                    .errors
                    .push(StageIssue::llm_unavailable("LLM unavailable: heuristic feature extraction used"));
                result.used_fallback = true;
            }
            Some(backend) => {
                let mut consecutive_failures = 0;
                let mut batch_failed = false;
                for (batch_number, batch) in batches.iter().enumerate() {
                    match self
                        .extract_batch(backend.as_ref(), batch, chunks, description, &mut result.warnings)
                        .await
                    {
                        Ok(candidates) => {
                            consecutive_failures = 0;
                            for item in batch {
                                covered[item.index] = true;
                            }
                            for feature in candidates {
                                self.merge(&mut result.features, feature);
                            }
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            batch_failed = true;
                            warn!(batch = batch_number + 1, error = %e, "feature batch failed");
                            let mut issue = StageIssue::from(e);
                            issue.message = format!("batch {}: {}", batch_number + 1, issue.message);
                            result.errors.push(issue);
                            if consecutive_failures >= self.settings.max_consecutive_failures {
                                warn!(
                                    failures = consecutive_failures,
                                    "switching to heuristic extraction for remaining chunks"
                                );
                                break;
                            }
                        }
                    }
                }
                if batch_failed {
                    result.used_fallback = true;
                }
            }
        }

        // Chunks of failed or unsent batches still get a feature each.
        if result.used_fallback || result.features.is_empty() {
            result.used_fallback = true;
            let uncovered: Vec<&CodeChunk> = chunks
                .iter()
                .zip(&covered)
                .filter(|(_, covered)| !**covered)
                .map(|(chunk, _)| chunk)
                .collect();
            for feature in self.heuristic_features(&uncovered) {
                let id = format!("FEAT_{:04}", result.features.len() + 1);
                result.features.push(Feature { id, ..feature });
            }
        }

        result.confidence_score = mean_confidence(&result.features);
        result.processing_time_ms = started.elapsed().as_millis() as u64;
        info!(
            features = result.features.len(),
            used_fallback = result.used_fallback,
            confidence = result.confidence_score,
            "feature extraction finished"
        );
        result
    }

    /// Greedy packing in chunk order. A chunk over `max_chunk_tokens` is
    /// truncated, never dropped.
    fn make_batches(&self, chunks: &[CodeChunk], warnings: &mut Vec<String>) -> Vec<Vec<BatchItem>> {
        let mut batches = Vec::new();
        let mut current: Vec<BatchItem> = Vec::new();
        let mut current_tokens = 0;

        for (index, chunk) in chunks.iter().enumerate() {
            let mut content = chunk.content.clone();
            let tokens = chunk.estimated_tokens();
            if tokens > self.settings.max_chunk_tokens {
                content = content.chars().take(self.settings.max_chunk_tokens * 4).collect();
                let message = format!(
                    "{} ({}) truncated from ~{} to {} tokens",
                    chunk.reference(),
                    chunk.display_name(),
                    tokens,
                    self.settings.max_chunk_tokens
                );
                warn!("{}", message);
                warnings.push(message);
            }

            let text = format!(
                "### {} [{} {}]\n{}",
                chunk.reference(),
                chunk.chunk_type,
                chunk.display_name(),
                content
            );
            let item_tokens = estimate_tokens(&text);
            if !current.is_empty() && current_tokens + item_tokens > self.settings.batch_token_budget {
                batches.push(std::mem::take(&mut current));
                current_tokens = 0;
            }
            current_tokens += item_tokens;
            current.push(BatchItem { index, text });
        }
        if !current.is_empty() {
            batches.push(current);
        }
        debug!(batches = batches.len(), chunks = chunks.len(), "partitioned chunks");
        batches
    }

    async fn extract_batch(
        &self,
        backend: &dyn LlmBackend,
        batch: &[BatchItem],
        chunks: &[CodeChunk],
        description: &str,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<Feature>, CallFailure> {
        let context: Vec<String> = batch.iter().map(|item| item.text.clone()).collect();
        let data = request_json(
            backend,
            Operation::FeatureExtraction,
            &feature_prompt(description),
            &context,
            ExpectedShape::ArrayField("features"),
        )
        .await?;
        let (candidates, rejected) =
            LlmResponseParser::deserialize_items::<FeatureCandidate>(data).map_err(CallFailure::Malformed)?;
        warnings.extend(rejected);

        Ok(candidates
            .into_iter()
            .filter(|c| !c.description.trim().is_empty())
            .map(|c| self.anchor(c, batch, chunks))
            .collect())
    }

    /// Resolve candidate evidence against the batch. Evidence pointing
    /// outside the batch is dropped.
    fn anchor(&self, candidate: FeatureCandidate, batch: &[BatchItem], chunks: &[CodeChunk]) -> Feature {
        let batch_chunks: Vec<&CodeChunk> = batch.iter().map(|item| &chunks[item.index]).collect();
        let mut confidence = candidate.confidence.unwrap_or(0.5);

        let mut evidence: BTreeSet<CodeReference> = candidate
            .evidence
            .iter()
            .filter_map(EvidenceCandidate::to_reference)
            .filter_map(|(file, start, end)| {
                batch_chunks
                    .iter()
                    .find(|chunk| same_file(&file, &chunk.file_path))
                    .map(|chunk| CodeReference::new(chunk.file_path.clone(), start, end))
            })
            .filter(|reference| batch_chunks.iter().any(|chunk| chunk.reference().overlaps(reference)))
            .collect();

        if evidence.is_empty() {
            let lowered = candidate.description.to_lowercase();
            evidence = batch_chunks
                .iter()
                .filter(|chunk| {
                    chunk
                        .function_name
                        .as_ref()
                        .is_some_and(|name| lowered.contains(&name.to_lowercase()))
                })
                .map(|chunk| chunk.reference())
                .collect();
        }
        if evidence.is_empty() {
            // Unanchored: attach to the batch head as a weak link.
            if let Some(first) = batch_chunks.first() {
                evidence.insert(first.reference());
            }
            confidence = confidence.min(0.5);
        }

        let category = candidate
            .category
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| infer_category(&candidate.description).to_string());

        Feature {
            id: String::new(),
            description: candidate.description.trim().to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            evidence: evidence.into_iter().collect(),
            category,
        }
    }

    fn merge(&self, features: &mut Vec<Feature>, mut candidate: Feature) {
        let candidate_words = word_set(&candidate.description);
        if let Some(existing) = features
            .iter_mut()
            .find(|f| jaccard(&word_set(&f.description), &candidate_words) >= self.settings.dedup_threshold)
        {
            debug!(existing = %existing.id, "merging near-duplicate feature");
            for reference in candidate.evidence {
                if !existing.evidence.contains(&reference) {
                    existing.evidence.push(reference);
                }
            }
            existing.evidence.sort();
            existing.confidence = existing.confidence.max(candidate.confidence);
            return;
        }
        candidate.id = format!("FEAT_{:04}", features.len() + 1);
        features.push(candidate);
    }

    /// One feature per function or class chunk. Module chunks count only
    /// when no function or class chunk is available.
    pub fn heuristic_features(&self, chunks: &[&CodeChunk]) -> Vec<Feature> {
        let has_symbols = chunks.iter().any(|c| c.chunk_type != ChunkType::Module);
        chunks
            .iter()
            .filter(|chunk| !has_symbols || chunk.chunk_type != ChunkType::Module)
            .map(|chunk| {
                let name = chunk.display_name();
                let description = match chunk.chunk_type {
                    ChunkType::Module => format!("{} module", humanize(&name)),
                    _ => humanize(&name),
                };
                Feature {
                    id: String::new(),
                    category: infer_category(&name).to_string(),
                    description,
                    confidence: self.settings.heuristic_confidence,
                    evidence: vec![chunk.reference()],
                }
            })
            .collect()
    }
}

fn feature_prompt(description: &str) -> String {
    format!(
        "Project description: {}\n\n\
Identify the user-visible or safety-relevant features implemented by the code in the context. \
Give file:line evidence that points into the provided code only.\n\
Respond with JSON only, in this format:\n\
{{\"features\": [{{\"description\": \"short feature description\", \"category\": \"feature category\", \
\"confidence\": 0.0, \"evidence\": [{{\"file\": \"path\", \"start_line\": 1, \"end_line\": 1}}]}}]}}",
        if description.trim().is_empty() { "(none given)" } else { description.trim() }
    )
}

fn same_file(candidate: &str, path: &Path) -> bool {
    let candidate = candidate.trim().trim_start_matches("./").replace('\\', "/");
    let actual = path.to_string_lossy().replace('\\', "/");
    !candidate.is_empty() && (candidate == actual || actual.ends_with(&candidate) || candidate.ends_with(&actual))
}

fn mean_confidence(features: &[Feature]) -> f64 {
    if features.is_empty() {
        0.0
    } else {
        features.iter().map(|f| f.confidence).sum::<f64>() / features.len() as f64
    }
}

/// Lowercase words of an identifier or sentence, splitting camelCase.
pub fn split_words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut previous_lower = false;

    for ch in text.chars() {
        if !ch.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            previous_lower = false;
            continue;
        }
        if ch.is_uppercase() && previous_lower && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        previous_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// `validate_input` / `validateInput` -> `Validate input`.
pub fn humanize(identifier: &str) -> String {
    let sentence = split_words(identifier).join(" ");
    let mut chars = sentence.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => identifier.to_string(),
    }
}

pub fn infer_category(text: &str) -> &'static str {
    let words = split_words(text);
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, keywords)| {
            words
                .iter()
                .any(|word| keywords.iter().any(|keyword| word.starts_with(keyword)))
        })
        .map(|(category, _)| *category)
        .unwrap_or(GENERAL_CATEGORY)
}

fn word_set(text: &str) -> BTreeSet<String> {
    split_words(text).into_iter().collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}
