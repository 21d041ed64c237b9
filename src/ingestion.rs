//! Project ingestion and source chunking for C and JavaScript trees.

use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error_handler::{IngestionError, ParseError};
use crate::models::{ChunkType, CodeChunk, ProjectStructure};

pub const SOURCE_EXTENSIONS: [&str; 5] = ["c", "h", "js", "mjs", "cjs"];
const SKIPPED_DIRS: [&str; 5] = ["node_modules", ".git", "build", "dist", "target"];
const NOT_FUNCTIONS: [&str; 8] = ["if", "while", "for", "switch", "return", "else", "sizeof", "do"];

/// Turns a project root into a [`ProjectStructure`] and its [`CodeChunk`]s.
#[async_trait]
pub trait ProjectIngestor: Send + Sync {
    async fn ingest(
        &self,
        root: &Path,
        selected: &[PathBuf],
        description: &str,
    ) -> Result<ProjectStructure, IngestionError>;

    async fn parse(&self, project: &ProjectStructure) -> Result<Vec<CodeChunk>, ParseError>;

    /// Files an ingest of `root` would cover. Feeds the cache fingerprint,
    /// so it runs before ingestion and must not fail.
    fn candidate_files(&self, _root: &Path, selected: &[PathBuf]) -> Vec<PathBuf> {
        selected.to_vec()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    C,
    JavaScript,
}

impl Language {
    fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "c" | "h" => Some(Language::C),
            "js" | "mjs" | "cjs" => Some(Language::JavaScript),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::JavaScript => "javascript",
        }
    }
}

struct ChunkStart {
    line: usize,
    name: String,
    chunk_type: ChunkType,
    exported: bool,
}

/// Regex-based ingestor. Functions and classes are located by their
/// signature line and closed by brace matching.
pub struct SourceIngestor {
    c_function: Regex,
    js_function: Regex,
    js_assigned_function: Regex,
    js_exports_function: Regex,
    js_class: Regex,
}

impl SourceIngestor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            c_function: Regex::new(r"^(?:[A-Za-z_]\w*[\s\*]+)+\**([A-Za-z_]\w*)\s*\(")?,
            js_function: Regex::new(
                r"^\s*(export\s+(?:default\s+)?)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)\s*\(",
            )?,
            js_assigned_function: Regex::new(
                r"^\s*(export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=\s*(?:async\s+)?(?:function\b|\([^)]*\)\s*=>|[A-Za-z_$][\w$]*\s*=>)",
            )?,
            js_exports_function: Regex::new(
                r"^\s*(?:module\.)?exports\.([A-Za-z_$][\w$]*)\s*=\s*(?:async\s+)?(?:function\b|\([^)]*\)\s*=>)",
            )?,
            js_class: Regex::new(r"^\s*(export\s+(?:default\s+)?)?class\s+([A-Za-z_$][\w$]*)")?,
        })
    }

    /// All C/JS source files under `root`, relative to it and sorted.
    pub fn discover(&self, root: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(root)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || !is_skipped_dir(&entry.file_name().to_string_lossy())
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| Language::from_path(entry.path()).is_some())
            .filter_map(|entry| entry.path().strip_prefix(root).ok().map(Path::to_path_buf))
            .collect();
        files.sort();
        files
    }

    pub fn chunk_source(&self, relative_path: &Path, content: &str) -> Vec<CodeChunk> {
        let Some(language) = Language::from_path(relative_path) else {
            return Vec::new();
        };
        let lines: Vec<&str> = content.lines().collect();
        let mut chunks = Vec::new();
        let mut cursor = 0;

        while cursor < lines.len() {
            let Some(start) = self.detect_start(language, &lines, cursor) else {
                cursor += 1;
                continue;
            };

            let end = match find_open_brace(&lines, start.line, language) {
                Some((open_line, open_col)) => {
                    find_block_end(&lines, open_line, open_col).unwrap_or(lines.len() - 1)
                }
                None if language == Language::C => {
                    // Prototype or declaration, not a definition.
                    cursor += 1;
                    continue;
                }
                None => start.line,
            };

            let mut metadata = BTreeMap::new();
            metadata.insert("language".to_string(), language.name().to_string());
            if start.exported {
                metadata.insert("exported".to_string(), "true".to_string());
            }

            chunks.push(CodeChunk {
                file_path: relative_path.to_path_buf(),
                start_line: start.line + 1,
                end_line: end + 1,
                content: lines[start.line..=end].join("\n"),
                function_name: Some(start.name),
                chunk_type: start.chunk_type,
                metadata,
            });
            cursor = end + 1;
        }

        if chunks.is_empty() && !content.trim().is_empty() {
            let mut metadata = BTreeMap::new();
            metadata.insert("language".to_string(), language.name().to_string());
            chunks.push(CodeChunk {
                file_path: relative_path.to_path_buf(),
                start_line: 1,
                end_line: lines.len().max(1),
                content: content.to_string(),
                function_name: None,
                chunk_type: ChunkType::Module,
                metadata,
            });
        }

        chunks
    }

    fn detect_start(&self, language: Language, lines: &[&str], index: usize) -> Option<ChunkStart> {
        let line = lines[index];
        match language {
            Language::C => {
                let captures = self.c_function.captures(line)?;
                let name = captures.get(1)?.as_str();
                let prefix = &line[..captures.get(1)?.start()];
                let keyword_hit = NOT_FUNCTIONS.contains(&name)
                    || prefix
                        .split(|c: char| c.is_whitespace() || c == '*')
                        .any(|token| NOT_FUNCTIONS.contains(&token) || token == "typedef");
                if keyword_hit {
                    return None;
                }
                Some(ChunkStart {
                    line: index,
                    name: name.to_string(),
                    chunk_type: ChunkType::Function,
                    exported: !prefix.contains("static"),
                })
            }
            Language::JavaScript => {
                if let Some(captures) = self.js_class.captures(line) {
                    return Some(ChunkStart {
                        line: index,
                        name: captures.get(2)?.as_str().to_string(),
                        chunk_type: ChunkType::Class,
                        exported: captures.get(1).is_some(),
                    });
                }
                if let Some(captures) = self.js_function.captures(line) {
                    return Some(ChunkStart {
                        line: index,
                        name: captures.get(2)?.as_str().to_string(),
                        chunk_type: ChunkType::Function,
                        exported: captures.get(1).is_some(),
                    });
                }
                if let Some(captures) = self.js_assigned_function.captures(line) {
                    return Some(ChunkStart {
                        line: index,
                        name: captures.get(2)?.as_str().to_string(),
                        chunk_type: ChunkType::Function,
                        exported: captures.get(1).is_some(),
                    });
                }
                let captures = self.js_exports_function.captures(line)?;
                Some(ChunkStart {
                    line: index,
                    name: captures.get(1)?.as_str().to_string(),
                    chunk_type: ChunkType::Function,
                    exported: true,
                })
            }
        }
    }
}

fn is_skipped_dir(name: &str) -> bool {
    SKIPPED_DIRS.contains(&name) || (name.starts_with('.') && name.len() > 1)
}

/// Position of the block-opening brace following a signature, unless a
/// statement terminator comes first.
fn find_open_brace(lines: &[&str], start: usize, language: Language) -> Option<(usize, usize)> {
    let lookahead = match language {
        Language::C => 6,
        Language::JavaScript => 3,
    };
    for (offset, line) in lines.iter().skip(start).take(lookahead).enumerate() {
        for (col, ch) in line.char_indices() {
            match ch {
                '{' => return Some((start + offset, col)),
                ';' => return None,
                _ => {}
            }
        }
    }
    None
}

fn find_block_end(lines: &[&str], open_line: usize, open_col: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_block_comment = false;

    for (offset, line) in lines[open_line..].iter().enumerate() {
        let text = if offset == 0 { &line[open_col..] } else { line };
        let mut chars = text.chars().peekable();
        let mut quote: Option<char> = None;

        while let Some(ch) = chars.next() {
            if in_block_comment {
                if ch == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    in_block_comment = false;
                }
                continue;
            }
            if let Some(q) = quote {
                if ch == '\\' {
                    chars.next();
                } else if ch == q {
                    quote = None;
                }
                continue;
            }
            match ch {
                '/' if chars.peek() == Some(&'/') => break,
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    in_block_comment = true;
                }
                '"' | '\'' | '`' => quote = Some(ch),
                '{' => depth += 1,
                '}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Some(open_line + offset);
                    }
                }
                _ => {}
            }
        }
    }
    None
}

#[async_trait]
impl ProjectIngestor for SourceIngestor {
    async fn ingest(
        &self,
        root: &Path,
        selected: &[PathBuf],
        description: &str,
    ) -> Result<ProjectStructure, IngestionError> {
        let metadata = fs::metadata(root)
            .await
            .map_err(|e| IngestionError::from_io(root.to_path_buf(), e))?;
        if !metadata.is_dir() {
            return Err(IngestionError::NotADirectory(root.to_path_buf()));
        }
        let root_path = fs::canonicalize(root)
            .await
            .map_err(|e| IngestionError::from_io(root.to_path_buf(), e))?;

        let mut files = if selected.is_empty() {
            self.discover(&root_path)
        } else {
            let mut resolved = Vec::with_capacity(selected.len());
            for file in selected {
                let relative = file.strip_prefix(&root_path).unwrap_or(file).to_path_buf();
                let absolute = root_path.join(&relative);
                let file_metadata = fs::metadata(&absolute)
                    .await
                    .map_err(|e| IngestionError::from_io(absolute.clone(), e))?;
                if file_metadata.is_file() && Language::from_path(&relative).is_some() {
                    resolved.push(relative);
                } else {
                    warn!(file = %relative.display(), "skipping selected file that is not C/JS source");
                }
            }
            resolved
        };
        files.sort();
        files.dedup();

        if files.is_empty() {
            return Err(IngestionError::NoSourceFiles(root_path));
        }

        let c_files = files
            .iter()
            .filter(|f| Language::from_path(f) == Some(Language::C))
            .count();
        let mut project_metadata = BTreeMap::new();
        project_metadata.insert("file_count".to_string(), files.len().to_string());
        project_metadata.insert("c_files".to_string(), c_files.to_string());
        project_metadata.insert("js_files".to_string(), (files.len() - c_files).to_string());

        info!(root = %root_path.display(), files = files.len(), "ingested project");

        Ok(ProjectStructure {
            root_path,
            selected_files: files,
            description: description.to_string(),
            metadata: project_metadata,
        })
    }

    async fn parse(&self, project: &ProjectStructure) -> Result<Vec<CodeChunk>, ParseError> {
        let mut chunks = Vec::new();

        for relative in &project.selected_files {
            let absolute = project.root_path.join(relative);
            let bytes = fs::read(&absolute)
                .await
                .map_err(|source| ParseError::Unreadable {
                    path: absolute.clone(),
                    source,
                })?;
            let content = String::from_utf8_lossy(&bytes);
            let file_chunks = self.chunk_source(relative, &content);
            debug!(file = %relative.display(), chunks = file_chunks.len(), "chunked source file");
            chunks.extend(file_chunks);
        }

        if chunks.is_empty() {
            return Err(ParseError::NoChunks(project.selected_files.len()));
        }
        Ok(chunks)
    }

    fn candidate_files(&self, root: &Path, selected: &[PathBuf]) -> Vec<PathBuf> {
        if selected.is_empty() {
            self.discover(root)
        } else {
            selected.to_vec()
        }
    }
}
