//! Read-only code tools: gather full source, summarize context, list files.
//!
//! Paths are relative to the workspace root. Files that are missing or
//! unreadable are reported as warnings alongside whatever could be read.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context as _;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use walkdir::{DirEntry, WalkDir};

use super::{ensure_in_workspace, resolve_in_workspace, Tool, ToolContext, ToolError, ToolOutput, ToolRisk};

/// Directories never descended into when walking the workspace.
const SKIPPED_DIRS: &[&str] = &["target", "node_modules", "__pycache__", "venv", "dist", "build"];

fn string_list(args: &Value, key: &str) -> Vec<String> {
    args[key]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Read a workspace file, turning every failure into a warning line.
async fn read_workspace_file(root: &Path, file: &str) -> Result<String, String> {
    let path = resolve_in_workspace(root, file).map_err(|e| format!("{}: {}", file, e))?;
    let canonical_root = tokio::fs::canonicalize(root)
        .await
        .map_err(|e| format!("{}: workspace root unavailable: {}", file, e))?;
    let real = match tokio::fs::canonicalize(&path).await {
        Ok(real) => real,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("File {} not found", path.display());
            return Err(format!("{}: file not found", file));
        }
        Err(e) => return Err(format!("{}: {}", file, e)),
    };
    if let Err(e) = ensure_in_workspace(&canonical_root, &real, file) {
        tracing::warn!("Refusing to read {}: resolves to {}", file, real.display());
        return Err(format!("{}: {}", file, e));
    }

    match tokio::fs::read_to_string(&real).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("File {} not found", path.display());
            Err(format!("{}: file not found", file))
        }
        Err(e) => {
            tracing::warn!("Error reading file {}: {}", path.display(), e);
            Err(format!("{}: {}", file, e))
        }
    }
}

fn is_walkable(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    if name.starts_with('.') {
        return false;
    }
    !(entry.file_type().is_dir() && SKIPPED_DIRS.contains(&name.as_ref()))
}

/// Canonical path of a walked regular file. `Ok(None)` for anything that is
/// not a file, `Err` with a warning when the entry resolves outside the root.
fn walked_file(canonical_root: &Path, root: &Path, entry: &DirEntry) -> Result<Option<PathBuf>, String> {
    if !(entry.file_type().is_file() || entry.path_is_symlink()) {
        return Ok(None);
    }
    let display = relative_display(root, entry.path());
    let real = std::fs::canonicalize(entry.path()).map_err(|e| format!("{}: {}", display, e))?;
    ensure_in_workspace(canonical_root, &real, &display)?;
    Ok(real.is_file().then_some(real))
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

/// Return the full content of changed files with line numbers.
///
/// This hands raw source text to the model, so its output is moderated.
pub struct GatherFullCode;

#[async_trait]
impl Tool for GatherFullCode {
    fn name(&self) -> &str {
        "gather_full_code"
    }

    fn description(&self) -> &str {
        "Takes a list of files and returns their full contents. Each line in the returned file contents is prefixed with its line number."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "changed_files": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Paths relative to the workspace root"
                }
            },
            "required": ["changed_files"]
        })
    }

    fn risk(&self) -> ToolRisk {
        ToolRisk::High
    }

    async fn execute(&self, args: Value, ctx: ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        let files = string_list(&args, "changed_files");
        tracing::debug!("Gathering {} files", files.len());

        let mut contents = Map::new();
        let mut warnings = Vec::new();
        for file in files {
            match read_workspace_file(ctx.workspace_root, &file).await {
                Ok(content) => {
                    let numbered: String = content
                        .lines()
                        .enumerate()
                        .map(|(i, line)| format!("{}: {}\n", i + 1, line))
                        .collect();
                    contents.insert(file, Value::String(numbered));
                }
                Err(warning) => warnings.push(warning),
            }
        }

        Ok(ToolOutput::new(Value::Object(contents)).with_warnings(warnings))
    }
}

fn outline_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^\s*(?:pub(?:\([^)]*\))?\s+|export\s+(?:default\s+)?)?(?:async\s+)?(?:def|class|fn|struct|enum|trait|impl|function|func|interface|type|mod|@app\.route)\b",
        )
        .expect("outline pattern is valid")
    })
}

/// Summarize changed files and the project's documentation.
///
/// Returns sizes and an outline of definitions rather than raw source.
pub struct AnalyzeCodeContext {
    /// Total characters of markdown documentation included.
    pub max_doc_chars: usize,
    /// Outline entries kept per file.
    pub max_outline_lines: usize,
}

impl Default for AnalyzeCodeContext {
    fn default() -> Self {
        Self {
            max_doc_chars: 8_000,
            max_outline_lines: 60,
        }
    }
}

impl AnalyzeCodeContext {
    fn outline(&self, content: &str) -> Vec<String> {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| outline_pattern().is_match(line))
            .take(self.max_outline_lines)
            .map(|(i, line)| format!("{}: {}", i + 1, line.trim()))
            .collect()
    }

    fn collect_docs(root: PathBuf, budget: usize) -> (Vec<Value>, Vec<String>) {
        let mut docs = Vec::new();
        let mut warnings = Vec::new();
        let mut remaining = budget;

        let canonical_root = match std::fs::canonicalize(&root) {
            Ok(path) => path,
            Err(e) => return (docs, vec![format!("workspace root unavailable: {}", e)]),
        };

        for entry in WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(is_walkable)
        {
            if remaining == 0 {
                break;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warnings.push(format!("error walking workspace: {}", e));
                    continue;
                }
            };
            if !entry.path().extension().is_some_and(|ext| ext == "md") {
                continue;
            }
            let real = match walked_file(&canonical_root, &root, &entry) {
                Ok(Some(real)) => real,
                Ok(None) => continue,
                Err(warning) => {
                    warnings.push(warning);
                    continue;
                }
            };

            let display = relative_display(&root, entry.path());
            match std::fs::read_to_string(&real) {
                Ok(text) => {
                    let excerpt: String = text.chars().take(remaining).collect();
                    remaining -= excerpt.chars().count();
                    docs.push(json!({ "path": display, "excerpt": excerpt }));
                }
                Err(e) => warnings.push(format!("{}: {}", display, e)),
            }
        }

        (docs, warnings)
    }
}

#[async_trait]
impl Tool for AnalyzeCodeContext {
    fn name(&self) -> &str {
        "analyze_code_context"
    }

    fn description(&self) -> &str {
        "Takes a list of changed functions and changed files and returns a summary of the relevant files (size and definitions) and the project's documentation."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "function_changes": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Functions touched by the change"
                },
                "changed_files": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Paths relative to the workspace root"
                }
            },
            "required": ["changed_files"]
        })
    }

    async fn execute(&self, args: Value, ctx: ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        let files = string_list(&args, "changed_files");
        let function_changes = string_list(&args, "function_changes");

        let mut summaries = Map::new();
        let mut warnings = Vec::new();
        for file in files {
            match read_workspace_file(ctx.workspace_root, &file).await {
                Ok(content) => {
                    summaries.insert(
                        file,
                        json!({
                            "lines": content.lines().count(),
                            "bytes": content.len(),
                            "outline": self.outline(&content),
                        }),
                    );
                }
                Err(warning) => warnings.push(warning),
            }
        }

        let root = ctx.workspace_root.to_path_buf();
        let budget = self.max_doc_chars;
        let (docs, doc_warnings) = tokio::task::spawn_blocking(move || Self::collect_docs(root, budget))
            .await
            .context("documentation scan panicked")?;
        warnings.extend(doc_warnings);

        Ok(ToolOutput::new(json!({
            "files": summaries,
            "function_changes": function_changes,
            "documentation": docs,
        }))
        .with_warnings(warnings))
    }
}

/// List every text file in the workspace with its line count.
#[derive(Debug, Clone, Copy)]
pub struct ListWorkspaceFiles {
    pub max_files: usize,
    /// Files larger than this are skipped with a warning.
    pub max_file_bytes: u64,
}

impl Default for ListWorkspaceFiles {
    fn default() -> Self {
        Self {
            max_files: 2_000,
            max_file_bytes: 1024 * 1024,
        }
    }
}

/// Why a file was left out of the listing.
enum Unlisted {
    Binary,
    Warning(String),
}

/// Count lines without holding the whole file. Non-UTF-8 content counts as
/// binary.
fn count_lines(path: &Path) -> Result<usize, Unlisted> {
    let file = File::open(path).map_err(|e| Unlisted::Warning(e.to_string()))?;
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let mut count = 0;
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| Unlisted::Warning(e.to_string()))?;
        if read == 0 {
            return Ok(count);
        }
        if std::str::from_utf8(&line).is_err() {
            return Err(Unlisted::Binary);
        }
        count += 1;
    }
}

impl ListWorkspaceFiles {
    fn walk(self, root: PathBuf) -> (Vec<Value>, Vec<String>) {
        let mut files = Vec::new();
        let mut warnings = Vec::new();

        let canonical_root = match std::fs::canonicalize(&root) {
            Ok(path) => path,
            Err(e) => return (files, vec![format!("workspace root unavailable: {}", e)]),
        };

        for entry in WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(is_walkable)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warnings.push(format!("error walking workspace: {}", e));
                    continue;
                }
            };
            let real = match walked_file(&canonical_root, &root, &entry) {
                Ok(Some(real)) => real,
                Ok(None) => continue,
                Err(warning) => {
                    warnings.push(warning);
                    continue;
                }
            };
            if files.len() >= self.max_files {
                warnings.push(format!("listing truncated at {} files", self.max_files));
                break;
            }

            let display = relative_display(&root, entry.path());
            match std::fs::metadata(&real) {
                Ok(meta) if meta.len() > self.max_file_bytes => {
                    warnings.push(format!(
                        "{}: skipped, larger than {} bytes",
                        display, self.max_file_bytes
                    ));
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warnings.push(format!("{}: {}", display, e));
                    continue;
                }
            }
            match count_lines(&real) {
                Ok(lines) => files.push(json!({ "path": display, "lines": lines })),
                Err(Unlisted::Binary) => {
                    let path = &display;
                    tracing::debug!("Skipping binary file {}", path)
                }
                Err(Unlisted::Warning(e)) => warnings.push(format!("{}: {}", display, e)),
            }
        }

        (files, warnings)
    }
}

#[async_trait]
impl Tool for ListWorkspaceFiles {
    fn name(&self) -> &str {
        "list_workspace_files"
    }

    fn description(&self) -> &str {
        "List all files in the workspace with their line counts."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, ctx: ToolContext<'_>) -> Result<ToolOutput, ToolError> {
        let root = ctx.workspace_root.to_path_buf();
        let lister = *self;
        let (files, warnings) = tokio::task::spawn_blocking(move || lister.walk(root))
            .await
            .context("workspace listing panicked")?;

        Ok(ToolOutput::new(Value::Array(files)).with_warnings(warnings))
    }
}
