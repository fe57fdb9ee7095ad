//! Tools an agent can call during a run.
//!
//! A tool is a named, schema-described callable. Schemas are compiled once
//! when a [`ToolRegistry`] is built, and the runner validates every call
//! against them before the handler runs. Handlers only read from the
//! workspace; a file that cannot be read becomes a warning in the result, not
//! a failed call.

mod agent_tool;
mod code;

pub use agent_tool::AgentTool;
pub use code::{AnalyzeCodeContext, GatherFullCode, ListWorkspaceFiles};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::guardrails::Tripwire;
use crate::llm::{ToolDefinition, HANDOFF_TOOL_PREFIX};
use crate::runner::RunContext;

/// Whether a tool's output must pass the tool-end guardrail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ToolRisk {
    #[default]
    Low,
    /// Returns raw material (such as full source text) that is moderated
    /// before it enters the conversation.
    High,
}

/// Per-call context handed to a tool.
#[derive(Debug, Clone, Copy)]
pub struct ToolContext<'a> {
    pub workspace_root: &'a Path,
    pub run: &'a RunContext,
}

/// Structured tool result with non-fatal warnings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    pub result: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ToolOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    /// Text placed into the `tool` message.
    pub fn to_content(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.result.to_string())
    }
}

/// Failure of a single tool invocation.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The arguments were unusable. Reported back to the model.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A guardrail inside the tool (for example a nested agent run) blocked.
    #[error("{0}")]
    Blocked(Tripwire),

    /// Anything else. Ends the run.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// A rejected tool call. Recovered by telling the model what went wrong.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolInputError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),

    #[error("invalid arguments for `{tool}`: {message}")]
    InvalidArguments { tool: String, message: String },
}

impl ToolInputError {
    /// Text placed into the `tool` message.
    pub fn to_content(&self) -> String {
        json!({ "error": self.to_string() }).to_string()
    }
}

/// Errors building a registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolRegistryError {
    #[error("tool `{0}` registered twice")]
    Duplicate(String),

    #[error("tool `{tool}` has an invalid input schema: {message}")]
    InvalidSchema { tool: String, message: String },

    #[error("unknown tool `{0}`")]
    Unknown(String),

    /// Names starting with `transfer_to_` are kept for handoffs.
    #[error("tool name `{0}` uses the reserved handoff prefix")]
    ReservedName(String),
}

/// A callable exposed to agents.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    fn risk(&self) -> ToolRisk {
        ToolRisk::Low
    }

    async fn execute(&self, args: Value, ctx: ToolContext<'_>) -> Result<ToolOutput, ToolError>;
}

impl fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name())
            .field("risk", &self.risk())
            .finish()
    }
}

#[derive(Clone)]
struct RegisteredTool {
    tool: Arc<dyn Tool>,
    validator: Arc<jsonschema::Validator>,
}

/// Immutable set of tools, shared across runs.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<BTreeMap<String, RegisteredTool>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}

impl ToolRegistry {
    /// Build a registry, compiling every tool's schema.
    pub fn new<I>(tools: I) -> Result<Self, ToolRegistryError>
    where
        I: IntoIterator<Item = Arc<dyn Tool>>,
    {
        let mut map = BTreeMap::new();
        for tool in tools {
            let name = tool.name().to_string();
            if name.starts_with(HANDOFF_TOOL_PREFIX) {
                return Err(ToolRegistryError::ReservedName(name));
            }
            if map.contains_key(&name) {
                return Err(ToolRegistryError::Duplicate(name));
            }
            let validator = jsonschema::validator_for(&tool.parameters_schema()).map_err(|e| {
                ToolRegistryError::InvalidSchema {
                    tool: name.clone(),
                    message: e.to_string(),
                }
            })?;
            map.insert(
                name,
                RegisteredTool {
                    tool,
                    validator: Arc::new(validator),
                },
            );
        }
        Ok(Self { tools: Arc::new(map) })
    }

    /// The built-in read-only code tools.
    pub fn code_tools() -> Result<Self, ToolRegistryError> {
        Self::new([
            Arc::new(GatherFullCode) as Arc<dyn Tool>,
            Arc::new(AnalyzeCodeContext::default()),
            Arc::new(ListWorkspaceFiles::default()),
        ])
    }

    /// A new registry holding only the named tools.
    pub fn subset(&self, names: &[&str]) -> Result<Self, ToolRegistryError> {
        let mut map = BTreeMap::new();
        for name in names {
            let entry = self
                .tools
                .get(*name)
                .ok_or_else(|| ToolRegistryError::Unknown(name.to_string()))?;
            map.insert(name.to_string(), entry.clone());
        }
        Ok(Self { tools: Arc::new(map) })
    }

    /// A new registry with `tool` added. The name must not be taken yet.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<Self, ToolRegistryError> {
        if self.tools.contains_key(tool.name()) {
            return Err(ToolRegistryError::Duplicate(tool.name().to_string()));
        }
        let added = Self::new([tool])?;
        Ok(self.merged(&added))
    }

    /// A new registry with `other`'s tools added. Names in `other` win.
    pub fn merged(&self, other: &ToolRegistry) -> Self {
        let mut map = (*self.tools).clone();
        for (name, entry) in other.tools.iter() {
            map.insert(name.clone(), entry.clone());
        }
        Self { tools: Arc::new(map) }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name).map(|entry| &entry.tool)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions offered to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|entry| {
                ToolDefinition::function(
                    entry.tool.name(),
                    entry.tool.description(),
                    entry.tool.parameters_schema(),
                )
            })
            .collect()
    }

    /// Look up a tool and check `args` against its schema.
    pub fn validate(&self, name: &str, args: &Value) -> Result<&Arc<dyn Tool>, ToolInputError> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| ToolInputError::UnknownTool(name.to_string()))?;

        let errors: Vec<String> = entry
            .validator
            .iter_errors(args)
            .map(|e| e.to_string())
            .collect();
        if !errors.is_empty() {
            return Err(ToolInputError::InvalidArguments {
                tool: name.to_string(),
                message: errors.join("; "),
            });
        }
        Ok(&entry.tool)
    }
}

/// Resolve `path` inside `root` lexically. Absolute paths must already lie
/// under the root, and `..` may not climb above it. Symlinks are not followed
/// here; see [`ensure_in_workspace`].
pub(crate) fn resolve_in_workspace(root: &Path, path: &str) -> Result<PathBuf, String> {
    let candidate = Path::new(path);
    let relative = if candidate.is_absolute() {
        candidate
            .strip_prefix(root)
            .map_err(|_| format!("{} is outside the workspace", path))?
    } else {
        candidate
    };

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(format!("{} is outside the workspace", path));
                }
                resolved.pop();
                depth -= 1;
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("{} is outside the workspace", path));
            }
        }
    }
    Ok(resolved)
}

/// Check that a canonicalized path still lies under the canonicalized root,
/// which catches symlinks pointing out of the workspace.
pub(crate) fn ensure_in_workspace(canonical_root: &Path, real_path: &Path, display: &str) -> Result<(), String> {
    if real_path.starts_with(canonical_root) {
        Ok(())
    } else {
        Err(format!("{} is outside the workspace", display))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the text back"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }

        async fn execute(&self, args: Value, _ctx: ToolContext<'_>) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::new(args["text"].clone()))
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new([Arc::new(Echo) as Arc<dyn Tool>]).unwrap()
    }

    #[test]
    fn test_validate_accepts_matching_arguments() {
        let registry = registry();
        let tool = registry.validate("echo", &json!({ "text": "hi" })).unwrap();
        assert_eq!(tool.name(), "echo");
    }

    #[test]
    fn test_validate_rejects_malformed_arguments() {
        let registry = registry();
        let err = registry.validate("echo", &json!({ "text": 3 })).unwrap_err();
        assert!(matches!(err, ToolInputError::InvalidArguments { ref tool, .. } if tool == "echo"));

        let err = registry.validate("echo", &json!("not an object")).unwrap_err();
        assert!(matches!(err, ToolInputError::InvalidArguments { .. }));
    }

    #[test]
    fn test_validate_unknown_tool() {
        let err = registry().validate("rm_rf", &json!({})).unwrap_err();
        assert_eq!(err, ToolInputError::UnknownTool("rm_rf".to_string()));
        assert!(err.to_content().contains("unknown tool"));
    }

    #[test]
    fn test_tool_debug_shows_name_and_risk() {
        let registry = ToolRegistry::code_tools().unwrap();
        let tool = registry.validate("gather_full_code", &json!({ "changed_files": [] })).unwrap();
        assert_eq!(format!("{:?}", tool), r#"Tool { name: "gather_full_code", risk: High }"#);
    }

    struct Transfer;

    #[async_trait]
    impl Tool for Transfer {
        fn name(&self) -> &str {
            "transfer_to_archive"
        }

        fn description(&self) -> &str {
            "Move a finding to the archive"
        }

        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }

        async fn execute(&self, _args: Value, _ctx: ToolContext<'_>) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::new(Value::Null))
        }
    }

    #[test]
    fn test_handoff_prefix_is_reserved() {
        let expected = ToolRegistryError::ReservedName("transfer_to_archive".to_string());
        assert_eq!(
            ToolRegistry::new([Arc::new(Transfer) as Arc<dyn Tool>]).unwrap_err(),
            expected
        );
        assert_eq!(registry().register(Arc::new(Transfer)).unwrap_err(), expected);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let result = ToolRegistry::new([Arc::new(Echo) as Arc<dyn Tool>, Arc::new(Echo)]);
        assert_eq!(result.unwrap_err(), ToolRegistryError::Duplicate("echo".to_string()));
    }

    #[test]
    fn test_subset_and_merge_leave_original_untouched() {
        let all = ToolRegistry::code_tools().unwrap();
        let only_gather = all.subset(&["gather_full_code"]).unwrap();
        assert_eq!(only_gather.len(), 1);
        assert_eq!(all.len(), 3);

        let merged = only_gather.merged(&registry());
        assert_eq!(merged.names().collect::<Vec<_>>(), vec!["echo", "gather_full_code"]);
        assert_eq!(only_gather.len(), 1);

        assert_eq!(
            all.subset(&["nope"]).unwrap_err(),
            ToolRegistryError::Unknown("nope".to_string())
        );
    }

    #[test]
    fn test_register_returns_new_registry() {
        let empty = ToolRegistry::default();
        let one = empty.register(Arc::new(Echo)).unwrap();
        assert!(empty.is_empty());
        assert_eq!(one.definitions()[0].function.name, "echo");
        assert_eq!(
            one.register(Arc::new(Echo)).unwrap_err(),
            ToolRegistryError::Duplicate("echo".to_string())
        );
    }

    #[test]
    fn test_tool_output_content() {
        let output = ToolOutput::new(json!({ "a.py": "1: x" }));
        assert_eq!(output.to_content(), r#"{"result":{"a.py":"1: x"}}"#);

        let output = output.with_warnings(vec!["missing.py: not found".to_string()]);
        assert!(output.to_content().contains("missing.py: not found"));
    }

    #[test]
    fn test_resolve_in_workspace() {
        let root = Path::new("/work/repo");
        assert_eq!(
            resolve_in_workspace(root, "src/app.py").unwrap(),
            PathBuf::from("/work/repo/src/app.py")
        );
        assert_eq!(
            resolve_in_workspace(root, "src/../README.md").unwrap(),
            PathBuf::from("/work/repo/README.md")
        );
        assert_eq!(
            resolve_in_workspace(root, "/work/repo/a.py").unwrap(),
            PathBuf::from("/work/repo/a.py")
        );
        assert!(resolve_in_workspace(root, "../secrets.env").is_err());
        assert!(resolve_in_workspace(root, "/etc/passwd").is_err());
    }

    #[test]
    fn test_ensure_in_workspace() {
        let root = Path::new("/work/repo");
        assert!(ensure_in_workspace(root, Path::new("/work/repo/src/app.py"), "src/app.py").is_ok());
        assert_eq!(
            ensure_in_workspace(root, Path::new("/work/repository/x.py"), "link.py").unwrap_err(),
            "link.py is outside the workspace"
        );
    }
}
