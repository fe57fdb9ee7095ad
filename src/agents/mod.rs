//! The code-review agent graph.
//!
//! Agents are built leaves first so every handoff target exists before the
//! agent that lists it:
//!
//! ```text
//! File Parser -> Code Gatherer -> { Security, Health }
//! Context     -> { Security, Health }
//! ```
//!
//! The scan entry points additionally expose the specialists as tools, so the
//! entry agent can consult them without giving up control.

use std::sync::Arc;

use crate::agent::{AgentDefinition, AgentError};
use crate::runner::Runner;
use crate::tools::{AgentTool, Tool, ToolRegistry, ToolRegistryError};

pub const SECURITY_AGENT: &str = "Security Agent";
pub const HEALTH_AGENT: &str = "Health Agent";
pub const CONTEXT_AGENT: &str = "Context Agent";
pub const CODE_GATHERER_AGENT: &str = "Full Context Agent Code Gatherer";
pub const FILE_PARSER_AGENT: &str = "Full Context Agent File Parser";

const SECURITY_INSTRUCTIONS: &str = "{handoff_prefix}\
You are {agent_name}, a security reviewer. You receive files, code snippets and context about the \
codebase. Summarize the security issues you find, the files and lines affected, and give fix \
guidance with an example specific to the code.";

const HEALTH_INSTRUCTIONS: &str = "{handoff_prefix}\
You are {agent_name}, a code health reviewer. You receive files, code snippets and context about \
the codebase. Summarize maintainability and performance issues, the files and lines affected, and \
give fix guidance with an example.";

const CONTEXT_INSTRUCTIONS: &str = "{handoff_prefix}\
You are {agent_name}. You receive the files and lines changed in a pull request. Call \
analyze_code_context with the changed functions and file paths, then condense what the \
application does and what the changes do. Hand off to the security agent for security concerns \
and to the health agent for health concerns. If there are no issues, say the change is good to go.";

const CODE_GATHERER_INSTRUCTIONS: &str = "{handoff_prefix}\
You are {agent_name}. You receive a list of files. Fetch their code with gather_full_code, \
condense what the application and the files do, and keep the lines most relevant for review. \
Hand off to the security or health agent with that code. If there are no issues, say so.";

const FILE_PARSER_INSTRUCTIONS: &str = "{handoff_prefix}\
You are {agent_name}. You receive the list of files in an application. Keep only the files most \
relevant for security or health analysis and drop files too large for your context window, then \
hand the remaining files to the code gatherer.";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Tools(#[from] ToolRegistryError),
}

/// All review agents, wired together.
#[derive(Debug, Clone)]
pub struct ReviewAgents {
    pub security: AgentDefinition,
    pub health: AgentDefinition,
    pub context: AgentDefinition,
    pub code_gatherer: AgentDefinition,
    pub file_parser: AgentDefinition,
}

impl ReviewAgents {
    pub fn build() -> Result<Self, CatalogError> {
        let code_tools = ToolRegistry::code_tools()?;

        let security = AgentDefinition::builder(SECURITY_AGENT)
            .handoff_description("Specialist in evaluating code for security issues.")
            .instructions(SECURITY_INSTRUCTIONS)
            .build()?;

        let health = AgentDefinition::builder(HEALTH_AGENT)
            .handoff_description("Specialist in evaluating code for health issues.")
            .instructions(HEALTH_INSTRUCTIONS)
            .build()?;

        let context = AgentDefinition::builder(CONTEXT_AGENT)
            .handoff_description("Specialist in evaluating code for security and health issues.")
            .instructions(CONTEXT_INSTRUCTIONS)
            .tools(code_tools.subset(&["analyze_code_context"])?)
            .handoff(&security)
            .handoff(&health)
            .build()?;

        let code_gatherer = AgentDefinition::builder(CODE_GATHERER_AGENT)
            .handoff_description("Specialist in evaluating code for security and health issues.")
            .instructions(CODE_GATHERER_INSTRUCTIONS)
            .tools(code_tools.subset(&["gather_full_code"])?)
            .handoff(&security)
            .handoff(&health)
            .build()?;

        let file_parser = AgentDefinition::builder(FILE_PARSER_AGENT)
            .handoff_description("Specialist in evaluating code for security and health issues.")
            .instructions(FILE_PARSER_INSTRUCTIONS)
            .handoff(&code_gatherer)
            .build()?;

        Ok(Self {
            security,
            health,
            context,
            code_gatherer,
            file_parser,
        })
    }

    /// Entry agent for reviewing a set of changes: the context agent, with
    /// the specialists also callable as tools.
    pub fn partial_scan_entry(&self, runner: &Runner) -> Result<AgentDefinition, CatalogError> {
        let extra = ToolRegistry::new(self.specialist_tools(runner))?;
        Ok(self.context.with_tools(self.context.tools().merged(&extra)))
    }

    /// Entry agent for reviewing a whole workspace: the file parser, with the
    /// code gatherer, the specialists and `gather_full_code` as tools.
    pub fn full_scan_entry(&self, runner: &Runner) -> Result<AgentDefinition, CatalogError> {
        let mut tools = self.specialist_tools(runner);
        tools.push(Arc::new(AgentTool::new(
            self.code_gatherer.clone(),
            runner.clone(),
            "full_context_agent_code",
            "Specialist in evaluating code for security and health issues.",
        )));
        let extra = ToolRegistry::new(tools)?;
        let gather = ToolRegistry::code_tools()?.subset(&["gather_full_code"])?;
        Ok(self
            .file_parser
            .with_tools(self.file_parser.tools().merged(&gather).merged(&extra)))
    }

    fn specialist_tools(&self, runner: &Runner) -> Vec<Arc<dyn Tool>> {
        vec![
            Arc::new(AgentTool::new(
                self.security.clone(),
                runner.clone(),
                "security_agent",
                "Specialist in evaluating code for security issues.",
            )) as Arc<dyn Tool>,
            Arc::new(AgentTool::new(
                self.health.clone(),
                runner.clone(),
                "health_agent",
                "Specialist in evaluating code for health issues.",
            )),
        ]
    }
}
