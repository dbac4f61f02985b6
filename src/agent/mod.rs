//! The plan/act control loop and the seams it talks through.
//!
//! The loop owns the run state (iteration count and step history). It asks a
//! [`Planner`] what to do next and runs the chosen actions through a
//! [`Toolbox`]. Both are traits so tests can script them.

mod executor;

pub use executor::{AgentExecutor, RunOutput, RunStatus, StopReason, DEFAULT_MAX_ITERATIONS};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Name of the synthetic tool that echoes recovered error text back to the model.
pub const EXCEPTION_TOOL: &str = "_Exception";

/// Key of the final answer in [`Finish::return_values`].
pub const OUTPUT_KEY: &str = "output";

/// Observation used for unparseable model output under the standard policy.
pub const INVALID_RESPONSE: &str = "Invalid or incomplete response";

/// Observation used for unusable tool input under the standard policy.
pub const INVALID_TOOL_INPUT: &str = "Invalid or incomplete tool input. Please try again.";

/// Final answer when the iteration limit is hit with forced early stopping.
pub const STOPPED_RESPONSE: &str = "Agent stopped due to iteration limit or time limit.";

/// One tool invocation chosen by the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionCall {
    pub tool: String,
    pub input: Value,
    /// Free text the model produced alongside the call.
    pub log: String,
    /// Identifier the model client needs to pair the call with its result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl ActionCall {
    pub fn new(tool: impl Into<String>, input: Value) -> Self {
        Self {
            tool: tool.into(),
            input,
            log: String::new(),
            call_id: None,
        }
    }

    pub fn with_call_id(mut self, id: impl Into<String>) -> Self {
        self.call_id = Some(id.into());
        self
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = log.into();
        self
    }
}

/// The model's final answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finish {
    pub return_values: Map<String, Value>,
    pub log: String,
}

impl Finish {
    /// A finish carrying a single text answer under [`OUTPUT_KEY`].
    pub fn new(output: impl Into<String>) -> Self {
        let mut return_values = Map::new();
        return_values.insert(OUTPUT_KEY.to_string(), Value::String(output.into()));
        Self {
            return_values,
            log: String::new(),
        }
    }

    pub fn output(&self) -> Option<&str> {
        self.return_values.get(OUTPUT_KEY).and_then(Value::as_str)
    }
}

/// What the planner wants next.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Finish(Finish),
    Act(Vec<ActionCall>),
}

/// An action and the observation it produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStep {
    pub action: ActionCall,
    pub observation: String,
}

/// A tool as presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's arguments.
    pub parameters: Value,
}

/// What the loop needs to know about a resolved tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolInfo {
    /// Ends the run with this tool's observation as the answer.
    pub return_direct: bool,
}

/// What to do when the iteration limit is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EarlyStopping {
    /// Return [`STOPPED_RESPONSE`].
    #[default]
    Force,
    /// Ask the model for one last answer without tools.
    Generate,
}

/// Turns a recoverable error into observation text.
pub type ErrorHandler = Arc<dyn Fn(&Error) -> String + Send + Sync>;

/// How unparseable model output and unusable tool input are handled.
#[derive(Clone, Default)]
pub enum ParsingErrorPolicy {
    /// Propagate the error and end the run.
    #[default]
    Raise,
    /// Feed back [`INVALID_RESPONSE`] or [`INVALID_TOOL_INPUT`].
    Standard,
    /// Feed back a fixed text.
    Message(String),
    /// Feed back whatever the handler returns.
    Handler(ErrorHandler),
}

impl ParsingErrorPolicy {
    pub fn handler(f: impl Fn(&Error) -> String + Send + Sync + 'static) -> Self {
        Self::Handler(Arc::new(f))
    }

    /// Observation for a recoverable error, or the error itself under `Raise`.
    fn observation(&self, err: Error, standard: &str) -> Result<String> {
        match self {
            Self::Raise => Err(err),
            Self::Standard => Ok(standard.to_string()),
            Self::Message(text) => Ok(text.clone()),
            Self::Handler(f) => Ok(f(&err)),
        }
    }
}

impl fmt::Debug for ParsingErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raise => f.write_str("Raise"),
            Self::Standard => f.write_str("Standard"),
            Self::Message(text) => f.debug_tuple("Message").field(text).finish(),
            Self::Handler(_) => f.write_str("Handler(..)"),
        }
    }
}

/// Decides the next move from the instructions and the history so far.
#[async_trait(?Send)]
pub trait Planner {
    async fn plan(&self, instructions: &str, steps: &[AgentStep]) -> Result<Decision>;

    /// Final answer once the iteration limit is reached.
    async fn stopped_response(
        &self,
        method: EarlyStopping,
        _instructions: &str,
        _steps: &[AgentStep],
    ) -> Result<Finish> {
        match method {
            EarlyStopping::Force => Ok(Finish::new(STOPPED_RESPONSE)),
            EarlyStopping::Generate => Err(Error::Config(
                "early stopping method 'generate' is not supported by this planner".into(),
            )),
        }
    }
}

/// Resolves and runs tools by name.
#[async_trait(?Send)]
pub trait Toolbox {
    /// Look a tool up, ignoring case.
    fn tool(&self, name: &str) -> Option<ToolInfo>;

    /// Run a tool. Bad arguments and missing targets come back as errors for
    /// which [`Error::is_tool_input`] holds.
    async fn invoke(&self, name: &str, input: &Value) -> Result<String>;
}

/// Rewrites the most recent step before new steps are appended.
pub type StepRewrite = Box<dyn Fn(AgentStep) -> AgentStep + Send + Sync>;

/// Replace everything after `marker` in an observation with `placeholder`.
/// Observations without the marker are left alone.
pub fn redact_after_marker(marker: impl Into<String>, placeholder: impl Into<String>) -> StepRewrite {
    let marker = marker.into();
    let placeholder = placeholder.into();
    Box::new(move |mut step: AgentStep| {
        if let Some(at) = step.observation.find(&marker) {
            step.observation.truncate(at + marker.len());
            step.observation.push_str(&placeholder);
        }
        step
    })
}
