//! # pagepilot
//!
//! Drive a headless browser from natural-language instructions. A language
//! model picks the next browser action, the action runs against the live page,
//! and the page comes back as a small, addressable HTML snapshot.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pagepilot::{llm::OpenAiPlanner, TaskConfig, Runner};
//!
//! # #[tokio::main]
//! # async fn main() -> pagepilot::Result<()> {
//! let config = TaskConfig::load("task.yaml")?;
//! let runner = Runner::new(&config.browser).await?;
//! let planner = OpenAiPlanner::from_config(&config.model, pagepilot::actions::tool_definitions())?;
//! let output = runner.run_to_completion(&config, &planner).await?;
//! println!("{}", output.output().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod actions;
pub mod agent;
mod config;
pub mod dom;
pub mod llm;
mod runner;
pub mod store;
pub mod tokens;

pub use config::{
    effective_instructions, AgentSettings, BrowserConfig, ModelConfig, ObservationConfig,
    ParamDef, Params, ParsingErrorsSetting, StorageConfig, TaskConfig, Viewport,
};
pub use runner::Runner;

/// Attribute stamped on every element so the model can address it.
pub const UNIQUE_ID_ATTRIBUTE: &str = "gid";

/// Result type for pagepilot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running an agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("browser error: {0}")]
    Browser(#[from] eoka::Error),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("could not parse model output: {message}")]
    Parse {
        message: String,
        output: Option<String>,
    },

    #[error("invalid input for tool {tool}: {message}")]
    ToolInput { tool: String, message: String },

    #[error("model error: {0}")]
    Model(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

impl Error {
    /// The model answered with something that is neither an action nor a final answer.
    pub fn is_parse_failure(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }

    /// The action was reachable but its input was unusable (bad arguments, missing target).
    pub fn is_tool_input(&self) -> bool {
        matches!(self, Self::ToolInput { .. } | Self::ElementNotFound(_))
    }
}
