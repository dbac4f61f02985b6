mod params;
mod schema;

pub use params::{ParamDef, Params};
pub use schema::{
    effective_instructions, AgentSettings, BrowserConfig, ModelConfig, ObservationConfig,
    ParsingErrorsSetting, StorageConfig, TaskConfig, Viewport,
};
