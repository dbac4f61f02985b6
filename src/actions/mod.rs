//! The browser actions the model can call.
//!
//! The set is closed: every action is an [`ActionKind`] with a typed parameter
//! struct. Arguments from the model are deserialized into that struct and
//! validated before anything touches the page.

mod executor;
mod observation;

pub use executor::{ActionContext, BrowserToolbox};
pub use observation::{PageObserver, CURRENT_PAGE_PREFIX, PREVIOUS_PAGE_OMITTED};

use std::collections::HashMap;

use schemars::generate::SchemaSettings;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::ToolDefinition;
use crate::{Error, Result};

/// Every action the model can call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    GoToUrl,
    ClickElement,
    FillFormAndSubmit,
    ExtractData,
    SaveObjectToOutput,
    SaveObjectsToDataset,
    CaptureAndSaveScreenshot,
}

impl ActionKind {
    pub const ALL: [ActionKind; 7] = [
        Self::GoToUrl,
        Self::ClickElement,
        Self::FillFormAndSubmit,
        Self::ExtractData,
        Self::SaveObjectToOutput,
        Self::SaveObjectsToDataset,
        Self::CaptureAndSaveScreenshot,
    ];

    /// Name the model calls the action by.
    pub fn name(self) -> &'static str {
        match self {
            Self::GoToUrl => "go_to_url",
            Self::ClickElement => "click_element",
            Self::FillFormAndSubmit => "fill_form_and_submit",
            Self::ExtractData => "extract_data",
            Self::SaveObjectToOutput => "save_object_to_output",
            Self::SaveObjectsToDataset => "save_objects_to_dataset",
            Self::CaptureAndSaveScreenshot => "capture_and_save_screenshot",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::GoToUrl => "Goes to a specific URL and gets the content",
            Self::ClickElement => {
                "Clicks on a element with the given gid on the page. Note that gid is required and \
                 you must use the corresponding gid attribute from the page content. \
                 Add the text of the link to confirm that you are clicking the right link."
            }
            Self::FillFormAndSubmit => "Types value to input fields and submit the form.",
            Self::ExtractData => "Extract data from HTML page content",
            Self::SaveObjectToOutput => "Saves the output in the key-value store",
            Self::SaveObjectsToDataset => "Saves one or multiple object to the dataset",
            Self::CaptureAndSaveScreenshot => "Captures and saves a screenshot of the current page",
        }
    }

    /// JSON schema of the action's arguments.
    pub fn parameters(self) -> Value {
        match self {
            Self::GoToUrl => schema_for::<GoToUrlParams>(),
            Self::ClickElement => schema_for::<ClickElementParams>(),
            Self::FillFormAndSubmit => schema_for::<FillFormParams>(),
            Self::ExtractData => schema_for::<ExtractDataParams>(),
            Self::SaveObjectToOutput => schema_for::<SaveOutputParams>(),
            Self::SaveObjectsToDataset => schema_for::<SaveToDatasetParams>(),
            Self::CaptureAndSaveScreenshot => schema_for::<CaptureScreenshotParams>(),
        }
    }

    /// Whether the action's observation ends the run.
    pub fn return_direct(self) -> bool {
        false
    }

    pub fn definition(self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }

    /// Deserialize and validate arguments for this action.
    pub fn parse(self, input: &Value) -> Result<Action> {
        let action = match self {
            Self::GoToUrl => Action::GoToUrl(self.args(input)?),
            Self::ClickElement => Action::ClickElement(self.args(input)?),
            Self::FillFormAndSubmit => Action::FillFormAndSubmit(self.args(input)?),
            Self::ExtractData => Action::ExtractData(self.args(input)?),
            Self::SaveObjectToOutput => Action::SaveObjectToOutput(self.args(input)?),
            Self::SaveObjectsToDataset => Action::SaveObjectsToDataset(self.args(input)?),
            Self::CaptureAndSaveScreenshot => Action::CaptureAndSaveScreenshot(self.args(input)?),
        };
        action.validate()?;
        Ok(action)
    }

    fn args<T: DeserializeOwned>(self, input: &Value) -> Result<T> {
        serde_json::from_value(input.clone()).map_err(|e| self.invalid(e.to_string()))
    }

    fn invalid(self, message: impl Into<String>) -> Error {
        Error::ToolInput {
            tool: self.name().to_string(),
            message: message.into(),
        }
    }
}

fn schema_for<T: JsonSchema>() -> Value {
    let schema = SchemaSettings::draft07()
        .with(|s| s.inline_subschemas = true)
        .into_generator()
        .into_root_schema_for::<T>();
    let mut value = serde_json::to_value(schema).unwrap_or_default();
    if let Some(object) = value.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    value
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GoToUrlParams {
    #[schemars(description = "The valid URL to go to (including protocol)")]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClickElementParams {
    #[schemars(description = "The tag name of the element to click")]
    #[serde(default)]
    pub tag_name: Option<String>,
    #[schemars(description = "The text on the element you want to click")]
    #[serde(default)]
    pub text: String,
    #[schemars(description = "The gid of the element to click (from the page content)")]
    #[serde(default)]
    pub gid: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FormField {
    #[schemars(description = "The gid HTML attribute from the content to fill")]
    pub gid: u64,
    #[schemars(description = "The value to fill to the input field")]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FillFormParams {
    #[schemars(description = "The list of form data to fill")]
    pub form_data: Vec<FormField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtractField {
    #[schemars(description = "The gid HTML attribute from the HTML, which contains the text to extract")]
    pub gid: u64,
    #[schemars(description = "The name of the key")]
    pub key_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtractDataParams {
    #[schemars(
        description = "The list of gid keys of the elements gid attributes to extract text from (from the page content)"
    )]
    pub attributes_to_extract: Vec<ExtractField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KeyValue {
    #[schemars(description = "Key of the object to save")]
    pub key: String,
    #[schemars(description = "The value of the object to save")]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SaveOutputParams {
    #[schemars(description = "The key value pair of object to save to output")]
    pub object: Vec<KeyValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SaveToDatasetParams {
    #[schemars(description = "The list of objects to save to dataset, each a list of key value pairs")]
    pub objects: Vec<Vec<KeyValue>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CaptureScreenshotParams {
    #[schemars(description = "The filename of the screenshot without extension")]
    #[serde(default)]
    pub filename: Option<String>,
    #[schemars(description = "Whether to save the HTML of the page")]
    #[serde(default)]
    pub save_html: Option<bool>,
}

/// A validated action ready to run.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    GoToUrl(GoToUrlParams),
    ClickElement(ClickElementParams),
    FillFormAndSubmit(FillFormParams),
    ExtractData(ExtractDataParams),
    SaveObjectToOutput(SaveOutputParams),
    SaveObjectsToDataset(SaveToDatasetParams),
    CaptureAndSaveScreenshot(CaptureScreenshotParams),
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::GoToUrl(_) => ActionKind::GoToUrl,
            Self::ClickElement(_) => ActionKind::ClickElement,
            Self::FillFormAndSubmit(_) => ActionKind::FillFormAndSubmit,
            Self::ExtractData(_) => ActionKind::ExtractData,
            Self::SaveObjectToOutput(_) => ActionKind::SaveObjectToOutput,
            Self::SaveObjectsToDataset(_) => ActionKind::SaveObjectsToDataset,
            Self::CaptureAndSaveScreenshot(_) => ActionKind::CaptureAndSaveScreenshot,
        }
    }

    fn validate(&self) -> Result<()> {
        let kind = self.kind();
        match self {
            Self::GoToUrl(p) => {
                url::Url::parse(&p.url)
                    .map_err(|e| kind.invalid(format!("invalid url '{}': {}", p.url, e)))?;
            }
            Self::ClickElement(p) => {
                if p.gid == 0 && p.text.trim().is_empty() {
                    return Err(kind.invalid("either gid or text must be provided"));
                }
                if let Some(ref tag) = p.tag_name {
                    if !tag.is_empty() && !tag.chars().all(|c| c.is_ascii_alphanumeric()) {
                        return Err(kind.invalid(format!("invalid tag name '{}'", tag)));
                    }
                }
            }
            Self::FillFormAndSubmit(p) => {
                if p.form_data.is_empty() {
                    return Err(kind.invalid("formData must not be empty"));
                }
                if p.form_data.iter().any(|f| f.gid == 0) {
                    return Err(kind.invalid("gid must be positive"));
                }
            }
            Self::ExtractData(p) => {
                if p.attributes_to_extract.is_empty() {
                    return Err(kind.invalid("attributesToExtract must not be empty"));
                }
                if p.attributes_to_extract.iter().any(|f| f.gid == 0) {
                    return Err(kind.invalid("gid must be positive"));
                }
            }
            Self::SaveObjectToOutput(_) | Self::SaveObjectsToDataset(_) => {}
            Self::CaptureAndSaveScreenshot(p) => {
                if let Some(ref name) = p.filename {
                    if name.contains('/') || name.contains('\\') || name.contains("..") {
                        return Err(kind.invalid(format!("invalid filename '{}'", name)));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Turn a list of key/value pairs into an object. Later keys win.
pub fn key_values_to_object(pairs: &[KeyValue]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|kv| (kv.key.clone(), Value::String(kv.value.clone())))
        .collect()
}

/// Name lookup over [`ActionKind`], ignoring case.
#[derive(Debug, Clone)]
pub struct ActionCatalog {
    by_name: HashMap<String, ActionKind>,
}

impl ActionCatalog {
    pub fn new() -> Self {
        let by_name = ActionKind::ALL
            .iter()
            .map(|kind| (kind.name().to_lowercase(), *kind))
            .collect();
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> Option<ActionKind> {
        self.by_name.get(&name.to_lowercase()).copied()
    }

    /// Definitions of every action, in catalog order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        ActionKind::ALL.iter().map(|kind| kind.definition()).collect()
    }
}

impl Default for ActionCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Definitions of every action, for handing to a model client.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    ActionCatalog::new().definitions()
}
