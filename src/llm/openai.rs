use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::pricing::{pricing_for, ModelPricing, Usage};
use super::DEFAULT_SYSTEM_PROMPT;
use crate::agent::{
    ActionCall, AgentStep, Decision, EarlyStopping, Finish, Planner, ToolDefinition,
    EXCEPTION_TOOL, STOPPED_RESPONSE,
};
use crate::{Error, ModelConfig, Result};

/// Appended as the last turn when the model must answer without tools.
const FINAL_ANSWER_PROMPT: &str = "I now need to return a final answer based on the previous steps:";

const MAX_ERROR_BODY: usize = 512;
const RATE_LIMIT_BACKOFF_SECS: u64 = 5;

/// Planner backed by an OpenAI-compatible chat completions endpoint with
/// function calling.
pub struct OpenAiPlanner {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_retries: u32,
    system_prompt: String,
    tools: Vec<ToolDefinition>,
    pricing: Option<ModelPricing>,
    usage: Mutex<Usage>,
}

impl std::fmt::Debug for OpenAiPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiPlanner")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("tools", &self.tools.len())
            .finish_non_exhaustive()
    }
}

impl OpenAiPlanner {
    /// Build a planner, reading the API key from `config.api_key_env`.
    pub fn from_config(config: &ModelConfig, tools: Vec<ToolDefinition>) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
        if api_key.trim().is_empty() {
            return Err(Error::Config(format!(
                "environment variable {} is not set",
                config.api_key_env
            )));
        }
        Self::with_api_key(config, api_key, tools)
    }

    pub fn with_api_key(
        config: &ModelConfig,
        api_key: impl Into<String>,
        tools: Vec<ToolDefinition>,
    ) -> Result<Self> {
        let pricing = pricing_for(&config.name);
        if pricing.is_none() {
            warn!(model = %config.name, "no pricing for model, costs will read as zero");
        }
        Ok(Self {
            client: Client::builder().build()?,
            api_key: api_key.into(),
            model: config.name.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            temperature: config.temperature,
            max_retries: config.max_retries,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            tools,
            pricing,
            usage: Mutex::new(Usage::default()),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Token and cost totals so far.
    pub fn usage(&self) -> Usage {
        *self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Conversation for one planning call: system prompt, the instructions,
    /// then every step replayed as a tool call and its result.
    fn messages(&self, instructions: &str, steps: &[AgentStep]) -> Vec<ChatMessage> {
        let mut messages = vec![
            ChatMessage::text("system", &self.system_prompt),
            ChatMessage::text("user", instructions),
        ];
        for (i, step) in steps.iter().enumerate() {
            if step.action.tool == EXCEPTION_TOOL {
                // No real call was made, so there is nothing to pair a tool message with.
                messages.push(ChatMessage::text("assistant", &step.action.log));
                messages.push(ChatMessage::text("user", &step.observation));
                continue;
            }
            let id = step
                .action
                .call_id
                .clone()
                .unwrap_or_else(|| format!("call_{}", i));
            messages.push(ChatMessage {
                role: "assistant".into(),
                content: None,
                tool_call_id: None,
                tool_calls: Some(vec![MessageToolCall {
                    id: id.clone(),
                    r#type: "function".into(),
                    function: MessageFunction {
                        name: step.action.tool.clone(),
                        arguments: step.action.input.to_string(),
                    },
                }]),
            });
            messages.push(ChatMessage {
                role: "tool".into(),
                content: Some(step.observation.clone()),
                tool_call_id: Some(id),
                tool_calls: None,
            });
        }
        messages
    }

    fn request<'a>(&'a self, messages: Vec<ChatMessage>, with_tools: bool) -> ChatRequest<'a> {
        let tools = with_tools.then(|| {
            self.tools
                .iter()
                .map(|t| ToolSpec {
                    r#type: "function",
                    function: t,
                })
                .collect()
        });
        ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages,
            tools,
        }
    }

    async fn complete(&self, body: &ChatRequest<'_>) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut attempt = 0;
        loop {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                let data: ChatResponse = response.json().await?;
                self.record_usage(data.usage.as_ref());
                return Ok(data);
            }

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.max_retries {
                let delay = Duration::from_secs(RATE_LIMIT_BACKOFF_SECS * u64::from(attempt + 1));
                warn!(
                    attempt = attempt + 1,
                    delay_secs = delay.as_secs(),
                    "rate limited, retrying model call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut end = MAX_ERROR_BODY;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
                body.push_str("... [truncated]");
            }
            return Err(Error::Model(format!("{}: {}", status, body)));
        }
    }

    fn record_usage(&self, reported: Option<&ResponseUsage>) {
        let Some(reported) = reported else {
            return;
        };
        let mut usage = self.usage.lock().unwrap_or_else(|e| e.into_inner());
        let call_cost = usage.record(
            self.pricing,
            reported.prompt_tokens,
            reported.completion_tokens,
        );
        info!(
            model = %self.model,
            call_cost_usd = call_cost,
            total_cost_usd = usage.cost_usd,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "LLM processed call"
        );
    }
}

#[async_trait(?Send)]
impl Planner for OpenAiPlanner {
    async fn plan(&self, instructions: &str, steps: &[AgentStep]) -> Result<Decision> {
        let body = self.request(self.messages(instructions, steps), true);
        let response = self.complete(&body).await?;
        parse_response(&response)
    }

    async fn stopped_response(
        &self,
        method: EarlyStopping,
        instructions: &str,
        steps: &[AgentStep],
    ) -> Result<Finish> {
        match method {
            EarlyStopping::Force => Ok(Finish::new(STOPPED_RESPONSE)),
            EarlyStopping::Generate => {
                let mut messages = self.messages(instructions, steps);
                messages.push(ChatMessage::text("user", FINAL_ANSWER_PROMPT));
                let response = self.complete(&self.request(messages, false)).await?;
                Ok(final_answer(&response))
            }
        }
    }
}

/// The answer to a forced final request. Anything but text falls back to
/// [`STOPPED_RESPONSE`] so the run still ends with a result.
fn final_answer(response: &ChatResponse) -> Finish {
    match parse_response(response) {
        Ok(Decision::Finish(finish)) => finish,
        Ok(Decision::Act(actions)) => {
            warn!(calls = actions.len(), "model called tools instead of answering");
            Finish::new(STOPPED_RESPONSE)
        }
        Err(e) => {
            warn!("unusable final answer: {}", e);
            Finish::new(STOPPED_RESPONSE)
        }
    }
}

/// Turn a chat completion into the next decision. Tool calls win over text.
pub(crate) fn parse_response(response: &ChatResponse) -> Result<Decision> {
    let message = response
        .choices
        .first()
        .map(|choice| &choice.message)
        .ok_or_else(|| Error::Parse {
            message: "response has no choices".into(),
            output: None,
        })?;
    let content = message.content.clone().unwrap_or_default();

    let calls = message.tool_calls.as_deref().unwrap_or_default();
    if !calls.is_empty() {
        let mut actions = Vec::with_capacity(calls.len());
        for call in calls {
            let arguments = if call.function.arguments.trim().is_empty() {
                "{}"
            } else {
                call.function.arguments.as_str()
            };
            let input: Value = serde_json::from_str(arguments).map_err(|e| Error::Parse {
                message: format!(
                    "arguments for {} are not valid JSON: {}",
                    call.function.name, e
                ),
                output: Some(call.function.arguments.clone()),
            })?;
            let log = if content.is_empty() {
                format!("Invoking: `{}` with `{}`", call.function.name, arguments)
            } else {
                content.clone()
            };
            actions.push(
                ActionCall::new(call.function.name.clone(), input)
                    .with_call_id(call.id.clone())
                    .with_log(log),
            );
        }
        return Ok(Decision::Act(actions));
    }

    if content.trim().is_empty() {
        return Err(Error::Parse {
            message: "response has neither tool calls nor text".into(),
            output: None,
        });
    }
    let mut finish = Finish::new(content.clone());
    finish.log = content;
    Ok(Decision::Finish(finish))
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ToolSpec<'a>>>,
}

#[derive(Serialize)]
struct ToolSpec<'a> {
    r#type: &'static str,
    function: &'a ToolDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ChatMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<MessageToolCall>>,
}

impl ChatMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct MessageToolCall {
    id: String,
    r#type: String,
    function: MessageFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct MessageFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<ResponseUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ResponseUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(value: Value) -> ChatResponse {
        serde_json::from_value(value).unwrap()
    }

    fn planner() -> OpenAiPlanner {
        let tools = crate::actions::tool_definitions();
        OpenAiPlanner::with_api_key(&ModelConfig::default(), "sk-test", tools).unwrap()
    }

    #[test]
    fn test_parse_tool_call() {
        let decision = parse_response(&response(json!({
            "choices": [{"message": {"content": null, "tool_calls": [{
                "id": "call_abc",
                "type": "function",
                "function": {"name": "go_to_url", "arguments": "{\"url\":\"https://example.com\"}"}
            }]}}]
        })))
        .unwrap();

        let Decision::Act(actions) = decision else {
            panic!("expected an action");
        };
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].tool, "go_to_url");
        assert_eq!(actions[0].input["url"], "https://example.com");
        assert_eq!(actions[0].call_id.as_deref(), Some("call_abc"));
        assert!(actions[0].log.contains("go_to_url"));
    }

    #[test]
    fn test_parse_text_is_final_answer() {
        let decision = parse_response(&response(json!({
            "choices": [{"message": {"content": "The title is Rust"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        })))
        .unwrap();
        match decision {
            Decision::Finish(finish) => assert_eq!(finish.output(), Some("The title is Rust")),
            other => panic!("expected finish, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_failures() {
        let bad_args = parse_response(&response(json!({
            "choices": [{"message": {"tool_calls": [{
                "id": "call_1",
                "function": {"name": "click_element", "arguments": "{gid: 3"}
            }]}}]
        })))
        .unwrap_err();
        assert!(bad_args.is_parse_failure());
        match bad_args {
            Error::Parse { output, .. } => assert_eq!(output.as_deref(), Some("{gid: 3")),
            other => panic!("unexpected {:?}", other),
        }

        let empty = parse_response(&response(json!({
            "choices": [{"message": {"content": "  "}}]
        })))
        .unwrap_err();
        assert!(empty.is_parse_failure());

        let none = parse_response(&response(json!({"choices": []}))).unwrap_err();
        assert!(none.is_parse_failure());
    }

    #[test]
    fn test_final_answer_falls_back_to_stopped() {
        let text = final_answer(&response(json!({
            "choices": [{"message": {"content": "Best guess: Rust"}}]
        })));
        assert_eq!(text.output(), Some("Best guess: Rust"));

        let empty = final_answer(&response(json!({
            "choices": [{"message": {"content": ""}}]
        })));
        assert_eq!(empty.output(), Some(STOPPED_RESPONSE));

        let bad_args = final_answer(&response(json!({
            "choices": [{"message": {"tool_calls": [{
                "id": "call_1",
                "function": {"name": "go_to_url", "arguments": "{url:"}
            }]}}]
        })));
        assert_eq!(bad_args.output(), Some(STOPPED_RESPONSE));

        let tool_call = final_answer(&response(json!({
            "choices": [{"message": {"tool_calls": [{
                "id": "call_2",
                "function": {"name": "go_to_url", "arguments": "{\"url\":\"https://example.com\"}"}
            }]}}]
        })));
        assert_eq!(tool_call.output(), Some(STOPPED_RESPONSE));

        let no_choices = final_answer(&response(json!({"choices": []})));
        assert_eq!(no_choices.output(), Some(STOPPED_RESPONSE));
    }

    #[test]
    fn test_empty_arguments_are_an_empty_object() {
        let decision = parse_response(&response(json!({
            "choices": [{"message": {"tool_calls": [{
                "id": "call_1",
                "function": {"name": "capture_and_save_screenshot", "arguments": ""}
            }]}}]
        })))
        .unwrap();
        let Decision::Act(actions) = decision else {
            panic!("expected an action");
        };
        assert_eq!(actions[0].input, json!({}));
    }

    #[test]
    fn test_messages_replay_steps() {
        let planner = planner();
        let steps = vec![
            AgentStep {
                action: ActionCall::new("go_to_url", json!({"url": "https://example.com"}))
                    .with_call_id("call_x"),
                observation: "Previous action was: go_to_url, Current page content: <p/>".into(),
            },
            AgentStep {
                action: ActionCall::new(EXCEPTION_TOOL, json!("Invalid or incomplete response"))
                    .with_log("not json"),
                observation: "Invalid or incomplete response".into(),
            },
            AgentStep {
                action: ActionCall::new("click_element", json!({"gid": 4})),
                observation: "clicked".into(),
            },
        ];
        let messages = planner.messages("Open url https://example.com", &steps);
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(
            roles,
            ["system", "user", "assistant", "tool", "assistant", "user", "assistant", "tool"]
        );
        assert_eq!(messages[0].content.as_deref(), Some(DEFAULT_SYSTEM_PROMPT));

        let call = &messages[2].tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id, "call_x");
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("call_x"));

        // Calls without an id get one derived from their position.
        let call = &messages[6].tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id, "call_2");
        assert_eq!(call.function.arguments, "{\"gid\":4}");
        assert_eq!(messages[7].tool_call_id.as_deref(), Some("call_2"));
    }

    #[test]
    fn test_request_body_lists_tools() {
        let planner = planner();
        let body = serde_json::to_value(planner.request(planner.messages("do it", &[]), true))
            .unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["tools"].as_array().unwrap().len(), 7);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "go_to_url");
        assert!(body["tools"][0]["function"]["parameters"].is_object());

        let body = serde_json::to_value(planner.request(vec![], false)).unwrap();
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = ModelConfig {
            api_key_env: "PAGEPILOT_TEST_UNSET_KEY".into(),
            ..ModelConfig::default()
        };
        let err = OpenAiPlanner::from_config(&config, vec![]).unwrap_err();
        assert!(err.to_string().contains("PAGEPILOT_TEST_UNSET_KEY"));
    }
}
