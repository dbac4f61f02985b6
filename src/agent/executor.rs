use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{
    ActionCall, AgentStep, Decision, EarlyStopping, Finish, ParsingErrorPolicy, Planner,
    StepRewrite, Toolbox, EXCEPTION_TOOL, INVALID_RESPONSE, INVALID_TOOL_INPUT, OUTPUT_KEY,
};
use crate::Result;

/// Default iteration ceiling.
pub const DEFAULT_MAX_ITERATIONS: usize = 15;

/// Why a run stopped without a final answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxIterations,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Finished,
    Stopped(StopReason),
}

/// Result of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub status: RunStatus,
    /// The answer, under [`OUTPUT_KEY`] unless the planner chose other keys.
    pub return_values: Map<String, Value>,
    /// Full history, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intermediate_steps: Option<Vec<AgentStep>>,
    /// Completed plan/act iterations.
    pub iterations: usize,
}

impl RunOutput {
    pub fn output(&self) -> Option<&str> {
        self.return_values.get(OUTPUT_KEY).and_then(Value::as_str)
    }
}

/// Runs the plan/act loop until the planner finishes, a return-direct tool
/// answers, or the iteration ceiling is reached.
pub struct AgentExecutor<'a> {
    planner: &'a dyn Planner,
    toolbox: &'a dyn Toolbox,
    max_iterations: usize,
    early_stopping: EarlyStopping,
    parsing_errors: ParsingErrorPolicy,
    return_intermediate_steps: bool,
    rewrite_previous_step: Option<StepRewrite>,
}

impl<'a> AgentExecutor<'a> {
    pub fn new(planner: &'a dyn Planner, toolbox: &'a dyn Toolbox) -> Self {
        Self {
            planner,
            toolbox,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            early_stopping: EarlyStopping::default(),
            parsing_errors: ParsingErrorPolicy::default(),
            return_intermediate_steps: false,
            rewrite_previous_step: None,
        }
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn early_stopping(mut self, method: EarlyStopping) -> Self {
        self.early_stopping = method;
        self
    }

    pub fn handle_parsing_errors(mut self, policy: ParsingErrorPolicy) -> Self {
        self.parsing_errors = policy;
        self
    }

    pub fn return_intermediate_steps(mut self, enabled: bool) -> Self {
        self.return_intermediate_steps = enabled;
        self
    }

    /// Rewrite the latest step each time new steps are about to be appended.
    pub fn rewrite_previous_step(mut self, rewrite: StepRewrite) -> Self {
        self.rewrite_previous_step = Some(rewrite);
        self
    }

    pub async fn run(&self, instructions: &str) -> Result<RunOutput> {
        let mut steps: Vec<AgentStep> = Vec::new();
        let mut iterations = 0;

        while iterations < self.max_iterations {
            let actions = match self.planner.plan(instructions, &steps).await {
                Ok(Decision::Finish(finish)) => {
                    info!(iterations, "agent finished");
                    return Ok(self.output(RunStatus::Finished, finish, steps, iterations));
                }
                Ok(Decision::Act(actions)) => actions,
                Err(e) if e.is_parse_failure() => {
                    warn!("unparseable model output: {}", e);
                    let log = e.to_string();
                    let observation = self.parsing_errors.observation(e, INVALID_RESPONSE)?;
                    vec![ActionCall::new(EXCEPTION_TOOL, Value::String(observation)).with_log(log)]
                }
                Err(e) => return Err(e),
            };

            let mut new_steps = Vec::with_capacity(actions.len());
            for action in actions {
                let observation = self.take_action(&action).await?;
                new_steps.push(AgentStep {
                    action,
                    observation,
                });
            }

            if let Some(ref rewrite) = self.rewrite_previous_step {
                if let Some(previous) = steps.pop() {
                    steps.push(rewrite(previous));
                }
            }
            steps.extend(new_steps);

            if let Some(last) = steps.last() {
                let direct = self
                    .toolbox
                    .tool(&last.action.tool)
                    .is_some_and(|tool| tool.return_direct);
                if direct {
                    info!(tool = %last.action.tool, "return-direct tool answered");
                    let finish = Finish::new(last.observation.clone());
                    return Ok(self.output(RunStatus::Finished, finish, steps, iterations));
                }
            }

            iterations += 1;
        }

        info!(iterations, "iteration limit reached, stopping");
        let finish = self
            .planner
            .stopped_response(self.early_stopping, instructions, &steps)
            .await?;
        Ok(self.output(
            RunStatus::Stopped(StopReason::MaxIterations),
            finish,
            steps,
            iterations,
        ))
    }

    async fn take_action(&self, action: &ActionCall) -> Result<String> {
        if action.tool == EXCEPTION_TOOL {
            return Ok(match action.input {
                Value::String(ref text) => text.clone(),
                ref other => other.to_string(),
            });
        }
        if self.toolbox.tool(&action.tool).is_none() {
            debug!(tool = %action.tool, "model asked for an unknown tool");
            return Ok(format!(
                "{} is not a valid tool, try another one.",
                action.tool
            ));
        }
        match self.toolbox.invoke(&action.tool, &action.input).await {
            Ok(observation) => Ok(observation),
            Err(e) if e.is_tool_input() => {
                warn!(tool = %action.tool, "tool input rejected: {}", e);
                self.parsing_errors.observation(e, INVALID_TOOL_INPUT)
            }
            Err(e) => Err(e),
        }
    }

    fn output(
        &self,
        status: RunStatus,
        finish: Finish,
        steps: Vec<AgentStep>,
        iterations: usize,
    ) -> RunOutput {
        RunOutput {
            status,
            return_values: finish.return_values,
            intermediate_steps: self.return_intermediate_steps.then_some(steps),
            iterations,
        }
    }
}
