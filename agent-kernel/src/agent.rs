//! Agents and the step loop that drives them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use agent_adapters::{
    AdapterError, InferenceRequest, MessageRole, ModelAdapter, ModelResponse, PromptMessage,
};
use agent_config::AgentSettings;
use agent_memory::{
    ActionRecord, Callbacks, FinalAnswerRecord, MemoryLog, Message, PlanningRecord, RecordKind,
    Role, StepObserver, StepRecord, SystemPromptRecord, TaskRecord, Timing,
};
use agent_primitives::{
    Action, ActionMode, AgentId, CapabilityDescriptor, ErrorInfo, ErrorKind, ExecutionResult,
    TokenUsage, first_duplicate, validate_identifier,
};
use agent_prompts::{PromptSet, Vars};
use agent_sandbox::local::DEFAULT_AUTHORIZED_IMPORTS;
use agent_sandbox::{ExecutionState, Executor, LocalConfig, LocalExecutor};
use agent_tools::{FINAL_ANSWER, Tool, ToolRegistry, final_answer_descriptor};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::delegation::ManagedAgent;
use crate::dispatch::Dispatcher;
use crate::error::{AgentError, AgentResult};
use crate::lifecycle::{Lifecycle, LoopEvent, LoopState};
use crate::options::{RunOptions, RunOutput, RunResult, RunState};
use crate::parse::{parse_action, structured_output_schema};

const CODE_STOP_SEQUENCES: [&str; 2] = ["<end_code>", "Observation:"];
const PLAN_STOP_SEQUENCE: &str = "<end_plan>";

/// Check run against a candidate final answer before it is accepted. An
/// `Err` reason is fed back to the model and the run continues.
pub type FinalAnswerCheck = Arc<dyn Fn(&Value, &MemoryLog) -> Result<(), String> + Send + Sync>;

#[derive(Clone, Debug)]
struct LoopConfig {
    mode: ActionMode,
    max_steps: u32,
    planning_interval: Option<u32>,
    model_timeout: Duration,
    run_timeout: Option<Duration>,
    summarize_on_exhaustion: bool,
    structured_outputs: bool,
    instructions: Option<String>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            mode: ActionMode::Code,
            max_steps: 20,
            planning_interval: None,
            model_timeout: Duration::from_secs(120),
            run_timeout: None,
            summarize_on_exhaustion: true,
            structured_outputs: false,
            instructions: None,
        }
    }
}

/// How one loop iteration ended.
enum StepOutcome {
    Continue,
    FinalAnswer(Value),
    Exhausted,
    Failed(ErrorInfo),
}

enum ModelCallError {
    TimedOut(Duration),
    Adapter(AdapterError),
}

/// Builder for [`Agent`].
pub struct AgentBuilder {
    name: String,
    description: Option<String>,
    model: Arc<dyn ModelAdapter>,
    executor: Option<Box<dyn Executor>>,
    tools: Arc<ToolRegistry>,
    agents: Vec<Arc<ManagedAgent>>,
    prompts: PromptSet,
    config: LoopConfig,
    callbacks: Callbacks,
    final_answer_checks: Vec<FinalAnswerCheck>,
    tool_timeout: Option<Duration>,
    authorized_imports: Vec<String>,
}

impl fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("name", &self.name)
            .field("model", self.model.metadata())
            .field("tools", &self.tools)
            .field("agents", &self.agents)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AgentBuilder {
    fn new(name: impl Into<String>, model: Arc<dyn ModelAdapter>) -> Self {
        Self {
            name: name.into(),
            description: None,
            model,
            executor: None,
            tools: Arc::new(ToolRegistry::new()),
            agents: Vec::new(),
            prompts: PromptSet::default(),
            config: LoopConfig::default(),
            callbacks: Callbacks::new(),
            final_answer_checks: Vec::new(),
            tool_timeout: None,
            authorized_imports: DEFAULT_AUTHORIZED_IMPORTS
                .iter()
                .map(|module| (*module).to_owned())
                .collect(),
        }
    }

    /// Description shown to a manager when this agent is managed.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Action format expected from the model.
    #[must_use]
    pub fn mode(mut self, mode: ActionMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Default action step budget.
    #[must_use]
    pub fn max_steps(mut self, max_steps: u32) -> Self {
        self.config.max_steps = max_steps;
        self
    }

    /// Plans before step 1 and every `interval` steps after.
    #[must_use]
    pub fn planning_interval(mut self, interval: u32) -> Self {
        self.config.planning_interval = Some(interval);
        self
    }

    /// Limit for one model call.
    #[must_use]
    pub fn model_timeout(mut self, timeout: Duration) -> Self {
        self.config.model_timeout = timeout;
        self
    }

    /// Default wall-clock deadline for a run.
    #[must_use]
    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.config.run_timeout = Some(timeout);
        self
    }

    /// Limit for one direct capability invocation.
    #[must_use]
    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = Some(timeout);
        self
    }

    /// Whether an exhausted run asks the model for a best-effort answer.
    #[must_use]
    pub fn summarize_on_exhaustion(mut self, enabled: bool) -> Self {
        self.config.summarize_on_exhaustion = enabled;
        self
    }

    /// Requests `{thought, code}` JSON instead of fenced code in code mode.
    #[must_use]
    pub fn structured_outputs(mut self, enabled: bool) -> Self {
        self.config.structured_outputs = enabled;
        self
    }

    /// Extra instructions appended to the system prompt.
    #[must_use]
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.config.instructions = Some(instructions.into());
        self
    }

    /// Replaces the prompt templates.
    #[must_use]
    pub fn prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = prompts;
        self
    }

    /// Registers a tool.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Tool`] when the name is already registered.
    ///
    /// # Panics
    ///
    /// Panics if the tool registry lock is poisoned.
    pub fn tool<T>(self, descriptor: CapabilityDescriptor, tool: T) -> AgentResult<Self>
    where
        T: Tool + 'static,
    {
        self.tools.register_tool(descriptor, tool)?;
        Ok(self)
    }

    /// Uses an existing registry as the tool set, replacing registered tools.
    #[must_use]
    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    /// Adds a managed agent, callable under its name.
    #[must_use]
    pub fn managed_agent(mut self, agent: Arc<ManagedAgent>) -> Self {
        self.agents.push(agent);
        self
    }

    /// Uses `executor` for code actions.
    #[must_use]
    pub fn executor(mut self, executor: Box<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Uses an in-process executor with `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Sandbox`] when the configuration is unusable.
    pub fn local_executor(mut self, config: LocalConfig) -> AgentResult<Self> {
        self.authorized_imports = config.authorized_imports().cloned().collect();
        self.executor = Some(Box::new(LocalExecutor::new(config)?));
        Ok(self)
    }

    /// Applies loaded settings, including the agent name, and builds the
    /// executor they select.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] when the settings are invalid or the
    /// executor cannot be built.
    pub fn with_settings(mut self, settings: &AgentSettings) -> AgentResult<Self> {
        settings.validate()?;
        let agent = &settings.agent;
        self.name.clone_from(&agent.name);
        if let Some(description) = &agent.description {
            self.description = Some(description.clone());
        }
        self.config = LoopConfig {
            mode: agent.mode,
            max_steps: agent.max_steps,
            planning_interval: agent.planning_interval,
            model_timeout: agent.model_timeout(),
            run_timeout: agent.run_timeout(),
            summarize_on_exhaustion: agent.summarize_on_exhaustion,
            structured_outputs: agent.structured_outputs,
            instructions: agent.instructions.clone(),
        };
        self.authorized_imports
            .clone_from(&settings.executor.authorized_imports);
        self.executor = Some(settings.executor.build_executor()?);
        Ok(self)
    }

    /// Calls `callback` after every appended record of `kind`.
    #[must_use]
    pub fn on_step<F>(mut self, kind: RecordKind, callback: F) -> Self
    where
        F: Fn(&StepRecord, &MemoryLog) + Send + Sync + 'static,
    {
        self.callbacks.on(kind, callback);
        self
    }

    /// Notifies `observer` of every record and streamed delta.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.callbacks.observe(observer);
        self
    }

    /// Adds a check every final answer must pass.
    #[must_use]
    pub fn final_answer_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Value, &MemoryLog) -> Result<(), String> + Send + Sync + 'static,
    {
        self.final_answer_checks.push(Arc::new(check));
        self
    }

    /// Validates the configuration and creates the agent with its system
    /// prompt recorded.
    ///
    /// # Errors
    ///
    /// - [`AgentError::Configuration`] for an invalid name or limit;
    /// - [`AgentError::DuplicateCapability`] when names collide;
    /// - [`AgentError::DelegationCycle`] when a managed agent (transitively)
    ///   manages an agent with this agent's name;
    /// - [`AgentError::Template`] when the system prompt cannot be rendered.
    pub fn build(self) -> AgentResult<Agent> {
        validate_identifier(&self.name)
            .map_err(|err| AgentError::configuration(err.to_string()))?;
        if self.config.max_steps == 0 {
            return Err(AgentError::configuration("max_steps must be at least 1"));
        }
        if self.config.planning_interval == Some(0) {
            return Err(AgentError::configuration(
                "planning_interval must be at least 1",
            ));
        }

        let mut names = self.tools.names();
        names.extend(self.agents.iter().map(|agent| agent.name().to_owned()));
        names.push(FINAL_ANSWER.to_owned());
        if let Some(name) = first_duplicate(names.iter().map(String::as_str)) {
            return Err(AgentError::DuplicateCapability {
                name: name.to_owned(),
            });
        }

        for agent in &self.agents {
            if let Some(mut path) = agent.path_to(&self.name) {
                path.insert(0, self.name.clone());
                return Err(AgentError::DelegationCycle { path });
            }
        }

        let executor = match self.executor {
            Some(executor) => executor,
            None => Box::new(LocalExecutor::new(
                LocalConfig::default().with_authorized_imports(self.authorized_imports.clone()),
            )?),
        };

        let mut dispatcher = Dispatcher::new(self.tools);
        if let Some(timeout) = self.tool_timeout {
            dispatcher = dispatcher.with_call_timeout(timeout);
        }
        for agent in self.agents {
            dispatcher.add_agent(agent);
        }

        let prompt_vars = prompt_vars(&dispatcher, &self.authorized_imports, &self.config);
        let system_template = match self.config.mode {
            ActionMode::Code => &self.prompts.code_system,
            ActionMode::ToolCalling => &self.prompts.tool_calling_system,
        };
        let system_prompt = system_template.render(&prompt_vars)?;

        let mut agent = Agent {
            id: AgentId::random(),
            lifecycle: Lifecycle::new(self.name.clone()),
            name: self.name,
            description: self.description,
            model: self.model,
            executor,
            dispatcher,
            prompts: self.prompts,
            config: self.config,
            memory: MemoryLog::new(),
            state: ExecutionState::new(),
            callbacks: self.callbacks,
            final_answer_checks: self.final_answer_checks,
            system_prompt,
            prompt_vars,
            closed: false,
        };
        agent.record_system_prompt()?;
        debug!(agent = %agent.name, id = %agent.id, "agent built");
        Ok(agent)
    }
}

/// An agent: a model, a capability set, an executor and the memory log of
/// its runs.
///
/// Runs are strictly sequential; `run` takes `&mut self`.
pub struct Agent {
    id: AgentId,
    name: String,
    description: Option<String>,
    model: Arc<dyn ModelAdapter>,
    executor: Box<dyn Executor>,
    dispatcher: Dispatcher,
    prompts: PromptSet,
    config: LoopConfig,
    memory: MemoryLog,
    state: ExecutionState,
    callbacks: Callbacks,
    final_answer_checks: Vec<FinalAnswerCheck>,
    system_prompt: String,
    prompt_vars: Vars,
    lifecycle: Lifecycle,
    closed: bool,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("model", self.model.metadata())
            .field("executor", &self.executor.name())
            .field("dispatcher", &self.dispatcher)
            .field("config", &self.config)
            .field("records", &self.memory.len())
            .field("state", &self.lifecycle.state())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Starts building an agent named `name` backed by `model`.
    #[must_use]
    pub fn builder(name: impl Into<String>, model: Arc<dyn ModelAdapter>) -> AgentBuilder {
        AgentBuilder::new(name, model)
    }

    /// Unique id of this instance.
    #[must_use]
    pub const fn id(&self) -> AgentId {
        self.id
    }

    /// Agent name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description used when the agent is managed.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Action format expected from the model.
    #[must_use]
    pub const fn mode(&self) -> ActionMode {
        self.config.mode
    }

    /// Memory log of the agent's runs.
    #[must_use]
    pub fn memory(&self) -> &MemoryLog {
        &self.memory
    }

    /// Execution state carried across code actions of the current run.
    #[must_use]
    pub fn execution_state(&self) -> &ExecutionState {
        &self.state
    }

    /// Current state of the step loop.
    #[must_use]
    pub const fn loop_state(&self) -> LoopState {
        self.lifecycle.state()
    }

    /// Rendered system prompt.
    #[must_use]
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Prompt templates in use.
    #[must_use]
    pub fn prompts(&self) -> &PromptSet {
        &self.prompts
    }

    /// Capability set.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Managed agents, ordered by name.
    pub fn managed_agents(&self) -> impl Iterator<Item = &Arc<ManagedAgent>> {
        self.dispatcher.managed_agents()
    }

    /// Runs `task` with the agent's defaults and returns the final answer
    /// (`null` when an exhausted run produced none).
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::RunFailed`] when an unrecoverable error ended
    /// the run, or the error that prevented it from starting.
    pub async fn run(&mut self, task: &str) -> AgentResult<Value> {
        let output = self.run_with(task, RunOptions::new()).await?;
        Ok(output.answer().cloned().unwrap_or(Value::Null))
    }

    /// Runs `task` with per-run options.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::RunFailed`] for a failed run unless the full
    /// result was requested, [`AgentError::Memory`] when a run is already in
    /// progress, and [`AgentError::Configuration`] once the agent is closed.
    pub async fn run_with(&mut self, task: &str, options: RunOptions) -> AgentResult<RunOutput> {
        if self.closed {
            return Err(AgentError::configuration(format!(
                "agent `{}` is closed",
                self.name
            )));
        }
        if options.should_reset() {
            self.reset()?;
        }
        self.memory.begin_run()?;
        let outcome = self.drive(task, &options).await;
        let ended = self.memory.end_run();
        if outcome.is_err() && self.lifecycle.state().is_running() {
            let _ = self
                .lifecycle
                .transition(LoopEvent::Terminate(RunState::Failed));
        }
        let result = outcome?;
        ended?;

        if options.wants_full_result() {
            return Ok(RunOutput::Full(Box::new(result)));
        }
        if result.state == RunState::Failed {
            return Err(AgentError::RunFailed {
                error: result
                    .error
                    .unwrap_or_else(|| ErrorInfo::infrastructure("run failed")),
            });
        }
        Ok(RunOutput::Answer(result.output.unwrap_or(Value::Null)))
    }

    /// Clears memory and execution state, keeping the system prompt.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Memory`] during a run.
    pub fn reset(&mut self) -> AgentResult<()> {
        self.memory.reset()?;
        self.state.clear();
        self.lifecycle = Lifecycle::new(self.name.clone());
        self.record_system_prompt()
    }

    /// Releases the executor and those of managed agents. Further runs are
    /// rejected.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Sandbox`] when a backend fails to release its
    /// resources.
    pub async fn close(&mut self) -> AgentResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!(agent = %self.name, executor = self.executor.name(), "closing agent");
        self.executor.close().await?;
        for agent in self.dispatcher.managed_agents() {
            agent.close().await?;
        }
        Ok(())
    }

    fn record_system_prompt(&mut self) -> AgentResult<()> {
        let prompt = SystemPromptRecord::new(self.system_prompt.clone());
        self.record(prompt)
    }

    /// Appends a record and notifies callbacks before anything else happens.
    fn record(&mut self, record: impl Into<StepRecord>) -> AgentResult<()> {
        self.memory.append(record)?;
        if let Some(last) = self.memory.last() {
            self.callbacks.notify(last, &self.memory);
        }
        Ok(())
    }

    async fn drive(&mut self, task: &str, options: &RunOptions) -> AgentResult<RunResult> {
        let timing = Timing::start();
        let max_steps = options
            .max_steps_override()
            .unwrap_or(self.config.max_steps);
        if max_steps == 0 {
            return Err(AgentError::configuration("max_steps must be at least 1"));
        }
        let interval = options
            .planning_interval_override()
            .or(self.config.planning_interval)
            .filter(|interval| *interval > 0);
        let deadline = options
            .timeout_override()
            .or(self.config.run_timeout)
            .map(|limit| Instant::now() + limit);

        let mut task = task.to_owned();
        let extra = options.extra_args();
        if !extra.is_empty() {
            let rendered = serde_json::to_string_pretty(extra).unwrap_or_default();
            task.push_str(
                "\nYou have been provided with these additional arguments, \
                 that you can access directly as variables in your code:\n",
            );
            task.push_str(&rendered);
            for (name, value) in extra {
                self.state.set_variable(name.clone(), value.clone());
            }
        }

        let run_start = self.memory.len();
        self.record(TaskRecord::new(task.clone()))?;
        self.lifecycle.transition(LoopEvent::Begin)?;
        info!(agent = %self.name, max_steps, "run started");

        let mut step = 0;
        let outcome = loop {
            if deadline_passed(deadline) {
                break StepOutcome::Exhausted;
            }
            if step >= max_steps {
                break StepOutcome::Exhausted;
            }
            step += 1;

            if interval.is_some_and(|interval| (step - 1) % interval == 0) {
                self.lifecycle.transition(LoopEvent::Plan)?;
                match self.plan(&task, step, max_steps, deadline).await? {
                    StepOutcome::Continue => {}
                    other => break other,
                }
                self.lifecycle.transition(LoopEvent::Act)?;
            } else if self.lifecycle.state() == LoopState::Deciding {
                self.lifecycle.transition(LoopEvent::Act)?;
            }

            match self.step(step, deadline).await? {
                StepOutcome::Continue => {}
                other => break other,
            }
        };

        let (state, output, error) = match outcome {
            StepOutcome::FinalAnswer(answer) => (RunState::Succeeded, Some(answer), None),
            StepOutcome::Failed(error) => (RunState::Failed, None, Some(error)),
            StepOutcome::Exhausted | StepOutcome::Continue => {
                let answer = if deadline_passed(deadline) {
                    debug!(agent = %self.name, "run deadline passed, skipping the best-effort answer");
                    None
                } else if self.config.summarize_on_exhaustion {
                    self.best_effort_answer(&task, deadline).await?
                } else {
                    None
                };
                (RunState::Exhausted, answer, None)
            }
        };
        self.lifecycle.transition(LoopEvent::Terminate(state))?;
        let steps = self.memory.last_step();
        self.record(FinalAnswerRecord::new(output.clone()))?;

        let token_usage: TokenUsage = self.memory.records()[run_start..]
            .iter()
            .filter_map(StepRecord::token_usage)
            .sum();
        let timing = timing.finish();
        info!(
            agent = %self.name,
            agent_id = %self.id,
            state = %state,
            steps,
            input_tokens = token_usage.input_tokens,
            output_tokens = token_usage.output_tokens,
            duration_ms = u64::try_from(timing.duration().as_millis()).unwrap_or(u64::MAX),
            "run finished"
        );

        Ok(RunResult {
            output,
            state,
            records: self.memory.records().to_vec(),
            token_usage,
            timing,
            error,
        })
    }

    async fn step(&mut self, step: u32, deadline: Option<Instant>) -> AgentResult<StepOutcome> {
        let timing = Timing::start();
        let request = self.action_request()?;
        let limit = call_limit(self.config.model_timeout, deadline);
        let response =
            match call_model(self.model.as_ref(), &self.callbacks, request, limit).await {
                Ok(response) => response,
                Err(ModelCallError::TimedOut(limit)) => {
                    if deadline_passed(deadline) {
                        return Ok(StepOutcome::Exhausted);
                    }
                    let error =
                        ErrorInfo::timeout(format!("the model did not answer within {limit:?}"));
                    warn!(agent = %self.name, step, "model call timed out");
                    let result = ExecutionResult::failure(error, "");
                    self.record(ActionRecord::new(step, None, "", result).with_timing(timing.finish()))?;
                    return Ok(StepOutcome::Continue);
                }
                Err(ModelCallError::Adapter(err)) => {
                    let error = ErrorInfo::infrastructure(format!("model call failed: {err}"));
                    warn!(agent = %self.name, step, %err, "model call failed");
                    let result = ExecutionResult::failure(error.clone(), "");
                    self.record(ActionRecord::new(step, None, "", result).with_timing(timing.finish()))?;
                    return Ok(StepOutcome::Failed(error));
                }
            };

        let (action, mut result) =
            match parse_action(self.config.mode, self.config.structured_outputs, &response) {
                Ok(action) => {
                    let result = self.execute(&action, deadline).await;
                    (Some(action), result)
                }
                Err(error) => (None, ExecutionResult::failure(error, "")),
            };

        if result.is_final_answer() {
            if let Some(reason) = self.rejected_answer(result.output()) {
                let error = match action {
                    Some(Action::CodeBlock { .. }) => ErrorInfo::execution(reason),
                    _ => ErrorInfo::tool(reason),
                };
                debug!(agent = %self.name, step, "final answer rejected by check");
                result = result.with_error(error);
            }
        }

        if let Some(error) = result.error() {
            warn!(agent = %self.name, step, kind = %error.kind(), "action failed");
        }
        let failure = result
            .error()
            .filter(|error| !error.kind().is_recoverable())
            .cloned();
        let answer = result
            .is_final_answer()
            .then(|| result.output().clone());

        let record = ActionRecord::new(step, action, response.content, result)
            .with_token_usage(response.usage)
            .with_timing(timing.finish());
        debug!(
            agent = %self.name,
            step,
            duration_ms = u64::try_from(record.timing().duration().as_millis()).unwrap_or(u64::MAX),
            "action step recorded"
        );
        self.record(record)?;
        self.lifecycle.transition(LoopEvent::Decide)?;

        Ok(match (failure, answer) {
            (Some(error), _) => StepOutcome::Failed(error),
            (None, Some(answer)) => StepOutcome::FinalAnswer(answer),
            (None, None) => StepOutcome::Continue,
        })
    }

    /// Dispatches `action`, retrying once on an infrastructure error.
    async fn execute(&mut self, action: &Action, deadline: Option<Instant>) -> ExecutionResult {
        let result = self.dispatch_once(action, deadline).await;
        match result.error() {
            Some(error) if error.kind() == ErrorKind::Infrastructure => {
                warn!(
                    agent = %self.name,
                    action = action.label(),
                    error = %error,
                    "infrastructure error, retrying once"
                );
                self.dispatch_once(action, deadline).await
            }
            _ => result,
        }
    }

    async fn dispatch_once(&mut self, action: &Action, deadline: Option<Instant>) -> ExecutionResult {
        let dispatch = self
            .dispatcher
            .dispatch(action, self.executor.as_mut(), &mut self.state);
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, dispatch)
                .await
                .unwrap_or_else(|_| {
                    ExecutionResult::failure(
                        ErrorInfo::timeout("the run deadline passed during the action"),
                        "",
                    )
                }),
            None => dispatch.await,
        }
    }

    fn rejected_answer(&self, answer: &Value) -> Option<String> {
        self.final_answer_checks
            .iter()
            .find_map(|check| check(answer, &self.memory).err())
            .map(|reason| format!("final answer rejected: {reason}"))
    }

    fn action_request(&self) -> AgentResult<InferenceRequest> {
        let messages = to_prompt_messages(self.memory.reconstruct_conversation());
        let request = InferenceRequest::new(messages)?;
        Ok(match self.config.mode {
            ActionMode::Code => {
                let request = request.with_stop_sequences(CODE_STOP_SEQUENCES);
                if self.config.structured_outputs {
                    request.with_response_format(structured_output_schema())
                } else {
                    request
                }
            }
            ActionMode::ToolCalling => {
                let mut tools = self.dispatcher.capabilities();
                tools.push(final_answer_descriptor());
                request
                    .with_tools(tools)
                    .with_stop_sequences(["Observation:"])
            }
        })
    }

    /// Messages of every record but the system prompt.
    fn history(&self) -> Vec<PromptMessage> {
        to_prompt_messages(
            self.memory
                .records()
                .iter()
                .filter(|record| record.kind() != RecordKind::SystemPrompt)
                .flat_map(StepRecord::to_messages)
                .collect(),
        )
    }

    async fn plan(
        &mut self,
        task: &str,
        step: u32,
        max_steps: u32,
        deadline: Option<Instant>,
    ) -> AgentResult<StepOutcome> {
        let timing = Timing::start();
        let mut vars = self.prompt_vars.clone();
        vars.insert("task".into(), task.to_owned());
        let first = !self
            .memory
            .current_run()
            .iter()
            .any(|record| record.kind() == RecordKind::Planning);

        let messages = if first {
            let prompt = self.prompts.initial_plan.render(&vars)?;
            vec![PromptMessage::new(MessageRole::User, prompt)]
        } else {
            vars.insert(
                "remaining_steps".into(),
                (max_steps - step + 1).to_string(),
            );
            let mut messages = vec![PromptMessage::new(
                MessageRole::System,
                self.prompts.update_plan_pre.render(&vars)?,
            )];
            messages.extend(self.history());
            messages.push(PromptMessage::new(
                MessageRole::User,
                self.prompts.update_plan_post.render(&vars)?,
            ));
            messages
        };
        let request = InferenceRequest::new(messages)?.with_stop_sequences([PLAN_STOP_SEQUENCE]);
        let limit = call_limit(self.config.model_timeout, deadline);

        match call_model(self.model.as_ref(), &self.callbacks, request, limit).await {
            Ok(response) => {
                debug!(agent = %self.name, step, first, "plan recorded");
                let plan = response.content.trim().to_owned();
                self.record(PlanningRecord::new(plan, response.usage, timing.finish()))?;
                Ok(StepOutcome::Continue)
            }
            Err(ModelCallError::TimedOut(_)) if deadline_passed(deadline) => {
                Ok(StepOutcome::Exhausted)
            }
            Err(ModelCallError::TimedOut(limit)) => {
                warn!(agent = %self.name, step, ?limit, "planning call timed out, skipping plan");
                Ok(StepOutcome::Continue)
            }
            Err(ModelCallError::Adapter(err)) => {
                warn!(agent = %self.name, step, %err, "planning call failed");
                Ok(StepOutcome::Failed(ErrorInfo::infrastructure(format!(
                    "planning call failed: {err}"
                ))))
            }
        }
    }

    /// One extra model call asking for the best answer the history allows.
    async fn best_effort_answer(
        &self,
        task: &str,
        deadline: Option<Instant>,
    ) -> AgentResult<Option<Value>> {
        let mut vars = Vars::new();
        vars.insert("task".into(), task.to_owned());
        let mut messages = vec![PromptMessage::new(
            MessageRole::System,
            self.prompts.final_answer_pre.render(&vars)?,
        )];
        messages.extend(self.history());
        messages.push(PromptMessage::new(
            MessageRole::User,
            self.prompts.final_answer_post.render(&vars)?,
        ));
        let request = InferenceRequest::new(messages)?;

        match call_model(
            self.model.as_ref(),
            &self.callbacks,
            request,
            call_limit(self.config.model_timeout, deadline),
        )
        .await
        {
            Ok(response) => Ok(Some(Value::String(response.content))),
            Err(ModelCallError::TimedOut(limit)) => {
                warn!(agent = %self.name, ?limit, "best-effort answer timed out");
                Ok(None)
            }
            Err(ModelCallError::Adapter(err)) => {
                warn!(agent = %self.name, %err, "best-effort answer failed");
                Ok(None)
            }
        }
    }
}

/// Variables shared by the system and planning prompts.
fn prompt_vars(dispatcher: &Dispatcher, authorized_imports: &[String], config: &LoopConfig) -> Vars {
    let mut tools = dispatcher.tools().descriptors();
    tools.push(final_answer_descriptor());
    let listing = tools
        .iter()
        .map(|descriptor| format!("- {}: {}", descriptor.signature(), descriptor.description()))
        .collect::<Vec<_>>()
        .join("\n");

    let agents = dispatcher
        .managed_agents()
        .map(|agent| format!("- {}: {}", agent.name(), agent.descriptor().description()))
        .collect::<Vec<_>>();
    let managed = if agents.is_empty() {
        String::new()
    } else {
        format!(
            "\nYou can also give tasks to team members. Call a team member like a tool, \
             with a `task` argument explaining the task in detail:\n{}\n",
            agents.join("\n")
        )
    };

    let mut vars = Vars::new();
    vars.insert("tools".into(), listing);
    vars.insert("managed_agents".into(), managed);
    vars.insert("authorized_imports".into(), authorized_imports.join(", "));
    vars.insert(
        "instructions".into(),
        config.instructions.clone().unwrap_or_default(),
    );
    vars
}

fn to_prompt_messages(messages: Vec<Message>) -> Vec<PromptMessage> {
    messages
        .into_iter()
        .map(|message| {
            let role = match message.role {
                Role::System => MessageRole::System,
                Role::User => MessageRole::User,
                Role::Assistant => MessageRole::Assistant,
                Role::Observation => MessageRole::Tool,
            };
            PromptMessage::new(role, message.content)
        })
        .collect()
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

fn call_limit(limit: Duration, deadline: Option<Instant>) -> Duration {
    deadline.map_or(limit, |deadline| {
        limit.min(deadline.saturating_duration_since(Instant::now()))
    })
}

/// Streams one model response, forwarding deltas to observers.
async fn call_model(
    model: &dyn ModelAdapter,
    callbacks: &Callbacks,
    request: InferenceRequest,
    limit: Duration,
) -> Result<ModelResponse, ModelCallError> {
    let call = async {
        let stream = model.infer(request).await?;
        ModelResponse::collect(stream, |delta| callbacks.notify_delta(delta)).await
    };
    match tokio::time::timeout(limit, call).await {
        Ok(response) => response.map_err(ModelCallError::Adapter),
        Err(_) => Err(ModelCallError::TimedOut(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use agent_adapters::{ScriptedAdapter, ScriptedResponse};
    use agent_primitives::{CapabilityBuilder, Parameter, SemanticType, ToolCall};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use agent_tools::ToolError;
    use serde_json::{Map, json};

    fn model(responses: Vec<ScriptedResponse>) -> Arc<ScriptedAdapter> {
        Arc::new(ScriptedAdapter::new(responses))
    }

    fn echo_descriptor(name: &str) -> CapabilityDescriptor {
        CapabilityDescriptor::builder(name)
            .description("Echoes its input")
            .parameter(Parameter::required("text", SemanticType::String, "text"))
            .map(|builder| builder.output(SemanticType::String))
            .and_then(CapabilityBuilder::build)
            .unwrap()
    }

    async fn echo(args: Map<String, Value>) -> Result<Value, ToolError> {
        Ok(args["text"].clone())
    }

    #[test]
    fn build_records_the_system_prompt() {
        let agent = Agent::builder("solver", model(Vec::new()))
            .tool(echo_descriptor("echo"), echo)
            .unwrap()
            .instructions("Answer tersely.")
            .build()
            .unwrap();
        assert_eq!(agent.memory().len(), 1);
        assert_eq!(agent.memory().records()[0].kind(), RecordKind::SystemPrompt);
        assert!(agent.system_prompt().contains("- echo(text: string) -> string"));
        assert!(agent.system_prompt().contains("Answer tersely."));
        assert_eq!(agent.loop_state(), LoopState::Idle);
    }

    #[test]
    fn rejects_a_tool_named_final_answer() {
        let err = Agent::builder("solver", model(Vec::new()))
            .tool(echo_descriptor(FINAL_ANSWER), echo)
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, AgentError::DuplicateCapability { name } if name == FINAL_ANSWER));
    }

    #[test]
    fn rejects_invalid_limits() {
        let err = Agent::builder("solver", model(Vec::new()))
            .max_steps(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, AgentError::Configuration { .. }));

        let err = Agent::builder("not valid", model(Vec::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, AgentError::Configuration { .. }));
    }

    #[tokio::test]
    async fn tool_calling_mode_sends_tools_and_stops() {
        let adapter = model(vec![ScriptedResponse::tool_call(ToolCall::new(
            FINAL_ANSWER,
            json!({"answer": "done"}),
        ))]);
        let mut agent = Agent::builder("caller", adapter.clone())
            .mode(ActionMode::ToolCalling)
            .tool(echo_descriptor("echo"), echo)
            .unwrap()
            .build()
            .unwrap();

        let answer = agent.run("finish").await.unwrap();
        assert_eq!(answer, json!("done"));
        let requests = adapter.requests();
        let names: Vec<&str> = requests[0].tools().iter().map(CapabilityDescriptor::name).collect();
        assert_eq!(names, ["echo", FINAL_ANSWER]);
    }

    #[tokio::test]
    async fn additional_args_become_variables() {
        let adapter = model(vec![ScriptedResponse::code("final_answer(count * 2)")]);
        let mut agent = Agent::builder("solver", adapter.clone()).build().unwrap();
        let mut extra = Map::new();
        extra.insert("count".into(), json!(21));

        let output = agent
            .run_with("double it", RunOptions::new().additional_args(extra))
            .await
            .unwrap();
        assert_eq!(output.answer(), Some(&json!(42)));
        let requests = adapter.requests();
        let task = &requests[0].messages()[1];
        assert!(task.content().contains("\"count\": 21"));
    }

    #[tokio::test]
    async fn final_answer_checks_can_reject() {
        let adapter = model(vec![
            ScriptedResponse::code("final_answer(3)"),
            ScriptedResponse::code("final_answer(4)"),
        ]);
        let mut agent = Agent::builder("solver", adapter)
            .final_answer_check(|answer, _memory| {
                if answer == &json!(4) {
                    Ok(())
                } else {
                    Err("the answer must be 4".into())
                }
            })
            .build()
            .unwrap();

        let result = agent
            .run_with("2+2", RunOptions::new().full_result())
            .await
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(result.state, RunState::Succeeded);
        let actions: Vec<&ActionRecord> = agent.memory().action_records().collect();
        assert_eq!(actions.len(), 2);
        let error = actions[0].result().error().unwrap();
        assert_eq!(error.kind(), ErrorKind::Execution);
        assert!(error.message().contains("must be 4"));
    }

    struct FlakyExecutor {
        failures: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Executor for FlakyExecutor {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn execute(
            &mut self,
            _code: &str,
            _state: &mut ExecutionState,
            _host: &dyn agent_sandbox::CallableHost,
        ) -> ExecutionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures > 0 {
                self.failures -= 1;
                return ExecutionResult::failure(ErrorInfo::infrastructure("sandbox went away"), "");
            }
            ExecutionResult::final_answer(json!("recovered"), "")
        }
    }

    fn flaky_agent(failures: usize, calls: &Arc<AtomicUsize>) -> Agent {
        let executor = FlakyExecutor {
            failures,
            calls: Arc::clone(calls),
        };
        Agent::builder("solver", model(vec![ScriptedResponse::code("final_answer(1)")]))
            .executor(Box::new(executor))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn one_infrastructure_error_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut agent = flaky_agent(1, &calls);

        let answer = agent.run("anything").await.unwrap();
        assert_eq!(answer, json!("recovered"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(agent.memory().action_records().count(), 1);
    }

    #[tokio::test]
    async fn repeated_infrastructure_errors_fail_the_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut agent = flaky_agent(2, &calls);

        let result = agent
            .run_with("anything", RunOptions::new().full_result())
            .await
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(result.state, RunState::Failed);
        assert_eq!(result.error.unwrap().kind(), ErrorKind::Infrastructure);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(agent.loop_state().is_terminal());
    }

    #[tokio::test]
    async fn model_failure_fails_the_run() {
        let adapter = model(vec![ScriptedResponse::failure("connection reset")]);
        let mut agent = Agent::builder("solver", adapter).build().unwrap();

        let err = agent.run("anything").await.unwrap_err();
        assert!(matches!(err, AgentError::RunFailed { error } if error.kind() == ErrorKind::Infrastructure));
        assert!(agent.loop_state().is_terminal());
        assert!(!agent.memory().is_running());
    }

    #[tokio::test]
    async fn model_timeouts_are_recoverable() {
        let adapter = model(vec![
            ScriptedResponse::code("final_answer(1)").with_delay(Duration::from_secs(60)),
            ScriptedResponse::code("final_answer(2)"),
        ]);
        let mut agent = Agent::builder("solver", adapter)
            .model_timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        let answer = agent.run("anything").await.unwrap();
        assert_eq!(answer, json!(2));
        let first = agent.memory().action_records().next().unwrap();
        assert_eq!(first.result().error().unwrap().kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn closed_agents_refuse_runs() {
        let mut agent = Agent::builder("solver", model(Vec::new())).build().unwrap();
        agent.close().await.unwrap();
        agent.close().await.unwrap();
        assert!(matches!(
            agent.run("anything").await,
            Err(AgentError::Configuration { .. })
        ));
    }
}
