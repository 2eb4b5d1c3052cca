//! Routing of validated actions to capabilities and executors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use agent_primitives::{
    Action, CapabilityDescriptor, ErrorInfo, ExecutionResult, ToolCall, validate_arguments,
};
use agent_sandbox::{CallableHost, ExecutionState, Executor};
use agent_tools::{FINAL_ANSWER, ToolRegistry, final_answer_descriptor};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::delegation::ManagedAgent;

/// Capability set of one agent: its tools, its managed agents and the
/// built-in `final_answer`.
///
/// Structured calls are validated against the matching descriptor before
/// anything runs; names outside the set fail fast with `unknown-capability`.
/// Code blocks are syntax-checked and handed to the executor with the
/// dispatcher as their [`CallableHost`].
#[derive(Debug)]
pub struct Dispatcher {
    tools: Arc<ToolRegistry>,
    agents: BTreeMap<String, Arc<ManagedAgent>>,
    call_timeout: Option<Duration>,
}

impl Dispatcher {
    /// Creates a dispatcher over `tools`.
    #[must_use]
    pub fn new(tools: Arc<ToolRegistry>) -> Self {
        Self {
            tools,
            agents: BTreeMap::new(),
            call_timeout: None,
        }
    }

    /// Bounds every direct capability invocation.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub(crate) fn add_agent(&mut self, agent: Arc<ManagedAgent>) {
        self.agents.insert(agent.name().to_owned(), agent);
    }

    /// Tool registry backing the dispatcher.
    #[must_use]
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Managed agents, ordered by name.
    pub fn managed_agents(&self) -> impl Iterator<Item = &Arc<ManagedAgent>> {
        self.agents.values()
    }

    /// Descriptors of tools and managed agents, without `final_answer`.
    #[must_use]
    pub fn capabilities(&self) -> Vec<CapabilityDescriptor> {
        let mut descriptors = self.tools.descriptors();
        descriptors.extend(self.agents.values().map(|agent| agent.descriptor().clone()));
        descriptors
    }

    /// Descriptor of `name`, including `final_answer`.
    #[must_use]
    pub fn descriptor(&self, name: &str) -> Option<CapabilityDescriptor> {
        if name == FINAL_ANSWER {
            return Some(final_answer_descriptor());
        }
        if let Some(agent) = self.agents.get(name) {
            return Some(agent.descriptor().clone());
        }
        self.tools.get(name).map(|handle| handle.descriptor().clone())
    }

    /// Every name an action may use.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names = self.tools.names();
        names.extend(self.agents.keys().cloned());
        names.push(FINAL_ANSWER.to_owned());
        names.sort();
        names
    }

    /// Checks a structured call against its descriptor and returns the
    /// coerced arguments. Pure: nothing is invoked.
    ///
    /// # Errors
    ///
    /// Returns `unknown-capability` for a name outside the set and
    /// `schema-error` for arguments that do not satisfy the schema.
    pub fn validate_call(&self, call: &ToolCall) -> Result<Map<String, Value>, ErrorInfo> {
        let arguments = call.argument_map().ok_or_else(|| {
            ErrorInfo::schema(format!(
                "arguments for `{}` must be an object of named parameters",
                call.name()
            ))
        })?;
        self.validate_arguments(call.name(), &arguments)
    }

    fn validate_arguments(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ErrorInfo> {
        let descriptor = self.descriptor(name).ok_or_else(|| self.unknown(name))?;
        validate_arguments(&descriptor, arguments)
            .map_err(|violation| ErrorInfo::schema(violation.to_string()))
    }

    /// Checks an action without running it: structured calls against their
    /// schema, code blocks for syntax.
    ///
    /// # Errors
    ///
    /// Returns the classified problem, `schema-error` for bad syntax.
    pub fn validate(&self, action: &Action, executor: &dyn Executor) -> Result<(), ErrorInfo> {
        match action {
            Action::StructuredCall(call) => self.validate_call(call).map(drop),
            Action::CodeBlock { source } => executor
                .check_syntax(source)
                .map_err(|reason| ErrorInfo::schema(format!("invalid code: {reason}"))),
        }
    }

    /// Runs `action` and classifies every failure into the result.
    pub async fn dispatch(
        &self,
        action: &Action,
        executor: &mut dyn Executor,
        state: &mut ExecutionState,
    ) -> ExecutionResult {
        match action {
            Action::StructuredCall(call) => {
                let arguments = match self.validate_call(call) {
                    Ok(arguments) => arguments,
                    Err(error) => return ExecutionResult::failure(error, ""),
                };
                if call.name() == FINAL_ANSWER {
                    let answer = arguments.get("answer").cloned().unwrap_or(Value::Null);
                    return ExecutionResult::final_answer(answer, "");
                }
                match self.invoke(call.name(), arguments).await {
                    Ok(output) => ExecutionResult::success(output, ""),
                    Err(error) => ExecutionResult::failure(error, ""),
                }
            }
            Action::CodeBlock { source } => {
                if let Err(error) = self.validate(action, executor) {
                    return ExecutionResult::failure(error, "");
                }
                debug!(executor = executor.name(), "dispatching code action");
                executor.execute(source, state, self).await
            }
        }
    }

    /// Invokes an already validated capability.
    async fn invoke(&self, name: &str, arguments: Map<String, Value>) -> Result<Value, ErrorInfo> {
        debug!(capability = name, "invoking capability");
        if let Some(agent) = self.agents.get(name) {
            return self.bounded(name, agent.call(arguments)).await;
        }
        let handle = self.tools.get(name).ok_or_else(|| self.unknown(name))?;
        self.bounded(name, async move {
            handle
                .invoke(arguments)
                .await
                .map_err(|err| ErrorInfo::tool(err.to_string()))
        })
        .await
    }

    async fn bounded<F>(&self, name: &str, call: F) -> Result<Value, ErrorInfo>
    where
        F: Future<Output = Result<Value, ErrorInfo>>,
    {
        match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                Err(ErrorInfo::timeout(format!(
                    "`{name}` did not return within {limit:?}"
                )))
            }),
            None => call.await,
        }
    }

    fn unknown(&self, name: &str) -> ErrorInfo {
        let names = self.names();
        let available: Vec<&str> = names.iter().map(String::as_str).collect();
        ErrorInfo::unknown_capability(name, &available)
    }
}

#[async_trait]
impl CallableHost for Dispatcher {
    fn callables(&self) -> Vec<CapabilityDescriptor> {
        self.capabilities()
    }

    fn callable(&self, name: &str) -> Option<CapabilityDescriptor> {
        if name == FINAL_ANSWER {
            return None;
        }
        self.descriptor(name)
    }

    async fn call(&self, name: &str, arguments: Map<String, Value>) -> Result<Value, ErrorInfo> {
        if name == FINAL_ANSWER {
            return Err(ErrorInfo::schema(
                "`final_answer` is handled by the executor, not the host",
            ));
        }
        let arguments = self.validate_arguments(name, &arguments)?;
        self.invoke(name, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use agent_primitives::{CapabilityBuilder, ErrorKind, Parameter, SemanticType};
    use agent_sandbox::LocalExecutor;
    use agent_tools::ToolError;
    use serde_json::json;

    fn divide_descriptor() -> CapabilityDescriptor {
        CapabilityDescriptor::builder("divide")
            .description("Divides a by b")
            .parameter(Parameter::required("a", SemanticType::Number, "dividend"))
            .and_then(|builder| {
                builder.parameter(Parameter::required("b", SemanticType::Number, "divisor"))
            })
            .map(|builder| builder.output(SemanticType::Number))
            .and_then(CapabilityBuilder::build)
            .unwrap()
    }

    fn dispatcher() -> Dispatcher {
        let tools = ToolRegistry::new();
        tools
            .register_tool(divide_descriptor(), |args: Map<String, Value>| async move {
                let a = args["a"].as_f64().unwrap_or_default();
                let b = args["b"].as_f64().unwrap_or_default();
                if b == 0.0 {
                    return Err(ToolError::execution("division by zero"));
                }
                Ok(json!(a / b))
            })
            .unwrap();
        Dispatcher::new(Arc::new(tools))
    }

    #[tokio::test]
    async fn tool_errors_are_classified() {
        let dispatcher = dispatcher();
        let mut executor = LocalExecutor::default();
        let mut state = ExecutionState::new();

        let ok = dispatcher
            .dispatch(
                &Action::call("divide", json!({"a": 6, "b": 3})),
                &mut executor,
                &mut state,
            )
            .await;
        assert_eq!(ok.output(), &json!(2.0));

        let failed = dispatcher
            .dispatch(
                &Action::call("divide", json!({"a": 1, "b": 0})),
                &mut executor,
                &mut state,
            )
            .await;
        let error = failed.error().unwrap();
        assert_eq!(error.kind(), ErrorKind::Tool);
        assert!(error.message().contains("division by zero"));
    }

    #[tokio::test]
    async fn unknown_capabilities_fail_fast() {
        let dispatcher = dispatcher();
        let mut executor = LocalExecutor::default();
        let mut state = ExecutionState::new();
        let result = dispatcher
            .dispatch(&Action::call("divid", json!({})), &mut executor, &mut state)
            .await;
        let error = result.error().unwrap();
        assert_eq!(error.kind(), ErrorKind::UnknownCapability);
        assert!(error.message().contains("divide, final_answer"));
    }

    #[tokio::test]
    async fn schema_violations_do_not_invoke() {
        let dispatcher = dispatcher();
        let mut executor = LocalExecutor::default();
        let mut state = ExecutionState::new();
        let result = dispatcher
            .dispatch(
                &Action::call("divide", json!({"a": "six"})),
                &mut executor,
                &mut state,
            )
            .await;
        assert_eq!(result.error().unwrap().kind(), ErrorKind::Schema);
    }

    #[tokio::test]
    async fn final_answer_call_ends_the_run() {
        let dispatcher = dispatcher();
        let mut executor = LocalExecutor::default();
        let mut state = ExecutionState::new();
        let result = dispatcher
            .dispatch(
                &Action::call(FINAL_ANSWER, json!({"answer": 4})),
                &mut executor,
                &mut state,
            )
            .await;
        assert!(result.is_final_answer());
        assert_eq!(result.output(), &json!(4));
    }

    #[tokio::test]
    async fn code_reaches_tools_through_the_host() {
        let dispatcher = dispatcher();
        let mut executor = LocalExecutor::default();
        let mut state = ExecutionState::new();
        let result = dispatcher
            .dispatch(
                &Action::code("x = divide(a=8, b=2)\nfinal_answer(x)"),
                &mut executor,
                &mut state,
            )
            .await;
        assert!(result.is_final_answer(), "{result:?}");
        assert_eq!(result.output(), &json!(4.0));
    }

    #[tokio::test]
    async fn syntax_errors_are_schema_errors() {
        let dispatcher = dispatcher();
        let mut executor = LocalExecutor::default();
        let mut state = ExecutionState::new();
        let result = dispatcher
            .dispatch(&Action::code("x = = 1"), &mut executor, &mut state)
            .await;
        assert_eq!(result.error().unwrap().kind(), ErrorKind::Schema);
    }

    #[tokio::test]
    async fn slow_tools_time_out() {
        let tools = ToolRegistry::new();
        let descriptor = CapabilityDescriptor::builder("slow")
            .description("Sleeps")
            .build()
            .unwrap();
        tools
            .register_tool(descriptor, |_args: Map<String, Value>| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ToolError>(Value::Null)
            })
            .unwrap();
        let dispatcher =
            Dispatcher::new(Arc::new(tools)).with_call_timeout(Duration::from_millis(20));
        let mut executor = LocalExecutor::default();
        let mut state = ExecutionState::new();
        let result = dispatcher
            .dispatch(&Action::call("slow", Value::Null), &mut executor, &mut state)
            .await;
        assert_eq!(result.error().unwrap().kind(), ErrorKind::Timeout);
    }
}
