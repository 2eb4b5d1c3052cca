//! Agents exposed to other agents as capabilities.

use std::fmt;
use std::sync::{Arc, Mutex};

use agent_primitives::{
    CapabilityDescriptor, ErrorInfo, Parameter, SemanticType, render_value,
};
use agent_prompts::{PromptSet, Vars};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::agent::Agent;
use crate::error::AgentResult;
use crate::options::{RunOptions, RunResult, RunState};
use crate::AgentError;

/// A fully configured agent wrapped as a capability with inputs
/// `{task, additional_args?}` and a string output.
///
/// Each call runs the wrapped agent on a fresh task in its own memory log;
/// the manager only sees the returned report. Calls to the same managed
/// agent are serialized.
pub struct ManagedAgent {
    name: String,
    descriptor: CapabilityDescriptor,
    agent: tokio::sync::Mutex<Agent>,
    children: Vec<Arc<ManagedAgent>>,
    prompts: PromptSet,
    provide_run_summary: bool,
    last_run: Mutex<Option<RunResult>>,
}

impl fmt::Debug for ManagedAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedAgent")
            .field("name", &self.name)
            .field("children", &self.children.len())
            .field("provide_run_summary", &self.provide_run_summary)
            .finish_non_exhaustive()
    }
}

impl ManagedAgent {
    /// Wraps `agent`. The agent's description becomes the capability's.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Configuration`] when the agent has no
    /// description and [`AgentError::Descriptor`] when its name cannot be a
    /// capability name.
    pub fn new(agent: Agent) -> AgentResult<Self> {
        let description = agent.description().ok_or_else(|| {
            AgentError::configuration(format!(
                "managed agent `{}` needs a description",
                agent.name()
            ))
        })?;
        let descriptor = CapabilityDescriptor::builder(agent.name())
            .description(description)
            .parameter(Parameter::required(
                "task",
                SemanticType::String,
                "Long, detailed description of the task",
            ))?
            .parameter(
                Parameter::optional(
                    "additional_args",
                    SemanticType::Object,
                    "Extra inputs such as images or data the task refers to",
                )
                .nullable(),
            )?
            .output(SemanticType::String)
            .build()?;

        Ok(Self {
            name: agent.name().to_owned(),
            descriptor,
            children: agent.managed_agents().cloned().collect(),
            prompts: agent.prompts().clone(),
            agent: tokio::sync::Mutex::new(agent),
            provide_run_summary: false,
            last_run: Mutex::new(None),
        })
    }

    /// Appends a summary of the agent's work to every report.
    #[must_use]
    pub fn with_run_summary(mut self, enabled: bool) -> Self {
        self.provide_run_summary = enabled;
        self
    }

    /// Capability name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capability descriptor shown to the manager.
    #[must_use]
    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    /// Agents this agent manages.
    #[must_use]
    pub fn children(&self) -> &[Arc<ManagedAgent>] {
        &self.children
    }

    /// Result of the most recent call.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn last_run(&self) -> Option<RunResult> {
        self.last_run
            .lock()
            .expect("managed agent result lock poisoned")
            .clone()
    }

    /// Path of agent names from this agent down to `target`, inclusive, if
    /// `target` is reachable through delegation.
    #[must_use]
    pub fn path_to(&self, target: &str) -> Option<Vec<String>> {
        if self.name == target {
            return Some(vec![self.name.clone()]);
        }
        self.children.iter().find_map(|child| {
            child.path_to(target).map(|mut path| {
                path.insert(0, self.name.clone());
                path
            })
        })
    }

    /// Releases the wrapped agent's executor, waiting for a call in flight.
    ///
    /// # Errors
    ///
    /// Propagates the error of [`Agent::close`].
    pub fn close(&self) -> BoxFuture<'_, AgentResult<()>> {
        Box::pin(async move { self.agent.lock().await.close().await })
    }

    /// Runs the wrapped agent on the task in `arguments` and returns its
    /// report.
    ///
    /// # Errors
    ///
    /// Returns a `tool-error` when the sub-run fails; the manager sees it
    /// as an observation.
    ///
    /// # Panics
    ///
    /// Panics if the internal result lock is poisoned.
    pub fn call(&self, arguments: Map<String, Value>) -> BoxFuture<'_, Result<Value, ErrorInfo>> {
        Box::pin(async move {
            let task = arguments
                .get("task")
                .and_then(Value::as_str)
                .ok_or_else(|| ErrorInfo::schema("`task` must be a string"))?;
            let additional_args = match arguments.get("additional_args") {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            };

            let mut vars = Vars::new();
            vars.insert("name".into(), self.name.clone());
            vars.insert("task".into(), task.to_owned());
            let task = self
                .prompts
                .managed_agent_task
                .render(&vars)
                .map_err(|err| ErrorInfo::infrastructure(err.to_string()))?;

            info!(agent = %self.name, "delegating task to managed agent");
            let options = RunOptions::new()
                .full_result()
                .additional_args(additional_args);
            let mut agent = self.agent.lock().await;
            let result = agent
                .run_with(&task, options)
                .await
                .map_err(|err| ErrorInfo::tool(format!("managed agent `{}` failed: {err}", self.name)))?
                .into_result()
                .ok_or_else(|| ErrorInfo::infrastructure("managed agent returned no result"))?;
            let summary = self.provide_run_summary.then(|| agent.memory().summary());
            drop(agent);

            *self
                .last_run
                .lock()
                .expect("managed agent result lock poisoned") = Some(result.clone());
            debug!(agent = %self.name, state = %result.state, "managed agent finished");

            if result.state == RunState::Failed {
                let reason = result
                    .error
                    .as_ref()
                    .map_or_else(|| "unknown error".to_owned(), ToString::to_string);
                return Err(ErrorInfo::tool(format!(
                    "managed agent `{}` failed: {reason}",
                    self.name
                )));
            }

            let answer = result
                .output
                .as_ref()
                .map_or_else(|| "no answer was produced".to_owned(), render_value);
            vars.insert("final_answer".into(), answer);
            let mut report = self
                .prompts
                .managed_agent_report
                .render(&vars)
                .map_err(|err| ErrorInfo::infrastructure(err.to_string()))?;
            if let Some(summary) = summary {
                report.push_str("\n\n<summary_of_work>\n");
                report.push_str(&summary);
                report.push_str("</summary_of_work>");
            }
            Ok(Value::String(report))
        })
    }
}
