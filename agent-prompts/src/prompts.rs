//! Default prompt set driving the step loop.

use serde::{Deserialize, Serialize};

use crate::template::PromptTemplate;

const CODE_SYSTEM: &str = r#"You are an expert assistant who solves any task using code blobs.
To do so you proceed in a cycle of 'Thought:', 'Code:' and 'Observation:' sequences.

At each step, in the 'Thought:' sequence, explain your reasoning and the tools you want to use.
Then in the 'Code:' sequence write simple Python code, starting with '```py' and ending with '```<end_code>'.
Use print() to keep intermediate results: printed output appears in the next 'Observation:'.
To finish, return the answer with the `final_answer` function.

You can call these functions from your code:
{{tools}}
{{managed_agents}}
Rules:
1. Always provide a 'Thought:' sequence and a 'Code:' sequence.
2. Only use variables you have defined. State persists between code blobs.
3. Call tools with keyword arguments, e.g. `answer = web_search(query="x")`.
4. Do not name a variable after a tool or `final_answer`.
5. You may only import from these modules: {{authorized_imports}}
6. Never give up: if a step fails, read the error and try another approach.
{{instructions}}"#;

const TOOL_CALLING_SYSTEM: &str = r#"You are an expert assistant who solves any task using tool calls.
At each step, call exactly one tool with a JSON blob of the form
{"name": "tool_name", "arguments": {"arg": "value"}}
The result of the call is returned as an 'Observation:'.
To finish, call the `final_answer` tool with your answer.

Available tools:
{{tools}}
{{managed_agents}}
Rules:
1. Always pass arguments matching the tool's parameters, never variable names.
2. Only call a tool when needed and never repeat a call with identical arguments.
{{instructions}}"#;

const INITIAL_PLAN: &str = r"You are a world expert at making efficient plans to solve any task.
Here is your task:
{{task}}

Available tools:
{{tools}}
{{managed_agents}}
First list the facts given in the task, the facts to look up and the facts to derive.
Then write a step-by-step high-level plan using the tools above. Do not skip steps and do not add superfluous ones.
Write '<end_plan>' after the last step.";

const UPDATE_PLAN_PRE: &str = r"You are a world expert at making efficient plans to solve any task.
You have been given this task:
{{task}}

Below is the history of the attempts made so far.";

const UPDATE_PLAN_POST: &str = r"Based on the history above, update the list of known facts and write a new step-by-step plan.
You have {{remaining_steps}} steps left.
Available tools:
{{tools}}
{{managed_agents}}
Write '<end_plan>' after the last step.";

const FINAL_ANSWER_PRE: &str = "An agent tried to answer a user query but got stuck and failed to do so. \
     Your task is to provide the best possible answer from the agent's memory below.";

const FINAL_ANSWER_POST: &str = r"Based on the above, provide an answer to the following user task:
{{task}}";

const MANAGED_AGENT_TASK: &str = r"You're a helpful agent named '{{name}}'.
You have been submitted this task by your manager.
---
Task:
{{task}}
---
Give your manager as much information as possible in your final answer.";

const MANAGED_AGENT_REPORT: &str = r"Here is the final answer from your managed agent '{{name}}':
{{final_answer}}";

/// Templates used by an agent. Every template can be overridden.
///
/// Variables available to the system prompts: `tools`, `managed_agents`,
/// `authorized_imports`, `instructions`. Planning prompts additionally see
/// `task` and `remaining_steps`; managed-agent prompts see `name`, `task`
/// and `final_answer`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSet {
    /// System prompt in code mode.
    pub code_system: PromptTemplate,
    /// System prompt in tool-calling mode.
    pub tool_calling_system: PromptTemplate,
    /// First planning step.
    pub initial_plan: PromptTemplate,
    /// Shown before the history when updating a plan.
    pub update_plan_pre: PromptTemplate,
    /// Shown after the history when updating a plan.
    pub update_plan_post: PromptTemplate,
    /// Shown before the history when asking for a best-effort answer.
    pub final_answer_pre: PromptTemplate,
    /// Shown after the history when asking for a best-effort answer.
    pub final_answer_post: PromptTemplate,
    /// Task given to a managed agent.
    pub managed_agent_task: PromptTemplate,
    /// Wrapper around a managed agent's answer.
    pub managed_agent_report: PromptTemplate,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            code_system: PromptTemplate::new(CODE_SYSTEM).with_default("instructions", ""),
            tool_calling_system: PromptTemplate::new(TOOL_CALLING_SYSTEM)
                .with_default("instructions", ""),
            initial_plan: INITIAL_PLAN.into(),
            update_plan_pre: UPDATE_PLAN_PRE.into(),
            update_plan_post: UPDATE_PLAN_POST.into(),
            final_answer_pre: FINAL_ANSWER_PRE.into(),
            final_answer_post: FINAL_ANSWER_POST.into(),
            managed_agent_task: MANAGED_AGENT_TASK.into(),
            managed_agent_report: MANAGED_AGENT_REPORT.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::template::Vars;

    #[test]
    fn default_system_prompts_render() {
        let prompts = PromptSet::default();
        let mut vars = Vars::new();
        vars.insert("tools".into(), "- divide(a: number, b: number) -> number".into());
        vars.insert("managed_agents".into(), String::new());
        vars.insert("authorized_imports".into(), "math, re".into());

        let code = prompts.code_system.render(&vars).unwrap();
        assert!(code.contains("divide(a: number"));
        assert!(code.contains("math, re"));

        let tools = prompts.tool_calling_system.render(&vars).unwrap();
        assert!(tools.contains("final_answer"));
    }

    #[test]
    fn planning_prompts_need_the_task() {
        let prompts = PromptSet::default();
        let placeholders = prompts.initial_plan.placeholders().unwrap();
        assert!(placeholders.contains(&"task"));
        assert!(
            prompts
                .update_plan_post
                .placeholders()
                .unwrap()
                .contains(&"remaining_steps")
        );
    }
}
