use std::sync::Arc;

use agentloop::memory::RecordKind;
use agentloop::prelude::*;
use serde_json::json;

fn model(responses: Vec<ScriptedResponse>) -> Arc<ScriptedAdapter> {
    Arc::new(ScriptedAdapter::new(responses))
}

fn researcher(responses: Vec<ScriptedResponse>) -> Agent {
    Agent::builder("researcher", model(responses))
        .description("Looks facts up")
        .build()
        .unwrap()
}

#[tokio::test]
async fn managed_agents_run_in_their_own_memory() {
    let sub = Arc::new(
        ManagedAgent::new(researcher(vec![ScriptedResponse::code(
            "final_answer('Paris')",
        )]))
        .unwrap(),
    );
    let adapter = model(vec![ScriptedResponse::code(
        "report = researcher(task=\"What is the capital of France?\")\nfinal_answer(report)",
    )]);
    let mut manager = Agent::builder("manager", adapter.clone())
        .managed_agent(Arc::clone(&sub))
        .build()
        .unwrap();

    assert!(manager.system_prompt().contains("researcher"));
    let answer = manager.run("Find the capital of France").await.unwrap();
    let report = answer.as_str().unwrap();
    assert!(report.contains("researcher"));
    assert!(report.contains("Paris"));

    let kinds: Vec<RecordKind> = manager
        .memory()
        .records()
        .iter()
        .map(|record| record.kind())
        .collect();
    assert_eq!(
        kinds,
        [
            RecordKind::SystemPrompt,
            RecordKind::Task,
            RecordKind::Action,
            RecordKind::FinalAnswer,
        ]
    );

    let sub_run = sub.last_run().unwrap();
    assert_eq!(sub_run.state, RunState::Succeeded);
    assert_eq!(sub_run.output, Some(json!("Paris")));
    assert!(sub_run.records.iter().any(|record| record.kind() == RecordKind::Task));

    manager.close().await.unwrap();
}

#[tokio::test]
async fn structured_calls_reach_managed_agents() {
    let sub = Arc::new(
        ManagedAgent::new(researcher(vec![ScriptedResponse::code("final_answer(7)")]))
            .unwrap()
            .with_run_summary(true),
    );
    let adapter = model(vec![
        ScriptedResponse::tool_call(ToolCall::new(
            "researcher",
            json!({"task": "Count the days of the week"}),
        )),
        ScriptedResponse::tool_call(ToolCall::new("final_answer", json!({"answer": 7}))),
    ]);
    let mut manager = Agent::builder("manager", adapter)
        .mode(ActionMode::ToolCalling)
        .managed_agent(sub)
        .build()
        .unwrap();

    assert_eq!(manager.run("How many days?").await.unwrap(), json!(7));
    let call = manager.memory().action_records().next().unwrap();
    let report = call.result().output().as_str().unwrap();
    assert!(report.contains("<summary_of_work>"));
    assert!(report.contains("Count the days of the week"));
}

#[tokio::test]
async fn failed_sub_runs_are_tool_errors_for_the_manager() {
    let sub = Arc::new(
        ManagedAgent::new(researcher(vec![ScriptedResponse::failure("backend down")])).unwrap(),
    );
    let adapter = model(vec![
        ScriptedResponse::tool_call(ToolCall::new("researcher", json!({"task": "anything"}))),
        ScriptedResponse::tool_call(ToolCall::new("final_answer", json!({"answer": "gave up"}))),
    ]);
    let mut manager = Agent::builder("manager", adapter)
        .mode(ActionMode::ToolCalling)
        .managed_agent(Arc::clone(&sub))
        .build()
        .unwrap();

    assert_eq!(manager.run("Delegate").await.unwrap(), json!("gave up"));
    let call = manager.memory().action_records().next().unwrap();
    let error = call.result().error().unwrap();
    assert_eq!(error.kind(), ErrorKind::Tool);
    assert!(error.message().contains("researcher"));
    assert_eq!(sub.last_run().unwrap().state, RunState::Failed);
}

#[test]
fn delegation_cycles_are_rejected_at_build() {
    let inner = Agent::builder("alpha", model(Vec::new()))
        .description("Inner alpha")
        .build()
        .unwrap();
    let beta = Agent::builder("beta", model(Vec::new()))
        .description("Beta")
        .managed_agent(Arc::new(ManagedAgent::new(inner).unwrap()))
        .build()
        .unwrap();

    let err = Agent::builder("alpha", model(Vec::new()))
        .managed_agent(Arc::new(ManagedAgent::new(beta).unwrap()))
        .build()
        .unwrap_err();

    match err {
        AgentError::DelegationCycle { path } => assert_eq!(path, ["alpha", "beta", "alpha"]),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn managed_agents_need_a_description() {
    let agent = Agent::builder("silent", model(Vec::new())).build().unwrap();
    assert!(matches!(
        ManagedAgent::new(agent),
        Err(AgentError::Configuration { .. })
    ));
}

#[test]
fn managed_agent_names_must_not_collide_with_tools() {
    let sub = Arc::new(ManagedAgent::new(researcher(Vec::new())).unwrap());
    let descriptor = CapabilityDescriptor::builder("researcher")
        .description("Also a researcher")
        .build()
        .unwrap();
    let err = Agent::builder("manager", model(Vec::new()))
        .tool(descriptor, |_args: serde_json::Map<String, serde_json::Value>| async {
            Ok::<_, ToolError>(json!(null))
        })
        .unwrap()
        .managed_agent(sub)
        .build()
        .unwrap_err();
    assert!(matches!(err, AgentError::DuplicateCapability { name } if name == "researcher"));
}
