use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentloop::config::AgentSettings;
use agentloop::memory::{ActionRecord, MemoryLog, RecordKind, StepObserver, StepRecord};
use agentloop::prelude::*;
use agentloop::primitives::{CapabilityBuilder, TokenUsage};
use agentloop::sandbox::CommandSpec;
use agentloop::telemetry::RunMetrics;
use serde_json::{Map, Value, json};

fn model(responses: Vec<ScriptedResponse>) -> Arc<ScriptedAdapter> {
    Arc::new(ScriptedAdapter::new(responses))
}

fn divide_descriptor() -> CapabilityDescriptor {
    CapabilityDescriptor::builder("divide")
        .description("Divides a by b")
        .parameter(Parameter::required("a", SemanticType::Number, "dividend"))
        .and_then(|builder| builder.parameter(Parameter::required("b", SemanticType::Number, "divisor")))
        .map(|builder| builder.output(SemanticType::Number))
        .and_then(CapabilityBuilder::build)
        .unwrap()
}

async fn divide(args: Map<String, Value>) -> ToolResult<Value> {
    let a = args["a"].as_f64().unwrap_or_default();
    let b = args["b"].as_f64().unwrap_or_default();
    if b == 0.0 {
        return Err(ToolError::execution("division by zero"));
    }
    Ok(json!(a / b))
}

async fn full_run(agent: &mut Agent, task: &str, options: RunOptions) -> RunResult {
    agent
        .run_with(task, options.full_result())
        .await
        .unwrap()
        .into_result()
        .unwrap()
}

fn kinds(records: &[StepRecord]) -> Vec<RecordKind> {
    records.iter().map(StepRecord::kind).collect()
}

#[tokio::test]
async fn code_action_produces_the_final_answer() {
    let adapter = model(vec![
        ScriptedResponse::code("final_answer(2 + 2)").with_usage(TokenUsage::new(12, 4)),
    ]);
    let mut agent = Agent::builder("calculator", adapter.clone()).build().unwrap();

    let result = full_run(&mut agent, "What is 2+2?", RunOptions::new()).await;

    assert_eq!(result.state, RunState::Succeeded);
    assert!(result.is_success());
    assert_eq!(result.output, Some(json!(4)));
    assert_eq!(kinds(result.steps()), [RecordKind::Action, RecordKind::FinalAnswer]);
    assert_eq!(result.token_usage, TokenUsage::new(12, 4));
    assert_eq!(adapter.remaining(), 0);

    let conversation = agent.memory().reconstruct_conversation();
    assert_eq!(conversation[0].content, agent.system_prompt());
    assert!(conversation[1].content.contains("What is 2+2?"));
}

#[tokio::test]
async fn step_budget_exhaustion_records_one_action() {
    let adapter = model(vec![
        ScriptedResponse::code("x = 1"),
        ScriptedResponse::text("My best guess is 1."),
    ]);
    let mut agent = Agent::builder("calculator", adapter).build().unwrap();

    let result = full_run(&mut agent, "Count", RunOptions::new().max_steps(1)).await;

    assert_eq!(result.state, RunState::Exhausted);
    assert_eq!(result.output, Some(json!("My best guess is 1.")));
    assert_eq!(agent.memory().action_records().count(), 1);
    assert_eq!(agent.execution_state().variables().get("x"), Some(&json!(1)));
}

#[tokio::test]
async fn exhaustion_without_summary_has_no_answer() {
    let adapter = model(vec![ScriptedResponse::code("x = 1")]);
    let mut agent = Agent::builder("calculator", adapter.clone())
        .max_steps(1)
        .summarize_on_exhaustion(false)
        .build()
        .unwrap();

    assert_eq!(agent.run("Count").await.unwrap(), Value::Null);
    let last = agent.memory().last().unwrap();
    assert!(matches!(last, StepRecord::FinalAnswer(record) if record.output().is_none()));
    assert_eq!(adapter.requests().len(), 1);
}

#[tokio::test]
async fn tool_errors_are_observations_the_model_can_correct() {
    let adapter = model(vec![
        ScriptedResponse::tool_call(ToolCall::new("divide", json!({"a": 1, "b": 0}))),
        ScriptedResponse::tool_call(ToolCall::new("divide", json!({"a": 6, "b": 3}))),
        ScriptedResponse::tool_call(ToolCall::new("final_answer", json!({"answer": 2.0}))),
    ]);
    let mut agent = Agent::builder("divider", adapter.clone())
        .mode(ActionMode::ToolCalling)
        .tool(divide_descriptor(), divide)
        .unwrap()
        .build()
        .unwrap();

    let result = full_run(&mut agent, "Divide 6 by 3", RunOptions::new()).await;

    assert_eq!(result.state, RunState::Succeeded);
    assert_eq!(result.output, Some(json!(2.0)));
    let actions: Vec<&ActionRecord> = agent.memory().action_records().collect();
    assert_eq!(actions.len(), 3);
    let first = actions[0].result().error().unwrap();
    assert_eq!(first.kind(), ErrorKind::Tool);
    assert!(first.message().contains("division by zero"));
    assert!(actions[1].result().error().is_none());
    assert_eq!(actions[1].result().output(), &json!(2.0));

    let requests = adapter.requests();
    let second_request = &requests[1];
    assert!(
        second_request
            .messages()
            .iter()
            .any(|message| message.content().contains("division by zero"))
    );
}

#[tokio::test]
async fn unknown_capabilities_list_what_is_available() {
    let adapter = model(vec![
        ScriptedResponse::tool_call(ToolCall::new("multiply", json!({"a": 1}))),
        ScriptedResponse::tool_call(ToolCall::new("final_answer", json!({"answer": "ok"}))),
    ]);
    let mut agent = Agent::builder("divider", adapter)
        .mode(ActionMode::ToolCalling)
        .tool(divide_descriptor(), divide)
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(agent.run("multiply").await.unwrap(), json!("ok"));
    let first = agent.memory().action_records().next().unwrap();
    let error = first.result().error().unwrap();
    assert_eq!(error.kind(), ErrorKind::UnknownCapability);
    assert!(error.message().contains("divide"));
}

#[tokio::test]
async fn code_can_call_tools() {
    let adapter = model(vec![ScriptedResponse::code(
        "half = divide(a=10, b=4)\nprint(half)\nfinal_answer(half)",
    )]);
    let mut agent = Agent::builder("divider", adapter)
        .tool(divide_descriptor(), divide)
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(agent.run("Halve 10 twice").await.unwrap(), json!(2.5));
    let action = agent.memory().action_records().next().unwrap();
    assert!(action.result().logs().contains("2.5"));
}

#[tokio::test]
async fn reconstructing_the_conversation_is_repeatable() {
    let adapter = model(vec![
        ScriptedResponse::code("x = 40"),
        ScriptedResponse::code("final_answer(x + 2)"),
    ]);
    let mut agent = Agent::builder("calculator", adapter).build().unwrap();
    agent.run("Compute").await.unwrap();

    let first = agent.memory().reconstruct_conversation();
    let second = agent.memory().reconstruct_conversation();
    assert_eq!(first, second);

    let restored = MemoryLog::from_jsonl(&agent.memory().to_jsonl().unwrap()).unwrap();
    assert_eq!(restored.records(), agent.memory().records());
    assert_eq!(restored.reconstruct_conversation(), first);
}

#[tokio::test]
async fn executor_timeouts_are_recoverable() {
    let adapter = model(vec![
        ScriptedResponse::code("while True:\n    pass"),
        ScriptedResponse::code("final_answer('stopped')"),
    ]);
    let mut agent = Agent::builder("looper", adapter)
        .local_executor(
            LocalConfig::default()
                .with_timeout(Duration::from_millis(100))
                .with_max_operations(u64::MAX),
        )
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(agent.run("Loop").await.unwrap(), json!("stopped"));
    let first = agent.memory().action_records().next().unwrap();
    assert_eq!(first.result().error().unwrap().kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn planning_steps_do_not_count_against_the_budget() {
    let adapter = model(vec![
        ScriptedResponse::text("1. Set x\n<end_plan>"),
        ScriptedResponse::code("x = 1"),
        ScriptedResponse::text("1. Increment x\n<end_plan>"),
        ScriptedResponse::code("x = x + 1"),
        ScriptedResponse::text("x is 2"),
    ]);
    let mut agent = Agent::builder("planner", adapter.clone())
        .planning_interval(1)
        .build()
        .unwrap();

    let result = full_run(&mut agent, "Count to two", RunOptions::new().max_steps(2)).await;

    assert_eq!(result.state, RunState::Exhausted);
    let steps = kinds(result.steps());
    let plans = steps.iter().filter(|kind| **kind == RecordKind::Planning).count();
    let actions = steps.iter().filter(|kind| **kind == RecordKind::Action).count();
    assert_eq!(plans, 2);
    assert_eq!(actions, 2);
    assert_eq!(agent.execution_state().variables().get("x"), Some(&json!(2)));
    assert_eq!(adapter.remaining(), 0);
}

#[tokio::test]
async fn runs_can_continue_without_reset() {
    let adapter = model(vec![
        ScriptedResponse::code("total = 5\nfinal_answer(total)"),
        ScriptedResponse::code("final_answer(total * 2)"),
    ]);
    let mut agent = Agent::builder("calculator", adapter).build().unwrap();

    assert_eq!(agent.run("Start at 5").await.unwrap(), json!(5));
    let output = agent
        .run_with("Double it", RunOptions::new().reset(false))
        .await
        .unwrap();
    assert_eq!(output.answer(), Some(&json!(10)));

    let tasks = agent
        .memory()
        .records()
        .iter()
        .filter(|record| record.kind() == RecordKind::Task)
        .count();
    assert_eq!(tasks, 2);
}

#[tokio::test]
async fn process_backend_runs_shell_code() {
    if !std::path::Path::new("/bin/sh").exists() {
        return;
    }
    let executor = ProcessExecutor::new(
        ProcessConfig::new(CommandSpec::new("sh")).with_timeout(Duration::from_secs(10)),
    )
    .unwrap();
    let adapter = model(vec![
        ScriptedResponse::code("echo hello"),
        ScriptedResponse::code("echo '__final_answer__:{\"total\": 4}'"),
    ]);
    let mut agent = Agent::builder("shell", adapter)
        .executor(Box::new(executor))
        .build()
        .unwrap();

    let answer = agent.run("Say hello, then answer").await.unwrap();
    assert_eq!(answer, json!({"total": 4}));
    let first = agent.memory().action_records().next().unwrap();
    assert_eq!(first.result().logs().trim(), "hello");
    agent.close().await.unwrap();
}

struct KindRecorder {
    seen: Mutex<Vec<(RecordKind, usize)>>,
}

impl StepObserver for KindRecorder {
    fn on_record(&self, record: &StepRecord, log: &MemoryLog) {
        self.seen.lock().unwrap().push((record.kind(), log.len()));
    }
}

#[tokio::test]
async fn observers_see_records_in_append_order() {
    let recorder = Arc::new(KindRecorder {
        seen: Mutex::new(Vec::new()),
    });
    let actions = Arc::new(Mutex::new(0_usize));
    let counter = Arc::clone(&actions);
    let adapter = model(vec![
        ScriptedResponse::code("y = 3"),
        ScriptedResponse::code("final_answer(y)"),
    ]);
    let mut agent = Agent::builder("watched", adapter)
        .observer(recorder.clone())
        .on_step(RecordKind::Action, move |_record, _log| {
            *counter.lock().unwrap() += 1;
        })
        .build()
        .unwrap();
    recorder.seen.lock().unwrap().clear();

    agent.run("Watch me").await.unwrap();

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        [
            (RecordKind::SystemPrompt, 1),
            (RecordKind::Task, 2),
            (RecordKind::Action, 3),
            (RecordKind::Action, 4),
            (RecordKind::FinalAnswer, 5),
        ]
    );
    assert_eq!(*actions.lock().unwrap(), 2);
}

#[tokio::test]
async fn metrics_observer_counts_errors_and_answers() {
    let metrics = Arc::new(RunMetrics::new());
    let adapter = model(vec![
        ScriptedResponse::code("1 / 0").with_usage(TokenUsage::new(10, 2)),
        ScriptedResponse::code("final_answer(0)").with_usage(TokenUsage::new(20, 3)),
    ]);
    let mut agent = Agent::builder("metered", adapter)
        .observer(metrics.clone())
        .build()
        .unwrap();

    agent.run("Divide by zero").await.unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.records.get(&RecordKind::Action), Some(&2));
    assert_eq!(snapshot.errors.get("execution-error"), Some(&1));
    assert_eq!(snapshot.token_usage, TokenUsage::new(30, 5));
    assert_eq!(snapshot.answered, 1);
    assert_eq!(snapshot.unanswered, 0);
}

#[tokio::test]
async fn settings_configure_the_agent() {
    let settings = AgentSettings::from_toml_str(
        r#"
        [agent]
        name = "configured"
        description = "Answers from settings"
        max_steps = 1
        summarize_on_exhaustion = false

        [executor]
        kind = "local"
        timeout_secs = 5
        authorized_imports = ["math"]
        "#,
    )
    .unwrap();
    let adapter = model(vec![ScriptedResponse::code("import math\nx = math.sqrt(16)")]);
    let mut agent = Agent::builder("placeholder", adapter)
        .with_settings(&settings)
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(agent.name(), "configured");
    assert_eq!(agent.description(), Some("Answers from settings"));
    let result = full_run(&mut agent, "Root of 16", RunOptions::new()).await;
    assert_eq!(result.state, RunState::Exhausted);
    assert_eq!(result.output, None);
    assert_eq!(agent.execution_state().variables().get("x"), Some(&json!(4.0)));
}

#[tokio::test]
async fn passed_deadlines_skip_the_best_effort_answer() {
    let adapter = model(vec![
        ScriptedResponse::code("final_answer(1)").with_delay(Duration::from_secs(60)),
        ScriptedResponse::text("late summary").with_delay(Duration::from_secs(3)),
    ]);
    let mut agent = Agent::builder("slow", adapter.clone()).build().unwrap();

    let started = std::time::Instant::now();
    let result = full_run(
        &mut agent,
        "Wait",
        RunOptions::new().timeout(Duration::from_millis(100)),
    )
    .await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(result.state, RunState::Exhausted);
    assert_eq!(result.output, None);
    assert_eq!(adapter.remaining(), 1);
}

#[tokio::test]
async fn run_deadline_ends_the_run_as_exhausted() {
    let adapter = model(vec![
        ScriptedResponse::code("final_answer(1)").with_delay(Duration::from_secs(60)),
    ]);
    let mut agent = Agent::builder("slow", adapter)
        .summarize_on_exhaustion(false)
        .build()
        .unwrap();

    let result = full_run(
        &mut agent,
        "Wait",
        RunOptions::new().timeout(Duration::from_millis(100)),
    )
    .await;
    assert_eq!(result.state, RunState::Exhausted);
    assert_eq!(result.output, None);
}
