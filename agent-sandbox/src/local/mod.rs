//! In-process executor for a restricted Python-flavoured language.
//!
//! Supported: assignments (including unpacking and augmented forms), `if`,
//! `for`, `while`, `def` with default arguments, `return`, `assert`, list and
//! dict comprehensions, f-strings, imports from an allow-list of natively
//! implemented modules, and calls to the host's capabilities. Classes,
//! exception handling, `with`, `lambda` and generators are rejected at parse
//! time.
//!
//! Every block runs under a wall-clock timeout and an operation budget.
//! Neither makes this a security boundary; use
//! [`ProcessExecutor`](crate::ProcessExecutor) for untrusted code.

mod ast;
mod builtins;
mod error;
mod format;
mod interpreter;
mod lexer;
mod methods;
mod modules;
mod parser;
mod value;

use std::collections::BTreeSet;
use std::time::Duration;

use agent_primitives::{ErrorInfo, ExecutionResult};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::host::CallableHost;
use crate::output::{DEFAULT_MAX_OUTPUT_BYTES, truncate_output};
use crate::state::ExecutionState;
use crate::{Executor, SandboxError, SandboxResult};

use self::interpreter::Interpreter;
use self::parser::parse;

/// Modules importable unless configured otherwise.
pub const DEFAULT_AUTHORIZED_IMPORTS: [&str; 5] = ["json", "math", "re", "statistics", "time"];

/// Limits applied to each code block run by a [`LocalExecutor`].
#[derive(Clone, Debug)]
pub struct LocalConfig {
    timeout: Duration,
    max_output_bytes: usize,
    max_operations: u64,
    authorized_imports: BTreeSet<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_operations: 10_000_000,
            authorized_imports: DEFAULT_AUTHORIZED_IMPORTS
                .iter()
                .map(|module| (*module).to_owned())
                .collect(),
        }
    }
}

impl LocalConfig {
    /// Sets the wall-clock limit for one block.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the byte budget for captured output.
    #[must_use]
    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Sets how many statements, loop iterations and calls one block may
    /// perform.
    #[must_use]
    pub fn with_max_operations(mut self, max_operations: u64) -> Self {
        self.max_operations = max_operations;
        self
    }

    /// Adds modules to the import allow-list. `"*"` authorizes everything the
    /// interpreter implements.
    #[must_use]
    pub fn authorize_imports<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authorized_imports
            .extend(modules.into_iter().map(Into::into));
        self
    }

    /// Replaces the import allow-list.
    #[must_use]
    pub fn with_authorized_imports<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authorized_imports = modules.into_iter().map(Into::into).collect();
        self
    }

    /// Wall-clock limit for one block.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Byte budget for captured output.
    #[must_use]
    pub const fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    /// Operation budget for one block.
    #[must_use]
    pub const fn max_operations(&self) -> u64 {
        self.max_operations
    }

    /// Authorized module names, ordered.
    pub fn authorized_imports(&self) -> impl Iterator<Item = &String> {
        self.authorized_imports.iter()
    }

    /// Whether `module` may be imported. A `pkg.*` entry authorizes `pkg`
    /// and its submodules.
    #[must_use]
    pub fn allows(&self, module: &str) -> bool {
        if self.authorized_imports.contains("*") || self.authorized_imports.contains(module) {
            return true;
        }
        self.authorized_imports.iter().any(|entry| {
            entry.strip_suffix(".*").is_some_and(|prefix| {
                module == prefix
                    || module
                        .strip_prefix(prefix)
                        .is_some_and(|rest| rest.starts_with('.'))
            })
        })
    }

    fn validate(&self) -> SandboxResult<()> {
        if self.timeout.is_zero() {
            return Err(SandboxError::Configuration {
                reason: "timeout must be greater than zero".into(),
            });
        }
        if self.max_output_bytes == 0 {
            return Err(SandboxError::Configuration {
                reason: "max_output_bytes must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Executor that interprets code in the current process.
#[derive(Clone, Debug, Default)]
pub struct LocalExecutor {
    config: LocalConfig,
}

impl LocalExecutor {
    /// Creates an executor with the supplied limits.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Configuration`] when a limit is zero.
    pub fn new(config: LocalConfig) -> SandboxResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Active limits.
    #[must_use]
    pub fn config(&self) -> &LocalConfig {
        &self.config
    }
}

/// Renders the offending source line the way a traceback would.
fn traceback(code: &str, line: Option<usize>) -> Option<String> {
    let line = line?;
    let text = code.lines().nth(line.checked_sub(1)?)?;
    Some(format!(
        "Code execution failed at line {line}:\n    {}",
        text.trim()
    ))
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    fn check_syntax(&self, code: &str) -> Result<(), String> {
        parse(code).map(|_| ()).map_err(|err| err.to_string())
    }

    async fn execute(
        &mut self,
        code: &str,
        state: &mut ExecutionState,
        host: &dyn CallableHost,
    ) -> ExecutionResult {
        let program = match parse(code) {
            Ok(program) => program,
            Err(err) => {
                debug!(error = %err, "code block failed to parse");
                let mut error = ErrorInfo::execution(err.to_string());
                if let Some(trace) = traceback(code, Some(err.line)) {
                    error = error.with_traceback(trace);
                }
                return ExecutionResult::failure(error, "");
            }
        };

        let max_output = self.config.max_output_bytes;
        let mut interpreter = Interpreter::new(host, &self.config);
        interpreter.restore(state);
        let outcome = tokio::time::timeout(self.config.timeout, interpreter.run(&program)).await;
        interpreter.save(state);

        let logs = truncate_output(interpreter.stdout(), max_output).into_owned();
        state.append_print_log(&logs);

        match outcome {
            Err(_) => {
                warn!(timeout = ?self.config.timeout, "code execution timed out");
                ExecutionResult::failure(
                    ErrorInfo::timeout(format!(
                        "code execution exceeded the {:?} timeout",
                        self.config.timeout
                    )),
                    logs,
                )
            }
            Ok(Err(err)) => {
                debug!(error = %err, line = ?err.line, "code block raised");
                let mut error = ErrorInfo::execution(err.to_string());
                if let Some(trace) = traceback(code, err.line) {
                    error = error.with_traceback(trace);
                }
                ExecutionResult::failure(error, logs)
            }
            Ok(Ok(completion)) => {
                let output = completion.value.to_json_lossy();
                if completion.final_answer {
                    debug!("code block produced a final answer");
                    return ExecutionResult::final_answer(output, logs);
                }
                let rendered = output.to_string();
                if rendered.len() > max_output {
                    let truncated = truncate_output(&rendered, max_output).into_owned();
                    return ExecutionResult::success(serde_json::Value::String(truncated), logs);
                }
                ExecutionResult::success(output, logs)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use agent_primitives::{
        CapabilityBuilder, CapabilityDescriptor, ErrorKind, Parameter, SemanticType,
    };
    use serde_json::{Map, Value, json};

    use crate::host::NoCallables;

    struct Calculator;

    #[async_trait]
    impl CallableHost for Calculator {
        fn callables(&self) -> Vec<CapabilityDescriptor> {
            vec![
                CapabilityDescriptor::builder("divide")
                    .description("Divides a by b")
                    .parameter(Parameter::required("a", SemanticType::Number, "dividend"))
                    .and_then(|b| b.parameter(Parameter::required("b", SemanticType::Number, "divisor")))
                    .and_then(CapabilityBuilder::build)
                    .unwrap(),
            ]
        }

        async fn call(&self, name: &str, arguments: Map<String, Value>) -> Result<Value, ErrorInfo> {
            assert_eq!(name, "divide");
            let a = arguments["a"].as_f64().unwrap_or_default();
            let b = arguments["b"].as_f64().unwrap_or_default();
            if b == 0.0 {
                return Err(ErrorInfo::tool("division by zero"));
            }
            Ok(json!(a / b))
        }
    }

    async fn execute(code: &str, state: &mut ExecutionState) -> ExecutionResult {
        LocalExecutor::default().execute(code, state, &NoCallables).await
    }

    #[tokio::test]
    async fn final_answer_ends_the_block() {
        let mut state = ExecutionState::new();
        let result = execute("final_answer(2 + 2)", &mut state).await;
        assert!(result.is_final_answer());
        assert_eq!(result.output(), &json!(4));
    }

    #[tokio::test]
    async fn variables_persist_between_blocks() {
        let mut state = ExecutionState::new();
        let first = execute("import math\nx = 21\ndef double(v):\n    return v * 2", &mut state).await;
        assert!(first.error().is_none());
        let second = execute("double(x) + math.floor(0.5)", &mut state).await;
        assert_eq!(second.output(), &json!(42));
        assert_eq!(state.variable("x"), Some(&json!(21)));
    }

    #[tokio::test]
    async fn printed_output_becomes_logs() {
        let mut state = ExecutionState::new();
        let result = execute("for i in range(3):\n    print(i)", &mut state).await;
        assert_eq!(result.logs(), "0\n1\n2\n");
        assert_eq!(state.print_log(), "0\n1\n2\n");
    }

    #[tokio::test]
    async fn disallowed_imports_are_execution_errors() {
        let mut state = ExecutionState::new();
        let result = execute("import subprocess", &mut state).await;
        let error = result.error().unwrap();
        assert_eq!(error.kind(), ErrorKind::Execution);
        assert!(error.message().starts_with("ImportError"));
        assert!(error.traceback().unwrap().contains("import subprocess"));
    }

    #[tokio::test]
    async fn syntax_errors_are_reported_without_running() {
        let mut state = ExecutionState::new();
        let result = execute("x = 1\nclass Foo:\n    pass", &mut state).await;
        let error = result.error().unwrap();
        assert_eq!(error.kind(), ErrorKind::Execution);
        assert!(error.message().contains("not supported"));
        assert!(state.variable("x").is_none());
        assert!(LocalExecutor::default().check_syntax("x = (1").is_err());
    }

    #[tokio::test]
    async fn hostile_nesting_is_classified_not_fatal() {
        let parens = format!("{}1{}", "(".repeat(1_000), ")".repeat(1_000));
        assert!(LocalExecutor::default().check_syntax(&parens).is_err());
        let mut state = ExecutionState::new();
        let result = execute(&parens, &mut state).await;
        assert_eq!(result.error().unwrap().kind(), ErrorKind::Execution);

        let result = execute("def f(n):\n    return f(n + 1)\nf(0)", &mut state).await;
        let error = result.error().unwrap();
        assert_eq!(error.kind(), ErrorKind::Execution);
        assert!(error.message().starts_with("RecursionError"));
    }

    #[tokio::test]
    async fn runaway_loops_time_out_and_keep_partial_state() {
        let config = LocalConfig::default()
            .with_timeout(Duration::from_millis(100))
            .with_max_operations(u64::MAX);
        let mut executor = LocalExecutor::new(config).unwrap();
        let mut state = ExecutionState::new();
        let result = executor
            .execute("started = True\nwhile True:\n    pass", &mut state, &NoCallables)
            .await;
        assert_eq!(result.error().unwrap().kind(), ErrorKind::Timeout);
        assert_eq!(state.variable("started"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn capabilities_are_callable_from_code() {
        let mut executor = LocalExecutor::default();
        let mut state = ExecutionState::new();
        let result = executor
            .execute("divide(9, b=3)", &mut state, &Calculator)
            .await;
        assert_eq!(result.output(), &json!(3.0));

        let result = executor
            .execute("divide(1, 0)", &mut state, &Calculator)
            .await;
        let error = result.error().unwrap();
        assert_eq!(error.kind(), ErrorKind::Execution);
        assert_eq!(
            error.message(),
            "ToolError: error calling `divide`: division by zero"
        );
    }

    #[tokio::test]
    async fn capability_names_cannot_be_rebound() {
        let mut state = ExecutionState::new();
        let result = LocalExecutor::default()
            .execute("divide = 3", &mut state, &Calculator)
            .await;
        assert!(result.error().unwrap().message().contains("cannot assign"));
    }

    #[test]
    fn wildcard_entries_authorize_submodules() {
        let config = LocalConfig::default().with_authorized_imports(["numpy.*"]);
        assert!(config.allows("numpy"));
        assert!(config.allows("numpy.linalg"));
        assert!(!config.allows("numpyx"));
        assert!(!config.allows("math"));
        assert!(LocalConfig::default().authorize_imports(["*"]).allows("os"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = LocalExecutor::new(LocalConfig::default().with_timeout(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, SandboxError::Configuration { .. }));
    }
}
