//! Out-of-process executor.
//!
//! Code is written to the stdin of an `exec` command running with a cleared
//! environment in a private working directory. An optional `launch` command
//! starts a session (a container, a VM) whose id, read from its stdout, is
//! substituted for `{session}` in later commands; `shutdown` ends it.
//!
//! State crosses the boundary as JSON. The variables map is passed in the
//! `AGENT_STATE` environment variable and the child reports back with
//! protocol lines on stdout:
//!
//! ```text
//! __final_answer__:<json>
//! __state__:<json object>
//! ```

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use agent_primitives::{ErrorInfo, ExecutionResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::host::CallableHost;
use crate::output::{DEFAULT_MAX_OUTPUT_BYTES, truncate_output};
use crate::state::ExecutionState;
use crate::{Executor, SandboxError, SandboxResult};

/// Prefix of the line reporting a final answer.
pub const FINAL_ANSWER_MARKER: &str = "__final_answer__:";
/// Prefix of the line reporting the updated variables.
pub const STATE_MARKER: &str = "__state__:";
/// Environment variable carrying the variables into the child.
pub const STATE_ENV: &str = "AGENT_STATE";
/// Bytes kept from each end of a stream beyond the output budget, so the
/// trailing protocol lines survive a noisy child.
const CAPTURE_MARGIN_BYTES: usize = 1024 * 1024;

/// Python wrapper implementing the state protocol around the submitted code,
/// which replaces `{code}` as a string literal.
pub const PYTHON_HARNESS: &str = r#"import json as _json, os as _os, sys as _sys, traceback as _tb
_scope = dict(_json.loads(_os.environ.get("AGENT_STATE") or "{}"))
class _FinalAnswer(BaseException):
    def __init__(self, value):
        self.value = value
def final_answer(answer):
    raise _FinalAnswer(answer)
_scope["final_answer"] = final_answer
def _emit(tag, value):
    _sys.stdout.flush()
    print(tag + _json.dumps(value, default=str), flush=True)
def _snapshot():
    out = {}
    for key, value in _scope.items():
        if key.startswith("_") or key == "final_answer":
            continue
        try:
            out[key] = _json.loads(_json.dumps(value))
        except (TypeError, ValueError):
            pass
    return out
_status = 0
try:
    exec(compile({code}, "<code>", "exec"), _scope)
except _FinalAnswer as _answer:
    _emit("__final_answer__:", _answer.value)
except BaseException:
    _tb.print_exc()
    _status = 1
_emit("__state__:", _snapshot())
_sys.exit(_status)
"#;

/// A program and its arguments. `{session}` and `{packages}` placeholders
/// are substituted before spawning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

impl CommandSpec {
    /// Creates a command without arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Program to run.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments, unsubstituted.
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Resolves placeholders. An argument that is exactly `{packages}`
    /// expands to one argument per package.
    fn resolve(&self, session: Option<&str>, packages: &[String]) -> (String, Vec<String>) {
        let substitute = |text: &str| {
            text.replace("{session}", session.unwrap_or_default())
                .replace("{packages}", &packages.join(" "))
        };
        let mut args = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            if arg == "{packages}" {
                args.extend(packages.iter().cloned());
            } else {
                args.push(substitute(arg));
            }
        }
        (substitute(&self.program), args)
    }
}

/// Configuration of a [`ProcessExecutor`].
#[derive(Clone, Debug)]
pub struct ProcessConfig {
    exec: CommandSpec,
    launch: Option<CommandSpec>,
    shutdown: Option<CommandSpec>,
    harness: Option<String>,
    packages: Vec<String>,
    env_passthrough: Vec<String>,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ProcessConfig {
    /// Runs each block with `exec`, feeding the code on stdin unchanged.
    #[must_use]
    pub fn new(exec: CommandSpec) -> Self {
        Self {
            exec,
            launch: None,
            shutdown: None,
            harness: None,
            packages: Vec::new(),
            env_passthrough: vec!["PATH".to_owned()],
            timeout: Duration::from_secs(30),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// Runs each block with an isolated `python3 -I -` wrapped in
    /// [`PYTHON_HARNESS`].
    #[must_use]
    pub fn python() -> Self {
        Self::new(CommandSpec::new("python3").args(["-I", "-"])).with_harness(PYTHON_HARNESS)
    }

    /// Command starting a session before the first block.
    #[must_use]
    pub fn with_launch(mut self, launch: CommandSpec) -> Self {
        self.launch = Some(launch);
        self
    }

    /// Command ending the session on close.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CommandSpec) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Wraps the code in `template`, replacing `{code}` with the code as a
    /// JSON string literal.
    #[must_use]
    pub fn with_harness(mut self, template: impl Into<String>) -> Self {
        self.harness = Some(template.into());
        self
    }

    /// Packages substituted for `{packages}`.
    #[must_use]
    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = packages.into_iter().map(Into::into).collect();
        self
    }

    /// Environment variables copied from the parent. Everything else is
    /// cleared.
    #[must_use]
    pub fn with_env_passthrough<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.env_passthrough = names.into_iter().map(Into::into).collect();
        self
    }

    /// Wall-clock limit for each command.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Byte budget for captured output.
    #[must_use]
    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Command running each block.
    #[must_use]
    pub fn exec(&self) -> &CommandSpec {
        &self.exec
    }

    /// Wall-clock limit for each command.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    fn validate(&self) -> SandboxResult<()> {
        let commands = [Some(&self.exec), self.launch.as_ref(), self.shutdown.as_ref()];
        if commands
            .into_iter()
            .flatten()
            .any(|command| command.program.trim().is_empty())
        {
            return Err(SandboxError::Configuration {
                reason: "command program must not be empty".into(),
            });
        }
        if self.timeout.is_zero() {
            return Err(SandboxError::Configuration {
                reason: "timeout must be greater than zero".into(),
            });
        }
        if self
            .harness
            .as_ref()
            .is_some_and(|harness| !harness.contains("{code}"))
        {
            return Err(SandboxError::Configuration {
                reason: "harness template must contain `{code}`".into(),
            });
        }
        Ok(())
    }
}

/// Output of a finished child process.
struct Captured {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

enum RunFailure {
    Spawn(String),
    Io(String),
    TimedOut,
}

/// Executor that runs each block in a separate process.
#[derive(Debug)]
pub struct ProcessExecutor {
    config: ProcessConfig,
    workdir: PathBuf,
    session: Option<String>,
    closed: bool,
}

impl ProcessExecutor {
    /// Creates the executor and its private working directory. The session,
    /// if any, is launched on first use.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Configuration`] for unusable settings and
    /// [`SandboxError::Io`] when the working directory cannot be created.
    pub fn new(config: ProcessConfig) -> SandboxResult<Self> {
        config.validate()?;
        let workdir = std::env::temp_dir().join(format!("agent-sandbox-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&workdir)?;
        Ok(Self {
            config,
            workdir,
            session: None,
            closed: false,
        })
    }

    /// Identifier printed by the launch command, once launched.
    #[must_use]
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Private working directory of the child processes.
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.workdir
    }

    const fn capture_limit(&self) -> usize {
        self.config.max_output_bytes.saturating_add(CAPTURE_MARGIN_BYTES)
    }

    fn command(&self, spec: &CommandSpec) -> TokioCommand {
        self.command_in(spec, self.session.as_deref())
    }

    fn command_in(&self, spec: &CommandSpec, session: Option<&str>) -> TokioCommand {
        let (program, args) = spec.resolve(session, &self.config.packages);
        let mut command = TokioCommand::new(program);
        command
            .args(args)
            .env_clear()
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for name in &self.config.env_passthrough {
            if let Ok(value) = std::env::var(name) {
                command.env(name, value);
            }
        }
        command
    }

    async fn ensure_session(&mut self) -> Result<(), ErrorInfo> {
        let Some(launch) = self.config.launch.clone() else {
            return Ok(());
        };
        if self.session.is_some() {
            return Ok(());
        }
        if self.closed {
            return Err(ErrorInfo::infrastructure("executor has been closed"));
        }

        let command = self.command(&launch);
        let captured = run_command(command, None, self.config.timeout, self.capture_limit())
            .await
            .map_err(|failure| {
                ErrorInfo::infrastructure(format!(
                    "launch command failed: {}",
                    describe_failure(&failure, self.config.timeout)
                ))
            })?;
        if !captured.status.success() {
            return Err(ErrorInfo::infrastructure(format!(
                "launch command exited with {}: {}",
                captured.status,
                captured.stderr.trim()
            )));
        }
        let session = captured.stdout.trim().to_owned();
        info!(program = %launch.program, session = %session, "sandbox session launched");
        self.session = Some(session);
        Ok(())
    }

    fn render(&self, code: &str) -> String {
        match &self.config.harness {
            Some(template) => {
                let literal = Value::String(code.to_owned()).to_string();
                template.replace("{code}", &literal)
            }
            None => code.to_owned(),
        }
    }

    fn remove_workdir(&self) -> SandboxResult<()> {
        match std::fs::remove_dir_all(&self.workdir) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

fn describe_failure(failure: &RunFailure, timeout: Duration) -> String {
    match failure {
        RunFailure::Spawn(reason) | RunFailure::Io(reason) => reason.clone(),
        RunFailure::TimedOut => format!("exceeded the {timeout:?} timeout"),
    }
}

/// Drains `reader` to its end, keeping at most `limit` bytes from its head
/// and `limit` from its tail.
async fn capture<R>(mut reader: R, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut tail: VecDeque<u8> = VecDeque::new();
    let mut omitted = 0usize;
    let mut chunk = vec![0u8; 8 * 1024];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        let mut bytes = &chunk[..read];
        if head.len() < limit {
            let taken = bytes.len().min(limit - head.len());
            head.extend_from_slice(&bytes[..taken]);
            bytes = &bytes[taken..];
        }
        tail.extend(bytes);
        if tail.len() > limit {
            let excess = tail.len() - limit;
            tail.drain(..excess);
            omitted += excess;
        }
    }
    if omitted > 0 {
        debug!(omitted_bytes = omitted, "process output exceeded the capture limit");
    }
    head.extend(tail);
    Ok(head)
}

async fn run_command(
    mut command: TokioCommand,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    capture_limit: usize,
) -> Result<Captured, RunFailure> {
    let mut child = command
        .spawn()
        .map_err(|err| RunFailure::Spawn(format!("failed to start process: {err}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RunFailure::Io("process stdout is unavailable".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RunFailure::Io("process stderr is unavailable".into()))?;
    let stdout_task = tokio::spawn(capture(stdout, capture_limit));
    let stderr_task = tokio::spawn(capture(stderr, capture_limit));

    let pipe = child.stdin.take();
    let stdin_task = tokio::spawn(async move {
        let (Some(mut pipe), Some(input)) = (pipe, stdin) else {
            return Ok::<(), std::io::Error>(());
        };
        match pipe.write_all(&input).await {
            // The child may legitimately exit without reading its input.
            Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
            result => result,
        }
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(result) => result.map_err(|err| RunFailure::Io(format!("failed waiting for process: {err}")))?,
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            stdin_task.abort();
            stdout_task.abort();
            stderr_task.abort();
            return Err(RunFailure::TimedOut);
        }
    };

    stdin_task
        .await
        .map_err(|err| RunFailure::Io(format!("failed joining stdin writer: {err}")))?
        .map_err(|err| RunFailure::Io(format!("failed to write stdin: {err}")))?;
    let read = |joined: Result<std::io::Result<Vec<u8>>, tokio::task::JoinError>, stream: &str| {
        joined
            .map_err(|err| RunFailure::Io(format!("failed joining {stream} reader: {err}")))?
            .map_err(|err| RunFailure::Io(format!("failed reading {stream}: {err}")))
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    };
    let stdout = read(stdout_task.await, "stdout")?;
    let stderr = read(stderr_task.await, "stderr")?;
    Ok(Captured {
        status,
        stdout,
        stderr,
    })
}

/// Splits protocol lines out of the child's stdout.
fn parse_protocol(stdout: &str) -> (String, Option<Value>, Option<Value>) {
    let mut logs = String::new();
    let mut answer = None;
    let mut variables = None;
    for line in stdout.split_inclusive('\n') {
        let marker = [FINAL_ANSWER_MARKER, STATE_MARKER]
            .into_iter()
            .filter_map(|marker| line.find(marker).map(|index| (index, marker)))
            .min_by_key(|(index, _)| *index);
        let Some((index, marker)) = marker else {
            logs.push_str(line);
            continue;
        };
        logs.push_str(&line[..index]);
        let payload = line[index + marker.len()..].trim();
        let parsed = serde_json::from_str::<Value>(payload)
            .unwrap_or_else(|_| Value::String(payload.to_owned()));
        if marker == FINAL_ANSWER_MARKER {
            answer = Some(parsed);
        } else {
            variables = Some(parsed);
        }
    }
    (logs, answer, variables)
}

/// Last non-empty stderr line, usually the exception summary.
fn summary(stderr: &str, status: ExitStatus) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map_or_else(|| format!("process exited with {status}"), str::to_owned)
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(
        &mut self,
        code: &str,
        state: &mut ExecutionState,
        host: &dyn CallableHost,
    ) -> ExecutionResult {
        if let Err(error) = self.ensure_session().await {
            warn!(error = %error, "sandbox session unavailable");
            return ExecutionResult::failure(error, "");
        }
        if !host.callables().is_empty() {
            debug!("capabilities are not reachable from out-of-process code");
        }

        let started = Instant::now();
        let mut command = self.command(&self.config.exec);
        command.env(STATE_ENV, Value::Object(state.variables().clone()).to_string());
        let input = self.render(code).into_bytes();
        let timeout = self.config.timeout;

        let captured = match run_command(command, Some(input), timeout, self.capture_limit()).await {
            Ok(captured) => captured,
            Err(RunFailure::TimedOut) => {
                warn!(timeout = ?timeout, "process execution timed out");
                return ExecutionResult::failure(
                    ErrorInfo::timeout(format!("code execution exceeded the {timeout:?} timeout")),
                    "",
                );
            }
            Err(failure) => {
                warn!(reason = %describe_failure(&failure, timeout), "process execution failed to run");
                return ExecutionResult::failure(
                    ErrorInfo::infrastructure(describe_failure(&failure, timeout)),
                    "",
                );
            }
        };

        let (logs, answer, variables) = parse_protocol(&captured.stdout);
        let logs = truncate_output(&logs, self.config.max_output_bytes).into_owned();
        state.append_print_log(&logs);
        if let Some(Value::Object(variables)) = variables {
            state.replace_variables(variables);
        }

        debug!(
            status = %captured.status,
            duration_ms = started.elapsed().as_millis(),
            stdout_bytes = captured.stdout.len(),
            stderr_bytes = captured.stderr.len(),
            "process execution finished"
        );

        if !captured.status.success() {
            let stderr = truncate_output(&captured.stderr, self.config.max_output_bytes);
            let error = ErrorInfo::execution(summary(&captured.stderr, captured.status))
                .with_traceback(stderr.into_owned());
            return ExecutionResult::failure(error, logs);
        }
        match answer {
            Some(answer) => ExecutionResult::final_answer(answer, logs),
            None => ExecutionResult::success(Value::Null, logs),
        }
    }

    async fn close(&mut self) -> SandboxResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let session = self.session.take();
        let shutdown = self.config.shutdown.clone();
        if let (Some(session), Some(shutdown)) = (session, shutdown) {
            let command = self.command_in(&shutdown, Some(&session));
            let captured = run_command(command, None, self.config.timeout, self.capture_limit())
                .await
                .map_err(|failure| SandboxError::Shutdown {
                    session: session.clone(),
                    reason: describe_failure(&failure, self.config.timeout),
                })?;
            if !captured.status.success() {
                return Err(SandboxError::Shutdown {
                    session,
                    reason: format!("exited with {}: {}", captured.status, captured.stderr.trim()),
                });
            }
            info!(session = %session, "sandbox session shut down");
        }
        self.remove_workdir()
    }
}

impl Drop for ProcessExecutor {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let (Some(session), Some(shutdown)) = (self.session.take(), &self.config.shutdown) {
            let (program, args) = shutdown.resolve(Some(&session), &self.config.packages);
            let result = std::process::Command::new(program)
                .args(args)
                .env_clear()
                .envs(
                    self.config
                        .env_passthrough
                        .iter()
                        .filter_map(|name| std::env::var(name).ok().map(|value| (name, value))),
                )
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            match result {
                Ok(status) if status.success() => {
                    debug!(session = %session, "sandbox session shut down on drop");
                }
                Ok(status) => warn!(session = %session, %status, "shutdown on drop failed"),
                Err(err) => warn!(session = %session, error = %err, "shutdown on drop failed"),
            }
        }
        let _ = std::fs::remove_dir_all(&self.workdir);
    }
}
