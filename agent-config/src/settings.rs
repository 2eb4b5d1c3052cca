//! Strongly typed agent settings.

use std::path::Path;
use std::time::Duration;

use agent_primitives::{ActionMode, validate_identifier};
use agent_sandbox::local::DEFAULT_AUTHORIZED_IMPORTS;
use agent_sandbox::{
    CommandSpec, Executor, LocalConfig, LocalExecutor, ProcessConfig, ProcessExecutor,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ConfigError, ConfigResult};

/// Settings of one agent, usually read from a TOML file.
///
/// ```toml
/// [agent]
/// name = "researcher"
/// mode = "tool-calling"
/// max_steps = 10
///
/// [executor]
/// kind = "local"
/// authorized_imports = ["math", "re"]
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSettings {
    /// `[agent]` section.
    pub agent: AgentSection,
    /// `[executor]` section.
    pub executor: ExecutorSection,
}

/// Loop behaviour.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSection {
    /// Agent name, also its capability name when managed.
    pub name: String,
    /// Description shown to a manager agent.
    pub description: Option<String>,
    /// Action format expected from the model.
    pub mode: ActionMode,
    /// Action step budget.
    pub max_steps: u32,
    /// Plan before step 1 and then every `planning_interval` steps.
    pub planning_interval: Option<u32>,
    /// Limit for one model call.
    pub model_timeout_secs: u64,
    /// Wall-clock limit for a whole run.
    pub run_timeout_secs: Option<u64>,
    /// Ask for a best-effort answer when the budget runs out.
    pub summarize_on_exhaustion: bool,
    /// Request `{thought, code}` JSON instead of fenced code.
    pub structured_outputs: bool,
    /// Extra instructions appended to the system prompt.
    pub instructions: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: "agent".to_owned(),
            description: None,
            mode: ActionMode::Code,
            max_steps: 20,
            planning_interval: None,
            model_timeout_secs: 120,
            run_timeout_secs: None,
            summarize_on_exhaustion: true,
            structured_outputs: false,
            instructions: None,
        }
    }
}

impl AgentSection {
    /// Model call limit as a [`Duration`].
    #[must_use]
    pub const fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    /// Run limit as a [`Duration`].
    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

/// Which execution backend runs code actions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    /// In-process restricted interpreter.
    #[default]
    Local,
    /// Separate process, optionally inside a launched session.
    Process,
}

/// Execution backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorSection {
    /// Backend kind.
    pub kind: ExecutorKind,
    /// Limit for one code action.
    pub timeout_secs: u64,
    /// Captured output budget.
    pub max_output_bytes: usize,
    /// Interpreter operation budget (local backend).
    pub max_operations: Option<u64>,
    /// Importable modules; `"*"` allows all, `"pkg.*"` a package.
    pub authorized_imports: Vec<String>,
    /// Session start command (process backend).
    pub launch: Option<CommandSpec>,
    /// Command receiving each code block on stdin (process backend).
    pub exec: Option<CommandSpec>,
    /// Session end command (process backend).
    pub shutdown: Option<CommandSpec>,
    /// Packages substituted into `{packages}`.
    pub packages: Vec<String>,
    /// Environment variables passed through to the child.
    pub env: Vec<String>,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Local,
            timeout_secs: 30,
            max_output_bytes: agent_sandbox::DEFAULT_MAX_OUTPUT_BYTES,
            max_operations: None,
            authorized_imports: DEFAULT_AUTHORIZED_IMPORTS
                .iter()
                .map(|module| (*module).to_owned())
                .collect(),
            launch: None,
            exec: None,
            shutdown: None,
            packages: Vec::new(),
            env: vec!["PATH".to_owned()],
        }
    }
}

impl ExecutorSection {
    /// Code action limit as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Configuration of the local backend.
    #[must_use]
    pub fn local_config(&self) -> LocalConfig {
        let config = LocalConfig::default()
            .with_timeout(self.timeout())
            .with_max_output_bytes(self.max_output_bytes)
            .with_authorized_imports(self.authorized_imports.iter().cloned());
        match self.max_operations {
            Some(limit) => config.with_max_operations(limit),
            None => config,
        }
    }

    /// Configuration of the process backend. Without an `exec` command the
    /// code runs under an isolated `python3`.
    #[must_use]
    pub fn process_config(&self) -> ProcessConfig {
        let mut config = match &self.exec {
            Some(exec) => ProcessConfig::new(exec.clone()),
            None => ProcessConfig::python(),
        };
        if let Some(launch) = &self.launch {
            config = config.with_launch(launch.clone());
        }
        if let Some(shutdown) = &self.shutdown {
            config = config.with_shutdown(shutdown.clone());
        }
        config
            .with_packages(self.packages.iter().cloned())
            .with_env_passthrough(self.env.iter().cloned())
            .with_timeout(self.timeout())
            .with_max_output_bytes(self.max_output_bytes)
    }

    /// Builds the selected backend.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Executor`] when the backend rejects its
    /// configuration or cannot prepare its resources.
    pub fn build_executor(&self) -> ConfigResult<Box<dyn Executor>> {
        debug!(kind = ?self.kind, "building executor from settings");
        Ok(match self.kind {
            ExecutorKind::Local => Box::new(LocalExecutor::new(self.local_config())?),
            ExecutorKind::Process => Box::new(ProcessExecutor::new(self.process_config())?),
        })
    }
}

impl AgentSettings {
    /// Parses and validates settings from TOML text. Missing sections and
    /// keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(input: &str) -> ConfigResult<Self> {
        let settings: Self = toml::from_str(input)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read, otherwise
    /// the errors of [`Self::from_toml_str`].
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Checks values the type system cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending key.
    pub fn validate(&self) -> ConfigResult<()> {
        validate_identifier(&self.agent.name)
            .map_err(|err| ConfigError::invalid("agent.name", err.to_string()))?;
        if self.agent.max_steps == 0 {
            return Err(ConfigError::invalid("agent.max_steps", "must be at least 1"));
        }
        if self.agent.planning_interval == Some(0) {
            return Err(ConfigError::invalid(
                "agent.planning_interval",
                "must be at least 1",
            ));
        }
        if self.agent.model_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "agent.model_timeout_secs",
                "must be at least 1",
            ));
        }
        if self.agent.run_timeout_secs == Some(0) {
            return Err(ConfigError::invalid(
                "agent.run_timeout_secs",
                "must be at least 1",
            ));
        }
        if self.executor.timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "executor.timeout_secs",
                "must be at least 1",
            ));
        }
        if self.executor.kind == ExecutorKind::Local
            && (self.executor.launch.is_some()
                || self.executor.exec.is_some()
                || self.executor.shutdown.is_some())
        {
            return Err(ConfigError::invalid(
                "executor.kind",
                "launch/exec/shutdown commands need kind = \"process\"",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use uuid::Uuid;

    #[test]
    fn defaults_need_no_file() {
        let settings = AgentSettings::from_toml_str("").unwrap();
        assert_eq!(settings, AgentSettings::default());
        assert_eq!(settings.agent.max_steps, 20);
        assert_eq!(settings.agent.mode, ActionMode::Code);
        assert!(settings.agent.summarize_on_exhaustion);
        assert_eq!(settings.executor.kind, ExecutorKind::Local);
        assert_eq!(settings.executor.timeout(), Duration::from_secs(30));
        assert!(settings.executor.authorized_imports.contains(&"math".to_owned()));
    }

    #[test]
    fn parses_full_settings() {
        let settings = AgentSettings::from_toml_str(
            r#"
            [agent]
            name = "researcher"
            description = "Looks things up"
            mode = "tool-calling"
            max_steps = 5
            planning_interval = 2
            run_timeout_secs = 600

            [executor]
            kind = "process"
            timeout_secs = 10
            packages = ["numpy"]
            env = ["PATH", "LANG"]
            launch = { program = "docker", args = ["run", "-d", "python:3.12", "sleep", "infinity"] }
            exec = { program = "docker", args = ["exec", "-i", "{session}", "python3", "-"] }
            shutdown = { program = "docker", args = ["rm", "-f", "{session}"] }
            "#,
        )
        .unwrap();

        assert_eq!(settings.agent.mode, ActionMode::ToolCalling);
        assert_eq!(settings.agent.planning_interval, Some(2));
        assert_eq!(settings.agent.run_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(settings.executor.kind, ExecutorKind::Process);
        let exec = settings.executor.exec.as_ref().unwrap();
        assert_eq!(exec.program(), "docker");
        assert_eq!(exec.arguments()[2], "{session}");
        assert_eq!(settings.executor.process_config().timeout(), Duration::from_secs(10));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = AgentSettings::from_toml_str("[agent]\nmax_steps = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field, .. } if field == "agent.max_steps"));

        let err = AgentSettings::from_toml_str("[agent]\nname = \"has space\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field, .. } if field == "agent.name"));

        let err = AgentSettings::from_toml_str(
            "[executor]\nexec = { program = \"python3\" }",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field, .. } if field == "executor.kind"));
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = AgentSettings::from_toml_str("[agent]\nmax_stepz = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!("agent-settings-{}.toml", Uuid::new_v4()));
        std::fs::write(&path, "[agent]\nmax_steps = 3\n").unwrap();
        let settings = AgentSettings::load(&path).unwrap();
        assert_eq!(settings.agent.max_steps, 3);
        let _ = std::fs::remove_file(&path);

        let err = AgentSettings::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn builds_the_local_executor() {
        let settings = AgentSettings::from_toml_str(
            "[executor]\nauthorized_imports = [\"math\"]\nmax_operations = 1000",
        )
        .unwrap();
        let config = settings.executor.local_config();
        assert!(config.allows("math"));
        assert!(!config.allows("json"));
        assert_eq!(config.max_operations(), 1000);
        let executor = settings.executor.build_executor().unwrap();
        assert_eq!(executor.name(), "local");
    }
}
