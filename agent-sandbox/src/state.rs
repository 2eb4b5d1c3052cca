//! Evaluation state carried across the steps of one run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Variables, imports and definitions that persist between code blocks.
///
/// The owning agent keeps one state per run and clears it on reset. Values
/// are stored as JSON so every backend can read and write them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    #[serde(default)]
    variables: Map<String, Value>,
    #[serde(default)]
    imports: BTreeMap<String, String>,
    #[serde(default)]
    definitions: BTreeMap<String, String>,
    #[serde(default)]
    print_log: String,
}

impl ExecutionState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a variable's value.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Binds a variable, replacing any previous value.
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// All variables, ordered by name.
    #[must_use]
    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    /// Replaces every variable at once.
    pub fn replace_variables(&mut self, variables: Map<String, Value>) {
        self.variables = variables;
    }

    /// Imported names mapped to the module path they refer to, such as
    /// `np -> numpy` or `sqrt -> math.sqrt`.
    #[must_use]
    pub fn imports(&self) -> &BTreeMap<String, String> {
        &self.imports
    }

    /// Records an imported name.
    pub fn record_import(&mut self, name: impl Into<String>, target: impl Into<String>) {
        self.imports.insert(name.into(), target.into());
    }

    /// Source text of functions defined by earlier blocks, keyed by the name
    /// they are bound to.
    #[must_use]
    pub fn definitions(&self) -> &BTreeMap<String, String> {
        &self.definitions
    }

    /// Records a function definition.
    pub fn record_definition(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.definitions.insert(name.into(), source.into());
    }

    /// Everything printed during the run so far.
    #[must_use]
    pub fn print_log(&self) -> &str {
        &self.print_log
    }

    /// Appends printed output to the run log.
    pub fn append_print_log(&mut self, text: &str) {
        self.print_log.push_str(text);
    }

    /// Drops variables, imports and definitions while keeping the print log.
    pub(crate) fn clear_bindings(&mut self) {
        self.variables.clear();
        self.imports.clear();
        self.definitions.clear();
    }

    /// Clears everything.
    pub fn clear(&mut self) {
        self.clear_bindings();
        self.print_log.clear();
    }

    /// Returns `true` when nothing has been bound or printed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
            && self.imports.is_empty()
            && self.definitions.is_empty()
            && self.print_log.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_round_trips_through_json() {
        let mut state = ExecutionState::new();
        state.set_variable("x", json!(4));
        state.record_import("m", "math");
        state.append_print_log("hello\n");

        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: ExecutionState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn clear_resets_everything() {
        let mut state = ExecutionState::new();
        state.set_variable("x", json!(1));
        state.record_definition("f", "def f():\n    return 1");
        state.clear();
        assert!(state.is_empty());
    }
}
