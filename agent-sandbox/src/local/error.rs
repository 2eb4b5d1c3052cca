//! Runtime errors and non-local control flow of the interpreter.

use std::fmt;

use super::value::Value;

/// A Python-style exception raised by executing code.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RuntimeError {
    pub(crate) kind: &'static str,
    pub(crate) message: String,
    pub(crate) line: Option<usize>,
}

impl RuntimeError {
    pub(crate) fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
        }
    }

    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub(crate) fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub(crate) fn name_error(name: &str) -> Self {
        Self::new("NameError", format!("name '{name}' is not defined"))
    }

    pub(crate) fn attribute_error(owner: &str, name: &str) -> Self {
        Self::new(
            "AttributeError",
            format!("'{owner}' object has no attribute '{name}'"),
        )
    }

    pub(crate) fn index_error(message: impl Into<String>) -> Self {
        Self::new("IndexError", message)
    }

    pub(crate) fn key_error(key: &Value) -> Self {
        Self::new("KeyError", key.repr())
    }

    pub(crate) fn zero_division(message: impl Into<String>) -> Self {
        Self::new("ZeroDivisionError", message)
    }

    pub(crate) fn overflow() -> Self {
        Self::new("OverflowError", "integer result too large")
    }

    pub(crate) fn syntax(message: impl Into<String>) -> Self {
        Self::new("SyntaxError", message)
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Anything that unwinds the evaluation stack.
#[derive(Debug)]
pub(crate) enum Interrupt {
    Error(RuntimeError),
    FinalAnswer(Value),
    Return(Value),
    Break,
    Continue,
}

impl Interrupt {
    /// Attaches a line to errors that do not carry one yet.
    pub(crate) fn at_line(self, line: usize) -> Self {
        match self {
            Self::Error(mut error) => {
                error.line.get_or_insert(line);
                Self::Error(error)
            }
            other => other,
        }
    }
}

impl From<RuntimeError> for Interrupt {
    fn from(error: RuntimeError) -> Self {
        Self::Error(error)
    }
}

pub(crate) type Eval<T> = Result<T, Interrupt>;
