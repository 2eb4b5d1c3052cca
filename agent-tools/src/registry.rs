//! Runtime registry for capability descriptors and their implementations.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use agent_primitives::CapabilityDescriptor;
use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Result alias for tool operations.
pub type ToolResult<T> = Result<T, ToolError>;

/// Boxed future returned by function-pointer tools.
pub type ToolFuture = Pin<Box<dyn Future<Output = ToolResult<Value>> + Send>>;

/// Trait implemented by tool executors.
///
/// Arguments arrive already validated and coerced against the tool's
/// descriptor, keyed by parameter name.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Invokes the tool with keyword arguments, returning its output.
    async fn invoke(&self, arguments: Map<String, Value>) -> ToolResult<Value>;
}

#[async_trait]
impl<F, Fut> Tool for F
where
    F: Send + Sync + Fn(Map<String, Value>) -> Fut,
    Fut: Future<Output = ToolResult<Value>> + Send,
{
    async fn invoke(&self, arguments: Map<String, Value>) -> ToolResult<Value> {
        (self)(arguments).await
    }
}

/// Handle returned by the registry for direct invocation.
#[derive(Clone)]
pub struct ToolHandle {
    descriptor: Arc<CapabilityDescriptor>,
    executor: Arc<dyn Tool>,
}

impl std::fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHandle")
            .field("name", &self.descriptor.name())
            .finish_non_exhaustive()
    }
}

impl ToolHandle {
    /// Returns the associated descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    /// Executes the underlying tool implementation.
    ///
    /// # Errors
    ///
    /// Propagates any [`ToolError::Execution`] returned by the implementation.
    pub async fn invoke(&self, arguments: Map<String, Value>) -> ToolResult<Value> {
        self.executor.invoke(arguments).await
    }
}

/// Registry that stores tool implementations keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<BTreeMap<String, ToolHandle>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("registered", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool implementation under its descriptor's name.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::DuplicateTool`] if the name is already present.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    pub fn register_tool<T>(&self, descriptor: CapabilityDescriptor, tool: T) -> ToolResult<()>
    where
        T: Tool + 'static,
    {
        self.register_shared(descriptor, Arc::new(tool))
    }

    /// Registers an already shared tool implementation.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::DuplicateTool`] if the name is already present.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    pub fn register_shared(
        &self,
        descriptor: CapabilityDescriptor,
        tool: Arc<dyn Tool>,
    ) -> ToolResult<()> {
        let mut inner = self.inner.write().expect("tool registry poisoned");
        let name = descriptor.name().to_owned();
        if inner.contains_key(&name) {
            return Err(ToolError::DuplicateTool { name });
        }

        debug!(tool = %name, "registered capability");
        inner.insert(
            name,
            ToolHandle {
                descriptor: Arc::new(descriptor),
                executor: tool,
            },
        );

        Ok(())
    }

    /// Returns a handle to the tool matching the supplied name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ToolHandle> {
        let inner = self.inner.read().ok()?;
        inner.get(name).cloned()
    }

    /// Returns `true` when a tool with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .is_ok_and(|inner| inner.contains_key(name))
    }

    /// Invokes a registered tool directly, bypassing schema validation.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::UnknownTool`] when the tool is not found or
    /// propagates [`ToolError::Execution`] when the implementation fails.
    pub async fn invoke(&self, name: &str, arguments: Map<String, Value>) -> ToolResult<Value> {
        let handle = self.get(name).ok_or_else(|| ToolError::UnknownTool {
            name: name.to_owned(),
        })?;
        handle.invoke(arguments).await
    }

    /// Lists all descriptors, ordered by name.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    #[must_use]
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        let inner = self.inner.read().expect("tool registry poisoned");
        inner
            .values()
            .map(|handle| handle.descriptor().clone())
            .collect()
    }

    /// Lists registered names, ordered.
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().expect("tool registry poisoned");
        inner.keys().cloned().collect()
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().map_or(0, |inner| inner.len())
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors produced by tool registration and invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Tool name collided with an existing registration.
    #[error("tool `{name}` is already registered")]
    DuplicateTool {
        /// Name of the offending tool.
        name: String,
    },

    /// Requested tool does not exist.
    #[error("tool `{name}` is not registered")]
    UnknownTool {
        /// Name of the missing tool.
        name: String,
    },

    /// Tool execution failed.
    #[error("{reason}")]
    Execution {
        /// Human-readable error returned by the tool implementation.
        reason: String,
    },
}

impl ToolError {
    /// Creates an execution error from the supplied reason.
    #[must_use]
    pub fn execution(reason: impl Into<String>) -> Self {
        Self::Execution {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use agent_primitives::{CapabilityBuilder, Parameter, SemanticType};
    use serde_json::json;

    fn echo() -> CapabilityDescriptor {
        CapabilityDescriptor::builder("echo")
            .description("Echo incoming payload")
            .parameter(Parameter::required("message", SemanticType::String, "text"))
            .and_then(CapabilityBuilder::build)
            .unwrap()
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn register_and_invoke_tool() {
        let registry = ToolRegistry::new();
        registry
            .register_tool(echo(), |input: Map<String, Value>| async move {
                Ok(input["message"].clone())
            })
            .unwrap();

        let output = registry
            .invoke("echo", args(json!({ "message": "hello" })))
            .await
            .unwrap();
        assert_eq!(output, json!("hello"));
        assert_eq!(registry.names(), ["echo"]);
    }

    #[tokio::test]
    async fn function_pointer_tools_register() {
        fn boxed(input: Map<String, Value>) -> ToolFuture {
            Box::pin(async move { Ok(Value::Object(input)) })
        }

        let registry = ToolRegistry::new();
        registry.register_tool(echo(), boxed).unwrap();
        let output = registry
            .invoke("echo", args(json!({ "message": "fn" })))
            .await
            .unwrap();
        assert_eq!(output, json!({ "message": "fn" }));
    }

    #[tokio::test]
    async fn duplicate_registration_errors() {
        let registry = ToolRegistry::new();

        registry
            .register_tool(echo(), |input: Map<String, Value>| async move {
                Ok(Value::Object(input))
            })
            .unwrap();

        let err = registry
            .register_tool(echo(), |_: Map<String, Value>| async move { Ok(Value::Null) })
            .expect_err("duplicate registration should fail");

        assert!(matches!(err, ToolError::DuplicateTool { name } if name == "echo"));
    }

    #[tokio::test]
    async fn unknown_tool_errors() {
        let registry = ToolRegistry::new();
        let err = registry
            .invoke("missing", Map::new())
            .await
            .expect_err("unknown tool should error");

        assert!(matches!(err, ToolError::UnknownTool { name } if name == "missing"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn execution_errors_surface_reason() {
        let registry = ToolRegistry::new();
        registry
            .register_tool(echo(), |_: Map<String, Value>| async move {
                Err(ToolError::execution("backend offline"))
            })
            .unwrap();

        let err = registry
            .invoke("echo", args(json!({ "message": "x" })))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "backend offline");
    }
}
