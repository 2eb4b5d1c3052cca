//! Access to agent capabilities from executing code.

use agent_primitives::{CapabilityDescriptor, ErrorInfo};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Resolves calls made by executing code to the agent's capabilities.
///
/// The dispatcher implements this over the tool registry and managed agents,
/// so code sees the same capability set as structured calls.
#[async_trait]
pub trait CallableHost: Send + Sync {
    /// Descriptors of every capability callable from code.
    fn callables(&self) -> Vec<CapabilityDescriptor>;

    /// Descriptor of a single capability.
    fn callable(&self, name: &str) -> Option<CapabilityDescriptor> {
        self.callables()
            .into_iter()
            .find(|descriptor| descriptor.name() == name)
    }

    /// Invokes a capability with keyword arguments.
    ///
    /// # Errors
    ///
    /// Returns the classified error produced by validation or invocation.
    async fn call(&self, name: &str, arguments: Map<String, Value>) -> Result<Value, ErrorInfo>;
}

/// Host exposing no capabilities.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCallables;

#[async_trait]
impl CallableHost for NoCallables {
    fn callables(&self) -> Vec<CapabilityDescriptor> {
        Vec::new()
    }

    async fn call(&self, name: &str, _arguments: Map<String, Value>) -> Result<Value, ErrorInfo> {
        Err(ErrorInfo::unknown_capability(name, &[]))
    }
}
