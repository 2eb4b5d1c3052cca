//! Capabilities every agent carries.

use agent_primitives::{CapabilityBuilder, CapabilityDescriptor, Parameter, SemanticType};

/// Name of the capability whose invocation ends a run.
pub const FINAL_ANSWER: &str = "final_answer";

/// Descriptor of the built-in `final_answer(answer)` capability.
///
/// # Panics
///
/// Never in practice: the descriptor is static and valid.
#[must_use]
pub fn final_answer_descriptor() -> CapabilityDescriptor {
    CapabilityDescriptor::builder(FINAL_ANSWER)
        .description("Provides a final answer to the given problem and ends the task.")
        .parameter(Parameter::required(
            "answer",
            SemanticType::Any,
            "The final answer to the problem",
        ))
        .map(|builder| builder.output(SemanticType::Any))
        .and_then(CapabilityBuilder::build)
        .expect("static final_answer descriptor is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_answer_takes_one_argument() {
        let descriptor = final_answer_descriptor();
        assert_eq!(descriptor.name(), FINAL_ANSWER);
        assert_eq!(descriptor.parameters().len(), 1);
        assert!(descriptor.parameter("answer").is_some_and(Parameter::is_required));
    }
}
