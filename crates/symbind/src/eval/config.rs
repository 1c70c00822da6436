use crate::env;

/// Tunables for an [`ExpressionEvaluator`](super::ExpressionEvaluator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluatorConfig {
    /// Re-evaluate a value on `bind` when its dependencies are known and reject disagreements.
    pub validate_bindings: bool,
    /// Dump the evaluation context through `tracing` after every propagation pass.
    pub dump_after_propagation: bool,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            validate_bindings: true,
            dump_after_propagation: false,
        }
    }
}

impl EvaluatorConfig {
    /// Reads `SYMBIND_VALIDATE_BINDINGS` and `SYMBIND_DUMP_EVAL`, falling back to the defaults.
    pub fn from_env() -> Self {
        Self {
            validate_bindings: env::validate_bindings_enabled(),
            dump_after_propagation: env::dump_eval_enabled(),
        }
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.validate_bindings = enabled;
        self
    }

    pub fn with_dump_after_propagation(mut self, enabled: bool) -> Self {
        self.dump_after_propagation = enabled;
        self
    }
}
