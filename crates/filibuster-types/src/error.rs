use thiserror;

/// Usage errors in the identity value objects.
///
/// These indicate broken instrumentation rather than a failing system under
/// test; an execution that surfaces one is reported as a failed iteration.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Instrumentation popped an execution index more times than it pushed.
    #[error("execution index pop on an empty callstack")]
    EmptyCallstackPop,
}
