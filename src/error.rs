use strum_macros::Display;

use thiserror::Error;

pub type Result<T, E = UloxError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("Scan error: {message} at line {line}, column {column}")]
pub struct ScanError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("Compile error: {message} at '{token}' (line {line}, column {column}) in chunk '{chunk}'")]
pub struct CompileError {
    pub message: String,
    pub token: String,
    pub line: usize,
    pub column: usize,
    pub chunk: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RuntimeErrorKind {
    TypeMismatch,
    UndefinedGlobal,
    UndefinedProperty,
    FreezeViolation,
    IndexOutOfRange,
    Arity,
    StackOverflow,
    NotCallable,
    /// Raised by `throw` and failed assertions; the test runner swallows it per case.
    Panic,
    Build,
    Yield,
    Internal,
}

/// A failure raised while executing bytecode, decorated with where it happened.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message} at ip:'{offset}' in chunk:'{chunk}' (line {line}).\n===Stack===\n{stack_dump}\n===CallStack===\n{call_stack}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub message: String,
    pub offset: usize,
    pub chunk: String,
    pub line: usize,
    pub stack_dump: String,
    pub call_stack: String,
}

impl RuntimeError {
    pub fn is_panic(&self) -> bool {
        self.kind == RuntimeErrorKind::Panic
    }
}

/// An undecorated runtime failure. Natives and object helpers return this; the
/// VM attaches instruction offset and stack dumps when it surfaces.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub kind: RuntimeErrorKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Fault { kind, message: message.into() }
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Fault::new(RuntimeErrorKind::Panic, message)
    }
}

/// Lets a native surface a failure from a nested host call. The location is
/// re-attached where the outer VM unwinds.
impl From<RuntimeError> for Fault {
    fn from(error: RuntimeError) -> Self {
        Fault::new(error.kind, error.message)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContextError {
    #[error("Library '{0}' is already registered")]
    DuplicateLibrary(String),
    #[error("Library '{0}' is not registered")]
    UnknownLibrary(String),
    #[error("Script '{0}' was not found")]
    ScriptNotFound(String),
    #[error("Could not read script '{name}': {reason}")]
    Unreadable { name: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UloxError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Context(#[from] ContextError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_names_its_kind() {
        let error = RuntimeError {
            kind: RuntimeErrorKind::FreezeViolation,
            message: "Cannot add 'b' to frozen 'T'.".to_string(),
            offset: 4,
            chunk: "main".to_string(),
            line: 2,
            stack_dump: String::new(),
            call_stack: String::new(),
        };
        assert_eq!(RuntimeErrorKind::IndexOutOfRange.to_string(), "IndexOutOfRange");
        assert!(error.to_string().starts_with("FreezeViolation: Cannot add 'b'"));
        assert_eq!(Fault::from(error).kind, RuntimeErrorKind::FreezeViolation);
    }
}
