use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoMethodError,
    ArgumentError,
    NameError,
    TypeError,
    ZeroDivisionError,
    IndexError,
    LocalJumpError,
    /// Call depth, step or stack size limit hit.
    LimitExceeded,
    /// Malformed bytecode or VM invariant broken.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NoMethodError => "NoMethodError",
            ErrorKind::ArgumentError => "ArgumentError",
            ErrorKind::NameError => "NameError",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ZeroDivisionError => "ZeroDivisionError",
            ErrorKind::IndexError => "IndexError",
            ErrorKind::LocalJumpError => "LocalJumpError",
            ErrorKind::LimitExceeded => "SystemStackError",
            ErrorKind::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
    pub call_stack: Vec<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime error: {}: {}", self.kind, self.message)?;

        if !self.call_stack.is_empty() {
            write!(f, "\n  call stack:")?;

            for (i, frame) in self.call_stack.iter().enumerate() {
                write!(f, "\n    {}: {}", i, frame)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            message: message.into(),
            call_stack: Vec::new(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Append a frame description, innermost first.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.call_stack.push(context.into());
        self
    }
}

pub fn no_method(name: &str, receiver: &crate::lang::value::Value) -> RuntimeError {
    RuntimeError::new(
        ErrorKind::NoMethodError,
        format!(
            "undefined method `{}' for {}:{}",
            name,
            receiver.inspect(),
            receiver.class_name()
        ),
    )
}

pub fn wrong_arity(given: usize, expected: usize) -> RuntimeError {
    RuntimeError::new(
        ErrorKind::ArgumentError,
        format!("wrong number of arguments ({} for {})", given, expected),
    )
}

pub fn type_error(expected: &str, got: &crate::lang::value::Value) -> RuntimeError {
    RuntimeError::new(
        ErrorKind::TypeError,
        format!("can't convert {} into {}", got.class_name(), expected),
    )
}

pub fn divided_by_zero() -> RuntimeError {
    RuntimeError::new(ErrorKind::ZeroDivisionError, "divided by 0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::value::Value;

    #[test]
    fn test_display_with_call_stack() {
        let err = no_method("frob", &Value::Fixnum(3))
            .with_context("block in each")
            .with_context("<main>:4");

        let msg = err.to_string();
        assert!(msg.contains("NoMethodError"));
        assert!(msg.contains("undefined method `frob' for 3:Fixnum"));
        assert!(msg.contains("0: block in each"));
        assert!(msg.contains("1: <main>:4"));
    }

    #[test]
    fn test_wrong_arity_message() {
        let err = wrong_arity(1, 2);
        assert_eq!(err.kind, ErrorKind::ArgumentError);
        assert!(err.message.contains("(1 for 2)"));
    }
}
