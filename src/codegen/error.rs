use std::fmt;

use thiserror::Error;

use crate::bytecode::verify::StackCheckError;
use crate::runtime::runtime_error::RuntimeError;

/// Every failure a backend reports through the single error channel.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    /// The caller broke the operation contract. Not recoverable; retrying the
    /// same sequence fails the same way.
    #[error("contract violation{}: {kind}", at_line(.line))]
    ContractViolation { kind: Violation, line: Option<u32> },

    /// A named binding could not be resolved at emit time.
    #[error("unresolved {kind} `{name}`{}", at_line(.line))]
    Resolution {
        kind: BindingKind,
        name: String,
        line: Option<u32>,
    },

    #[error("resource exhausted: {resource} exceeds limit of {limit}")]
    ResourceExhausted { resource: Resource, limit: usize },

    /// Raised while an immediate-mode backend executed the operation.
    #[error("{}{}", .error, at_line(.line))]
    Runtime {
        error: RuntimeError,
        line: Option<u32>,
    },

    /// The artifact was requested after an earlier failure.
    #[error("compilation aborted: {0}")]
    Aborted(Box<CompileError>),

    /// Emitted code failed static verification.
    #[error(transparent)]
    Verify(#[from] StackCheckError),

    #[error("artifact encoding failed: {0}")]
    Artifact(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("stack underflow: {op} needs {needed} value(s), {available} available")]
    StackUnderflow {
        op: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("{unit} ended with {depth} values on the stack (expected 0 or 1)")]
    UnbalancedUnit { unit: String, depth: usize },

    #[error("branch arms disagree: true arm leaves {true_arm}, false arm leaves {false_arm}")]
    UnbalancedBranch { true_arm: isize, false_arm: isize },

    #[error("{construct} callback must produce {expected} value(s), produced {produced}")]
    CallbackResult {
        construct: &'static str,
        expected: &'static str,
        produced: isize,
    },

    #[error("callback for {0} opened or closed a unit without balancing it")]
    CallbackLeakedUnit(&'static str),

    #[error("handle does not belong to the innermost open unit `{innermost}`")]
    HandleMismatch { innermost: String },

    #[error("handle was issued by a different compiler instance")]
    ForeignHandle,

    #[error("end_method cannot close the {0}")]
    WrongUnitKind(String),

    #[error("no unit is open")]
    NoOpenUnit,

    #[error("script already started")]
    ScriptAlreadyStarted,

    #[error("script ended while `{0}` is still open")]
    UnclosedUnit(String),

    #[error("yield outside of any method body")]
    YieldWithoutBlock,

    #[error("scope depth {depth} exceeds the {available} enclosing frame(s) reachable here")]
    ScopeDepth { depth: usize, available: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Constant,
    GlobalVariable,
    InstanceVariable,
    Method,
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BindingKind::Constant => "constant",
            BindingKind::GlobalVariable => "global variable",
            BindingKind::InstanceVariable => "instance variable",
            BindingKind::Method => "method",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    NestingDepth,
    ConstantPool,
    CodeObjects,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resource::NestingDepth => "nesting depth",
            Resource::ConstantPool => "constant pool",
            Resource::CodeObjects => "code object count",
        })
    }
}

fn at_line(line: &Option<u32>) -> String {
    match line {
        Some(line) => format!(" (line {})", line),
        None => String::new(),
    }
}

impl CompileError {
    pub fn violation(kind: Violation, line: Option<u32>) -> Self {
        CompileError::ContractViolation { kind, line }
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, CompileError::ContractViolation { .. })
    }

    pub fn violation_kind(&self) -> Option<&Violation> {
        match self {
            CompileError::ContractViolation { kind, .. } => Some(kind),
            CompileError::Aborted(inner) => inner.violation_kind(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_display_with_line() {
        let err = CompileError::violation(
            Violation::StackUnderflow {
                op: "assign_local_variable",
                needed: 1,
                available: 0,
            },
            Some(12),
        );

        let msg = err.to_string();
        assert!(msg.contains("contract violation (line 12)"));
        assert!(msg.contains("assign_local_variable needs 1"));
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_resolution_display() {
        let err = CompileError::Resolution {
            kind: BindingKind::Constant,
            name: "Foo".to_string(),
            line: None,
        };
        assert_eq!(err.to_string(), "unresolved constant `Foo`");
    }

    #[test]
    fn test_aborted_exposes_inner_violation() {
        let inner = CompileError::violation(Violation::NoOpenUnit, None);
        let err = CompileError::Aborted(Box::new(inner));

        assert_eq!(err.violation_kind(), Some(&Violation::NoOpenUnit));
        assert!(err.to_string().contains("no unit is open"));
    }

    #[test]
    fn test_error_implements_std_error() {
        let err = CompileError::ResourceExhausted {
            resource: Resource::NestingDepth,
            limit: 4,
        };
        let _: &dyn std::error::Error = &err;
        assert!(err.to_string().contains("nesting depth"));
    }
}
