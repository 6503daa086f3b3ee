//! Kiln: a backend-agnostic code generation contract for a dynamic,
//! Ruby-like language, with a bytecode backend, a bytecode VM and an
//! immediate-mode interpreter backend.

pub mod bytecode;
pub mod codegen;
pub mod demos;
pub mod interp;
pub mod lang;
pub mod runtime;

pub use bytecode::BytecodeCompiler;
pub use codegen::{CompileError, Compiler, CompilerConfig};
pub use interp::Interpreter;

#[cfg(test)]
mod conformance;
