//! Runtime object model and the bytecode VM.

pub mod builtins;
pub mod frame;
pub mod object_space;
pub mod runtime_error;
pub mod vm;

pub use runtime_error::{ErrorKind, RuntimeError};
pub use vm::{Vm, VmConfig};
