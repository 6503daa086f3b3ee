pub mod builder;
pub mod compile;
pub mod disasm;
pub mod emit;
pub mod ir;
pub mod op;
pub mod verify;

pub use compile::BytecodeCompiler;
pub use ir::{CodeObject, Constant, ConstantPool, LineEntry, ProgramBc};
pub use op::Op;
