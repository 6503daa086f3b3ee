use serde::{Deserialize, Serialize};

// =============================================================================
// OP - Bytecode instructions
// =============================================================================
//
// Operands that name things (`u32`) index the program's constant pool; code
// operands index `ProgramBc::code`.

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    // literals
    PushNil,
    PushTrue,
    PushFalse,
    PushSelf,
    PushFixnum(i64),
    PushBignum(u32),
    /// Allocates a fresh string from the pooled text on every execution.
    PushString(u32),
    PushSymbol(u32),

    // stack ops
    Pop,
    Dup,

    // variables
    GetLocal(u32),
    SetLocal(u32),
    /// Local of the frame `depth` closure levels outward.
    GetOuter {
        index: u32,
        depth: u32,
    },
    SetOuter {
        index: u32,
        depth: u32,
    },
    GetIvar(u32),
    SetIvar(u32),
    GetGlobal(u32),
    SetGlobal(u32),
    GetConst(u32),
    SetConst(u32),

    // aggregates
    /// ( x1 .. xn -- aggregate )
    MakeArray(u32),
    /// ( aggregate -- array )
    ToArray,

    // ==========================================================================
    // Dispatch
    // ==========================================================================
    /// ( recv? args.. -- result ). Without a receiver the call goes to self.
    Send {
        name: u32,
        argc: u32,
        receiver: bool,
        block: Option<u32>,
    },
    /// ( arg? -- result )
    Yield {
        argc: u32,
    },
    /// ( -- proc ) capturing the current frame.
    MakeClosure(u32),
    DefineMethod {
        name: u32,
        code: u32,
    },
    Alias {
        new_name: u32,
        old_name: u32,
    },

    // logic
    Not,

    // ==========================================================================
    // Jumps: offset is relative to the jump's own ip. Conditional jumps pop
    // and test truthiness (only nil and false are falsy).
    // ==========================================================================
    Jump(i32),
    JumpIfFalse(i32),
    JumpIfTrue(i32),

    /// ( result -- ) leaves the unit.
    Return,
}

impl Op {
    pub fn jump_offset(&self) -> Option<i32> {
        match self {
            Op::Jump(offset) | Op::JumpIfFalse(offset) | Op::JumpIfTrue(offset) => Some(*offset),
            _ => None,
        }
    }
}
