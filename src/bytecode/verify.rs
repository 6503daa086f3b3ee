use thiserror::Error;

use crate::bytecode::{CodeObject, Op, ProgramBc};

#[derive(Debug, Clone, Error)]
#[error("stack-check error in `{unit}`: {message}")]
pub struct StackCheckError {
    pub unit: String,
    pub message: String,
}

impl StackCheckError {
    fn new(unit: &str, message: impl Into<String>) -> Self {
        Self {
            unit: unit.to_string(),
            message: message.into(),
        }
    }
}

/// Returns (pops, pushes) for an op.
pub(crate) fn effect(op: &Op) -> (usize, usize) {
    use Op::*;
    match op {
        PushNil | PushTrue | PushFalse | PushSelf => (0, 1),
        PushFixnum(_) | PushBignum(_) | PushString(_) | PushSymbol(_) => (0, 1),

        Pop => (1, 0),
        Dup => (1, 2),

        GetLocal(_) | GetOuter { .. } | GetIvar(_) | GetGlobal(_) | GetConst(_) => (0, 1),
        SetLocal(_) | SetOuter { .. } | SetIvar(_) | SetGlobal(_) | SetConst(_) => (1, 0),

        MakeArray(n) => (*n as usize, 1),
        ToArray => (1, 1),

        Send { argc, receiver, .. } => (*argc as usize + usize::from(*receiver), 1),
        Yield { argc } => (*argc as usize, 1),
        MakeClosure(_) => (0, 1),
        DefineMethod { .. } | Alias { .. } => (0, 0),

        Not => (1, 1),

        Jump(_) => (0, 0),
        JumpIfFalse(_) | JumpIfTrue(_) => (1, 0),

        Return => (1, 0),
    }
}

/// Check stack effects along every control-flow path of a code object.
///
/// Each instruction must see the same height on every path reaching it,
/// no path may underflow, and every path must end in `Return` with exactly
/// one value on the stack. Returns the maximum height reached.
pub fn verify_code(code: &CodeObject) -> Result<usize, StackCheckError> {
    let ops = &code.ops;
    if ops.is_empty() {
        return Err(StackCheckError::new(&code.name, "empty code object"));
    }

    let mut heights: Vec<Option<usize>> = vec![None; ops.len()];
    let mut worklist = vec![(0usize, 0usize)];
    let mut max_height = 0;

    while let Some((ip, height)) = worklist.pop() {
        match heights[ip] {
            Some(seen) if seen == height => continue,
            Some(seen) => {
                return Err(StackCheckError::new(
                    &code.name,
                    format!(
                        "inconsistent stack height at ip={}: {} on one path, {} on another",
                        ip, seen, height
                    ),
                ));
            }
            None => heights[ip] = Some(height),
        }

        let op = &ops[ip];
        let (pops, pushes) = effect(op);
        if height < pops {
            return Err(StackCheckError::new(
                &code.name,
                format!(
                    "stack underflow at ip={}, op={:?}, needed {} items, had {}",
                    ip, op, pops, height
                ),
            ));
        }
        let after = height - pops + pushes;
        max_height = max_height.max(after).max(height);

        if let Op::Return = op {
            if height != 1 {
                return Err(StackCheckError::new(
                    &code.name,
                    format!("return at ip={} with {} values on the stack", ip, height),
                ));
            }
            continue;
        }

        let mut successors = Vec::with_capacity(2);
        if let Some(offset) = op.jump_offset() {
            let target = ip as i64 + offset as i64;
            if target < 0 || target >= ops.len() as i64 {
                return Err(StackCheckError::new(
                    &code.name,
                    format!("jump at ip={} targets {} outside the code", ip, target),
                ));
            }
            successors.push(target as usize);
        }
        if !matches!(op, Op::Jump(_)) {
            if ip + 1 >= ops.len() {
                return Err(StackCheckError::new(
                    &code.name,
                    format!("control falls off the end after ip={}", ip),
                ));
            }
            successors.push(ip + 1);
        }

        for next in successors {
            worklist.push((next, after));
        }
    }

    Ok(max_height)
}

/// Verify every code object and every cross-reference into the code table.
pub fn verify_program(program: &ProgramBc) -> Result<(), StackCheckError> {
    for code in &program.code {
        verify_code(code)?;

        for op in &code.ops {
            let target = match op {
                Op::MakeClosure(target) => Some(*target),
                Op::DefineMethod { code, .. } => Some(*code),
                Op::Send { block, .. } => *block,
                _ => None,
            };
            if let Some(target) = target {
                if target as usize >= program.code.len() {
                    return Err(StackCheckError::new(
                        &code.name,
                        format!("reference to missing code object {}", target),
                    ));
                }
            }
        }
    }
    Ok(())
}
