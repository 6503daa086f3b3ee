use tracing::trace;

use crate::bytecode::verify::effect;
use crate::bytecode::{CodeObject, LineEntry, Op};
use crate::codegen::stack::StackTracker;
use crate::codegen::{CompileError, UnitKind, Violation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Always,
    IfFalse,
    IfTrue,
}

impl JumpKind {
    fn op(self, offset: i32) -> Op {
        match self {
            JumpKind::Always => Op::Jump(offset),
            JumpKind::IfFalse => Op::JumpIfFalse(offset),
            JumpKind::IfTrue => Op::JumpIfTrue(offset),
        }
    }
}

/// Forward jump waiting for its target.
#[must_use = "an unpatched jump leaves a zero offset behind"]
#[derive(Debug)]
pub struct JumpPatch {
    ip: usize,
    kind: JumpKind,
}

/// Backward jump target.
#[derive(Debug, Clone, Copy)]
pub struct Label(usize);

/// Emits one code object while tracking its stack depth.
#[derive(Debug)]
pub struct CodeBuilder {
    code: CodeObject,
    stack: StackTracker,
    line: Option<u32>,
}

impl CodeBuilder {
    pub fn new(
        name: &str,
        kind: UnitKind,
        arity: usize,
        local_count: usize,
        check_stack: bool,
    ) -> Self {
        let mut code = CodeObject::new(name, kind);
        code.arity = arity as u32;
        code.local_count = local_count.max(arity) as u32;
        Self {
            code,
            stack: StackTracker::new(check_stack),
            line: None,
        }
    }

    pub fn with_locals(mut self, names: &[String]) -> Self {
        self.code.locals = names.to_vec();
        self.code.local_count = self.code.local_count.max(names.len() as u32);
        self
    }

    pub fn name(&self) -> &str {
        &self.code.name
    }

    pub fn kind(&self) -> UnitKind {
        self.code.kind
    }

    pub fn ops(&self) -> &[Op] {
        &self.code.ops
    }

    pub fn line(&self) -> Option<u32> {
        self.line
    }

    pub fn set_line(&mut self, line: u32) {
        self.line = Some(line);
        let ip = self.code.ops.len() as u32;
        match self.code.lines.last_mut() {
            Some(last) if last.ip == ip => last.line = line,
            Some(last) if last.line == line => {}
            _ => self.code.lines.push(LineEntry { ip, line }),
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.depth()
    }

    pub fn stack(&self) -> &StackTracker {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut StackTracker {
        &mut self.stack
    }

    /// Append `op`, applying its stack effect. `operation` names the
    /// contract operation for diagnostics.
    pub fn emit(&mut self, operation: &'static str, op: Op) -> Result<(), CompileError> {
        let (pops, pushes) = effect(&op);
        self.stack.consume(operation, pops, self.line)?;
        self.stack.produce(pushes);
        trace!(unit = %self.code.name, ip = self.code.ops.len(), ?op, depth = self.stack.depth(), "emit");
        self.code.ops.push(op);
        Ok(())
    }

    pub fn emit_jump(
        &mut self,
        operation: &'static str,
        kind: JumpKind,
    ) -> Result<JumpPatch, CompileError> {
        let ip = self.code.ops.len();
        self.emit(operation, kind.op(0))?;
        Ok(JumpPatch { ip, kind })
    }

    /// Point a forward jump at the next op to be emitted.
    pub fn patch_here(&mut self, patch: JumpPatch) {
        let offset = (self.code.ops.len() - patch.ip) as i32;
        self.code.ops[patch.ip] = patch.kind.op(offset);
    }

    pub fn label(&self) -> Label {
        Label(self.code.ops.len())
    }

    pub fn emit_jump_back(
        &mut self,
        operation: &'static str,
        kind: JumpKind,
        target: Label,
    ) -> Result<(), CompileError> {
        let offset = target.0 as i32 - self.code.ops.len() as i32;
        self.emit(operation, kind.op(offset))
    }

    /// Close the unit: an empty stack returns nil, one value is returned,
    /// anything more is an imbalance.
    pub fn finish(mut self) -> Result<CodeObject, CompileError> {
        let unit = format!("{} `{}`", self.code.kind, self.code.name);
        let surplus = self.stack.finish(&unit, self.line)?;
        for _ in 0..surplus {
            self.emit("end of unit", Op::Pop)?;
        }
        if self.stack.depth() == 0 {
            self.emit("end of unit", Op::PushNil)?;
        }
        self.emit("end of unit", Op::Return)?;
        self.code.max_stack = self.stack.max_depth() as u32;
        Ok(self.code)
    }

    pub fn violation(&self, kind: Violation) -> CompileError {
        CompileError::violation(kind, self.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> CodeBuilder {
        CodeBuilder::new("m", UnitKind::Method, 1, 2, true)
    }

    #[test]
    fn test_forward_and_backward_jumps() {
        let mut b = builder();
        let top = b.label();
        b.emit("load_true", Op::PushTrue).unwrap();
        let exit = b.emit_jump("loop", JumpKind::IfFalse).unwrap();
        b.emit_jump_back("loop", JumpKind::Always, top).unwrap();
        b.patch_here(exit);

        assert_eq!(
            b.ops(),
            &[Op::PushTrue, Op::JumpIfFalse(2), Op::Jump(-2)]
        );
        assert_eq!(b.depth(), 0);
    }

    #[test]
    fn test_finish_returns_nil_for_empty_stack() {
        let code = builder().finish().unwrap();
        assert_eq!(code.ops, vec![Op::PushNil, Op::Return]);
        assert_eq!(code.local_count, 2);
    }

    #[test]
    fn test_finish_rejects_surplus_values() {
        let mut b = builder();
        b.emit("load_nil", Op::PushNil).unwrap();
        b.emit("load_nil", Op::PushNil).unwrap();

        let err = b.finish().unwrap_err();
        assert!(matches!(
            err.violation_kind(),
            Some(Violation::UnbalancedUnit { depth: 2, .. })
        ));
    }

    #[test]
    fn test_finish_lenient_discards_surplus() {
        let mut b = CodeBuilder::new("m", UnitKind::Method, 0, 0, false);
        b.emit("load_nil", Op::PushNil).unwrap();
        b.emit("load_true", Op::PushTrue).unwrap();

        let code = b.finish().unwrap();
        assert_eq!(code.ops, vec![Op::PushNil, Op::PushTrue, Op::Pop, Op::Return]);
    }

    #[test]
    fn test_emit_underflow_carries_line() {
        let mut b = builder();
        b.set_line(7);

        let err = b.emit("consume_current_value", Op::Pop).unwrap_err();
        assert!(matches!(
            err,
            CompileError::ContractViolation { line: Some(7), .. }
        ));
    }

    #[test]
    fn test_line_table_collapses_repeats() {
        let mut b = builder();
        b.set_line(1);
        b.set_line(2);
        b.emit("load_nil", Op::PushNil).unwrap();
        b.set_line(2);
        b.emit("consume_current_value", Op::Pop).unwrap();
        b.set_line(4);

        let code = b.finish().unwrap();
        assert_eq!(
            code.lines,
            vec![LineEntry { ip: 0, line: 2 }, LineEntry { ip: 2, line: 4 }]
        );
    }
}
