//! Emission of control flow and nested units, shared by every backend that
//! records bytecode. A backend exposes its innermost [`CodeBuilder`] and the
//! program's constant pool through [`Emitter`]; the functions here then
//! realize the callback-taking operations of the contract against it.

use tracing::{debug, warn};

use crate::bytecode::builder::{CodeBuilder, JumpKind};
use crate::bytecode::ir::{Constant, ConstantPool};
use crate::bytecode::verify::verify_code;
use crate::bytecode::{CodeObject, Op};
use crate::codegen::units::UnitStack;
use crate::codegen::{
    ArrayCallback, BlockBody, Callback, CompileError, Compiler, CompilerConfig, Invocation,
    Resource, UnitHandle, UnitKind, Violation, YieldMode,
};

/// A unit whose body is being recorded into a code object.
#[derive(Debug)]
pub struct Pending {
    pub index: u32,
    pub builder: CodeBuilder,
}

/// Open units; `None` payload marks a unit executed rather than recorded.
pub type Units = UnitStack<Option<Pending>>;

/// Where the next op goes.
pub struct Target<'a> {
    pub code: &'a mut CodeBuilder,
    pub pool: &'a mut ConstantPool,
    pub limit: usize,
}

impl Target<'_> {
    pub fn constant(&mut self, constant: Constant) -> Result<u32, CompileError> {
        self.pool.intern(constant, self.limit)
    }

    pub fn name(&mut self, name: &str) -> Result<u32, CompileError> {
        self.constant(Constant::Name(name.to_string()))
    }

    pub fn emit(&mut self, operation: &'static str, op: Op) -> Result<(), CompileError> {
        self.code.emit(operation, op)
    }
}

pub trait Emitter: Compiler {
    fn config(&self) -> &CompilerConfig;

    fn units(&self) -> &Units;

    fn units_mut(&mut self) -> &mut Units;

    /// The innermost recording unit, or a violation if none is recording.
    fn target(&mut self) -> Result<Target<'_>, CompileError>;

    /// Claim a slot in the code table for a unit about to open.
    fn reserve_code(&mut self) -> Result<u32, CompileError>;

    /// Fill a reserved slot. Returns the index the unit's users should refer
    /// to, which may be an identical code object installed earlier.
    fn install_code(&mut self, index: u32, code: CodeObject) -> Result<u32, CompileError>;

    /// Give back the slot at `index` and every slot claimed after it.
    fn release_code(&mut self, index: u32);

    fn current_line(&self) -> Option<u32>;
}

pub fn check_code_limit(len: usize, config: &CompilerConfig) -> Result<(), CompileError> {
    if len >= config.max_pool_entries {
        return Err(CompileError::ResourceExhausted {
            resource: Resource::CodeObjects,
            limit: config.max_pool_entries,
        });
    }
    Ok(())
}

/// Depth of the innermost recording unit's stack, if one is recording.
pub fn unit_depth<C: Emitter>(c: &C) -> Option<usize> {
    c.units()
        .top()
        .and_then(|unit| unit.payload.as_ref())
        .map(|pending| pending.builder.depth())
}

/// Drop the units opened above `len` and their code slots.
fn abandon_units<C: Emitter>(c: &mut C, len: usize) {
    let dropped = c.units_mut().truncate(len);
    let lowest = dropped
        .iter()
        .filter_map(|unit| unit.payload.as_ref())
        .map(|pending| pending.index)
        .min();
    if let Some(index) = lowest {
        debug!(units = dropped.len(), index, "abandoned units");
        c.release_code(index);
    }
}

pub fn open_unit<C: Emitter>(
    c: &mut C,
    kind: UnitKind,
    name: &str,
    arity: usize,
    local_count: usize,
    locals: &[String],
) -> Result<UnitHandle, CompileError> {
    let index = c.reserve_code()?;
    let mut builder = CodeBuilder::new(name, kind, arity, local_count, c.config().check_stack)
        .with_locals(locals);
    if let Some(line) = c.current_line() {
        builder.set_line(line);
    }
    match c.units_mut().open(kind, name, Some(Pending { index, builder })) {
        Ok(handle) => Ok(handle),
        Err(e) => {
            c.release_code(index);
            Err(e)
        }
    }
}

/// Close a recording unit and install its code object. Returns the code index.
pub fn close_unit<C: Emitter>(
    c: &mut C,
    handle: UnitHandle,
    kind: UnitKind,
) -> Result<u32, CompileError> {
    let line = c.current_line();
    let unit = c.units_mut().close(handle, kind, line)?;
    let describe = unit.describe();
    let pending = unit
        .payload
        .ok_or_else(|| CompileError::violation(Violation::WrongUnitKind(describe), line))?;

    let index = pending.index;
    match install_unit(c, index, pending.builder) {
        Ok(installed) => Ok(installed),
        Err(e) => {
            c.release_code(index);
            Err(e)
        }
    }
}

fn install_unit<C: Emitter>(
    c: &mut C,
    index: u32,
    builder: CodeBuilder,
) -> Result<u32, CompileError> {
    let code = builder.finish()?;
    if c.config().verify_units {
        verify_code(&code)?;
    }
    debug!(name = %code.name, index, ops = code.ops.len(), "code object installed");
    c.install_code(index, code)
}

/// Open a unit, emit its body through `body`, close it. On failure the unit
/// and anything the body left open are discarded.
pub fn record_unit<C: Emitter>(
    c: &mut C,
    kind: UnitKind,
    name: &str,
    arity: usize,
    local_count: usize,
    locals: &[String],
    body: Callback<'_, C>,
) -> Result<u32, CompileError> {
    let units_before = c.units().len();
    let handle = open_unit(c, kind, name, arity, local_count, locals)?;
    let result = match body(c) {
        Ok(()) => close_unit(c, handle, kind),
        Err(e) => Err(e),
    };
    if result.is_err() {
        abandon_units(c, units_before);
    }
    result
}

/// Run `region` one control-flow level deeper. The level is given back
/// however `region` ends, and units it leaves open on failure are discarded.
pub fn nested<C: Emitter, T>(
    c: &mut C,
    region: impl FnOnce(&mut C) -> Result<T, CompileError>,
) -> Result<T, CompileError> {
    c.units_mut().enter()?;
    let units_before = c.units().len();
    let result = region(c);
    c.units_mut().exit();
    if result.is_err() {
        abandon_units(c, units_before);
    }
    result
}

pub fn block_name<C: Emitter>(c: &C) -> String {
    match c.units().top() {
        Some(unit) => format!("block in {}", unit.name()),
        None => "block".to_string(),
    }
}

fn ensure_same_unit<C: Emitter>(
    c: &C,
    units_before: usize,
    construct: &'static str,
) -> Result<(), CompileError> {
    if c.units().len() != units_before {
        return Err(CompileError::violation(
            Violation::CallbackLeakedUnit(construct),
            c.current_line(),
        ));
    }
    Ok(())
}

fn depth<C: Emitter>(c: &mut C) -> Result<usize, CompileError> {
    Ok(c.target()?.code.depth())
}

/// Run a callback that must leave a net effect within `allowed`. Returns the
/// net effect.
fn run_region<C: Emitter>(
    c: &mut C,
    construct: &'static str,
    allowed: std::ops::RangeInclusive<isize>,
    region: Callback<'_, C>,
) -> Result<isize, CompileError> {
    let units_before = c.units().len();
    let before = depth(c)?;
    region(c)?;
    ensure_same_unit(c, units_before, construct)?;

    let line = c.current_line();
    let target = c.target()?;
    target.code.stack().expect_delta(construct, before, allowed, line)?;
    Ok(target.code.stack().delta_since(before))
}

pub fn emit_boolean_branch<C: Emitter>(
    c: &mut C,
    true_branch: Callback<'_, C>,
    false_branch: Callback<'_, C>,
) -> Result<(), CompileError> {
    const OP: &str = "perform_boolean_branch";
    nested(c, |c| {
        let units_before = c.units().len();

        let to_else = c.target()?.code.emit_jump(OP, JumpKind::IfFalse)?;
        let before = depth(c)?;

        true_branch(c)?;
        ensure_same_unit(c, units_before, OP)?;

        let target = c.target()?;
        let after_true = target.code.depth();
        let to_end = target.code.emit_jump(OP, JumpKind::Always)?;
        target.code.patch_here(to_else);
        target.code.stack_mut().reset_to(before);

        false_branch(c)?;
        ensure_same_unit(c, units_before, OP)?;

        let line = c.current_line();
        let target = c.target()?;
        let after_false = target.code.depth();
        if after_true != after_false {
            let kind = Violation::UnbalancedBranch {
                true_arm: after_true as isize - before as isize,
                false_arm: after_false as isize - before as isize,
            };
            if target.code.stack().is_strict() {
                return Err(CompileError::violation(kind, line));
            }
            warn!(%kind, "branch arms left different stack depths");
        }
        target.code.patch_here(to_end);
        Ok(())
    })
}

/// `and` jumps past the right-hand side when the left is falsy, `or` when
/// it is truthy; either way the left value is kept as the result.
fn emit_logical<C: Emitter>(
    c: &mut C,
    construct: &'static str,
    skip_when: JumpKind,
    long_branch: Callback<'_, C>,
) -> Result<(), CompileError> {
    nested(c, |c| {
        let mut target = c.target()?;
        target.emit(construct, Op::Dup)?;
        let to_end = target.code.emit_jump(construct, skip_when)?;
        target.emit(construct, Op::Pop)?;

        run_region(c, construct, 1..=1, long_branch)?;
        c.target()?.code.patch_here(to_end);
        Ok(())
    })
}

pub fn emit_logical_and<C: Emitter>(
    c: &mut C,
    long_branch: Callback<'_, C>,
) -> Result<(), CompileError> {
    emit_logical(c, "perform_logical_and", JumpKind::IfFalse, long_branch)
}

pub fn emit_logical_or<C: Emitter>(
    c: &mut C,
    long_branch: Callback<'_, C>,
) -> Result<(), CompileError> {
    emit_logical(c, "perform_logical_or", JumpKind::IfTrue, long_branch)
}

fn emit_loop_body<C: Emitter>(c: &mut C, body: Callback<'_, C>) -> Result<(), CompileError> {
    let produced = run_region(c, "perform_boolean_loop body", 0..=1, body)?;
    for _ in 0..produced.max(0) {
        c.target()?.emit("perform_boolean_loop", Op::Pop)?;
    }
    Ok(())
}

pub fn emit_boolean_loop<C: Emitter>(
    c: &mut C,
    condition: Callback<'_, C>,
    body: Callback<'_, C>,
    check_first: bool,
) -> Result<(), CompileError> {
    const OP: &str = "perform_boolean_loop";
    nested(c, |c| {
        let top = c.target()?.code.label();
        if check_first {
            run_region(c, "perform_boolean_loop condition", 1..=1, condition)?;
            let exit = c.target()?.code.emit_jump(OP, JumpKind::IfFalse)?;
            emit_loop_body(c, body)?;
            let target = c.target()?;
            target.code.emit_jump_back(OP, JumpKind::Always, top)?;
            target.code.patch_here(exit);
        } else {
            emit_loop_body(c, body)?;
            run_region(c, "perform_boolean_loop condition", 1..=1, condition)?;
            c.target()?.code.emit_jump_back(OP, JumpKind::IfTrue, top)?;
        }
        Ok(())
    })
}

pub fn emit_object_array<C: Emitter>(
    c: &mut C,
    count: usize,
    element: ArrayCallback<'_, C>,
) -> Result<(), CompileError> {
    nested(c, |c| {
        for i in 0..count {
            run_region(c, "create_object_array element", 1..=1, &mut |c: &mut C| {
                element(c, i)
            })?;
        }
        c.target()?
            .emit("create_object_array", Op::MakeArray(count as u32))
    })
}

pub fn emit_closure<C: Emitter>(
    c: &mut C,
    locals: &[String],
    arity: usize,
    body: Callback<'_, C>,
) -> Result<u32, CompileError> {
    let name = block_name(c);
    record_unit(
        c,
        UnitKind::Closure,
        &name,
        arity,
        locals.len(),
        locals,
        body,
    )
}

pub fn emit_invoke<C: Emitter>(
    c: &mut C,
    name: &str,
    invocation: Invocation,
    block: Option<BlockBody<'_, C>>,
) -> Result<(), CompileError> {
    let block = match block {
        Some(block) => Some(emit_closure(
            c,
            block.scope.variables(),
            block.arity,
            block.body,
        )?),
        None => None,
    };

    let mut target = c.target()?;
    let name = target.name(name)?;
    target.emit(
        "invoke_dynamic",
        Op::Send {
            name,
            argc: invocation.argc() as u32,
            receiver: invocation.has_receiver(),
            block,
        },
    )
}

pub fn emit_yield<C: Emitter>(c: &mut C, has_args: bool) -> Result<(), CompileError> {
    let line = c.current_line();
    if !c.units().inside_method() {
        return Err(CompileError::violation(Violation::YieldWithoutBlock, line));
    }

    let lenient = c.config().yield_mode == YieldMode::Lenient;
    let target = c.target()?;
    let mut argc = u32::from(has_args);
    if has_args && target.code.depth() == 0 && lenient {
        warn!(unit = %target.code.name(), "yield with arguments but none prepared; yielding none");
        argc = 0;
    }
    target.code.emit("yield_block", Op::Yield { argc })
}

pub fn check_scope_depth<C: Emitter>(c: &C, depth: usize) -> Result<(), CompileError> {
    let available = c.units().reachable_depth();
    if depth > available {
        return Err(CompileError::violation(
            Violation::ScopeDepth { depth, available },
            c.current_line(),
        ));
    }
    Ok(())
}

pub fn emit_local<C: Emitter>(
    c: &mut C,
    operation: &'static str,
    index: usize,
    depth: usize,
    assign: bool,
) -> Result<(), CompileError> {
    check_scope_depth(c, depth)?;
    c.target()?.emit(operation, local_op(index, depth, assign))
}

pub fn local_op(index: usize, depth: usize, assign: bool) -> Op {
    let (index, depth) = (index as u32, depth as u32);
    match (assign, depth) {
        (false, 0) => Op::GetLocal(index),
        (true, 0) => Op::SetLocal(index),
        (false, depth) => Op::GetOuter { index, depth },
        (true, depth) => Op::SetOuter { index, depth },
    }
}

/// Emit an op whose operand is a pooled name.
pub fn emit_named<C: Emitter>(
    c: &mut C,
    operation: &'static str,
    name: &str,
    op: fn(u32) -> Op,
) -> Result<(), CompileError> {
    let mut target = c.target()?;
    let idx = target.name(name)?;
    target.emit(operation, op(idx))
}

pub fn emit_constant<C: Emitter>(
    c: &mut C,
    operation: &'static str,
    constant: Constant,
    op: fn(u32) -> Op,
) -> Result<(), CompileError> {
    let mut target = c.target()?;
    let idx = target.constant(constant)?;
    target.emit(operation, op(idx))
}

pub fn emit_alias<C: Emitter>(c: &mut C, new_name: &str, old_name: &str) -> Result<(), CompileError> {
    let mut target = c.target()?;
    let new_name = target.name(new_name)?;
    let old_name = target.name(old_name)?;
    target.emit("define_alias", Op::Alias { new_name, old_name })
}
