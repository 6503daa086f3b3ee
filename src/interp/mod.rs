//! Immediate-mode backend.
//!
//! Script-level operations run as soon as they are issued, against a live
//! value stack and the VM's object space. Only the taken arm of a branch is
//! invoked and short-circuit operators skip their right-hand side. Method and
//! block bodies cannot run at definition time, so while one of those units is
//! open the operations are recorded with the same emission code the
//! bytecode backend uses, and the VM runs them when they are called.

use std::collections::HashMap;
use std::ops::RangeInclusive;

use num_bigint::BigInt;
use tracing::{debug, warn};

use crate::bytecode::emit::{self, Emitter, Target, Units};
use crate::bytecode::verify::effect;
use crate::bytecode::{CodeObject, Constant, Op};
use crate::codegen::{
    ArrayCallback, BindingKind, BlockBody, Callback, CompileError, Compiler, CompilerConfig,
    Invocation, UnitHandle, UnitKind, Violation,
};
use crate::lang::position::SourcePosition;
use crate::lang::scope::StaticScope;
use crate::lang::value::Value;
use crate::runtime::frame::Env;
use crate::runtime::vm::{Activation, Vm, VmConfig};

const MAIN_NAME: &str = "<main>";

pub struct Interpreter {
    config: CompilerConfig,
    vm: Vm,
    units: Units,
    script: Option<UnitHandle>,
    /// Installed bodies by content. A block recorded again on every pass of
    /// a loop maps back to its first installation.
    recorded: HashMap<CodeObject, u32>,
    top: Activation,
    line: Option<u32>,
    result: Option<Value>,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_config(CompilerConfig::default(), VmConfig::default())
    }

    pub fn with_config(config: CompilerConfig, vm_config: VmConfig) -> Self {
        let vm = Vm::with_config(vm_config);
        let top = Activation::new(Env::new(0, None), vm.space().main(), None);
        Self {
            units: Units::new(config.max_nesting_depth),
            config,
            vm,
            script: None,
            recorded: HashMap::new(),
            top,
            line: None,
            result: None,
        }
    }

    /// Collect program output instead of printing it.
    pub fn with_captured_output(mut self) -> Self {
        self.vm = self.vm.with_captured_output();
        self
    }

    pub fn take_output(&mut self) -> String {
        self.vm.take_output()
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// Values currently on the script-level stack.
    pub fn stack(&self) -> &[Value] {
        &self.top.stack
    }

    /// Value of the script, once `end_script` has run.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    fn recording(&self) -> bool {
        self.units
            .top()
            .is_some_and(|unit| unit.payload.is_some())
    }

    fn violation(&self, kind: Violation) -> CompileError {
        CompileError::violation(kind, self.current_line())
    }

    fn ensure_open(&self) -> Result<(), CompileError> {
        if self.units.is_empty() {
            return Err(self.violation(Violation::NoOpenUnit));
        }
        Ok(())
    }

    fn intern(&mut self, constant: Constant) -> Result<u32, CompileError> {
        self.vm
            .constants_mut()
            .intern(constant, self.config.max_pool_entries)
    }

    /// Record `op` into the open body, or run it right now at script level.
    fn op(&mut self, operation: &'static str, op: Op) -> Result<(), CompileError> {
        self.ensure_open()?;
        if self.recording() {
            return self.target()?.emit(operation, op);
        }

        let (pops, _) = effect(&op);
        let available = self.top.stack.len();
        if available < pops {
            return Err(self.violation(Violation::StackUnderflow {
                op: operation,
                needed: pops,
                available,
            }));
        }

        let line = self.current_line();
        self.vm
            .step(&mut self.top, &op)
            .map(|_| ())
            .map_err(|error| CompileError::Runtime { error, line })
    }

    fn named(
        &mut self,
        operation: &'static str,
        name: &str,
        make: fn(u32) -> Op,
    ) -> Result<(), CompileError> {
        let idx = self.intern(Constant::Name(name.to_string()))?;
        self.op(operation, make(idx))
    }

    fn pop(&mut self, operation: &'static str) -> Result<Value, CompileError> {
        match self.top.stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.violation(Violation::StackUnderflow {
                op: operation,
                needed: 1,
                available: 0,
            })),
        }
    }

    /// Invoke a callback at script level and check how many values it left.
    fn run_region(
        &mut self,
        construct: &'static str,
        allowed: RangeInclusive<isize>,
        region: Callback<'_, Self>,
    ) -> Result<isize, CompileError> {
        let units_before = self.units.len();
        let before = self.top.stack.len();
        region(self)?;
        if self.units.len() != units_before {
            return Err(self.violation(Violation::CallbackLeakedUnit(construct)));
        }

        let produced = self.top.stack.len() as isize - before as isize;
        if !allowed.contains(&produced) {
            let expected = if allowed.start() == allowed.end() {
                "exactly 1"
            } else {
                "0 or 1"
            };
            let kind = Violation::CallbackResult {
                construct,
                expected,
                produced,
            };
            if self.config.check_stack {
                return Err(self.violation(kind));
            }
            warn!(%kind, "accepting unbalanced callback");
        }
        Ok(produced)
    }

    fn exec_logical(
        &mut self,
        construct: &'static str,
        run_when_truthy: bool,
        long_branch: Callback<'_, Self>,
    ) -> Result<(), CompileError> {
        let left = match self.top.stack.last() {
            Some(left) => left.is_truthy(),
            None => {
                return Err(self.violation(Violation::StackUnderflow {
                    op: construct,
                    needed: 1,
                    available: 0,
                }));
            }
        };
        if left != run_when_truthy {
            return Ok(());
        }

        self.pop(construct)?;
        emit::nested(self, |c| c.run_region(construct, 1..=1, long_branch).map(|_| ()))
    }

    fn exec_loop(
        &mut self,
        condition: Callback<'_, Self>,
        body: Callback<'_, Self>,
        check_first: bool,
    ) -> Result<(), CompileError> {
        const OP: &str = "perform_boolean_loop";
        emit::nested(self, |c| {
            let mut test = check_first;
            loop {
                if test {
                    c.run_region("perform_boolean_loop condition", 1..=1, condition)?;
                    if !c.pop(OP)?.is_truthy() {
                        return Ok(());
                    }
                }
                test = true;

                let produced = c.run_region("perform_boolean_loop body", 0..=1, body)?;
                for _ in 0..produced.max(0) {
                    c.pop(OP)?;
                }
            }
        })
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Emitter for Interpreter {
    fn config(&self) -> &CompilerConfig {
        &self.config
    }

    fn units(&self) -> &Units {
        &self.units
    }

    fn units_mut(&mut self) -> &mut Units {
        &mut self.units
    }

    fn target(&mut self) -> Result<Target<'_>, CompileError> {
        let line = self.line;
        let unit = self
            .units
            .top_mut()
            .ok_or_else(|| CompileError::violation(Violation::NoOpenUnit, line))?;
        if unit.payload.is_none() {
            return Err(CompileError::violation(
                Violation::WrongUnitKind(unit.describe()),
                line,
            ));
        }
        match unit.payload.as_mut() {
            Some(pending) => Ok(Target {
                code: &mut pending.builder,
                pool: self.vm.constants_mut(),
                limit: self.config.max_pool_entries,
            }),
            None => Err(CompileError::violation(Violation::NoOpenUnit, line)),
        }
    }

    fn reserve_code(&mut self) -> Result<u32, CompileError> {
        emit::check_code_limit(self.vm.code_count(), &self.config)?;
        Ok(self.vm.reserve_code())
    }

    fn install_code(&mut self, index: u32, code: CodeObject) -> Result<u32, CompileError> {
        if let Some(&existing) = self.recorded.get(&code) {
            debug!(name = %code.name, index = existing, "reusing recorded code object");
            self.release_code(index);
            return Ok(existing);
        }
        let line = self.current_line();
        self.vm
            .install_code(index, code.clone())
            .map_err(|error| CompileError::Runtime { error, line })?;
        self.recorded.insert(code, index);
        Ok(index)
    }

    fn release_code(&mut self, index: u32) {
        self.vm.release_code(index);
        self.recorded.retain(|_, installed| *installed < index);
    }

    fn current_line(&self) -> Option<u32> {
        self.units
            .top()
            .and_then(|unit| unit.payload.as_ref())
            .and_then(|pending| pending.builder.line())
            .or(self.line)
    }
}

impl Compiler for Interpreter {
    fn start_script(&mut self) -> Result<(), CompileError> {
        if self.script.is_some() || self.result.is_some() {
            return Err(self.violation(Violation::ScriptAlreadyStarted));
        }
        self.script = Some(self.units.open(UnitKind::Script, MAIN_NAME, None)?);
        Ok(())
    }

    fn end_script(&mut self) -> Result<(), CompileError> {
        if self.units.len() > 1 {
            let innermost = self.units.top().map(|u| u.describe()).unwrap_or_default();
            return Err(self.violation(Violation::UnclosedUnit(innermost)));
        }
        let handle = self
            .script
            .take()
            .ok_or_else(|| self.violation(Violation::NoOpenUnit))?;
        let line = self.current_line();
        self.units.close(handle, UnitKind::Script, line)?;

        let depth = self.top.stack.len();
        if depth > 1 {
            let kind = Violation::UnbalancedUnit {
                unit: format!("{} `{}`", UnitKind::Script, MAIN_NAME),
                depth,
            };
            if self.config.check_stack {
                return Err(CompileError::violation(kind, line));
            }
            warn!(%kind, "discarding surplus values at unit end");
        }
        let result = self.top.stack.pop().unwrap_or(Value::Nil);
        self.top.stack.clear();
        debug!(result = %result.inspect(), "script finished");
        self.result = Some(result);
        Ok(())
    }

    fn begin_method(
        &mut self,
        friendly_name: &str,
        arity: usize,
        local_var_count: usize,
    ) -> Result<UnitHandle, CompileError> {
        self.ensure_open()?;
        emit::open_unit(
            self,
            UnitKind::Method,
            friendly_name,
            arity,
            local_var_count,
            &[],
        )
    }

    fn end_method(&mut self, handle: UnitHandle) -> Result<(), CompileError> {
        emit::close_unit(self, handle, UnitKind::Method).map(|_| ())
    }

    fn consume_current_value(&mut self) -> Result<(), CompileError> {
        self.op("consume_current_value", Op::Pop)
    }

    fn line_number(&mut self, position: &SourcePosition) -> Result<(), CompileError> {
        self.ensure_open()?;
        if self.recording() {
            self.target()?.code.set_line(position.line);
        }
        self.line = Some(position.line);
        Ok(())
    }

    fn invoke_dynamic(
        &mut self,
        name: &str,
        invocation: Invocation,
        block: Option<BlockBody<'_, Self>>,
    ) -> Result<(), CompileError> {
        self.ensure_open()?;
        if self.recording() {
            return emit::emit_invoke(self, name, invocation, block);
        }

        let available = self.top.stack.len();
        if available < invocation.consumed() {
            return Err(self.violation(Violation::StackUnderflow {
                op: "invoke_dynamic",
                needed: invocation.consumed(),
                available,
            }));
        }
        let block = match block {
            Some(block) => Some(emit::emit_closure(
                self,
                block.scope.variables(),
                block.arity,
                block.body,
            )?),
            None => None,
        };
        let name = self.intern(Constant::Name(name.to_string()))?;
        self.op(
            "invoke_dynamic",
            Op::Send {
                name,
                argc: invocation.argc() as u32,
                receiver: invocation.has_receiver(),
                block,
            },
        )
    }

    fn yield_block(&mut self, has_args: bool) -> Result<(), CompileError> {
        self.ensure_open()?;
        emit::emit_yield(self, has_args)
    }

    fn assign_local_variable(&mut self, index: usize) -> Result<(), CompileError> {
        self.assign_local_variable_in_scope(index, 0)
    }

    fn retrieve_local_variable(&mut self, index: usize) -> Result<(), CompileError> {
        self.retrieve_local_variable_in_scope(index, 0)
    }

    fn assign_local_variable_in_scope(
        &mut self,
        index: usize,
        depth: usize,
    ) -> Result<(), CompileError> {
        emit::check_scope_depth(self, depth)?;
        self.op("assign_local_variable", emit::local_op(index, depth, true))
    }

    fn retrieve_local_variable_in_scope(
        &mut self,
        index: usize,
        depth: usize,
    ) -> Result<(), CompileError> {
        emit::check_scope_depth(self, depth)?;
        self.op("retrieve_local_variable", emit::local_op(index, depth, false))
    }

    fn retrieve_self(&mut self) -> Result<(), CompileError> {
        self.op("retrieve_self", Op::PushSelf)
    }

    fn create_new_fixnum(&mut self, value: i64) -> Result<(), CompileError> {
        self.op("create_new_fixnum", Op::PushFixnum(value))
    }

    fn create_new_bignum(&mut self, value: &BigInt) -> Result<(), CompileError> {
        let idx = self.intern(Constant::Bignum(value.clone()))?;
        self.op("create_new_bignum", Op::PushBignum(idx))
    }

    fn create_new_string(&mut self, value: &str) -> Result<(), CompileError> {
        let idx = self.intern(Constant::String(value.to_string()))?;
        self.op("create_new_string", Op::PushString(idx))
    }

    fn create_new_symbol(&mut self, name: &str) -> Result<(), CompileError> {
        let idx = self.intern(Constant::Symbol(name.to_string()))?;
        self.op("create_new_symbol", Op::PushSymbol(idx))
    }

    fn create_object_array(
        &mut self,
        count: usize,
        element: ArrayCallback<'_, Self>,
    ) -> Result<(), CompileError> {
        self.ensure_open()?;
        if self.recording() {
            return emit::emit_object_array(self, count, element);
        }

        emit::nested(self, |c| {
            for i in 0..count {
                c.run_region(
                    "create_object_array element",
                    1..=1,
                    &mut |c: &mut Self| element(c, i),
                )?;
            }
            Ok(())
        })?;
        self.op("create_object_array", Op::MakeArray(count as u32))
    }

    fn create_new_array(&mut self) -> Result<(), CompileError> {
        self.op("create_new_array", Op::ToArray)
    }

    fn perform_boolean_branch(
        &mut self,
        true_branch: Callback<'_, Self>,
        false_branch: Callback<'_, Self>,
    ) -> Result<(), CompileError> {
        self.ensure_open()?;
        if self.recording() {
            return emit::emit_boolean_branch(self, true_branch, false_branch);
        }

        let condition = self.pop("perform_boolean_branch")?;
        let units_before = self.units.len();
        emit::nested(self, |c| {
            if condition.is_truthy() {
                true_branch(c)
            } else {
                false_branch(c)
            }
        })?;
        if self.units.len() != units_before {
            return Err(self.violation(Violation::CallbackLeakedUnit("perform_boolean_branch")));
        }
        Ok(())
    }

    fn perform_logical_and(&mut self, long_branch: Callback<'_, Self>) -> Result<(), CompileError> {
        self.ensure_open()?;
        if self.recording() {
            return emit::emit_logical_and(self, long_branch);
        }
        self.exec_logical("perform_logical_and", true, long_branch)
    }

    fn perform_logical_or(&mut self, long_branch: Callback<'_, Self>) -> Result<(), CompileError> {
        self.ensure_open()?;
        if self.recording() {
            return emit::emit_logical_or(self, long_branch);
        }
        self.exec_logical("perform_logical_or", false, long_branch)
    }

    fn perform_boolean_loop(
        &mut self,
        condition: Callback<'_, Self>,
        body: Callback<'_, Self>,
        check_first: bool,
    ) -> Result<(), CompileError> {
        self.ensure_open()?;
        if self.recording() {
            return emit::emit_boolean_loop(self, condition, body, check_first);
        }
        self.exec_loop(condition, body, check_first)
    }

    fn create_new_closure(
        &mut self,
        scope: &StaticScope,
        arity: usize,
        body: Callback<'_, Self>,
    ) -> Result<(), CompileError> {
        self.ensure_open()?;
        let code = emit::emit_closure(self, scope.variables(), arity, body)?;
        self.op("create_new_closure", Op::MakeClosure(code))
    }

    fn define_new_method(
        &mut self,
        name: &str,
        arity: usize,
        local_var_count: usize,
        body: Callback<'_, Self>,
    ) -> Result<(), CompileError> {
        self.ensure_open()?;
        let code = emit::record_unit(
            self,
            UnitKind::Method,
            name,
            arity,
            local_var_count,
            &[],
            body,
        )?;
        let name = self.intern(Constant::Name(name.to_string()))?;
        self.op("define_new_method", Op::DefineMethod { name, code })
    }

    fn define_alias(&mut self, new_name: &str, old_name: &str) -> Result<(), CompileError> {
        let new_name = self.intern(Constant::Name(new_name.to_string()))?;
        let old_name = self.intern(Constant::Name(old_name.to_string()))?;
        self.op("define_alias", Op::Alias { new_name, old_name })
    }

    fn retrieve_constant(&mut self, name: &str) -> Result<(), CompileError> {
        self.ensure_open()?;
        if !self.recording() && self.vm.space().constant(name).is_none() {
            return Err(CompileError::Resolution {
                kind: BindingKind::Constant,
                name: name.to_string(),
                line: self.current_line(),
            });
        }
        self.named("retrieve_constant", name, Op::GetConst)
    }

    fn assign_constant(&mut self, name: &str) -> Result<(), CompileError> {
        self.named("assign_constant", name, Op::SetConst)
    }

    fn load_false(&mut self) -> Result<(), CompileError> {
        self.op("load_false", Op::PushFalse)
    }

    fn load_true(&mut self) -> Result<(), CompileError> {
        self.op("load_true", Op::PushTrue)
    }

    fn load_nil(&mut self) -> Result<(), CompileError> {
        self.op("load_nil", Op::PushNil)
    }

    fn retrieve_instance_variable(&mut self, name: &str) -> Result<(), CompileError> {
        self.named("retrieve_instance_variable", name, Op::GetIvar)
    }

    fn assign_instance_variable(&mut self, name: &str) -> Result<(), CompileError> {
        self.named("assign_instance_variable", name, Op::SetIvar)
    }

    fn assign_global_variable(&mut self, name: &str) -> Result<(), CompileError> {
        self.named("assign_global_variable", name, Op::SetGlobal)
    }

    fn retrieve_global_variable(&mut self, name: &str) -> Result<(), CompileError> {
        self.named("retrieve_global_variable", name, Op::GetGlobal)
    }

    fn negate_current_value(&mut self) -> Result<(), CompileError> {
        self.op("negate_current_value", Op::Not)
    }
}
