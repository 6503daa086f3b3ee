use num_bigint::BigInt;
use tracing::{debug, info};

use crate::bytecode::emit::{self, Emitter, Target, Units};
use crate::bytecode::ir::Constant;
use crate::bytecode::verify::verify_program;
use crate::bytecode::{CodeObject, Op, ProgramBc};
use crate::codegen::{
    ArrayCallback, BlockBody, Callback, CompileError, Compiler, CompilerConfig, Invocation,
    UnitHandle, UnitKind, Violation,
};
use crate::lang::position::SourcePosition;
use crate::lang::scope::StaticScope;

pub const MAIN_NAME: &str = "<main>";

#[derive(Debug)]
enum Script {
    NotStarted,
    Open(UnitHandle),
    Ended,
}

/// Records every operation into a [`ProgramBc`].
///
/// Both arms of a branch and every loop region are emitted; nothing runs.
/// The first failure poisons the compiler and the artifact is refused.
pub struct BytecodeCompiler {
    config: CompilerConfig,
    units: Units,
    program: ProgramBc,
    script: Script,
    line: Option<u32>,
    poisoned: Option<CompileError>,
}

impl BytecodeCompiler {
    pub fn new() -> Self {
        Self::with_config(CompilerConfig::default())
    }

    pub fn with_config(config: CompilerConfig) -> Self {
        Self {
            units: Units::new(config.max_nesting_depth),
            config,
            program: ProgramBc::new(),
            script: Script::NotStarted,
            line: None,
            poisoned: None,
        }
    }

    /// Program recorded so far, complete or not.
    pub fn program(&self) -> &ProgramBc {
        &self.program
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Hand over the finished program. Fails if any operation failed or the
    /// script was never ended.
    pub fn into_program(self) -> Result<ProgramBc, CompileError> {
        if let Some(err) = self.poisoned {
            return Err(CompileError::Aborted(Box::new(err)));
        }
        match self.script {
            Script::Ended => {}
            Script::NotStarted => {
                return Err(CompileError::Aborted(Box::new(CompileError::violation(
                    Violation::NoOpenUnit,
                    self.line,
                ))));
            }
            Script::Open(_) => {
                return Err(CompileError::Aborted(Box::new(CompileError::violation(
                    Violation::UnclosedUnit(format!("{} `{}`", UnitKind::Script, MAIN_NAME)),
                    self.line,
                ))));
            }
        }
        if self.config.verify_units {
            verify_program(&self.program)?;
        }
        info!(
            code_objects = self.program.code.len(),
            constants = self.program.constants.len(),
            "program compiled"
        );
        Ok(self.program)
    }

    /// Run one contract operation, refusing everything after a failure.
    fn checked<T>(
        &mut self,
        operation: impl FnOnce(&mut Self) -> Result<T, CompileError>,
    ) -> Result<T, CompileError> {
        if let Some(err) = &self.poisoned {
            return Err(CompileError::Aborted(Box::new(err.clone())));
        }
        let result = operation(self);
        if let Err(err) = &result {
            if self.poisoned.is_none() && !matches!(err, CompileError::Aborted(_)) {
                debug!(error = %err, "compiler poisoned");
                self.poisoned = Some(err.clone());
            }
        }
        result
    }

    fn emit(&mut self, operation: &'static str, op: Op) -> Result<(), CompileError> {
        self.checked(|c| c.target()?.emit(operation, op))
    }
}

impl Default for BytecodeCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Emitter for BytecodeCompiler {
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
                pool: &mut self.program.constants,
                limit: self.config.max_pool_entries,
            }),
            None => Err(CompileError::violation(Violation::NoOpenUnit, line)),
        }
    }

    fn reserve_code(&mut self) -> Result<u32, CompileError> {
        emit::check_code_limit(self.program.code.len(), &self.config)?;
        let index = self.program.code.len() as u32;
        self.program
            .code
            .push(CodeObject::new(String::new(), UnitKind::Closure));
        Ok(index)
    }

    fn install_code(&mut self, index: u32, code: CodeObject) -> Result<u32, CompileError> {
        match self.program.code.get_mut(index as usize) {
            Some(slot) => {
                *slot = code;
                Ok(index)
            }
            None => Err(CompileError::violation(Violation::NoOpenUnit, self.line)),
        }
    }

    fn release_code(&mut self, index: u32) {
        self.program.code.truncate(index as usize);
    }

    fn current_line(&self) -> Option<u32> {
        self.units
            .top()
            .and_then(|unit| unit.payload.as_ref())
            .and_then(|pending| pending.builder.line())
            .or(self.line)
    }
}

impl Compiler for BytecodeCompiler {
    fn start_script(&mut self) -> Result<(), CompileError> {
        self.checked(|c| {
            if !matches!(c.script, Script::NotStarted) {
                return Err(CompileError::violation(
                    Violation::ScriptAlreadyStarted,
                    c.line,
                ));
            }
            let handle = emit::open_unit(c, UnitKind::Script, MAIN_NAME, 0, 0, &[])?;
            c.script = Script::Open(handle);
            Ok(())
        })
    }

    fn end_script(&mut self) -> Result<(), CompileError> {
        self.checked(|c| {
            if c.units.len() > 1 {
                let innermost = c.units.top().map(|u| u.describe()).unwrap_or_default();
                return Err(CompileError::violation(
                    Violation::UnclosedUnit(innermost),
                    c.current_line(),
                ));
            }
            let handle = match std::mem::replace(&mut c.script, Script::Ended) {
                Script::Open(handle) => handle,
                other => {
                    c.script = other;
                    return Err(CompileError::violation(Violation::NoOpenUnit, c.line));
                }
            };
            emit::close_unit(c, handle, UnitKind::Script)?;
            Ok(())
        })
    }

    fn begin_method(
        &mut self,
        friendly_name: &str,
        arity: usize,
        local_var_count: usize,
    ) -> Result<UnitHandle, CompileError> {
        self.checked(|c| {
            c.target()?;
            emit::open_unit(c, UnitKind::Method, friendly_name, arity, local_var_count, &[])
        })
    }

    fn end_method(&mut self, handle: UnitHandle) -> Result<(), CompileError> {
        self.checked(|c| emit::close_unit(c, handle, UnitKind::Method).map(|_| ()))
    }

    fn consume_current_value(&mut self) -> Result<(), CompileError> {
        self.emit("consume_current_value", Op::Pop)
    }

    fn line_number(&mut self, position: &SourcePosition) -> Result<(), CompileError> {
        self.checked(|c| {
            c.target()?.code.set_line(position.line);
            c.line = Some(position.line);
            Ok(())
        })
    }

    fn invoke_dynamic(
        &mut self,
        name: &str,
        invocation: Invocation,
        block: Option<BlockBody<'_, Self>>,
    ) -> Result<(), CompileError> {
        self.checked(|c| emit::emit_invoke(c, name, invocation, block))
    }

    fn yield_block(&mut self, has_args: bool) -> Result<(), CompileError> {
        self.checked(|c| emit::emit_yield(c, has_args))
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
        self.checked(|c| emit::emit_local(c, "assign_local_variable", index, depth, true))
    }

    fn retrieve_local_variable_in_scope(
        &mut self,
        index: usize,
        depth: usize,
    ) -> Result<(), CompileError> {
        self.checked(|c| emit::emit_local(c, "retrieve_local_variable", index, depth, false))
    }

    fn retrieve_self(&mut self) -> Result<(), CompileError> {
        self.emit("retrieve_self", Op::PushSelf)
    }

    fn create_new_fixnum(&mut self, value: i64) -> Result<(), CompileError> {
        self.emit("create_new_fixnum", Op::PushFixnum(value))
    }

    fn create_new_bignum(&mut self, value: &BigInt) -> Result<(), CompileError> {
        self.checked(|c| {
            emit::emit_constant(
                c,
                "create_new_bignum",
                Constant::Bignum(value.clone()),
                Op::PushBignum,
            )
        })
    }

    fn create_new_string(&mut self, value: &str) -> Result<(), CompileError> {
        self.checked(|c| {
            emit::emit_constant(
                c,
                "create_new_string",
                Constant::String(value.to_string()),
                Op::PushString,
            )
        })
    }

    fn create_new_symbol(&mut self, name: &str) -> Result<(), CompileError> {
        self.checked(|c| {
            emit::emit_constant(
                c,
                "create_new_symbol",
                Constant::Symbol(name.to_string()),
                Op::PushSymbol,
            )
        })
    }

    fn create_object_array(
        &mut self,
        count: usize,
        element: ArrayCallback<'_, Self>,
    ) -> Result<(), CompileError> {
        self.checked(|c| emit::emit_object_array(c, count, element))
    }

    fn create_new_array(&mut self) -> Result<(), CompileError> {
        self.emit("create_new_array", Op::ToArray)
    }

    fn perform_boolean_branch(
        &mut self,
        true_branch: Callback<'_, Self>,
        false_branch: Callback<'_, Self>,
    ) -> Result<(), CompileError> {
        self.checked(|c| emit::emit_boolean_branch(c, true_branch, false_branch))
    }

    fn perform_logical_and(&mut self, long_branch: Callback<'_, Self>) -> Result<(), CompileError> {
        self.checked(|c| emit::emit_logical_and(c, long_branch))
    }

    fn perform_logical_or(&mut self, long_branch: Callback<'_, Self>) -> Result<(), CompileError> {
        self.checked(|c| emit::emit_logical_or(c, long_branch))
    }

    fn perform_boolean_loop(
        &mut self,
        condition: Callback<'_, Self>,
        body: Callback<'_, Self>,
        check_first: bool,
    ) -> Result<(), CompileError> {
        self.checked(|c| emit::emit_boolean_loop(c, condition, body, check_first))
    }

    fn create_new_closure(
        &mut self,
        scope: &StaticScope,
        arity: usize,
        body: Callback<'_, Self>,
    ) -> Result<(), CompileError> {
        self.checked(|c| {
            c.target()?;
            let code = emit::emit_closure(c, scope.variables(), arity, body)?;
            c.target()?.emit("create_new_closure", Op::MakeClosure(code))
        })
    }

    fn define_new_method(
        &mut self,
        name: &str,
        arity: usize,
        local_var_count: usize,
        body: Callback<'_, Self>,
    ) -> Result<(), CompileError> {
        self.checked(|c| {
            c.target()?;
            let code =
                emit::record_unit(c, UnitKind::Method, name, arity, local_var_count, &[], body)?;
            let mut target = c.target()?;
            let name = target.name(name)?;
            target.emit("define_new_method", Op::DefineMethod { name, code })
        })
    }

    fn define_alias(&mut self, new_name: &str, old_name: &str) -> Result<(), CompileError> {
        self.checked(|c| emit::emit_alias(c, new_name, old_name))
    }

    fn retrieve_constant(&mut self, name: &str) -> Result<(), CompileError> {
        self.checked(|c| emit::emit_named(c, "retrieve_constant", name, Op::GetConst))
    }

    fn assign_constant(&mut self, name: &str) -> Result<(), CompileError> {
        self.checked(|c| emit::emit_named(c, "assign_constant", name, Op::SetConst))
    }

    fn load_false(&mut self) -> Result<(), CompileError> {
        self.emit("load_false", Op::PushFalse)
    }

    fn load_true(&mut self) -> Result<(), CompileError> {
        self.emit("load_true", Op::PushTrue)
    }

    fn load_nil(&mut self) -> Result<(), CompileError> {
        self.emit("load_nil", Op::PushNil)
    }

    fn retrieve_instance_variable(&mut self, name: &str) -> Result<(), CompileError> {
        self.checked(|c| emit::emit_named(c, "retrieve_instance_variable", name, Op::GetIvar))
    }

    fn assign_instance_variable(&mut self, name: &str) -> Result<(), CompileError> {
        self.checked(|c| emit::emit_named(c, "assign_instance_variable", name, Op::SetIvar))
    }

    fn assign_global_variable(&mut self, name: &str) -> Result<(), CompileError> {
        self.checked(|c| emit::emit_named(c, "assign_global_variable", name, Op::SetGlobal))
    }

    fn retrieve_global_variable(&mut self, name: &str) -> Result<(), CompileError> {
        self.checked(|c| emit::emit_named(c, "retrieve_global_variable", name, Op::GetGlobal))
    }

    fn negate_current_value(&mut self) -> Result<(), CompileError> {
        self.emit("negate_current_value", Op::Not)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::Resource;

    fn compiler() -> BytecodeCompiler {
        let mut c = BytecodeCompiler::with_config(CompilerConfig::strict());
        c.start_script().unwrap();
        c
    }

    fn finish(mut c: BytecodeCompiler) -> ProgramBc {
        c.end_script().unwrap();
        c.into_program().unwrap()
    }

    fn main_ops(program: &ProgramBc) -> &[Op] {
        &program.code[0].ops
    }

    #[test]
    fn test_empty_script_returns_nil() {
        let program = finish(compiler());
        assert_eq!(main_ops(&program), &[Op::PushNil, Op::Return]);
        assert_eq!(program.code[0].name, MAIN_NAME);
    }

    #[test]
    fn test_branch_emits_both_arms() {
        let mut c = compiler();
        c.load_true().unwrap();
        c.perform_boolean_branch(
            &mut |c: &mut BytecodeCompiler| c.create_new_fixnum(1),
            &mut |c: &mut BytecodeCompiler| c.create_new_fixnum(2),
        )
        .unwrap();

        let program = finish(c);
        assert_eq!(
            main_ops(&program),
            &[
                Op::PushTrue,
                Op::JumpIfFalse(3),
                Op::PushFixnum(1),
                Op::Jump(2),
                Op::PushFixnum(2),
                Op::Return,
            ]
        );
    }

    #[test]
    fn test_unbalanced_branch_rejected() {
        let mut c = compiler();
        c.load_true().unwrap();
        let err = c
            .perform_boolean_branch(
                &mut |c: &mut BytecodeCompiler| c.create_new_fixnum(1),
                &mut |_: &mut BytecodeCompiler| Ok(()),
            )
            .unwrap_err();

        assert!(matches!(
            err.violation_kind(),
            Some(Violation::UnbalancedBranch { true_arm: 1, false_arm: 0 })
        ));
        assert!(c.is_poisoned());
        assert!(c.load_nil().is_err());
    }

    #[test]
    fn test_logical_and_keeps_left_when_falsy() {
        let mut c = compiler();
        c.load_false().unwrap();
        c.perform_logical_and(&mut |c: &mut BytecodeCompiler| c.create_new_fixnum(5))
            .unwrap();

        let program = finish(c);
        assert_eq!(
            main_ops(&program),
            &[
                Op::PushFalse,
                Op::Dup,
                Op::JumpIfFalse(3),
                Op::Pop,
                Op::PushFixnum(5),
                Op::Return,
            ]
        );
    }

    #[test]
    fn test_pre_test_loop_shape() {
        let mut c = compiler();
        c.perform_boolean_loop(
            &mut |c: &mut BytecodeCompiler| c.load_false(),
            &mut |c: &mut BytecodeCompiler| c.load_nil(),
            true,
        )
        .unwrap();

        let program = finish(c);
        assert_eq!(
            main_ops(&program),
            &[
                Op::PushFalse,
                Op::JumpIfFalse(4),
                Op::PushNil,
                Op::Pop,
                Op::Jump(-4),
                Op::PushNil,
                Op::Return,
            ]
        );
    }

    #[test]
    fn test_post_test_loop_shape() {
        let mut c = compiler();
        c.perform_boolean_loop(
            &mut |c: &mut BytecodeCompiler| c.load_false(),
            &mut |_: &mut BytecodeCompiler| Ok(()),
            false,
        )
        .unwrap();

        let program = finish(c);
        assert_eq!(
            main_ops(&program),
            &[Op::PushFalse, Op::JumpIfTrue(-1), Op::PushNil, Op::Return]
        );
    }

    #[test]
    fn test_loop_condition_must_produce_one_value() {
        let mut c = compiler();
        let err = c
            .perform_boolean_loop(
                &mut |_: &mut BytecodeCompiler| Ok(()),
                &mut |_: &mut BytecodeCompiler| Ok(()),
                true,
            )
            .unwrap_err();
        assert!(matches!(
            err.violation_kind(),
            Some(Violation::CallbackResult { produced: 0, .. })
        ));
    }

    #[test]
    fn test_define_method_records_unit() {
        let mut c = compiler();
        c.define_new_method("double", 1, 1, &mut |c: &mut BytecodeCompiler| {
            c.retrieve_local_variable(0)?;
            c.retrieve_local_variable(0)?;
            c.invoke_dynamic("+", Invocation::Method { argc: 1 }, None)
        })
        .unwrap();

        let program = finish(c);
        let (index, method) = program.find("double").unwrap();
        assert_eq!(method.kind, UnitKind::Method);
        assert_eq!(method.arity, 1);
        assert!(matches!(
            main_ops(&program)[0],
            Op::DefineMethod { code, .. } if code == index
        ));
        assert_eq!(method.ops.last(), Some(&Op::Return));
    }

    #[test]
    fn test_block_is_named_after_enclosing_unit() {
        let scope = StaticScope::block(["x"]);
        let mut c = compiler();
        c.create_new_fixnum(3).unwrap();
        c.invoke_dynamic(
            "times",
            Invocation::Attribute,
            Some(BlockBody {
                scope: &scope,
                arity: 1,
                body: &mut |c: &mut BytecodeCompiler| c.retrieve_local_variable(0),
            }),
        )
        .unwrap();

        let program = finish(c);
        let (index, block) = program.find("block in <main>").unwrap();
        assert_eq!(block.kind, UnitKind::Closure);
        assert_eq!(block.locals, vec!["x".to_string()]);
        assert!(matches!(
            main_ops(&program)[1],
            Op::Send { block: Some(b), receiver: true, argc: 0, .. } if b == index
        ));
    }

    #[test]
    fn test_end_method_with_wrong_handle() {
        let mut c = compiler();
        let outer = c.begin_method("outer", 0, 0).unwrap();
        let _inner = c.begin_method("inner", 0, 0).unwrap();

        let err = c.end_method(outer).unwrap_err();
        assert!(matches!(
            err.violation_kind(),
            Some(Violation::HandleMismatch { .. })
        ));
        assert!(c.into_program().is_err());
    }

    #[test]
    fn test_end_script_with_open_method() {
        let mut c = compiler();
        let _method = c.begin_method("m", 0, 0).unwrap();

        let err = c.end_script().unwrap_err();
        assert!(matches!(
            err.violation_kind(),
            Some(Violation::UnclosedUnit(name)) if name == "method `m`"
        ));
    }

    #[test]
    fn test_operations_before_start_rejected() {
        let mut c = BytecodeCompiler::new();
        let err = c.load_nil().unwrap_err();
        assert_eq!(err.violation_kind(), Some(&Violation::NoOpenUnit));

        let mut c = compiler();
        let err = c.start_script().unwrap_err();
        assert_eq!(err.violation_kind(), Some(&Violation::ScriptAlreadyStarted));
    }

    #[test]
    fn test_yield_outside_method_rejected() {
        let mut c = compiler();
        let err = c.yield_block(false).unwrap_err();
        assert_eq!(err.violation_kind(), Some(&Violation::YieldWithoutBlock));
    }

    #[test]
    fn test_yield_inside_block_of_method() {
        let scope = StaticScope::block(Vec::<String>::new());
        let mut c = compiler();
        c.define_new_method("each_twice", 0, 0, &mut |c: &mut BytecodeCompiler| {
            c.create_new_fixnum(2)?;
            c.invoke_dynamic(
                "times",
                Invocation::Attribute,
                Some(BlockBody {
                    scope: &scope,
                    arity: 0,
                    body: &mut |c: &mut BytecodeCompiler| c.yield_block(false),
                }),
            )
        })
        .unwrap();

        let program = finish(c);
        let (_, block) = program.find("block in each_twice").unwrap();
        assert_eq!(block.ops[0], Op::Yield { argc: 0 });
    }

    #[test]
    fn test_lenient_yield_without_argument() {
        let config = CompilerConfig {
            yield_mode: crate::codegen::YieldMode::Lenient,
            ..CompilerConfig::strict()
        };
        let mut c = BytecodeCompiler::with_config(config);
        c.start_script().unwrap();
        c.define_new_method("m", 0, 0, &mut |c: &mut BytecodeCompiler| c.yield_block(true))
            .unwrap();

        let program = finish(c);
        let (_, method) = program.find("m").unwrap();
        assert_eq!(method.ops[0], Op::Yield { argc: 0 });
    }

    #[test]
    fn test_scope_depth_checked() {
        let scope = StaticScope::block(Vec::<String>::new());
        let mut c = compiler();
        let err = c.retrieve_local_variable_in_scope(0, 1).unwrap_err();
        assert!(matches!(
            err.violation_kind(),
            Some(Violation::ScopeDepth { depth: 1, available: 0 })
        ));

        let mut c = compiler();
        c.create_new_closure(&scope, 0, &mut |c: &mut BytecodeCompiler| {
            c.retrieve_local_variable_in_scope(0, 1)
        })
        .unwrap();
        let program = finish(c);
        assert_eq!(program.code[1].ops[0], Op::GetOuter { index: 0, depth: 1 });
    }

    #[test]
    fn test_constants_are_pooled_once() {
        let mut c = compiler();
        c.create_new_symbol("a").unwrap();
        c.consume_current_value().unwrap();
        c.create_new_symbol("a").unwrap();
        c.consume_current_value().unwrap();
        c.create_new_string("a").unwrap();

        let program = finish(c);
        assert_eq!(program.constants.len(), 2);
    }

    #[test]
    fn test_pool_limit_reported() {
        let config = CompilerConfig {
            max_pool_entries: 1,
            ..CompilerConfig::strict()
        };
        let mut c = BytecodeCompiler::with_config(config);
        c.start_script().unwrap();
        c.create_new_string("a").unwrap();
        c.consume_current_value().unwrap();

        let err = c.create_new_string("b").unwrap_err();
        assert!(matches!(
            err,
            CompileError::ResourceExhausted {
                resource: Resource::ConstantPool,
                ..
            }
        ));
    }

    #[test]
    fn test_line_numbers_recorded() {
        let mut c = compiler();
        c.line_number(&SourcePosition::new("t.rb", 3)).unwrap();
        c.load_nil().unwrap();

        let program = finish(c);
        assert_eq!(program.code[0].line_for(0), Some(3));
    }

    #[test]
    fn test_array_elements_in_order() {
        let mut c = compiler();
        c.create_object_array(3, &mut |c: &mut BytecodeCompiler, i| {
            c.create_new_fixnum(i as i64 * 10)
        })
        .unwrap();
        c.create_new_array().unwrap();

        let program = finish(c);
        assert_eq!(
            main_ops(&program),
            &[
                Op::PushFixnum(0),
                Op::PushFixnum(10),
                Op::PushFixnum(20),
                Op::MakeArray(3),
                Op::ToArray,
                Op::Return,
            ]
        );
    }

    #[test]
    fn test_into_program_requires_ended_script() {
        let c = compiler();
        let err = c.into_program().unwrap_err();
        assert!(matches!(
            err.violation_kind(),
            Some(Violation::UnclosedUnit(_))
        ));
    }
}
