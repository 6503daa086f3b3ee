use std::rc::Rc;

use tracing::{debug, trace};

use crate::bytecode::verify::verify_program;
use crate::bytecode::{CodeObject, Constant, ConstantPool, Op, ProgramBc};
use crate::codegen::UnitKind;
use crate::lang::value::Value;
use crate::runtime::builtins;
use crate::runtime::frame::{Env, Proc};
use crate::runtime::object_space::{MethodEntry, ObjectSpace};
use crate::runtime::runtime_error::{ErrorKind, RuntimeError, no_method, wrong_arity};

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_steps: Option<usize>,
    pub max_stack_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 1000,
            max_steps: None,
            max_stack_size: 10_000,
        }
    }
}

#[derive(Debug)]
enum Output {
    Stdout,
    Captured(String),
}

#[derive(Debug)]
struct FrameInfo {
    name: String,
    block: Option<Rc<Proc>>,
}

/// State of one executing unit: its operand stack, locals, `self` and the
/// block it was called with.
#[derive(Debug)]
pub struct Activation {
    pub stack: Vec<Value>,
    pub env: Rc<Env>,
    pub self_value: Value,
    pub block: Option<Rc<Proc>>,
}

impl Activation {
    pub fn new(env: Rc<Env>, self_value: Value, block: Option<Rc<Proc>>) -> Self {
        Self {
            stack: Vec::new(),
            env,
            self_value,
            block,
        }
    }
}

/// What the interpreter loop does after one op.
#[derive(Debug)]
pub enum Flow {
    Next,
    Jump(i32),
    Return(Value),
}

pub struct Vm {
    codes: Vec<Rc<CodeObject>>,
    constants: ConstantPool,
    space: ObjectSpace,
    config: VmConfig,
    output: Output,
    frames: Vec<FrameInfo>,
    steps: usize,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            codes: Vec::new(),
            constants: ConstantPool::new(),
            space: ObjectSpace::new(),
            config,
            output: Output::Stdout,
            frames: Vec::new(),
            steps: 0,
        }
    }

    /// Collect program output instead of printing it.
    pub fn with_captured_output(mut self) -> Self {
        self.output = Output::Captured(String::new());
        self
    }

    /// Drain captured output; empty when printing to stdout.
    pub fn take_output(&mut self) -> String {
        match &mut self.output {
            Output::Captured(buf) => std::mem::take(buf),
            Output::Stdout => String::new(),
        }
    }

    pub fn write_output(&mut self, text: &str) {
        match &mut self.output {
            Output::Captured(buf) => buf.push_str(text),
            Output::Stdout => print!("{}", text),
        }
    }

    pub fn space(&self) -> &ObjectSpace {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut ObjectSpace {
        &mut self.space
    }

    pub fn constants(&self) -> &ConstantPool {
        &self.constants
    }

    pub fn constants_mut(&mut self) -> &mut ConstantPool {
        &mut self.constants
    }

    pub fn code_count(&self) -> usize {
        self.codes.len()
    }

    pub fn code(&self, index: u32) -> Result<Rc<CodeObject>, RuntimeError> {
        self.codes
            .get(index as usize)
            .cloned()
            .ok_or_else(|| RuntimeError::internal(format!("no code object {}", index)))
    }

    /// Claim a code slot; it stays an empty placeholder until installed.
    pub fn reserve_code(&mut self) -> u32 {
        let index = self.codes.len() as u32;
        self.codes
            .push(Rc::new(CodeObject::new(String::new(), UnitKind::Closure)));
        index
    }

    pub fn install_code(&mut self, index: u32, code: CodeObject) -> Result<(), RuntimeError> {
        match self.codes.get_mut(index as usize) {
            Some(slot) => {
                *slot = Rc::new(code);
                Ok(())
            }
            None => Err(RuntimeError::internal(format!("no code slot {}", index))),
        }
    }

    /// Drop the slots from `index` on. Nothing may still refer to them.
    pub fn release_code(&mut self, index: u32) {
        self.codes.truncate(index as usize);
    }

    pub fn define_method(&mut self, name: &str, code: u32, arity: usize) {
        self.space
            .define_method(name, MethodEntry::Compiled { code, arity });
    }

    pub fn block_given(&self) -> bool {
        self.frames.last().is_some_and(|frame| frame.block.is_some())
    }

    pub fn reset_execution_state(&mut self) {
        self.steps = 0;
        self.frames.clear();
    }

    /// Replace the loaded program after verifying it.
    pub fn load(&mut self, program: ProgramBc) -> Result<(), RuntimeError> {
        verify_program(&program).map_err(|e| RuntimeError::internal(e.to_string()))?;
        debug!(
            code_objects = program.code.len(),
            constants = program.constants.len(),
            "program loaded"
        );
        self.codes = program.code.into_iter().map(Rc::new).collect();
        self.constants = program.constants;
        Ok(())
    }

    /// Run `code[0]` as the script body with `main` as self.
    pub fn run_main(&mut self) -> Result<Value, RuntimeError> {
        self.reset_execution_state();
        let main = self.code(0)?;
        let env = Env::new(main.local_count as usize, None);
        let self_value = self.space.main();
        self.execute(0, Activation::new(env, self_value, None))
    }

    pub fn run(&mut self, program: ProgramBc) -> Result<Value, RuntimeError> {
        self.load(program)?;
        self.run_main()
    }

    // Dispatch

    pub fn send(
        &mut self,
        recv: Value,
        name: &str,
        args: Vec<Value>,
        block: Option<Rc<Proc>>,
    ) -> Result<Value, RuntimeError> {
        trace!(name, argc = args.len(), recv = %recv.class_name(), "send");
        if let Some(value) = builtins::call_method(self, &recv, name, &args, block.as_ref())? {
            return Ok(value);
        }

        match self.space.method(name).cloned() {
            Some(MethodEntry::Compiled { code, arity }) => {
                if args.len() != arity {
                    return Err(wrong_arity(args.len(), arity));
                }
                return self.call_code(code, recv, args, block);
            }
            Some(MethodEntry::Builtin(original)) => {
                if let Some(value) =
                    builtins::call_method(self, &recv, &original, &args, block.as_ref())?
                {
                    return Ok(value);
                }
                return builtins::call_kernel(self, &recv, &original, &args, block.as_ref())?
                    .ok_or_else(|| no_method(&original, &recv));
            }
            None => {}
        }

        builtins::call_kernel(self, &recv, name, &args, block.as_ref())?
            .ok_or_else(|| no_method(name, &recv))
    }

    /// Invoke a method body with a fresh frame; arguments fill the first
    /// locals.
    pub fn call_code(
        &mut self,
        code: u32,
        self_value: Value,
        args: Vec<Value>,
        block: Option<Rc<Proc>>,
    ) -> Result<Value, RuntimeError> {
        let body = self.code(code)?;
        let env = Env::new((body.local_count as usize).max(args.len()), None);
        for (i, arg) in args.into_iter().enumerate() {
            env.set(i, arg);
        }
        self.execute(code, Activation::new(env, self_value, block))
    }

    /// Call a block. Missing arguments are nil, extras are dropped, and a
    /// single array is spread over a block taking several parameters.
    pub fn call_proc(&mut self, proc: &Rc<Proc>, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let body = self.code(proc.code)?;
        let args = match args.as_slice() {
            [Value::Array(items)] if proc.arity > 1 => items.borrow().clone(),
            _ => args,
        };

        let env = Env::new(body.local_count as usize, Some(Rc::clone(&proc.env)));
        for (i, arg) in args.into_iter().take(proc.arity).enumerate() {
            env.set(i, arg);
        }
        self.execute(
            proc.code,
            Activation::new(env, proc.self_value.clone(), proc.block.clone()),
        )
    }

    // Execution

    fn check_limits(&mut self, act: &Activation) -> Result<(), RuntimeError> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(RuntimeError::new(
                    ErrorKind::LimitExceeded,
                    format!("execution step limit exceeded ({})", max),
                ));
            }
        }

        if act.stack.len() > self.config.max_stack_size {
            return Err(RuntimeError::new(
                ErrorKind::LimitExceeded,
                format!("stack size limit exceeded ({})", self.config.max_stack_size),
            ));
        }

        Ok(())
    }

    fn execute(&mut self, index: u32, mut act: Activation) -> Result<Value, RuntimeError> {
        if self.frames.len() >= self.config.max_call_depth {
            let context = self
                .frames
                .last()
                .map(|frame| format!(" in '{}'", frame.name))
                .unwrap_or_default();
            return Err(RuntimeError::new(
                ErrorKind::LimitExceeded,
                format!(
                    "stack level too deep (call depth limit {}){}",
                    self.config.max_call_depth, context
                ),
            ));
        }

        let code = self.code(index)?;
        self.frames.push(FrameInfo {
            name: code.name.clone(),
            block: act.block.clone(),
        });
        let result = self.execute_inner(&code, &mut act);
        self.frames.pop();
        result
    }

    fn execute_inner(
        &mut self,
        code: &CodeObject,
        act: &mut Activation,
    ) -> Result<Value, RuntimeError> {
        let mut ip: usize = 0;

        while ip < code.ops.len() {
            self.check_limits(act)?;

            let flow = self
                .step(act, &code.ops[ip])
                .map_err(|e| e.with_context(frame_context(code, ip)))?;
            match flow {
                Flow::Next => ip += 1,
                Flow::Jump(offset) => {
                    let target = ip as i64 + offset as i64;
                    ip = usize::try_from(target).map_err(|_| {
                        RuntimeError::internal(format!("jump to {} in `{}`", target, code.name))
                    })?;
                }
                Flow::Return(value) => return Ok(value),
            }
        }

        Err(RuntimeError::internal(format!(
            "`{}` ended without a return",
            code.name
        )))
    }

    /// Execute a single op against an activation.
    pub fn step(&mut self, act: &mut Activation, op: &Op) -> Result<Flow, RuntimeError> {
        match op {
            // Literals
            Op::PushNil => act.stack.push(Value::Nil),
            Op::PushTrue => act.stack.push(Value::Bool(true)),
            Op::PushFalse => act.stack.push(Value::Bool(false)),
            Op::PushSelf => act.stack.push(act.self_value.clone()),
            Op::PushFixnum(n) => act.stack.push(Value::Fixnum(*n)),
            Op::PushBignum(idx) => match self.constants.get(*idx) {
                Some(Constant::Bignum(n)) => act.stack.push(Value::integer(n.clone())),
                _ => return Err(bad_constant(*idx)),
            },
            Op::PushString(idx) => {
                let text = self.text(*idx)?;
                act.stack.push(Value::string(text));
            }
            Op::PushSymbol(idx) => {
                let text = self.text(*idx)?;
                act.stack.push(Value::Symbol(self.space.symbol(&text)));
            }

            // Stack operations
            Op::Pop => {
                pop(act)?;
            }
            Op::Dup => {
                let top = act
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| stack_underflow("DUP"))?;
                act.stack.push(top);
            }

            // Variables
            Op::GetLocal(i) => act.stack.push(act.env.get(*i as usize)),
            Op::SetLocal(i) => {
                let value = pop(act)?;
                act.env.set(*i as usize, value);
            }
            Op::GetOuter { index, depth } => {
                let value = outer(&act.env, *depth)?.get(*index as usize);
                act.stack.push(value);
            }
            Op::SetOuter { index, depth } => {
                let value = pop(act)?;
                outer(&act.env, *depth)?.set(*index as usize, value);
            }
            Op::GetIvar(idx) => {
                let name = self.text(*idx)?;
                let value = match &act.self_value {
                    Value::Object(obj) => obj.ivars.borrow().get(&name).cloned(),
                    _ => None,
                };
                act.stack.push(value.unwrap_or(Value::Nil));
            }
            Op::SetIvar(idx) => {
                let name = self.text(*idx)?;
                let value = pop(act)?;
                match &act.self_value {
                    Value::Object(obj) => {
                        obj.ivars.borrow_mut().insert(name, value);
                    }
                    other => {
                        return Err(RuntimeError::new(
                            ErrorKind::TypeError,
                            format!(
                                "can't modify instance variable {} of {}",
                                name,
                                other.class_name()
                            ),
                        ));
                    }
                }
            }
            Op::GetGlobal(idx) => {
                let name = self.text(*idx)?;
                act.stack.push(self.space.global(&name));
            }
            Op::SetGlobal(idx) => {
                let name = self.text(*idx)?;
                let value = pop(act)?;
                self.space.set_global(&name, value);
            }
            Op::GetConst(idx) => {
                let name = self.text(*idx)?;
                let value = self.space.constant(&name).ok_or_else(|| {
                    RuntimeError::new(
                        ErrorKind::NameError,
                        format!("uninitialized constant {}", name),
                    )
                })?;
                act.stack.push(value);
            }
            Op::SetConst(idx) => {
                let name = self.text(*idx)?;
                let value = pop(act)?;
                self.space.set_constant(&name, value);
            }

            // Aggregates
            Op::MakeArray(n) => {
                let n = *n as usize;
                if act.stack.len() < n {
                    return Err(stack_underflow("MAKE_ARRAY"));
                }
                let items = act.stack.split_off(act.stack.len() - n);
                act.stack.push(Value::array(items));
            }
            Op::ToArray => {
                let value = pop(act)?;
                let array = match value {
                    Value::Array(items) => Value::array(items.borrow().clone()),
                    Value::Nil => Value::array(Vec::new()),
                    other => Value::array(vec![other]),
                };
                act.stack.push(array);
            }

            // Dispatch
            Op::Send {
                name,
                argc,
                receiver,
                block,
            } => {
                let name = self.text(*name)?;
                let argc = *argc as usize;
                if act.stack.len() < argc {
                    return Err(stack_underflow("SEND"));
                }
                let args = act.stack.split_off(act.stack.len() - argc);
                let recv = if *receiver {
                    pop(act)?
                } else {
                    act.self_value.clone()
                };
                let block = match block {
                    Some(code) => Some(self.make_proc(*code, act)?),
                    None => None,
                };
                let result = self.send(recv, &name, args, block)?;
                act.stack.push(result);
            }
            Op::Yield { argc } => {
                let argc = *argc as usize;
                if act.stack.len() < argc {
                    return Err(stack_underflow("YIELD"));
                }
                let args = act.stack.split_off(act.stack.len() - argc);
                let block = act.block.clone().ok_or_else(|| {
                    RuntimeError::new(ErrorKind::LocalJumpError, "no block given (yield)")
                })?;
                let result = self.call_proc(&block, args)?;
                act.stack.push(result);
            }
            Op::MakeClosure(code) => {
                let proc = self.make_proc(*code, act)?;
                act.stack.push(Value::Proc(proc));
            }
            Op::DefineMethod { name, code } => {
                let name = self.text(*name)?;
                let arity = self.code(*code)?.arity as usize;
                self.define_method(&name, *code, arity);
            }
            Op::Alias { new_name, old_name } => {
                let new_name = self.text(*new_name)?;
                let old_name = self.text(*old_name)?;
                self.space.alias(&new_name, &old_name)?;
            }

            // Logic
            Op::Not => {
                let value = pop(act)?;
                act.stack.push(Value::Bool(!value.is_truthy()));
            }

            // Control flow
            Op::Jump(offset) => return Ok(Flow::Jump(*offset)),
            Op::JumpIfFalse(offset) => {
                if !pop(act)?.is_truthy() {
                    return Ok(Flow::Jump(*offset));
                }
            }
            Op::JumpIfTrue(offset) => {
                if pop(act)?.is_truthy() {
                    return Ok(Flow::Jump(*offset));
                }
            }

            Op::Return => return Ok(Flow::Return(pop(act)?)),
        }

        Ok(Flow::Next)
    }

    fn make_proc(&self, code: u32, act: &Activation) -> Result<Rc<Proc>, RuntimeError> {
        let arity = self.code(code)?.arity as usize;
        Ok(Rc::new(Proc {
            code,
            arity,
            env: Rc::clone(&act.env),
            self_value: act.self_value.clone(),
            block: act.block.clone(),
        }))
    }

    fn text(&self, idx: u32) -> Result<String, RuntimeError> {
        self.constants
            .text(idx)
            .map(str::to_string)
            .ok_or_else(|| bad_constant(idx))
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn pop(act: &mut Activation) -> Result<Value, RuntimeError> {
    act.stack.pop().ok_or_else(|| stack_underflow("POP"))
}

fn outer(env: &Env, depth: u32) -> Result<&Env, RuntimeError> {
    env.ancestor(depth as usize)
        .ok_or_else(|| RuntimeError::internal(format!("no enclosing frame at depth {}", depth)))
}

fn stack_underflow(op: &str) -> RuntimeError {
    RuntimeError::internal(format!("operand stack underflow in {}", op))
}

fn bad_constant(idx: u32) -> RuntimeError {
    RuntimeError::internal(format!("bad constant pool index {}", idx))
}

fn frame_context(code: &CodeObject, ip: usize) -> String {
    match code.line_for(ip) {
        Some(line) => format!("{}:{}", code.name, line),
        None => code.name.clone(),
    }
}
