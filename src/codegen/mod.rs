//! The code generation contract.
//!
//! A driver walks a program tree depth-first and issues operations against a
//! [`Compiler`]. Each operation produces at most one value onto an implicit
//! value stack, consumes values produced earlier, or is a pure directive.
//! Nested code regions (branch arms, loop bodies, method and block bodies,
//! array elements) are passed as callbacks that the backend invokes
//! synchronously, against itself, at the point their code belongs.
//!
//! | Operation | Stack effect |
//! |---|---|
//! | `load_*`, `retrieve_*`, `create_new_*` literals, `create_new_closure` | `( -- x )` |
//! | `assign_*`, `consume_current_value` | `( x -- )` |
//! | `negate_current_value`, `create_new_array` | `( x -- y )` |
//! | `invoke_dynamic` | `( recv? args.. -- result )` |
//! | `yield_block` | `( arg? -- result )` |
//! | `perform_boolean_branch` | `( cond -- k values )`, same k for both arms |
//! | `perform_logical_and` / `perform_logical_or` | `( left -- result )` |
//! | `perform_boolean_loop` | `( -- )` |
//! | `define_new_method`, `define_alias`, `line_number`, unit brackets | `( -- )` |

pub mod error;
pub mod stack;
pub mod units;

use num_bigint::BigInt;

use crate::lang::position::SourcePosition;
use crate::lang::scope::StaticScope;

pub use error::{BindingKind, CompileError, Resource, Violation};
pub use units::{UnitHandle, UnitKind};

/// Nested code region. Receives the backend that invoked it.
pub type Callback<'a, C> = &'a mut dyn FnMut(&mut C) -> Result<(), CompileError>;

/// Per-element producer for [`Compiler::create_object_array`]; receives the
/// element index and must produce exactly one value.
pub type ArrayCallback<'a, C> = &'a mut dyn FnMut(&mut C, usize) -> Result<(), CompileError>;

/// A literal block attached to a call site.
pub struct BlockBody<'a, C> {
    pub scope: &'a StaticScope,
    pub arity: usize,
    pub body: Callback<'a, C>,
}

/// Shape of a dynamic call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// `foo`: implicit self, no arguments.
    Variable,
    /// `foo(a, b)`: implicit self.
    Function { argc: usize },
    /// `recv.foo`
    Attribute,
    /// `recv.foo(a, b)`
    Method { argc: usize },
}

impl Invocation {
    pub fn new(has_receiver: bool, argc: usize) -> Self {
        match (has_receiver, argc) {
            (false, 0) => Invocation::Variable,
            (false, argc) => Invocation::Function { argc },
            (true, 0) => Invocation::Attribute,
            (true, argc) => Invocation::Method { argc },
        }
    }

    pub fn has_receiver(self) -> bool {
        matches!(self, Invocation::Attribute | Invocation::Method { .. })
    }

    pub fn argc(self) -> usize {
        match self {
            Invocation::Variable | Invocation::Attribute => 0,
            Invocation::Function { argc } | Invocation::Method { argc } => argc,
        }
    }

    /// Values the call consumes from the stack.
    pub fn consumed(self) -> usize {
        self.argc() + usize::from(self.has_receiver())
    }
}

/// What `yield_block(true)` does when nothing was prepared for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum YieldMode {
    /// A missing argument is a stack underflow.
    #[default]
    Strict,
    /// A missing argument falls back to yielding no arguments.
    Lenient,
}

#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Fail fast on stack imbalance instead of logging and continuing.
    pub check_stack: bool,
    pub yield_mode: YieldMode,
    /// Open units plus nested control-flow regions.
    pub max_nesting_depth: usize,
    pub max_pool_entries: usize,
    /// Run the static verifier over every code object as it closes.
    pub verify_units: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            check_stack: cfg!(debug_assertions),
            yield_mode: YieldMode::Strict,
            max_nesting_depth: 256,
            max_pool_entries: u16::MAX as usize,
            verify_units: cfg!(debug_assertions),
        }
    }
}

impl CompilerConfig {
    /// Every check on, regardless of build profile.
    pub fn strict() -> Self {
        CompilerConfig {
            check_stack: true,
            verify_units: true,
            ..CompilerConfig::default()
        }
    }
}

/// Backend-independent code generation operations.
///
/// Every operation reports failure through `CompileError`; a contract
/// violation means the call sequence itself is wrong and must not be retried.
pub trait Compiler: Sized {
    /// Open the single top-level unit. Nothing else is valid before this.
    fn start_script(&mut self) -> Result<(), CompileError>;

    /// Close the top-level unit. Every method unit must be closed already.
    fn end_script(&mut self) -> Result<(), CompileError>;

    /// Open a method unit; operations until the matching `end_method` emit
    /// into its body. Arguments occupy locals `0..arity`.
    fn begin_method(
        &mut self,
        friendly_name: &str,
        arity: usize,
        local_var_count: usize,
    ) -> Result<UnitHandle, CompileError>;

    /// Close the innermost method unit. The handle must be the one its
    /// `begin_method` returned.
    fn end_method(&mut self, handle: UnitHandle) -> Result<(), CompileError>;

    /// `( x -- )`
    fn consume_current_value(&mut self) -> Result<(), CompileError>;

    /// Annotate subsequent operations with a source line.
    fn line_number(&mut self, position: &SourcePosition) -> Result<(), CompileError>;

    /// `( recv? args.. -- result )`
    fn invoke_dynamic(
        &mut self,
        name: &str,
        invocation: Invocation,
        block: Option<BlockBody<'_, Self>>,
    ) -> Result<(), CompileError>;

    /// `( arg? -- result )`: call the block passed to the enclosing method.
    fn yield_block(&mut self, has_args: bool) -> Result<(), CompileError>;

    fn assign_local_variable(&mut self, index: usize) -> Result<(), CompileError>;

    fn retrieve_local_variable(&mut self, index: usize) -> Result<(), CompileError>;

    /// Assign into the frame `depth` closure levels outward.
    fn assign_local_variable_in_scope(
        &mut self,
        index: usize,
        depth: usize,
    ) -> Result<(), CompileError>;

    fn retrieve_local_variable_in_scope(
        &mut self,
        index: usize,
        depth: usize,
    ) -> Result<(), CompileError>;

    fn retrieve_self(&mut self) -> Result<(), CompileError>;

    fn create_new_fixnum(&mut self, value: i64) -> Result<(), CompileError>;

    fn create_new_bignum(&mut self, value: &BigInt) -> Result<(), CompileError>;

    /// Each evaluation yields an independent, mutable string.
    fn create_new_string(&mut self, value: &str) -> Result<(), CompileError>;

    /// Interned: equal names give the identical symbol.
    fn create_new_symbol(&mut self, name: &str) -> Result<(), CompileError>;

    /// Run `element` for each index in order, then collapse the `count`
    /// produced values into one aggregate.
    fn create_object_array(
        &mut self,
        count: usize,
        element: ArrayCallback<'_, Self>,
    ) -> Result<(), CompileError>;

    /// `( aggregate -- array )`
    fn create_new_array(&mut self) -> Result<(), CompileError>;

    fn perform_boolean_branch(
        &mut self,
        true_branch: Callback<'_, Self>,
        false_branch: Callback<'_, Self>,
    ) -> Result<(), CompileError>;

    /// Left operand is on the stack; `long_branch` runs only when it is truthy.
    fn perform_logical_and(&mut self, long_branch: Callback<'_, Self>) -> Result<(), CompileError>;

    /// Left operand is on the stack; `long_branch` runs only when it is falsy.
    fn perform_logical_or(&mut self, long_branch: Callback<'_, Self>) -> Result<(), CompileError>;

    /// `check_first` selects a pre-test (while) or post-test (do-while) loop.
    fn perform_boolean_loop(
        &mut self,
        condition: Callback<'_, Self>,
        body: Callback<'_, Self>,
        check_first: bool,
    ) -> Result<(), CompileError>;

    fn create_new_closure(
        &mut self,
        scope: &StaticScope,
        arity: usize,
        body: Callback<'_, Self>,
    ) -> Result<(), CompileError>;

    fn define_new_method(
        &mut self,
        name: &str,
        arity: usize,
        local_var_count: usize,
        body: Callback<'_, Self>,
    ) -> Result<(), CompileError>;

    fn define_alias(&mut self, new_name: &str, old_name: &str) -> Result<(), CompileError>;

    fn retrieve_constant(&mut self, name: &str) -> Result<(), CompileError>;

    fn assign_constant(&mut self, name: &str) -> Result<(), CompileError>;

    fn load_false(&mut self) -> Result<(), CompileError>;

    fn load_true(&mut self) -> Result<(), CompileError>;

    fn load_nil(&mut self) -> Result<(), CompileError>;

    fn retrieve_instance_variable(&mut self, name: &str) -> Result<(), CompileError>;

    fn assign_instance_variable(&mut self, name: &str) -> Result<(), CompileError>;

    fn assign_global_variable(&mut self, name: &str) -> Result<(), CompileError>;

    fn retrieve_global_variable(&mut self, name: &str) -> Result<(), CompileError>;

    /// `( x -- !x )`
    fn negate_current_value(&mut self) -> Result<(), CompileError>;
}
