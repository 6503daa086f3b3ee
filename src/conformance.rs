//! Behaviour every backend must share, checked against both the bytecode
//! pipeline and the interpreter.

use proptest::prelude::*;

use crate::bytecode::BytecodeCompiler;
use crate::bytecode::emit::{Emitter, unit_depth};
use crate::codegen::{CompileError, Compiler, CompilerConfig, Invocation, Violation};
use crate::interp::Interpreter;
use crate::lang::node::{Closure, Node};
use crate::lang::scope::StaticScope;
use crate::lang::value::Value;
use crate::lang::walk::{compile_node, compile_script};
use crate::runtime::{Vm, VmConfig};

fn bytecode() -> BytecodeCompiler {
    BytecodeCompiler::with_config(CompilerConfig::strict())
}

fn interpreter() -> Interpreter {
    Interpreter::with_config(CompilerConfig::strict(), VmConfig::default()).with_captured_output()
}

/// Compile with the bytecode backend, run on the VM. Returns result and output.
fn run_bytecode(program: &Node) -> Result<(Value, String), String> {
    let mut c = bytecode();
    compile_script(&mut c, program).map_err(|e| e.to_string())?;
    let program = c.into_program().map_err(|e| e.to_string())?;
    let mut vm = Vm::new().with_captured_output();
    let value = vm.run(program).map_err(|e| e.to_string())?;
    Ok((value, vm.take_output()))
}

fn run_interpreted(program: &Node) -> Result<(Value, String), String> {
    let mut i = interpreter();
    compile_script(&mut i, program).map_err(|e| e.to_string())?;
    let value = i.result().cloned().unwrap_or(Value::Nil);
    Ok((value, i.take_output()))
}

fn both(program: &Node) -> [(Value, String); 2] {
    [
        run_bytecode(program).unwrap(),
        run_interpreted(program).unwrap(),
    ]
}

fn puts(text: &str) -> Node {
    Node::fcall("puts", vec![Node::str(text)])
}

// ─────────────────────────────── Stack balance ──────────────────────────────

fn extra_value_in_method<C: Compiler>(c: &mut C) -> Result<(), CompileError> {
    c.start_script()?;
    let handle = c.begin_method("leaky", 0, 0)?;
    c.load_nil()?;
    c.load_nil()?;
    c.end_method(handle)
}

#[test]
fn test_surplus_value_in_method_is_rejected() {
    let err = extra_value_in_method(&mut bytecode()).unwrap_err();
    assert!(matches!(
        err.violation_kind(),
        Some(Violation::UnbalancedUnit { depth: 2, .. })
    ));

    let err = extra_value_in_method(&mut interpreter()).unwrap_err();
    assert!(matches!(
        err.violation_kind(),
        Some(Violation::UnbalancedUnit { depth: 2, .. })
    ));
}

#[test]
fn test_unchecked_surplus_is_dropped_with_warning() {
    let config = CompilerConfig {
        check_stack: false,
        verify_units: false,
        ..CompilerConfig::default()
    };
    let mut c = BytecodeCompiler::with_config(config);
    extra_value_in_method(&mut c).unwrap();
    c.end_script().unwrap();
    assert!(c.into_program().is_ok());
}

// ───────────────────────────── Branch exclusivity ───────────────────────────

fn branch_on(cond: Node) -> Node {
    Node::if_else(cond, puts("then"), puts("else"))
}

#[test]
fn test_only_one_arm_runs() {
    for (_, out) in both(&branch_on(Node::True)) {
        assert_eq!(out, "then\n");
    }
    for (_, out) in both(&branch_on(Node::Nil)) {
        assert_eq!(out, "else\n");
    }
}

#[test]
fn test_interpreter_invokes_arm_callbacks_exclusively() {
    for truthy in [true, false] {
        let mut i = interpreter();
        let (mut then_calls, mut else_calls) = (0, 0);
        i.start_script().unwrap();
        if truthy {
            i.load_true().unwrap();
        } else {
            i.load_false().unwrap();
        }
        i.perform_boolean_branch(
            &mut |c: &mut Interpreter| {
                then_calls += 1;
                c.create_new_fixnum(1)
            },
            &mut |c: &mut Interpreter| {
                else_calls += 1;
                c.create_new_fixnum(0)
            },
        )
        .unwrap();

        assert_eq!((then_calls, else_calls), if truthy { (1, 0) } else { (0, 1) });
        assert_eq!(i.stack().len(), 1);
    }
}

// ───────────────────────────── Short-circuiting ─────────────────────────────

#[test]
fn test_short_circuit_skips_right_side() {
    let mut i = interpreter();
    let mut calls = 0;
    i.start_script().unwrap();

    i.load_false().unwrap();
    i.perform_logical_and(&mut |c: &mut Interpreter| {
        calls += 1;
        c.load_true()
    })
    .unwrap();
    i.consume_current_value().unwrap();

    i.load_true().unwrap();
    i.perform_logical_or(&mut |c: &mut Interpreter| {
        calls += 1;
        c.load_false()
    })
    .unwrap();

    assert_eq!(calls, 0);
    i.end_script().unwrap();
    assert!(matches!(i.result(), Some(Value::Bool(true))));
}

#[test]
fn test_short_circuit_skips_side_effects() {
    let program = Node::Seq(vec![
        Node::And(Box::new(Node::Nil), Box::new(puts("and"))),
        Node::Or(Box::new(Node::int(1)), Box::new(puts("or"))),
    ]);
    for (value, out) in both(&program) {
        assert_eq!(out, "");
        assert!(matches!(value, Value::Fixnum(1)));
    }
}

// ─────────────────────────────── Loop policy ────────────────────────────────

fn loop_body_count(check_first: bool) -> usize {
    let mut i = interpreter();
    let mut bodies = 0;
    i.start_script().unwrap();
    i.perform_boolean_loop(
        &mut |c: &mut Interpreter| c.load_false(),
        &mut |_: &mut Interpreter| {
            bodies += 1;
            Ok(())
        },
        check_first,
    )
    .unwrap();
    bodies
}

#[test]
fn test_false_condition_loop_counts() {
    assert_eq!(loop_body_count(true), 0);
    assert_eq!(loop_body_count(false), 1);

    let pre = Node::while_loop(Node::False, puts("body"));
    let post = Node::do_while(puts("body"), Node::False);
    for (_, out) in both(&pre) {
        assert_eq!(out, "");
    }
    for (_, out) in both(&post) {
        assert_eq!(out, "body\n");
    }
}

// ─────────────────────────────── Unit nesting ───────────────────────────────

fn end_outer_first<C: Compiler>(c: &mut C) -> Result<(), CompileError> {
    c.start_script()?;
    let outer = c.begin_method("outer", 0, 0)?;
    let _inner = c.begin_method("inner", 0, 0)?;
    c.end_method(outer)?;
    unreachable!("ending the outer unit first must fail")
}

#[test]
fn test_end_method_requires_innermost_handle() {
    let err = end_outer_first(&mut bytecode()).unwrap_err();
    assert!(matches!(
        err.violation_kind(),
        Some(Violation::HandleMismatch { .. })
    ));

    let err = end_outer_first(&mut interpreter()).unwrap_err();
    assert!(matches!(
        err.violation_kind(),
        Some(Violation::HandleMismatch { .. })
    ));
}

#[test]
fn test_handle_from_other_compiler_rejected() {
    let mut a = bytecode();
    let mut b = bytecode();
    a.start_script().unwrap();
    b.start_script().unwrap();
    let from_a = a.begin_method("m", 0, 0).unwrap();
    let _from_b = b.begin_method("m", 0, 0).unwrap();

    let err = b.end_method(from_a).unwrap_err();
    assert_eq!(err.violation_kind(), Some(&Violation::ForeignHandle));
}

// ──────────────────────────── Literal identity ──────────────────────────────

#[test]
fn test_symbols_identical_strings_independent() {
    // a = "x"; b = "x"; a << "y"; [a, b, :s.equal?(:s), "x".equal?("x")]
    let program = Node::Seq(vec![
        Node::assign(0, Node::str("x")),
        Node::assign(1, Node::str("x")),
        Node::binop(Node::local(0), "<<", Node::str("y")),
        Node::Array(vec![
            Node::local(0),
            Node::local(1),
            Node::call(Node::sym("s"), "equal?", vec![Node::sym("s")]),
            Node::call(Node::str("x"), "equal?", vec![Node::str("x")]),
        ]),
    ]);
    for (value, _) in both(&program) {
        assert_eq!(value.inspect(), r#"["xy", "x", true, false]"#);
    }
}

#[test]
fn test_loop_literal_is_fresh_each_iteration() {
    // i = 0; acc = []; while i < 2; s = "a"; s << "b"; acc << s; i = i + 1; end; acc
    let program = Node::Seq(vec![
        Node::assign(0, Node::int(0)),
        Node::assign(1, Node::Array(vec![])),
        Node::while_loop(
            Node::binop(Node::local(0), "<", Node::int(2)),
            Node::Seq(vec![
                Node::assign(2, Node::str("a")),
                Node::binop(Node::local(2), "<<", Node::str("b")),
                Node::binop(Node::local(1), "<<", Node::local(2)),
                Node::assign(0, Node::binop(Node::local(0), "+", Node::int(1))),
            ]),
        ),
        Node::local(1),
    ]);
    for (value, _) in both(&program) {
        assert_eq!(value.inspect(), r#"["ab", "ab"]"#);
    }
}

// ───────────────────────────── End-to-end unit ──────────────────────────────

/// Arity 1, two locals: `x = nil; x; if a then 1 else 0 end`, with a method
/// unit opened and closed inside a closure in its body.
fn scenario<C: Emitter>(c: &mut C) -> Result<(), CompileError> {
    c.start_script()?;
    let handle = c.begin_method("pick", 1, 2)?;

    c.load_nil()?;
    c.assign_local_variable(1)?;
    c.retrieve_local_variable(0)?;
    c.retrieve_local_variable(1)?;
    c.consume_current_value()?;
    c.perform_boolean_branch(
        &mut |c: &mut C| c.create_new_fixnum(1),
        &mut |c: &mut C| c.create_new_fixnum(0),
    )?;

    let scope = StaticScope::block(Vec::<String>::new());
    c.create_new_closure(&scope, 0, &mut |c: &mut C| {
        let nested = c.begin_method("nested", 0, 0)?;
        assert_ne!(nested, handle);
        c.load_nil()?;
        c.end_method(nested)?;
        c.load_nil()
    })?;
    c.consume_current_value()?;

    assert_eq!(unit_depth(c), Some(1));
    c.end_method(handle)?;
    c.end_script()
}

#[test]
fn test_end_to_end_method_unit() {
    let mut c = bytecode();
    scenario(&mut c).unwrap();
    let program = c.into_program().unwrap();
    let (pick, _) = program.find("pick").unwrap();
    assert!(program.find("nested").is_some());

    let mut vm = Vm::new();
    vm.load(program).unwrap();
    let main = vm.space().main();
    let yes = vm
        .call_code(pick, main.clone(), vec![Value::Bool(true)], None)
        .unwrap();
    let no = vm.call_code(pick, main, vec![Value::Nil], None).unwrap();
    assert!(matches!(yes, Value::Fixnum(1)));
    assert!(matches!(no, Value::Fixnum(0)));

    scenario(&mut interpreter()).unwrap();
}

// ───────────────────────────── Nesting limits ───────────────────────────────

#[test]
fn test_nesting_limit_enforced() {
    let config = CompilerConfig {
        max_nesting_depth: 4,
        ..CompilerConfig::strict()
    };
    let mut deep = Node::int(1);
    for _ in 0..8 {
        deep = Node::if_else(Node::True, deep, Node::int(0));
    }

    let mut c = BytecodeCompiler::with_config(config.clone());
    let err = compile_script(&mut c, &deep).unwrap_err();
    assert!(matches!(err, CompileError::ResourceExhausted { .. }));

    let mut i = Interpreter::with_config(config, VmConfig::default());
    let err = compile_script(&mut i, &deep).unwrap_err();
    assert!(matches!(err, CompileError::ResourceExhausted { .. }));
}

#[test]
fn test_operation_before_start_rejected() {
    let err = compile_node(&mut bytecode(), &Node::Nil).unwrap_err();
    assert_eq!(err.violation_kind(), Some(&Violation::NoOpenUnit));

    let err = compile_node(&mut interpreter(), &Node::Nil).unwrap_err();
    assert_eq!(err.violation_kind(), Some(&Violation::NoOpenUnit));
}

// ────────────────────────── Differential fuzzing ────────────────────────────

/// Locals 0..3 hold integers; local 3 is reserved for loop counters.
fn int_expr() -> impl Strategy<Value = Node> {
    let leaf = prop_oneof![
        (-1000i64..1000).prop_map(Node::int),
        (0usize..3).prop_map(Node::local),
    ];
    leaf.prop_recursive(4, 48, 3, |inner| {
        let cond = condition(inner.clone());
        prop_oneof![
            (
                inner.clone(),
                prop::sample::select(vec!["+", "-", "*"]),
                inner.clone()
            )
                .prop_map(|(l, op, r)| Node::binop(l, op, r)),
            (cond, inner.clone(), inner.clone())
                .prop_map(|(c, t, e)| Node::if_else(c, t, e)),
            (0usize..3, inner.clone()).prop_map(|(i, v)| Node::assign(i, v)),
            inner
                .clone()
                .prop_map(|v| Node::fcall("twice", vec![v])),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| {
                let doubled = Node::call(Node::Array(vec![a, b]), "map", vec![]).with_block(
                    Closure::new(["x"], Node::binop(Node::local(0), "*", Node::int(2))),
                );
                Node::call(doubled, "last", vec![])
            }),
            (inner.clone(), inner).prop_map(|(a, b)| Node::Seq(vec![a, b])),
        ]
    })
}

fn condition(int: impl Strategy<Value = Node> + Clone) -> impl Strategy<Value = Node> {
    let compare = (
        int.clone(),
        prop::sample::select(vec!["<", "==", ">"]),
        int,
    )
        .prop_map(|(l, op, r)| Node::binop(l, op, r));
    prop_oneof![
        compare.clone(),
        compare.clone().prop_map(|c| Node::Not(Box::new(c))),
        (compare.clone(), compare.clone()).prop_map(|(a, b)| Node::And(Box::new(a), Box::new(b))),
        (compare.clone(), compare).prop_map(|(a, b)| Node::Or(Box::new(a), Box::new(b))),
        Just(Node::True),
        Just(Node::Nil),
    ]
}

fn statement() -> impl Strategy<Value = Node> {
    prop_oneof![
        int_expr(),
        (0i64..4, int_expr()).prop_map(|(n, body)| {
            Node::Seq(vec![
                Node::assign(3, Node::int(0)),
                Node::while_loop(
                    Node::binop(Node::local(3), "<", Node::int(n)),
                    Node::Seq(vec![
                        body,
                        Node::assign(3, Node::binop(Node::local(3), "+", Node::int(1))),
                    ]),
                ),
            ])
        }),
    ]
}

fn program() -> impl Strategy<Value = Node> {
    (prop::collection::vec(statement(), 0..4), int_expr()).prop_map(|(statements, last)| {
        let mut body = vec![Node::def(
            "twice",
            1,
            1,
            Node::binop(Node::local(0), "+", Node::local(0)),
        )];
        body.extend((0..4).map(|i| Node::assign(i, Node::int(0))));
        body.extend(statements);
        body.push(last);
        Node::Seq(body)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_backends_agree(program in program()) {
        let (bc_value, _) = run_bytecode(&program).map_err(TestCaseError::fail)?;
        let (it_value, _) = run_interpreted(&program).map_err(TestCaseError::fail)?;
        prop_assert_eq!(bc_value.inspect(), it_value.inspect());
    }

    #[test]
    fn prop_emitted_code_is_balanced(program in program()) {
        let mut c = bytecode();
        compile_script(&mut c, &program).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let program = c.into_program().map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert!(crate::bytecode::verify::verify_program(&program).is_ok());
    }
}

// ────────────────────────────── Fault injection ─────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Step {
    Fixnum(i64),
    Nil,
    Assign(usize),
    Retrieve(usize),
    Consume,
    Add,
}

fn apply<C: Compiler>(c: &mut C, step: Step) -> Result<(), CompileError> {
    match step {
        Step::Fixnum(n) => c.create_new_fixnum(n),
        Step::Nil => c.load_nil(),
        Step::Assign(i) => c.assign_local_variable(i),
        Step::Retrieve(i) => c.retrieve_local_variable(i),
        Step::Consume => c.consume_current_value(),
        Step::Add => c.invoke_dynamic("+", Invocation::Method { argc: 1 }, None),
    }
}

/// Record `steps` as the body of a method with four locals.
fn record_method<C: Compiler>(c: &mut C, steps: &[Step]) -> Result<(), CompileError> {
    c.start_script()?;
    let handle = c.begin_method("m", 0, 4)?;
    for &step in steps {
        apply(c, step)?;
    }
    c.end_method(handle)?;
    c.end_script()
}

/// A statement that leaves the stack as it found it.
fn balanced_statement() -> impl Strategy<Value = Vec<Step>> {
    let local = 0usize..4;
    prop_oneof![
        (any::<i64>(), local.clone()).prop_map(|(n, i)| vec![Step::Fixnum(n), Step::Assign(i)]),
        (local.clone(), local.clone()).prop_map(|(a, b)| {
            vec![Step::Retrieve(a), Step::Retrieve(b), Step::Add, Step::Consume]
        }),
        Just(vec![Step::Nil, Step::Consume]),
        (-100i64..100, -100i64..100, local).prop_map(|(a, b, i)| {
            vec![Step::Fixnum(a), Step::Fixnum(b), Step::Add, Step::Assign(i)]
        }),
    ]
}

/// Balanced statements followed by a single result value, plus the offsets
/// between statements.
fn method_body() -> impl Strategy<Value = (Vec<Step>, Vec<usize>)> {
    prop::collection::vec(balanced_statement(), 0..6).prop_map(|statements| {
        let mut steps = Vec::new();
        let mut boundaries = vec![0];
        for statement in statements {
            steps.extend(statement);
            boundaries.push(steps.len());
        }
        steps.push(Step::Retrieve(0));
        (steps, boundaries)
    })
}

/// A body with one stray value pushed anywhere before the result, or one
/// pop between statements where the stack is empty.
fn faulty_body() -> impl Strategy<Value = Vec<Step>> {
    (method_body(), any::<bool>(), any::<prop::sample::Index>()).prop_map(
        |((mut steps, boundaries), extra_push, at)| {
            if extra_push {
                let pos = at.index(steps.len());
                steps.insert(pos, Step::Nil);
            } else {
                let pos = boundaries[at.index(boundaries.len())];
                steps.insert(pos, Step::Consume);
            }
            steps
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_balanced_bodies_accepted((steps, _) in method_body()) {
        prop_assert!(record_method(&mut bytecode(), &steps).is_ok());
        prop_assert!(record_method(&mut interpreter(), &steps).is_ok());
    }

    #[test]
    fn prop_single_stack_fault_is_violation(steps in faulty_body()) {
        let err = record_method(&mut bytecode(), &steps).unwrap_err();
        prop_assert!(err.is_contract_violation(), "bytecode: {}", err);

        let err = record_method(&mut interpreter(), &steps).unwrap_err();
        prop_assert!(err.is_contract_violation(), "interpreter: {}", err);
    }
}

#[test]
fn test_invocation_consumes_receiver_and_args() {
    let mut i = interpreter();
    i.start_script().unwrap();
    i.create_new_fixnum(1).unwrap();
    let err = i
        .invoke_dynamic("+", Invocation::Method { argc: 1 }, None)
        .unwrap_err();
    assert!(matches!(
        err.violation_kind(),
        Some(Violation::StackUnderflow { needed: 2, available: 1, .. })
    ));
}
