//! Depth-first driver: turns a [`Node`] tree into contract operations.

use crate::codegen::{BlockBody, CompileError, Compiler, Invocation};
use crate::lang::node::{Closure, Node};

/// Drive a whole program through `c`: start, body, end.
pub fn compile_script<C: Compiler>(c: &mut C, program: &Node) -> Result<(), CompileError> {
    c.start_script()?;
    compile_node(c, program)?;
    c.end_script()
}

/// Issue the operations for `node`. Leaves exactly one value.
pub fn compile_node<C: Compiler>(c: &mut C, node: &Node) -> Result<(), CompileError> {
    match node {
        Node::Nil => c.load_nil(),
        Node::True => c.load_true(),
        Node::False => c.load_false(),
        Node::SelfRef => c.retrieve_self(),
        Node::Fixnum(n) => c.create_new_fixnum(*n),
        Node::Bignum(n) => c.create_new_bignum(n),
        Node::Str(s) => c.create_new_string(s),
        Node::Symbol(s) => c.create_new_symbol(s),
        Node::Array(items) => c.create_object_array(items.len(), &mut |c: &mut C, i| {
            compile_node(c, &items[i])
        }),
        Node::ToArray(value) => {
            compile_node(c, value)?;
            c.create_new_array()
        }

        Node::Local { index, depth } => c.retrieve_local_variable_in_scope(*index, *depth),
        Node::LocalAsgn {
            index,
            depth,
            value,
        } => {
            compile_node(c, value)?;
            c.assign_local_variable_in_scope(*index, *depth)?;
            c.retrieve_local_variable_in_scope(*index, *depth)
        }
        Node::Ivar(name) => c.retrieve_instance_variable(name),
        Node::IvarAsgn(name, value) => {
            compile_node(c, value)?;
            c.assign_instance_variable(name)?;
            c.retrieve_instance_variable(name)
        }
        Node::Global(name) => c.retrieve_global_variable(name),
        Node::GlobalAsgn(name, value) => {
            compile_node(c, value)?;
            c.assign_global_variable(name)?;
            c.retrieve_global_variable(name)
        }
        Node::Const(name) => c.retrieve_constant(name),
        Node::ConstAsgn(name, value) => {
            compile_node(c, value)?;
            c.assign_constant(name)?;
            c.retrieve_constant(name)
        }

        Node::Call {
            receiver,
            name,
            args,
            block,
        } => compile_call(c, receiver.as_deref(), name, args, block.as_ref()),
        Node::Yield(arg) => match arg {
            Some(arg) => {
                compile_node(c, arg)?;
                c.yield_block(true)
            }
            None => c.yield_block(false),
        },

        Node::If {
            cond,
            then,
            otherwise,
        } => {
            compile_node(c, cond)?;
            c.perform_boolean_branch(
                &mut |c: &mut C| compile_node(c, then),
                &mut |c: &mut C| match otherwise {
                    Some(otherwise) => compile_node(c, otherwise),
                    None => c.load_nil(),
                },
            )
        }
        Node::And(left, right) => {
            compile_node(c, left)?;
            c.perform_logical_and(&mut |c: &mut C| compile_node(c, right))
        }
        Node::Or(left, right) => {
            compile_node(c, left)?;
            c.perform_logical_or(&mut |c: &mut C| compile_node(c, right))
        }
        Node::Not(value) => {
            compile_node(c, value)?;
            c.negate_current_value()
        }
        Node::While {
            cond,
            body,
            check_first,
        } => {
            c.perform_boolean_loop(
                &mut |c: &mut C| compile_node(c, cond),
                &mut |c: &mut C| compile_node(c, body),
                *check_first,
            )?;
            c.load_nil()
        }
        Node::Seq(statements) => match statements.split_last() {
            Some((last, init)) => {
                for statement in init {
                    compile_node(c, statement)?;
                    c.consume_current_value()?;
                }
                compile_node(c, last)
            }
            None => c.load_nil(),
        },

        Node::Def {
            name,
            arity,
            locals,
            body,
        } => {
            c.define_new_method(name, *arity, *locals, &mut |c: &mut C| {
                compile_node(c, body)
            })?;
            c.load_nil()
        }
        Node::Alias { new_name, old_name } => {
            c.define_alias(new_name, old_name)?;
            c.load_nil()
        }
        Node::Lambda(closure) => c.create_new_closure(
            &closure.scope,
            closure.arity,
            &mut |c: &mut C| compile_node(c, &closure.body),
        ),

        Node::Newline(position, body) => {
            c.line_number(position)?;
            compile_node(c, body)
        }
    }
}

fn compile_call<C: Compiler>(
    c: &mut C,
    receiver: Option<&Node>,
    name: &str,
    args: &[Node],
    block: Option<&Closure>,
) -> Result<(), CompileError> {
    if let Some(receiver) = receiver {
        compile_node(c, receiver)?;
    }
    for arg in args {
        compile_node(c, arg)?;
    }

    let invocation = Invocation::new(receiver.is_some(), args.len());
    match block {
        Some(closure) => c.invoke_dynamic(
            name,
            invocation,
            Some(BlockBody {
                scope: &closure.scope,
                arity: closure.arity,
                body: &mut |c: &mut C| compile_node(c, &closure.body),
            }),
        ),
        None => c.invoke_dynamic(name, invocation, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{BytecodeCompiler, Op};
    use crate::codegen::CompilerConfig;

    fn ops_for(program: &Node) -> Vec<Op> {
        let mut c = BytecodeCompiler::with_config(CompilerConfig::strict());
        compile_script(&mut c, program).unwrap();
        let program = c.into_program().unwrap();
        program.main().unwrap().ops.clone()
    }

    #[test]
    fn test_seq_discards_all_but_last() {
        let ops = ops_for(&Node::Seq(vec![Node::int(1), Node::int(2)]));
        assert_eq!(
            ops,
            vec![Op::PushFixnum(1), Op::Pop, Op::PushFixnum(2), Op::Return]
        );
    }

    #[test]
    fn test_empty_seq_is_nil() {
        let ops = ops_for(&Node::Seq(vec![]));
        assert_eq!(ops, vec![Op::PushNil, Op::Return]);
    }

    #[test]
    fn test_assignment_reads_back_value() {
        let ops = ops_for(&Node::assign(0, Node::int(5)));
        assert_eq!(
            ops,
            vec![
                Op::PushFixnum(5),
                Op::SetLocal(0),
                Op::GetLocal(0),
                Op::Return
            ]
        );
    }

    #[test]
    fn test_call_shapes() {
        let ops = ops_for(&Node::fcall("puts", vec![Node::int(1)]));
        assert!(matches!(
            ops[1],
            Op::Send {
                argc: 1,
                receiver: false,
                block: None,
                ..
            }
        ));

        let ops = ops_for(&Node::call(Node::int(1), "succ", vec![]));
        assert!(matches!(
            ops[1],
            Op::Send {
                argc: 0,
                receiver: true,
                ..
            }
        ));
    }

    #[test]
    fn test_if_without_else_is_nil() {
        let program = Node::If {
            cond: Box::new(Node::False),
            then: Box::new(Node::int(1)),
            otherwise: None,
        };
        let ops = ops_for(&program);
        assert!(ops.contains(&Op::PushNil));
    }
}
