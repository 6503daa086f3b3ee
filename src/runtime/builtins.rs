//! Builtin methods of the core types and of `Kernel`.
//!
//! Each dispatcher returns `Ok(None)` when it does not know the method so the
//! VM can continue down the lookup order.

use std::cmp::Ordering;
use std::rc::Rc;

use num_bigint::{BigInt, Sign};

use crate::lang::value::Value;
use crate::runtime::frame::Proc;
use crate::runtime::runtime_error::{
    ErrorKind, RuntimeError, divided_by_zero, type_error, wrong_arity,
};
use crate::runtime::vm::Vm;

type BuiltinResult = Result<Option<Value>, RuntimeError>;

/// Largest array `[]=` may grow to.
const MAX_ARRAY_LEN: usize = 1 << 24;
/// Largest string `String#*` may build, in bytes.
const MAX_STRING_LEN: usize = 1 << 28;

const INTEGER_METHODS: &[&str] = &[
    "+", "-", "*", "/", "%", "<", ">", "<=", ">=", "==", "<=>", "-@", "to_s", "zero?", "times",
    "succ", "abs", "even?", "odd?",
];
const STRING_METHODS: &[&str] = &[
    "+", "<<", "length", "size", "==", "to_s", "to_sym", "upcase", "reverse", "empty?", "*", "dup",
];
const SYMBOL_METHODS: &[&str] = &["to_s", "to_sym"];
const ARRAY_METHODS: &[&str] = &[
    "length", "size", "[]", "[]=", "<<", "push", "first", "last", "each", "map", "collect",
    "join", "empty?", "include?", "pop", "reverse", "to_a",
];
const PROC_METHODS: &[&str] = &["call", "[]", "arity"];
const CLASS_METHODS: &[&str] = &["new", "name"];
const NIL_METHODS: &[&str] = &["to_s", "to_a"];
const KERNEL_METHODS: &[&str] = &[
    "puts", "print", "p", "block_given?", "proc", "lambda", "nil?", "==", "!=", "!", "equal?",
    "inspect", "to_s", "class",
];

/// True for any name some builtin answers to.
pub fn is_builtin(name: &str) -> bool {
    [
        INTEGER_METHODS,
        STRING_METHODS,
        SYMBOL_METHODS,
        ARRAY_METHODS,
        PROC_METHODS,
        CLASS_METHODS,
        NIL_METHODS,
        KERNEL_METHODS,
    ]
    .iter()
    .any(|table| table.contains(&name))
}

fn expect_args(args: &[Value], expected: usize) -> Result<(), RuntimeError> {
    if args.len() != expected {
        return Err(wrong_arity(args.len(), expected));
    }
    Ok(())
}

fn require_block<'a>(block: Option<&'a Rc<Proc>>) -> Result<&'a Rc<Proc>, RuntimeError> {
    block.ok_or_else(|| RuntimeError::new(ErrorKind::LocalJumpError, "no block given (yield)"))
}

/// Methods defined on the receiver's own type.
pub(crate) fn call_method(
    vm: &mut Vm,
    recv: &Value,
    name: &str,
    args: &[Value],
    block: Option<&Rc<Proc>>,
) -> BuiltinResult {
    match recv {
        Value::Fixnum(_) | Value::Bignum(_) => integer_method(vm, recv, name, args, block),
        Value::String(_) => string_method(vm, recv, name, args),
        Value::Symbol(sym) => match name {
            "to_s" => {
                expect_args(args, 0)?;
                Ok(Some(Value::string(sym.name())))
            }
            "to_sym" => Ok(Some(recv.clone())),
            _ => Ok(None),
        },
        Value::Array(_) => array_method(vm, recv, name, args, block),
        Value::Proc(p) => match name {
            "call" | "[]" => vm.call_proc(p, args.to_vec()).map(Some),
            "arity" => Ok(Some(Value::Fixnum(p.arity as i64))),
            _ => Ok(None),
        },
        Value::Class(class) => match name {
            "new" if &**class == "Object" => {
                expect_args(args, 0)?;
                Ok(Some(vm.space_mut().new_object(class)))
            }
            "new" => Err(RuntimeError::new(
                ErrorKind::TypeError,
                format!("allocator undefined for {}", class),
            )),
            "name" => Ok(Some(Value::string(&**class))),
            _ => Ok(None),
        },
        Value::Nil => match name {
            "to_s" => Ok(Some(Value::string(""))),
            "to_a" => Ok(Some(Value::array(Vec::new()))),
            _ => Ok(None),
        },
        Value::Bool(_) | Value::Object(_) => Ok(None),
    }
}

// =============================================================================
// Integers
// =============================================================================

fn to_big(value: &Value) -> Option<BigInt> {
    match value {
        Value::Fixnum(n) => Some(BigInt::from(*n)),
        Value::Bignum(n) => Some((**n).clone()),
        _ => None,
    }
}

fn int_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Fixnum(x), Value::Fixnum(y)) => Some(x.cmp(y)),
        _ => Some(to_big(a)?.cmp(&to_big(b)?)),
    }
}

fn floor_div(a: i64, b: i64) -> Option<(i64, i64)> {
    let q = a.checked_div(b)?;
    let r = a.checked_rem(b)?;
    if r != 0 && (r < 0) != (b < 0) {
        Some((q - 1, r + b))
    } else {
        Some((q, r))
    }
}

fn big_floor_div(a: &BigInt, b: &BigInt) -> (BigInt, BigInt) {
    let mut q = a / b;
    let mut r = a % b;
    if r.sign() != Sign::NoSign && (r.sign() == Sign::Minus) != (b.sign() == Sign::Minus) {
        q -= BigInt::from(1);
        r += b;
    }
    (q, r)
}

fn int_arith(name: &str, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    if let (Value::Fixnum(x), Value::Fixnum(y)) = (a, b) {
        let (x, y) = (*x, *y);
        if matches!(name, "/" | "%") && y == 0 {
            return Err(divided_by_zero());
        }
        let fast = match name {
            "+" => x.checked_add(y),
            "-" => x.checked_sub(y),
            "*" => x.checked_mul(y),
            "/" => floor_div(x, y).map(|(q, _)| q),
            "%" => floor_div(x, y).map(|(_, r)| r),
            _ => None,
        };
        if let Some(n) = fast {
            return Ok(Value::Fixnum(n));
        }
    }

    let x = to_big(a).ok_or_else(|| type_error("Integer", a))?;
    let y = to_big(b).ok_or_else(|| type_error("Integer", b))?;
    let result = match name {
        "+" => x + y,
        "-" => x - y,
        "*" => x * y,
        "/" | "%" => {
            if y.sign() == Sign::NoSign {
                return Err(divided_by_zero());
            }
            let (q, r) = big_floor_div(&x, &y);
            if name == "/" { q } else { r }
        }
        other => {
            return Err(RuntimeError::internal(format!(
                "not an arithmetic operator: {}",
                other
            )));
        }
    };
    Ok(Value::integer(result))
}

fn integer_method(
    vm: &mut Vm,
    recv: &Value,
    name: &str,
    args: &[Value],
    block: Option<&Rc<Proc>>,
) -> BuiltinResult {
    let value = match name {
        "+" | "-" | "*" | "/" | "%" => {
            expect_args(args, 1)?;
            int_arith(name, recv, &args[0])?
        }
        "<" | ">" | "<=" | ">=" => {
            expect_args(args, 1)?;
            let ord = int_cmp(recv, &args[0]).ok_or_else(|| {
                RuntimeError::new(
                    ErrorKind::ArgumentError,
                    format!(
                        "comparison of {} with {} failed",
                        recv.class_name(),
                        args[0].inspect()
                    ),
                )
            })?;
            Value::Bool(match name {
                "<" => ord == Ordering::Less,
                ">" => ord == Ordering::Greater,
                "<=" => ord != Ordering::Greater,
                _ => ord != Ordering::Less,
            })
        }
        "==" => {
            expect_args(args, 1)?;
            Value::Bool(recv.equals(&args[0]))
        }
        "<=>" => {
            expect_args(args, 1)?;
            match int_cmp(recv, &args[0]) {
                Some(ord) => Value::Fixnum(ord as i64),
                None => Value::Nil,
            }
        }
        "-@" => int_arith("-", &Value::Fixnum(0), recv)?,
        "to_s" => Value::string(recv.to_string()),
        "zero?" => Value::Bool(matches!(recv, Value::Fixnum(0))),
        "succ" => int_arith("+", recv, &Value::Fixnum(1))?,
        "abs" => match recv {
            Value::Fixnum(n) if *n >= 0 => recv.clone(),
            _ if int_cmp(recv, &Value::Fixnum(0)) == Some(Ordering::Less) => {
                int_arith("-", &Value::Fixnum(0), recv)?
            }
            _ => recv.clone(),
        },
        "even?" | "odd?" => {
            let rem = int_arith("%", recv, &Value::Fixnum(2))?;
            Value::Bool(matches!(rem, Value::Fixnum(0)) == (name == "even?"))
        }
        "times" => {
            let block = require_block(block)?;
            let count = match recv {
                Value::Fixnum(n) => *n,
                _ => return Err(type_error("Fixnum", recv)),
            };
            for i in 0..count {
                vm.call_proc(block, vec![Value::Fixnum(i)])?;
            }
            recv.clone()
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

// =============================================================================
// Strings
// =============================================================================

fn string_method(vm: &mut Vm, recv: &Value, name: &str, args: &[Value]) -> BuiltinResult {
    let Value::String(s) = recv else {
        return Ok(None);
    };
    let value = match name {
        "+" => {
            expect_args(args, 1)?;
            match &args[0] {
                Value::String(other) => {
                    Value::string(format!("{}{}", s.borrow(), other.borrow()))
                }
                other => return Err(type_error("String", other)),
            }
        }
        "<<" => {
            expect_args(args, 1)?;
            let appended = match &args[0] {
                Value::String(other) => other.borrow().clone(),
                other => return Err(type_error("String", other)),
            };
            s.borrow_mut().push_str(&appended);
            recv.clone()
        }
        "length" | "size" => Value::Fixnum(s.borrow().chars().count() as i64),
        "==" => {
            expect_args(args, 1)?;
            Value::Bool(recv.equals(&args[0]))
        }
        "to_s" => recv.clone(),
        "to_sym" => Value::Symbol(vm.space_mut().symbol(&s.borrow())),
        "upcase" => Value::string(s.borrow().to_uppercase()),
        "reverse" => Value::string(s.borrow().chars().rev().collect::<String>()),
        "empty?" => Value::Bool(s.borrow().is_empty()),
        "*" => {
            expect_args(args, 1)?;
            match &args[0] {
                Value::Fixnum(n) if *n >= 0 => {
                    let s = s.borrow();
                    let fits = usize::try_from(*n)
                        .ok()
                        .and_then(|n| s.len().checked_mul(n))
                        .is_some_and(|len| len <= MAX_STRING_LEN);
                    if !fits {
                        return Err(RuntimeError::new(
                            ErrorKind::ArgumentError,
                            "argument too big",
                        ));
                    }
                    Value::string(s.repeat(*n as usize))
                }
                Value::Fixnum(_) => {
                    return Err(RuntimeError::new(
                        ErrorKind::ArgumentError,
                        "negative argument",
                    ));
                }
                other => return Err(type_error("Integer", other)),
            }
        }
        "dup" => Value::string(s.borrow().clone()),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

// =============================================================================
// Arrays
// =============================================================================

fn index_arg(value: &Value) -> Result<i64, RuntimeError> {
    match value {
        Value::Fixnum(n) => Ok(*n),
        other => Err(type_error("Integer", other)),
    }
}

fn array_method(
    vm: &mut Vm,
    recv: &Value,
    name: &str,
    args: &[Value],
    block: Option<&Rc<Proc>>,
) -> BuiltinResult {
    let Value::Array(items) = recv else {
        return Ok(None);
    };
    let value = match name {
        "length" | "size" => Value::Fixnum(items.borrow().len() as i64),
        "[]" => {
            expect_args(args, 1)?;
            let items = items.borrow();
            let i = index_arg(&args[0])?;
            let i = if i < 0 { i + items.len() as i64 } else { i };
            usize::try_from(i)
                .ok()
                .and_then(|i| items.get(i).cloned())
                .unwrap_or(Value::Nil)
        }
        "[]=" => {
            expect_args(args, 2)?;
            let mut items = items.borrow_mut();
            let raw = index_arg(&args[0])?;
            let i = if raw < 0 { raw + items.len() as i64 } else { raw };
            let i = usize::try_from(i).map_err(|_| {
                RuntimeError::new(
                    ErrorKind::IndexError,
                    format!("index {} too small for array", raw),
                )
            })?;
            if i >= MAX_ARRAY_LEN {
                return Err(RuntimeError::new(
                    ErrorKind::IndexError,
                    format!("index {} too big", raw),
                ));
            }
            if i >= items.len() {
                items.resize(i + 1, Value::Nil);
            }
            items[i] = args[1].clone();
            args[1].clone()
        }
        "<<" | "push" => {
            items.borrow_mut().extend(args.iter().cloned());
            recv.clone()
        }
        "first" => items.borrow().first().cloned().unwrap_or(Value::Nil),
        "last" => items.borrow().last().cloned().unwrap_or(Value::Nil),
        "pop" => items.borrow_mut().pop().unwrap_or(Value::Nil),
        "each" => {
            let block = require_block(block)?;
            let snapshot = items.borrow().clone();
            for item in snapshot {
                vm.call_proc(block, vec![item])?;
            }
            recv.clone()
        }
        "map" | "collect" => {
            let block = require_block(block)?;
            let snapshot = items.borrow().clone();
            let mut mapped = Vec::with_capacity(snapshot.len());
            for item in snapshot {
                mapped.push(vm.call_proc(block, vec![item])?);
            }
            Value::array(mapped)
        }
        "join" => {
            let sep = match args.first() {
                None | Some(Value::Nil) => String::new(),
                Some(Value::String(s)) => s.borrow().clone(),
                Some(other) => return Err(type_error("String", other)),
            };
            let parts: Vec<String> = items.borrow().iter().map(|v| v.to_string()).collect();
            Value::string(parts.join(&sep))
        }
        "empty?" => Value::Bool(items.borrow().is_empty()),
        "include?" => {
            expect_args(args, 1)?;
            Value::Bool(items.borrow().iter().any(|v| v.equals(&args[0])))
        }
        "reverse" => Value::array(items.borrow().iter().rev().cloned().collect()),
        "to_a" => recv.clone(),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

// =============================================================================
// Kernel
// =============================================================================

/// `open` holds the arrays currently being flattened; meeting one again
/// prints `[...]`.
fn puts_lines(value: &Value, out: &mut String, open: &mut Vec<usize>) {
    match value {
        Value::Array(items) => {
            let id = Rc::as_ptr(items) as usize;
            if open.contains(&id) {
                out.push_str("[...]\n");
                return;
            }
            open.push(id);
            let items = items.borrow();
            if items.is_empty() {
                out.push('\n');
            }
            for item in items.iter() {
                puts_lines(item, out, open);
            }
            open.pop();
        }
        other => {
            let text = other.to_string();
            out.push_str(&text);
            if !text.ends_with('\n') {
                out.push('\n');
            }
        }
    }
}

/// Methods every object answers to, tried after the receiver's own and the
/// user-defined ones.
pub(crate) fn call_kernel(
    vm: &mut Vm,
    recv: &Value,
    name: &str,
    args: &[Value],
    block: Option<&Rc<Proc>>,
) -> BuiltinResult {
    let value = match name {
        "puts" => {
            let mut out = String::new();
            if args.is_empty() {
                out.push('\n');
            }
            for arg in args {
                puts_lines(arg, &mut out, &mut Vec::new());
            }
            vm.write_output(&out);
            Value::Nil
        }
        "print" => {
            let out: String = args.iter().map(|v| v.to_string()).collect();
            vm.write_output(&out);
            Value::Nil
        }
        "p" => {
            let mut out = String::new();
            for arg in args {
                out.push_str(&arg.inspect());
                out.push('\n');
            }
            vm.write_output(&out);
            match args {
                [] => Value::Nil,
                [one] => one.clone(),
                many => Value::array(many.to_vec()),
            }
        }
        "block_given?" => Value::Bool(vm.block_given()),
        "proc" | "lambda" => Value::Proc(Rc::clone(require_block(block)?)),
        "nil?" => Value::Bool(recv.is_nil()),
        "==" => {
            expect_args(args, 1)?;
            Value::Bool(recv.equals(&args[0]))
        }
        "!=" => {
            expect_args(args, 1)?;
            Value::Bool(!recv.equals(&args[0]))
        }
        "!" => Value::Bool(!recv.is_truthy()),
        "equal?" => {
            expect_args(args, 1)?;
            Value::Bool(recv.same(&args[0]))
        }
        "inspect" => Value::string(recv.inspect()),
        "to_s" => Value::string(recv.to_string()),
        "class" => Value::Class(Rc::from(recv.class_name())),
        _ => return Ok(None),
    };
    Ok(Some(value))
}
