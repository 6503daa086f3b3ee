use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use num_bigint::BigInt;

use super::symbol::Symbol;
use crate::runtime::frame::Proc;

/// Runtime value of the dynamic language.
///
/// Immediates (`nil`, booleans, Fixnums, Symbols) compare by value; every
/// other variant is a reference and has identity.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),

    /// Fixed-width integer fast path.
    Fixnum(i64),

    /// Arbitrary-precision integer. Never holds a value that fits `i64`
    /// when produced through [`Value::integer`].
    Bignum(Rc<BigInt>),

    /// Mutable string; every literal evaluation yields a fresh one.
    String(Rc<RefCell<String>>),

    Symbol(Symbol),

    Array(Rc<RefCell<Vec<Value>>>),

    /// Closure over a code object and its defining environment.
    Proc(Rc<Proc>),

    /// Class reference, by name.
    Class(Rc<str>),

    Object(Rc<Instance>),
}

/// A plain object: identity plus an instance variable table.
#[derive(Debug)]
pub struct Instance {
    pub id: u64,
    pub class: Rc<str>,
    pub ivars: RefCell<HashMap<String, Value>>,
}

impl Instance {
    pub fn new(id: u64, class: impl Into<Rc<str>>) -> Self {
        Self {
            id,
            class: class.into(),
            ivars: RefCell::new(HashMap::new()),
        }
    }
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(Rc::new(RefCell::new(s.into())))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    /// Box an integer, taking the Fixnum path whenever it fits.
    pub fn integer(n: BigInt) -> Self {
        match i64::try_from(&n) {
            Ok(small) => Value::Fixnum(small),
            Err(_) => Value::Bignum(Rc::new(n)),
        }
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn class_name(&self) -> &str {
        match self {
            Value::Nil => "NilClass",
            Value::Bool(true) => "TrueClass",
            Value::Bool(false) => "FalseClass",
            Value::Fixnum(_) => "Fixnum",
            Value::Bignum(_) => "Bignum",
            Value::String(_) => "String",
            Value::Symbol(_) => "Symbol",
            Value::Array(_) => "Array",
            Value::Proc(_) => "Proc",
            Value::Class(_) => "Class",
            Value::Object(obj) => &obj.class,
        }
    }

    /// `==` semantics: numeric, textual and element-wise equality; identity
    /// for objects and procs. Arrays that contain themselves compare equal
    /// once the same pair is reached again.
    pub fn equals(&self, other: &Value) -> bool {
        self.equals_guarded(other, &mut Vec::new())
    }

    fn equals_guarded(&self, other: &Value, in_progress: &mut Vec<(usize, usize)>) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Fixnum(a), Value::Fixnum(b)) => a == b,
            (Value::Bignum(a), Value::Bignum(b)) => a == b,
            (Value::Fixnum(a), Value::Bignum(b)) | (Value::Bignum(b), Value::Fixnum(a)) => {
                BigInt::from(*a) == **b
            }
            (Value::String(a), Value::String(b)) => *a.borrow() == *b.borrow(),
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let pair = (Rc::as_ptr(a) as usize, Rc::as_ptr(b) as usize);
                if in_progress.contains(&pair) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                if a.len() != b.len() {
                    return false;
                }
                in_progress.push(pair);
                let equal = a
                    .iter()
                    .zip(b.iter())
                    .all(|(x, y)| x.equals_guarded(y, in_progress));
                in_progress.pop();
                equal
            }
            (Value::Class(a), Value::Class(b)) => a == b,
            _ => self.same(other),
        }
    }

    /// `equal?` semantics: object identity.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Fixnum(a), Value::Fixnum(b)) => a == b,
            (Value::Bignum(a), Value::Bignum(b)) => Rc::ptr_eq(a, b),
            (Value::String(a), Value::String(b)) => Rc::ptr_eq(a, b),
            (Value::Symbol(a), Value::Symbol(b)) => a.same(b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Proc(a), Value::Proc(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Developer-facing rendering, as `p` prints it. A container reached
    /// again while it is being printed renders as `[...]` or `#<Class ...>`.
    pub fn inspect(&self) -> String {
        self.inspect_guarded(&mut Vec::new())
    }

    fn inspect_guarded(&self, open: &mut Vec<usize>) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::String(s) => format!("{:?}", s.borrow()),
            Value::Symbol(sym) => format!(":{}", sym.name()),
            Value::Array(items) => {
                let id = Rc::as_ptr(items) as usize;
                if open.contains(&id) {
                    return "[...]".to_string();
                }
                open.push(id);
                let parts: Vec<String> = items
                    .borrow()
                    .iter()
                    .map(|item| item.inspect_guarded(open))
                    .collect();
                open.pop();
                format!("[{}]", parts.join(", "))
            }
            Value::Object(obj) if &*obj.class == "main" => "main".to_string(),
            Value::Object(obj) => {
                let id = Rc::as_ptr(obj) as usize;
                let ivars = obj.ivars.borrow();
                if ivars.is_empty() {
                    return format!("#<{}>", obj.class);
                }
                if open.contains(&id) {
                    return format!("#<{} ...>", obj.class);
                }
                open.push(id);
                let mut names: Vec<&String> = ivars.keys().collect();
                names.sort();
                let parts: Vec<String> = names
                    .into_iter()
                    .map(|name| format!("{}={}", name, ivars[name].inspect_guarded(open)))
                    .collect();
                open.pop();
                format!("#<{} {}>", obj.class, parts.join(", "))
            }
            other => other.to_string(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Fixnum(n)
    }
}

impl fmt::Display for Value {
    /// `to_s` rendering.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Fixnum(n) => write!(f, "{}", n),
            Value::Bignum(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s.borrow()),
            Value::Symbol(sym) => write!(f, "{}", sym),
            Value::Array(_) => write!(f, "{}", self.inspect()),
            Value::Proc(p) => write!(f, "#<Proc:code[{}]>", p.code),
            Value::Class(name) => write!(f, "{}", name),
            Value::Object(obj) if &*obj.class == "main" => write!(f, "main"),
            Value::Object(obj) => write!(f, "#<{}>", obj.class),
        }
    }
}
