use std::cell::RefCell;
use std::rc::Rc;

use crate::lang::value::Value;

/// Local variable storage of one activation. Closures keep their defining
/// environment alive through `parent`.
#[derive(Debug)]
pub struct Env {
    locals: RefCell<Vec<Value>>,
    parent: Option<Rc<Env>>,
}

impl Env {
    pub fn new(size: usize, parent: Option<Rc<Env>>) -> Rc<Env> {
        Rc::new(Env {
            locals: RefCell::new(vec![Value::Nil; size]),
            parent,
        })
    }

    /// Unassigned slots read as nil.
    pub fn get(&self, index: usize) -> Value {
        self.locals
            .borrow()
            .get(index)
            .cloned()
            .unwrap_or(Value::Nil)
    }

    pub fn set(&self, index: usize, value: Value) {
        let mut locals = self.locals.borrow_mut();
        if index >= locals.len() {
            locals.resize(index + 1, Value::Nil);
        }
        locals[index] = value;
    }

    /// The environment `depth` levels outward; `0` is this one.
    pub fn ancestor(&self, depth: usize) -> Option<&Env> {
        let mut env = self;
        for _ in 0..depth {
            env = env.parent.as_deref()?;
        }
        Some(env)
    }

    pub fn len(&self) -> usize {
        self.locals.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locals.borrow().is_empty()
    }
}

/// A block or lambda: code plus everything it closed over.
#[derive(Debug)]
pub struct Proc {
    pub code: u32,
    pub arity: usize,
    pub env: Rc<Env>,
    pub self_value: Value,
    /// Block of the method the closure was created in; `yield` targets it.
    pub block: Option<Rc<Proc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_reads_nil_and_grows() {
        let env = Env::new(1, None);
        assert!(env.get(5).is_nil());

        env.set(3, Value::Fixnum(9));
        assert_eq!(env.len(), 4);
        assert!(matches!(env.get(3), Value::Fixnum(9)));
    }

    #[test]
    fn test_ancestor_chain() {
        let outer = Env::new(1, None);
        outer.set(0, Value::Fixnum(1));
        let inner = Env::new(1, Some(Rc::clone(&outer)));

        let found = inner.ancestor(1).unwrap();
        assert!(matches!(found.get(0), Value::Fixnum(1)));
        assert!(inner.ancestor(2).is_none());

        found.set(0, Value::Fixnum(2));
        assert!(matches!(outer.get(0), Value::Fixnum(2)));
    }
}
