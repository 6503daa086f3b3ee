use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::lang::symbol::{Symbol, SymbolTable};
use crate::lang::value::{Instance, Value};
use crate::runtime::builtins;
use crate::runtime::runtime_error::{ErrorKind, RuntimeError};

pub const MAIN_CLASS: &str = "main";

/// What a method name resolves to in the user method table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodEntry {
    Compiled { code: u32, arity: usize },
    /// Alias of a builtin, by the builtin's original name.
    Builtin(Rc<str>),
}

/// Global runtime state shared by every frame.
#[derive(Debug)]
pub struct ObjectSpace {
    symbols: SymbolTable,
    globals: HashMap<String, Value>,
    constants: HashMap<String, Value>,
    methods: HashMap<String, MethodEntry>,
    main: Value,
    next_object_id: u64,
}

impl ObjectSpace {
    pub fn new() -> Self {
        let mut constants = HashMap::new();
        constants.insert("Object".to_string(), Value::Class(Rc::from("Object")));

        Self {
            symbols: SymbolTable::new(),
            globals: HashMap::new(),
            constants,
            methods: HashMap::new(),
            main: Value::Object(Rc::new(Instance::new(0, MAIN_CLASS))),
            next_object_id: 1,
        }
    }

    /// The top-level `self`.
    pub fn main(&self) -> Value {
        self.main.clone()
    }

    pub fn symbol(&mut self, name: &str) -> Symbol {
        self.symbols.intern(name)
    }

    pub fn new_object(&mut self, class: &str) -> Value {
        let id = self.next_object_id;
        self.next_object_id += 1;
        Value::Object(Rc::new(Instance::new(id, class)))
    }

    /// Unset globals read as nil.
    pub fn global(&self, name: &str) -> Value {
        self.globals.get(name).cloned().unwrap_or(Value::Nil)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    pub fn constant(&self, name: &str) -> Option<Value> {
        self.constants.get(name).cloned()
    }

    pub fn set_constant(&mut self, name: &str, value: Value) {
        self.constants.insert(name.to_string(), value);
    }

    pub fn method(&self, name: &str) -> Option<&MethodEntry> {
        self.methods.get(name)
    }

    pub fn define_method(&mut self, name: &str, entry: MethodEntry) {
        debug!(name, ?entry, "method defined");
        self.methods.insert(name.to_string(), entry);
    }

    /// Bind `new_name` to the current implementation of `old_name`.
    pub fn alias(&mut self, new_name: &str, old_name: &str) -> Result<(), RuntimeError> {
        let entry = match self.methods.get(old_name) {
            Some(entry) => entry.clone(),
            None if builtins::is_builtin(old_name) => MethodEntry::Builtin(Rc::from(old_name)),
            None => {
                return Err(RuntimeError::new(
                    ErrorKind::NameError,
                    format!("undefined method `{}' for class `Object'", old_name),
                ));
            }
        };
        debug!(new_name, old_name, "method aliased");
        self.methods.insert(new_name.to_string(), entry);
        Ok(())
    }
}

impl Default for ObjectSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_globals_default_to_nil() {
        let mut space = ObjectSpace::new();
        assert!(space.global("$x").is_nil());

        space.set_global("$x", Value::Fixnum(1));
        assert!(matches!(space.global("$x"), Value::Fixnum(1)));
    }

    #[test]
    fn test_object_constant_predefined() {
        let space = ObjectSpace::new();
        assert!(matches!(space.constant("Object"), Some(Value::Class(_))));
        assert!(space.constant("Missing").is_none());
    }

    #[test]
    fn test_alias_copies_implementation() {
        let mut space = ObjectSpace::new();
        space.define_method("old", MethodEntry::Compiled { code: 1, arity: 0 });
        space.alias("new", "old").unwrap();
        space.define_method("old", MethodEntry::Compiled { code: 2, arity: 0 });

        assert_eq!(
            space.method("new"),
            Some(&MethodEntry::Compiled { code: 1, arity: 0 })
        );
    }

    #[test]
    fn test_alias_of_builtin_and_unknown() {
        let mut space = ObjectSpace::new();
        space.alias("say", "puts").unwrap();
        assert_eq!(
            space.method("say"),
            Some(&MethodEntry::Builtin(Rc::from("puts")))
        );

        let err = space.alias("x", "no_such_method").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NameError);
    }

    #[test]
    fn test_symbols_interned() {
        let mut space = ObjectSpace::new();
        let a = space.symbol("a");
        let b = space.symbol("a");
        assert!(a.same(&b));
    }

    #[test]
    fn test_objects_get_distinct_ids() {
        let mut space = ObjectSpace::new();
        let a = space.new_object("Object");
        let b = space.new_object("Object");
        assert!(!a.same(&b));
        assert_eq!(space.main().to_string(), "main");
    }
}
