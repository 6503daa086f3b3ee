use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// An interned symbol. Two symbols with the same name created through the
/// same [`SymbolTable`] compare equal and share their name allocation.
#[derive(Debug, Clone)]
pub struct Symbol {
    id: u32,
    name: Rc<str>,
}

impl Symbol {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity comparison: same table entry, not merely the same text.
    pub fn same(&self, other: &Symbol) -> bool {
        self.id == other.id && Rc::ptr_eq(&self.name, &other.name)
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Symbol {}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    by_name: HashMap<Rc<str>, u32>,
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> Symbol {
        if let Some(&id) = self.by_name.get(name) {
            return self.symbols[id as usize].clone();
        }

        let id = self.symbols.len() as u32;
        let name: Rc<str> = Rc::from(name);
        let symbol = Symbol {
            id,
            name: Rc::clone(&name),
        };
        self.by_name.insert(name, id);
        self.symbols.push(symbol.clone());
        symbol
    }

    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.by_name
            .get(name)
            .map(|&id| self.symbols[id as usize].clone())
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
