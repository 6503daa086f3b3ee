use std::collections::HashMap;

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::bytecode::Op;
use crate::codegen::{CompileError, Resource, UnitKind};

/// Pooled literal or name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Constant {
    /// Method, variable or constant name.
    Name(String),
    String(String),
    Symbol(String),
    Bignum(BigInt),
}

impl Constant {
    pub fn text(&self) -> Option<&str> {
        match self {
            Constant::Name(s) | Constant::String(s) | Constant::Symbol(s) => Some(s),
            Constant::Bignum(_) => None,
        }
    }
}

/// Deduplicating constant pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    #[serde(skip)]
    index: HashMap<Constant, u32>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, constant: Constant, limit: usize) -> Result<u32, CompileError> {
        if let Some(&idx) = self.index.get(&constant) {
            return Ok(idx);
        }

        let idx = self.entries.len();
        if idx >= limit {
            return Err(CompileError::ResourceExhausted {
                resource: Resource::ConstantPool,
                limit,
            });
        }
        let idx = idx as u32;
        self.index.insert(constant.clone(), idx);
        self.entries.push(constant);
        Ok(idx)
    }

    pub fn get(&self, idx: u32) -> Option<&Constant> {
        self.entries.get(idx as usize)
    }

    pub fn text(&self, idx: u32) -> Option<&str> {
        self.get(idx).and_then(Constant::text)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.entries.iter()
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i as u32))
            .collect();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LineEntry {
    pub ip: u32,
    pub line: u32,
}

/// A single compiled unit: script body, method body or block body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeObject {
    pub name: String,
    pub kind: UnitKind,
    pub arity: u32,
    /// Advisory frame size; frames grow on demand.
    pub local_count: u32,
    /// Variable names from the block's scope descriptor, if any.
    pub locals: Vec<String>,
    pub ops: Vec<Op>,
    pub lines: Vec<LineEntry>,
    pub max_stack: u32,
}

impl CodeObject {
    pub fn new(name: impl Into<String>, kind: UnitKind) -> Self {
        Self {
            name: name.into(),
            kind,
            arity: 0,
            local_count: 0,
            locals: Vec::new(),
            ops: Vec::new(),
            lines: Vec::new(),
            max_stack: 0,
        }
    }

    /// Source line in effect at `ip`.
    pub fn line_for(&self, ip: usize) -> Option<u32> {
        let ip = ip as u32;
        match self.lines.binary_search_by_key(&ip, |entry| entry.ip) {
            Ok(i) => Some(self.lines[i].line),
            Err(0) => None,
            Err(i) => Some(self.lines[i - 1].line),
        }
    }
}

/// A compiled bytecode program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramBc {
    /// Convention: `code[0]` is always the script body.
    pub code: Vec<CodeObject>,
    pub constants: ConstantPool,
}

impl ProgramBc {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            constants: ConstantPool::new(),
        }
    }

    pub fn main(&self) -> Option<&CodeObject> {
        self.code.first()
    }

    pub fn find(&self, name: &str) -> Option<(u32, &CodeObject)> {
        self.code
            .iter()
            .enumerate()
            .find(|(_, code)| code.name == name)
            .map(|(i, code)| (i as u32, code))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CompileError> {
        postcard::to_allocvec(self).map_err(|e| CompileError::Artifact(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CompileError> {
        let mut program: ProgramBc =
            postcard::from_bytes(bytes).map_err(|e| CompileError::Artifact(e.to_string()))?;
        program.constants.rebuild_index();
        Ok(program)
    }
}

impl Default for ProgramBc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_deduplicates_per_kind() {
        let mut pool = ConstantPool::new();
        let a = pool.intern(Constant::Symbol("x".into()), 10).unwrap();
        let b = pool.intern(Constant::Symbol("x".into()), 10).unwrap();
        let c = pool.intern(Constant::String("x".into()), 10).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.text(c), Some("x"));
    }

    #[test]
    fn test_pool_limit() {
        let mut pool = ConstantPool::new();
        pool.intern(Constant::Name("a".into()), 1).unwrap();
        pool.intern(Constant::Name("a".into()), 1).unwrap();

        let err = pool.intern(Constant::Name("b".into()), 1).unwrap_err();
        assert!(matches!(
            err,
            CompileError::ResourceExhausted {
                resource: Resource::ConstantPool,
                limit: 1
            }
        ));
    }

    #[test]
    fn test_line_for() {
        let mut code = CodeObject::new("m", UnitKind::Method);
        code.ops = vec![Op::PushNil, Op::Pop, Op::PushNil, Op::Return];
        code.lines = vec![LineEntry { ip: 1, line: 3 }, LineEntry { ip: 2, line: 5 }];

        assert_eq!(code.line_for(0), None);
        assert_eq!(code.line_for(1), Some(3));
        assert_eq!(code.line_for(3), Some(5));
    }

    #[test]
    fn test_artifact_keeps_pool_usable() {
        let mut program = ProgramBc::new();
        let mut main = CodeObject::new("<main>", UnitKind::Script);
        let idx = program
            .constants
            .intern(Constant::Bignum(BigInt::from(u64::MAX) * 4), 100)
            .unwrap();
        main.ops = vec![Op::PushBignum(idx), Op::Return];
        program.code.push(main);

        let bytes = program.to_bytes().unwrap();
        let mut loaded = ProgramBc::from_bytes(&bytes).unwrap();

        assert_eq!(loaded.code[0].ops, program.code[0].ops);
        let again = loaded
            .constants
            .intern(Constant::Bignum(BigInt::from(u64::MAX) * 4), 100)
            .unwrap();
        assert_eq!(again, idx);
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(matches!(
            ProgramBc::from_bytes(&[0xff, 0xff, 0xff]),
            Err(CompileError::Artifact(_))
        ));
    }
}
