use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeKind {
    /// Method or script body: owns a fresh frame.
    Local,
    /// Block body: owns a frame and can reach the enclosing one.
    Block,
}

/// Lexical scope descriptor computed by the parser's scope resolution.
///
/// Backends never compute free variables themselves; they only size the
/// closure's frame from `variables` and keep the names for disassembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticScope {
    kind: ScopeKind,
    variables: Vec<String>,
}

impl StaticScope {
    pub fn local<S: Into<String>>(variables: impl IntoIterator<Item = S>) -> Self {
        Self {
            kind: ScopeKind::Local,
            variables: variables.into_iter().map(Into::into).collect(),
        }
    }

    pub fn block<S: Into<String>>(variables: impl IntoIterator<Item = S>) -> Self {
        Self {
            kind: ScopeKind::Block,
            variables: variables.into_iter().map(Into::into).collect(),
        }
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_scope_lookup() {
        let scope = StaticScope::block(["x", "acc"]);

        assert_eq!(scope.kind(), ScopeKind::Block);
        assert_eq!(scope.len(), 2);
        assert_eq!(scope.index_of("acc"), Some(1));
        assert_eq!(scope.index_of("y"), None);
    }
}
