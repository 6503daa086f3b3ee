use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{CompileError, Resource, Violation};

static NEXT_INSTANCE: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    Script,
    Method,
    Closure,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnitKind::Script => "script",
            UnitKind::Method => "method",
            UnitKind::Closure => "closure",
        })
    }
}

/// Opaque token pairing a `begin_method` with its `end_method`.
///
/// Not `Clone`: ending a unit consumes its handle, so a handle cannot be used
/// twice. Handles also carry the issuing instance and are rejected elsewhere.
#[must_use = "the handle is required to end the unit"]
#[derive(Debug, PartialEq, Eq)]
pub struct UnitHandle {
    instance: u32,
    id: u32,
}

#[derive(Debug)]
pub struct OpenUnit<T> {
    id: u32,
    kind: UnitKind,
    name: String,
    pub payload: T,
}

impl<T> OpenUnit<T> {
    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn describe(&self) -> String {
        format!("{} `{}`", self.kind, self.name)
    }
}

/// Explicit stack of open units, compared by handle identity rather than
/// trusting the caller's call-stack order.
#[derive(Debug)]
pub struct UnitStack<T> {
    instance: u32,
    next_id: u32,
    open: Vec<OpenUnit<T>>,
    nesting: usize,
    max_nesting: usize,
}

impl<T> UnitStack<T> {
    pub fn new(max_nesting: usize) -> Self {
        Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            next_id: 1,
            open: Vec::new(),
            nesting: 0,
            max_nesting,
        }
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn top(&self) -> Option<&OpenUnit<T>> {
        self.open.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut OpenUnit<T>> {
        self.open.last_mut()
    }

    pub fn open(
        &mut self,
        kind: UnitKind,
        name: &str,
        payload: T,
    ) -> Result<UnitHandle, CompileError> {
        self.check_nesting(1)?;

        let id = self.next_id;
        self.next_id += 1;
        debug!(%kind, name, id, depth = self.open.len(), "unit opened");
        self.open.push(OpenUnit {
            id,
            kind,
            name: name.to_string(),
            payload,
        });

        Ok(UnitHandle {
            instance: self.instance,
            id,
        })
    }

    /// Close the innermost unit. The handle must be the one `open` returned
    /// for it and the unit must be of the expected kind.
    pub fn close(
        &mut self,
        handle: UnitHandle,
        kind: UnitKind,
        line: Option<u32>,
    ) -> Result<OpenUnit<T>, CompileError> {
        if handle.instance != self.instance {
            return Err(CompileError::violation(Violation::ForeignHandle, line));
        }

        let top = self
            .open
            .last()
            .ok_or_else(|| CompileError::violation(Violation::NoOpenUnit, line))?;

        if top.id != handle.id {
            return Err(CompileError::violation(
                Violation::HandleMismatch {
                    innermost: top.describe(),
                },
                line,
            ));
        }

        if top.kind != kind {
            return Err(CompileError::violation(
                Violation::WrongUnitKind(top.describe()),
                line,
            ));
        }

        let unit = self
            .open
            .pop()
            .ok_or_else(|| CompileError::violation(Violation::NoOpenUnit, line))?;
        debug!(kind = %unit.kind, name = %unit.name, id = unit.id, "unit closed");
        Ok(unit)
    }

    /// Discard every unit above the first `len`, innermost last. Their handles
    /// stop matching anything.
    pub fn truncate(&mut self, len: usize) -> Vec<OpenUnit<T>> {
        let dropped = self.open.split_off(len.min(self.open.len()));
        for unit in &dropped {
            debug!(kind = %unit.kind, name = %unit.name, id = unit.id, "unit discarded");
        }
        dropped
    }

    /// Enter a nested control-flow region.
    pub fn enter(&mut self) -> Result<(), CompileError> {
        self.check_nesting(1)?;
        self.nesting += 1;
        Ok(())
    }

    pub fn exit(&mut self) {
        self.nesting = self.nesting.saturating_sub(1);
    }

    fn check_nesting(&self, extra: usize) -> Result<(), CompileError> {
        if self.open.len() + self.nesting + extra > self.max_nesting {
            return Err(CompileError::ResourceExhausted {
                resource: Resource::NestingDepth,
                limit: self.max_nesting,
            });
        }
        Ok(())
    }

    /// How many frames outward a local access may reach from the innermost
    /// unit: one per consecutive enclosing closure.
    pub fn reachable_depth(&self) -> usize {
        self.open
            .iter()
            .rev()
            .take_while(|unit| unit.kind == UnitKind::Closure)
            .count()
    }

    /// True when some open method would receive the block a `yield` targets.
    pub fn inside_method(&self) -> bool {
        self.open
            .iter()
            .rev()
            .take_while(|unit| unit.kind != UnitKind::Script)
            .any(|unit| unit.kind == UnitKind::Method)
    }
}
