use tracing::warn;

use super::error::{CompileError, Violation};

/// Depth counter for one unit's implicit value stack.
///
/// In strict mode every imbalance is a [`Violation`]; otherwise the tracker
/// logs and saturates so emission can continue.
#[derive(Debug, Clone)]
pub struct StackTracker {
    depth: usize,
    max_depth: usize,
    strict: bool,
}

impl StackTracker {
    pub fn new(strict: bool) -> Self {
        Self {
            depth: 0,
            max_depth: 0,
            strict,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn produce(&mut self, n: usize) {
        self.depth += n;
        self.max_depth = self.max_depth.max(self.depth);
    }

    pub fn consume(
        &mut self,
        op: &'static str,
        n: usize,
        line: Option<u32>,
    ) -> Result<(), CompileError> {
        if self.depth < n {
            let kind = Violation::StackUnderflow {
                op,
                needed: n,
                available: self.depth,
            };
            if self.strict {
                return Err(CompileError::violation(kind, line));
            }
            warn!(%kind, "continuing with an unbalanced stack");
            self.depth = 0;
            return Ok(());
        }
        self.depth -= n;
        Ok(())
    }

    /// Rewind to a depth recorded earlier, used between branch arms.
    pub fn reset_to(&mut self, depth: usize) {
        self.depth = depth;
    }

    /// Net change since `before`.
    pub fn delta_since(&self, before: usize) -> isize {
        self.depth as isize - before as isize
    }

    /// Check a callback's net effect against the allowed range.
    pub fn expect_delta(
        &self,
        construct: &'static str,
        before: usize,
        allowed: std::ops::RangeInclusive<isize>,
        line: Option<u32>,
    ) -> Result<(), CompileError> {
        let produced = self.delta_since(before);
        if allowed.contains(&produced) {
            return Ok(());
        }
        let expected = if allowed.start() == allowed.end() {
            "exactly 1"
        } else {
            "0 or 1"
        };
        let kind = Violation::CallbackResult {
            construct,
            expected,
            produced,
        };
        if self.strict {
            return Err(CompileError::violation(kind, line));
        }
        warn!(%kind, "accepting unbalanced callback");
        Ok(())
    }

    /// Validate depth at unit end. Returns how many surplus values must be
    /// discarded before the return (non-zero only in lenient mode).
    pub fn finish(&self, unit: &str, line: Option<u32>) -> Result<usize, CompileError> {
        if self.depth <= 1 {
            return Ok(0);
        }
        let kind = Violation::UnbalancedUnit {
            unit: unit.to_string(),
            depth: self.depth,
        };
        if self.strict {
            return Err(CompileError::violation(kind, line));
        }
        warn!(%kind, "discarding surplus values at unit end");
        Ok(self.depth - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_produce_consume() {
        let mut stack = StackTracker::new(true);
        stack.produce(2);
        stack.consume("invoke_dynamic", 2, None).unwrap();
        stack.produce(1);

        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.max_depth(), 2);
    }

    #[test]
    fn test_underflow_strict() {
        let mut stack = StackTracker::new(true);
        let err = stack.consume("consume_current_value", 1, Some(3)).unwrap_err();

        assert!(matches!(
            err.violation_kind(),
            Some(Violation::StackUnderflow { needed: 1, available: 0, .. })
        ));
    }

    #[test]
    fn test_underflow_lenient_saturates() {
        let mut stack = StackTracker::new(false);
        stack.consume("consume_current_value", 1, None).unwrap();
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_expect_delta() {
        let mut stack = StackTracker::new(true);
        let before = stack.depth();
        stack.produce(2);

        assert!(stack.expect_delta("logical and", before, 1..=1, None).is_err());
        assert!(stack.expect_delta("loop body", before, 0..=2, None).is_ok());
    }

    #[test]
    fn test_finish() {
        let mut stack = StackTracker::new(true);
        assert_eq!(stack.finish("method `f`", None).unwrap(), 0);
        stack.produce(1);
        assert_eq!(stack.finish("method `f`", None).unwrap(), 0);
        stack.produce(1);
        assert!(stack.finish("method `f`", None).is_err());

        let mut lenient = StackTracker::new(false);
        lenient.produce(3);
        assert_eq!(lenient.finish("script", None).unwrap(), 2);
    }
}
