//! Exception handler tables
//!
//! Two encodings exist, mirroring the two ways code resumes after a throw:
//!
//! ```text
//! range table  (bytecode)        return table  (machine code)
//! ┌───────┬─────┬─────────┐       ┌──────────────┬─────────┐
//! │ start │ end │ handler │       │ return offset│ handler │
//! ├───────┼─────┼─────────┤       ├──────────────┼─────────┤
//! │   0   │ 40  │   44    │ outer │      12      │   80    │
//! │  10   │ 20  │   24    │ inner │      36      │   92    │
//! └───────┴─────┴─────────┘       └──────────────┴─────────┘
//! ```
//!
//! Range entries are emitted outer-first, so the innermost covering range is
//! the last match. Return entries are sorted by return offset.

/// How a handler is expected to treat an exception, recorded at compile time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerPrediction {
    /// The handler rethrows; look further out
    Uncaught,
    /// A `try`/`catch` in managed code
    Caught,
    /// Promise machinery turns the exception into a rejection
    Promise,
    /// An `await` inside an async function handles it
    AsyncAwait,
    /// An `await` whose enclosing async function has no handler
    UncaughtAsyncAwait,
}

/// A bytecode range guarded by a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeEntry {
    pub start: u32,
    pub end: u32,
    pub handler: u32,
    /// Register that holds the context at the handler
    pub context_register: u32,
    pub prediction: HandlerPrediction,
}

/// A call return site guarded by a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnEntry {
    pub return_offset: u32,
    pub handler: u32,
}

/// Result of a range lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeMatch {
    pub handler: u32,
    pub context_register: u32,
    pub prediction: HandlerPrediction,
}

/// Handler table attached to bytecode or machine code
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerTable {
    ranges: Vec<RangeEntry>,
    returns: Vec<ReturnEntry>,
}

impl HandlerTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a range table. Entries must be ordered outer-first.
    pub fn with_ranges(ranges: Vec<RangeEntry>) -> Self {
        Self {
            ranges,
            returns: Vec::new(),
        }
    }

    /// Create a return table. Entries are sorted by return offset.
    pub fn with_returns(mut returns: Vec<ReturnEntry>) -> Self {
        returns.sort_by_key(|e| e.return_offset);
        Self {
            ranges: Vec::new(),
            returns,
        }
    }

    /// Append a range entry (outer ranges first)
    pub fn push_range(
        &mut self,
        start: u32,
        end: u32,
        handler: u32,
        context_register: u32,
        prediction: HandlerPrediction,
    ) -> &mut Self {
        self.ranges.push(RangeEntry {
            start,
            end,
            handler,
            context_register,
            prediction,
        });
        self
    }

    /// Insert a return entry
    pub fn push_return(&mut self, return_offset: u32, handler: u32) -> &mut Self {
        let at = self
            .returns
            .partition_point(|e| e.return_offset < return_offset);
        self.returns.insert(
            at,
            ReturnEntry {
                return_offset,
                handler,
            },
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.returns.is_empty()
    }

    pub fn number_of_range_entries(&self) -> usize {
        self.ranges.len()
    }

    pub fn number_of_return_entries(&self) -> usize {
        self.returns.len()
    }

    /// Innermost range covering `offset` (start inclusive, end exclusive)
    pub fn lookup_range(&self, offset: u32) -> Option<RangeMatch> {
        self.ranges
            .iter()
            .rev()
            .find(|e| e.start <= offset && offset < e.end)
            .map(|e| RangeMatch {
                handler: e.handler,
                context_register: e.context_register,
                prediction: e.prediction,
            })
    }

    /// Handler for the call returning to `return_offset`
    pub fn lookup_return(&self, return_offset: u32) -> Option<u32> {
        self.returns
            .binary_search_by_key(&return_offset, |e| e.return_offset)
            .ok()
            .map(|i| self.returns[i].handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_lookup_prefers_innermost() {
        let mut table = HandlerTable::new();
        table
            .push_range(0, 40, 44, 1, HandlerPrediction::Caught)
            .push_range(10, 20, 24, 2, HandlerPrediction::Promise);

        let inner = table.lookup_range(15).unwrap();
        assert_eq!(inner.handler, 24);
        assert_eq!(inner.context_register, 2);
        assert_eq!(inner.prediction, HandlerPrediction::Promise);

        assert_eq!(table.lookup_range(25).unwrap().handler, 44);
        assert_eq!(table.lookup_range(20).unwrap().handler, 44);
        assert!(table.lookup_range(40).is_none());
    }

    #[test]
    fn test_return_lookup_exact_match_only() {
        let table = HandlerTable::with_returns(vec![
            ReturnEntry {
                return_offset: 36,
                handler: 92,
            },
            ReturnEntry {
                return_offset: 12,
                handler: 80,
            },
        ]);
        assert_eq!(table.lookup_return(12), Some(80));
        assert_eq!(table.lookup_return(36), Some(92));
        assert_eq!(table.lookup_return(13), None);
    }

    #[test]
    fn test_push_return_keeps_order() {
        let mut table = HandlerTable::new();
        table.push_return(50, 1).push_return(10, 2).push_return(30, 3);
        assert_eq!(table.lookup_return(10), Some(2));
        assert_eq!(table.lookup_return(30), Some(3));
        assert_eq!(table.number_of_return_entries(), 3);
        assert!(!table.is_empty());
    }
}
