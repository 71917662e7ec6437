//! Byte and depth accounting which bounds the worst-case cost of parsing
//! and evaluating untrusted templates. Every allocation that becomes visible
//! to a caller is charged against a [`ByteCounter`] before it is exposed, and
//! released when the owning scope is removed.

/// Default byte budget when a caller passes zero.
pub const DEFAULT_MAX_BYTES: usize = 1024 * 1024;

/// Default nesting budget when a caller passes zero.
pub const DEFAULT_MAX_DEPTH: usize = 50;

/// Flat cost charged for any aggregate node: a token, an array or object
/// head, or a reader-state frame.
pub const MIN_OBJECT_SIZE: usize = 24;

// Strings are approximated as a header plus two bytes per UTF-16 unit.
const STRING_BASE_SIZE: usize = 26;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetError {
    #[error("The maximum allowed memory size was exceeded")]
    MaxMemoryExceeded,
    #[error("Maximum object depth exceeded")]
    MaxDepthExceeded,
}

/// utf16_len counts the UTF-16 code units of |s|, which is the unit the
/// byte approximation is defined over.
pub fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}

/// string_bytes approximates the retained size of a string.
pub fn string_bytes(s: &str) -> usize {
    STRING_BASE_SIZE + 2 * utf16_len(s)
}

/// ByteCounter is a monotonic byte ledger with a hard ceiling. `add` fails
/// rather than exceeding `max`; `subtract` releases previously added bytes.
#[derive(Debug, Clone)]
pub struct ByteCounter {
    current: usize,
    max: usize,
}

impl ByteCounter {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            current: 0,
            max: if max_bytes == 0 {
                DEFAULT_MAX_BYTES
            } else {
                max_bytes
            },
        }
    }

    pub fn add(&mut self, bytes: usize) -> Result<(), BudgetError> {
        let next = self
            .current
            .checked_add(bytes)
            .ok_or(BudgetError::MaxMemoryExceeded)?;
        if next > self.max {
            return Err(BudgetError::MaxMemoryExceeded);
        }
        self.current = next;
        Ok(())
    }

    pub fn add_string(&mut self, s: &str) -> Result<(), BudgetError> {
        self.add(string_bytes(s))
    }

    pub fn subtract(&mut self, bytes: usize) {
        self.current = self.current.saturating_sub(bytes);
    }

    pub fn subtract_string(&mut self, s: &str) {
        self.subtract(string_bytes(s));
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn remaining(&self) -> usize {
        self.max - self.current
    }
}

/// DepthGuard tracks nesting of sequence, mapping and expression frames.
/// Pushing past `max` is a fatal error.
#[derive(Debug, Clone)]
pub struct DepthGuard {
    current: usize,
    max: usize,
}

impl DepthGuard {
    pub fn new(max_depth: usize) -> Self {
        Self {
            current: 0,
            max: if max_depth == 0 {
                DEFAULT_MAX_DEPTH
            } else {
                max_depth
            },
        }
    }

    pub fn push(&mut self) -> Result<(), BudgetError> {
        if self.current + 1 > self.max {
            return Err(BudgetError::MaxDepthExceeded);
        }
        self.current += 1;
        Ok(())
    }

    pub fn pop(&mut self) {
        self.current = self.current.saturating_sub(1);
    }

    pub fn current(&self) -> usize {
        self.current
    }
}

/// EvaluationMemory is the evaluator's per-evaluation ledger. Each node's
/// cost is recorded at its depth. Recording a node's *total* subtree size
/// retroactively frees the deeper columns it subsumes, so the tracked total
/// is bounded by the live evaluation path rather than everything traversed
/// so far. This is what keeps `format`/`join` from being accounted once per
/// parameter and again at the result.
#[derive(Debug)]
pub struct EvaluationMemory {
    max: usize,
    total: usize,
    depths: Vec<usize>,
}

impl EvaluationMemory {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max: if max_bytes == 0 {
                DEFAULT_MAX_BYTES
            } else {
                max_bytes
            },
            total: 0,
            depths: Vec::new(),
        }
    }

    /// add_amount records |bytes| at |depth|. When |is_total| is set, the
    /// amount is the complete size of the subtree rooted at |depth| and all
    /// deeper columns are released first.
    pub fn add_amount(
        &mut self,
        depth: usize,
        bytes: usize,
        is_total: bool,
    ) -> Result<(), BudgetError> {
        if is_total {
            for column in self.depths.iter_mut().skip(depth + 1) {
                self.total -= *column;
                *column = 0;
            }
        }
        if self.depths.len() <= depth {
            self.depths.resize(depth + 1, 0);
        }
        let next = self
            .total
            .checked_add(bytes)
            .ok_or(BudgetError::MaxMemoryExceeded)?;
        if next > self.max {
            return Err(BudgetError::MaxMemoryExceeded);
        }
        self.depths[depth] += bytes;
        self.total = next;
        Ok(())
    }

    pub fn current(&self) -> usize {
        self.total
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn string_cost_counts_utf16_units() {
        assert_eq!(string_bytes(""), 26);
        assert_eq!(string_bytes("ab"), 30);
        // U+1F600 is a surrogate pair in UTF-16.
        assert_eq!(string_bytes("\u{1F600}"), 30);
    }

    #[test]
    fn counter_enforces_max() {
        let mut c = ByteCounter::new(100);
        c.add(60).unwrap();
        assert_eq!(c.add(41), Err(BudgetError::MaxMemoryExceeded));
        c.subtract(60);
        assert_eq!(c.current(), 0);
        c.add(100).unwrap();
    }

    #[test]
    fn depth_guard_enforces_max() {
        let mut d = DepthGuard::new(2);
        d.push().unwrap();
        d.push().unwrap();
        assert_eq!(d.push(), Err(BudgetError::MaxDepthExceeded));
        d.pop();
        d.push().unwrap();
    }

    #[test]
    fn totals_trim_deeper_columns() {
        let mut m = EvaluationMemory::new(100);
        m.add_amount(0, 10, false).unwrap();
        m.add_amount(1, 30, false).unwrap();
        m.add_amount(2, 30, false).unwrap();
        assert_eq!(m.current(), 70);

        // Depth 1 completes with a knowable total: columns 2.. are freed.
        m.add_amount(1, 35, true).unwrap();
        assert_eq!(m.current(), 75);

        // Without trimming this add would have exceeded the budget.
        m.add_amount(1, 20, false).unwrap();
        assert_eq!(m.current(), 95);
    }

    #[test]
    fn exceeding_eval_memory_fails() {
        let mut m = EvaluationMemory::new(50);
        m.add_amount(0, 40, false).unwrap();
        assert_eq!(
            m.add_amount(1, 20, false),
            Err(BudgetError::MaxMemoryExceeded)
        );
    }
}
