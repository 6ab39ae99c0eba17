//! Bounded plan-attempt accounting for one evaluation.

/// Default attempt budget for service and system evaluations.
pub const DEFAULT_SERVICE_ATTEMPTS: u32 = 5;
/// Default attempt budget for batch evaluations.
pub const DEFAULT_BATCH_ATTEMPTS: u32 = 2;

/// Counts plan submissions against a fixed budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    limit: u32,
    attempts: u32,
}

impl RetryState {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            attempts: 0,
        }
    }

    /// Start the next attempt. Returns its 1-based number, or `None` once
    /// the budget is spent.
    pub fn next_attempt(&mut self) -> Option<u32> {
        if self.attempts >= self.limit {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_up_to_limit() {
        let mut retry = RetryState::new(3);
        assert_eq!(retry.next_attempt(), Some(1));
        assert_eq!(retry.next_attempt(), Some(2));
        assert!(!retry.is_exhausted());
        assert_eq!(retry.next_attempt(), Some(3));
        assert!(retry.is_exhausted());
        assert_eq!(retry.next_attempt(), None);
        assert_eq!(retry.attempts(), 3);
    }

    #[test]
    fn zero_limit_still_allows_one_attempt() {
        let mut retry = RetryState::new(0);
        assert_eq!(retry.limit(), 1);
        assert_eq!(retry.next_attempt(), Some(1));
        assert_eq!(retry.next_attempt(), None);
    }
}
