//! Run identity and per-run context

use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Monotonically increasing marker of a run.
///
/// Only the most recently issued token is current; results carrying any
/// other token are discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RunToken(u64);

impl RunToken {
    pub fn value(self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        RunToken(self.0 + 1)
    }
}

impl fmt::Display for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run #{}", self.0)
    }
}

/// Carried through every stage of one run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub token: RunToken,
    /// Fires when the run is superseded
    pub cancel: CancellationToken,
    pub started: Instant,
}

impl RunContext {
    pub fn new(token: RunToken, cancel: CancellationToken) -> Self {
        Self {
            token,
            cancel,
            started: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_increase() {
        let first = RunToken::default();
        let second = first.next();
        assert!(second > first);
        assert_eq!(second.value(), 1);
        assert_eq!(second.to_string(), "run #1");
    }
}
