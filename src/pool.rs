//! Data types shared with the (external) connection pool.
//!
//! The pool itself is out of scope for this crate (see `SPEC_FULL.md` §1); it
//! is treated as a collaborator that calls [`crate::Connection::send`] and
//! observes [`crate::Connection::is_closed`] plus the release callback fired
//! from [`crate::body::IncomingBody`]. `PoolLimits` is defined here only
//! because the data model names it as part of this layer's vocabulary.

use std::time::Duration;

/// Advisory sizing for a connection pool: a soft target, a hard ceiling, and
/// the longest a caller should wait for a free slot.
///
/// The core never reads these fields; they exist purely as a shared data type
/// between this crate and whatever pool implementation sits above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    soft_limit: Option<u32>,
    hard_limit: Option<u32>,
    pool_timeout: Option<Duration>,
}

impl PoolLimits {
    #[must_use]
    pub const fn new(
        soft_limit: Option<u32>,
        hard_limit: Option<u32>,
        pool_timeout: Option<Duration>,
    ) -> Self {
        Self {
            soft_limit,
            hard_limit,
            pool_timeout,
        }
    }

    #[must_use]
    pub const fn soft_limit(&self) -> Option<u32> {
        self.soft_limit
    }

    #[must_use]
    pub const fn hard_limit(&self) -> Option<u32> {
        self.hard_limit
    }

    #[must_use]
    pub const fn pool_timeout(&self) -> Option<Duration> {
        self.pool_timeout
    }
}

impl Default for PoolLimits {
    /// A soft target of 10 idle connections, a hard ceiling of 100, and a
    /// 5 second pool wait.
    fn default() -> Self {
        Self::new(Some(10), Some(100), Some(Duration::from_secs(5)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_original_implementation() {
        let limits = PoolLimits::default();
        assert_eq!(limits.soft_limit(), Some(10));
        assert_eq!(limits.hard_limit(), Some(100));
        assert_eq!(limits.pool_timeout(), Some(Duration::from_secs(5)));
    }
}
