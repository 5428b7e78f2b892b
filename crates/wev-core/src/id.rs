//! Connection identifier allocation.
//!
//! Identifiers are random decimal strings checked against the set of
//! live connections. Collisions are retried a bounded number of times;
//! running out of attempts is reported as
//! [`DomainError::AllocationExhausted`] so the caller can reject the one
//! connection that asked for an id.

use rand::Rng;
use tracing::debug;

use crate::error::{DomainError, DomainResult};
use crate::ConnectionId;

/// Default number of candidates tried before giving up.
pub const DEFAULT_MAX_ATTEMPTS: usize = 16;

/// Number of decimal digits in a generated identifier.
const ID_DIGITS: u32 = 16;

/// Source of candidate identifiers.
///
/// The allocator only needs "a string"; tests substitute a deterministic
/// source to force collisions.
pub trait IdSource: Send {
    /// Produces the next candidate identifier.
    fn candidate(&mut self) -> String;
}

/// Default source: uniformly random 16-digit decimal strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomDigits;

impl IdSource for RandomDigits {
    fn candidate(&mut self) -> String {
        let upper = 10u64.pow(ID_DIGITS);
        let value = rand::rng().random_range(0..upper);
        format!("{value:0width$}", width = ID_DIGITS as usize)
    }
}

/// Allocates identifiers unique within a caller-supplied id set.
pub struct IdAllocator {
    source: Box<dyn IdSource>,
    max_attempts: usize,
}

impl IdAllocator {
    /// Creates an allocator backed by [`RandomDigits`].
    pub fn new(max_attempts: usize) -> Self {
        Self::with_source(RandomDigits, max_attempts)
    }

    /// Creates an allocator with a custom candidate source.
    ///
    /// A `max_attempts` of zero is treated as one.
    pub fn with_source(source: impl IdSource + 'static, max_attempts: usize) -> Self {
        Self {
            source: Box::new(source),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Returns the retry budget.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Returns an id for which `is_taken` is false.
    ///
    /// # Errors
    ///
    /// `DomainError::AllocationExhausted` if every candidate within the
    /// budget was already taken.
    pub fn allocate<F>(&mut self, is_taken: F) -> DomainResult<ConnectionId>
    where
        F: Fn(&ConnectionId) -> bool,
    {
        for attempt in 1..=self.max_attempts {
            let candidate = ConnectionId::new(self.source.candidate());
            if !is_taken(&candidate) {
                return Ok(candidate);
            }
            debug!(attempt, candidate = %candidate, "Connection id collision, retrying");
        }

        Err(DomainError::AllocationExhausted {
            attempts: self.max_attempts,
        })
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl std::fmt::Debug for IdAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdAllocator")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}
