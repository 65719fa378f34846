//! Cancellation tokens and per-call deadlines
//!
//! Long-running operations (batch ingest, index builds, memory collapse)
//! check the token at chunk boundaries, so a cancelled operation stops
//! within one chunk of work and leaves all storage invariants intact.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation flag, cheaply cloneable across threads.
///
/// Cancellation is observed at chunk boundaries only; an in-flight
/// transaction either commits or rolls back as a whole.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Optional per-call deadline.
///
/// On expiry the call returns `Timeout` with no durable side effects — the
/// deadline is checked before starting each unit of work, never mid-write.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time left before expiry, zero if already past it.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// Check an optional token and deadline at a chunk boundary.
///
/// Returns what stopped the operation, if anything. Callers convert this
/// into `DbError::Cancelled` / `DbError::Timeout`.
pub(crate) fn check_interrupt(
    cancel: Option<&CancellationToken>,
    deadline: Option<&Deadline>,
) -> Option<Interrupt> {
    if let Some(token) = cancel {
        if token.is_cancelled() {
            return Some(Interrupt::Cancelled);
        }
    }
    if let Some(d) = deadline {
        if d.expired() {
            return Some(Interrupt::TimedOut);
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Cancelled,
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_starts_live() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(check_interrupt(Some(&token), None).is_none());
    }

    #[test]
    fn test_cancel_is_visible_through_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        assert_eq!(
            check_interrupt(Some(&clone), None),
            Some(Interrupt::Cancelled)
        );
    }

    #[test]
    fn test_deadline_expiry() {
        let d = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));
        assert!(d.expired());
        assert_eq!(d.remaining(), Duration::ZERO);
        assert_eq!(check_interrupt(None, Some(&d)), Some(Interrupt::TimedOut));
    }

    #[test]
    fn test_deadline_in_future() {
        let d = Deadline::after(Duration::from_secs(60));
        assert!(!d.expired());
        assert!(d.remaining() > Duration::from_secs(50));
        assert!(check_interrupt(None, Some(&d)).is_none());
    }

    #[test]
    fn test_cancel_wins_over_deadline() {
        let token = CancellationToken::new();
        token.cancel();
        let d = Deadline::after(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(
            check_interrupt(Some(&token), Some(&d)),
            Some(Interrupt::Cancelled)
        );
    }
}
