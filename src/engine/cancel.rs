//! Cooperative cancellation shared by the caller, the sampling loop and every
//! load worker of a single run.

use std::time::{Duration, Instant};

/// Granularity used by [`CancellationToken::sleep`] when polling the flag.
const POLL_SLICE: Duration = Duration::from_millis(25);

/// A one-shot, thread-safe cancellation flag.
///
/// Cloning yields a handle to the same flag. Cancelling is idempotent: the
/// first call flips the flag, later calls are no-ops. Child tokens observe
/// their parent's cancellation but can also be cancelled on their own, which
/// is how the worker pool is stopped without touching the caller's token.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: tokio_util::sync::CancellationToken,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call any number of times from any thread.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// A token that is cancelled when `self` is, or when cancelled directly.
    pub fn child_token(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
        }
    }

    /// Block the current thread for up to `duration`, waking early if the
    /// token is cancelled. Returns `true` if the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        // An unrepresentable end point means "until cancelled".
        let until = Instant::now().checked_add(duration);
        loop {
            if self.is_cancelled() {
                return false;
            }
            let slice = match until {
                Some(until) => {
                    let now = Instant::now();
                    if now >= until {
                        return true;
                    }
                    POLL_SLICE.min(until - now)
                }
                None => POLL_SLICE,
            };
            std::thread::sleep(slice);
        }
    }

    /// Resolves once the token is cancelled (async callers, e.g. Ctrl-C glue).
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_does_not_cancel_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let child = parent.child_token();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            remote.cancel();
        });

        let start = Instant::now();
        let completed = token.sleep(Duration::from_secs(5));
        waker.join().unwrap();

        assert!(!completed);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_unbounded_sleep_still_wakes_on_cancel() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        assert!(!token.sleep(Duration::MAX));
        waker.join().unwrap();
    }

    #[test]
    fn test_sleep_runs_to_completion() {
        let token = CancellationToken::new();
        assert!(token.sleep(Duration::from_millis(30)));
    }
}
