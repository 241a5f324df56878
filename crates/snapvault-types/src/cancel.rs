use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::{Result, SnapvaultError};

/// Job-wide cancellation signal.
///
/// Cloning shares the same flag. Once [`cancel`](CancelToken::cancel) is
/// called every clone observes it, and threads parked in
/// [`sleep`](CancelToken::sleep) wake up immediately. Tokens made with
/// [`child`](CancelToken::child) fire when their parent fires, but not the
/// other way round.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    wake: Condvar,
    children: Mutex<Vec<Weak<CancelState>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut flag = match self.inner.cancelled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *flag = true;
        self.inner.wake.notify_all();
        drop(flag);

        let children = match self.inner.children.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            CancelToken { inner: child }.cancel();
        }
    }

    /// A token that is cancelled together with `self` and can also be
    /// cancelled on its own.
    pub fn child(&self) -> Self {
        let child = CancelToken::new();
        let mut children = match self.inner.children.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.is_cancelled() {
            child.cancel();
        } else {
            children.retain(|w| w.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    pub fn is_cancelled(&self) -> bool {
        match self.inner.cancelled.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Return `Err(Cancelled)` if the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SnapvaultError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless cancelled first.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        let mut flag = match self.inner.cancelled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if *flag {
                return Err(SnapvaultError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            flag = match self.inner.wake.wait_timeout(flag, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_completes_when_not_cancelled() {
        let token = CancelToken::new();
        let start = Instant::now();
        token.sleep(Duration::from_millis(20)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cancel_interrupts_sleep() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });

        let start = Instant::now();
        let result = token.sleep(Duration::from_secs(30));
        assert!(matches!(result, Err(SnapvaultError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn child_follows_parent_but_not_reverse() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());

        let second = parent.child();
        parent.cancel();
        assert!(second.is_cancelled());
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn check_reports_cancellation() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.clone().check().is_err());
    }
}
