use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use snapvault_types::{Result, SnapvaultError};

/// Counting semaphore over volume files resident on local disk.
///
/// The producer calls [`acquire`](FileBuffer::acquire) before it materializes
/// a volume and whoever finishes with the file calls
/// [`release`](FileBuffer::release). When every slot is taken the producer
/// blocks, which in turn stops reads from the stream source.
pub(crate) struct FileBuffer {
    state: Mutex<BufferState>,
    freed: Condvar,
    peak_in_use: AtomicUsize,
}

struct BufferState {
    available: usize,
    capacity: usize,
    poisoned: bool,
}

impl FileBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(BufferState {
                available: capacity,
                capacity,
                poisoned: false,
            }),
            freed: Condvar::new(),
            peak_in_use: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block until a slot is free and take it. Fails once poisoned.
    pub(crate) fn acquire(&self) -> Result<()> {
        let mut st = self.lock();
        loop {
            if st.poisoned {
                return Err(SnapvaultError::Cancelled);
            }
            if st.available > 0 {
                st.available -= 1;
                let in_use = st.capacity - st.available;
                self.peak_in_use.fetch_max(in_use, Ordering::Relaxed);
                return Ok(());
            }
            st = self
                .freed
                .wait(st)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub(crate) fn release(&self) {
        let mut st = self.lock();
        st.available = (st.available + 1).min(st.capacity);
        self.freed.notify_all();
    }

    /// Make all current and future `acquire` calls fail.
    pub(crate) fn poison(&self) {
        let mut st = self.lock();
        st.poisoned = true;
        self.freed.notify_all();
    }

    pub(crate) fn peak_in_use(&self) -> usize {
        self.peak_in_use.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn in_use(&self) -> usize {
        let st = self.lock();
        st.capacity - st.available
    }
}

/// RAII handle for one acquired slot, released on drop.
///
/// [`defuse`](SlotGuard::defuse) hands the slot over to a consumer that will
/// call [`FileBuffer::release`] itself.
pub(crate) struct SlotGuard<'a> {
    buffer: &'a FileBuffer,
}

impl<'a> SlotGuard<'a> {
    pub(crate) fn acquire(buffer: &'a FileBuffer) -> Result<Self> {
        buffer.acquire()?;
        Ok(Self { buffer })
    }

    pub(crate) fn defuse(self) {
        mem::forget(self);
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.buffer.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn blocks_until_released() {
        let buffer = Arc::new(FileBuffer::new(1));
        buffer.acquire().unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let buffer = Arc::clone(&buffer);
            let acquired = Arc::clone(&acquired);
            std::thread::spawn(move || {
                buffer.acquire().unwrap();
                acquired.store(true, Ordering::SeqCst);
                buffer.release();
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst), "should be blocked");
        buffer.release();
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(buffer.peak_in_use(), 1);
    }

    #[test]
    fn poison_unblocks_waiters() {
        let buffer = Arc::new(FileBuffer::new(1));
        buffer.acquire().unwrap();
        let handle = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || buffer.acquire())
        };
        std::thread::sleep(Duration::from_millis(50));
        buffer.poison();
        assert!(matches!(
            handle.join().unwrap(),
            Err(SnapvaultError::Cancelled)
        ));
    }

    #[test]
    fn guard_releases_unless_defused() {
        let buffer = FileBuffer::new(2);
        {
            let _guard = SlotGuard::acquire(&buffer).unwrap();
            assert_eq!(buffer.in_use(), 1);
        }
        assert_eq!(buffer.in_use(), 0);

        SlotGuard::acquire(&buffer).unwrap().defuse();
        assert_eq!(buffer.in_use(), 1);
        buffer.release();
        assert_eq!(buffer.in_use(), 0);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let buffer = FileBuffer::new(0);
        buffer.acquire().unwrap();
        buffer.release();
    }
}
