use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex, MutexGuard};

use snapvault_types::{Result, SnapvaultError};

/// Hands downloaded volumes to the writer strictly by sequence index,
/// whatever order the downloads finish in.
pub(super) struct ReorderBuffer {
    state: Mutex<ReorderState>,
    arrived: Condvar,
}

struct ReorderState {
    ready: BTreeMap<u32, PathBuf>,
    failed: bool,
}

impl ReorderBuffer {
    pub(super) fn new() -> Self {
        Self {
            state: Mutex::new(ReorderState {
                ready: BTreeMap::new(),
                failed: false,
            }),
            arrived: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReorderState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn deliver(&self, index: u32, path: PathBuf) {
        let mut st = self.lock();
        st.ready.insert(index, path);
        self.arrived.notify_all();
    }

    /// Wake the writer and make every further wait fail.
    pub(super) fn fail(&self) {
        let mut st = self.lock();
        st.failed = true;
        self.arrived.notify_all();
    }

    /// Block until volume `index` has arrived.
    pub(super) fn wait_for(&self, index: u32) -> Result<PathBuf> {
        let mut st = self.lock();
        loop {
            if st.failed {
                return Err(SnapvaultError::Cancelled);
            }
            if let Some(path) = st.ready.remove(&index) {
                return Ok(path);
            }
            st = self
                .arrived
                .wait(st)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn releases_in_index_order() {
        let reorder = Arc::new(ReorderBuffer::new());
        let producer = {
            let reorder = Arc::clone(&reorder);
            std::thread::spawn(move || {
                for index in [3u32, 1, 2] {
                    std::thread::sleep(Duration::from_millis(10));
                    reorder.deliver(index, PathBuf::from(format!("vol{index}")));
                }
            })
        };
        let order: Vec<PathBuf> = (1..=3).map(|i| reorder.wait_for(i).unwrap()).collect();
        producer.join().unwrap();
        assert_eq!(
            order,
            vec![
                PathBuf::from("vol1"),
                PathBuf::from("vol2"),
                PathBuf::from("vol3")
            ]
        );
    }

    #[test]
    fn failure_wakes_the_writer() {
        let reorder = Arc::new(ReorderBuffer::new());
        let waiter = {
            let reorder = Arc::clone(&reorder);
            std::thread::spawn(move || reorder.wait_for(1))
        };
        std::thread::sleep(Duration::from_millis(30));
        reorder.fail();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(SnapvaultError::Cancelled)
        ));
    }
}
