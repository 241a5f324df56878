use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use snapvault_types::{Result, SnapvaultError};

use crate::{classify_io, KeyListing, StorageBackend};

type Objects = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// Stores shared by `mem://name` destinations within one process.
static NAMED_STORES: LazyLock<Mutex<HashMap<String, Objects>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// In-memory destination. Thread-safe via Mutex.
///
/// Handles created with [`MemoryBackend::named`] see the same objects, which
/// lets a send and a later receive in the same process share a `mem://` URI.
#[derive(Clone)]
pub struct MemoryBackend {
    label: String,
    objects: Objects,
}

impl MemoryBackend {
    /// A private store not reachable by name.
    pub fn new() -> Self {
        Self {
            label: "mem://(anonymous)".into(),
            objects: Arc::default(),
        }
    }

    /// The shared store registered under `name`, created on first use.
    pub fn named(name: &str) -> Self {
        let mut stores = NAMED_STORES
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let objects = stores.entry(name.to_string()).or_default().clone();
        Self {
            label: format!("mem://{name}"),
            objects,
        }
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }

    /// Overwrite an object in place without going through `put`. Used to
    /// simulate bit rot at rest.
    pub fn tamper(&self, key: &str, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        match self.objects().get_mut(key) {
            Some(data) => {
                f(data);
                true
            }
            None => false,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    fn put(&self, key: &str, size_hint: u64, reader: &mut dyn Read) -> Result<()> {
        let mut data = Vec::with_capacity(size_hint.min(64 * 1024 * 1024) as usize);
        reader
            .read_to_end(&mut data)
            .map_err(|e| classify_io(format!("{} PUT {key}", self.label), e))?;
        // Insert only once the whole body arrived.
        self.objects().insert(key.to_string(), data);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        match self.objects().get(key) {
            Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(SnapvaultError::NotFound(format!("{} GET {key}", self.label))),
        }
    }

    fn list(&self, prefix: &str) -> Result<KeyListing<'_>> {
        let keys: Vec<String> = self
            .objects()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(Box::new(keys.into_iter().map(Ok)))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects().remove(key);
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_stores_are_isolated() {
        let a = MemoryBackend::new();
        let b = MemoryBackend::new();
        a.put_bytes("k", b"v").unwrap();
        assert!(b.is_empty());
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn list_is_sorted_and_prefix_bounded() {
        let m = MemoryBackend::new();
        for key in ["b/2", "a/1", "b/1", "c/1"] {
            m.put_bytes(key, key.as_bytes()).unwrap();
        }
        assert_eq!(m.list_all("b/").unwrap(), vec!["b/1", "b/2"]);
        assert_eq!(m.list_all("").unwrap().len(), 4);
    }

    #[test]
    fn tamper_changes_stored_bytes() {
        let m = MemoryBackend::new();
        m.put_bytes("k", b"abc").unwrap();
        assert!(m.tamper("k", |d| d[0] ^= 0xff));
        assert_ne!(m.get_bytes("k").unwrap(), b"abc");
        assert!(!m.tamper("missing", |_| {}));
    }
}
