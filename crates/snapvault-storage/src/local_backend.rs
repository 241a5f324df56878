use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use snapvault_types::{Result, SnapvaultError};

use crate::{classify_io, KeyListing, StorageBackend};

/// Destination backed by a directory on the local filesystem.
pub struct LocalBackend {
    root: PathBuf,
    label: String,
}

impl LocalBackend {
    /// Create a backend rooted at `root`. The directory is created on first write.
    pub fn new(root: &Path, label: &str) -> Result<Self> {
        // Canonicalize existing roots so strip_prefix works with symlinks.
        let root = if root.exists() {
            fs::canonicalize(root)?
        } else {
            root.to_path_buf()
        };
        Ok(Self {
            root,
            label: label.to_string(),
        })
    }

    /// Reject storage keys that could escape the destination root.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(SnapvaultError::InvalidInput("unsafe storage key: empty".into()));
        }
        if key.starts_with('/') || key.starts_with('\\') {
            return Err(SnapvaultError::InvalidInput(format!(
                "unsafe storage key: absolute path '{key}'"
            )));
        }
        if key.contains('\\') {
            return Err(SnapvaultError::InvalidInput(format!(
                "unsafe storage key: contains backslash '{key}'"
            )));
        }
        if Path::new(key)
            .components()
            .any(|c| c == Component::ParentDir)
        {
            return Err(SnapvaultError::InvalidInput(format!(
                "unsafe storage key: parent traversal '{key}'"
            )));
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn context(&self, op: &str, key: &str) -> String {
        format!("{} {op} {key}", self.label)
    }

    /// Stream into a temp file in the target directory, then rename into
    /// place so readers never observe a partial object.
    fn atomic_write(&self, path: &Path, reader: &mut dyn Read) -> io::Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        io::copy(reader, tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Recursively collect files under `dir` as `/`-separated keys relative to the root.
    fn list_recursive(&self, dir: &Path, keys: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), keys)?;
            } else if file_type.is_file() {
                // In-flight temp files from atomic_write.
                if entry.file_name().to_string_lossy().starts_with(".tmp") {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalBackend {
    fn put(&self, key: &str, _size_hint: u64, reader: &mut dyn Read) -> Result<()> {
        let path = self.resolve(key)?;
        self.atomic_write(&path, reader)
            .map_err(|e| classify_io(self.context("PUT", key), e))
    }

    fn get(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.resolve(key)?;
        match fs::File::open(&path) {
            Ok(file) => Ok(Box::new(io::BufReader::new(file))),
            Err(e) => Err(classify_io(self.context("GET", key), e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<KeyListing<'_>> {
        // Walk the deepest directory named by the prefix, then filter by the
        // full string so partial file-name prefixes also match.
        let dir = match prefix.rfind('/') {
            Some(idx) => self.resolve(&prefix[..idx])?,
            None => self.root.clone(),
        };
        let mut keys = Vec::new();
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => self
                .list_recursive(&dir, &mut keys)
                .map_err(|e| classify_io(self.context("LIST", prefix), e))?,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(classify_io(self.context("LIST", prefix), e)),
        }
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(Box::new(keys.into_iter().map(Ok)))
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(classify_io(self.context("DELETE", key), e)),
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
