use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Generic durable key/value storage addressed by logical file + key.
///
/// Calls are synchronous; callers treat them as non-blocking.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, file: &str, key: &str) -> io::Result<Option<String>>;

    fn set(&self, file: &str, key: &str, value: &str) -> io::Result<()>;

    /// Writes several keys of one file. Implementations should make this a
    /// single replace of the file where they can.
    fn set_many(&self, file: &str, entries: &[(&str, String)]) -> io::Result<()> {
        for (key, value) in entries {
            self.set(file, key, value)?;
        }
        Ok(())
    }

    fn delete(&self, file: &str, key: &str) -> io::Result<()>;

    fn delete_file(&self, file: &str) -> io::Result<()>;
}

/// Stores each logical file as a JSON object at `<dir>/<file>.json`.
pub struct FileKeyValueStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileKeyValueStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, file: &str) -> PathBuf {
        self.dir.join(format!("{file}.json"))
    }

    fn read_file(&self, file: &str) -> io::Result<BTreeMap<String, String>> {
        let content = match std::fs::read_to_string(self.file_path(file)) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Write to a sibling temp file, then rename over the target.
    fn write_file(&self, file: &str, entries: &BTreeMap<String, String>) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.file_path(file);
        let tmp = self.dir.join(format!("{file}.json.tmp"));
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)
    }

    fn update<F>(&self, file: &str, apply: F) -> io::Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        // A corrupt file is replaced; any other read failure aborts the write.
        let mut entries = match self.read_file(file) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!(file, error = %e, "replacing unreadable store file");
                BTreeMap::new()
            }
            Err(e) => return Err(e),
        };
        apply(&mut entries);
        self.write_file(file, &entries)
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, file: &str, key: &str) -> io::Result<Option<String>> {
        Ok(self.read_file(file)?.remove(key))
    }

    fn set(&self, file: &str, key: &str, value: &str) -> io::Result<()> {
        self.update(file, |entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn set_many(&self, file: &str, new_entries: &[(&str, String)]) -> io::Result<()> {
        self.update(file, |entries| {
            for (key, value) in new_entries {
                entries.insert((*key).to_string(), value.clone());
            }
        })
    }

    fn delete(&self, file: &str, key: &str) -> io::Result<()> {
        if !self.file_path(file).exists() {
            return Ok(());
        }
        self.update(file, |entries| {
            entries.remove(key);
        })
    }

    fn delete_file(&self, file: &str) -> io::Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        match std::fs::remove_file(self.file_path(file)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// In-process store, used by tests and headless runs.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, file: &str, key: &str) -> io::Result<Option<String>> {
        Ok(self.lock().get(&(file.to_string(), key.to_string())).cloned())
    }

    fn set(&self, file: &str, key: &str, value: &str) -> io::Result<()> {
        self.lock()
            .insert((file.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn delete(&self, file: &str, key: &str) -> io::Result<()> {
        self.lock().remove(&(file.to_string(), key.to_string()));
        Ok(())
    }

    fn delete_file(&self, file: &str) -> io::Result<()> {
        self.lock().retain(|(f, _), _| f != file);
        Ok(())
    }
}
