//! Sources for the bundled redis-server executable.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::PathBuf;

/// Store of named executables, keyed by platform file name
/// (`redis-server`, `redis-server.exe`).
pub trait BinaryBundle: Send + Sync + fmt::Debug {
    /// Open the named resource, `None` if the bundle does not carry it.
    fn open(&self, name: &str) -> Option<Box<dyn Read + Send>>;
}

/// In-memory bundle, typically filled with `include_bytes!`.
///
/// ```rust,ignore
/// let bundle = StaticBundle::new()
///     .with_static("redis-server", include_bytes!("../bin/redis-server"));
/// ```
#[derive(Default, Clone)]
pub struct StaticBundle {
    entries: HashMap<String, Vec<u8>>,
}

impl StaticBundle {
    /// Empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry from static bytes, e.g. `include_bytes!`.
    pub fn with_static(self, name: impl Into<String>, bytes: &'static [u8]) -> Self {
        self.with_bytes(name, bytes.to_vec())
    }

    /// Add an entry under `name`.
    pub fn with_bytes(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(name.into(), bytes.into());
        self
    }
}

impl fmt::Debug for StaticBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("StaticBundle").field("entries", &names).finish()
    }
}

impl BinaryBundle for StaticBundle {
    fn open(&self, name: &str) -> Option<Box<dyn Read + Send>> {
        self.entries
            .get(name)
            .map(|bytes| Box::new(Cursor::new(bytes.clone())) as Box<dyn Read + Send>)
    }
}

/// Bundle backed by a directory holding one file per platform key.
#[derive(Debug, Clone)]
pub struct DirectoryBundle {
    root: PathBuf,
}

impl DirectoryBundle {
    /// Bundle reading entries from `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BinaryBundle for DirectoryBundle {
    fn open(&self, name: &str) -> Option<Box<dyn Read + Send>> {
        let path = self.root.join(name);
        match File::open(&path) {
            Ok(file) => Some(Box::new(file)),
            Err(e) => {
                tracing::debug!("Bundle entry {} unavailable: {}", path.display(), e);
                None
            }
        }
    }
}
