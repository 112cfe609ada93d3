//! An in-memory, read-only file system.
use super::{File, FileSystem, FsError};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Files keyed by absolute path. Directories exist implicitly for every
/// prefix of a file path.
#[derive(Default)]
pub struct RamFs {
    files: BTreeMap<String, Arc<[u8]>>,
    dirs: BTreeSet<String>,
}

impl RamFs {
    pub fn new() -> Self {
        let mut fs = Self::default();
        fs.dirs.insert("/".to_string());
        fs
    }

    /// Add (or replace) the file at `path`.
    pub fn insert(&mut self, path: &str, data: Vec<u8>) {
        let path = normalize(path);
        let mut end = 0;
        while let Some(pos) = path[end + 1..].find('/') {
            end += pos + 1;
            self.dirs.insert(path[..end].to_string());
        }
        self.files.insert(path, Arc::from(data));
    }

    /// Paths of every file, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        let mut absolute = String::from("/");
        absolute.push_str(trimmed);
        absolute
    }
}

impl FileSystem for RamFs {
    fn open(&self, path: &str) -> Result<Box<dyn File>, FsError> {
        let path = normalize(path);
        if let Some(data) = self.files.get(&path) {
            return Ok(Box::new(RamFile {
                data: data.clone(),
                offset: 0,
                dir: false,
            }));
        }
        if self.dirs.contains(&path) {
            return Ok(Box::new(RamFile {
                data: Arc::from(Vec::new()),
                offset: 0,
                dir: true,
            }));
        }
        Err(FsError::NotFound(path))
    }
}

struct RamFile {
    data: Arc<[u8]>,
    offset: usize,
    dir: bool,
}

impl File for RamFile {
    fn readable(&self) -> bool {
        !self.dir
    }

    fn writable(&self) -> bool {
        false
    }

    fn is_dir(&self) -> bool {
        self.dir
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let rest = &self.data[self.offset..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.offset += n;
        n
    }

    fn write(&mut self, _buf: &[u8]) -> usize {
        0
    }

    fn eof(&self) -> bool {
        self.offset >= self.data.len()
    }
}
