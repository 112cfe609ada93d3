//! File access used by the loader
//!
//! The disk file system lives outside the kernel core; it is reached through
//! [`FileSystem`] and [`File`]. [`RamFs`] keeps files in memory and backs the
//! boot modules and the tests.
mod ramfs;

use crate::config::FILE_BLOCK_SIZE;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

pub use ramfs::RamFs;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("{0}: no such file or directory")]
    NotFound(String),
    #[error("{0}: is a directory")]
    IsDirectory(String),
}

/// An open file with a cursor.
pub trait File: Send {
    /// If readable
    fn readable(&self) -> bool;
    /// If writable
    fn writable(&self) -> bool;
    /// Whether this handle names a directory.
    fn is_dir(&self) -> bool;
    /// Read from the cursor into `buf`.
    ///
    /// # Return
    /// Number of bytes read
    fn read(&mut self, buf: &mut [u8]) -> usize;
    /// Write `buf` at the cursor.
    ///
    /// # Return
    /// Number of bytes written
    fn write(&mut self, buf: &[u8]) -> usize;
    /// The cursor reached the end of the file.
    fn eof(&self) -> bool;

    /// Read the rest of the file, one block at a time.
    fn read_all(&mut self) -> Vec<u8> {
        let mut data = Vec::new();
        let mut block = [0u8; FILE_BLOCK_SIZE];
        while !self.eof() {
            let n = self.read(&mut block);
            if n == 0 {
                break;
            }
            data.extend_from_slice(&block[..n]);
        }
        data
    }
}

pub trait FileSystem: Send {
    /// Open `path`; closing is dropping the handle.
    fn open(&self, path: &str) -> Result<Box<dyn File>, FsError>;
}
