//! Exclusive dispatcher lock.
//!
//! Recovery requeues every in-flight job and reaps every managed container
//! the recovering process does not own, so it must never run next to a live
//! dispatcher on the same store. Both hold an advisory lock on one file for
//! as long as they work. The OS releases it when the holder exits, so a
//! crashed dispatcher never leaves it stuck.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::FileExt;

use crate::error::LockError;

#[derive(Debug)]
pub struct DispatcherLock {
    _file: File,
    path: PathBuf,
}

impl DispatcherLock {
    /// Take the lock at `path` without waiting.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io = |source: std::io::Error| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io)?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(LockError::Held {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(io(e)),
        }

        // Holder pid, for whoever finds the file.
        file.set_len(0).map_err(io)?;
        writeln!(file, "{}", std::process::id()).map_err(io)?;
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("dispatcher.lock");

        let first = DispatcherLock::acquire(&path).unwrap();
        assert_eq!(first.path(), path.as_path());
        let pid = std::fs::read_to_string(&path).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());

        let err = DispatcherLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::Held { .. }));
        assert!(err.to_string().contains("dispatcher.lock"));

        drop(first);
        assert!(DispatcherLock::acquire(&path).is_ok());
    }
}
