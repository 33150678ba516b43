//! Best-effort advisory file locking.

use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Advisory exclusive lock on a sidecar file next to `target`.
///
/// Locking is best-effort: a lock that cannot be taken yields a guard with
/// `locked() == false`, and callers decide whether to proceed anyway. The
/// sidecar file is left in place; only the lock is released on drop.
pub struct FileLock {
    file: Option<File>,
    path: PathBuf,
}

impl FileLock {
    /// Try to take an exclusive lock for `target`.
    pub fn acquire(target: &Path) -> Self {
        let path = lock_path(target);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .ok()
            .and_then(|file| file.lock_exclusive().is_ok().then_some(file));
        Self { file, path }
    }

    pub fn locked(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    name.push_str(".lock");
    target.with_file_name(name)
}
