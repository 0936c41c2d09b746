//! Advisory run lock. At most one tally run per database at a time.

use crate::error::ErrorCode;
use fs2::FileExt;
use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

const POLL_START: Duration = Duration::from_millis(5);
const POLL_MAX: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum LockError {
    /// Another run held the lock for the whole timeout.
    Contended {
        path: PathBuf,
        waited: Duration,
        /// Process id recorded by the holder, when readable.
        holder: Option<u32>,
    },
    Io { path: PathBuf, source: io::Error },
}

impl LockError {
    /// Machine-readable code associated with this lock error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Contended { .. } => ErrorCode::LockContention,
            Self::Io { .. } => ErrorCode::LockIo,
        }
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contended {
                path,
                waited,
                holder,
            } => {
                write!(f, "run lock {} still held after {waited:?}", path.display())?;
                if let Some(pid) = holder {
                    write!(f, " (holder pid {pid})")?;
                }
                Ok(())
            }
            Self::Io { path, source } => write!(f, "run lock {}: {source}", path.display()),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Contended { .. } => None,
        }
    }
}

/// Exclusive lock held by a tally run from watermark read to commit.
///
/// The holder writes its pid into the file so a blocked run can name it.
/// Dropping the guard releases the lock.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock at `path`, polling with backoff until `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Contended`] if another holder keeps the lock past
    /// `timeout`, or [`LockError::Io`] if the lock file cannot be created.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        let started = Instant::now();
        let mut pause = POLL_START;
        while file.try_lock_exclusive().is_err() {
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Contended {
                    path: path.to_path_buf(),
                    waited,
                    holder: read_holder(&mut file),
                });
            }
            thread::sleep(pause.min(timeout.saturating_sub(waited)));
            pause = (pause * 2).min(POLL_MAX);
        }

        if let Err(err) = record_holder(&mut file) {
            tracing::debug!(error = %err, path = %path.display(), "could not record lock holder");
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Lock file that sits next to a database file (`<db>.lock`).
    #[must_use]
    pub fn path_for(db_path: &Path) -> PathBuf {
        let mut name = db_path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".lock");
        db_path.with_file_name(name)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
    }
}

fn record_holder(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{}", std::process::id())?;
    file.flush()
}

fn read_holder(file: &mut File) -> Option<u32> {
    let mut raw = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut raw).ok()?;
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::{LockError, RunLock};
    use crate::error::ErrorCode;
    use std::{
        path::Path,
        sync::{Arc, Barrier},
        thread,
        time::Duration,
    };

    #[test]
    fn held_lock_names_its_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tallies.sqlite3.lock");
        let guard = RunLock::acquire(&path, Duration::from_millis(50)).unwrap();
        assert_eq!(guard.path(), path.as_path());

        let err = RunLock::acquire(&path, Duration::from_millis(20)).unwrap_err();
        match &err {
            LockError::Contended { holder, .. } => assert_eq!(*holder, Some(std::process::id())),
            other => panic!("expected contention, got {other:?}"),
        }
        assert_eq!(err.code(), ErrorCode::LockContention);
        assert!(err.hint().is_some());
        assert!(err.to_string().contains("holder pid"));
    }

    #[test]
    fn dropping_the_guard_frees_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/run.lock");
        drop(RunLock::acquire(&path, Duration::from_millis(50)).unwrap());
        assert!(RunLock::acquire(&path, Duration::from_millis(50)).is_ok());
    }

    #[test]
    fn lock_path_sits_next_to_database() {
        let path = RunLock::path_for(Path::new("/var/lib/popular/tallies.sqlite3"));
        assert_eq!(path, Path::new("/var/lib/popular/tallies.sqlite3.lock"));
    }

    #[test]
    fn waiting_run_proceeds_once_holder_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");
        let held = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let holder = {
            let (held, release, path) = (Arc::clone(&held), Arc::clone(&release), path.clone());
            thread::spawn(move || {
                let _guard = RunLock::acquire(&path, Duration::from_millis(200)).unwrap();
                held.wait();
                release.wait();
            })
        };

        held.wait();
        assert!(matches!(
            RunLock::acquire(&path, Duration::from_millis(20)),
            Err(LockError::Contended { .. })
        ));
        release.wait();
        holder.join().unwrap();

        assert!(RunLock::acquire(&path, Duration::from_secs(1)).is_ok());
    }
}
