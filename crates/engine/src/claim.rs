//! Exclusive job claims over the shared filesystem.
//!
//! Workers on different hosts coordinate through one primitive: an
//! advisory, exclusive record lock on a `<jobdir>.lock` file next to the
//! job directory. POSIX `fcntl` record locks are used rather than BSD
//! `flock` because some NFS servers silently ignore the latter.
//!
//! The lock is never waited on: a busy job means "try the next one". A
//! worker that dies abruptly loses its descriptor and the kernel releases
//! the record lock with it; a stale lock *file* left behind is harmless
//! since only the record lock carries meaning.
//!
//! Record locks are per process, not per descriptor: a second acquire from
//! the same process will succeed. That is fine here, one worker process
//! handles one job at a time.

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::libc;
use std::fs::{self, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for claim operations.
///
/// Contention is not an error; it surfaces as `Ok(None)` from [`acquire`].
#[derive(Debug, Error)]
pub enum ClaimError {
    /// Failed to open or create the lock file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The lock syscall itself failed.
    #[error("lock operation failed: {0}")]
    Lock(#[from] nix::Error),
}

/// A held claim. The lock lives exactly as long as the token's file
/// descriptor.
#[derive(Debug)]
pub struct ClaimToken {
    file: fs::File,
}

/// The lock file path for a job directory: a `.lock` sibling.
pub fn lock_path(job_dir: &Path) -> PathBuf {
    let mut name = job_dir.file_name().unwrap_or_default().to_owned();
    name.push(".lock");
    job_dir.parent().unwrap_or(Path::new("")).join(name)
}

fn flock_record(lock_type: libc::c_short) -> libc::flock {
    // Whole-file record starting at offset 0 with zero length
    let mut record: libc::flock = unsafe { std::mem::zeroed() };
    record.l_type = lock_type;
    record.l_whence = libc::SEEK_SET as libc::c_short;
    record
}

/// Try to claim a job directory.
///
/// Opens (creating if absent) the sibling lock file and attempts a
/// non-blocking exclusive record lock. Returns `Ok(Some(token))` on
/// success and `Ok(None)` immediately when another worker holds the
/// claim; never blocks or queues.
pub fn acquire(job_dir: &Path) -> Result<Option<ClaimToken>, ClaimError> {
    let path = lock_path(job_dir);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)?;

    let record = flock_record(libc::F_WRLCK as libc::c_short);
    match fcntl(file.as_raw_fd(), FcntlArg::F_SETLK(&record)) {
        Ok(_) => {
            tracing::debug!(job_dir = %job_dir.display(), "claimed");
            Ok(Some(ClaimToken { file }))
        }
        // Both errnos signal "someone else holds it", per fcntl(2)
        Err(Errno::EAGAIN) | Err(Errno::EACCES) => Ok(None),
        Err(e) => Err(ClaimError::Lock(e)),
    }
}

/// Release a claim.
///
/// Unlocks, closes, and removes the lock file. Every step is best-effort:
/// by the time release runs the claim has already served its purpose, and
/// the kernel drops the record lock with the descriptor regardless.
pub fn release(token: ClaimToken, job_dir: &Path) {
    let record = flock_record(libc::F_UNLCK as libc::c_short);
    let _ = fcntl(token.file.as_raw_fd(), FcntlArg::F_SETLK(&record));
    drop(token.file);
    let _ = fs::remove_file(lock_path(job_dir));
}
