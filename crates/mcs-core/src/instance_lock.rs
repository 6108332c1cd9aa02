//! Cross-process singleton lock
//!
//! Prevents more than one instance of the server from running on a host
//! at a time. Ownership is recorded in a well-known lock file in the
//! host's temporary directory whose entire content is the owner's PID in
//! decimal ASCII. A record whose owner is no longer alive is stale and
//! carries no ownership semantics: it is deleted and reclaimed without
//! surfacing an error.
//!
//! The first-touch claim uses an atomic create-if-absent, so two
//! processes racing for an absent lock cannot both win. The takeover
//! paths (stale record, corrupt record, terminated owner) delete and
//! rewrite the file in two steps; the window between them is a known,
//! accepted race.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::error::LockError;
use crate::process::{ProcessControl, SystemProcesses};

/// Well-known lock file name shared by all instances on a host
pub const LOCK_FILE_NAME: &str = "matlab-mcp-core-server.lock";

/// Liveness polls after a termination request before giving up
const TERMINATION_POLLS: u32 = 10;

/// Pause between liveness polls
const TERMINATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default lock file path: the host temp directory plus the well-known name
pub fn default_lock_path() -> PathBuf {
    std::env::temp_dir().join(LOCK_FILE_NAME)
}

/// Result of a lock acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The caller now owns the lock
    Acquired,
    /// A live competing instance owns the lock and takeover was not requested
    Rejected {
        /// PID of the competing owner
        pid: u32,
    },
}

/// Outcome of a termination request against a competing owner
///
/// Kill failures are not represented here; they surface as
/// [`LockError::Kill`] from `acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The competing process was observed dead within the poll budget
    ConfirmedDead,
    /// The poll budget ran out with the process still alive; termination
    /// is best-effort and the lock is reclaimed anyway
    Unconfirmed,
}

/// Cross-process singleton lock keyed by a well-known lock file
///
/// Generic over [`ProcessControl`] so tests can substitute a fake process
/// table; production callers use [`InstanceLock::new`], which binds the
/// default path and the real OS primitives.
#[derive(Debug)]
pub struct InstanceLock<P = SystemProcesses> {
    path: PathBuf,
    pid: u32,
    processes: P,
}

impl InstanceLock<SystemProcesses> {
    /// Create a lock for the current process at the default path
    pub fn new() -> Self {
        Self::with_processes(default_lock_path(), std::process::id(), SystemProcesses)
    }
}

impl Default for InstanceLock<SystemProcesses> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ProcessControl> InstanceLock<P> {
    /// Create a lock with an explicit path, PID, and process backend
    pub fn with_processes(path: impl Into<PathBuf>, pid: u32, processes: P) -> Self {
        Self {
            path: path.into(),
            pid,
            processes,
        }
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attempt to become the sole owner of the lock
    ///
    /// Stale records (dead owner, unreadable or unparsable content) are
    /// recovered silently. A live competing owner is reported as
    /// [`LockOutcome::Rejected`] unless `kill_existing` is set, in which
    /// case the owner is terminated and the lock reclaimed; if the owner
    /// is still alive when the bounded wait runs out, the record is
    /// removed and reclaimed regardless.
    ///
    /// Calling `acquire` while already holding the lock returns
    /// [`LockOutcome::Acquired`] again without rewriting the record.
    pub fn acquire(&self, kill_existing: bool) -> Result<LockOutcome, LockError> {
        // Fast path: atomic create-if-absent claims an absent lock without
        // a separate existence check.
        match self.try_claim_new() {
            Ok(()) => {
                tracing::info!("Acquired instance lock (PID {})", self.pid);
                return Ok(LockOutcome::Acquired);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(self.io_error(e)),
        }

        // Lock file exists: read the recorded owner.
        let owner = match fs::read_to_string(&self.path) {
            Ok(contents) => contents.trim().parse::<u32>().ok(),
            // The owner released between our failed claim and this read.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return self.claim(),
            // Unreadable record: treat as stale.
            Err(_) => None,
        };

        let owner = match owner {
            Some(pid) => pid,
            None => {
                tracing::debug!("Removing unreadable lock record at {:?}", self.path);
                self.remove_record()?;
                return self.claim();
            }
        };

        if owner == self.pid {
            // We already hold the lock.
            return Ok(LockOutcome::Acquired);
        }

        if !self.processes.is_alive(owner) {
            tracing::debug!("Removing stale lock record (PID {} is dead)", owner);
            self.remove_record()?;
            return self.claim();
        }

        // A live competing owner.
        if !kill_existing {
            return Ok(LockOutcome::Rejected { pid: owner });
        }

        match self.terminate_owner(owner)? {
            Termination::ConfirmedDead => {
                tracing::info!("Terminated competing instance (PID {})", owner);
            }
            Termination::Unconfirmed => {
                tracing::warn!(
                    "Competing instance (PID {}) still alive after termination wait, reclaiming lock anyway",
                    owner
                );
            }
        }
        self.remove_record()?;
        self.claim()
    }

    /// Release the lock by removing the lock file
    pub fn release(&self) -> Result<(), LockError> {
        fs::remove_file(&self.path).map_err(|e| self.io_error(e))
    }

    /// Request termination of a live competing owner, then poll its
    /// liveness within a bounded budget to allow it to exit.
    fn terminate_owner(&self, owner: u32) -> Result<Termination, LockError> {
        self.processes
            .terminate(owner)
            .map_err(|source| LockError::Kill { pid: owner, source })?;

        for _ in 0..TERMINATION_POLLS {
            if !self.processes.is_alive(owner) {
                return Ok(Termination::ConfirmedDead);
            }
            thread::sleep(TERMINATION_POLL_INTERVAL);
        }
        Ok(Termination::Unconfirmed)
    }

    /// Atomically create the lock file with our PID as its content
    fn try_claim_new(&self) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        write!(file, "{}", self.pid)
    }

    /// Overwrite-claim once the path has been cleared
    ///
    /// The window between the preceding removal and this write is the
    /// accepted residual race of the takeover paths.
    fn claim(&self) -> Result<LockOutcome, LockError> {
        fs::write(&self.path, self.pid.to_string()).map_err(|e| self.io_error(e))?;
        tracing::info!("Acquired instance lock (PID {})", self.pid);
        Ok(LockOutcome::Acquired)
    }

    /// Remove the current lock record; absence is not an error
    fn remove_record(&self) -> Result<(), LockError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const OUR_PID: u32 = 1000;
    const OTHER_PID: u32 = 4242;

    /// Fake process table: PIDs map to the number of liveness polls they
    /// survive after a termination request.
    #[derive(Default)]
    struct FakeProcesses {
        state: Mutex<HashMap<u32, Option<u32>>>,
        killed: Mutex<Vec<u32>>,
        deny_kill: Option<io::ErrorKind>,
        linger_polls: u32,
    }

    impl FakeProcesses {
        fn with_live(pid: u32) -> Self {
            let fake = Self::default();
            fake.state.lock().unwrap().insert(pid, None);
            fake
        }

        fn with_live_lingering(pid: u32, polls: u32) -> Self {
            let mut fake = Self::with_live(pid);
            fake.linger_polls = polls;
            fake
        }

        fn denying_kill(pid: u32, kind: io::ErrorKind) -> Self {
            let mut fake = Self::with_live(pid);
            fake.deny_kill = Some(kind);
            fake
        }

        fn killed_pids(&self) -> Vec<u32> {
            self.killed.lock().unwrap().clone()
        }
    }

    impl ProcessControl for FakeProcesses {
        fn is_alive(&self, pid: u32) -> bool {
            let mut state = self.state.lock().unwrap();
            match state.get_mut(&pid) {
                None => false,
                Some(None) => true,
                Some(Some(remaining)) => {
                    if *remaining == 0 {
                        state.remove(&pid);
                        false
                    } else {
                        *remaining -= 1;
                        true
                    }
                }
            }
        }

        fn terminate(&self, pid: u32) -> io::Result<()> {
            if let Some(kind) = self.deny_kill {
                return Err(kind.into());
            }
            self.killed.lock().unwrap().push(pid);
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.get_mut(&pid) {
                if entry.is_none() {
                    *entry = Some(self.linger_polls);
                }
            }
            Ok(())
        }
    }

    fn lock_in(dir: &TempDir, processes: FakeProcesses) -> InstanceLock<FakeProcesses> {
        InstanceLock::with_processes(dir.path().join("test.lock"), OUR_PID, processes)
    }

    #[test]
    fn test_acquire_on_absent_file() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir, FakeProcesses::default());

        assert_eq!(lock.acquire(false).unwrap(), LockOutcome::Acquired);
        assert_eq!(fs::read_to_string(lock.path()).unwrap(), OUR_PID.to_string());
    }

    #[test]
    fn test_acquire_reclaims_dead_owner() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir, FakeProcesses::default());
        fs::write(lock.path(), "99999").unwrap();

        assert_eq!(lock.acquire(false).unwrap(), LockOutcome::Acquired);
        assert_eq!(fs::read_to_string(lock.path()).unwrap(), OUR_PID.to_string());
    }

    #[test]
    fn test_acquire_rejects_live_competitor() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir, FakeProcesses::with_live(OTHER_PID));
        fs::write(lock.path(), OTHER_PID.to_string()).unwrap();

        assert_eq!(
            lock.acquire(false).unwrap(),
            LockOutcome::Rejected { pid: OTHER_PID }
        );
        // File must be left untouched.
        assert_eq!(
            fs::read_to_string(lock.path()).unwrap(),
            OTHER_PID.to_string()
        );
    }

    #[test]
    fn test_acquire_kills_live_competitor() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir, FakeProcesses::with_live(OTHER_PID));
        fs::write(lock.path(), OTHER_PID.to_string()).unwrap();

        assert_eq!(lock.acquire(true).unwrap(), LockOutcome::Acquired);
        assert_eq!(lock.processes.killed_pids(), vec![OTHER_PID]);
        assert_eq!(fs::read_to_string(lock.path()).unwrap(), OUR_PID.to_string());
    }

    #[test]
    fn test_acquire_waits_for_lingering_competitor() {
        let dir = TempDir::new().unwrap();
        // Competitor survives two liveness polls after the kill (~200ms).
        let lock = lock_in(&dir, FakeProcesses::with_live_lingering(OTHER_PID, 2));
        fs::write(lock.path(), OTHER_PID.to_string()).unwrap();

        assert_eq!(lock.acquire(true).unwrap(), LockOutcome::Acquired);
        assert_eq!(fs::read_to_string(lock.path()).unwrap(), OUR_PID.to_string());
    }

    #[test]
    fn test_acquire_reclaims_even_when_kill_unconfirmed() {
        let dir = TempDir::new().unwrap();
        // Competitor never dies; the poll budget must run out (~1s) and
        // the lock must still change hands.
        let lock = lock_in(
            &dir,
            FakeProcesses::with_live_lingering(OTHER_PID, u32::MAX),
        );
        fs::write(lock.path(), OTHER_PID.to_string()).unwrap();

        assert_eq!(lock.acquire(true).unwrap(), LockOutcome::Acquired);
        assert_eq!(fs::read_to_string(lock.path()).unwrap(), OUR_PID.to_string());
    }

    #[test]
    fn test_kill_failure_surfaces() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(
            &dir,
            FakeProcesses::denying_kill(OTHER_PID, io::ErrorKind::PermissionDenied),
        );
        fs::write(lock.path(), OTHER_PID.to_string()).unwrap();

        match lock.acquire(true) {
            Err(LockError::Kill { pid, .. }) => assert_eq!(pid, OTHER_PID),
            other => panic!("expected kill failure, got {:?}", other),
        }
        // The competitor keeps the lock.
        assert_eq!(
            fs::read_to_string(lock.path()).unwrap(),
            OTHER_PID.to_string()
        );
    }

    #[test]
    fn test_acquire_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir, FakeProcesses::with_live(OUR_PID));

        assert_eq!(lock.acquire(false).unwrap(), LockOutcome::Acquired);
        assert_eq!(lock.acquire(false).unwrap(), LockOutcome::Acquired);
        assert_eq!(fs::read_to_string(lock.path()).unwrap(), OUR_PID.to_string());
    }

    #[test]
    fn test_corrupt_record_is_replaced() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir, FakeProcesses::default());
        fs::write(lock.path(), "not-a-pid").unwrap();

        assert_eq!(lock.acquire(false).unwrap(), LockOutcome::Acquired);
        assert_eq!(fs::read_to_string(lock.path()).unwrap(), OUR_PID.to_string());
    }

    #[test]
    fn test_release_removes_file() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir, FakeProcesses::default());

        lock.acquire(false).unwrap();
        lock.release().unwrap();
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_release_without_lock_file_fails() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir, FakeProcesses::default());

        assert!(matches!(lock.release(), Err(LockError::Io { .. })));
    }

    #[test]
    fn test_termination_outcome_tri_state() {
        let dir = TempDir::new().unwrap();

        let lock = lock_in(&dir, FakeProcesses::with_live(OTHER_PID));
        assert_eq!(
            lock.terminate_owner(OTHER_PID).unwrap(),
            Termination::ConfirmedDead
        );

        let lock = lock_in(
            &dir,
            FakeProcesses::with_live_lingering(OTHER_PID, u32::MAX),
        );
        assert_eq!(
            lock.terminate_owner(OTHER_PID).unwrap(),
            Termination::Unconfirmed
        );
    }

    #[test]
    fn test_default_lock_path_uses_well_known_name() {
        assert!(default_lock_path().ends_with(LOCK_FILE_NAME));
    }
}
