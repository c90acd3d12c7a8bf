//! Checkpoint Store
//!
//! Durable persistence for a Session under `<repo>/.rulectl/`:
//!
//! ```text
//! .rulectl/
//! ├── .lock                 exclusive lock sentinel
//! ├── progress.json         Session + PhaseRecords
//! ├── cache/<phase>.json    CacheEntry envelopes
//! ├── rules.json            final report (survives clear)
//! └── config.toml           project configuration
//! ```
//!
//! Every write goes to a temp file in the target's directory, is fsynced,
//! then renamed over the target. A reader therefore sees either the previous
//! complete file or the new complete file.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::phase::AnalysisPhase;
use super::types::{CacheEntry, Loaded, PhaseRecord, Session};
use crate::constants::{checkpoint, paths};
use crate::types::{Result, RulectlError};

pub struct CheckpointStore {
    repo_root: PathBuf,
    state_dir: PathBuf,
    /// Held for the lifetime of the store; the OS releases it on drop or exit
    lock: Option<File>,
    last_checkpoint: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("state_dir", &self.state_dir)
            .field("locked", &self.lock.is_some())
            .finish()
    }
}

impl CheckpointStore {
    /// Open the state directory for writing, waiting up to `lock_timeout`
    /// for the exclusive lock.
    pub fn open(repo_root: &Path, lock_timeout: Duration) -> Result<Self> {
        let state_dir = repo_root.join(paths::STATE_DIR);
        let cache_dir = state_dir.join(paths::CACHE_DIR);
        fs::create_dir_all(&cache_dir).map_err(|e| RulectlError::durability(&cache_dir, e))?;

        let lock = Self::acquire_lock(&state_dir, lock_timeout)?;
        let store = Self {
            repo_root: repo_root.to_path_buf(),
            state_dir,
            lock: Some(lock),
            last_checkpoint: Mutex::new(None),
        };
        store.remove_stray_temp_files();
        Ok(store)
    }

    /// Open without locking; every write is refused
    pub fn open_read_only(repo_root: &Path) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            state_dir: repo_root.join(paths::STATE_DIR),
            lock: None,
            last_checkpoint: Mutex::new(None),
        }
    }

    fn acquire_lock(state_dir: &Path, timeout: Duration) -> Result<File> {
        let lock_path = state_dir.join(paths::LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| RulectlError::durability(&lock_path, e))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    debug!(path = %lock_path.display(), "Acquired state lock");
                    return Ok(file);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(RulectlError::StateLocked {
                            path: state_dir.to_path_buf(),
                            waited: timeout,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(checkpoint::LOCK_RETRY_MS));
                }
                Err(e) => return Err(RulectlError::durability(&lock_path, e)),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Paths
    // -------------------------------------------------------------------------

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn progress_path(&self) -> PathBuf {
        self.state_dir.join(paths::PROGRESS_FILE)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join(paths::CACHE_DIR)
    }

    pub fn cache_path(&self, phase: AnalysisPhase) -> Option<PathBuf> {
        phase
            .cache_key()
            .map(|key| self.cache_dir().join(format!("{}.json", key)))
    }

    pub fn rules_path(&self) -> PathBuf {
        self.state_dir.join(paths::RULES_FILE)
    }

    /// Whether any session state is on disk
    pub fn has_state(&self) -> bool {
        self.progress_path().exists()
    }

    pub fn last_checkpoint(&self) -> Option<DateTime<Utc>> {
        *self
            .last_checkpoint
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    // -------------------------------------------------------------------------
    // Session
    // -------------------------------------------------------------------------

    pub fn load(&self) -> Result<Loaded<Session>> {
        let path = self.progress_path();
        let Some(text) = read_optional(&path)? else {
            return Ok(Loaded::Missing);
        };

        let session: Session = match serde_json::from_str(&text) {
            Ok(session) => session,
            Err(e) => return Ok(Loaded::Corrupted(format!("progress.json: {}", e))),
        };
        if let Err(reason) = session.validate() {
            return Ok(Loaded::Corrupted(format!("progress.json: {}", reason)));
        }
        if session.repo_path != self.repo_root {
            return Ok(Loaded::Corrupted(format!(
                "progress.json belongs to {}",
                session.repo_path.display()
            )));
        }
        Ok(Loaded::Present(session))
    }

    pub fn save_session(&self, session: &Session) -> Result<()> {
        let path = self.progress_path();
        self.write_json(&path, session)?;
        debug!(
            phase = %session.current_phase,
            "Saved progress"
        );
        Ok(())
    }

    /// Replace one phase record and persist the session
    pub fn save_phase(&self, session: &mut Session, record: PhaseRecord) -> Result<()> {
        let phase = record.phase;
        *session.record_mut(phase) = record;
        session.touch();
        self.save_session(session)
    }

    // -------------------------------------------------------------------------
    // Caches
    // -------------------------------------------------------------------------

    pub fn save_cache(&self, session: &Session, phase: AnalysisPhase, data: &Value) -> Result<()> {
        let path = self.cache_path(phase).ok_or_else(|| {
            RulectlError::Session(format!("phase {} has no cache", phase))
        })?;
        let entry = CacheEntry::new(&session.session_id, phase, data.clone())?;
        self.write_json(&path, &entry)
    }

    pub fn load_cache(&self, session: &Session, phase: AnalysisPhase) -> Result<Loaded<Value>> {
        let Some(path) = self.cache_path(phase) else {
            return Ok(Loaded::Missing);
        };
        let Some(text) = read_optional(&path)? else {
            return Ok(Loaded::Missing);
        };

        let entry: CacheEntry = match serde_json::from_str(&text) {
            Ok(entry) => entry,
            Err(e) => return Ok(Loaded::Corrupted(e.to_string())),
        };
        match entry.verify(&session.session_id, phase) {
            Ok(()) => Ok(Loaded::Present(entry.data)),
            Err(reason) => Ok(Loaded::Corrupted(reason)),
        }
    }

    pub fn clear_cache(&self, phase: AnalysisPhase) -> Result<()> {
        self.ensure_writable()?;
        if let Some(path) = self.cache_path(phase) {
            remove_optional(&path)?;
        }
        Ok(())
    }

    /// Delete the session and every cache. The final report and project
    /// config are kept.
    pub fn clear(&self) -> Result<()> {
        self.ensure_writable()?;
        remove_optional(&self.progress_path())?;
        for phase in AnalysisPhase::ALL {
            self.clear_cache(phase)?;
        }
        self.remove_stray_temp_files();
        debug!(dir = %self.state_dir.display(), "Cleared analysis state");
        Ok(())
    }

    /// Atomically write the final rules report
    pub fn write_report<T: Serialize>(&self, report: &T) -> Result<PathBuf> {
        let path = self.rules_path();
        self.write_json(&path, report)?;
        Ok(path)
    }

    // -------------------------------------------------------------------------
    // Atomic Writes
    // -------------------------------------------------------------------------

    fn ensure_writable(&self) -> Result<()> {
        if self.lock.is_none() {
            return Err(RulectlError::Session(
                "checkpoint store was opened read-only".to_string(),
            ));
        }
        Ok(())
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        self.ensure_writable()?;
        let bytes = serde_json::to_vec_pretty(value)?;
        stage_temp(path, &bytes)
            .and_then(|temp| commit_temp(&temp, path))
            .map_err(|e| {
                let err = RulectlError::durability(path, e);
                match self.last_checkpoint() {
                    Some(at) => err.with_last_checkpoint(at.to_rfc3339()),
                    None => err,
                }
            })?;
        *self
            .last_checkpoint
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());
        Ok(())
    }

    fn remove_stray_temp_files(&self) {
        for dir in [self.state_dir.clone(), self.cache_dir()] {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.') && name.ends_with(".tmp") {
                    match fs::remove_file(entry.path()) {
                        Ok(()) => debug!(file = %name, "Removed stray temp file"),
                        Err(e) => warn!(file = %name, error = %e, "Failed to remove temp file"),
                    }
                }
            }
        }
    }
}

/// Write `bytes` to a fresh temp file beside `path` and fsync it
fn stage_temp(path: &Path, bytes: &[u8]) -> std::io::Result<PathBuf> {
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("state"),
        uuid::Uuid::new_v4()
    );
    let temp_path = path.with_file_name(temp_name);

    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    Ok(temp_path)
}

/// Rename a staged temp file over `path`
fn commit_temp(temp_path: &Path, path: &Path) -> std::io::Result<()> {
    if let Err(e) = fs::rename(temp_path, path) {
        let _ = fs::remove_file(temp_path);
        return Err(e);
    }

    #[cfg(unix)]
    {
        if let Some(parent) = path.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_optional(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RulectlError::durability(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::phase::PhaseStatus;
    use crate::pipeline::types::{FailedItem, RunOptions};
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    const LOCK_WAIT: Duration = Duration::from_millis(200);

    fn open(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::open(dir.path(), LOCK_WAIT).unwrap()
    }

    fn new_session(store: &CheckpointStore) -> Session {
        Session::new(store.repo_root(), RunOptions::default())
    }

    #[test]
    fn test_missing_state() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        assert_eq!(store.load().unwrap(), Loaded::Missing);
        assert!(!store.has_state());
        assert!(store.state_dir().join(".lock").exists());
    }

    #[test]
    fn test_session_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let mut session = new_session(&store);
        session.current_phase = AnalysisPhase::Setup;
        store.save_session(&session).unwrap();

        let loaded = store.load().unwrap().present().unwrap();
        assert_eq!(loaded, session);
        assert!(store.last_checkpoint().is_some());
    }

    #[test]
    fn test_save_phase_replaces_record() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let mut session = new_session(&store);

        let mut record = PhaseRecord::new(AnalysisPhase::Setup);
        record.status = PhaseStatus::InProgress;
        store.save_phase(&mut session, record).unwrap();

        let loaded = store.load().unwrap().present().unwrap();
        assert_eq!(
            loaded.record(AnalysisPhase::Setup).status,
            PhaseStatus::InProgress
        );
    }

    #[test]
    fn test_garbage_progress_is_corrupted_not_error() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        fs::write(store.progress_path(), "{ not json").unwrap();
        assert!(matches!(store.load().unwrap(), Loaded::Corrupted(_)));
    }

    #[test]
    fn test_session_for_other_repo_is_corrupted() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let session = Session::new("/somewhere/else", RunOptions::default());
        store.save_session(&session).unwrap();
        assert!(matches!(store.load().unwrap(), Loaded::Corrupted(_)));
    }

    #[test]
    fn test_cache_round_trip_and_validation() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let session = new_session(&store);
        let data = json!({"files": ["a.rs", "b.rs"]});

        assert_eq!(
            store
                .load_cache(&session, AnalysisPhase::FileDiscovery)
                .unwrap(),
            Loaded::Missing
        );
        store
            .save_cache(&session, AnalysisPhase::FileDiscovery, &data)
            .unwrap();
        assert_eq!(
            store
                .load_cache(&session, AnalysisPhase::FileDiscovery)
                .unwrap(),
            Loaded::Present(data)
        );

        // Cache written by another session does not validate
        let other = new_session(&store);
        assert!(matches!(
            store.load_cache(&other, AnalysisPhase::FileDiscovery).unwrap(),
            Loaded::Corrupted(_)
        ));

        // Hand edits break the checksum
        let path = store.cache_path(AnalysisPhase::FileDiscovery).unwrap();
        let edited = fs::read_to_string(&path).unwrap().replace("b.rs", "c.rs");
        fs::write(&path, edited).unwrap();
        assert!(matches!(
            store
                .load_cache(&session, AnalysisPhase::FileDiscovery)
                .unwrap(),
            Loaded::Corrupted(_)
        ));
    }

    #[test]
    fn test_setup_has_no_cache() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let session = new_session(&store);
        assert!(store.save_cache(&session, AnalysisPhase::Setup, &json!({})).is_err());
        assert_eq!(
            store.load_cache(&session, AnalysisPhase::Setup).unwrap(),
            Loaded::Missing
        );
    }

    #[test]
    fn test_clear_keeps_report() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let session = new_session(&store);
        store.save_session(&session).unwrap();
        store
            .save_cache(&session, AnalysisPhase::FileAnalysis, &json!({}))
            .unwrap();
        let report = store.write_report(&json!({"rules": []})).unwrap();

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), Loaded::Missing);
        assert!(
            !store
                .cache_path(AnalysisPhase::FileAnalysis)
                .unwrap()
                .exists()
        );
        assert!(report.exists());
    }

    #[test]
    fn test_second_writer_times_out() {
        let dir = TempDir::new().unwrap();
        let _first = open(&dir);
        let second = CheckpointStore::open(dir.path(), Duration::from_millis(150));
        assert!(matches!(second, Err(RulectlError::StateLocked { .. })));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        drop(open(&dir));
        assert!(CheckpointStore::open(dir.path(), LOCK_WAIT).is_ok());
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open_read_only(dir.path());
        let session = new_session(&store);
        assert!(store.save_session(&session).is_err());
        assert!(store.clear().is_err());
        assert_eq!(store.load().unwrap(), Loaded::Missing);
    }

    #[test]
    fn test_stray_temp_files_removed_on_open() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let stray = stage_temp(&store.progress_path(), b"partial").unwrap();
        assert!(stray.exists());
        drop(store);

        let _store = open(&dir);
        assert!(!stray.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_unwritable_state_is_durability_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let session = new_session(&store);
        store.save_session(&session).unwrap();

        fs::set_permissions(store.state_dir(), fs::Permissions::from_mode(0o500)).unwrap();
        let result = store.save_session(&session);
        fs::set_permissions(store.state_dir(), fs::Permissions::from_mode(0o700)).unwrap();

        // Root ignores directory permissions
        if let Err(err) = result {
            assert!(matches!(
                err,
                RulectlError::StateDurability {
                    last_checkpoint: Some(_),
                    ..
                }
            ));
        }
    }

    fn session_with_progress(store: &CheckpointStore, base: &Session, completed: usize) -> Session {
        let mut session = base.clone();
        session.current_phase = AnalysisPhase::Setup;
        let record = session.record_mut(AnalysisPhase::Setup);
        record.status = PhaseStatus::InProgress;
        record.progress.completed_count = completed;
        record.progress.total_count = 1000;
        record.progress.failed_items = (0..completed % 3)
            .map(|i| FailedItem {
                item: format!("file_{}.rs", i),
                reason: "unparseable".into(),
            })
            .collect();
        session.repo_path = store.repo_root().to_path_buf();
        session
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// A crash at any point of a write leaves either the previous or the
        /// new complete state visible to the next reader.
        #[test]
        fn prop_crash_during_write_never_exposes_partial_state(
            writes in prop::collection::vec((1usize..500, any::<bool>(), 0.0f64..1.0), 1..12)
        ) {
            let dir = TempDir::new().unwrap();
            let base = {
                let store = open(&dir);
                new_session(&store)
            };
            let mut durable: Option<Session> = None;

            for (completed, crash, cut) in writes {
                let store = open(&dir);
                let next = session_with_progress(&store, &base, completed);
                let path = store.progress_path();
                let bytes = serde_json::to_vec_pretty(&next).unwrap();

                if crash {
                    // Crash while the temp file was being written or before rename
                    let cut_at = ((bytes.len() as f64) * cut) as usize;
                    stage_temp(&path, &bytes[..cut_at]).unwrap();
                } else {
                    let temp = stage_temp(&path, &bytes).unwrap();
                    commit_temp(&temp, &path).unwrap();
                    durable = Some(next);
                }
                drop(store);

                let reader = open(&dir);
                match (reader.load().unwrap(), &durable) {
                    (Loaded::Missing, None) => {}
                    (Loaded::Present(seen), Some(expected)) => prop_assert_eq!(&seen, expected),
                    (other, expected) => prop_assert!(
                        false,
                        "unexpected state {:?}, expected {:?}",
                        other,
                        expected.as_ref().map(|s| s.record(AnalysisPhase::Setup).progress.completed_count)
                    ),
                }
            }
        }
    }
}
