//! The directory handoff between producer (BU) and consumer (FU).
//!
//! The producer owns `{bu_base}/run{NNNNNN}`. A raw file is announced by atomically
//! renaming its `.ready` marker into the run directory after the data file itself is in
//! place. A consumer claims the file by renaming that marker to `.claimed`; rename is
//! atomic, so when several consumers race for the same marker exactly one rename
//! succeeds and the rest see the marker vanish. The end of the run is announced by an
//! `_EoR.marker` written after the last ready marker.
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::backoff::{RetryPolicy, Sleeper, ThreadSleeper};
use super::error::{ClaimError, HandoffError};
use super::raw_file::{eor_marker_name, run_dir_name, ClaimedFile, FileMarker, RawFile, RawFileName};

/// Everything the handoff needs to know about the run being taken. Passed explicitly so
/// several runs can be simulated side by side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_number: u32,
    pub bu_run_dir: PathBuf,
    pub fu_run_dir: PathBuf,
}

impl RunContext {
    pub fn new(run_number: u32, bu_base_dir: &Path, fu_base_dir: &Path) -> Self {
        Self {
            run_number,
            bu_run_dir: bu_base_dir.join(run_dir_name(run_number)),
            fu_run_dir: fu_base_dir.join(run_dir_name(run_number)),
        }
    }

    pub fn eor_marker(&self) -> PathBuf {
        self.bu_run_dir.join(eor_marker_name(self.run_number))
    }
}

/// Create `base/run{run:06}` if needed, with the default retry policy.
pub fn ensure_run_directory(base_dir: &Path, run_number: u32) -> Result<PathBuf, HandoffError> {
    ensure_run_directory_with(base_dir, run_number, &RetryPolicy::default(), &ThreadSleeper)
}

/// Create `base/run{run:06}` if needed. An existing directory is success; anything else
/// is retried under `policy` before being escalated.
pub fn ensure_run_directory_with(
    base_dir: &Path,
    run_number: u32,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
) -> Result<PathBuf, HandoffError> {
    let run_dir = base_dir.join(run_dir_name(run_number));
    ensure_directory(&run_dir, policy, sleeper)?;
    Ok(run_dir)
}

pub(crate) fn ensure_directory(
    dir: &Path,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
) -> Result<(), HandoffError> {
    policy
        .run(sleeper, || match std::fs::create_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
            Err(e) => Err(e),
        })
        .map_err(|(source, attempts)| {
            log::error!("Could not create directory {}: {source}", dir.display());
            HandoffError::RetriesExhausted {
                path: dir.to_path_buf(),
                attempts,
                source,
            }
        })
}

/// Find the oldest ready, unclaimed raw file in a run directory.
///
/// Returns `Ok(None)` when nothing is ready yet, including when the producer has not
/// created the run directory. The caller is expected to poll.
pub fn discover_next_file(run_dir: &Path) -> Result<Option<RawFile>, HandoffError> {
    let entries = match run_dir.read_dir() {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(HandoffError::IOError {
                path: run_dir.to_path_buf(),
                source,
            })
        }
    };

    let mut candidates: Vec<RawFileName> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| HandoffError::IOError {
            path: run_dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(crate::constants::READY_EXTENSION) {
            continue;
        }
        if let Some(name) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(RawFileName::parse)
        {
            candidates.push(name);
        }
    }
    candidates.sort();

    for name in candidates {
        let marker_path = run_dir.join(name.ready_name());
        let marker: FileMarker = match std::fs::read_to_string(&marker_path) {
            Ok(text) => serde_yaml::from_str(&text)?,
            // Claimed by someone else between listing and reading
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(source) => {
                return Err(HandoffError::IOError {
                    path: marker_path,
                    source,
                })
            }
        };
        return Ok(Some(RawFile::in_directory(run_dir, name, &marker)));
    }
    Ok(None)
}

/// Take ownership of a raw file by renaming its ready marker.
pub fn claim_file(file: &RawFile) -> Result<ClaimedFile, ClaimError> {
    let claim_path = file.marker_path.with_file_name(file.name.claimed_name());
    match std::fs::rename(&file.marker_path, &claim_path) {
        Ok(()) => {
            log::debug!("Claimed {}", file.data_path.display());
            Ok(ClaimedFile {
                file: file.clone(),
                claim_path,
            })
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(ClaimError::AlreadyClaimed(file.data_path.clone()))
        }
        Err(e) => Err(ClaimError::IOError(e)),
    }
}

/// Remove a fully consumed file and its claim marker
pub fn retire_file(claimed: &ClaimedFile) -> Result<(), HandoffError> {
    for path in [&claimed.file.data_path, &claimed.claim_path] {
        match std::fs::remove_file(path) {
            Ok(()) => (),
            Err(e) if e.kind() == ErrorKind::NotFound => (),
            Err(source) => {
                return Err(HandoffError::IOError {
                    path: path.clone(),
                    source,
                })
            }
        }
    }
    Ok(())
}

/// Has the producer announced the end of this run?
pub fn is_run_ended(ctx: &RunContext) -> bool {
    ctx.eor_marker().exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn write_ready(run_dir: &Path, name: RawFileName) -> RawFile {
        std::fs::write(run_dir.join(name.data_name()), b"data").unwrap();
        let marker = FileMarker {
            events: 1,
            bytes: 4,
        };
        std::fs::write(
            run_dir.join(name.ready_name()),
            serde_yaml::to_string(&marker).unwrap(),
        )
        .unwrap();
        RawFile::in_directory(run_dir, name, &marker)
    }

    #[test]
    fn test_ensure_twice() {
        let base = tempfile::tempdir().unwrap();
        let first = ensure_run_directory(base.path(), 100).unwrap();
        let second = ensure_run_directory(base.path(), 100).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, base.path().join("run000100"));
        assert!(first.is_dir());
    }

    #[test]
    fn test_ensure_escalates() {
        let base = tempfile::tempdir().unwrap();
        // A plain file where the base directory should be
        let blocker = base.path().join("blocked");
        std::fs::write(&blocker, b"").unwrap();
        let sleeper = crate::backoff::testing::RecordingSleeper::default();
        let policy = RetryPolicy {
            max_attempts: 2,
            delay: std::time::Duration::from_millis(1),
        };
        match ensure_run_directory_with(&blocker, 1, &policy, &sleeper) {
            Err(HandoffError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sleeper.sleeps.lock().len(), 1);
    }

    #[test]
    fn test_discover_nothing() {
        let base = tempfile::tempdir().unwrap();
        assert_eq!(discover_next_file(&base.path().join("run000001")).unwrap(), None);
        let run_dir = ensure_run_directory(base.path(), 1).unwrap();
        assert_eq!(discover_next_file(&run_dir).unwrap(), None);
    }

    #[test]
    fn test_discover_in_order() {
        let base = tempfile::tempdir().unwrap();
        let run_dir = ensure_run_directory(base.path(), 7).unwrap();
        write_ready(&run_dir, RawFileName::new(7, 2, 0));
        write_ready(&run_dir, RawFileName::new(7, 1, 1));
        write_ready(&run_dir, RawFileName::new(7, 1, 0));
        // Data without a marker is not ready
        std::fs::write(run_dir.join(RawFileName::new(7, 0, 0).data_name()), b"").unwrap();

        let first = discover_next_file(&run_dir).unwrap().unwrap();
        assert_eq!(first.name, RawFileName::new(7, 1, 0));
        claim_file(&first).unwrap();
        let second = discover_next_file(&run_dir).unwrap().unwrap();
        assert_eq!(second.name, RawFileName::new(7, 1, 1));
    }

    #[test]
    fn test_claim_twice() {
        let base = tempfile::tempdir().unwrap();
        let run_dir = ensure_run_directory(base.path(), 1).unwrap();
        let file = write_ready(&run_dir, RawFileName::new(1, 1, 0));
        let claimed = claim_file(&file).unwrap();
        assert!(claimed.claim_path.exists());
        assert!(!file.marker_path.exists());
        match claim_file(&file) {
            Err(ClaimError::AlreadyClaimed(_)) => (),
            other => panic!("unexpected {other:?}"),
        }
        retire_file(&claimed).unwrap();
        assert!(!file.data_path.exists());
    }

    #[test]
    fn test_concurrent_claim() {
        let base = tempfile::tempdir().unwrap();
        let run_dir = ensure_run_directory(base.path(), 1).unwrap();
        for _ in 0..20 {
            let _ = std::fs::remove_file(run_dir.join(RawFileName::new(1, 1, 0).claimed_name()));
            let file = Arc::new(write_ready(&run_dir, RawFileName::new(1, 1, 0)));
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let file = file.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        claim_file(&file)
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let won = results.iter().filter(|r| r.is_ok()).count();
            let lost = results
                .iter()
                .filter(|r| matches!(r, Err(ClaimError::AlreadyClaimed(_))))
                .count();
            assert_eq!(won, 1);
            assert_eq!(lost, 1);
        }
    }

    #[test]
    fn test_run_context() {
        let ctx = RunContext::new(100, Path::new("ramdisk"), Path::new("data"));
        assert_eq!(ctx.bu_run_dir, PathBuf::from("ramdisk/run000100"));
        assert_eq!(ctx.fu_run_dir, PathBuf::from("data/run000100"));
        assert_eq!(
            ctx.eor_marker(),
            PathBuf::from("ramdisk/run000100/run000100_EoR.marker")
        );
        assert!(!is_run_ended(&ctx));
    }
}
