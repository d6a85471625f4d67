use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use common::Track;
use formats::FormatRegistry;
use tokio::sync::watch;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::persist::TrackMap;
use crate::Library;

/// Progress sentinel emitted on the library's event channel while a scan
/// runs. Fractions are in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScanProgress {
    Pulse,
    Fraction(f32),
    Abort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanPhase {
    Queued,
    Running,
    Completed,
    Aborted,
}

/// Handle to a queued or running directory scan.
///
/// Cancellation is cooperative: the abort flag is checked once per processed
/// file, the scan unwinds without committing what it has not reached.
#[derive(Clone)]
pub struct ScanHandle {
    inner: Arc<ScanState>,
}

struct ScanState {
    directory: PathBuf,
    aborted: AtomicBool,
    progress: AtomicU32,
    phase: watch::Sender<ScanPhase>,
    phase_rx: watch::Receiver<ScanPhase>,
}

impl ScanHandle {
    pub(crate) fn new(directory: PathBuf) -> Self {
        let (phase, phase_rx) = watch::channel(ScanPhase::Queued);
        Self {
            inner: Arc::new(ScanState {
                directory,
                aborted: AtomicBool::new(false),
                progress: AtomicU32::new(0),
                phase,
                phase_rx,
            }),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    pub fn progress(&self) -> f32 {
        f32::from_bits(self.inner.progress.load(Ordering::Relaxed))
    }

    pub fn cancel(&self) {
        self.inner.aborted.store(true, Ordering::Relaxed);
    }

    pub fn phase(&self) -> ScanPhase {
        *self.inner.phase_rx.borrow()
    }

    /// Wait until the scan reaches a terminal phase.
    pub async fn wait(&self) -> ScanPhase {
        let mut rx = self.inner.phase_rx.clone();
        loop {
            let phase = *rx.borrow();
            if matches!(phase, ScanPhase::Completed | ScanPhase::Aborted) {
                return phase;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Relaxed)
    }

    pub(crate) fn set_progress(&self, value: f32) {
        self.inner.progress.store(value.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn set_phase(&self, phase: ScanPhase) {
        let _ = self.inner.phase.send(phase);
    }
}

/// All files at and below `root`, symlinks followed, in sorted order.
pub(crate) fn discover_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!("Skipping unreadable entry under {:?}: {}", root, err);
                continue;
            }
        };
        if entry.file_type().is_file() {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();
    files
}

/// Drains the scan queue, one directory at a time, in FIFO order.
pub(crate) async fn run_queue(library: Library) {
    while let Some(handle) = library.next_scan() {
        scan_one(&library, &handle).await;
        library.finish_scan();
    }
}

async fn scan_one(library: &Library, handle: &ScanHandle) {
    handle.set_phase(ScanPhase::Running);
    library.emit_progress(ScanProgress::Pulse);
    let directory = handle.directory().to_path_buf();
    info!("Scanning {:?} and its subdirectories", directory);

    let worker_library = library.clone();
    let worker_handle = handle.clone();
    let worker_directory = directory.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        scan_files(&worker_library, &worker_handle, &worker_directory)
    })
    .await;

    match outcome {
        Ok(ScanOutcome::Completed(count)) => {
            library.commit().await;
            if let Some(monitor) = library.monitor() {
                monitor.add_directory(&directory).await;
            }
            library.emit_progress(ScanProgress::Fraction(1.0));
            handle.set_phase(ScanPhase::Completed);
            info!("Finished scanning {} files under {:?}", count, directory);
        }
        Ok(ScanOutcome::Aborted) | Err(_) => {
            library.emit_progress(ScanProgress::Abort);
            handle.set_phase(ScanPhase::Aborted);
            info!("Scan of {:?} aborted", directory);
        }
    }
}

enum ScanOutcome {
    Completed(usize),
    Aborted,
}

fn scan_files(library: &Library, handle: &ScanHandle, directory: &Path) -> ScanOutcome {
    let files: Vec<PathBuf> = discover_files(directory)
        .into_iter()
        .filter(|file| library.registry().supports(file))
        .collect();
    if handle.is_aborted() {
        return ScanOutcome::Aborted;
    }

    let step = if files.is_empty() {
        0.0
    } else {
        1.0 / files.len() as f32
    };
    for (index, path) in files.iter().enumerate() {
        if handle.is_aborted() {
            return ScanOutcome::Aborted;
        }
        library.scan_file(path, directory);
        let fraction = step * (index + 1) as f32;
        handle.set_progress(fraction);
        library.emit_progress(ScanProgress::Fraction(fraction));
    }
    ScanOutcome::Completed(files.len())
}

/// The drift between the index and the filesystem, computed by the one-shot
/// startup reconciliation.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// Existing files whose timestamp moved; re-parsed replacements.
    pub modified: Vec<Track>,
    /// Indexed URIs whose file is gone.
    pub missing: Vec<PathBuf>,
    /// Files under a monitored root with no index entry.
    pub new: Vec<Track>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.missing.is_empty() && self.new.is_empty()
    }
}

/// Diff the two track maps and the monitored roots against the filesystem.
///
/// Pure with respect to the library; the caller applies the result in one
/// step. Out-of-library entries contribute to `modified` only: their
/// metadata is kept around even when the file is gone, since playlists may
/// still reference it.
pub(crate) fn detect_changes(
    tracks: &TrackMap,
    tracks_ool: &TrackMap,
    directories: &[PathBuf],
    registry: &FormatRegistry,
) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for (uri, track) in tracks_ool {
        if track.exists() && track.was_modified() {
            if let Some(fresh) = registry.make_track(uri) {
                changes.modified.push(fresh);
            }
        }
    }

    for (uri, track) in tracks {
        if !track.exists() {
            changes.missing.push(uri.clone());
            continue;
        }
        if track.was_modified() {
            if let Some(mut fresh) = registry.make_track(uri) {
                fresh.monitored_directory = track.monitored_directory.clone();
                changes.modified.push(fresh);
            }
        }
    }

    for directory in directories {
        for uri in discover_files(directory) {
            if tracks.contains_key(&uri) {
                continue;
            }
            if let Some(mut track) = registry.make_track(&uri) {
                track.monitored_directory = Some(directory.clone());
                changes.new.push(track);
            }
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{stub_registry, stub_track};
    use std::fs;

    #[test]
    fn detects_modified_missing_and_new() {
        let dir = tempfile::tempdir().unwrap();
        let registry = stub_registry();

        let kept = dir.path().join("kept.mp3");
        fs::write(&kept, "Kept").unwrap();
        let modified = dir.path().join("edited.mp3");
        fs::write(&modified, "Edited").unwrap();
        let fresh = dir.path().join("fresh.mp3");
        fs::write(&fresh, "Fresh").unwrap();

        let mut tracks = TrackMap::new();
        let mut kept_track = registry.make_track(&kept).unwrap();
        kept_track.monitored_directory = Some(dir.path().to_path_buf());
        tracks.insert(kept.clone(), kept_track);

        let mut edited_track = registry.make_track(&modified).unwrap();
        edited_track.monitored_directory = Some(dir.path().to_path_buf());
        edited_track.mtime_secs = 1;
        tracks.insert(modified.clone(), edited_track);

        let gone = dir.path().join("gone.mp3");
        tracks.insert(gone.clone(), stub_track(gone.to_str().unwrap(), None));

        let directories = vec![dir.path().to_path_buf()];
        let changes = detect_changes(&tracks, &TrackMap::new(), &directories, &registry);

        assert_eq!(changes.missing, vec![gone]);
        assert_eq!(changes.modified.len(), 1);
        assert_eq!(changes.modified[0].uri, modified);
        assert_eq!(
            changes.modified[0].monitored_directory.as_deref(),
            Some(dir.path())
        );
        assert_eq!(changes.new.len(), 1);
        assert_eq!(changes.new[0].uri, fresh);
    }

    #[test]
    fn stale_ool_entries_are_reparsed_without_a_home() {
        let dir = tempfile::tempdir().unwrap();
        let registry = stub_registry();

        let loose = dir.path().join("loose.mp3");
        fs::write(&loose, "Loose").unwrap();
        let mut ool_track = registry.make_track(&loose).unwrap();
        ool_track.mtime_secs = 1;

        let mut tracks_ool = TrackMap::new();
        tracks_ool.insert(loose.clone(), ool_track);

        let changes = detect_changes(&TrackMap::new(), &tracks_ool, &[], &registry);
        assert_eq!(changes.modified.len(), 1);
        assert!(changes.modified[0].monitored_directory.is_none());
        assert!(changes.missing.is_empty());
        assert!(changes.new.is_empty());
    }
}
