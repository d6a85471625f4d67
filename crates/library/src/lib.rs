mod config;
pub mod monitor;
mod persist;
pub mod scan;

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use common::{realpath, Track};
use formats::FormatRegistry;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub use common::{TagKey, Tags};
pub use config::{config_path_from_env, ConfigError, ConfigKey, ConfigStore, LibrarySettings};
pub use monitor::{FsEvent, LibraryMonitor};
pub use persist::TrackMap;
pub use scan::{ChangeSet, ScanHandle, ScanPhase, ScanProgress};

/// Signals the library emits to its consumers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LibraryEvent {
    Progress(ScanProgress),
    /// A commit happened; views should refresh.
    Updated,
}

#[derive(Debug)]
pub enum LibraryError {
    Io(std::io::Error),
    Config(ConfigError),
    Snapshot(Box<bincode::ErrorKind>),
    Watch(notify::Error),
    NotFound(PathBuf),
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Io(err) => write!(f, "io error: {}", err),
            LibraryError::Config(err) => write!(f, "config error: {}", err),
            LibraryError::Snapshot(err) => write!(f, "snapshot error: {}", err),
            LibraryError::Watch(err) => write!(f, "watch error: {}", err),
            LibraryError::NotFound(uri) => write!(f, "no track for {:?}", uri),
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io(err)
    }
}

impl From<ConfigError> for LibraryError {
    fn from(err: ConfigError) -> Self {
        LibraryError::Config(err)
    }
}

impl From<Box<bincode::ErrorKind>> for LibraryError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        LibraryError::Snapshot(err)
    }
}

impl From<notify::Error> for LibraryError {
    fn from(err: notify::Error) -> Self {
        LibraryError::Watch(err)
    }
}

/// The authoritative in-memory track index.
///
/// Two disjoint maps back it: tracks homed in a monitored directory, and
/// out-of-library tracks that some consumer (a playlist, the player) still
/// references. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Library {
    inner: Arc<LibraryInner>,
}

struct LibraryInner {
    config: ConfigStore,
    registry: Arc<FormatRegistry>,
    library_path: PathBuf,
    ool_path: PathBuf,
    state: Mutex<LibraryState>,
    events: broadcast::Sender<LibraryEvent>,
    monitor: OnceLock<LibraryMonitor>,
    commit_epoch: AtomicU64,
}

#[derive(Default)]
struct LibraryState {
    tracks: TrackMap,
    tracks_ool: TrackMap,
    monitored_directories: Vec<PathBuf>,
    scan_queue: VecDeque<ScanHandle>,
    current_scan: Option<ScanHandle>,
    scanning: bool,
    dirty: bool,
}

impl Library {
    /// Restore the index from the snapshots under `data_dir` (or start
    /// empty) without touching the filesystem monitor yet.
    pub fn open(config: ConfigStore, registry: Arc<FormatRegistry>, data_dir: &Path) -> Self {
        let library_path = data_dir.join("library.db");
        let ool_path = data_dir.join("library-ool.db");
        let tracks = persist::load_snapshot(&library_path);
        let tracks_ool = persist::load_snapshot(&ool_path);
        info!(
            "Restoring library: {} tracks in the library, {} additional tracks",
            tracks.len(),
            tracks_ool.len()
        );

        let monitored_directories = config.directories();
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(LibraryInner {
                config,
                registry,
                library_path,
                ool_path,
                state: Mutex::new(LibraryState {
                    tracks,
                    tracks_ool,
                    monitored_directories,
                    ..LibraryState::default()
                }),
                events,
                monitor: OnceLock::new(),
                commit_epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Bring the index in sync with the filesystem and go live.
    ///
    /// Builds the watch set, runs the one-shot startup reconciliation, and
    /// only then starts consuming monitor events, so reconciliation and
    /// live events never race on the same URI.
    pub async fn start(&self) -> Result<(), LibraryError> {
        let (monitor, queue) = LibraryMonitor::new(&self.inner.config.ignore_pattern())?;
        let _ = self.inner.monitor.set(monitor.clone());

        monitor.rebuild(&self.monitored_directories()).await;
        if self.inner.config.update_on_startup() {
            self.reconcile().await;
        }

        monitor::spawn_event_loop(self.clone(), monitor, queue);
        self.spawn_config_listener();
        Ok(())
    }

    /// One-shot reconciliation between the index and the filesystem; the
    /// diff is computed on a blocking worker and applied in one step.
    pub async fn reconcile(&self) {
        let (tracks, tracks_ool) = {
            let state = self.inner.state.lock();
            (state.tracks.clone(), state.tracks_ool.clone())
        };
        let directories = self.monitored_directories();
        let registry = Arc::clone(&self.inner.registry);
        let changes = tokio::task::spawn_blocking(move || {
            scan::detect_changes(&tracks, &tracks_ool, &directories, &registry)
        })
        .await
        .unwrap_or_default();

        if !changes.is_empty() {
            self.apply_changes(changes);
        }
        self.commit().await;
    }

    // ---- public contract -------------------------------------------------

    /// Look `uri` up in the in-library map, then the out-of-library map.
    pub fn lookup(&self, uri: &Path) -> Result<Track, LibraryError> {
        let state = self.inner.state.lock();
        state
            .tracks
            .get(uri)
            .or_else(|| state.tracks_ool.get(uri))
            .cloned()
            .ok_or_else(|| LibraryError::NotFound(uri.to_path_buf()))
    }

    /// Library membership; out-of-library tracks do not count.
    pub fn contains(&self, uri: &Path) -> bool {
        self.inner.state.lock().tracks.contains_key(uri)
    }

    /// Stable snapshot of the in-library URIs; mutation while the caller
    /// iterates cannot invalidate it.
    pub fn uris(&self) -> Vec<PathBuf> {
        self.inner.state.lock().tracks.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a track into the library proper, promoting it out of the
    /// out-of-library map if it was there.
    pub fn add_track(&self, track: Track) {
        let mut state = self.inner.state.lock();
        let uri = track.uri.clone();
        state.tracks_ool.remove(&uri);
        state.tracks.insert(uri, track);
        state.dirty = true;
    }

    /// Parse and insert a batch of paths, resolving each one's monitored
    /// directory by prefix match. Unsupported extensions are skipped;
    /// already-indexed paths are refreshed instead of re-added. Returns the
    /// number of files actually parsed or refreshed.
    pub fn add_tracks(&self, uris: &[PathBuf]) -> usize {
        let directories = self.monitored_directories();
        let mut count = 0;
        for uri in uris {
            if !self.inner.registry.supports(uri) {
                continue;
            }
            if self.contains(uri) {
                let _ = self.update_track(uri);
                count += 1;
                continue;
            }
            let Some(directory) = directories.iter().find(|dir| uri.starts_with(dir)) else {
                continue;
            };
            if let Some(mut track) = self.inner.registry.make_track(uri) {
                track.monitored_directory = Some(directory.clone());
                self.add_track(track);
                count += 1;
            }
        }
        count
    }

    /// Re-parse `uri` if its timestamp moved since the last parse.
    ///
    /// Returns `Some(true)` if the track was replaced, `Some(false)` if the
    /// file is unchanged, and `None` when the file is gone, unreadable, or
    /// was never indexed. The monitored-directory back-reference survives
    /// the refresh.
    pub fn update_track(&self, uri: &Path) -> Option<bool> {
        let existing = self.lookup(uri).ok()?;
        if !existing.exists() {
            return None;
        }
        if !existing.was_modified() {
            return Some(false);
        }
        let mut fresh = self.inner.registry.make_track(uri)?;
        fresh.monitored_directory = existing.monitored_directory;
        self.replace_track(fresh);
        Some(true)
    }

    /// Demote `uri` to the out-of-library map. Its metadata stays reachable
    /// through `lookup` for consumers still holding the URI.
    pub fn remove_track(&self, uri: &Path) {
        let mut state = self.inner.state.lock();
        if let Some(mut track) = state.tracks.remove(uri) {
            track.monitored_directory = None;
            state.tracks_ool.insert(uri.to_path_buf(), track);
            state.dirty = true;
        }
    }

    /// Re-key a track after a filesystem move or rename.
    ///
    /// The monitored directory of the destination is resolved by prefix
    /// match unless supplied. The old URI stays behind as an out-of-library
    /// entry so consumers holding it keep working. A move whose source was
    /// never indexed parses the destination fresh: renames into place (e.g.
    /// a finished download losing its partial suffix) arrive this way.
    pub fn move_track(&self, from: &Path, to: &Path, monitored_directory: Option<PathBuf>) {
        let mut state = self.inner.state.lock();
        let monitored_directory = monitored_directory.or_else(|| {
            state
                .monitored_directories
                .iter()
                .find(|dir| to.starts_with(dir))
                .cloned()
        });

        let Some(track) = state.tracks.get(from).cloned() else {
            drop(state);
            if let Some(mut track) = self.inner.registry.make_track(to) {
                track.monitored_directory = monitored_directory;
                self.add_track(track);
            }
            return;
        };

        if from != to {
            if let Some(mut stale) = state.tracks.remove(from) {
                stale.monitored_directory = None;
                state.tracks_ool.insert(from.to_path_buf(), stale);
            }
        }

        let mut moved = track;
        moved.uri = to.to_path_buf();
        moved.monitored_directory = monitored_directory.clone();
        if monitored_directory.is_some() {
            state.tracks_ool.remove(to);
            state.tracks.insert(to.to_path_buf(), moved);
        } else {
            state.tracks.remove(to);
            state.tracks_ool.insert(to.to_path_buf(), moved);
        }
        state.dirty = true;
    }

    /// Queue a recursive scan of `directory`, adding it to the monitored
    /// set. Scans are serialized; at most one directory is scanned at a
    /// time and further requests wait in FIFO order.
    pub fn scan_directory(&self, directory: &Path) -> ScanHandle {
        let directory = realpath(directory);
        if let Err(err) = self.inner.config.add_directory(&directory) {
            warn!("Failed to persist monitored directory: {}", err);
        }
        let handle = ScanHandle::new(directory.clone());
        let start = {
            let mut state = self.inner.state.lock();
            if !state.monitored_directories.contains(&directory) {
                state.monitored_directories.push(directory);
            }
            state.scan_queue.push_back(handle.clone());
            let start = !state.scanning;
            if start {
                state.scanning = true;
            }
            start
        };
        if start {
            tokio::spawn(scan::run_queue(self.clone()));
        }
        handle
    }

    /// Stop monitoring `directory`: cancel its queued or running scan,
    /// re-home its tracks under another monitored root where one covers
    /// them, and demote the rest to out-of-library.
    pub async fn remove_directory(&self, directory: &Path) {
        let directory = realpath(directory);
        if let Err(err) = self.inner.config.remove_directory(&directory) {
            warn!("Failed to persist directory removal: {}", err);
        }

        let affected = {
            let mut state = self.inner.state.lock();
            state.scan_queue.retain(|queued| {
                if queued.directory() == directory {
                    queued.cancel();
                    queued.set_phase(ScanPhase::Aborted);
                    self.emit_progress(ScanProgress::Abort);
                    false
                } else {
                    true
                }
            });
            if let Some(current) = &state.current_scan {
                if current.directory() == directory {
                    current.cancel();
                }
            }
            state.monitored_directories.retain(|dir| dir != &directory);

            let remaining = state.monitored_directories.clone();
            state
                .tracks
                .iter()
                .filter(|(_, track)| track.monitored_directory.as_deref() == Some(&directory))
                .map(|(uri, _)| {
                    let rehome = remaining.iter().find(|dir| uri.starts_with(dir)).cloned();
                    (uri.clone(), rehome)
                })
                .collect::<Vec<_>>()
        };

        for (uri, rehome) in affected {
            match rehome {
                Some(directory) => self.move_track(&uri, &uri, Some(directory)),
                None => self.remove_track(&uri),
            }
        }

        // No monitored directories left means nothing belongs in-library.
        if self.monitored_directories().is_empty() {
            for uri in self.uris() {
                self.remove_track(&uri);
            }
        }

        self.commit().await;
        if let Some(monitor) = self.monitor() {
            monitor.remove_directory(&directory);
        }
    }

    /// Persist the in-library map, refresh the monitored-directory snapshot
    /// from configuration, and signal consumers. Serialization runs on a
    /// blocking worker against a clone of the map, so no caller of the
    /// public contract ever waits on disk.
    pub async fn commit(&self) {
        let tracks = {
            let mut state = self.inner.state.lock();
            state.monitored_directories = self.inner.config.directories();
            state.dirty = false;
            state.tracks.clone()
        };
        let path = self.inner.library_path.clone();
        let saved = tokio::task::spawn_blocking(move || persist::save_snapshot(&path, &tracks)).await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                // the in-memory index stays authoritative; a later commit retries
                warn!("Failed to persist library snapshot: {}", err);
                self.touch();
            }
            Err(err) => {
                warn!("Snapshot task failed: {}", err);
                self.touch();
            }
        }
        let _ = self.inner.events.send(LibraryEvent::Updated);
    }

    /// Mark the index dirty without forcing a save; persistence happens at
    /// the next `commit` or at shutdown.
    pub fn touch(&self) {
        self.inner.state.lock().dirty = true;
    }

    /// Debounced commit for callers reacting to bursty notifications (e.g.
    /// configuration changes): only the latest request fires.
    pub fn schedule_commit(&self) {
        let epoch = self.inner.commit_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let library = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(library.commit_debounce()).await;
            if library.inner.commit_epoch.load(Ordering::SeqCst) == epoch {
                library.commit().await;
            }
        });
    }

    /// Prune out-of-library entries no consumer references anymore, then
    /// snapshot the rest. Called at shutdown with the union of playlist
    /// contents.
    pub async fn save_ool_tracks(&self, referenced: &HashSet<PathBuf>) {
        let tracks_ool = {
            let mut state = self.inner.state.lock();
            state.tracks_ool.retain(|uri, _| referenced.contains(uri));
            state.tracks_ool.clone()
        };
        let path = self.inner.ool_path.clone();
        let saved =
            tokio::task::spawn_blocking(move || persist::save_snapshot(&path, &tracks_ool)).await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("Failed to persist out-of-library snapshot: {}", err),
            Err(err) => warn!("Snapshot task failed: {}", err),
        }
    }

    /// Synchronous pre-shutdown flush of pending changes.
    pub fn flush(&self) -> Result<(), LibraryError> {
        let tracks = {
            let mut state = self.inner.state.lock();
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            state.tracks.clone()
        };
        info!("Saving pending library changes");
        persist::save_snapshot(&self.inner.library_path, &tracks)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LibraryEvent> {
        self.inner.events.subscribe()
    }

    pub fn monitor(&self) -> Option<&LibraryMonitor> {
        self.inner.monitor.get()
    }

    pub fn monitored_directories(&self) -> Vec<PathBuf> {
        self.inner.state.lock().monitored_directories.clone()
    }

    // ---- crate internals -------------------------------------------------

    pub(crate) fn registry(&self) -> &FormatRegistry {
        &self.inner.registry
    }

    pub(crate) fn commit_debounce(&self) -> Duration {
        self.inner.config.commit_debounce()
    }

    pub(crate) fn emit_progress(&self, progress: ScanProgress) {
        let _ = self.inner.events.send(LibraryEvent::Progress(progress));
    }

    pub(crate) fn is_ool(&self, uri: &Path) -> bool {
        self.inner.state.lock().tracks_ool.contains_key(uri)
    }

    /// URIs currently parked in the out-of-library map.
    pub fn ool_uris(&self) -> Vec<PathBuf> {
        self.inner.state.lock().tracks_ool.keys().cloned().collect()
    }

    /// Replace a track in whichever map currently holds its URI; unknown
    /// URIs land out-of-library.
    pub(crate) fn replace_track(&self, track: Track) {
        let mut state = self.inner.state.lock();
        let uri = track.uri.clone();
        if state.tracks.contains_key(&uri) {
            state.tracks.insert(uri, track);
        } else {
            state.tracks_ool.insert(uri, track);
        }
        state.dirty = true;
    }

    /// Handler for a settled change notification on a single path. Known
    /// files are re-parsed; out-of-library entries whose path sits under a
    /// monitored root are promoted back in-library.
    pub(crate) fn refresh_file(&self, path: &Path) {
        if self.contains(path) || self.is_ool(path) {
            if self.update_track(path).is_none() && !path.exists() {
                // change/delete race: the file vanished before the re-parse
                self.remove_track(path);
                return;
            }
            if self.contains(path) {
                return;
            }
        }
        self.add_tracks(std::slice::from_ref(&path.to_path_buf()));
    }

    /// Exact and strict-descendant in-library matches for a deleted path.
    pub(crate) fn matching_uris(&self, path: &Path) -> (bool, Vec<PathBuf>) {
        let state = self.inner.state.lock();
        let exact = state.tracks.contains_key(path);
        let descendants = state
            .tracks
            .keys()
            .filter(|uri| common::is_within(path, uri))
            .cloned()
            .collect();
        (exact, descendants)
    }

    pub(crate) fn uris_under(&self, directory: &Path) -> Vec<PathBuf> {
        self.inner
            .state
            .lock()
            .tracks
            .keys()
            .filter(|uri| common::is_within(directory, uri))
            .cloned()
            .collect()
    }

    /// Per-file resolution inside a directory scan. Indexed tracks are left
    /// alone (catching edits is the monitor's job); stale out-of-library
    /// entries get refreshed and promoted; everything else is parsed fresh.
    pub(crate) fn scan_file(&self, path: &Path, directory: &Path) {
        if self.contains(path) {
            return;
        }
        let track = if self.is_ool(path) {
            let _ = self.update_track(path);
            self.lookup(path).ok()
        } else {
            self.inner.registry.make_track(path)
        };
        let Some(mut track) = track else { return };
        if track.monitored_directory.is_none() {
            track.monitored_directory = Some(directory.to_path_buf());
            self.add_track(track);
        }
    }

    pub(crate) fn next_scan(&self) -> Option<ScanHandle> {
        let mut state = self.inner.state.lock();
        loop {
            let Some(handle) = state.scan_queue.pop_front() else {
                state.scanning = false;
                state.current_scan = None;
                return None;
            };
            if handle.is_aborted() {
                handle.set_phase(ScanPhase::Aborted);
                let _ = self.inner.events.send(LibraryEvent::Progress(ScanProgress::Abort));
                continue;
            }
            state.current_scan = Some(handle.clone());
            return Some(handle);
        }
    }

    pub(crate) fn finish_scan(&self) {
        self.inner.state.lock().current_scan = None;
    }

    fn apply_changes(&self, changes: ChangeSet) {
        info!(
            "{} files missing, {} new ones, {} updated",
            changes.missing.len(),
            changes.new.len(),
            changes.modified.len()
        );
        for track in changes.modified {
            self.replace_track(track);
        }
        for uri in &changes.missing {
            self.remove_track(uri);
        }
        for track in changes.new {
            self.add_track(track);
        }
    }

    fn spawn_config_listener(&self) {
        let library = self.clone();
        let mut changes = self.inner.config.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(ConfigKey::IgnorePattern) => {
                        if let Some(monitor) = library.monitor() {
                            monitor.set_ignore_pattern(&library.inner.config.ignore_pattern());
                        }
                        library.schedule_commit();
                    }
                    Ok(ConfigKey::Directories) => {
                        library.schedule_commit();
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
