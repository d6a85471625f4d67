use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{is_within, realpath, rebase};
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::scan::discover_files;
use crate::{Library, LibraryError};

/// Coalesced filesystem event vocabulary.
///
/// `Moved` requires the backend to pair both halves of a rename
/// (`RenameMode::Both`); backends that report the halves separately degrade
/// to `Deleted` for the old path and `Changed` for the new one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsEvent {
    Changed(PathBuf),
    Deleted(PathBuf),
    Moved(PathBuf, PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum QueueItem {
    Event(FsEvent),
    /// A directory appeared; register watches for it and its descendants.
    /// Not part of the public vocabulary: file creation is covered by the
    /// completion notification the backend emits once contents settle.
    WatchSubtree(PathBuf),
}

/// Keeps one non-recursive watch per directory under every monitored root
/// and funnels coalesced events into a single-consumer queue.
#[derive(Clone)]
pub struct LibraryMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    watches: Mutex<WatchTable>,
    shared: Arc<ProducerShared>,
}

struct WatchTable {
    watcher: RecommendedWatcher,
    directories: HashSet<PathBuf>,
}

/// State the notify callback reads. Split from the watch table so the
/// callback never contends with watch registration.
struct ProducerShared {
    queue: UnboundedSender<QueueItem>,
    ignore: RwLock<Option<Regex>>,
}

impl LibraryMonitor {
    pub(crate) fn new(
        ignore_pattern: &str,
    ) -> Result<(Self, UnboundedReceiver<QueueItem>), LibraryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ProducerShared {
            queue: tx,
            ignore: RwLock::new(compile_ignore(ignore_pattern)),
        });

        let producer = Arc::clone(&shared);
        let watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    for item in coalesce(event) {
                        if producer.should_ignore(&item) {
                            continue;
                        }
                        let _ = producer.queue.send(item);
                    }
                }
                Err(err) => warn!("Watch backend error: {}", err),
            },
            NotifyConfig::default(),
        )?;

        let monitor = Self {
            inner: Arc::new(MonitorInner {
                watches: Mutex::new(WatchTable {
                    watcher,
                    directories: HashSet::new(),
                }),
                shared,
            }),
        };
        Ok((monitor, rx))
    }

    pub fn watched_directories(&self) -> Vec<PathBuf> {
        self.inner.watches.lock().directories.iter().cloned().collect()
    }

    pub(crate) fn contains_watch(&self, path: &Path) -> bool {
        self.inner.watches.lock().directories.contains(path)
    }

    /// Watch `directory` and all its subdirectories. The tree walk runs on a
    /// blocking worker so callers on the runtime are not held up by large
    /// trees. Registration is idempotent.
    pub async fn add_directory(&self, directory: &Path) -> usize {
        let root = realpath(directory);
        let directories = tokio::task::spawn_blocking(move || subdirectories(&root))
            .await
            .unwrap_or_default();
        self.watch_all(&directories)
    }

    /// Drop the watches at and below `directory`.
    pub fn remove_directory(&self, directory: &Path) -> usize {
        let mut table = self.inner.watches.lock();
        let doomed: Vec<PathBuf> = table
            .directories
            .iter()
            .filter(|dir| dir.as_path() == directory || is_within(directory, dir))
            .cloned()
            .collect();
        for dir in &doomed {
            if let Err(err) = table.watcher.unwatch(dir) {
                debug!("Failed to unwatch {:?}: {}", dir, err);
            }
            table.directories.remove(dir);
        }
        doomed.len()
    }

    /// Replace the watch set with the subtrees of `roots`.
    pub async fn rebuild(&self, roots: &[PathBuf]) {
        let owned = roots.to_vec();
        let directories = tokio::task::spawn_blocking(move || {
            owned
                .iter()
                .flat_map(|root| subdirectories(root))
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_default();

        {
            let mut table = self.inner.watches.lock();
            let existing: Vec<PathBuf> = table.directories.drain().collect();
            for dir in existing {
                let _ = table.watcher.unwatch(&dir);
            }
        }
        let count = self.watch_all(&directories);
        info!("Monitoring {} directories under {:?}", count, roots);
    }

    /// Recompile the ignore filter. A malformed pattern ignores nothing.
    pub fn set_ignore_pattern(&self, pattern: &str) {
        *self.inner.shared.ignore.write() = compile_ignore(pattern);
    }

    fn watch_all(&self, directories: &[PathBuf]) -> usize {
        let mut table = self.inner.watches.lock();
        let mut added = 0;
        for directory in directories {
            if table.directories.contains(directory) {
                continue;
            }
            match table.watcher.watch(directory, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    table.directories.insert(directory.clone());
                    added += 1;
                }
                Err(err) => warn!("Failed to watch {:?}: {}", directory, err),
            }
        }
        added
    }
}

impl ProducerShared {
    fn should_ignore(&self, item: &QueueItem) -> bool {
        let path = match item {
            QueueItem::Event(FsEvent::Changed(path)) => path,
            QueueItem::Event(FsEvent::Deleted(path)) => path,
            QueueItem::Event(FsEvent::Moved(from, _)) => from,
            QueueItem::WatchSubtree(_) => return false,
        };
        match &*self.ignore.read() {
            Some(regex) => regex.is_match(&path.to_string_lossy()),
            None => false,
        }
    }
}

fn compile_ignore(pattern: &str) -> Option<Regex> {
    if pattern.is_empty() {
        return None;
    }
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(err) => {
            warn!("Malformed ignore pattern {:?}: {}", pattern, err);
            None
        }
    }
}

/// Translate a raw backend notification into queue items.
fn coalesce(event: Event) -> Vec<QueueItem> {
    let mut paths = event.paths;
    match event.kind {
        EventKind::Create(kind) => {
            let Some(path) = paths.pop() else { return Vec::new() };
            if matches!(kind, CreateKind::Folder) || path.is_dir() {
                vec![QueueItem::WatchSubtree(path)]
            } else {
                // the backend follows up with a changed notification once
                // the file's contents settle
                Vec::new()
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if paths.len() != 2 {
                return Vec::new();
            }
            let to = paths.pop().unwrap_or_default();
            let from = paths.pop().unwrap_or_default();
            vec![QueueItem::Event(FsEvent::Moved(from, to))]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            let Some(path) = paths.pop() else { return Vec::new() };
            vec![QueueItem::Event(FsEvent::Deleted(path))]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            let Some(path) = paths.pop() else { return Vec::new() };
            let mut items = vec![QueueItem::Event(FsEvent::Changed(path.clone()))];
            if path.is_dir() {
                items.push(QueueItem::WatchSubtree(path));
            }
            items
        }
        EventKind::Modify(_) => {
            let Some(path) = paths.pop() else { return Vec::new() };
            vec![QueueItem::Event(FsEvent::Changed(path))]
        }
        EventKind::Remove(_) => {
            let Some(path) = paths.pop() else { return Vec::new() };
            vec![QueueItem::Event(FsEvent::Deleted(path))]
        }
        _ => Vec::new(),
    }
}

/// All directories at and below `root`, symlinks followed.
fn subdirectories(root: &Path) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut directories = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!("Skipping unreadable entry under {:?}: {}", root, err);
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir = realpath(entry.path());
        if seen.insert(dir.clone()) {
            directories.push(dir);
        }
    }
    directories
}

pub(crate) fn spawn_event_loop(
    library: Library,
    monitor: LibraryMonitor,
    rx: UnboundedReceiver<QueueItem>,
) -> JoinHandle<()> {
    tokio::spawn(event_loop(library, monitor, rx))
}

/// Single consumer of the monitor queue. Events are applied strictly in
/// arrival order; a commit fires once no event has arrived for the debounce
/// interval.
pub(crate) async fn event_loop(
    library: Library,
    monitor: LibraryMonitor,
    mut rx: UnboundedReceiver<QueueItem>,
) {
    let mut dirty = false;
    loop {
        let debounce = library.commit_debounce();
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(item) => {
                    apply_item(&library, &monitor, item).await;
                    library.touch();
                    dirty = true;
                }
                None => break,
            },
            _ = tokio::time::sleep(debounce), if dirty => {
                library.commit().await;
                dirty = false;
            }
        }
    }
    if dirty {
        library.commit().await;
    }
}

async fn apply_item(library: &Library, monitor: &LibraryMonitor, item: QueueItem) {
    debug!("Applying {:?}", item);
    match item {
        QueueItem::WatchSubtree(path) => {
            monitor.add_directory(&path).await;
        }
        QueueItem::Event(event) => apply_event(library, monitor, event).await,
    }
}

pub(crate) async fn apply_event(library: &Library, monitor: &LibraryMonitor, event: FsEvent) {
    match event {
        FsEvent::Changed(path) => {
            if path.is_dir() {
                let root = path.clone();
                let files = tokio::task::spawn_blocking(move || discover_files(&root))
                    .await
                    .unwrap_or_default();
                library.add_tracks(&files);
            } else {
                library.refresh_file(&path);
            }
        }
        FsEvent::Deleted(path) => {
            // The path is already gone, so file vs. directory is resolved by
            // matching indexed URIs: an exact match is a file, descendants
            // mean a directory. Zero matches for an unwatched path is a
            // no-op.
            let (exact, descendants) = library.matching_uris(&path);
            if exact {
                library.remove_track(&path);
            }
            for uri in &descendants {
                library.remove_track(uri);
            }
            if !descendants.is_empty() || (!exact && monitor.contains_watch(&path)) {
                monitor.remove_directory(&path);
            }
        }
        FsEvent::Moved(from, to) => {
            if to.is_file() {
                library.move_track(&from, &to, None);
            } else {
                for uri in library.uris_under(&from) {
                    if let Some(new_uri) = rebase(&uri, &from, &to) {
                        library.move_track(&uri, &new_uri, None);
                    }
                }
                monitor.remove_directory(&from);
                monitor.add_directory(&to).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{library_at, stub_track};
    use crate::LibraryEvent;
    use notify::event::{DataChange, RemoveKind};
    use std::fs;
    use std::time::Duration;

    fn raw(kind: EventKind, paths: &[&Path]) -> Event {
        Event {
            kind,
            paths: paths.iter().map(|p| p.to_path_buf()).collect(),
            attrs: Default::default(),
        }
    }

    #[test]
    fn coalesces_raw_events_into_the_vocabulary() {
        let changed = coalesce(raw(
            EventKind::Modify(ModifyKind::Data(DataChange::Any)),
            &[Path::new("/m/a.mp3")],
        ));
        assert_eq!(
            changed,
            vec![QueueItem::Event(FsEvent::Changed(PathBuf::from("/m/a.mp3")))]
        );

        let deleted = coalesce(raw(
            EventKind::Remove(RemoveKind::Any),
            &[Path::new("/m/a.mp3")],
        ));
        assert_eq!(
            deleted,
            vec![QueueItem::Event(FsEvent::Deleted(PathBuf::from("/m/a.mp3")))]
        );

        let moved = coalesce(raw(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &[Path::new("/m/a.mp3"), Path::new("/m/b.mp3")],
        ));
        assert_eq!(
            moved,
            vec![QueueItem::Event(FsEvent::Moved(
                PathBuf::from("/m/a.mp3"),
                PathBuf::from("/m/b.mp3"),
            ))]
        );

        // unpaired rename halves degrade to delete + change
        let from_half = coalesce(raw(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &[Path::new("/m/a.mp3")],
        ));
        assert_eq!(
            from_half,
            vec![QueueItem::Event(FsEvent::Deleted(PathBuf::from("/m/a.mp3")))]
        );

        // created files are not queued; the settled write follows
        let created = coalesce(raw(
            EventKind::Create(CreateKind::File),
            &[Path::new("/m/a.mp3")],
        ));
        assert!(created.is_empty());

        let created_dir = coalesce(raw(EventKind::Create(CreateKind::Folder), &[Path::new("/m/d")]));
        assert_eq!(
            created_dir,
            vec![QueueItem::WatchSubtree(PathBuf::from("/m/d"))]
        );
    }

    #[test]
    fn malformed_ignore_pattern_ignores_nothing() {
        assert!(compile_ignore("").is_none());
        assert!(compile_ignore("[unclosed").is_none());
        assert!(compile_ignore(r"\.part$").is_some());
    }

    #[tokio::test]
    async fn ignore_filter_drops_events_before_queueing() {
        let (monitor, mut rx) = LibraryMonitor::new(r"\.part$").unwrap();
        let shared = &monitor.inner.shared;

        let kept = QueueItem::Event(FsEvent::Changed(PathBuf::from("/m/a.mp3")));
        let dropped = QueueItem::Event(FsEvent::Changed(PathBuf::from("/m/a.part")));
        assert!(!shared.should_ignore(&kept));
        assert!(shared.should_ignore(&dropped));

        monitor.set_ignore_pattern("[broken");
        assert!(!shared.should_ignore(&dropped));

        shared.queue.send(kept.clone()).unwrap();
        assert_eq!(rx.recv().await, Some(kept));
    }

    #[tokio::test]
    async fn watch_registration_is_idempotent_and_prefix_teardown_works() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();

        let (monitor, _rx) = LibraryMonitor::new("").unwrap();
        let added = monitor.add_directory(dir.path()).await;
        assert_eq!(added, 3);
        assert_eq!(monitor.add_directory(dir.path()).await, 0);
        assert_eq!(monitor.watched_directories().len(), 3);

        let removed = monitor.remove_directory(&realpath(&dir.path().join("a")));
        assert_eq!(removed, 2);
        assert_eq!(monitor.watched_directories().len(), 1);
    }

    #[tokio::test]
    async fn deleted_event_disambiguates_file_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (library, _config) = library_at(dir.path());
        library.add_track(stub_track("/m/a.mp3", Some("/m")));
        library.add_track(stub_track("/m/ab/x.mp3", Some("/m")));
        let (monitor, _rx) = LibraryMonitor::new("").unwrap();

        apply_event(&library, &monitor, FsEvent::Deleted(PathBuf::from("/m/a.mp3"))).await;
        assert!(!library.contains(Path::new("/m/a.mp3")));
        assert!(library.contains(Path::new("/m/ab/x.mp3")));

        // removing a directory takes every descendant with it
        apply_event(&library, &monitor, FsEvent::Deleted(PathBuf::from("/m/ab"))).await;
        assert!(!library.contains(Path::new("/m/ab/x.mp3")));

        // a path with no indexed descendants is a no-op
        apply_event(&library, &monitor, FsEvent::Deleted(PathBuf::from("/elsewhere"))).await;
        assert_eq!(library.len(), 0);
    }

    #[tokio::test]
    async fn changed_event_promotes_out_of_library_entries() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("music");
        fs::create_dir_all(&music).unwrap();
        let music = realpath(&music);
        let file = music.join("loose.mp3");
        fs::write(&file, "Loose").unwrap();

        let (library, config) = library_at(dir.path());
        config.set_directories(vec![music.clone()]).unwrap();
        library.commit().await;
        {
            let mut state = library.inner.state.lock();
            let mut track = library.registry().make_track(&file).unwrap();
            track.mtime_secs = 1;
            state.tracks_ool.insert(file.clone(), track);
        }
        let (monitor, _rx) = LibraryMonitor::new("").unwrap();

        apply_event(&library, &monitor, FsEvent::Changed(file.clone())).await;

        assert!(library.contains(&file));
        assert!(library.ool_uris().is_empty());
        let promoted = library.lookup(&file).unwrap();
        assert_eq!(promoted.monitored_directory.as_deref(), Some(music.as_path()));
    }

    #[tokio::test]
    async fn moved_directory_rekeys_every_descendant() {
        let dir = tempfile::tempdir().unwrap();
        let (library, config) = library_at(dir.path());
        config.set_directories(vec![PathBuf::from("/m")]).unwrap();
        library.commit().await;
        library.add_track(stub_track("/m/old/x.mp3", Some("/m")));
        library.add_track(stub_track("/m/old/d/y.mp3", Some("/m")));
        let (monitor, _rx) = LibraryMonitor::new("").unwrap();

        apply_event(
            &library,
            &monitor,
            FsEvent::Moved(PathBuf::from("/m/old"), PathBuf::from("/m/new")),
        )
        .await;

        assert!(library.contains(Path::new("/m/new/x.mp3")));
        assert!(library.contains(Path::new("/m/new/d/y.mp3")));
        assert!(!library.contains(Path::new("/m/old/x.mp3")));
        // the stale references remain reachable for consumers holding them
        assert!(library.lookup(Path::new("/m/old/x.mp3")).is_ok());
    }

    #[tokio::test]
    async fn event_bursts_collapse_into_a_single_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (library, config) = library_at(dir.path());
        config.set_commit_debounce_ms(50).unwrap();
        let (monitor, rx) = LibraryMonitor::new("").unwrap();
        let queue = monitor.inner.shared.queue.clone();

        let mut events = library.subscribe();
        let worker = spawn_event_loop(library.clone(), monitor.clone(), rx);

        for index in 0..10 {
            let path = PathBuf::from(format!("/nowhere/{index}.mp3"));
            queue.send(QueueItem::Event(FsEvent::Changed(path))).unwrap();
        }

        let mut commits = 0;
        while let Ok(Ok(event)) =
            tokio::time::timeout(Duration::from_millis(400), events.recv()).await
        {
            if matches!(event, LibraryEvent::Updated) {
                commits += 1;
            }
        }
        assert_eq!(commits, 1);

        drop(queue);
        drop(monitor);
        worker.abort();
    }
}
