use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

/// Metadata fields a format parser can attach to a track.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TagKey {
    Artist,
    AlbumArtist,
    Album,
    Title,
    Genre,
    TrackNumber,
    DiscNumber,
    Year,
    Comment,
    DurationMs,
    Bitrate,
    SampleRate,
    Channels,
}

pub type Tags = BTreeMap<TagKey, String>;

/// A single library entry, keyed by its absolute filesystem path.
///
/// Tracks are produced by the format registry and replaced wholesale when the
/// underlying file changes; the library never edits tag fields in place. The
/// `monitored_directory` back-reference records which monitored root produced
/// the entry (`None` for out-of-library tracks).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Track {
    pub uri: PathBuf,
    pub tags: Tags,
    pub monitored_directory: Option<PathBuf>,
    pub mtime_secs: u64,
}

impl Track {
    pub fn new(uri: PathBuf, tags: Tags, mtime_secs: u64) -> Self {
        Self {
            uri,
            tags,
            monitored_directory: None,
            mtime_secs,
        }
    }

    pub fn tag(&self, key: TagKey) -> Option<&str> {
        self.tags.get(&key).map(|value| value.as_str())
    }

    pub fn set_tag(&mut self, key: TagKey, value: impl Into<String>) {
        self.tags.insert(key, value.into());
    }

    pub fn exists(&self) -> bool {
        self.uri.exists()
    }

    /// Whether the file's modification time no longer matches the one
    /// captured at parse time. A missing file reports `false`; callers test
    /// `exists()` first and treat absence as a deletion.
    pub fn was_modified(&self) -> bool {
        matches!(modified_secs(&self.uri), Some(mtime) if mtime != self.mtime_secs)
    }
}

/// Modification time of `path` in whole seconds since the epoch.
pub fn modified_secs(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    let elapsed = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(elapsed.as_secs())
}

/// Resolve symlinks where possible; paths that do not exist (yet) are
/// returned as given.
pub fn realpath(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Whether `path` lies strictly below `dir`. The comparison is
/// component-wise, so `/m/ab/x.mp3` is not within `/m/a`.
pub fn is_within(dir: &Path, path: &Path) -> bool {
    path != dir && path.starts_with(dir)
}

/// Re-root `path` from `old_root` to `new_root`, e.g. for a directory move.
pub fn rebase(path: &Path, old_root: &Path, new_root: &Path) -> Option<PathBuf> {
    let rest = path.strip_prefix(old_root).ok()?;
    Some(new_root.join(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_match_is_separator_bounded() {
        let dir = Path::new("/m/a");
        assert!(is_within(dir, Path::new("/m/a/x.mp3")));
        assert!(!is_within(dir, Path::new("/m/ab/x.mp3")));
        assert!(!is_within(dir, Path::new("/m/a")));
    }

    #[test]
    fn rebase_moves_descendants_only() {
        let moved = rebase(
            Path::new("/m/a/d/x.mp3"),
            Path::new("/m/a"),
            Path::new("/m/b"),
        );
        assert_eq!(moved, Some(PathBuf::from("/m/b/d/x.mp3")));
        assert_eq!(
            rebase(Path::new("/other"), Path::new("/m/a"), Path::new("/m/b")),
            None
        );
    }

    #[test]
    fn was_modified_tracks_mtime_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("song.mp3");
        fs::write(&file, b"x").unwrap();
        let mtime = modified_secs(&file).unwrap();

        let mut track = Track::new(file.clone(), Tags::new(), mtime);
        track.set_tag(TagKey::Title, "song");
        assert!(track.exists());
        assert!(!track.was_modified());

        track.mtime_secs = mtime.wrapping_sub(10);
        assert!(track.was_modified());

        fs::remove_file(&file).unwrap();
        assert!(!track.exists());
        assert!(!track.was_modified());
    }
}
