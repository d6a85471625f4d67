use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use common::Track;
use tracing::warn;

use crate::LibraryError;

pub type TrackMap = HashMap<PathBuf, Track>;

/// Write a URI→Track snapshot.
///
/// The encoded map goes to a temporary file first and is swapped into place
/// after an fsync, so a crash never leaves a readable partial snapshot at
/// the target path. The previous snapshot survives as `<path>.bak` until the
/// next successful load.
pub fn save_snapshot(path: &Path, tracks: &TrackMap) -> Result<(), LibraryError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let encoded = bincode::serialize(tracks)?;
    let tmp = stamped_path(path, "tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
    }

    if path.exists() {
        let backup = stamped_path(path, "bak");
        let _ = fs::remove_file(&backup);
        let _ = fs::rename(path, &backup);
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Restore a snapshot, falling back to the `.bak` copy, then to an empty
/// map. A corrupt snapshot is never a startup failure.
pub fn load_snapshot(path: &Path) -> TrackMap {
    let backup = stamped_path(path, "bak");
    if let Some(tracks) = try_load(path) {
        let _ = fs::remove_file(&backup);
        return tracks;
    }
    if let Some(tracks) = try_load(&backup) {
        warn!("Restored snapshot from backup {:?}", backup);
        return tracks;
    }
    TrackMap::new()
}

fn try_load(path: &Path) -> Option<TrackMap> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return None,
    };
    match bincode::deserialize(&bytes) {
        Ok(tracks) => Some(tracks),
        Err(err) => {
            warn!("Discarding unreadable snapshot {:?}: {}", path, err);
            None
        }
    }
}

fn stamped_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{TagKey, Tags};

    fn track(uri: &str, title: &str) -> Track {
        let mut tags = Tags::new();
        tags.insert(TagKey::Title, title.to_string());
        Track::new(PathBuf::from(uri), tags, 42)
    }

    #[test]
    fn roundtrips_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.db");

        let mut tracks = TrackMap::new();
        tracks.insert(PathBuf::from("/m/a.mp3"), track("/m/a.mp3", "A"));
        save_snapshot(&path, &tracks).unwrap();

        assert!(!stamped_path(&path, "tmp").exists());
        let restored = load_snapshot(&path);
        assert_eq!(restored.len(), 1);
        assert_eq!(
            restored[&PathBuf::from("/m/a.mp3")].tag(TagKey::Title),
            Some("A")
        );
    }

    #[test]
    fn missing_or_corrupt_snapshot_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.db");
        assert!(load_snapshot(&path).is_empty());

        fs::write(&path, b"\xff\x00 not a snapshot").unwrap();
        assert!(load_snapshot(&path).is_empty());
    }

    #[test]
    fn corrupt_snapshot_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.db");

        let mut first = TrackMap::new();
        first.insert(PathBuf::from("/m/a.mp3"), track("/m/a.mp3", "A"));
        save_snapshot(&path, &first).unwrap();

        let mut second = first.clone();
        second.insert(PathBuf::from("/m/b.mp3"), track("/m/b.mp3", "B"));
        save_snapshot(&path, &second).unwrap();

        fs::write(&path, b"garbage").unwrap();
        let restored = load_snapshot(&path);
        assert_eq!(restored.len(), 1);
        assert!(restored.contains_key(&PathBuf::from("/m/a.mp3")));
    }
}
