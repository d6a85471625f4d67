use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use common::{modified_secs, TagKey, Tags, Track};
use lofty::config::WriteOptions;
use lofty::error::LoftyError;
use lofty::prelude::{AudioFile, ItemKey, TagExt, TaggedFileExt};
use lofty::tag::Tag;
use tracing::debug;

#[derive(Debug)]
pub enum FormatError {
    Io(std::io::Error),
    Lofty(LoftyError),
}

impl From<std::io::Error> for FormatError {
    fn from(err: std::io::Error) -> Self {
        FormatError::Io(err)
    }
}

impl From<LoftyError> for FormatError {
    fn from(err: LoftyError) -> Self {
        FormatError::Lofty(err)
    }
}

/// Capability interface of a single tag format.
///
/// `read_tags` must be idempotent for an unchanged file; `write_tags`
/// returns whether anything was written.
pub trait TagFormat: Send + Sync {
    fn read_tags(&self, path: &Path) -> Result<Tags, FormatError>;
    fn write_tags(&self, path: &Path, tags: &Tags) -> Result<bool, FormatError>;
}

/// Maps lowercase file extensions to tag-format implementations.
///
/// Formats are registered explicitly at startup; there is no plugin
/// discovery. The registry is immutable once shared with the library.
#[derive(Default)]
pub struct FormatRegistry {
    formats: HashMap<String, Arc<dyn TagFormat>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry covering the common audio containers via lofty.
    pub fn with_default_formats() -> Self {
        let mut registry = Self::new();
        let lofty: Arc<dyn TagFormat> = Arc::new(LoftyFormat);
        for extension in [
            "mp3", "flac", "ogg", "opus", "m4a", "mp4", "aac", "wav", "aiff", "ape", "wv",
        ] {
            registry.register(extension, Arc::clone(&lofty));
        }
        registry
    }

    pub fn register(&mut self, extension: &str, format: Arc<dyn TagFormat>) {
        self.formats.insert(extension.to_lowercase(), format);
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.format_for(path).is_some()
    }

    pub fn format_for(&self, path: &Path) -> Option<&Arc<dyn TagFormat>> {
        let extension = path.extension()?.to_str()?.to_lowercase();
        self.formats.get(&extension)
    }

    /// Parse `uri` into a track, capturing the file's modification time.
    ///
    /// Returns `None` for unsupported extensions, vanished files, and parse
    /// failures; the caller treats all three as "skip this file".
    pub fn make_track(&self, uri: &Path) -> Option<Track> {
        let format = self.format_for(uri)?;
        let mtime_secs = modified_secs(uri)?;
        match format.read_tags(uri) {
            Ok(tags) => Some(Track::new(uri.to_path_buf(), tags, mtime_secs)),
            Err(err) => {
                debug!("Skipping unreadable file {:?}: {:?}", uri, err);
                None
            }
        }
    }
}

/// lofty-backed implementation shared by every registered audio extension.
pub struct LoftyFormat;

impl TagFormat for LoftyFormat {
    fn read_tags(&self, path: &Path) -> Result<Tags, FormatError> {
        let tagged_file = lofty::read_from_path(path)?;
        let properties = tagged_file.properties();

        let mut tags = Tags::new();
        let duration_ms = properties.duration().as_millis();
        if duration_ms > 0 {
            tags.insert(TagKey::DurationMs, duration_ms.to_string());
        }
        if let Some(rate) = properties.sample_rate() {
            tags.insert(TagKey::SampleRate, rate.to_string());
        }
        if let Some(channels) = properties.channels() {
            tags.insert(TagKey::Channels, channels.to_string());
        }
        if let Some(bitrate) = properties.audio_bitrate().or(properties.overall_bitrate()) {
            tags.insert(TagKey::Bitrate, bitrate.to_string());
        }

        if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
            for (key, item) in [
                (TagKey::Artist, ItemKey::TrackArtist),
                (TagKey::AlbumArtist, ItemKey::AlbumArtist),
                (TagKey::Album, ItemKey::AlbumTitle),
                (TagKey::Title, ItemKey::TrackTitle),
                (TagKey::Genre, ItemKey::Genre),
                (TagKey::TrackNumber, ItemKey::TrackNumber),
                (TagKey::DiscNumber, ItemKey::DiscNumber),
                (TagKey::Year, ItemKey::Year),
                (TagKey::Comment, ItemKey::Comment),
            ] {
                if let Some(value) = tag.get_string(&item) {
                    tags.insert(key, value.to_string());
                }
            }
        }

        Ok(tags)
    }

    fn write_tags(&self, path: &Path, tags: &Tags) -> Result<bool, FormatError> {
        let tagged_file = lofty::read_from_path(path)?;
        let mut tag = match tagged_file.primary_tag() {
            Some(existing) => existing.clone(),
            None => Tag::new(tagged_file.primary_tag_type()),
        };

        let mut changed = false;
        for (key, item) in [
            (TagKey::Artist, ItemKey::TrackArtist),
            (TagKey::AlbumArtist, ItemKey::AlbumArtist),
            (TagKey::Album, ItemKey::AlbumTitle),
            (TagKey::Title, ItemKey::TrackTitle),
            (TagKey::Genre, ItemKey::Genre),
            (TagKey::TrackNumber, ItemKey::TrackNumber),
            (TagKey::DiscNumber, ItemKey::DiscNumber),
            (TagKey::Year, ItemKey::Year),
            (TagKey::Comment, ItemKey::Comment),
        ] {
            let Some(value) = tags.get(&key) else { continue };
            if tag.get_string(&item) != Some(value.as_str()) {
                tag.insert_text(item, value.clone());
                changed = true;
            }
        }

        if changed {
            tag.save_to_path(path, WriteOptions::default())?;
        }
        Ok(changed)
    }
}
