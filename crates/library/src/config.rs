use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::realpath;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const CONFIG_VERSION: u32 = 1;

const DEFAULT_COMMIT_DEBOUNCE_MS: u64 = 2500;

/// On-disk settings of the library subsystem.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LibrarySettings {
    pub version: u32,
    /// Monitored directory roots, as entered by the user (not canonicalized).
    pub directories: Vec<String>,
    /// Regex applied to event paths before they reach the monitor queue.
    pub ignore_pattern: String,
    pub update_on_startup: bool,
    pub commit_debounce_ms: u64,
}

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            directories: Vec::new(),
            ignore_pattern: String::new(),
            update_on_startup: true,
            commit_debounce_ms: DEFAULT_COMMIT_DEBOUNCE_MS,
        }
    }
}

/// Settings keys consumers can react to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigKey {
    Directories,
    IgnorePattern,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

/// Shared handle to the persisted settings, with typed change broadcasts.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<ConfigInner>,
}

struct ConfigInner {
    path: PathBuf,
    settings: RwLock<LibrarySettings>,
    changes: broadcast::Sender<ConfigKey>,
}

impl ConfigStore {
    pub fn load_or_create(path: &Path) -> Result<(Self, bool), ConfigError> {
        let (settings, created) = if path.exists() {
            let contents = fs::read_to_string(path)?;
            let mut settings: LibrarySettings = serde_yaml::from_str(&contents)?;
            if settings.version < CONFIG_VERSION {
                settings.version = CONFIG_VERSION;
            }
            if settings.commit_debounce_ms == 0 {
                settings.commit_debounce_ms = DEFAULT_COMMIT_DEBOUNCE_MS;
            }
            (settings, false)
        } else {
            let settings = LibrarySettings::default();
            save_settings(path, &settings)?;
            (settings, true)
        };

        let (changes, _) = broadcast::channel(16);
        let store = Self {
            inner: Arc::new(ConfigInner {
                path: path.to_path_buf(),
                settings: RwLock::new(settings),
                changes,
            }),
        };
        Ok((store, created))
    }

    /// Monitored roots, canonicalized.
    pub fn directories(&self) -> Vec<PathBuf> {
        self.inner
            .settings
            .read()
            .directories
            .iter()
            .map(|dir| realpath(Path::new(dir)))
            .collect()
    }

    pub fn ignore_pattern(&self) -> String {
        self.inner.settings.read().ignore_pattern.clone()
    }

    pub fn update_on_startup(&self) -> bool {
        self.inner.settings.read().update_on_startup
    }

    pub fn commit_debounce(&self) -> Duration {
        Duration::from_millis(self.inner.settings.read().commit_debounce_ms)
    }

    pub fn set_directories(&self, directories: Vec<PathBuf>) -> Result<(), ConfigError> {
        let snapshot = {
            let mut settings = self.inner.settings.write();
            settings.directories = directories
                .iter()
                .map(|dir| dir.to_string_lossy().into_owned())
                .collect();
            settings.clone()
        };
        save_settings(&self.inner.path, &snapshot)?;
        let _ = self.inner.changes.send(ConfigKey::Directories);
        Ok(())
    }

    /// Add `directory` to the monitored set; no-op if already present.
    pub fn add_directory(&self, directory: &Path) -> Result<(), ConfigError> {
        let mut directories = self.directories();
        let directory = realpath(directory);
        if directories.contains(&directory) {
            return Ok(());
        }
        directories.push(directory);
        self.set_directories(directories)
    }

    pub fn remove_directory(&self, directory: &Path) -> Result<(), ConfigError> {
        let directory = realpath(directory);
        let mut directories = self.directories();
        let before = directories.len();
        directories.retain(|dir| dir != &directory);
        if directories.len() == before {
            return Ok(());
        }
        self.set_directories(directories)
    }

    pub fn set_commit_debounce_ms(&self, debounce_ms: u64) -> Result<(), ConfigError> {
        let snapshot = {
            let mut settings = self.inner.settings.write();
            settings.commit_debounce_ms = debounce_ms.max(1);
            settings.clone()
        };
        save_settings(&self.inner.path, &snapshot)
    }

    pub fn set_ignore_pattern(&self, pattern: &str) -> Result<(), ConfigError> {
        let snapshot = {
            let mut settings = self.inner.settings.write();
            settings.ignore_pattern = pattern.to_string();
            settings.clone()
        };
        save_settings(&self.inner.path, &snapshot)?;
        let _ = self.inner.changes.send(ConfigKey::IgnorePattern);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigKey> {
        self.inner.changes.subscribe()
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("CHORALE_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("chorale.yaml"))
            .unwrap_or_else(|| PathBuf::from("chorale.yaml")),
        Err(_) => PathBuf::from("chorale.yaml"),
    }
}

fn save_settings(path: &Path, settings: &LibrarySettings) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(settings)?;
    fs::write(path, contents)?;
    Ok(())
}
