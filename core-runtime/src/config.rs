//! # Core Configuration Module
//!
//! Provides configuration management for the sidecar sync engine.
//!
//! ## Overview
//!
//! Configuration is an explicit typed struct, [`CoreConfig`], with named
//! fields and documented defaults. It can be loaded from a JSON document
//! (unknown keys are rejected, missing keys take their defaults) or built
//! programmatically with [`CoreConfigBuilder`]. Both paths normalise the
//! media extension list and run [`CoreConfig::validate`] before handing the
//! value out, so downstream crates never see an unchecked configuration.
//!
//! ## Usage
//!
//! ### Loading from a file
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::load("sidecar-sync.json")?;
//! println!("watching {:?}", config.root);
//! ```
//!
//! ### Building programmatically
//!
//! ```
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::builder()
//!     .root("/srv/media")
//!     .database_path("/var/lib/sidecar-sync/catalog.db")
//!     .media_extensions(["mkv", ".MP4"])
//!     .sidecar_suffix(".torrent")
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.media_extensions, vec![".mkv".to_string(), ".mp4".to_string()]);
//! ```
//!
//! ## JSON shape
//!
//! ```json
//! {
//!   "root": "/srv/media",
//!   "database_path": "catalog.db",
//!   "media_extensions": [".mp4", ".mkv", ".ts", ".flv", ".avi"],
//!   "sidecar_suffix": ".torrent",
//!   "event_buffer_size": 100,
//!   "sidecar": {
//!     "executable": "/usr/local/bin/make-torrent",
//!     "silent": true,
//!     "auto_create": true,
//!     "max_workers": 2,
//!     "poll_attempts": 10,
//!     "poll_interval_ms": 500
//!   }
//! }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Media extensions recognised when none are configured.
pub const DEFAULT_MEDIA_EXTENSIONS: &[&str] = &[".mp4", ".mkv", ".ts", ".flv", ".avi"];

/// Suffix appended to a media file's full name to form its sidecar name.
pub const DEFAULT_SIDECAR_SUFFIX: &str = ".torrent";

/// Default catalog database file, relative to the working directory.
pub const DEFAULT_DATABASE_PATH: &str = "sidecar-catalog.db";

/// Default buffer size for the event bus.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

const MAX_WORKERS: usize = 64;
const MAX_POLL_INTERVAL_MS: u64 = 60_000;

/// Core configuration for the sidecar sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Root directory to track. `None` means no root has been chosen yet.
    pub root: Option<PathBuf>,

    /// Path to the SQLite catalog file
    pub database_path: PathBuf,

    /// Recognised media extensions, lowercase with a leading dot
    pub media_extensions: Vec<String>,

    /// Literal suffix that turns a media file name into its sidecar name
    pub sidecar_suffix: String,

    /// Capacity of the event bus channel
    pub event_buffer_size: usize,

    /// Sidecar generator settings
    pub sidecar: SidecarConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            root: None,
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            media_extensions: DEFAULT_MEDIA_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            sidecar_suffix: DEFAULT_SIDECAR_SUFFIX.to_string(),
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            sidecar: SidecarConfig::default(),
        }
    }
}

/// Settings for the external sidecar generator and its worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SidecarConfig {
    /// Path to the generator executable. Creation is unavailable when unset.
    pub executable: Option<PathBuf>,

    /// Pass the generator's silent flag (`-s`)
    pub silent: bool,

    /// Create sidecars automatically for media files discovered live
    pub auto_create: bool,

    /// Maximum number of generator invocations running at once
    pub max_workers: usize,

    /// How many times to look for the sidecar after the generator exits
    pub poll_attempts: u32,

    /// Delay between two sidecar existence checks, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            executable: None,
            silent: false,
            auto_create: true,
            max_workers: 2,
            poll_attempts: 10,
            poll_interval_ms: 500,
        }
    }
}

impl SidecarConfig {
    /// Delay between two sidecar existence checks.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validates the generator settings.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Config(
                "sidecar.max_workers must be greater than 0".to_string(),
            ));
        }

        if self.max_workers > MAX_WORKERS {
            return Err(Error::Config(format!(
                "sidecar.max_workers exceeds maximum of {}",
                MAX_WORKERS
            )));
        }

        if self.poll_attempts == 0 {
            return Err(Error::Config(
                "sidecar.poll_attempts must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval_ms == 0 || self.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(Error::Config(format!(
                "sidecar.poll_interval_ms must be between 1 and {}",
                MAX_POLL_INTERVAL_MS
            )));
        }

        if let Some(exe) = &self.executable {
            if exe.as_os_str().is_empty() {
                return Err(Error::Config(
                    "sidecar.executable cannot be an empty path".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Parses a JSON document, applying defaults for absent keys.
    ///
    /// # Errors
    ///
    /// Fails on malformed JSON, unknown keys, or a configuration that does
    /// not pass [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CoreConfig = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Invalid configuration document: {}", e)))?;
        config.finish()
    }

    /// Loads configuration from a JSON file.
    ///
    /// A missing file is not an error: the defaults are returned instead.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                info!(path = %path.display(), "Loading configuration");
                Self::from_json_str(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Configuration file not found, using defaults");
                Self::default().finish()
            }
            Err(source) => Err(Error::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Database path is not empty
    /// - At least one media extension is configured
    /// - Sidecar suffix is not empty and does not itself look like media
    /// - Event buffer size is non-zero
    /// - Sidecar generator settings are in range
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }

        if self.media_extensions.is_empty() {
            return Err(Error::Config(
                "At least one media extension must be configured".to_string(),
            ));
        }

        if let Some(bad) = self
            .media_extensions
            .iter()
            .find(|ext| ext.len() < 2 || !ext.starts_with('.'))
        {
            return Err(Error::Config(format!("Invalid media extension: {:?}", bad)));
        }

        if self.sidecar_suffix.is_empty() {
            return Err(Error::Config("Sidecar suffix cannot be empty".to_string()));
        }

        if self.sidecar_suffix.contains(['/', '\\']) {
            return Err(Error::Config(
                "Sidecar suffix cannot contain path separators".to_string(),
            ));
        }

        let suffix_lower = self.sidecar_suffix.to_lowercase();
        if self.media_extensions.iter().any(|ext| *ext == suffix_lower) {
            return Err(Error::Config(format!(
                "Sidecar suffix {:?} collides with a media extension",
                self.sidecar_suffix
            )));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if let Some(root) = &self.root {
            if root.as_os_str().is_empty() {
                return Err(Error::Config("Root path cannot be empty".to_string()));
            }
        }

        self.sidecar.validate()
    }

    fn finish(mut self) -> Result<Self> {
        self.media_extensions = normalize_extensions(&self.media_extensions);
        self.validate()?;
        Ok(self)
    }
}

/// Lowercases extensions, adds the leading dot and drops duplicates while
/// preserving order.
fn normalize_extensions<S: AsRef<str>>(extensions: &[S]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(extensions.len());
    for ext in extensions {
        let ext = ext.as_ref().trim().to_lowercase();
        if ext.is_empty() {
            continue;
        }
        let ext = if ext.starts_with('.') {
            ext
        } else {
            format!(".{}", ext)
        };
        if !normalized.contains(&ext) {
            normalized.push(ext);
        }
    }
    normalized
}

/// Builder for constructing [`CoreConfig`] instances.
///
/// Unset fields fall back to the same defaults the JSON loader uses.
#[derive(Debug, Default)]
pub struct CoreConfigBuilder {
    root: Option<PathBuf>,
    database_path: Option<PathBuf>,
    media_extensions: Option<Vec<String>>,
    sidecar_suffix: Option<String>,
    event_buffer_size: Option<usize>,
    sidecar: Option<SidecarConfig>,
}

impl CoreConfigBuilder {
    /// Sets the root directory to track.
    pub fn root<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.root = Some(path.into());
        self
    }

    /// Sets the catalog database path.
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Sets the recognised media extensions. A leading dot is optional.
    pub fn media_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.media_extensions = Some(extensions.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the sidecar suffix.
    pub fn sidecar_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.sidecar_suffix = Some(suffix.into());
        self
    }

    /// Sets the event bus capacity.
    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Sets the sidecar generator settings.
    pub fn sidecar(mut self, sidecar: SidecarConfig) -> Self {
        self.sidecar = Some(sidecar);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when the resulting configuration is invalid.
    pub fn build(self) -> Result<CoreConfig> {
        let defaults = CoreConfig::default();
        CoreConfig {
            root: self.root.or(defaults.root),
            database_path: self.database_path.unwrap_or(defaults.database_path),
            media_extensions: self.media_extensions.unwrap_or(defaults.media_extensions),
            sidecar_suffix: self.sidecar_suffix.unwrap_or(defaults.sidecar_suffix),
            event_buffer_size: self.event_buffer_size.unwrap_or(defaults.event_buffer_size),
            sidecar: self.sidecar.unwrap_or(defaults.sidecar),
        }
        .finish()
    }
}
