//! User preferences
//!
//! [`StreamPreferences`] is the record the pipeline consumes at session
//! start. [`PreferencesStore`] keeps it in a small JSON file together with
//! the recent peer history; the pipeline itself never touches the file.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::env::var_os;
use std::fs::DirBuilder;
use std::path::{Path, PathBuf};

use crate::config::app_name;
use crate::pipeline::types::{QualityPreset, Resolution};

/// Peers remembered in the history
const HISTORY_LEN: usize = 5;

/// Settings a session starts from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamPreferences {
    pub peer_address: Option<String>,
    pub resolution: Resolution,
    /// JPEG quality, 1-100
    pub quality: u8,
    /// Input device on the sender, output device on the receiver
    pub audio_device_id: Option<String>,
}

impl Default for StreamPreferences {
    fn default() -> Self {
        Self {
            peer_address: None,
            resolution: Resolution::default(),
            quality: QualityPreset::default().jpeg_quality(),
            audio_device_id: None,
        }
    }
}

/// On-disk layout: the preferences plus bookkeeping
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoredPreferences {
    #[serde(flatten)]
    prefs: StreamPreferences,
    ip_history: Vec<String>,
    last_connected: Option<DateTime<Utc>>,
}

fn home_path() -> Option<PathBuf> {
    #[cfg(not(target_os = "windows"))]
    let home = var_os("HOME").map(PathBuf::from);

    #[cfg(target_os = "windows")]
    let home = var_os("USERPROFILE").map(PathBuf::from);

    home
}

pub struct PreferencesStore {
    path: PathBuf,
    stored: StoredPreferences,
}

impl PreferencesStore {
    /// `~/.lancast/preferences.json`, or the working directory without a home
    pub fn default_path() -> PathBuf {
        let dir = match home_path() {
            Some(home) => home.join(format!(".{}", app_name())),
            None => PathBuf::from("."),
        };
        dir.join("preferences.json")
    }

    /// Load from `path`; a missing or unreadable file yields defaults
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let stored = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Ignoring malformed preferences {}: {}", path.display(), e);
                StoredPreferences::default()
            }),
            Err(e) => {
                debug!("No preferences at {}: {}", path.display(), e);
                StoredPreferences::default()
            }
        };
        Self { path, stored }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn preferences(&self) -> &StreamPreferences {
        &self.stored.prefs
    }

    /// Recent peers, most recent first
    pub fn ip_history(&self) -> &[String] {
        &self.stored.ip_history
    }

    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        self.stored.last_connected
    }

    /// Take an updated record emitted by the pipeline or the user
    pub fn update(&mut self, prefs: StreamPreferences) {
        self.stored.prefs = prefs;
    }

    /// Remember a successful connection to `peer`
    pub fn record_connection(&mut self, peer: &str) {
        let history = &mut self.stored.ip_history;
        history.retain(|p| p != peer);
        history.insert(0, peer.to_string());
        history.truncate(HISTORY_LEN);
        self.stored.prefs.peer_address = Some(peer.to_string());
        self.stored.last_connected = Some(Utc::now());
    }

    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            DirBuilder::new()
                .recursive(true)
                .create(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let raw = serde_json::to_string_pretty(&self.stored)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        debug!("Preferences saved to {}", self.path.display());
        Ok(())
    }
}
