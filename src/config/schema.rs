use std::path::PathBuf;

use serde::Deserialize;

/// Top-level application settings loaded from `config.toml`.
///
/// File format: TOML
/// Default path (Linux/XDG): `$XDG_CONFIG_HOME/wavecast/config.toml` or `~/.config/wavecast/config.toml`
///
/// Precedence (highest wins):
/// 1) Environment variables (prefix `WAVECAST__`, `__` as nested separator)
/// 2) Config file (if present)
/// 3) Struct defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub station: StationSettings,
    pub library: LibrarySettings,
    pub broadcast: BroadcastSettings,
    pub playback: PlaybackSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            station: StationSettings::default(),
            library: LibrarySettings::default(),
            broadcast: BroadcastSettings::default(),
            playback: PlaybackSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StationSettings {
    /// Station name, sent to listeners in the `icy-name` header.
    pub name: String,
    /// Station description, sent in the `icy-description` header.
    pub description: String,
    /// Address the HTTP listener socket binds to.
    pub bind: String,
    /// Port the HTTP listener socket binds to.
    pub port: u16,
    /// Whether the station advertises itself as public (`icy-pub` header).
    pub public: bool,
}

impl Default for StationSettings {
    fn default() -> Self {
        Self {
            name: "Wavecast".to_string(),
            description: "A single-track audio relay".to_string(),
            bind: "0.0.0.0".to_string(),
            port: 1337,
            public: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LibrarySettings {
    /// Root directory of the track catalog.
    pub root: PathBuf,
    /// File extensions to treat as audio (case-insensitive, without dot).
    pub extensions: Vec<String>,
}

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("Music"),
            extensions: vec!["mp3".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    /// Byte ceiling of the segment ring buffer. Once exceeded, the oldest
    /// bytes are evicted and lagging listeners are advanced past the gap.
    pub capacity_bytes: u64,
    /// Pacing window in seconds. Bytes are released into the buffer in
    /// chunks covering roughly this much playback time.
    pub pacing_window_secs: u64,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            capacity_bytes: 1024 * 1024,
            pacing_window_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackSettings {
    /// Whether to restart from the top of the catalog after the last track.
    pub loop_catalog: bool,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self { loop_catalog: true }
    }
}
