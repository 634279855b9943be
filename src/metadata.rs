//! Per-track metadata resolution.
//!
//! The primary probe reads embedded tags and properties via Lofty. When the
//! container reports no usable duration, a secondary Symphonia packet walk
//! estimates it, so tracks with broken headers still get a playback rate.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lofty::file::{AudioFile, TaggedFileExt};
use lofty::tag::ItemKey;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("duration probe failed for {path}: {source}")]
    Probe {
        path: PathBuf,
        source: SymphoniaError,
    },
    #[error("no usable duration for {0}")]
    UnknownDuration(PathBuf),
}

/// A fully resolved track. Immutable once built.
#[derive(Debug, Clone)]
pub struct Track {
    pub path: PathBuf,
    /// File size in bytes.
    pub size: u64,
    pub title: String,
    pub artist: Option<String>,
    pub duration: Duration,
    /// Real-time playback rate in bytes per second: size / duration, floored.
    pub byte_rate: u64,
    pub display: String,
}

fn make_display(title: &str, artist: Option<&str>) -> String {
    match artist {
        Some(a) if !a.trim().is_empty() => format!("{} - {}", a.trim(), title),
        _ => title.to_string(),
    }
}

fn byte_rate(size: u64, duration: Duration) -> u64 {
    (size as f64 / duration.as_secs_f64()).floor() as u64
}

/// Resolve tags and duration for one track.
///
/// Failure here is fatal for the track only; the orchestrator logs and skips.
pub fn resolve(path: &Path) -> Result<Track, MetadataError> {
    let size = fs::metadata(path)
        .map_err(|source| MetadataError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();

    let default_title = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("UNKNOWN")
        .to_string();

    let mut title = default_title;
    let mut artist: Option<String> = None;
    let mut duration: Option<Duration> = None;

    match lofty::read_from_path(path) {
        Ok(tagged) => {
            duration = Some(tagged.properties().duration());

            if let Some(tag) = tagged.primary_tag().or_else(|| tagged.first_tag()) {
                if let Some(v) = tag.get_string(&ItemKey::TrackTitle) {
                    if !v.trim().is_empty() {
                        title = v.to_string();
                    }
                }
                if let Some(v) = tag.get_string(&ItemKey::TrackArtist) {
                    let v = v.trim();
                    if !v.is_empty() {
                        artist = Some(v.to_string());
                    }
                }
            }
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "tag probe failed, relying on fallback");
        }
    }

    let duration = match duration.filter(|d| !d.is_zero()) {
        Some(d) => d,
        None => probe_duration(path)?,
    };
    if duration.is_zero() {
        return Err(MetadataError::UnknownDuration(path.to_path_buf()));
    }

    let byte_rate = byte_rate(size, duration);
    if byte_rate == 0 {
        return Err(MetadataError::UnknownDuration(path.to_path_buf()));
    }

    let display = make_display(&title, artist.as_deref());

    Ok(Track {
        path: path.to_path_buf(),
        size,
        title,
        artist,
        duration,
        byte_rate,
        display,
    })
}

/// Container-agnostic duration estimate.
///
/// Prefers the declared frame count; otherwise walks every packet in the
/// default track and sums timestamps.
fn probe_duration(path: &Path) -> Result<Duration, MetadataError> {
    let file = fs::File::open(path).map_err(|source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|source| MetadataError::Probe {
            path: path.to_path_buf(),
            source,
        })?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| MetadataError::UnknownDuration(path.to_path_buf()))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let time_base = params
        .time_base
        .ok_or_else(|| MetadataError::UnknownDuration(path.to_path_buf()))?;

    if let Some(frames) = params.n_frames {
        let t = time_base.calc_time(frames);
        return Ok(Duration::from_secs_f64(t.seconds as f64 + t.frac));
    }

    let mut total_ts: u64 = 0;
    loop {
        match format.next_packet() {
            Ok(packet) => {
                if packet.track_id() == track_id {
                    total_ts = total_ts.saturating_add(packet.dur());
                }
            }
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(source) => {
                return Err(MetadataError::Probe {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }

    let t = time_base.calc_time(total_ts);
    Ok(Duration::from_secs_f64(t.seconds as f64 + t.frac))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn make_display_prefers_artist_dash_title() {
        assert_eq!(make_display("Song", Some("Artist")), "Artist - Song");
        assert_eq!(make_display("Song", Some("  Artist  ")), "Artist - Song");
        assert_eq!(make_display("Song", None), "Song");
        assert_eq!(make_display("Song", Some("")), "Song");
    }

    #[test]
    fn byte_rate_floors_size_over_duration() {
        assert_eq!(byte_rate(1_000_000, Duration::from_secs(10)), 100_000);
        assert_eq!(byte_rate(1_000_001, Duration::from_secs(10)), 100_000);
        assert_eq!(byte_rate(999, Duration::from_secs(10)), 99);
    }

    #[test]
    fn resolve_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.mp3");
        assert!(matches!(resolve(&path), Err(MetadataError::Io { .. })));
    }

    #[test]
    fn resolve_garbage_file_fails_without_panicking() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.mp3");
        fs::write(&path, b"this is not an mp3 at all").unwrap();
        // Both the tag probe and the fallback duration probe must fail,
        // yielding a per-track error the orchestrator can skip over.
        assert!(resolve(&path).is_err());
    }
}
