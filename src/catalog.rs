//! Catalog building: enumerates playable files under a root directory.
//!
//! The walk is an iterative depth-first traversal with an explicit stack of
//! open directory iterators, so arbitrarily deep trees cannot blow the call
//! stack. A visited set keyed by canonical path guarantees each directory is
//! expanded exactly once, which also terminates symlink cycles.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::LibrarySettings;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog root {0} does not exist")]
    RootNotFound(PathBuf),
    #[error("catalog root {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("failed to read catalog root {path}: {source}")]
    RootUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// An ordered, frozen sequence of track paths.
///
/// Metadata is deliberately not resolved here; the orchestrator resolves it
/// lazily per play so a single unreadable file never poisons the whole build.
#[derive(Debug, Clone)]
pub struct Catalog {
    tracks: Vec<PathBuf>,
}

impl Catalog {
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.tracks.iter()
    }
}

fn is_audio_file(path: &Path, settings: &LibrarySettings) -> bool {
    let exts: Vec<String> = settings
        .extensions
        .iter()
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect();

    path.extension()
        .and_then(|s| s.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            exts.iter().any(|e| e == &ext)
        })
        .unwrap_or(false)
}

/// Build the catalog under `root`.
///
/// Files are appended in listing order; the first unvisited subdirectory
/// found is descended into before the remaining siblings are examined. An
/// unreadable subdirectory is logged and skipped; only a bad root is fatal.
pub fn build(root: &Path, settings: &LibrarySettings) -> Result<Catalog, CatalogError> {
    let meta = fs::metadata(root).map_err(|_| CatalogError::RootNotFound(root.to_path_buf()))?;
    if !meta.is_dir() {
        return Err(CatalogError::NotADirectory(root.to_path_buf()));
    }

    let mut visited: HashSet<PathBuf> = HashSet::new();
    if let Ok(canon) = fs::canonicalize(root) {
        visited.insert(canon);
    }

    let root_iter = fs::read_dir(root).map_err(|source| CatalogError::RootUnreadable {
        path: root.to_path_buf(),
        source,
    })?;

    let mut tracks: Vec<PathBuf> = Vec::new();
    let mut stack: Vec<fs::ReadDir> = vec![root_iter];

    while let Some(dir) = stack.last_mut() {
        let Some(entry) = dir.next() else {
            stack.pop();
            continue;
        };
        let Ok(entry) = entry else {
            continue;
        };
        let path = entry.path();

        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_dir() || (file_type.is_symlink() && path.is_dir()) {
            // Canonical path keys the visited set so a symlink back into an
            // already-expanded directory is not expanded again.
            let Ok(canon) = fs::canonicalize(&path) else {
                warn!(path = %path.display(), "skipping unresolvable directory");
                continue;
            };
            if !visited.insert(canon) {
                debug!(path = %path.display(), "already expanded, skipping");
                continue;
            }
            match fs::read_dir(&path) {
                Ok(sub) => stack.push(sub),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable directory");
                }
            }
        } else if path.is_file() && is_audio_file(&path, settings) {
            tracks.push(path);
        }
    }

    Ok(Catalog { tracks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn settings() -> LibrarySettings {
        LibrarySettings::default()
    }

    #[test]
    fn is_audio_file_matches_configured_extensions_case_insensitive() {
        let s = settings();
        assert!(is_audio_file(Path::new("/tmp/a.mp3"), &s));
        assert!(is_audio_file(Path::new("/tmp/a.MP3"), &s));
        assert!(!is_audio_file(Path::new("/tmp/a.flac"), &s));
        assert!(!is_audio_file(Path::new("/tmp/a.txt"), &s));
        assert!(!is_audio_file(Path::new("/tmp/a"), &s));

        let more = LibrarySettings {
            extensions: vec![".ogg".into(), "MP3".into()],
            ..LibrarySettings::default()
        };
        assert!(is_audio_file(Path::new("/tmp/a.ogg"), &more));
        assert!(is_audio_file(Path::new("/tmp/a.mp3"), &more));
    }

    #[test]
    fn build_fails_on_missing_or_non_directory_root() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            build(&missing, &settings()),
            Err(CatalogError::RootNotFound(_))
        ));

        let file = dir.path().join("a.mp3");
        fs::write(&file, b"not real").unwrap();
        assert!(matches!(
            build(&file, &settings()),
            Err(CatalogError::NotADirectory(_))
        ));
    }

    #[test]
    fn build_collects_matching_files_recursively() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.mp3"), b"x").unwrap();
        fs::write(dir.path().join("skip.txt"), b"x").unwrap();
        let sub = dir.path().join("sub");
        let deeper = sub.join("deeper");
        fs::create_dir_all(&deeper).unwrap();
        fs::write(sub.join("b.MP3"), b"x").unwrap();
        fs::write(deeper.join("c.mp3"), b"x").unwrap();

        let catalog = build(dir.path(), &settings()).unwrap();
        let mut names: Vec<String> = catalog
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.mp3", "b.MP3", "c.mp3"]);
    }

    #[test]
    fn build_expands_subdirectory_before_remaining_siblings() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("inner.mp3"), b"x").unwrap();
        fs::write(dir.path().join("outer.mp3"), b"x").unwrap();

        let catalog = build(dir.path(), &settings()).unwrap();
        assert_eq!(catalog.len(), 2);

        // Whichever comes first in listing order, the subdirectory's content
        // must appear as one contiguous run (depth-first, expanded once).
        let names: Vec<&str> = catalog
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert!(names.contains(&"inner.mp3"));
        assert!(names.contains(&"outer.mp3"));
    }

    #[cfg(unix)]
    #[test]
    fn build_terminates_on_symlink_cycles_and_dedupes_targets() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("song.mp3"), b"x").unwrap();
        // Cycle back to the root, and a second route into `sub`.
        std::os::unix::fs::symlink(dir.path(), sub.join("loop")).unwrap();
        std::os::unix::fs::symlink(&sub, dir.path().join("sub-again")).unwrap();

        let catalog = build(dir.path(), &settings()).unwrap();
        let count = catalog
            .iter()
            .filter(|p| p.file_name().unwrap() == "song.mp3")
            .count();
        assert_eq!(count, 1, "each directory must be expanded exactly once");
    }

    #[test]
    fn empty_root_yields_empty_catalog() {
        let dir = tempdir().unwrap();
        let catalog = build(dir.path(), &settings()).unwrap();
        assert!(catalog.is_empty());
        assert_eq!(catalog.len(), 0);
    }
}
