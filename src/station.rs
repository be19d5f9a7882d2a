//! Station name → announcement clip lookup.
//!
//! Station names arrive from the website in whatever casing and spacing the
//! driver typed, and the clip files were named by hand.  The resolver tries a
//! fixed list of spellings and returns the first file that exists.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::AnnounceError;

/// Canonical form of a station or route name: lowercase, every run of
/// non-alphanumeric characters collapsed to `_`, no leading/trailing `_`.
pub fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;

    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }

    out
}

/// Replace every whitespace run in `name` with `sep`.
fn join_words(name: &str, sep: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(sep)
}

/// A candidate must stay a plain file name inside the audio root.
fn is_safe_file_stem(stem: &str) -> bool {
    !stem.is_empty() && !stem.starts_with('.') && !stem.contains(['/', '\\'])
}

/// Spellings tried for a station, in priority order, without duplicates.
pub fn candidate_stems(station: &str) -> Vec<String> {
    let trimmed = station.trim();
    let mut stems: Vec<String> = Vec::with_capacity(5);

    for stem in [
        canonical_name(trimmed),
        join_words(&trimmed.to_lowercase(), "_"),
        trimmed.to_string(),
        join_words(trimmed, "-"),
        join_words(trimmed, "_"),
    ] {
        if is_safe_file_stem(&stem) && !stems.contains(&stem) {
            stems.push(stem);
        }
    }

    stems
}

/// Resolves station names to clip paths under a fixed audio directory.
#[derive(Debug, Clone)]
pub struct StationAudioResolver {
    root: PathBuf,
    extension: String,
    final_clip: String,
}

impl StationAudioResolver {
    pub fn new(
        root: impl Into<PathBuf>,
        extension: impl Into<String>,
        final_clip: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
            final_clip: final_clip.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Find the clip for `station`, or [`AnnounceError::AudioNotFound`].
    pub async fn resolve(&self, station: &str) -> Result<PathBuf, AnnounceError> {
        for stem in candidate_stems(station) {
            let path = self.root.join(format!("{}.{}", stem, self.extension));
            if is_file(&path).await {
                debug!(station, path = %path.display(), "Resolved station audio");
                return Ok(path);
            }
        }

        debug!(station, root = %self.root.display(), "No audio candidate exists");
        Err(AnnounceError::AudioNotFound(station.to_string()))
    }

    /// The route-independent end-of-line clip, if it is present on disk.
    pub async fn final_clip(&self) -> Option<PathBuf> {
        let path = self.root.join(&self.final_clip);
        is_file(&path).await.then_some(path)
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
