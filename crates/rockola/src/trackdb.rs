//! The track index.
//!
//! A flat map from track path to metadata, written by the rescanner
//! subprocess (`rockola rescan`) and reloaded by the server when the scan
//! child exits. Catalog queries (`dirs`, `files`, `search`, `new`, ...) all
//! read this index; nothing here touches the filesystem at query time.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use rockoconf::Config;

use crate::store::{load_json, save_json, StoreError};

pub const INDEX_FILE: &str = "tracks.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackInfo {
    /// When the scanner first saw this track.
    pub noticed: u64,
    /// Track length in seconds, where known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// Whether a decoder is configured for it.
    #[serde(default)]
    pub playable: bool,
}

#[derive(Debug, Default)]
pub struct TrackDb {
    tracks: BTreeMap<String, TrackInfo>,
}

impl TrackDb {
    pub fn load(home: &Path) -> Result<TrackDb, StoreError> {
        let tracks = load_json(&home.join(INDEX_FILE))?;
        Ok(TrackDb { tracks })
    }

    pub fn save(&self, home: &Path) -> Result<(), StoreError> {
        save_json(&home.join(INDEX_FILE), &self.tracks)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn playable_count(&self) -> usize {
        self.tracks.values().filter(|t| t.playable).count()
    }

    pub fn exists(&self, track: &str) -> bool {
        self.tracks.contains_key(track)
    }

    pub fn info(&self, track: &str) -> Option<&TrackInfo> {
        self.tracks.get(track)
    }

    pub fn tracks(&self) -> impl Iterator<Item = (&str, &TrackInfo)> {
        self.tracks.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Resolve a user-supplied name to an indexed track: exact match first,
    /// then relative to each collection root.
    pub fn resolve(&self, name: &str, collections: &[PathBuf]) -> Option<String> {
        if self.tracks.contains_key(name) {
            return Some(name.to_string());
        }
        for root in collections {
            let candidate = root.join(name.trim_start_matches('/'));
            let candidate = candidate.to_string_lossy();
            if self.tracks.contains_key(candidate.as_ref()) {
                return Some(candidate.into_owned());
            }
        }
        None
    }

    /// Immediate subdirectories of `dir` that contain indexed tracks.
    pub fn dirs(&self, dir: &str, filter: Option<&Regex>) -> Vec<String> {
        let prefix = dir_prefix(dir);
        let mut out = BTreeSet::new();
        for track in self.tracks.keys() {
            let Some(rest) = track.strip_prefix(&prefix) else {
                continue;
            };
            if let Some((component, _)) = rest.split_once('/') {
                if filter.map_or(true, |re| re.is_match(component)) {
                    out.insert(format!("{}{}", prefix, component));
                }
            }
        }
        out.into_iter().collect()
    }

    /// Tracks directly under `dir`. `playable_only` distinguishes `files`
    /// from `allfiles`.
    pub fn files(&self, dir: &str, filter: Option<&Regex>, playable_only: bool) -> Vec<String> {
        let prefix = dir_prefix(dir);
        self.tracks
            .iter()
            .filter(|(track, info)| {
                let Some(rest) = track.strip_prefix(&prefix) else {
                    return false;
                };
                if rest.is_empty() || rest.contains('/') {
                    return false;
                }
                if playable_only && !info.playable {
                    return false;
                }
                filter.map_or(true, |re| re.is_match(rest))
            })
            .map(|(track, _)| track.clone())
            .collect()
    }

    /// All search terms must match. `tag:x` terms consult the supplied tag
    /// lookup; other terms are case-insensitive substrings of the path.
    pub fn search(
        &self,
        terms: &[String],
        tags_of: impl Fn(&str) -> Vec<String>,
    ) -> Vec<String> {
        if terms.is_empty() {
            return Vec::new();
        }
        self.tracks
            .keys()
            .filter(|track| {
                let lower = track.to_lowercase();
                terms.iter().all(|term| {
                    if let Some(tag) = term.strip_prefix("tag:") {
                        tags_of(track).iter().any(|t| t.eq_ignore_ascii_case(tag))
                    } else {
                        lower.contains(&term.to_lowercase())
                    }
                })
            })
            .cloned()
            .collect()
    }

    /// Newest tracks by noticed time, newest first, bounded by `max`.
    pub fn newest(&self, max: usize) -> Vec<String> {
        let mut all: Vec<(&String, u64)> = self
            .tracks
            .iter()
            .map(|(track, info)| (track, info.noticed))
            .collect();
        all.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        all.into_iter().take(max).map(|(t, _)| t.clone()).collect()
    }

    /// Walk the collection roots and build a fresh index. Noticed times
    /// are carried over from `previous` so "new" stays meaningful across
    /// rescans.
    pub fn scan(config: &Config, previous: &TrackDb, now: u64) -> TrackDb {
        let mut tracks = BTreeMap::new();
        for root in &config.collections {
            let walk = WalkDir::new(root).follow_links(true);
            for entry in walk {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(error = %e, "rescan: skipping unreadable entry");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name.starts_with('.') || name.ends_with(".length") {
                    continue;
                }
                let track = entry.path().to_string_lossy().into_owned();
                let noticed = previous
                    .info(&track)
                    .map(|i| i.noticed)
                    .unwrap_or(now);
                let length = read_length_sidecar(entry.path());
                let playable = config.find_player(&track).is_some();
                tracks.insert(
                    track,
                    TrackInfo {
                        noticed,
                        length,
                        playable,
                    },
                );
            }
        }
        debug!(tracks = tracks.len(), "rescan complete");
        TrackDb { tracks }
    }
}

fn dir_prefix(dir: &str) -> String {
    if dir.is_empty() || dir.ends_with('/') {
        dir.to_string()
    } else {
        format!("{}/", dir)
    }
}

/// `TRACK.length` beside the file, holding seconds as decimal text. Left
/// behind by whatever tooling knows how to measure the format.
fn read_length_sidecar(track: &Path) -> Option<u64> {
    let mut sidecar = track.as_os_str().to_owned();
    sidecar.push(".length");
    let text = std::fs::read_to_string(Path::new(&sidecar)).ok()?;
    text.trim().parse().ok()
}
