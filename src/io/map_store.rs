//! Versioned, generation-based map storage.
//!
//! Each save writes a complete generation into a temporary directory, renames
//! it into `generations/`, and then repoints `CURRENT` with a temp-file
//! rename. A crash at any point leaves the previously committed generation
//! readable.

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::format::{
    MapSnapshot, RestoredMap, VersionProbe, CONFIG_FILE, CURRENT_FILE, FORMAT_VERSION,
    GENERATIONS_DIR, GEO_ANCHOR_FILE, LANDMARKS_FILE, METADATA_FILE, POSE_GRAPH_FILE,
};
use super::format::{LandmarksRecord, MapMetadata, PoseGraphRecord};
use super::lock::DirectoryLock;
use crate::config::MapperConfig;
use crate::error::{Result, StorageError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MapStoreConfig {
    /// Committed generations kept on disk, the current one included.
    pub keep_generations: usize,
}

impl Default for MapStoreConfig {
    fn default() -> Self {
        Self { keep_generations: 1 }
    }
}

/// Owns a map directory for the lifetime of a session.
#[derive(Debug)]
pub struct MapStore {
    directory: PathBuf,
    config: MapStoreConfig,
    _lock: DirectoryLock,
}

impl MapStore {
    /// Take ownership of `directory`, creating it when missing.
    pub fn bind(directory: &Path, config: MapStoreConfig) -> Result<Self> {
        let lock = DirectoryLock::acquire(directory)?;
        Ok(Self {
            directory: lock.directory().to_path_buf(),
            config,
            _lock: lock,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn generation_dir(&self, generation: u64) -> PathBuf {
        generation_dir(&self.directory, generation)
    }

    pub fn current_generation(&self) -> std::result::Result<Option<u64>, StorageError> {
        current_generation(&self.directory)
    }

    /// Restore the committed generation, if there is one, tuned by `config`.
    pub fn load(&self, config: &MapperConfig) -> std::result::Result<Option<RestoredMap>, StorageError> {
        let Some((generation, snapshot)) = read_snapshot(&self.directory)? else {
            return Ok(None);
        };
        let restored = snapshot.restore(&generation_dir(&self.directory, generation), config)?;
        info!(
            directory = %self.directory.display(),
            generation,
            keyframes = restored.graph.len(),
            landmarks = restored.tracker.confirmed_count(),
            "map loaded"
        );
        Ok(Some(restored))
    }

    /// Commit `snapshot` as the next generation and return its metadata.
    pub fn save(&self, mut snapshot: MapSnapshot) -> std::result::Result<MapMetadata, StorageError> {
        let generations = self.directory.join(GENERATIONS_DIR);
        fs::create_dir_all(&generations).map_err(|e| StorageError::io(&generations, e))?;

        let generation = self.current_generation()?.map_or(1, |g| g + 1);
        snapshot.metadata.generation = generation;
        snapshot.metadata.format_version = FORMAT_VERSION;

        let name = generation_name(generation);
        let staging = generations.join(format!(".tmp-{name}"));
        remove_dir_if_exists(&staging)?;
        fs::create_dir(&staging).map_err(|e| StorageError::io(&staging, e))?;

        write_json(&staging.join(METADATA_FILE), &snapshot.metadata)?;
        write_json(&staging.join(POSE_GRAPH_FILE), &snapshot.pose_graph)?;
        write_json(&staging.join(LANDMARKS_FILE), &snapshot.landmarks)?;
        write_json(&staging.join(GEO_ANCHOR_FILE), &snapshot.geo_anchor)?;
        write_json(&staging.join(CONFIG_FILE), &snapshot.config)?;
        sync_dir(&staging)?;

        // A directory with this name was never committed.
        let target = generations.join(&name);
        remove_dir_if_exists(&target)?;
        fs::rename(&staging, &target).map_err(|e| StorageError::io(&target, e))?;
        sync_dir(&generations)?;

        let current = self.directory.join(CURRENT_FILE);
        let current_tmp = self.directory.join(format!("{CURRENT_FILE}.tmp"));
        {
            let mut file = File::create(&current_tmp).map_err(|e| StorageError::io(&current_tmp, e))?;
            file.write_all(name.as_bytes())
                .and_then(|()| file.sync_all())
                .map_err(|e| StorageError::io(&current_tmp, e))?;
        }
        fs::rename(&current_tmp, &current).map_err(|e| StorageError::io(&current, e))?;
        sync_dir(&self.directory)?;

        self.prune_generations(generation);
        info!(
            directory = %self.directory.display(),
            generation,
            keyframes = snapshot.metadata.keyframe_count,
            landmarks = snapshot.metadata.landmark_count,
            geo_anchor = snapshot.metadata.has_geo_anchor,
            "map saved"
        );
        Ok(snapshot.metadata)
    }

    /// Remove staging leftovers and generations beyond the retention count.
    fn prune_generations(&self, current: u64) {
        let generations = self.directory.join(GENERATIONS_DIR);
        let entries = match fs::read_dir(&generations) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %generations.display(), error = %e, "cannot list generations");
                return;
            }
        };

        let keep = self.config.keep_generations.max(1) as u64;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            let stale = match name.parse::<u64>() {
                Ok(g) => g + keep <= current,
                Err(_) => name.starts_with(".tmp-"),
            };
            if !stale {
                continue;
            }
            let path = entry.path();
            match fs::remove_dir_all(&path) {
                Ok(()) => debug!(path = %path.display(), "removed old generation"),
                Err(e) => warn!(path = %path.display(), error = %e, "cannot remove old generation"),
            }
        }
    }
}

/// Zero-padded so directory listings sort by generation.
fn generation_name(generation: u64) -> String {
    format!("{generation:010}")
}

fn generation_dir(directory: &Path, generation: u64) -> PathBuf {
    directory.join(GENERATIONS_DIR).join(generation_name(generation))
}

/// Generation named by `CURRENT`, or `None` for a directory never saved to.
pub fn current_generation(directory: &Path) -> std::result::Result<Option<u64>, StorageError> {
    let path = directory.join(CURRENT_FILE);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(&path, e)),
    };
    text.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| StorageError::corrupt(&path, format!("invalid generation {:?}", text.trim())))
}

/// Read and check the committed generation without binding the directory.
pub fn read_snapshot(directory: &Path) -> std::result::Result<Option<(u64, MapSnapshot)>, StorageError> {
    let Some(generation) = current_generation(directory)? else {
        return Ok(None);
    };
    let dir = generation_dir(directory, generation);
    if !dir.is_dir() {
        return Err(StorageError::corrupt(&dir, "CURRENT names a missing generation"));
    }

    let metadata_path = dir.join(METADATA_FILE);
    let probe: VersionProbe = read_json(&metadata_path)?;
    if probe.format_version != FORMAT_VERSION {
        return Err(StorageError::VersionMismatch {
            found: probe.format_version,
            expected: FORMAT_VERSION,
        });
    }

    let metadata: MapMetadata = read_json(&metadata_path)?;
    if metadata.generation != generation {
        return Err(StorageError::corrupt(
            &metadata_path,
            format!("metadata is for generation {}", metadata.generation),
        ));
    }
    let pose_graph: PoseGraphRecord = read_json(&dir.join(POSE_GRAPH_FILE))?;
    let landmarks: LandmarksRecord = read_json(&dir.join(LANDMARKS_FILE))?;
    let geo_anchor = read_json(&dir.join(GEO_ANCHOR_FILE))?;
    let config = read_json(&dir.join(CONFIG_FILE))?;

    let snapshot = MapSnapshot {
        metadata,
        pose_graph,
        landmarks,
        geo_anchor,
        config,
    };
    snapshot.check_counts(&dir)?;
    Ok(Some((generation, snapshot)))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> std::result::Result<T, StorageError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(StorageError::corrupt(path, "missing file"))
        }
        Err(e) => return Err(StorageError::io(path, e)),
    };
    serde_json::from_str(&text).map_err(|e| StorageError::corrupt(path, e.to_string()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> std::result::Result<(), StorageError> {
    let file = File::create(path).map_err(|e| StorageError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|source| StorageError::Serialization {
        path: path.to_path_buf(),
        source,
    })?;
    let file = writer
        .into_inner()
        .map_err(|e| StorageError::io(path, e.into_error()))?;
    file.sync_all().map_err(|e| StorageError::io(path, e))
}

fn remove_dir_if_exists(path: &Path) -> std::result::Result<(), StorageError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> std::result::Result<(), StorageError> {
    File::open(path)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| StorageError::io(path, e))
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> std::result::Result<(), StorageError> {
    Ok(())
}
