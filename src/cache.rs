//! On-disk cache of record sets, one columnar JSON blob per logical name.
//!
//! Reads never fail: a missing, unreadable or inconsistent blob is a miss and
//! the caller falls back to live retrieval. Writes go to a temporary file that
//! is renamed into place, so a crashed run cannot leave a half-written blob.
//! Two runs writing the same name at once are not supported.

use crate::config::Settings;
use crate::error::Result;
use crate::record::{Fields, Record, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const BLOB_VERSION: u32 = 1;
const BLOB_SUFFIX: &str = ".columns.json";
const MAX_NAME_LEN: usize = 64;
/// Hex digits of the name digest kept in a hashed file stem
const DIGEST_LEN: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct ColumnarBlob {
    version: u32,
    name: String,
    row_count: usize,
    source_collection: Vec<String>,
    identifier: Vec<String>,
    columns: BTreeMap<String, Vec<Value>>,
}

impl ColumnarBlob {
    fn from_records(name: &str, records: &[Record]) -> Self {
        let keys: BTreeSet<&str> = records
            .iter()
            .flat_map(|r| r.fields.keys().map(String::as_str))
            .collect();

        let columns = keys
            .into_iter()
            .map(|key| {
                let column = records
                    .iter()
                    .map(|r| r.fields.get(key).cloned().unwrap_or_default())
                    .collect();
                (key.to_string(), column)
            })
            .collect();

        Self {
            version: BLOB_VERSION,
            name: name.to_string(),
            row_count: records.len(),
            source_collection: records.iter().map(|r| r.source_collection.clone()).collect(),
            identifier: records.iter().map(|r| r.identifier.clone()).collect(),
            columns,
        }
    }

    /// Rows back out of the columns; `None` if any column disagrees on length.
    fn into_records(self) -> Option<Vec<Record>> {
        let n = self.row_count;
        if self.source_collection.len() != n
            || self.identifier.len() != n
            || self.columns.values().any(|c| c.len() != n)
        {
            return None;
        }

        let mut rows: Vec<Fields> = vec![Fields::new(); n];
        for (key, column) in self.columns {
            for (row, value) in rows.iter_mut().zip(column) {
                row.insert(key.clone(), value);
            }
        }

        Some(
            self.source_collection
                .into_iter()
                .zip(self.identifier)
                .zip(rows)
                .map(|((source_collection, identifier), fields)| Record {
                    source_collection,
                    identifier,
                    fields,
                })
                .collect(),
        )
    }
}

/// Lowercased, anything outside `[a-z0-9_-]` replaced by `_`, capped at
/// 64 characters.
pub fn sanitize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect()
}

/// File stem for a logical name. Names that survive [`sanitize_name`]
/// unchanged are used as-is; any other name gets a shortened sanitized
/// prefix plus a digest of the full name, so distinct names never share a
/// file.
pub fn file_stem(name: &str) -> String {
    let sanitized = sanitize_name(name);
    if sanitized == name {
        return sanitized;
    }
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let prefix: String = sanitized
        .chars()
        .take(MAX_NAME_LEN - DIGEST_LEN - 1)
        .collect();
    format!("{}_{}", prefix, &digest[..DIGEST_LEN])
}

#[derive(Debug, Clone)]
pub struct CacheLayer {
    dir: PathBuf,
    read_enabled: bool,
    write_enabled: bool,
}

impl CacheLayer {
    pub fn new(dir: impl Into<PathBuf>, read_enabled: bool, write_enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            read_enabled,
            write_enabled,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.cache_dir.clone(),
            settings.use_cache_for_retrieval,
            settings.persist_intermediate,
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn read_enabled(&self) -> bool {
        self.read_enabled
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", file_stem(name), BLOB_SUFFIX))
    }

    /// Cached records for `name`, or `None` on a miss of any kind.
    pub fn try_load(&self, name: &str) -> Option<Vec<Record>> {
        if !self.read_enabled {
            return None;
        }
        let path = self.path_for(name);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(name = name, "Cache miss");
                return None;
            }
            Err(e) => {
                warn!(name = name, path = %path.display(), error = %e, "Unreadable cache entry, ignoring");
                return None;
            }
        };

        let blob: ColumnarBlob = match serde_json::from_str(&raw) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(name = name, path = %path.display(), error = %e, "Corrupt cache entry, ignoring");
                return None;
            }
        };
        if blob.version != BLOB_VERSION {
            warn!(name = name, version = blob.version, "Cache entry has unknown version, ignoring");
            return None;
        }
        if blob.name != name {
            warn!(name = name, stored = %blob.name, "Cache entry belongs to another name, ignoring");
            return None;
        }

        match blob.into_records() {
            Some(records) => {
                info!(name = name, records = records.len(), "Loaded from cache");
                Some(records)
            }
            None => {
                warn!(name = name, path = %path.display(), "Cache entry has ragged columns, ignoring");
                None
            }
        }
    }

    /// Persist `records` under `name`, empty sets included. Returns the
    /// written path, or `None` when writes are disabled.
    pub fn save(&self, name: &str, records: &[Record]) -> Result<Option<PathBuf>> {
        if !self.write_enabled {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.dir)?;

        let path = self.path_for(name);
        let tmp = path.with_extension("json.tmp");
        let blob = ColumnarBlob::from_records(name, records);
        std::fs::write(&tmp, serde_json::to_vec(&blob)?)?;
        std::fs::rename(&tmp, &path)?;

        info!(name = name, records = records.len(), path = %path.display(), "Saved to cache");
        Ok(Some(path))
    }

    /// Like [`save`](Self::save) but only logs a failure.
    pub fn store(&self, name: &str, records: &[Record]) {
        if let Err(e) = self.save(name, records) {
            warn!(name = name, error = %e, "Failed to write cache entry");
        }
    }

    /// Serve `name` from the cache, or run `fetch` and cache what it returns.
    pub async fn read_through<F, Fut>(&self, name: &str, fetch: F) -> Result<Vec<Record>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Record>>>,
    {
        if let Some(hit) = self.try_load(name) {
            return Ok(hit);
        }
        let records = fetch().await?;
        self.store(name, &records);
        Ok(records)
    }

    /// Remove every cache blob. Returns how many files were deleted.
    pub fn clear(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            let is_blob = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(BLOB_SUFFIX));
            if is_blob {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        info!(dir = %self.dir.display(), removed = removed, "Cache cleared");
        Ok(removed)
    }
}
