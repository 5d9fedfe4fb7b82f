//! On-disk snapshot of the safe part of the tree.
//!
//! One JSON object per line: a format stamp, then folders, then items. Only
//! folders that are complete all the way up to the root are written, so a
//! loaded snapshot never claims more than was actually known.

use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use inventory_core::{AssetType, FolderType, InventoryCategory, InventoryItem};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::store::InventoryStore;

pub const CACHE_FORMAT_VERSION: i32 = 4;
const SNAPSHOT_SUFFIX: &str = ".inv.jsonl";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot at {0} was written by an incompatible version")]
    StaleCache(PathBuf),
}

#[derive(Debug, Serialize, Deserialize)]
struct Stamp {
    inv_cache_version: i32,
}

#[derive(Debug, Default)]
pub struct LoadedSnapshot {
    pub path: PathBuf,
    pub categories: Vec<InventoryCategory>,
    pub items: Vec<InventoryItem>,
    /// Folders holding an entry that could not be restored.
    pub needs_revalidation: HashSet<Uuid>,
    pub is_stale: bool,
}

#[derive(Debug, Clone)]
pub struct SnapshotCache {
    root: PathBuf,
}

impl SnapshotCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// One file per (owner, root) pair, so two roots of the same owner never
    /// share a snapshot.
    pub fn path_for(&self, root_id: Uuid, owner_id: Uuid) -> PathBuf {
        self.root
            .join(format!("{owner_id}.{root_id}{SNAPSHOT_SUFFIX}"))
    }

    /// Writes every safe folder under `root_id` and the items inside them.
    /// Returns the number of objects written.
    pub fn save(
        &self,
        store: &InventoryStore,
        root_id: Uuid,
        owner_id: Uuid,
    ) -> Result<usize, CacheError> {
        let folders = safe_folders(store, root_id);
        fs::create_dir_all(&self.root)?;
        let path = self.path_for(root_id, owner_id);
        let tmp_path = path.with_extension("jsonl.tmp");

        let mut written = 0;
        {
            let mut out = BufWriter::new(fs::File::create(&tmp_path)?);
            serde_json::to_writer(
                &mut out,
                &Stamp {
                    inv_cache_version: CACHE_FORMAT_VERSION,
                },
            )?;
            out.write_all(b"\n")?;
            for id in &folders {
                if let Some(cat) = store.get_category(*id) {
                    serde_json::to_writer(&mut out, cat)?;
                    out.write_all(b"\n")?;
                    written += 1;
                }
            }
            for id in &folders {
                for item_id in store.child_item_ids(*id) {
                    if let Some(item) = store.get_item(*item_id) {
                        serde_json::to_writer(&mut out, item)?;
                        out.write_all(b"\n")?;
                        written += 1;
                    }
                }
            }
            out.flush()?;
        }
        fs::rename(&tmp_path, &path)?;
        tracing::info!(path = %path.display(), objects = written, "saved inventory snapshot");
        Ok(written)
    }

    /// Returns `None` when no snapshot exists for this root and owner.
    pub fn load(&self, root_id: Uuid, owner_id: Uuid) -> Result<Option<LoadedSnapshot>, CacheError> {
        let path = self.path_for(root_id, owner_id);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut lines = BufReader::new(file).lines();
        let mut loaded = LoadedSnapshot {
            path: path.clone(),
            ..LoadedSnapshot::default()
        };

        let stamp = lines
            .next()
            .transpose()?
            .and_then(|line| serde_json::from_str::<Stamp>(&line).ok());
        if stamp.is_none_or(|stamp| stamp.inv_cache_version != CACHE_FORMAT_VERSION) {
            tracing::info!(path = %path.display(), "snapshot stamp missing or outdated");
            loaded.is_stale = true;
            return Ok(Some(loaded));
        }

        for (number, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(line = number + 2, error = %err, "skipping unreadable snapshot line");
                    continue;
                }
            };
            loaded.restore(value, number + 2);
        }
        tracing::debug!(
            path = %path.display(),
            categories = loaded.categories.len(),
            items = loaded.items.len(),
            "loaded inventory snapshot"
        );
        Ok(Some(loaded))
    }

    pub fn clear(&self, root_id: Uuid, owner_id: Uuid) -> Result<bool, CacheError> {
        match fs::remove_file(self.path_for(root_id, owner_id)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

impl LoadedSnapshot {
    fn restore(&mut self, value: Value, line: usize) {
        let parent = value
            .get("parent_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        let (type_key, known_type) = if value.get("category_id").is_some() {
            ("type_default", code_of(&value, "type_default").is_none_or(|code| FolderType::from_code(code).is_some()))
        } else {
            ("type", code_of(&value, "type").is_some_and(|code| AssetType::from_code(code).is_some()))
        };
        if !known_type {
            tracing::warn!(line, field = type_key, "snapshot entry has an unknown type");
            if let Some(parent) = parent {
                self.needs_revalidation.insert(parent);
            }
            return;
        }

        let restored = if type_key == "type_default" {
            serde_json::from_value::<InventoryCategory>(value).map(|cat| self.categories.push(cat))
        } else {
            serde_json::from_value::<InventoryItem>(value).map(|item| self.items.push(item))
        };
        if let Err(err) = restored {
            tracing::warn!(line, error = %err, "skipping malformed snapshot entry");
            if let Some(parent) = parent {
                self.needs_revalidation.insert(parent);
            }
        }
    }
}

fn code_of(value: &Value, key: &str) -> Option<i32> {
    value
        .get(key)
        .and_then(Value::as_i64)
        .and_then(|code| i32::try_from(code).ok())
}

/// Folders that are complete together with every ancestor up to `root_id`,
/// parents before children.
fn safe_folders(store: &InventoryStore, root_id: Uuid) -> Vec<Uuid> {
    let mut safe = Vec::new();
    if !store.is_complete(root_id) {
        return safe;
    }
    let mut visited = HashSet::from([root_id]);
    let mut stack = vec![root_id];
    while let Some(folder) = stack.pop() {
        safe.push(folder);
        for child in store.child_category_ids(folder) {
            if store.is_complete(*child) && visited.insert(*child) {
                stack.push(*child);
            }
        }
    }
    safe
}
