//! Structured diffs parsed from server payloads.
//!
//! Parsing never looks at the store: it only turns JSON into patches, removal
//! lists and declared versions. Classifying patches into creates and updates
//! happens when the batch is committed against the model.

use std::collections::{BTreeMap, HashMap, HashSet};

use inventory_core::{CategoryPatch, FolderContents, ItemPatch, PayloadError};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Where a batch came from. Only content the user acted on raises alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrigin {
    Command,
    Fetch,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unparseable object {}: {message}", object_label(.object_id))]
pub struct ParseFailure {
    pub object_id: Option<Uuid>,
    pub message: String,
}

fn object_label(id: &Option<Uuid>) -> String {
    id.map_or_else(|| "<unknown>".to_string(), |id| id.to_string())
}

impl ParseFailure {
    pub fn new(object_id: Option<Uuid>, message: impl Into<String>) -> Self {
        Self {
            object_id,
            message: message.into(),
        }
    }
}

impl From<&PayloadError> for ParseFailure {
    fn from(err: &PayloadError) -> Self {
        Self::new(err.object_id(), err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("folder {category_id} is at version {local} locally but {server} remotely")]
pub struct VersionMismatch {
    pub category_id: Uuid,
    pub local: i32,
    pub server: i32,
}

/// What a commit did and what it could not do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    /// Folders whose bookkeeping could not be trusted and should be listed again.
    pub refetch: Vec<Uuid>,
    pub mismatches: Vec<VersionMismatch>,
    pub failures: Vec<ParseFailure>,
}

impl CommitOutcome {
    pub(crate) fn request_refetch(&mut self, id: Uuid) {
        if !id.is_nil() && !self.refetch.contains(&id) {
            self.refetch.push(id);
        }
    }
}

/// One folder's authoritative listing.
#[derive(Debug, Clone)]
pub struct FolderListing {
    pub folder_id: Uuid,
    pub version: i32,
    pub descendents: i32,
    pub categories: Vec<CategoryPatch>,
    pub items: Vec<ItemPatch>,
    /// Children the server listed, including ones that failed to parse.
    pub listed: usize,
}

impl FolderListing {
    /// A listing that names every child lets absent local children be purged.
    pub fn is_exhaustive(&self) -> bool {
        usize::try_from(self.descendents).is_ok_and(|declared| declared == self.listed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// Incremental change set with accounting.
    Update,
    /// Subtree fetch response.
    FolderListing,
    /// Item fetch response.
    ItemListing,
}

#[derive(Debug, Clone)]
pub struct DeltaBatch {
    pub origin: BatchOrigin,
    pub kind: BatchKind,
    pub categories: Vec<CategoryPatch>,
    pub items: Vec<ItemPatch>,
    pub removed_categories: Vec<Uuid>,
    pub removed_items: Vec<Uuid>,
    pub updated_versions: BTreeMap<Uuid, i32>,
    /// Declared counts for folders that arrived with an embedded listing.
    pub seeded_counts: HashMap<Uuid, i32>,
    pub listings: Vec<FolderListing>,
    pub failures: Vec<ParseFailure>,
    category_slots: HashMap<Uuid, usize>,
    item_slots: HashMap<Uuid, usize>,
}

#[derive(Debug, Default)]
struct AllowLists {
    categories: HashSet<Uuid>,
    items: HashSet<Uuid>,
}

impl AllowLists {
    fn from_meta(value: &Value) -> Self {
        let mut lists = AllowLists::default();
        for key in ["_created_categories", "_updated_categories"] {
            lists.categories.extend(id_list(value, key));
        }
        for key in ["_created_items", "_updated_items"] {
            lists.items.extend(id_list(value, key));
        }
        lists
    }
}

impl DeltaBatch {
    fn empty(origin: BatchOrigin, kind: BatchKind) -> Self {
        Self {
            origin,
            kind,
            categories: Vec::new(),
            items: Vec::new(),
            removed_categories: Vec::new(),
            removed_items: Vec::new(),
            updated_versions: BTreeMap::new(),
            seeded_counts: HashMap::new(),
            listings: Vec::new(),
            failures: Vec::new(),
            category_slots: HashMap::new(),
            item_slots: HashMap::new(),
        }
    }

    /// Parses an incremental update: removal lists, declared folder versions
    /// and (possibly nested) content.
    pub fn from_update(value: &Value, origin: BatchOrigin) -> Self {
        let mut batch = Self::empty(origin, BatchKind::Update);
        if !value.is_object() {
            batch
                .failures
                .push(ParseFailure::new(None, "payload is not an object"));
            return batch;
        }
        batch.read_meta(value);
        let allow = AllowLists::from_meta(value);
        batch.read_content(value, &allow, true);
        batch
    }

    pub fn from_folder_listing(folders: &[FolderContents]) -> Self {
        let mut batch = Self::empty(BatchOrigin::Fetch, BatchKind::FolderListing);
        for folder in folders {
            let mut listing = FolderListing {
                folder_id: folder.folder_id,
                version: folder.version,
                descendents: folder.descendents,
                categories: Vec::new(),
                items: Vec::new(),
                listed: folder.categories.len() + folder.items.len(),
            };
            for raw in &folder.categories {
                match CategoryPatch::from_value(raw) {
                    Ok(mut patch) => {
                        patch.parent_id.get_or_insert(folder.folder_id);
                        listing.categories.push(patch);
                    }
                    Err(err) => batch.failures.push(failure_for(raw, "category_id", &err)),
                }
            }
            for raw in &folder.items {
                match ItemPatch::from_value(raw) {
                    Ok(mut patch) => {
                        patch.parent_id.get_or_insert(folder.folder_id);
                        listing.items.push(patch);
                    }
                    Err(err) => batch.failures.push(failure_for(raw, "item_id", &err)),
                }
            }
            batch.listings.push(listing);
        }
        batch
    }

    pub fn from_item_listing(items: &[Value]) -> Self {
        let mut batch = Self::empty(BatchOrigin::Fetch, BatchKind::ItemListing);
        for raw in items {
            batch.push_item_value(raw);
        }
        batch
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
            && self.items.is_empty()
            && self.removed_categories.is_empty()
            && self.removed_items.is_empty()
            && self.updated_versions.is_empty()
            && self.listings.is_empty()
    }

    fn read_meta(&mut self, value: &Value) {
        let mut seen = HashSet::new();
        for id in id_list(value, "_categories_removed") {
            if seen.insert(id) {
                self.removed_categories.push(id);
            }
        }
        for key in [
            "_category_items_removed",
            "_removed_items",
            "_broken_links_removed",
        ] {
            for id in id_list(value, key) {
                if seen.insert(id) {
                    self.removed_items.push(id);
                }
            }
        }
        if let Some(versions) = value
            .get("_updated_category_versions")
            .and_then(Value::as_object)
        {
            for (key, version) in versions {
                let id = Uuid::parse_str(key).ok();
                let version = version.as_i64().and_then(|v| i32::try_from(v).ok());
                match (id, version) {
                    (Some(id), Some(version)) => {
                        self.updated_versions.insert(id, version);
                    }
                    _ => tracing::warn!(key = %key, "ignoring malformed folder version entry"),
                }
            }
        }
    }

    fn read_content(&mut self, value: &Value, allow: &AllowLists, top_level: bool) {
        if let Some(id) = value.get("item_id") {
            let listed = parse_id(id).is_some_and(|id| allow.items.contains(&id));
            if top_level || listed {
                self.push_item_value(value);
            }
        } else if let Some(id) = value.get("category_id") {
            let id = parse_id(id);
            let listed = id.is_some_and(|id| allow.categories.contains(&id));
            if top_level || listed {
                self.push_category_value(value);
            }
            if let (Some(id), Some(embedded)) = (id, value.get("_embedded"))
                && value.get("descendents").is_none()
            {
                self.seeded_counts.insert(id, embedded_child_count(embedded));
            }
        }

        let Some(embedded) = value.get("_embedded").and_then(Value::as_object) else {
            return;
        };
        for key in ["categories", "links", "items"] {
            if let Some(collection) = embedded.get(key) {
                for child in collection_entries(collection) {
                    self.read_content(child, allow, false);
                }
            }
        }
        for key in ["category", "item"] {
            if let Some(child) = embedded.get(key) {
                self.read_content(child, allow, false);
            }
        }
    }

    fn push_item_value(&mut self, value: &Value) {
        match ItemPatch::from_value(value) {
            Ok(patch) => match self.item_slots.get(&patch.item_id) {
                Some(slot) => self.items[*slot] = patch,
                None => {
                    self.item_slots.insert(patch.item_id, self.items.len());
                    self.items.push(patch);
                }
            },
            Err(err) => self.failures.push(failure_for(value, "item_id", &err)),
        }
    }

    fn push_category_value(&mut self, value: &Value) {
        match CategoryPatch::from_value(value) {
            Ok(patch) => match self.category_slots.get(&patch.category_id) {
                Some(slot) => self.categories[*slot] = patch,
                None => {
                    self.category_slots
                        .insert(patch.category_id, self.categories.len());
                    self.categories.push(patch);
                }
            },
            Err(err) => self
                .failures
                .push(failure_for(value, "category_id", &err)),
        }
    }
}

fn parse_id(value: &Value) -> Option<Uuid> {
    value.as_str().and_then(|s| Uuid::parse_str(s).ok())
}

fn id_list(value: &Value, key: &str) -> Vec<Uuid> {
    let Some(entries) = value.get(key).and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let id = parse_id(entry);
            if id.is_none() {
                tracing::warn!(list = key, entry = %entry, "ignoring malformed id");
            }
            id
        })
        .collect()
}

/// Embedded collections come either keyed by id or as plain arrays.
fn collection_entries(collection: &Value) -> Vec<&Value> {
    match collection {
        Value::Object(map) => map.values().collect(),
        Value::Array(entries) => entries.iter().collect(),
        _ => Vec::new(),
    }
}

fn embedded_child_count(embedded: &Value) -> i32 {
    let count: usize = ["categories", "links", "items"]
        .iter()
        .filter_map(|key| embedded.get(*key))
        .map(|collection| collection_entries(collection).len())
        .sum();
    i32::try_from(count).unwrap_or(i32::MAX)
}

fn failure_for(value: &Value, id_key: &str, err: &PayloadError) -> ParseFailure {
    let object_id = err
        .object_id()
        .or_else(|| value.get(id_key).and_then(parse_id));
    ParseFailure::new(object_id, err.to_string())
}

#[cfg(test)]
#[path = "delta_tests.rs"]
mod tests;
