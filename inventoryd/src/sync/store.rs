//! Canonical in-memory owner of every known folder and item.
//!
//! Two parent -> children indices (folders, items) are kept in lockstep with
//! the object maps. Each index is an id vector plus an id -> slot map, so
//! removal is an O(1) swap-remove that re-slots the moved id by id.

use std::collections::{HashMap, HashSet};

use inventory_core::{
    FolderType, InventoryCategory, InventoryItem, InventoryObject, ObjectRef, VERSION_UNKNOWN,
};
use thiserror::Error;
use uuid::Uuid;

use super::observer::{ChangeMask, ChangeSet};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(Uuid),
    #[error("folder {0} still has children")]
    NonEmptyFolder(Uuid),
    #[error("id {0} is already used by an object of another kind")]
    IdConflict(Uuid),
    #[error("parent folder {0} is not known")]
    UnknownParent(Uuid),
    #[error("cannot move {id} under {parent}")]
    InvalidMove { id: Uuid, parent: Uuid },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("object not found: {0}")]
    NotFound(Uuid),
    #[error("{0} is not a link")]
    NotALink(Uuid),
    #[error("link {link} points at missing object {target}")]
    Dangling { link: Uuid, target: Uuid },
    #[error("link {link} points at another link {target}")]
    Chained { link: Uuid, target: Uuid },
}

#[derive(Debug, Default, Clone)]
struct ChildIndex {
    ids: Vec<Uuid>,
    slots: HashMap<Uuid, usize>,
}

impl ChildIndex {
    fn insert(&mut self, id: Uuid) -> bool {
        if self.slots.contains_key(&id) {
            return false;
        }
        self.slots.insert(id, self.ids.len());
        self.ids.push(id);
        true
    }

    fn remove(&mut self, id: Uuid) -> bool {
        let Some(slot) = self.slots.remove(&id) else {
            return false;
        };
        self.ids.swap_remove(slot);
        if let Some(moved) = self.ids.get(slot) {
            self.slots.insert(*moved, slot);
        }
        true
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Direct children of one folder. Borrowed from the store, so it cannot
/// outlive the next mutation.
#[derive(Debug, Default)]
pub struct Children<'a> {
    pub categories: Vec<&'a InventoryCategory>,
    pub items: Vec<&'a InventoryItem>,
}

impl Children<'_> {
    pub fn len(&self) -> usize {
        self.categories.len() + self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn category_ids(&self) -> HashSet<Uuid> {
        self.categories.iter().map(|c| c.category_id).collect()
    }

    pub fn item_ids(&self) -> HashSet<Uuid> {
        self.items.iter().map(|i| i.item_id).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinkTarget<'a> {
    Item(&'a InventoryItem),
    Category(&'a InventoryCategory),
}

#[derive(Debug, Default)]
pub struct InventoryStore {
    categories: HashMap<Uuid, InventoryCategory>,
    items: HashMap<Uuid, InventoryItem>,
    category_children: HashMap<Uuid, ChildIndex>,
    item_children: HashMap<Uuid, ChildIndex>,
    changes: ChangeSet,
}

impl InventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category_count(&self) -> usize {
        self.categories.len()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.items.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<ObjectRef<'_>> {
        if let Some(cat) = self.categories.get(&id) {
            return Some(ObjectRef::Category(cat));
        }
        self.items.get(&id).map(ObjectRef::Item)
    }

    pub fn get_item(&self, id: Uuid) -> Option<&InventoryItem> {
        self.items.get(&id)
    }

    pub fn get_category(&self, id: Uuid) -> Option<&InventoryCategory> {
        self.categories.get(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.categories.contains_key(&id) || self.items.contains_key(&id)
    }

    pub fn categories(&self) -> impl Iterator<Item = &InventoryCategory> {
        self.categories.values()
    }

    pub fn items(&self) -> impl Iterator<Item = &InventoryItem> {
        self.items.values()
    }

    pub fn children_of(&self, folder_id: Uuid) -> Children<'_> {
        Children {
            categories: self
                .child_category_ids(folder_id)
                .iter()
                .filter_map(|id| self.categories.get(id))
                .collect(),
            items: self
                .child_item_ids(folder_id)
                .iter()
                .filter_map(|id| self.items.get(id))
                .collect(),
        }
    }

    pub fn child_category_ids(&self, folder_id: Uuid) -> &[Uuid] {
        self.category_children
            .get(&folder_id)
            .map(|index| index.ids.as_slice())
            .unwrap_or_default()
    }

    pub fn child_item_ids(&self, folder_id: Uuid) -> &[Uuid] {
        self.item_children
            .get(&folder_id)
            .map(|index| index.ids.as_slice())
            .unwrap_or_default()
    }

    /// Children actually present locally, folders and items together.
    pub fn observed_descendants(&self, folder_id: Uuid) -> usize {
        self.category_children
            .get(&folder_id)
            .map_or(0, ChildIndex::len)
            + self.item_children.get(&folder_id).map_or(0, ChildIndex::len)
    }

    pub fn is_complete(&self, folder_id: Uuid) -> bool {
        let Some(cat) = self.categories.get(&folder_id) else {
            return false;
        };
        cat.version != VERSION_UNKNOWN
            && !cat.stale
            && usize::try_from(cat.declared_descendants)
                .is_ok_and(|declared| declared == self.observed_descendants(folder_id))
    }

    pub fn insert_or_replace(&mut self, object: impl Into<InventoryObject>) -> Result<(), StoreError> {
        match object.into() {
            InventoryObject::Category(cat) => self.put_category(cat),
            InventoryObject::Item(item) => self.put_item(item),
        }
    }

    fn put_category(&mut self, cat: InventoryCategory) -> Result<(), StoreError> {
        let id = cat.category_id;
        if self.items.contains_key(&id) {
            return Err(StoreError::IdConflict(id));
        }
        let new_parent = cat.parent_id;
        if new_parent == id {
            return Err(StoreError::InvalidMove {
                id,
                parent: new_parent,
            });
        }

        match self.categories.get(&id) {
            Some(old) => {
                let old_parent = old.parent_id;
                let mut mask = ChangeMask::INTERNAL;
                if old.name != cat.name {
                    mask |= ChangeMask::LABEL;
                }
                if old_parent != new_parent {
                    if self.is_descendant_of(new_parent, id) {
                        return Err(StoreError::InvalidMove {
                            id,
                            parent: new_parent,
                        });
                    }
                    detach(&mut self.category_children, old_parent, id);
                    attach(&mut self.category_children, new_parent, id);
                    mask |= ChangeMask::STRUCTURE;
                }
                self.categories.insert(id, cat);
                self.changes.record(mask, id);
            }
            None => {
                if self.is_descendant_of(new_parent, id) {
                    return Err(StoreError::InvalidMove {
                        id,
                        parent: new_parent,
                    });
                }
                attach(&mut self.category_children, new_parent, id);
                self.categories.insert(id, cat);
                self.changes
                    .record(ChangeMask::ADD | ChangeMask::STRUCTURE, id);
            }
        }
        Ok(())
    }

    fn put_item(&mut self, item: InventoryItem) -> Result<(), StoreError> {
        let id = item.item_id;
        if self.categories.contains_key(&id) {
            return Err(StoreError::IdConflict(id));
        }
        let new_parent = item.parent_id;

        match self.items.get(&id) {
            Some(old) => {
                let old_parent = old.parent_id;
                let mut mask = ChangeMask::INTERNAL;
                if old.name != item.name {
                    mask |= ChangeMask::LABEL;
                }
                if old_parent != new_parent {
                    detach(&mut self.item_children, old_parent, id);
                    attach(&mut self.item_children, new_parent, id);
                    mask |= ChangeMask::STRUCTURE;
                }
                self.items.insert(id, item);
                self.changes.record(mask, id);
            }
            None => {
                attach(&mut self.item_children, new_parent, id);
                self.items.insert(id, item);
                self.changes
                    .record(ChangeMask::ADD | ChangeMask::STRUCTURE, id);
            }
        }
        Ok(())
    }

    /// Removes one object. A folder must already be empty; the store never
    /// cascades.
    pub fn remove(&mut self, id: Uuid) -> Result<InventoryObject, StoreError> {
        if let Some(item) = self.items.remove(&id) {
            detach(&mut self.item_children, item.parent_id, id);
            self.changes
                .record(ChangeMask::REMOVE | ChangeMask::STRUCTURE, id);
            return Ok(InventoryObject::Item(item));
        }
        if !self.categories.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        if self.observed_descendants(id) > 0 {
            return Err(StoreError::NonEmptyFolder(id));
        }
        let cat = self
            .categories
            .remove(&id)
            .ok_or(StoreError::NotFound(id))?;
        detach(&mut self.category_children, cat.parent_id, id);
        self.category_children.remove(&id);
        self.item_children.remove(&id);
        self.changes
            .record(ChangeMask::REMOVE | ChangeMask::STRUCTURE, id);
        Ok(InventoryObject::Category(cat))
    }

    pub fn reparent(&mut self, id: Uuid, new_parent: Uuid) -> Result<(), StoreError> {
        if !new_parent.is_nil() && !self.categories.contains_key(&new_parent) {
            return Err(StoreError::UnknownParent(new_parent));
        }
        if let Some(item) = self.items.get_mut(&id) {
            let old_parent = item.parent_id;
            if old_parent == new_parent {
                return Ok(());
            }
            item.parent_id = new_parent;
            detach(&mut self.item_children, old_parent, id);
            attach(&mut self.item_children, new_parent, id);
            self.changes.record(ChangeMask::STRUCTURE, id);
            return Ok(());
        }

        let Some(old_parent) = self.categories.get(&id).map(|c| c.parent_id) else {
            return Err(StoreError::NotFound(id));
        };
        if old_parent == new_parent {
            return Ok(());
        }
        if new_parent == id || self.is_descendant_of(new_parent, id) {
            return Err(StoreError::InvalidMove {
                id,
                parent: new_parent,
            });
        }
        if let Some(cat) = self.categories.get_mut(&id) {
            cat.parent_id = new_parent;
        }
        detach(&mut self.category_children, old_parent, id);
        attach(&mut self.category_children, new_parent, id);
        self.changes.record(ChangeMask::STRUCTURE, id);
        Ok(())
    }

    pub fn set_category_counts(
        &mut self,
        id: Uuid,
        version: i32,
        declared_descendants: i32,
    ) -> Result<(), StoreError> {
        let cat = self
            .categories
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        if cat.version != version || cat.declared_descendants != declared_descendants {
            cat.version = version;
            cat.declared_descendants = declared_descendants;
            self.changes.record(ChangeMask::INTERNAL, id);
        }
        Ok(())
    }

    /// Returns false if the folder is unknown.
    pub fn set_stale(&mut self, id: Uuid, stale: bool) -> bool {
        let Some(cat) = self.categories.get_mut(&id) else {
            return false;
        };
        if cat.stale != stale {
            cat.stale = stale;
            self.changes.record(ChangeMask::INTERNAL, id);
        }
        true
    }

    /// Parent chain from the direct parent upward, stopping at the nil id or
    /// at the first unknown folder.
    pub fn ancestors(&self, id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.get(id).map(|obj| obj.parent_id());
        while let Some(parent) = current {
            if parent.is_nil() || !seen.insert(parent) {
                break;
            }
            out.push(parent);
            current = self.categories.get(&parent).map(|c| c.parent_id);
        }
        out
    }

    pub fn is_descendant_of(&self, id: Uuid, ancestor: Uuid) -> bool {
        self.ancestors(id).contains(&ancestor)
    }

    pub fn find_category_by_type(&self, parent_id: Uuid, preferred: FolderType) -> Option<Uuid> {
        self.child_category_ids(parent_id)
            .iter()
            .copied()
            .find(|id| {
                self.categories
                    .get(id)
                    .is_some_and(|c| c.preferred_type == preferred)
            })
    }

    /// Every folder (pre-order, parents before children) and item below `root`.
    pub fn collect_descendants(&self, root: Uuid) -> (Vec<Uuid>, Vec<Uuid>) {
        let mut categories = Vec::new();
        let mut items = Vec::new();
        let mut visited = HashSet::from([root]);
        let mut stack = vec![root];
        while let Some(folder) = stack.pop() {
            items.extend_from_slice(self.child_item_ids(folder));
            for child in self.child_category_ids(folder) {
                if visited.insert(*child) {
                    categories.push(*child);
                    stack.push(*child);
                }
            }
        }
        (categories, items)
    }

    /// Locally deletes everything below `folder_id`, leaves first. The folder
    /// itself stays.
    pub fn purge_descendants(&mut self, folder_id: Uuid) -> usize {
        let (categories, items) = self.collect_descendants(folder_id);
        let mut removed = 0;
        for id in items {
            if self.remove(id).is_ok() {
                removed += 1;
            }
        }
        for id in categories.into_iter().rev() {
            match self.remove(id) {
                Ok(_) => removed += 1,
                Err(err) => debug_assert!(false, "purge left {id} behind: {err}"),
            }
        }
        removed
    }

    /// Resolves a link through exactly one indirection.
    pub fn resolve_link(&self, id: Uuid) -> Result<LinkTarget<'_>, LinkError> {
        let link = self.items.get(&id).ok_or(LinkError::NotFound(id))?;
        let Some(target) = link.linked_id() else {
            return Err(LinkError::NotALink(id));
        };
        if let Some(item) = self.items.get(&target) {
            if item.is_link() {
                return Err(LinkError::Chained { link: id, target });
            }
            return Ok(LinkTarget::Item(item));
        }
        self.categories
            .get(&target)
            .map(LinkTarget::Category)
            .ok_or(LinkError::Dangling { link: id, target })
    }

    pub fn is_broken_link(&self, id: Uuid) -> bool {
        matches!(
            self.resolve_link(id),
            Err(LinkError::Dangling { .. } | LinkError::Chained { .. })
        )
    }

    /// Objects whose non-nil parent is not a known folder.
    pub fn find_orphans(&self) -> Vec<Uuid> {
        let mut orphans = Vec::new();
        for index in [&self.category_children, &self.item_children] {
            for (parent, children) in index {
                if !parent.is_nil() && !self.categories.contains_key(parent) {
                    orphans.extend_from_slice(&children.ids);
                }
            }
        }
        orphans
    }

    /// Moves every orphan under `recovery_id`. Returns how many were moved.
    pub fn recover_orphans(&mut self, recovery_id: Uuid) -> Result<usize, StoreError> {
        if !recovery_id.is_nil() && !self.categories.contains_key(&recovery_id) {
            return Err(StoreError::UnknownParent(recovery_id));
        }
        let mut moved = 0;
        for id in self.find_orphans() {
            // An orphaned subtree that contains the recovery folder goes to the top level.
            match self.reparent(id, recovery_id) {
                Err(StoreError::InvalidMove { .. }) => self.reparent(id, Uuid::nil())?,
                other => other?,
            }
            moved += 1;
        }
        Ok(moved)
    }

    pub fn record_change(&mut self, mask: ChangeMask, id: Uuid) {
        self.changes.record(mask, id);
    }

    pub fn take_changes(&mut self) -> ChangeSet {
        std::mem::take(&mut self.changes)
    }

    pub fn clear(&mut self) {
        self.categories.clear();
        self.items.clear();
        self.category_children.clear();
        self.item_children.clear();
        self.changes = ChangeSet::default();
        self.changes.mask = ChangeMask::REBUILD;
    }
}

fn attach(index: &mut HashMap<Uuid, ChildIndex>, parent: Uuid, id: Uuid) {
    index.entry(parent).or_default().insert(id);
}

fn detach(index: &mut HashMap<Uuid, ChildIndex>, parent: Uuid, id: Uuid) {
    if let Some(children) = index.get_mut(&parent) {
        children.remove(id);
        if children.is_empty() {
            index.remove(&parent);
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
