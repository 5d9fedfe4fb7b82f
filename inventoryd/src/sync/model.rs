use std::collections::{BTreeMap, HashSet};

use inventory_core::{
    Destination, FolderType, InventoryCategory, InventoryItem, InventoryObject, VERSION_UNKNOWN,
};
use serde_json::Value;
use uuid::Uuid;

use super::accountant::{CategoryUpdate, account_for_update};
use super::delta::{
    BatchKind, BatchOrigin, CommitOutcome, DeltaBatch, FolderListing, ParseFailure,
    VersionMismatch,
};
use super::observer::{Alert, ChangeMask, InventoryObserver, ObserverBus, ObserverId};
use super::snapshot::{CacheError, LoadedSnapshot};
use super::store::{InventoryStore, StoreError};

const LOST_AND_FOUND_NAME: &str = "Lost And Found";

/// The store together with everything that reacts to it.
///
/// Every mutation entry point ends with exactly one notification flush, so
/// observers see a batch either entirely or not at all.
pub struct InventoryModel {
    store: InventoryStore,
    bus: ObserverBus,
    pending_alerts: Vec<Alert>,
    owner_id: Uuid,
    primary_root: Option<Uuid>,
    library_root: Option<Uuid>,
}

#[derive(Debug, Default)]
struct CommitPlan {
    new_categories: Vec<InventoryCategory>,
    changed_categories: Vec<InventoryCategory>,
    new_items: Vec<InventoryItem>,
    changed_items: Vec<InventoryItem>,
    removed_items: Vec<Uuid>,
    removed_categories: Vec<Uuid>,
    buckets: BTreeMap<Uuid, i32>,
}

impl CommitPlan {
    fn bucket(&mut self, folder: Uuid, delta: i32) {
        *self.buckets.entry(folder).or_insert(0) += delta;
    }
}

impl InventoryModel {
    pub fn new(owner_id: Uuid) -> Self {
        Self {
            store: InventoryStore::new(),
            bus: ObserverBus::default(),
            pending_alerts: Vec::new(),
            owner_id,
            primary_root: None,
            library_root: None,
        }
    }

    pub fn store(&self) -> &InventoryStore {
        &self.store
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    pub fn primary_root(&self) -> Option<Uuid> {
        self.primary_root
    }

    pub fn library_root(&self) -> Option<Uuid> {
        self.library_root
    }

    pub fn set_primary_root(&mut self, id: Uuid) {
        self.primary_root = Some(id);
    }

    pub fn set_library_root(&mut self, id: Uuid) {
        self.library_root = Some(id);
    }

    /// Makes sure a root folder exists so listings for it have somewhere to
    /// land. A placeholder has unknown version and counts.
    pub fn ensure_root(
        &mut self,
        id: Uuid,
        owner_id: Uuid,
        name: &str,
    ) -> Result<bool, StoreError> {
        if self.store.get_category(id).is_some() {
            return Ok(false);
        }
        let root = InventoryCategory::new(id, Uuid::nil(), name, FolderType::RootInventory, owner_id);
        self.store.insert_or_replace(root)?;
        self.flush_notifications();
        Ok(true)
    }

    pub fn destination_of(&self, id: Uuid) -> Destination {
        match self.library_root {
            Some(library) if id == library || self.store.is_descendant_of(id, library) => {
                Destination::Library
            }
            _ => Destination::Primary,
        }
    }

    pub fn subscribe(&mut self, observer: Box<dyn InventoryObserver>) -> ObserverId {
        self.bus.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Queued for the next flush.
    pub fn push_alert(&mut self, alert: Alert) {
        self.pending_alerts.push(alert);
    }

    /// Delivers everything accumulated since the last flush. Returns false
    /// when there was nothing to deliver.
    pub fn flush_notifications(&mut self) -> bool {
        let changes = self.store.take_changes();
        let alerts = std::mem::take(&mut self.pending_alerts);
        self.bus.deliver(&self.store, changes, alerts)
    }

    pub fn apply_delta(&mut self, value: &Value, origin: BatchOrigin) -> CommitOutcome {
        self.commit(DeltaBatch::from_update(value, origin))
    }

    pub fn commit(&mut self, mut batch: DeltaBatch) -> CommitOutcome {
        let mut outcome = CommitOutcome {
            failures: std::mem::take(&mut batch.failures),
            ..CommitOutcome::default()
        };
        match batch.kind {
            BatchKind::Update => self.commit_update(&batch, &mut outcome),
            BatchKind::FolderListing => {
                for listing in std::mem::take(&mut batch.listings) {
                    self.commit_listing(listing, &mut outcome);
                }
            }
            BatchKind::ItemListing => self.commit_item_listing(&batch, &mut outcome),
        }
        self.recover_orphans();
        self.report_failures(batch.origin, &outcome.failures);
        self.flush_notifications();
        tracing::debug!(
            created = outcome.created,
            updated = outcome.updated,
            removed = outcome.removed,
            refetch = outcome.refetch.len(),
            "committed batch"
        );
        outcome
    }

    fn plan(&self, batch: &DeltaBatch, failures: &mut Vec<ParseFailure>) -> CommitPlan {
        let mut plan = CommitPlan::default();

        for id in batch.removed_items.iter().chain(&batch.removed_categories) {
            match self.store.get(*id) {
                Some(obj) => {
                    plan.bucket(obj.parent_id(), -1);
                    if obj.is_category() {
                        plan.removed_categories.push(*id);
                    } else {
                        plan.removed_items.push(*id);
                    }
                }
                None => tracing::debug!(id = %id, "ignoring removal of unknown object"),
            }
        }
        for id in batch.updated_versions.keys() {
            plan.bucket(*id, 0);
        }

        for patch in &batch.categories {
            let existing = self.store.get_category(patch.category_id);
            match patch.apply(existing) {
                Ok(mut cat) => match existing {
                    // A replay that changes nothing must not move the version.
                    Some(current) if cat == *current => {}
                    Some(current) => {
                        plan.bucket(current.parent_id, 0);
                        if cat.parent_id != current.parent_id {
                            plan.bucket(current.parent_id, -1);
                            plan.bucket(cat.parent_id, 1);
                        }
                        plan.changed_categories.push(cat);
                    }
                    None => {
                        if patch.descendents.is_none()
                            && let Some(seed) = batch.seeded_counts.get(&cat.category_id)
                        {
                            cat.declared_descendants = *seed;
                        }
                        plan.bucket(cat.parent_id, 1);
                        plan.new_categories.push(cat);
                    }
                },
                Err(err) => failures.push(ParseFailure::from(&err)),
            }
        }

        for patch in &batch.items {
            let existing = self.store.get_item(patch.item_id);
            match patch.clone().apply(existing) {
                Ok(item) => match existing {
                    Some(current) if item == *current => {}
                    Some(current) => {
                        plan.bucket(current.parent_id, 0);
                        if item.parent_id != current.parent_id {
                            plan.bucket(current.parent_id, -1);
                            plan.bucket(item.parent_id, 1);
                        }
                        plan.changed_items.push(item);
                    }
                    None => {
                        plan.bucket(item.parent_id, 1);
                        plan.new_items.push(item);
                    }
                },
                Err(err) => failures.push(ParseFailure::from(&err)),
            }
        }
        plan
    }

    fn commit_update(&mut self, batch: &DeltaBatch, outcome: &mut CommitOutcome) {
        let plan = self.plan(batch, &mut outcome.failures);
        let created_here: HashSet<Uuid> =
            plan.new_categories.iter().map(|c| c.category_id).collect();

        for (folder, delta) in &plan.buckets {
            if folder.is_nil() || created_here.contains(folder) {
                continue;
            }
            let update = CategoryUpdate::new(*folder, *delta)
                .with_expected_version(batch.updated_versions.get(folder).copied());
            if account_for_update(&mut self.store, &update).needs_refetch() {
                outcome.request_refetch(*folder);
            }
        }

        let create_mask = match batch.origin {
            BatchOrigin::Command => ChangeMask::CREATE,
            BatchOrigin::Fetch => ChangeMask::NONE,
        };
        for cat in plan.new_categories {
            self.insert(cat.into(), outcome, create_mask, true);
        }
        for item in plan.new_items {
            self.insert(item.into(), outcome, create_mask, true);
        }

        for mut cat in plan.changed_categories {
            // Accounting may have moved these since planning.
            if let Some(current) = self.store.get_category(cat.category_id) {
                cat.version = current.version;
                cat.declared_descendants = current.declared_descendants;
                cat.stale = current.stale;
            }
            self.insert(cat.into(), outcome, ChangeMask::NONE, false);
        }
        for item in plan.changed_items {
            self.insert(item.into(), outcome, ChangeMask::NONE, false);
        }

        for id in plan.removed_items {
            match self.store.remove(id) {
                Ok(_) => outcome.removed += 1,
                Err(err) => tracing::debug!(id = %id, error = %err, "item removal skipped"),
            }
        }
        let mut folders: Vec<(usize, Uuid)> = plan
            .removed_categories
            .into_iter()
            .map(|id| (self.store.ancestors(id).len(), id))
            .collect();
        folders.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, id) in folders {
            outcome.removed += self.remove_folder(id);
        }

        for (id, server) in &batch.updated_versions {
            let Some(cat) = self.store.get_category(*id) else {
                continue;
            };
            if cat.version != *server {
                let mismatch = VersionMismatch {
                    category_id: *id,
                    local: cat.version,
                    server: *server,
                };
                tracing::warn!(%mismatch, "folder version disagrees after commit");
                self.store.set_stale(*id, true);
                outcome.mismatches.push(mismatch);
                outcome.request_refetch(*id);
            }
        }
    }

    fn commit_listing(&mut self, listing: FolderListing, outcome: &mut CommitOutcome) {
        let folder_id = listing.folder_id;
        let Some(folder) = self.store.get_category(folder_id) else {
            tracing::warn!(folder = %folder_id, "listing for unknown folder skipped");
            return;
        };
        if folder.version_known() && listing.version < folder.version {
            let mismatch = VersionMismatch {
                category_id: folder_id,
                local: folder.version,
                server: listing.version,
            };
            tracing::warn!(%mismatch, "ignoring out-of-order listing");
            outcome.mismatches.push(mismatch);
            return;
        }
        let exhaustive = listing.is_exhaustive();

        let mut present = HashSet::new();
        for patch in &listing.categories {
            let id = patch.category_id;
            present.insert(id);
            let existing = self.store.get_category(id);
            let drifted = existing
                .zip(patch.version)
                .is_some_and(|(current, server)| current.version_known() && current.version != server);
            let is_new = existing.is_none();
            match patch.apply(existing) {
                Ok(cat) => {
                    self.insert(cat.into(), outcome, ChangeMask::NONE, is_new);
                    if drifted {
                        self.store.set_stale(id, true);
                        outcome.request_refetch(id);
                    }
                }
                Err(err) => outcome.failures.push(ParseFailure::from(&err)),
            }
        }
        for patch in &listing.items {
            present.insert(patch.item_id);
            let existing = self.store.get_item(patch.item_id);
            let is_new = existing.is_none();
            match patch.clone().apply(existing) {
                Ok(item) => self.insert(item.into(), outcome, ChangeMask::NONE, is_new),
                Err(err) => outcome.failures.push(ParseFailure::from(&err)),
            }
        }

        if exhaustive {
            let absent: Vec<Uuid> = self
                .store
                .child_category_ids(folder_id)
                .iter()
                .chain(self.store.child_item_ids(folder_id))
                .copied()
                .filter(|id| !present.contains(id))
                .collect();
            for id in absent {
                tracing::debug!(folder = %folder_id, id = %id, "purging child missing from listing");
                if self.store.get_category(id).is_some() {
                    outcome.removed += self.remove_folder(id);
                } else if self.store.remove(id).is_ok() {
                    outcome.removed += 1;
                }
            }
        }

        if let Err(err) =
            self.store
                .set_category_counts(folder_id, listing.version, listing.descendents)
        {
            tracing::error!(folder = %folder_id, error = %err, "listed folder vanished during commit");
            return;
        }
        self.store.set_stale(folder_id, false);
    }

    fn commit_item_listing(&mut self, batch: &DeltaBatch, outcome: &mut CommitOutcome) {
        for patch in &batch.items {
            let existing = self.store.get_item(patch.item_id);
            let is_new = existing.is_none();
            match patch.clone().apply(existing) {
                Ok(mut item) => {
                    item.complete = true;
                    self.insert(item.into(), outcome, ChangeMask::NONE, is_new);
                }
                Err(err) => outcome.failures.push(ParseFailure::from(&err)),
            }
        }
    }

    fn insert(
        &mut self,
        object: InventoryObject,
        outcome: &mut CommitOutcome,
        extra: ChangeMask,
        is_new: bool,
    ) {
        let id = object.id();
        match self.store.insert_or_replace(object) {
            Ok(()) => {
                if is_new {
                    outcome.created += 1;
                } else {
                    outcome.updated += 1;
                }
                if !extra.is_empty() {
                    self.store.record_change(extra, id);
                }
            }
            Err(err) => {
                tracing::warn!(id = %id, error = %err, "rejected object from payload");
                outcome
                    .failures
                    .push(ParseFailure::new(Some(id), err.to_string()));
            }
        }
    }

    /// Removes a folder, purging whatever is still below it first.
    fn remove_folder(&mut self, id: Uuid) -> usize {
        if self.store.get_category(id).is_none() {
            return 0;
        }
        let mut removed = 0;
        if self.store.observed_descendants(id) > 0 {
            removed += self.store.purge_descendants(id);
            tracing::debug!(folder = %id, purged = removed, "purged leftovers before removal");
        }
        match self.store.remove(id) {
            Ok(_) => removed + 1,
            Err(err) => {
                debug_assert!(false, "folder {id} survived purge: {err}");
                tracing::error!(folder = %id, error = %err, "could not remove folder");
                removed
            }
        }
    }

    fn report_failures(&mut self, origin: BatchOrigin, failures: &[ParseFailure]) {
        for failure in failures {
            match origin {
                BatchOrigin::Command => {
                    tracing::warn!(%failure, "command response contained unparseable data");
                    self.pending_alerts.push(Alert::ParseFailure {
                        object_id: failure.object_id,
                        message: failure.message.clone(),
                    });
                }
                BatchOrigin::Fetch => tracing::warn!(%failure, "skipping unparseable fetched object"),
            }
        }
    }

    /// Reattaches objects whose parent is unknown under the primary root's
    /// Lost And Found folder, creating it locally if needed.
    fn recover_orphans(&mut self) {
        if self.store.find_orphans().is_empty() {
            return;
        }
        let recovery = match self
            .primary_root
            .filter(|root| self.store.get_category(*root).is_some())
        {
            Some(root) => match self.store.find_category_by_type(root, FolderType::LostAndFound) {
                Some(id) => id,
                None => {
                    let lost = InventoryCategory::new(
                        Uuid::new_v4(),
                        root,
                        LOST_AND_FOUND_NAME,
                        FolderType::LostAndFound,
                        self.owner_id,
                    );
                    let id = lost.category_id;
                    match self.store.insert_or_replace(lost) {
                        Ok(()) => id,
                        Err(err) => {
                            tracing::error!(error = %err, "could not create recovery folder");
                            Uuid::nil()
                        }
                    }
                }
            },
            None => Uuid::nil(),
        };
        match self.store.recover_orphans(recovery) {
            Ok(moved) => tracing::warn!(moved, recovery = %recovery, "reattached orphaned objects"),
            Err(err) => tracing::error!(error = %err, "orphan recovery failed"),
        }
    }

    /// Speculatively moves an object before the server confirms it. Declared
    /// counts of complete parents follow the move so they stay complete;
    /// versions are left for the server to bump. Returns the old parent.
    pub fn move_locally(&mut self, id: Uuid, new_parent: Uuid) -> Result<Uuid, StoreError> {
        let old_parent = self
            .store
            .get(id)
            .map(|obj| obj.parent_id())
            .ok_or(StoreError::NotFound(id))?;
        if old_parent == new_parent {
            return Ok(old_parent);
        }
        let old_complete = self.store.is_complete(old_parent);
        let new_complete = self.store.is_complete(new_parent);
        self.store.reparent(id, new_parent)?;
        if old_complete {
            self.adjust_declared(old_parent, -1);
        }
        if new_complete {
            self.adjust_declared(new_parent, 1);
        }
        self.flush_notifications();
        Ok(old_parent)
    }

    fn adjust_declared(&mut self, id: Uuid, delta: i32) {
        if let Some(cat) = self.store.get_category(id) {
            let (version, declared) = (cat.version, cat.declared_descendants);
            let _ = self.store.set_category_counts(id, version, declared + delta);
        }
    }

    /// Installs a loaded snapshot. Folders whose restored children do not add
    /// up are kept but marked stale.
    pub fn install_snapshot(&mut self, loaded: LoadedSnapshot) -> Result<usize, CacheError> {
        if loaded.is_stale {
            return Err(CacheError::StaleCache(loaded.path));
        }
        let folder_ids: Vec<Uuid> = loaded.categories.iter().map(|c| c.category_id).collect();
        let mut installed = 0;
        for cat in loaded.categories {
            match self.store.insert_or_replace(cat) {
                Ok(()) => installed += 1,
                Err(err) => tracing::warn!(error = %err, "snapshot folder rejected"),
            }
        }
        for item in loaded.items {
            match self.store.insert_or_replace(item) {
                Ok(()) => installed += 1,
                Err(err) => tracing::warn!(error = %err, "snapshot item rejected"),
            }
        }
        for id in folder_ids {
            let counts_match = self.store.get_category(id).is_some_and(|cat| {
                cat.version != VERSION_UNKNOWN
                    && usize::try_from(cat.declared_descendants)
                        .is_ok_and(|declared| declared == self.store.observed_descendants(id))
            });
            if loaded.needs_revalidation.contains(&id) || !counts_match {
                self.store.set_stale(id, true);
            }
        }
        self.recover_orphans();
        self.flush_notifications();
        tracing::info!(objects = installed, "installed snapshot");
        Ok(installed)
    }

    /// Drops every object, e.g. on logout. Observers are told to rebuild.
    pub fn clear(&mut self) {
        self.store.clear();
        self.flush_notifications();
    }
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
