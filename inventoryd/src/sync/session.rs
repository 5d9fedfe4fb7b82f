use inventory_core::{FolderType, InventoryApiError, InventoryClient, ObjectRef};
use thiserror::Error;
use uuid::Uuid;

use super::delta::{BatchOrigin, CommitOutcome, DeltaBatch};
use super::fetch::{FetchConfig, FetchOwners, FetchScheduler};
use super::model::InventoryModel;
use super::observer::{InventoryObserver, ObserverId};
use super::snapshot::{CacheError, SnapshotCache};
use super::store::{Children, StoreError};

const PRIMARY_ROOT_NAME: &str = "My Inventory";
const LIBRARY_ROOT_NAME: &str = "Library";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Api(#[from] InventoryApiError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub agent_id: Uuid,
    pub primary_root: Uuid,
    pub library_root: Option<Uuid>,
    pub library_owner_id: Uuid,
    pub fetch: FetchConfig,
}

/// One logged-in user's inventory: the model, its fetcher and its cache.
pub struct InventorySession {
    model: InventoryModel,
    scheduler: FetchScheduler,
    client: InventoryClient,
    cache: SnapshotCache,
    config: SessionConfig,
    roots_requested: bool,
    everything_fetched: bool,
}

impl InventorySession {
    pub fn new(
        client: InventoryClient,
        cache: SnapshotCache,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let mut model = InventoryModel::new(config.agent_id);
        model.set_primary_root(config.primary_root);
        model.ensure_root(config.primary_root, config.agent_id, PRIMARY_ROOT_NAME)?;
        if let Some(library) = config.library_root {
            model.set_library_root(library);
            model.ensure_root(library, config.library_owner_id, LIBRARY_ROOT_NAME)?;
        }
        let scheduler = FetchScheduler::new(
            client.clone(),
            config.fetch.clone(),
            FetchOwners {
                agent_id: config.agent_id,
                library_owner_id: config.library_owner_id,
            },
        );
        Ok(Self {
            model,
            scheduler,
            client,
            cache,
            config,
            roots_requested: false,
            everything_fetched: false,
        })
    }

    pub fn model(&self) -> &InventoryModel {
        &self.model
    }

    pub fn scheduler(&self) -> &FetchScheduler {
        &self.scheduler
    }

    pub fn lookup(&self, id: Uuid) -> Option<ObjectRef<'_>> {
        self.model.store().get(id)
    }

    pub fn children_of(&self, folder_id: Uuid) -> Children<'_> {
        self.model.store().children_of(folder_id)
    }

    pub fn is_complete(&self, folder_id: Uuid) -> bool {
        self.model.store().is_complete(folder_id)
    }

    pub fn request_subtree(&mut self, id: Uuid, recursive: bool) -> bool {
        self.scheduler.request_subtree(&self.model, id, recursive)
    }

    pub fn request_item(&mut self, id: Uuid) -> bool {
        self.scheduler.request_item(&self.model, id)
    }

    /// Starts the background crawl of both roots.
    pub fn request_everything(&mut self) {
        self.request_subtree(self.config.primary_root, true);
        if let Some(library) = self.config.library_root {
            self.request_subtree(library, true);
        }
        self.roots_requested = true;
    }

    pub fn subscribe(&mut self, observer: Box<dyn InventoryObserver>) -> ObserverId {
        self.model.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.model.unsubscribe(id)
    }

    pub fn flush_notifications(&mut self) -> bool {
        self.model.flush_notifications()
    }

    pub fn tick(&mut self) -> usize {
        let processed = self.scheduler.tick(&mut self.model);
        if self.roots_requested && !self.everything_fetched && self.scheduler.is_drained() {
            self.everything_fetched = true;
            tracing::info!(
                folders = self.model.store().category_count(),
                items = self.model.store().item_count(),
                "inventory fully fetched"
            );
        }
        processed
    }

    pub fn is_drained(&self) -> bool {
        self.scheduler.is_drained()
    }

    pub fn everything_fetched(&self) -> bool {
        self.everything_fetched
    }

    /// Restores the snapshots of both roots. An incompatible snapshot is
    /// ignored so the network fetch rebuilds it.
    pub fn load_cache(&mut self) -> Result<usize, SessionError> {
        let mut installed = 0;
        for (root, owner) in self.snapshot_owners() {
            let Some(loaded) = self.cache.load(root, owner)? else {
                continue;
            };
            match self.model.install_snapshot(loaded) {
                Ok(count) => installed += count,
                Err(CacheError::StaleCache(path)) => {
                    tracing::warn!(path = %path.display(), "ignoring incompatible snapshot");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(installed)
    }

    pub fn save_cache(&self) -> Result<usize, SessionError> {
        let mut written = 0;
        for (root, owner) in self.snapshot_owners() {
            written += self.cache.save(self.model.store(), root, owner)?;
        }
        Ok(written)
    }

    fn snapshot_owners(&self) -> impl Iterator<Item = (Uuid, Uuid)> + use<> {
        let primary = (self.config.primary_root, self.config.agent_id);
        let library = self
            .config
            .library_root
            .map(|root| (root, self.config.library_owner_id));
        std::iter::once(primary).chain(library)
    }

    /// Stops fetching, keeps what is worth keeping and forgets everything.
    pub fn logout(&mut self) {
        self.scheduler.shutdown();
        if self.everything_fetched
            && let Err(err) = self.save_cache()
        {
            tracing::warn!(error = %err, "failed to save snapshot on logout");
        }
        self.model.clear();
        self.roots_requested = false;
        self.everything_fetched = false;
    }

    pub async fn create_category(
        &mut self,
        parent_id: Uuid,
        name: &str,
        preferred: FolderType,
    ) -> Result<CommitOutcome, SessionError> {
        let delta = self.client.create_category(parent_id, name, preferred).await?;
        Ok(self.apply_command(DeltaBatch::from_update(&delta, BatchOrigin::Command)))
    }

    /// Moves locally first, then tells the server. If the server refuses,
    /// both parents are listed again to undo the speculation.
    pub async fn move_object(
        &mut self,
        id: Uuid,
        new_parent: Uuid,
    ) -> Result<CommitOutcome, SessionError> {
        let is_category = self.model.store().get_category(id).is_some();
        let old_parent = self.model.move_locally(id, new_parent)?;
        let result = if is_category {
            self.client.move_category(id, new_parent).await
        } else {
            self.client.move_item(id, new_parent).await
        };
        match result {
            Ok(delta) => Ok(self.apply_command(DeltaBatch::from_update(
                &delta,
                BatchOrigin::Command,
            ))),
            Err(err) => {
                tracing::warn!(id = %id, error = %err, "remote move failed, refetching parents");
                self.request_subtree(old_parent, false);
                self.request_subtree(new_parent, false);
                Err(err.into())
            }
        }
    }

    pub async fn remove_object(&mut self, id: Uuid) -> Result<CommitOutcome, SessionError> {
        let is_category = match self.model.store().get(id) {
            Some(obj) => obj.is_category(),
            None => return Err(StoreError::NotFound(id).into()),
        };
        let delta = if is_category {
            self.client.remove_category(id).await?
        } else {
            self.client.remove_item(id).await?
        };
        let mut batch = DeltaBatch::from_update(&delta, BatchOrigin::Command);
        let removed = if is_category {
            &mut batch.removed_categories
        } else {
            &mut batch.removed_items
        };
        if !removed.contains(&id) {
            removed.push(id);
        }
        Ok(self.apply_command(batch))
    }

    fn apply_command(&mut self, batch: DeltaBatch) -> CommitOutcome {
        let outcome = self.model.commit(batch);
        for id in &outcome.refetch {
            self.scheduler.request_subtree(&self.model, *id, false);
        }
        outcome
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
