//! Batched, throttled subtree and item fetching.
//!
//! Requests run as spawned tasks that only talk HTTP and report back over a
//! channel. Everything that touches the model happens in [`FetchScheduler::tick`],
//! on the caller's task.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use inventory_core::{
    Destination, FetchDescendentsResponse, FetchItemsResponse, FolderRequest, InventoryApiError,
    InventoryClient, ItemRequest,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::backoff::{AdaptivePacing, Backoff};
use super::delta::DeltaBatch;
use super::model::InventoryModel;
use super::observer::Alert;
use super::queue::{Enqueued, FetchEntry, FetchPriority, FetchQueue, FetchTarget};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_MAX_OUTSTANDING: usize = 12;
pub const DEFAULT_MAX_BACKGROUND_OUTSTANDING: usize = 8;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub batch_size: usize,
    pub max_outstanding: usize,
    /// Background requests are only issued while fewer calls than this are in flight.
    pub max_background_outstanding: usize,
    pub max_attempts: u32,
    /// Minimum spacing between two issue rounds.
    pub min_interval: Duration,
    /// One single-entry request at a time, paced adaptively.
    pub legacy_mode: bool,
    /// Starting window for legacy mode.
    pub legacy_pacing: AdaptivePacing,
    pub retry_backoff: Backoff,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            max_background_outstanding: DEFAULT_MAX_BACKGROUND_OUTSTANDING,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_interval: Duration::ZERO,
            legacy_mode: false,
            legacy_pacing: AdaptivePacing::default(),
            retry_backoff: Backoff::default(),
        }
    }
}

/// Owner ids sent along with requests when the store does not know better.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOwners {
    pub agent_id: Uuid,
    pub library_owner_id: Uuid,
}

impl FetchOwners {
    fn for_destination(&self, destination: Destination) -> Uuid {
        match destination {
            Destination::Primary => self.agent_id,
            Destination::Library => self.library_owner_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchFailure {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
    #[error("server refused: {0}")]
    Refused(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    InFlight,
}

enum Response {
    Descendents(Result<FetchDescendentsResponse, InventoryApiError>),
    Items(Result<FetchItemsResponse, InventoryApiError>),
}

struct Completion {
    ticket: u64,
    generation: u64,
    response: Response,
}

struct InFlight {
    entries: Vec<FetchEntry>,
    started: Instant,
    handle: JoinHandle<()>,
}

pub struct FetchScheduler {
    client: InventoryClient,
    config: FetchConfig,
    owners: FetchOwners,
    queue: FetchQueue,
    in_flight: HashMap<u64, InFlight>,
    next_ticket: u64,
    generation: u64,
    torn_down: bool,
    pacing: AdaptivePacing,
    last_issued: Option<Instant>,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
}

impl FetchScheduler {
    pub fn new(client: InventoryClient, config: FetchConfig, owners: FetchOwners) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pacing = config.legacy_pacing;
        Self {
            client,
            config,
            owners,
            queue: FetchQueue::default(),
            in_flight: HashMap::new(),
            next_ticket: 0,
            generation: 0,
            torn_down: false,
            pacing,
            last_issued: None,
            tx,
            rx,
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn pacing(&self) -> AdaptivePacing {
        self.pacing
    }

    /// Idempotent. Asking again for a recursive fetch upgrades a queued
    /// non-recursive one. Returns false when nothing new was queued.
    ///
    /// Explicit requests run in the foreground; the folders a recursive fetch
    /// discovers on the way are fetched in the background.
    pub fn request_subtree(&mut self, model: &InventoryModel, id: Uuid, recursive: bool) -> bool {
        let entry = FetchEntry::subtree(id, recursive, model.destination_of(id))
            .with_priority(FetchPriority::Foreground);
        self.track(entry)
    }

    pub fn request_item(&mut self, model: &InventoryModel, id: Uuid) -> bool {
        let entry =
            FetchEntry::item(id, model.destination_of(id)).with_priority(FetchPriority::Foreground);
        self.track(entry)
    }

    fn track(&mut self, entry: FetchEntry) -> bool {
        if self.torn_down {
            return false;
        }
        let covered = self.in_flight.values().any(|flight| {
            flight.entries.iter().any(|running| {
                running.id == entry.id
                    && (running.target == entry.target
                        || (running.is_recursive() && !entry.is_recursive()))
            })
        });
        if covered {
            return false;
        }
        !matches!(self.queue.enqueue(entry), Enqueued::AlreadyQueued)
    }

    pub fn state_of(&self, id: Uuid) -> Option<RequestState> {
        if self
            .in_flight
            .values()
            .any(|flight| flight.entries.iter().any(|entry| entry.id == id))
        {
            Some(RequestState::InFlight)
        } else if self.queue.contains(id) {
            Some(RequestState::Queued)
        } else {
            None
        }
    }

    pub fn is_tracked(&self, id: Uuid) -> bool {
        self.state_of(id).is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    /// Drops every queued request and abandons the ones in flight; their
    /// responses will be discarded.
    pub fn cancel_all(&mut self) {
        let dropped = self.queue.clear();
        for (_, flight) in self.in_flight.drain() {
            flight.handle.abort();
        }
        self.generation += 1;
        tracing::debug!(dropped, generation = self.generation, "fetches cancelled");
    }

    pub fn shutdown(&mut self) {
        self.cancel_all();
        self.torn_down = true;
    }

    /// Applies finished requests to the model and issues new ones. Never
    /// blocks. Returns the number of responses processed.
    pub fn tick(&mut self, model: &mut InventoryModel) -> usize {
        if self.torn_down {
            return 0;
        }
        let mut processed = 0;
        while let Ok(completion) = self.rx.try_recv() {
            if completion.generation != self.generation {
                tracing::debug!(ticket = completion.ticket, "discarding response from cancelled fetch");
                continue;
            }
            let Some(flight) = self.in_flight.remove(&completion.ticket) else {
                continue;
            };
            processed += 1;
            if self.config.legacy_mode && flight.started.elapsed() <= self.pacing.slow_after() {
                self.pacing.on_fast();
            }
            match completion.response {
                Response::Descendents(Ok(response)) => {
                    self.handle_descendents(model, flight.entries, response)
                }
                Response::Items(Ok(response)) => self.handle_items(model, flight.entries, response),
                Response::Descendents(Err(err)) | Response::Items(Err(err)) => {
                    self.handle_failure(model, flight.entries, &err)
                }
            }
        }
        if self.config.legacy_mode {
            self.requeue_slow();
        }
        self.issue(model);
        model.flush_notifications();
        processed
    }

    fn handle_descendents(
        &mut self,
        model: &mut InventoryModel,
        entries: Vec<FetchEntry>,
        response: FetchDescendentsResponse,
    ) {
        let bad: HashMap<Uuid, String> = response
            .bad_folders
            .iter()
            .map(|bad| (bad.folder_id, bad.error.clone()))
            .collect();
        let outcome = model.commit(DeltaBatch::from_folder_listing(&response.folders));

        for entry in entries {
            if let Some(error) = bad.get(&entry.id) {
                tracing::warn!(folder = %entry.id, error = %error, "server could not list folder");
                self.give_up(model, entry.id, FetchFailure::Refused(error.clone()));
                continue;
            }
            if model.store().is_complete(entry.id) {
                if entry.is_recursive() {
                    self.expand(model, entry.id, entry.destination);
                }
            } else {
                self.retry(model, entry, "listing left folder incomplete".to_string());
            }
        }
        for id in outcome.refetch {
            let destination = model.destination_of(id);
            self.track(FetchEntry::subtree(id, false, destination));
        }
    }

    /// Queues every incomplete folder below `folder`, walking through the
    /// complete ones locally.
    fn expand(&mut self, model: &InventoryModel, folder: Uuid, destination: Destination) {
        let store = model.store();
        let mut stack = vec![folder];
        while let Some(current) = stack.pop() {
            for child in store.child_category_ids(current) {
                if store.is_complete(*child) {
                    stack.push(*child);
                } else {
                    self.track(FetchEntry::subtree(*child, true, destination));
                }
            }
        }
    }

    fn handle_items(
        &mut self,
        model: &mut InventoryModel,
        entries: Vec<FetchEntry>,
        response: FetchItemsResponse,
    ) {
        let bad: HashSet<Uuid> = response.bad_items.iter().copied().collect();
        model.commit(DeltaBatch::from_item_listing(&response.items));
        for entry in entries {
            if bad.contains(&entry.id) {
                self.give_up(model, entry.id, FetchFailure::Refused("item not found".into()));
            } else if !model
                .store()
                .get_item(entry.id)
                .is_some_and(|item| item.complete)
            {
                self.retry(model, entry, "item missing from response".to_string());
            }
        }
    }

    fn handle_failure(
        &mut self,
        model: &mut InventoryModel,
        entries: Vec<FetchEntry>,
        err: &InventoryApiError,
    ) {
        if err.is_retryable() {
            tracing::debug!(error = %err, entries = entries.len(), "fetch failed, will retry");
            for entry in entries {
                self.retry(model, entry, err.to_string());
            }
            return;
        }
        let failure = match err.classification() {
            Some(_) => FetchFailure::Refused(err.to_string()),
            None => FetchFailure::Transport(err.to_string()),
        };
        for entry in entries {
            self.give_up(model, entry.id, failure.clone());
        }
    }

    fn retry(&mut self, model: &mut InventoryModel, mut entry: FetchEntry, reason: String) {
        entry.attempt += 1;
        if entry.attempt >= self.config.max_attempts {
            let failure = FetchFailure::Exhausted {
                attempts: entry.attempt,
                last_error: reason,
            };
            self.give_up(model, entry.id, failure);
            return;
        }
        let delay = self.config.retry_backoff.delay(entry.attempt);
        tracing::debug!(id = %entry.id, attempt = entry.attempt, ?delay, reason = %reason, "requeueing fetch");
        entry.retry_at = Some(Instant::now() + delay);
        self.queue.requeue_front(entry);
    }

    fn give_up(&mut self, model: &mut InventoryModel, id: Uuid, failure: FetchFailure) {
        tracing::warn!(id = %id, %failure, "dropping fetch");
        model.push_alert(Alert::FetchExhausted {
            id,
            reason: failure.to_string(),
        });
    }

    fn requeue_slow(&mut self) {
        let slow_after = self.pacing.slow_after();
        let slow: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.started.elapsed() > slow_after)
            .map(|(ticket, _)| *ticket)
            .collect();
        for ticket in slow {
            let Some(flight) = self.in_flight.remove(&ticket) else {
                continue;
            };
            flight.handle.abort();
            self.pacing.on_slow();
            tracing::info!(
                ticket,
                min_interval = ?self.pacing.min_interval(),
                slow_after = ?self.pacing.slow_after(),
                "slow fetch, widening pacing"
            );
            for entry in flight.entries {
                self.queue.requeue_front(entry);
            }
        }
    }

    fn issue(&mut self, model: &InventoryModel) {
        let (max_outstanding, max_background, batch_size, min_interval) =
            if self.config.legacy_mode {
                (1, 1, 1, self.pacing.min_interval())
            } else {
                (
                    self.config.max_outstanding,
                    self.config.max_background_outstanding,
                    self.config.batch_size,
                    self.config.min_interval,
                )
            };
        if self.in_flight.len() >= max_outstanding {
            return;
        }
        if let Some(last) = self.last_issued
            && last.elapsed() < min_interval
        {
            return;
        }
        let now = Instant::now();
        let background = self.in_flight.len() < max_background;
        let entries = self.queue.take_ready(now, batch_size, background);
        if entries.is_empty() {
            return;
        }

        let mut groups: Vec<((Destination, bool), Vec<FetchEntry>)> = Vec::new();
        for entry in entries {
            let key = (entry.destination, entry.target == FetchTarget::Item);
            match groups.iter_mut().find(|(existing, _)| *existing == key) {
                Some((_, group)) => group.push(entry),
                None => groups.push((key, vec![entry])),
            }
        }
        for ((destination, is_item), group) in groups {
            if is_item {
                self.spawn_items(model, destination, group);
            } else {
                self.spawn_descendents(model, destination, group);
            }
        }
        self.last_issued = Some(now);
    }

    fn spawn_descendents(
        &mut self,
        model: &InventoryModel,
        destination: Destination,
        entries: Vec<FetchEntry>,
    ) {
        let fallback = self.owners.for_destination(destination);
        let folders: Vec<FolderRequest> = entries
            .iter()
            .map(|entry| {
                let owner = model
                    .store()
                    .get_category(entry.id)
                    .map(|cat| cat.owner_id)
                    .filter(|owner| !owner.is_nil())
                    .unwrap_or(fallback);
                FolderRequest::new(entry.id, owner)
            })
            .collect();
        let client = self.client.clone();
        self.launch(entries, async move {
            Response::Descendents(client.fetch_descendents(destination, &folders).await)
        });
    }

    fn spawn_items(
        &mut self,
        model: &InventoryModel,
        destination: Destination,
        entries: Vec<FetchEntry>,
    ) {
        let agent_id = self.owners.for_destination(destination);
        let items: Vec<ItemRequest> = entries
            .iter()
            .map(|entry| ItemRequest {
                owner_id: model
                    .store()
                    .get_item(entry.id)
                    .map(|item| item.permissions.owner_id)
                    .filter(|owner| !owner.is_nil())
                    .unwrap_or(agent_id),
                item_id: entry.id,
            })
            .collect();
        let client = self.client.clone();
        self.launch(entries, async move {
            Response::Items(client.fetch_items(destination, agent_id, &items).await)
        });
    }

    fn launch<F>(&mut self, entries: Vec<FetchEntry>, request: F)
    where
        F: Future<Output = Response> + Send + 'static,
    {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        tracing::debug!(ticket, entries = entries.len(), "issuing fetch");
        let handle = tokio::spawn(async move {
            let response = request.await;
            // The scheduler may already be gone.
            let _ = tx.send(Completion {
                ticket,
                generation,
                response,
            });
        });
        self.in_flight.insert(
            ticket,
            InFlight {
                entries,
                started: Instant::now(),
                handle,
            },
        );
    }
}

#[cfg(test)]
#[path = "fetch_tests.rs"]
mod tests;
