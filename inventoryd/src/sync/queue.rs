use std::collections::VecDeque;
use std::time::Instant;

use inventory_core::Destination;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchTarget {
    Subtree { recursive: bool },
    Item,
}

impl FetchTarget {
    fn same_kind(self, other: FetchTarget) -> bool {
        matches!(
            (self, other),
            (FetchTarget::Subtree { .. }, FetchTarget::Subtree { .. })
                | (FetchTarget::Item, FetchTarget::Item)
        )
    }
}

/// Foreground requests are served first and may use the whole outstanding
/// budget; background ones only the background share of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchPriority {
    Foreground,
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchEntry {
    pub id: Uuid,
    pub target: FetchTarget,
    pub destination: Destination,
    pub priority: FetchPriority,
    pub attempt: u32,
    pub retry_at: Option<Instant>,
}

impl FetchEntry {
    pub fn subtree(id: Uuid, recursive: bool, destination: Destination) -> Self {
        Self {
            id,
            target: FetchTarget::Subtree { recursive },
            destination,
            priority: FetchPriority::Background,
            attempt: 0,
            retry_at: None,
        }
    }

    pub fn item(id: Uuid, destination: Destination) -> Self {
        Self {
            id,
            target: FetchTarget::Item,
            destination,
            priority: FetchPriority::Background,
            attempt: 0,
            retry_at: None,
        }
    }

    pub fn with_priority(mut self, priority: FetchPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_recursive(&self) -> bool {
        matches!(self.target, FetchTarget::Subtree { recursive: true })
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.retry_at.is_none_or(|at| at <= now)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued {
    Added,
    /// A queued request was made recursive or moved to the foreground.
    Upgraded,
    AlreadyQueued,
}

/// Pending fetches, oldest first. Retries go back to the front.
#[derive(Debug, Default)]
pub struct FetchQueue {
    inner: VecDeque<FetchEntry>,
}

impl FetchQueue {
    pub fn enqueue(&mut self, entry: FetchEntry) -> Enqueued {
        if let Some(existing) = self
            .inner
            .iter_mut()
            .find(|queued| queued.id == entry.id && queued.target.same_kind(entry.target))
        {
            let mut upgraded = false;
            if entry.is_recursive() && !existing.is_recursive() {
                existing.target = entry.target;
                upgraded = true;
            }
            if entry.priority == FetchPriority::Foreground
                && existing.priority == FetchPriority::Background
            {
                existing.priority = FetchPriority::Foreground;
                upgraded = true;
            }
            return if upgraded {
                Enqueued::Upgraded
            } else {
                Enqueued::AlreadyQueued
            };
        }
        self.inner.push_back(entry);
        Enqueued::Added
    }

    pub fn requeue_front(&mut self, entry: FetchEntry) {
        self.inner.retain(|queued| {
            !(queued.id == entry.id && queued.target.same_kind(entry.target))
        });
        self.inner.push_front(entry);
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner.iter().any(|entry| entry.id == id)
    }

    pub fn get(&self, id: Uuid) -> Option<&FetchEntry> {
        self.inner.iter().find(|entry| entry.id == id)
    }

    /// Removes and returns up to `max` entries whose retry time has come,
    /// foreground first, keeping the rest in order. Background entries are
    /// only taken when `background` is set.
    pub fn take_ready(&mut self, now: Instant, max: usize, background: bool) -> Vec<FetchEntry> {
        let mut taken = Vec::new();
        for priority in [FetchPriority::Foreground, FetchPriority::Background] {
            if priority == FetchPriority::Background && !background {
                break;
            }
            let mut kept = VecDeque::with_capacity(self.inner.len());
            while let Some(entry) = self.inner.pop_front() {
                if taken.len() < max && entry.priority == priority && entry.is_ready(now) {
                    taken.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            self.inner = kept;
        }
        taken
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.inner.len();
        self.inner.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fifo_order_is_preserved() {
        let mut queue = FetchQueue::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queue.enqueue(FetchEntry::subtree(a, false, Destination::Primary));
        queue.enqueue(FetchEntry::item(b, Destination::Library));

        let taken = queue.take_ready(Instant::now(), 10, true);

        assert_eq!(taken.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a, b]);
        assert!(queue.is_empty());
    }

    #[test]
    fn repeated_request_is_idempotent_and_upgrades_recursion() {
        let mut queue = FetchQueue::default();
        let id = Uuid::new_v4();
        assert_eq!(
            queue.enqueue(FetchEntry::subtree(id, false, Destination::Primary)),
            Enqueued::Added
        );
        assert_eq!(
            queue.enqueue(FetchEntry::subtree(id, false, Destination::Primary)),
            Enqueued::AlreadyQueued
        );
        assert_eq!(
            queue.enqueue(FetchEntry::subtree(id, true, Destination::Primary)),
            Enqueued::Upgraded
        );
        assert_eq!(queue.len(), 1);
        assert!(queue.get(id).unwrap().is_recursive());
    }

    #[test]
    fn entries_waiting_for_retry_are_skipped() {
        let mut queue = FetchQueue::default();
        let now = Instant::now();
        let later = Uuid::new_v4();
        let ready = Uuid::new_v4();
        let mut waiting = FetchEntry::subtree(later, false, Destination::Primary);
        waiting.retry_at = Some(now + Duration::from_secs(60));
        queue.requeue_front(waiting);
        queue.enqueue(FetchEntry::subtree(ready, false, Destination::Primary));

        let taken = queue.take_ready(now, 10, true);

        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].id, ready);
        assert!(queue.contains(later));
    }

    #[test]
    fn foreground_entries_jump_the_queue() {
        let mut queue = FetchQueue::default();
        let crawl = Uuid::new_v4();
        let user = Uuid::new_v4();
        queue.enqueue(FetchEntry::subtree(crawl, true, Destination::Primary));
        queue.enqueue(
            FetchEntry::subtree(user, false, Destination::Primary)
                .with_priority(FetchPriority::Foreground),
        );

        let foreground_only = queue.take_ready(Instant::now(), 10, false);
        assert_eq!(foreground_only.len(), 1);
        assert_eq!(foreground_only[0].id, user);
        assert!(queue.contains(crawl));

        let promoted = FetchEntry::subtree(crawl, false, Destination::Primary)
            .with_priority(FetchPriority::Foreground);
        assert_eq!(queue.enqueue(promoted), Enqueued::Upgraded);
        let entry = queue.get(crawl).unwrap();
        assert_eq!(entry.priority, FetchPriority::Foreground);
        assert!(entry.is_recursive());
    }

    #[test]
    fn take_ready_respects_limit() {
        let mut queue = FetchQueue::default();
        for _ in 0..5 {
            queue.enqueue(FetchEntry::item(Uuid::new_v4(), Destination::Primary));
        }
        assert_eq!(queue.take_ready(Instant::now(), 2, true).len(), 2);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.clear(), 3);
    }
}
