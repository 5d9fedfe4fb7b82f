//! Per-folder version and descendant count bookkeeping.
//!
//! A folder's local version is bumped and its declared count adjusted only
//! when the local view was provably in sync before the batch. Anything else is
//! recorded as stale so the folder gets listed again.

use uuid::Uuid;

use super::store::InventoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryUpdate {
    pub category_id: Uuid,
    pub delta: i32,
    /// Version the server says the folder has after this change, when known.
    pub expected_version: Option<i32>,
}

impl CategoryUpdate {
    pub fn new(category_id: Uuid, delta: i32) -> Self {
        Self {
            category_id,
            delta,
            expected_version: None,
        }
    }

    pub fn with_expected_version(mut self, version: Option<i32>) -> Self {
        self.expected_version = version;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnknownFolder,
    UnknownVersion,
    CountMismatch { declared: i32, observed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountingOutcome {
    Applied { version: i32, declared: i32 },
    /// The local version already covers this change.
    AlreadyAccounted,
    Skipped(SkipReason),
}

impl AccountingOutcome {
    /// Whether the folder needs to be listed again.
    pub fn needs_refetch(&self) -> bool {
        matches!(
            self,
            AccountingOutcome::Skipped(SkipReason::UnknownVersion | SkipReason::CountMismatch { .. })
        )
    }
}

/// Must run before the batch touches the folder's children: the count check
/// compares against what was observed before the change.
pub fn account_for_update(store: &mut InventoryStore, update: &CategoryUpdate) -> AccountingOutcome {
    let id = update.category_id;
    let Some(cat) = store.get_category(id) else {
        tracing::debug!(folder = %id, "accounting skipped: folder not known locally");
        return AccountingOutcome::Skipped(SkipReason::UnknownFolder);
    };
    let (version, declared) = (cat.version, cat.declared_descendants);

    if let Some(expected) = update.expected_version
        && cat.version_known()
        && version >= expected
    {
        tracing::debug!(folder = %id, local = version, expected, "update already accounted");
        return AccountingOutcome::AlreadyAccounted;
    }

    if !cat.version_known() {
        tracing::debug!(folder = %id, "accounting skipped: version unknown");
        store.set_stale(id, true);
        return AccountingOutcome::Skipped(SkipReason::UnknownVersion);
    }

    let observed = store.observed_descendants(id);
    if usize::try_from(declared).ok() != Some(observed) {
        tracing::warn!(
            folder = %id,
            declared,
            observed,
            delta = update.delta,
            "accounting skipped: descendant count out of sync"
        );
        store.set_stale(id, true);
        return AccountingOutcome::Skipped(SkipReason::CountMismatch { declared, observed });
    }

    let version = version + 1;
    let declared = declared + update.delta;
    // Present in the store was checked above.
    if store.set_category_counts(id, version, declared).is_err() {
        return AccountingOutcome::Skipped(SkipReason::UnknownFolder);
    }
    tracing::debug!(folder = %id, version, declared, "accounted");
    AccountingOutcome::Applied { version, declared }
}
