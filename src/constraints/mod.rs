use std::{num::NonZeroUsize, sync::Arc};

use lru::LruCache;
use metrics::{Counter, Gauge};
use parking_lot::Mutex;
use revm_primitives::alloy_primitives::TxHash;
use tracing::{debug, info};

pub use crate::common::ParseError;
pub use crate::constraints::api::{ConstraintsApi, ConstraintsApiServer};
pub use crate::constraints::types::{
    BatchedSignedConstraints, Constraint, ConstraintsMessage, DecodedConstraint, HashToConstraintDecoded,
    SignedConstraints,
};
use crate::common::Slot;

mod api;
pub mod types;

/// Default number of slots kept in the cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Inclusion constraints for upcoming slots, bounded by slot count.
///
/// Each slot maps to an immutable, shared snapshot of its constraints. Writers clone the
/// snapshot on write, so a reader holding an `Arc` from [`ConstraintCache::get`] never sees
/// a half applied batch.
pub struct ConstraintCache {
    slots: Mutex<LruCache<Slot, Arc<HashToConstraintDecoded>>>,
    metrics: ConstraintCacheMetrics,
}

impl ConstraintCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self { slots: Mutex::new(LruCache::new(capacity)), metrics: Default::default() }
    }

    /// Decodes and stores a single constraint. A malformed transaction leaves the cache untouched.
    pub fn add_inclusion_constraint(&self, slot: Slot, tx: &[u8], index: Option<u64>) -> Result<(), ParseError> {
        let decoded = DecodedConstraint::decode(tx, index)?;
        self.insert(slot, [decoded]);
        Ok(())
    }

    /// Stores a batch of constraints for one slot.
    ///
    /// Every transaction is decoded before anything is written: if any of them fails to
    /// parse, none of the batch is applied.
    pub fn add_inclusion_constraints(&self, slot: Slot, constraints: &[Constraint]) -> Result<(), ParseError> {
        let decoded = constraints.iter().map(DecodedConstraint::try_from).collect::<Result<Vec<_>, _>>()?;
        self.insert(slot, decoded);
        Ok(())
    }

    /// Merges every message of a signed batch into its slot, returning the number of
    /// constraints written. Signatures are expected to be verified upstream.
    pub fn add_signed_constraints(&self, batch: &[SignedConstraints]) -> Result<usize, ParseError> {
        let mut decoded = Vec::with_capacity(batch.len());
        for signed in batch {
            let message = &signed.message;
            let constraints =
                message.constraints.iter().map(DecodedConstraint::try_from).collect::<Result<Vec<_>, _>>()?;
            decoded.push((message.slot, constraints));
        }

        let mut written = 0;
        for (slot, constraints) in decoded {
            written += constraints.len();
            self.insert(slot, constraints);
        }
        Ok(written)
    }

    /// Constraints for `slot`. Marks the slot as recently used.
    pub fn get(&self, slot: Slot) -> Option<Arc<HashToConstraintDecoded>> {
        self.slots.lock().get(&slot).cloned()
    }

    /// Looks for a transaction across every cached slot without touching recency.
    pub fn find_by_transaction_hash(&self, hash: &TxHash) -> Option<DecodedConstraint> {
        let slots = self.slots.lock();
        slots.iter().find_map(|(_, constraints)| constraints.get(hash).cloned())
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.slots.lock().contains(&slot)
    }

    /// Number of cached slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, slot: Slot, constraints: impl IntoIterator<Item = DecodedConstraint>) {
        let mut slots = self.slots.lock();

        if !slots.contains(&slot) {
            if let Some((evicted, dropped)) = slots.push(slot, Arc::default()) {
                if evicted != slot {
                    debug!(target: "builder::constraints", evicted, constraints = dropped.len(), "Evicted slot");
                    self.metrics.evicted_slots.increment(1);
                }
            }
        }

        let Some(entry) = slots.get_mut(&slot) else { return };
        let entry = Arc::make_mut(entry);
        let before = entry.len();
        for constraint in constraints {
            entry.insert(constraint.hash(), constraint);
        }
        let added = entry.len() - before;
        info!(target: "builder::constraints", slot, added, total = entry.len(), "Stored inclusion constraints");

        self.metrics.cached_slots.set(slots.len() as f64);
    }
}

impl Default for ConstraintCache {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

impl core::fmt::Debug for ConstraintCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConstraintCache").field("slots", &self.len()).finish_non_exhaustive()
    }
}

/// Metrics for the constraint cache.
pub(crate) struct ConstraintCacheMetrics {
    /// Number of slots currently holding constraints.
    pub(crate) cached_slots: Gauge,
    /// Slots pushed out by newer ones.
    pub(crate) evicted_slots: Counter,
}

impl Default for ConstraintCacheMetrics {
    fn default() -> Self {
        Self {
            cached_slots: metrics::gauge!("builder.constraints.cached_slots"),
            evicted_slots: metrics::counter!("builder.constraints.evicted_slots"),
        }
    }
}
