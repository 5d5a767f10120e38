use std::{num::NonZeroUsize, sync::Arc};

use alloy_consensus::Transaction;
use dashmap::DashMap;
use lru::LruCache;
use metrics::Counter;
use parking_lot::Mutex;
use revm_primitives::{B256, U256};
use tracing::trace;

pub use crate::bundles::types::{Bundle, DecodedBundle, SimulatedBundle, bundle_hash};
use crate::execution::{BlockEnv, ExecutionAdapter, ExecutionFailure, SnapshotId};

pub mod types;

/// Default number of state snapshots whose simulations are retained.
pub const DEFAULT_CACHED_SNAPSHOTS: usize = 3;

/// Executes `bundle` on top of `state` and reports whether it can be applied atomically.
///
/// Invalid transactions and reverts at positions not listed as revertible make the bundle
/// not applicable; they are not errors. Only internal backend failures are returned as `Err`.
/// Returns the post-bundle state alongside the result when the bundle is applicable.
pub fn simulate_bundle<A: ExecutionAdapter>(
    adapter: &A,
    state: &A::State,
    env: &BlockEnv,
    bundle: &DecodedBundle,
) -> Result<(SimulatedBundle, Option<A::State>), ExecutionFailure> {
    let mut current = state.clone();
    let mut gas_used = 0u64;
    let mut profit = U256::ZERO;

    for (i, tx) in bundle.txs.iter().enumerate() {
        let executed = match adapter.execute(&current, tx, env) {
            Ok(executed) => executed,
            Err(err) if err.is_invalid_tx_err() => {
                trace!(target: "builder::bundles", bundle = %bundle.hash(), position = i, %err, "Bundle tx invalid");
                return Ok((SimulatedBundle::not_applicable(bundle.bundle.clone()), None));
            }
            Err(err) => return Err(err),
        };

        if !executed.success && !bundle.bundle.can_revert(i) {
            trace!(target: "builder::bundles", bundle = %bundle.hash(), position = i, "Bundle tx reverted");
            return Ok((SimulatedBundle::not_applicable(bundle.bundle.clone()), None));
        }

        let tip = tx.effective_tip_per_gas(env.base_fee).unwrap_or_default();
        profit += U256::from(tip) * U256::from(executed.gas_used);
        gas_used += executed.gas_used;
        current = executed.state;
    }

    let simulated = SimulatedBundle { bundle: bundle.bundle.clone(), gas_used, profit, applicable: true };
    Ok((simulated, Some(current)))
}

/// Memoizes bundle simulations per state snapshot.
///
/// Entries are grouped by [`SnapshotId`] and only the most recently used snapshots are
/// kept. Results for a snapshot live in a [`DashMap`] so parallel simulations against the
/// same snapshot do not serialize on the outer lock.
pub struct BundleSimulationCache {
    snapshots: Mutex<LruCache<SnapshotId, Arc<DashMap<B256, SimulatedBundle>>>>,
    metrics: BundleCacheMetrics,
}

impl BundleSimulationCache {
    pub fn new(snapshots: NonZeroUsize) -> Self {
        Self { snapshots: Mutex::new(LruCache::new(snapshots)), metrics: Default::default() }
    }

    pub fn get(&self, bundle: &B256, snapshot: SnapshotId) -> Option<SimulatedBundle> {
        let entries = self.snapshots.lock().get(&snapshot).cloned()?;
        entries.get(bundle).map(|sim| sim.clone())
    }

    pub fn insert(&self, snapshot: SnapshotId, simulated: SimulatedBundle) {
        self.entries(snapshot).insert(simulated.bundle.hash, simulated);
    }

    /// Returns the cached result for `bundle` on `state`, simulating and storing it on a miss.
    ///
    /// A hit returns the stored result as is: the key is the snapshot identity, not the
    /// state contents.
    pub fn simulate<A: ExecutionAdapter>(
        &self,
        adapter: &A,
        state: &A::State,
        env: &BlockEnv,
        bundle: &DecodedBundle,
    ) -> Result<SimulatedBundle, ExecutionFailure> {
        let snapshot = adapter.snapshot(state);
        let entries = self.entries(snapshot);

        if let Some(hit) = entries.get(&bundle.hash()) {
            self.metrics.hits.increment(1);
            return Ok(hit.clone());
        }

        self.metrics.misses.increment(1);
        let (simulated, _) = simulate_bundle(adapter, state, env, bundle)?;
        trace!(
            target: "builder::bundles",
            bundle = %bundle.hash(),
            snapshot = %snapshot.0,
            applicable = simulated.applicable,
            gas_used = simulated.gas_used,
            "Simulated bundle"
        );
        entries.insert(bundle.hash(), simulated.clone());
        Ok(simulated)
    }

    /// Number of snapshots with cached simulations.
    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self, snapshot: SnapshotId) -> Arc<DashMap<B256, SimulatedBundle>> {
        self.snapshots.lock().get_or_insert(snapshot, Default::default).clone()
    }
}

impl Default for BundleSimulationCache {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_CACHED_SNAPSHOTS).unwrap_or(NonZeroUsize::MIN))
    }
}

impl core::fmt::Debug for BundleSimulationCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BundleSimulationCache").field("snapshots", &self.len()).finish_non_exhaustive()
    }
}

/// Metrics for the bundle simulation cache.
pub(crate) struct BundleCacheMetrics {
    pub(crate) hits: Counter,
    pub(crate) misses: Counter,
}

impl Default for BundleCacheMetrics {
    fn default() -> Self {
        Self {
            hits: metrics::counter!("builder.bundles.cache_hits"),
            misses: metrics::counter!("builder.bundles.cache_misses"),
        }
    }
}
