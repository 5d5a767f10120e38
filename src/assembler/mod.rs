use std::{sync::Arc, time::Instant};

use alloy_consensus::{
    EMPTY_OMMER_ROOT_HASH, Header, Transaction, TxEnvelope,
    proofs::{self, ordered_trie_root_with_encoder},
};
use alloy_eips::{
    eip1559::{BaseFeeParams, calc_next_block_base_fee},
    merge::BEACON_NONCE,
};
use alloy_rlp::Encodable;
use metrics::{Counter, Histogram};
use rayon::prelude::*;
use revm_primitives::{U256, alloy_primitives::TxHash};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub use crate::assembler::{
    error::{BuildError, ViolationReason},
    types::{
        BuildSummary, BuiltBlock, ConstraintPolicy, GenerateParams, OnBlock, Order, OrderWithArrival, Receipt,
    },
};
use crate::{
    assembler::{
        candidates::{Mandatory, OrderBook, Picked, PoolTx},
        types::Environment,
    },
    bundles::{BundleSimulationCache, DecodedBundle},
    common::{MIN_TRANSACTION_GAS, RecoveredTx},
    constraints::{ConstraintCache, DecodedConstraint, HashToConstraintDecoded},
    execution::{BlockEnv, ExecutionAdapter, ExecutionFailure},
};

mod candidates;
mod error;
pub mod types;

/// Builds blocks that honor the constraints of a slot and maximize priority fees.
pub struct BlockAssembler<A> {
    adapter: Arc<A>,
    constraints: Arc<ConstraintCache>,
    bundle_cache: Arc<BundleSimulationCache>,
    policy: ConstraintPolicy,
    metrics: AssemblerMetrics,
}

impl<A> core::fmt::Debug for BlockAssembler<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockAssembler").field("policy", &self.policy).finish_non_exhaustive()
    }
}

impl<A: ExecutionAdapter> BlockAssembler<A> {
    pub fn new(adapter: Arc<A>, constraints: Arc<ConstraintCache>, bundle_cache: Arc<BundleSimulationCache>) -> Self {
        Self { adapter, constraints, bundle_cache, policy: ConstraintPolicy::default(), metrics: Default::default() }
    }

    pub fn with_policy(mut self, policy: ConstraintPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    /// Builds a block for `params`, honoring the cached constraints of `params.slot`.
    pub fn assemble(
        &self,
        params: &GenerateParams,
        orders: &[OrderWithArrival],
        cancel: &CancellationToken,
    ) -> Result<BuiltBlock, BuildError> {
        let constraints = params.slot.and_then(|slot| self.constraints.get(slot));
        self.assemble_with(params, constraints.as_deref(), orders, cancel)
    }

    /// Builds a block for `params` with an explicit constraint set.
    pub fn assemble_with(
        &self,
        params: &GenerateParams,
        constraints: Option<&HashToConstraintDecoded>,
        orders: &[OrderWithArrival],
        cancel: &CancellationToken,
    ) -> Result<BuiltBlock, BuildError> {
        let start = Instant::now();
        info!(target: "builder::assembler", parent = %params.parent_hash, slot = ?params.slot, "Assembling block");

        let parent =
            self.adapter.parent_header(params.parent_hash)?.ok_or(BuildError::InvalidParent(params.parent_hash))?;

        let mut timestamp = params.timestamp;
        if timestamp <= parent.timestamp {
            if params.force_timestamp {
                return Err(BuildError::InvalidTimestamp { timestamp, parent: parent.timestamp });
            }
            timestamp = parent.timestamp + 1;
        }

        let base_fee = calc_next_block_base_fee(
            parent.gas_used,
            parent.gas_limit,
            parent.base_fee_per_gas.unwrap_or_default(),
            BaseFeeParams::ethereum(),
        );

        let block_env = BlockEnv {
            number: parent.number + 1,
            timestamp,
            coinbase: params.coinbase,
            base_fee,
            gas_limit: params.gas_limit,
            prev_randao: params.random,
        };
        let state = self.adapter.state_at(params.parent_hash)?;
        let mut env = Environment::new(block_env, state);

        if !params.no_transactions {
            self.fill(&mut env, constraints, orders, cancel)?;
        }

        let block = self.seal(env, &parent, params)?;

        let elapsed = start.elapsed();
        self.metrics.blocks_built.increment(1);
        self.metrics.assembly_duration.record(elapsed.as_secs_f64());
        info!(
            target: "builder::assembler",
            number = block.header.number,
            txs = block.transactions.len(),
            gas_used = block.header.gas_used,
            profit = %block.profit,
            elapsed = ?elapsed,
            "Sealed block"
        );

        if let Some(on_block) = &params.on_block {
            on_block(&block);
        }

        Ok(block)
    }

    /// Runs the constraint pass and the competitive merge on `env`.
    fn fill(
        &self,
        env: &mut Environment<A::State>,
        constraints: Option<&HashToConstraintDecoded>,
        orders: &[OrderWithArrival],
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        let (indexed, unindexed) = partition(constraints);

        // unpinned constraints that do not fit are reported one by one as violations
        let required: u64 = indexed.iter().map(|c| c.tx.gas_limit()).sum();
        if required > env.block_env.gas_limit {
            return Err(BuildError::InsufficientGas { required, gas_limit: env.block_env.gas_limit });
        }

        let mut book = OrderBook::new(indexed, unindexed, env.block_env.base_fee);
        self.score_orders(env, &mut book, orders)?;

        loop {
            if cancel.is_cancelled() {
                debug!(target: "builder::assembler", gas_used = env.gas_used, "Build cancelled");
                return Err(BuildError::Cancelled { gas_used: env.gas_used, gas_limit: env.block_env.gas_limit });
            }

            let position = env.position();

            if let Some(index) = book.next_indexed().and_then(|c| c.index) {
                if index <= position {
                    let Some(constraint) = book.pop_indexed() else { continue };
                    if index < position {
                        self.violation(&mut book, &constraint, ViolationReason::PositionTaken { index })?;
                    } else {
                        self.commit_constraint(env, &mut book, constraint)?;
                    }
                    book.restore_deferred();
                    continue;
                }
            }

            if let Some(work) = book.next_mandatory() {
                match work {
                    Mandatory::Constraint(constraint) => self.commit_constraint(env, &mut book, constraint)?,
                    Mandatory::Prerequisite(pool_tx) => self.commit_pool_tx(env, &mut book, pool_tx)?,
                }
                continue;
            }

            let available = env.remaining_gas().saturating_sub(book.reserved_gas());
            if available < MIN_TRANSACTION_GAS {
                break;
            }
            let slots = book.next_indexed().and_then(|c| c.index).map(|index| index - position);

            match book.take_best(available, slots) {
                Some(Picked::Tx(pool_tx)) => self.commit_pool_tx(env, &mut book, pool_tx)?,
                Some(Picked::Bundle(idx)) => self.commit_bundle(env, &mut book, idx, available)?,
                None => break,
            }
        }

        let transactions = env.position();
        for constraint in book.drain_constraints() {
            let reason = match constraint.index {
                Some(index) => ViolationReason::PositionUnreachable { index, transactions },
                None => ViolationReason::NonceGap { nonce: constraint.tx.nonce() },
            };
            self.violation(&mut book, &constraint, reason)?;
        }

        Ok(())
    }

    /// Loads plain transactions and simulated bundles into `book`.
    ///
    /// Bundles are decoded and simulated against the parent state in parallel; bundles that
    /// fail to decode, are not applicable or pay nothing are left out.
    fn score_orders(
        &self,
        env: &Environment<A::State>,
        book: &mut OrderBook,
        orders: &[OrderWithArrival],
    ) -> Result<(), BuildError> {
        let mut bundles = vec![];
        for order in orders {
            match &order.order {
                Order::Tx(tx) => {
                    book.add_transaction(tx.clone(), order.arrival);
                }
                Order::Bundle(bundle) => match bundle.clone().decode() {
                    Ok(decoded) => bundles.push((order.arrival, decoded)),
                    Err(err) => debug!(target: "builder::assembler", bundle = %bundle.hash, %err, "Invalid bundle"),
                },
            }
        }
        book.seed();

        let adapter = &*self.adapter;
        let simulated = bundles
            .par_iter()
            .map(|(_, bundle)| self.bundle_cache.simulate(adapter, &env.state, &env.block_env, bundle))
            .collect::<Result<Vec<_>, _>>()?;

        for ((arrival, bundle), sim) in bundles.into_iter().zip(simulated) {
            if !sim.applicable || sim.profit.is_zero() {
                trace!(target: "builder::assembler", bundle = %bundle.hash(), "Skipping bundle");
                continue;
            }
            if !book.add_bundle(bundle, arrival, sim.score(), sim.gas_used) {
                debug!(target: "builder::assembler", bundle = %sim.bundle.hash, "Bundle conflicts with constraints");
            }
        }

        Ok(())
    }

    fn commit_constraint(
        &self,
        env: &mut Environment<A::State>,
        book: &mut OrderBook,
        constraint: DecodedConstraint,
    ) -> Result<(), BuildError> {
        let required = constraint.tx.gas_limit();
        if required > env.remaining_gas() {
            let available = env.remaining_gas();
            return self.violation(book, &constraint, ViolationReason::GasExhausted { required, available });
        }

        match self.execute(env, &constraint.tx) {
            Ok(()) => {
                trace!(
                    target: "builder::assembler",
                    hash = %constraint.hash(),
                    position = env.position() - 1,
                    "Included constraint"
                );
                book.on_committed(constraint.tx.signer(), constraint.tx.nonce());
                Ok(())
            }
            Err(err) if err.is_invalid_tx_err() => self.violation(book, &constraint, ViolationReason::Execution(err)),
            Err(err) => Err(err.into()),
        }
    }

    fn commit_pool_tx(
        &self,
        env: &mut Environment<A::State>,
        book: &mut OrderBook,
        pool_tx: PoolTx,
    ) -> Result<(), BuildError> {
        let sender = pool_tx.tx.signer();
        let nonce = pool_tx.tx.nonce();
        if pool_tx.tx.gas_limit() > env.remaining_gas() {
            book.drop_sender(sender);
            return Ok(());
        }

        match self.execute(env, &pool_tx.tx) {
            Ok(()) => book.on_committed(sender, nonce),
            Err(ExecutionFailure::InvalidNonce { got, expected }) if got < expected => {
                trace!(target: "builder::assembler", %sender, nonce, "Skipping stale transaction");
                book.push_head(sender);
            }
            Err(err) if err.is_invalid_tx_err() => {
                trace!(target: "builder::assembler", %sender, nonce, %err, "Dropping sender");
                book.drop_sender(sender);
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Re-simulates a bundle on the current state and applies it if it is still worth it.
    fn commit_bundle(
        &self,
        env: &mut Environment<A::State>,
        book: &mut OrderBook,
        idx: usize,
        available: u64,
    ) -> Result<(), BuildError> {
        let Some(candidate) = book.bundle(idx) else { return Ok(()) };
        let (bundle, previous_score) = (candidate.bundle.clone(), candidate.score);

        if bundle.txs.iter().any(|tx| env.applied.contains(tx.inner().tx_hash())) {
            debug!(target: "builder::assembler", bundle = %bundle.hash(), "Bundle overlaps included transactions");
            book.remove_bundle(idx);
            return Ok(());
        }

        let sim = self.bundle_cache.simulate(&*self.adapter, &env.state, &env.block_env, &bundle)?;
        if !sim.applicable || sim.profit.is_zero() || sim.gas_used > available {
            debug!(target: "builder::assembler", bundle = %bundle.hash(), "Discarding bundle");
            book.remove_bundle(idx);
            return Ok(());
        }

        let score = sim.score();
        if score < previous_score && book.peek_score().is_some_and(|top| top > score) {
            book.requeue_bundle(idx, score, sim.gas_used);
            return Ok(());
        }

        book.remove_bundle(idx);
        if !self.apply_bundle(env, &bundle, available)? {
            debug!(target: "builder::assembler", bundle = %bundle.hash(), "Bundle failed on the current state");
            return Ok(());
        }

        for tx in &bundle.txs {
            book.on_committed(tx.signer(), tx.nonce());
        }
        debug!(
            target: "builder::assembler",
            bundle = %bundle.hash(),
            txs = bundle.txs.len(),
            gas_used = sim.gas_used,
            "Included bundle"
        );
        Ok(())
    }

    /// Executes every transaction of `bundle` on a copy of the current state and commits
    /// them together. Returns false, leaving `env` untouched, if any of them fails or has a
    /// gas limit above what is left of `available`.
    fn apply_bundle(
        &self,
        env: &mut Environment<A::State>,
        bundle: &DecodedBundle,
        available: u64,
    ) -> Result<bool, BuildError> {
        let mut state = env.state.clone();
        let mut executed = Vec::with_capacity(bundle.txs.len());
        let mut gas_used = 0u64;

        for (i, tx) in bundle.txs.iter().enumerate() {
            if tx.gas_limit() > available.saturating_sub(gas_used) {
                return Ok(false);
            }
            let result = match self.adapter.execute(&state, tx, &env.block_env) {
                Ok(result) => result,
                Err(err) if err.is_invalid_tx_err() => return Ok(false),
                Err(err) => return Err(err.into()),
            };
            if !result.success && !bundle.bundle.can_revert(i) {
                return Ok(false);
            }
            gas_used += result.gas_used;
            executed.push((result.success, result.gas_used));
            state = result.state;
        }

        for (tx, (success, gas_used)) in bundle.txs.iter().zip(executed) {
            env.record(tx.clone(), success, gas_used);
        }
        env.state = state;
        Ok(true)
    }

    fn execute(&self, env: &mut Environment<A::State>, tx: &RecoveredTx) -> Result<(), ExecutionFailure> {
        let executed = self.adapter.execute(&env.state, tx, &env.block_env)?;
        env.record(tx.clone(), executed.success, executed.gas_used);
        env.state = executed.state;
        Ok(())
    }

    /// Fails the attempt, or drops the constraint and carries on under [`ConstraintPolicy::BestEffort`].
    fn violation(
        &self,
        book: &mut OrderBook,
        constraint: &DecodedConstraint,
        reason: ViolationReason,
    ) -> Result<(), BuildError> {
        let hash: TxHash = constraint.hash();
        match self.policy {
            ConstraintPolicy::Strict => {
                self.metrics.constraint_violations.increment(1);
                warn!(target: "builder::assembler", %hash, %reason, "Constraint violated");
                Err(BuildError::ConstraintViolation { hash, reason })
            }
            ConstraintPolicy::BestEffort => {
                self.metrics.dropped_constraints.increment(1);
                warn!(target: "builder::assembler", %hash, %reason, "Dropping constraint");
                book.push_head(constraint.tx.signer());
                Ok(())
            }
        }
    }

    fn seal(
        &self,
        env: Environment<A::State>,
        parent: &Header,
        params: &GenerateParams,
    ) -> Result<BuiltBlock, BuildError> {
        let state_root = self.adapter.state_root(&env.state)?;

        let transactions: Vec<TxEnvelope> = env.txs.iter().map(|tx| tx.inner().clone()).collect();
        let transactions_root = proofs::calculate_transaction_root(&transactions);
        let receipts_root = ordered_trie_root_with_encoder(&env.receipts, |r, buf| r.encode(buf));

        let header = Header {
            parent_hash: params.parent_hash,
            ommers_hash: EMPTY_OMMER_ROOT_HASH,
            beneficiary: env.block_env.coinbase,
            state_root,
            transactions_root,
            receipts_root,
            timestamp: env.block_env.timestamp,
            mix_hash: env.block_env.prev_randao,
            nonce: BEACON_NONCE.into(),
            base_fee_per_gas: Some(env.block_env.base_fee),
            number: parent.number + 1,
            gas_limit: env.block_env.gas_limit,
            gas_used: env.gas_used,
            ..Default::default()
        };

        Ok(BuiltBlock { header, transactions: env.txs, receipts: env.receipts, profit: env.profit })
    }
}

/// Splits constraints into pinned ones, sorted by index, and the rest.
fn partition(constraints: Option<&HashToConstraintDecoded>) -> (Vec<DecodedConstraint>, Vec<DecodedConstraint>) {
    let Some(constraints) = constraints else { return (vec![], vec![]) };

    let (mut indexed, mut unindexed): (Vec<_>, Vec<_>) =
        constraints.values().cloned().partition(|c| c.index.is_some());
    indexed.sort_by_key(|c| (c.index, c.hash()));
    unindexed.sort_by_key(|c| (c.tx.signer(), c.tx.nonce(), c.hash()));

    debug!(target: "builder::assembler", indexed = indexed.len(), unindexed = unindexed.len(), "Partitioned constraints");
    (indexed, unindexed)
}

/// Metrics for block assembly.
pub(crate) struct AssemblerMetrics {
    pub(crate) blocks_built: Counter,
    /// Attempts aborted because a constraint could not be honored.
    pub(crate) constraint_violations: Counter,
    /// Constraints left out under the best-effort policy.
    pub(crate) dropped_constraints: Counter,
    pub(crate) assembly_duration: Histogram,
}

impl Default for AssemblerMetrics {
    fn default() -> Self {
        Self {
            blocks_built: metrics::counter!("builder.assembler.blocks_built"),
            constraint_violations: metrics::counter!("builder.assembler.constraint_violations"),
            dropped_constraints: metrics::counter!("builder.assembler.dropped_constraints"),
            assembly_duration: metrics::histogram!("builder.assembler.assembly_duration"),
        }
    }
}
