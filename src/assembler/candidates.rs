use std::{
    cmp::Ordering,
    collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque},
};

use alloy_consensus::Transaction;
use revm_primitives::{Address, U256, alloy_primitives::TxHash};

use crate::{
    bundles::DecodedBundle,
    common::RecoveredTx,
    constraints::DecodedConstraint,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CandidateKind {
    Tx { sender: Address, nonce: u64 },
    Bundle(usize),
}

/// Heap entry. Higher score first, then earlier arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub(crate) score: U256,
    pub(crate) arrival: u64,
    seq: u64,
    pub(crate) kind: CandidateKind,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| other.arrival.cmp(&self.arrival))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PoolTx {
    pub(crate) tx: RecoveredTx,
    pub(crate) arrival: u64,
    pub(crate) tip: u128,
}

#[derive(Debug, Clone)]
pub(crate) struct BundleCandidate {
    pub(crate) bundle: DecodedBundle,
    pub(crate) arrival: u64,
    pub(crate) score: U256,
    pub(crate) gas_used: u64,
}

/// Work that must land before ordinary candidates.
#[derive(Debug)]
pub(crate) enum Mandatory {
    Constraint(DecodedConstraint),
    /// A pool transaction a pending constraint's sender needs first.
    Prerequisite(PoolTx),
}

/// A candidate taken off the heap.
#[derive(Debug)]
pub(crate) enum Picked {
    Tx(PoolTx),
    Bundle(usize),
}

enum Lowest {
    Pool(u64),
    Indexed,
    Unindexed(usize),
}

/// Pending constraints plus the competing transactions and bundles of one attempt.
#[derive(Debug, Default)]
pub(crate) struct OrderBook {
    indexed: VecDeque<DecodedConstraint>,
    unindexed: Vec<DecodedConstraint>,
    constrained_hashes: HashSet<TxHash>,
    constrained_nonces: HashSet<(Address, u64)>,
    pool: HashMap<Address, BTreeMap<u64, PoolTx>>,
    bundles: Vec<Option<BundleCandidate>>,
    heap: BinaryHeap<Candidate>,
    deferred: Vec<Candidate>,
    seq: u64,
    base_fee: u64,
}

impl OrderBook {
    /// `indexed` must be sorted by index.
    pub(crate) fn new(indexed: Vec<DecodedConstraint>, unindexed: Vec<DecodedConstraint>, base_fee: u64) -> Self {
        let mut book = Self { base_fee, ..Default::default() };
        for constraint in indexed.iter().chain(unindexed.iter()) {
            book.constrained_hashes.insert(constraint.hash());
            book.constrained_nonces.insert((constraint.tx.signer(), constraint.tx.nonce()));
        }
        book.indexed = indexed.into();
        book.unindexed = unindexed;
        book
    }

    /// Adds a pool transaction. Transactions already promised by a constraint, or that
    /// would take a constrained nonce, and those that cannot pay the base fee are ignored.
    pub(crate) fn add_transaction(&mut self, tx: RecoveredTx, arrival: u64) -> bool {
        let sender = tx.signer();
        if self.constrained_hashes.contains(tx.inner().tx_hash())
            || self.constrained_nonces.contains(&(sender, tx.nonce()))
        {
            return false;
        }
        let Some(tip) = tx.effective_tip_per_gas(self.base_fee) else { return false };

        let by_nonce = self.pool.entry(sender).or_default();
        match by_nonce.get(&tx.nonce()) {
            Some(existing) if existing.tip >= tip => false,
            _ => {
                by_nonce.insert(tx.nonce(), PoolTx { tx, arrival, tip });
                true
            }
        }
    }

    /// Adds a simulated bundle, unless it touches a pending constraint.
    pub(crate) fn add_bundle(&mut self, bundle: DecodedBundle, arrival: u64, score: U256, gas_used: u64) -> bool {
        if self.conflicts_with_constraints(&bundle) {
            return false;
        }
        let idx = self.bundles.len();
        self.bundles.push(Some(BundleCandidate { bundle, arrival, score, gas_used }));
        self.push(score, arrival, CandidateKind::Bundle(idx));
        true
    }

    /// Queues the head of every sender. Call once all transactions are added.
    pub(crate) fn seed(&mut self) {
        let senders: Vec<_> = self.pool.keys().copied().collect();
        for sender in senders {
            self.push_head(sender);
        }
    }

    pub(crate) fn conflicts_with_constraints(&self, bundle: &DecodedBundle) -> bool {
        bundle.txs.iter().any(|tx| {
            self.constrained_hashes.contains(tx.inner().tx_hash())
                || self.constrained_nonces.contains(&(tx.signer(), tx.nonce()))
        })
    }

    pub(crate) fn next_indexed(&self) -> Option<&DecodedConstraint> {
        self.indexed.front()
    }

    pub(crate) fn pop_indexed(&mut self) -> Option<DecodedConstraint> {
        let constraint = self.indexed.pop_front()?;
        self.forget(&constraint);
        Some(constraint)
    }

    /// Gas that must stay available for the constraints still pending.
    pub(crate) fn reserved_gas(&self) -> u64 {
        self.indexed.iter().chain(self.unindexed.iter()).map(|c| c.tx.gas_limit()).sum()
    }

    /// Removes and returns every constraint still pending, pinned ones first.
    pub(crate) fn drain_constraints(&mut self) -> Vec<DecodedConstraint> {
        let pending: Vec<_> = self.indexed.drain(..).chain(self.unindexed.drain(..)).collect();
        self.constrained_hashes.clear();
        self.constrained_nonces.clear();
        pending
    }

    /// Next piece of work that cannot wait for the competitive merge.
    ///
    /// For every sender with a pending constraint, the lowest nonce it still needs is
    /// either an unpinned constraint, a plain transaction from the pool, or a pinned
    /// constraint, which has to wait for its position.
    pub(crate) fn next_mandatory(&mut self) -> Option<Mandatory> {
        let senders: Vec<_> =
            self.indexed.iter().chain(self.unindexed.iter()).map(|c| (c.tx.signer(), c.tx.nonce())).collect();

        for (sender, nonce) in senders {
            let Some(lowest) = self.lowest(sender, nonce) else { continue };
            match lowest {
                Lowest::Indexed => continue,
                Lowest::Unindexed(i) => {
                    let constraint = self.unindexed.remove(i);
                    self.forget(&constraint);
                    return Some(Mandatory::Constraint(constraint));
                }
                Lowest::Pool(pool_nonce) => {
                    let pool_tx = self.pool.get_mut(&sender)?.remove(&pool_nonce)?;
                    return Some(Mandatory::Prerequisite(pool_tx));
                }
            }
        }
        None
    }

    /// The lowest-nonce item `sender` still needs, at or below `nonce`.
    fn lowest(&self, sender: Address, nonce: u64) -> Option<Lowest> {
        let mut lowest: Option<(u64, Lowest)> = None;
        let mut consider = |candidate_nonce: u64, item: Lowest| {
            if candidate_nonce <= nonce && lowest.as_ref().is_none_or(|(n, _)| candidate_nonce < *n) {
                lowest = Some((candidate_nonce, item));
            }
        };

        if let Some((pool_nonce, _)) = self.pool.get(&sender).and_then(|txs| txs.first_key_value()) {
            consider(*pool_nonce, Lowest::Pool(*pool_nonce));
        }
        for c in self.indexed.iter().filter(|c| c.tx.signer() == sender) {
            consider(c.tx.nonce(), Lowest::Indexed);
        }
        for (i, c) in self.unindexed.iter().enumerate().filter(|(_, c)| c.tx.signer() == sender) {
            consider(c.tx.nonce(), Lowest::Unindexed(i));
        }

        lowest.map(|(_, item)| item)
    }

    /// Pops the best candidate that fits in `available` gas and `slots` positions.
    ///
    /// Stale heap entries are skipped. A sender whose next transaction does not fit is
    /// dropped, and bundles longer than `slots` are set aside until [`Self::restore_deferred`].
    pub(crate) fn take_best(&mut self, available: u64, slots: Option<u64>) -> Option<Picked> {
        while let Some(candidate) = self.heap.pop() {
            match candidate.kind {
                CandidateKind::Tx { sender, nonce } => {
                    if self.blocked(sender, nonce) {
                        continue;
                    }
                    let Some(by_nonce) = self.pool.get_mut(&sender) else { continue };
                    if by_nonce.first_key_value().map(|(n, _)| *n) != Some(nonce) {
                        continue;
                    }
                    let Some(pool_tx) = by_nonce.remove(&nonce) else { continue };
                    if pool_tx.tx.gas_limit() > available {
                        self.pool.remove(&sender);
                        continue;
                    }
                    return Some(Picked::Tx(pool_tx));
                }
                CandidateKind::Bundle(idx) => {
                    let Some(Some(bundle)) = self.bundles.get(idx) else { continue };
                    if bundle.gas_used > available || bundle.bundle.max_tx_gas_limit() > available {
                        self.bundles[idx] = None;
                        continue;
                    }
                    if slots.is_some_and(|slots| bundle.bundle.txs.len() as u64 > slots) {
                        self.deferred.push(candidate);
                        continue;
                    }
                    return Some(Picked::Bundle(idx));
                }
            }
        }
        None
    }

    pub(crate) fn bundle(&self, idx: usize) -> Option<&BundleCandidate> {
        self.bundles.get(idx).and_then(Option::as_ref)
    }

    pub(crate) fn remove_bundle(&mut self, idx: usize) -> Option<BundleCandidate> {
        self.bundles.get_mut(idx).and_then(Option::take)
    }

    /// Puts a bundle back with a refreshed score.
    pub(crate) fn requeue_bundle(&mut self, idx: usize, score: U256, gas_used: u64) {
        let Some(Some(bundle)) = self.bundles.get_mut(idx) else { return };
        bundle.score = score;
        bundle.gas_used = gas_used;
        let arrival = bundle.arrival;
        self.push(score, arrival, CandidateKind::Bundle(idx));
    }

    pub(crate) fn peek_score(&self) -> Option<U256> {
        self.heap.peek().map(|c| c.score)
    }

    pub(crate) fn restore_deferred(&mut self) {
        self.heap.extend(self.deferred.drain(..));
    }

    /// Forgets everything `sender` has at or below `nonce` and queues its next transaction.
    pub(crate) fn on_committed(&mut self, sender: Address, nonce: u64) {
        if let Some(by_nonce) = self.pool.get_mut(&sender) {
            *by_nonce = by_nonce.split_off(&nonce.saturating_add(1));
        }
        self.push_head(sender);
    }

    pub(crate) fn drop_sender(&mut self, sender: Address) {
        self.pool.remove(&sender);
    }

    /// Queues the lowest pool transaction of `sender`, unless a constraint must come first.
    pub(crate) fn push_head(&mut self, sender: Address) {
        let Some((nonce, pool_tx)) = self.pool.get(&sender).and_then(|txs| txs.first_key_value()) else { return };
        let (nonce, tip, arrival) = (*nonce, pool_tx.tip, pool_tx.arrival);
        if self.blocked(sender, nonce) {
            return;
        }
        self.push(U256::from(tip), arrival, CandidateKind::Tx { sender, nonce });
    }

    fn blocked(&self, sender: Address, nonce: u64) -> bool {
        self.indexed.iter().chain(self.unindexed.iter()).any(|c| c.tx.signer() == sender && c.tx.nonce() < nonce)
    }

    fn push(&mut self, score: U256, arrival: u64, kind: CandidateKind) {
        self.seq += 1;
        self.heap.push(Candidate { score, arrival, seq: self.seq, kind });
    }

    fn forget(&mut self, constraint: &DecodedConstraint) {
        self.constrained_hashes.remove(&constraint.hash());
        self.constrained_nonces.remove(&(constraint.tx.signer(), constraint.tx.nonce()));
    }
}
