use std::{collections::HashSet, sync::Arc};

use alloy_consensus::{Block, BlockBody, Header, Transaction, TxEnvelope};
use alloy_rlp::RlpEncodable;
use revm_primitives::{Address, B256, U256, alloy_primitives::TxHash};
use serde::{Deserialize, Serialize};

use crate::{bundles::Bundle, common::RecoveredTx, common::Slot, execution::BlockEnv};

/// What to do when a constraint cannot be honored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConstraintPolicy {
    /// Abort the attempt with [`crate::assembler::BuildError::ConstraintViolation`].
    #[default]
    Strict,
    /// Leave the constraint out, log it and keep building.
    BestEffort,
}

/// A candidate for the competitive part of the block.
#[derive(Debug, Clone)]
pub enum Order {
    Tx(RecoveredTx),
    Bundle(Bundle),
}

/// An [`Order`] tagged with its arrival sequence, used to break profit ties.
#[derive(Debug, Clone)]
pub struct OrderWithArrival {
    pub arrival: u64,
    pub order: Order,
}

impl OrderWithArrival {
    pub fn tx(arrival: u64, tx: RecoveredTx) -> Self {
        Self { arrival, order: Order::Tx(tx) }
    }

    pub fn bundle(arrival: u64, bundle: Bundle) -> Self {
        Self { arrival, order: Order::Bundle(bundle) }
    }
}

/// Called with every sealed block.
pub type OnBlock = Arc<dyn Fn(&BuiltBlock) + Send + Sync>;

/// Request to build a block on top of `parent_hash`.
#[derive(Clone, Default)]
pub struct GenerateParams {
    pub parent_hash: B256,
    pub timestamp: u64,
    pub coinbase: Address,
    pub random: B256,
    pub gas_limit: u64,
    /// Slot whose constraints must be honored, if any.
    pub slot: Option<Slot>,
    /// Seal an empty block without looking at any order.
    pub no_transactions: bool,
    /// Fail instead of bumping a timestamp that is not after the parent's.
    pub force_timestamp: bool,
    pub on_block: Option<OnBlock>,
}

impl core::fmt::Debug for GenerateParams {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GenerateParams")
            .field("parent_hash", &self.parent_hash)
            .field("timestamp", &self.timestamp)
            .field("coinbase", &self.coinbase)
            .field("gas_limit", &self.gas_limit)
            .field("slot", &self.slot)
            .field("no_transactions", &self.no_transactions)
            .field("force_timestamp", &self.force_timestamp)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable)]
pub struct Receipt {
    pub success: bool,
    pub cumulative_gas_used: u64,
    pub gas_used: u64,
}

/// A sealed block and the priority fees it pays to the coinbase.
#[derive(Debug, Clone)]
pub struct BuiltBlock {
    pub header: Header,
    pub transactions: Vec<RecoveredTx>,
    pub receipts: Vec<Receipt>,
    pub profit: U256,
}

impl BuiltBlock {
    pub fn summary(&self) -> BuildSummary {
        BuildSummary {
            gas_used: self.header.gas_used,
            gas_limit: self.header.gas_limit,
            transactions: self.transactions.len(),
            profit: self.profit,
        }
    }

    pub fn hash(&self) -> B256 {
        self.header.hash_slow()
    }

    pub fn into_block(self) -> Block<TxEnvelope> {
        let transactions = self.transactions.into_iter().map(|tx| tx.into_parts().0).collect();
        Block::new(self.header, BlockBody { transactions, ommers: vec![], withdrawals: None })
    }
}

/// What the recommit loop needs to know about a finished attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub gas_used: u64,
    pub gas_limit: u64,
    pub transactions: usize,
    pub profit: U256,
}

impl BuildSummary {
    pub fn fill_ratio(&self) -> f64 {
        if self.gas_limit == 0 { 0.0 } else { self.gas_used as f64 / self.gas_limit as f64 }
    }
}

/// The in-progress block of a single attempt.
pub(crate) struct Environment<S> {
    pub(crate) block_env: BlockEnv,
    pub(crate) state: S,
    pub(crate) gas_used: u64,
    pub(crate) txs: Vec<RecoveredTx>,
    pub(crate) receipts: Vec<Receipt>,
    pub(crate) applied: HashSet<TxHash>,
    pub(crate) profit: U256,
}

impl<S> Environment<S> {
    pub(crate) fn new(block_env: BlockEnv, state: S) -> Self {
        Self {
            block_env,
            state,
            gas_used: 0,
            txs: vec![],
            receipts: vec![],
            applied: HashSet::new(),
            profit: U256::ZERO,
        }
    }

    pub(crate) fn position(&self) -> u64 {
        self.txs.len() as u64
    }

    pub(crate) fn remaining_gas(&self) -> u64 {
        self.block_env.gas_limit.saturating_sub(self.gas_used)
    }

    /// Appends an executed transaction. The caller moves the state forward.
    pub(crate) fn record(&mut self, tx: RecoveredTx, success: bool, gas_used: u64) {
        let tip = tx.effective_tip_per_gas(self.block_env.base_fee).unwrap_or_default();
        self.gas_used += gas_used;
        self.profit += U256::from(tip) * U256::from(gas_used);
        self.receipts.push(Receipt { success, cumulative_gas_used: self.gas_used, gas_used });
        self.applied.insert(*tx.inner().tx_hash());
        self.txs.push(tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_ratio() {
        let summary = BuildSummary { gas_used: 15, gas_limit: 60, ..Default::default() };
        assert_eq!(summary.fill_ratio(), 0.25);
        assert_eq!(BuildSummary::default().fill_ratio(), 0.0);
    }
}
