//! The execution capability the builder consumes.
//!
//! Chain state and EVM execution live outside this crate. The assembler only needs to
//! look up a parent, take cheap copy-on-write states, and apply one transaction at a time.

use alloy_consensus::Header;
use revm_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::common::RecoveredTx;

/// Opaque identity of a point-in-time copy of chain state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(pub B256);

/// Block-level values a transaction executes against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEnv {
    pub number: u64,
    pub timestamp: u64,
    pub coinbase: Address,
    pub base_fee: u64,
    pub gas_limit: u64,
    pub prev_randao: B256,
}

/// Result of applying a single transaction.
#[derive(Debug, Clone)]
pub struct Executed<S> {
    /// State after the transaction was applied.
    pub state: S,
    /// Whether the transaction succeeded or reverted.
    pub success: bool,
    /// Gas consumed, including on revert.
    pub gas_used: u64,
}

/// A transaction could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionFailure {
    #[error("invalid nonce: got {got}, expected {expected}")]
    InvalidNonce { got: u64, expected: u64 },
    #[error("insufficient funds for gas * price + value on {_0}")]
    InsufficientFunds(Address),
    #[error("max fee per gas {max_fee} below base fee {base_fee}")]
    FeeCapTooLow { max_fee: u128, base_fee: u64 },
    #[error("invalid transaction: {_0}")]
    InvalidTransaction(String),
    #[error("internal execution error: {_0}")]
    Internal(String),
}

impl ExecutionFailure {
    /// Returns true if the failure is caused by the transaction itself rather than the backend.
    pub const fn is_invalid_tx_err(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}

/// Applies transactions against copy-on-write state snapshots.
///
/// Implementations must never mutate the `state` they are handed; every successful
/// [`ExecutionAdapter::execute`] returns a fresh state.
pub trait ExecutionAdapter: Send + Sync + 'static {
    /// A cheap-to-clone state handle.
    type State: Clone + Send + Sync + 'static;

    /// Header of a known block, or `None` if the hash is unknown.
    fn parent_header(&self, hash: B256) -> Result<Option<Header>, ExecutionFailure>;

    /// State at the end of the given block.
    fn state_at(&self, hash: B256) -> Result<Self::State, ExecutionFailure>;

    /// Identity of a state, used to key simulation results.
    fn snapshot(&self, state: &Self::State) -> SnapshotId;

    /// Applies `tx` on top of `state`.
    fn execute(
        &self,
        state: &Self::State,
        tx: &RecoveredTx,
        env: &BlockEnv,
    ) -> Result<Executed<Self::State>, ExecutionFailure>;

    /// State root committed by a sealed block.
    fn state_root(&self, state: &Self::State) -> Result<B256, ExecutionFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_tx_classification() {
        assert!(ExecutionFailure::InvalidNonce { got: 1, expected: 0 }.is_invalid_tx_err());
        assert!(ExecutionFailure::InsufficientFunds(Address::ZERO).is_invalid_tx_err());
        assert!(!ExecutionFailure::Internal("db closed".into()).is_invalid_tx_err());
    }
}
