use revm_primitives::{B256, alloy_primitives::TxHash};

use crate::execution::ExecutionFailure;

/// Why a constraint could not be honored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ViolationReason {
    #[error("execution failed: {_0}")]
    Execution(ExecutionFailure),
    #[error("needs {required} gas, {available} left")]
    GasExhausted { required: u64, available: u64 },
    #[error("index {index} was already filled")]
    PositionTaken { index: u64 },
    #[error("index {index} unreachable, block ended with {transactions} transactions")]
    PositionUnreachable { index: u64, transactions: u64 },
    #[error("sender never reached nonce {nonce}")]
    NonceGap { nonce: u64 },
}

/// Errors returned by a block building attempt.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("constraint {hash} violated: {reason}")]
    ConstraintViolation { hash: TxHash, reason: ViolationReason },
    #[error("constraints need {required} gas, block gas limit is {gas_limit}")]
    InsufficientGas { required: u64, gas_limit: u64 },
    #[error("could not find parent block: {_0}")]
    InvalidParent(B256),
    #[error("timestamp {timestamp} is not after parent timestamp {parent}")]
    InvalidTimestamp { timestamp: u64, parent: u64 },
    #[error("build cancelled after using {gas_used} of {gas_limit} gas")]
    Cancelled { gas_used: u64, gas_limit: u64 },
    #[error(transparent)]
    ExecutionAdapter(#[from] ExecutionFailure),
}

impl BuildError {
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Share of the block filled before the attempt was interrupted.
    pub fn fill_ratio(&self) -> Option<f64> {
        match self {
            Self::Cancelled { gas_limit: 0, .. } => Some(0.0),
            Self::Cancelled { gas_used, gas_limit } => Some(*gas_used as f64 / *gas_limit as f64),
            _ => None,
        }
    }
}
