use std::collections::HashMap;

use alloy_rpc_types_beacon::BlsSignature;
use revm_primitives::{Bytes, alloy_primitives::TxHash};
use serde::{Deserialize, Serialize};

use crate::common::{ParseError, RecoveredTx, Slot, recover_raw_transaction};

/// Constraints for one slot, keyed by transaction hash.
pub type HashToConstraintDecoded = HashMap<TxHash, DecodedConstraint>;

/// A batch of signed constraints as pushed by the constraint source.
pub type BatchedSignedConstraints = Vec<SignedConstraints>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedConstraints {
    pub message: ConstraintsMessage,
    pub signature: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintsMessage {
    pub validator_index: u64,
    pub slot: Slot,
    pub constraints: Vec<Constraint>,
}

/// A transaction the proposer promised to include.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    /// EIP-2718 encoded signed transaction.
    pub tx: Bytes,
    /// Absolute position in the block, if pinned.
    pub index: Option<u64>,
}

/// A [`Constraint`] whose transaction has been decoded and its sender recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedConstraint {
    pub index: Option<u64>,
    pub tx: RecoveredTx,
}

impl DecodedConstraint {
    pub fn decode(raw: &[u8], index: Option<u64>) -> Result<Self, ParseError> {
        Ok(Self { index, tx: recover_raw_transaction(raw)? })
    }

    pub fn hash(&self) -> TxHash {
        *self.tx.inner().tx_hash()
    }
}

impl TryFrom<&Constraint> for DecodedConstraint {
    type Error = ParseError;

    fn try_from(constraint: &Constraint) -> Result<Self, Self::Error> {
        Self::decode(&constraint.tx, constraint.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_signed_constraints() {
        let json = r#"{
            "message": {
                "validator_index": 12,
                "slot": 8,
                "constraints": [{ "tx": "0x02f86b", "index": 3 }, { "tx": "0x02", "index": null }]
            },
            "signature": "0x000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000"
        }"#;

        let signed: SignedConstraints = serde_json::from_str(json).unwrap();
        assert_eq!(signed.message.validator_index, 12);
        assert_eq!(signed.message.slot, 8);
        assert_eq!(signed.message.constraints[0].index, Some(3));
        assert_eq!(signed.message.constraints[1].index, None);
        assert_eq!(signed.message.constraints[0].tx.as_ref(), &[0x02, 0xf8, 0x6b]);
    }
}
