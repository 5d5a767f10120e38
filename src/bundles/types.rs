use std::sync::Arc;

use alloy_consensus::Transaction;
use revm_primitives::{B256, Bytes, U256, keccak256};
use serde::{Deserialize, Serialize};

use crate::common::{ParseError, RecoveredTx, recover_raw_transaction};

/// Transactions a searcher wants included together, in order, or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    /// EIP-2718 encoded signed transactions.
    pub transactions: Vec<Bytes>,
    /// Positions that are allowed to revert. Every other position must succeed.
    #[serde(default)]
    pub reverting_txs: Vec<usize>,
    /// Identity of the bundle, derived from its transactions and revert rules.
    /// Recomputed on [`Bundle::decode`].
    #[serde(default)]
    pub hash: B256,
}

impl Bundle {
    pub fn new(transactions: Vec<Bytes>, reverting_txs: Vec<usize>) -> Self {
        let hash = bundle_hash(&transactions, &reverting_txs);
        Self { transactions, reverting_txs, hash }
    }

    pub fn can_revert(&self, position: usize) -> bool {
        self.reverting_txs.contains(&position)
    }

    /// Decodes every transaction and recovers its sender.
    pub fn decode(mut self) -> Result<DecodedBundle, ParseError> {
        let txs = self.transactions.iter().map(|raw| recover_raw_transaction(raw)).collect::<Result<Vec<_>, _>>()?;
        self.hash = bundle_hash(&self.transactions, &self.reverting_txs);
        Ok(DecodedBundle { bundle: Arc::new(self), txs })
    }
}

/// Keccak of the concatenated transaction hashes followed by the sorted revertible positions.
pub fn bundle_hash(transactions: &[Bytes], reverting_txs: &[usize]) -> B256 {
    let mut reverting = reverting_txs.to_vec();
    reverting.sort_unstable();
    reverting.dedup();

    let mut preimage = Vec::with_capacity(transactions.len() * 32 + reverting.len() * 8);
    for tx in transactions {
        preimage.extend_from_slice(keccak256(tx).as_slice());
    }
    for position in reverting {
        preimage.extend_from_slice(&(position as u64).to_be_bytes());
    }
    keccak256(preimage)
}

/// A [`Bundle`] with its transactions recovered.
#[derive(Debug, Clone)]
pub struct DecodedBundle {
    pub bundle: Arc<Bundle>,
    pub txs: Vec<RecoveredTx>,
}

impl DecodedBundle {
    pub fn hash(&self) -> B256 {
        self.bundle.hash
    }

    /// Sum of the gas limits of all transactions.
    pub fn gas_limit(&self) -> u64 {
        self.txs.iter().map(|tx| tx.gas_limit()).sum()
    }

    /// Largest gas limit of a single transaction. The bundle cannot fit in less gas.
    pub fn max_tx_gas_limit(&self) -> u64 {
        self.txs.iter().map(|tx| tx.gas_limit()).max().unwrap_or_default()
    }
}

/// Outcome of executing a bundle on top of a specific state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedBundle {
    pub bundle: Arc<Bundle>,
    pub gas_used: u64,
    /// Priority fees paid to the coinbase.
    pub profit: U256,
    /// False if any transaction was invalid or reverted where it must not.
    pub applicable: bool,
}

impl SimulatedBundle {
    pub(crate) fn not_applicable(bundle: Arc<Bundle>) -> Self {
        Self { bundle, gas_used: 0, profit: U256::ZERO, applicable: false }
    }

    /// Profit per unit of gas, the ordering key used when merging.
    pub fn score(&self) -> U256 {
        if self.gas_used == 0 { U256::ZERO } else { self.profit / U256::from(self.gas_used) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{encode, signer, transfer};

    #[test]
    fn test_bundle_hash_depends_on_order() {
        let a = encode(&transfer(&signer(1), 0, 1));
        let b = encode(&transfer(&signer(2), 0, 1));

        let ab = Bundle::new(vec![a.clone(), b.clone()], vec![]);
        let ba = Bundle::new(vec![b, a.clone()], vec![]);

        assert_ne!(ab.hash, ba.hash);
    }

    #[test]
    fn test_bundle_hash_covers_reverting_txs() {
        let txs = vec![encode(&transfer(&signer(1), 0, 1)), encode(&transfer(&signer(2), 0, 1))];

        let strict = Bundle::new(txs.clone(), vec![]);
        let lenient = Bundle::new(txs.clone(), vec![1]);
        assert_ne!(strict.hash, lenient.hash);
        assert_eq!(Bundle::new(txs.clone(), vec![1, 0]).hash, Bundle::new(txs, vec![0, 1, 1]).hash);
    }

    #[test]
    fn test_decode_recomputes_hash() {
        let tx = encode(&transfer(&signer(1), 0, 1));
        let expected = Bundle::new(vec![tx.clone()], vec![]).hash;

        let forged = Bundle { transactions: vec![tx], reverting_txs: vec![], hash: B256::repeat_byte(0x11) };
        assert_eq!(forged.decode().unwrap().hash(), expected);
    }

    #[test]
    fn test_decode_bundle() {
        let tx = transfer(&signer(1), 0, 1);
        let decoded = Bundle::new(vec![encode(&tx)], vec![]).decode().unwrap();

        assert_eq!(decoded.txs.len(), 1);
        assert_eq!(decoded.txs[0].signer(), signer(1).address());
        assert_eq!(decoded.gas_limit(), 21_000);
        assert_eq!(decoded.max_tx_gas_limit(), 21_000);

        assert!(Bundle::new(vec![Bytes::from_static(&[0x02])], vec![]).decode().is_err());
    }
}
