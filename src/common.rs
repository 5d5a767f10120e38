use alloy_consensus::{TxEnvelope, transaction::Recovered, transaction::SignerRecoverable};
use alloy_eips::{Decodable2718, eip2718::Eip2718Error};

/// A signed transaction together with its recovered sender.
pub type RecoveredTx = Recovered<TxEnvelope>;

/// Beacon chain slot number.
pub type Slot = u64;

/// Intrinsic gas of the cheapest possible transaction.
pub const MIN_TRANSACTION_GAS: u64 = 21_000;

/// Errors raised while turning raw transaction bytes into a [`RecoveredTx`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to decode transaction: {_0}")]
    Decode(#[from] Eip2718Error),
    #[error("{_0} trailing bytes after transaction envelope")]
    TrailingBytes(usize),
    #[error("failed to recover transaction signer")]
    InvalidSignature,
}

/// Decodes an EIP-2718 envelope and recovers its signer.
pub fn recover_raw_transaction(raw: &[u8]) -> Result<RecoveredTx, ParseError> {
    let mut buf = raw;
    let tx = TxEnvelope::decode_2718(&mut buf)?;
    if !buf.is_empty() {
        return Err(ParseError::TrailingBytes(buf.len()));
    }
    let signer = tx.recover_signer().map_err(|_| ParseError::InvalidSignature)?;
    Ok(Recovered::new_unchecked(tx, signer))
}
