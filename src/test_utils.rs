//! In-memory execution backend and transaction helpers shared by the unit tests.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use alloy_consensus::{Header, SignableTransaction, Transaction, TxEip1559, TxEnvelope, transaction::Recovered};
use alloy_eips::Encodable2718;
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use revm_primitives::{Address, B256, Bytes, TxKind, U256, keccak256};

use crate::{
    common::{MIN_TRANSACTION_GAS, RecoveredTx},
    execution::{BlockEnv, Executed, ExecutionAdapter, ExecutionFailure, SnapshotId},
};

pub(crate) const BASE_FEE: u64 = 1_000_000_000;
pub(crate) const GENESIS_GAS_LIMIT: u64 = 30_000_000;
pub(crate) const GENESIS_TIMESTAMP: u64 = 1_700_000_000;
pub(crate) const ONE_GWEI: u128 = 1_000_000_000;

/// Marker byte that makes the mock backend revert a transaction.
pub(crate) const REVERT_MARKER: u8 = 0xfe;
/// Marker byte of a transaction that only succeeds while its recipient holds no balance,
/// an opportunity the first taker consumes.
pub(crate) const CLAIM_MARKER: u8 = 0xfd;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct MockAccount {
    pub nonce: u64,
    pub balance: U256,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockState {
    pub accounts: HashMap<Address, MockAccount>,
    pub id: B256,
}

impl MockState {
    pub(crate) fn balance(&self, address: Address) -> U256 {
        self.accounts.get(&address).map(|a| a.balance).unwrap_or_default()
    }

    pub(crate) fn nonce(&self, address: Address) -> u64 {
        self.accounts.get(&address).map(|a| a.nonce).unwrap_or_default()
    }
}

/// Account-model executor: nonce and balance checks, plain value transfers, and a
/// revert marker on the first input byte.
#[derive(Debug)]
pub(crate) struct MockExecutor {
    genesis: Header,
    genesis_state: MockState,
    executions: AtomicUsize,
    fail_internal: AtomicBool,
}

impl MockExecutor {
    /// Funds every signer in `1..=funded` with 1000 ether.
    pub(crate) fn new(funded: u8) -> Self {
        let accounts = (1..=funded)
            .map(|i| {
                let balance = U256::from(1_000u64) * U256::from(10u64).pow(U256::from(18u64));
                (signer(i).address(), MockAccount { nonce: 0, balance })
            })
            .collect();

        let genesis = Header {
            number: 0,
            gas_limit: GENESIS_GAS_LIMIT,
            gas_used: GENESIS_GAS_LIMIT / 2,
            base_fee_per_gas: Some(BASE_FEE),
            timestamp: GENESIS_TIMESTAMP,
            ..Default::default()
        };

        Self {
            genesis,
            genesis_state: MockState { accounts, id: B256::with_last_byte(0x01) },
            executions: AtomicUsize::new(0),
            fail_internal: AtomicBool::new(false),
        }
    }

    pub(crate) fn genesis_hash(&self) -> B256 {
        self.genesis.hash_slow()
    }

    pub(crate) fn genesis_state(&self) -> MockState {
        self.genesis_state.clone()
    }

    pub(crate) fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Makes every subsequent execution fail with an internal error.
    pub(crate) fn fail_internal(&self, fail: bool) {
        self.fail_internal.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn env(&self) -> BlockEnv {
        BlockEnv {
            number: 1,
            timestamp: GENESIS_TIMESTAMP + 12,
            coinbase: Address::repeat_byte(0xcb),
            base_fee: BASE_FEE,
            gas_limit: GENESIS_GAS_LIMIT,
            prev_randao: B256::ZERO,
        }
    }
}

impl ExecutionAdapter for MockExecutor {
    type State = MockState;

    fn parent_header(&self, hash: B256) -> Result<Option<Header>, ExecutionFailure> {
        Ok((hash == self.genesis_hash()).then(|| self.genesis.clone()))
    }

    fn state_at(&self, hash: B256) -> Result<Self::State, ExecutionFailure> {
        if hash != self.genesis_hash() {
            return Err(ExecutionFailure::Internal(format!("unknown block {hash}")));
        }
        Ok(self.genesis_state.clone())
    }

    fn snapshot(&self, state: &Self::State) -> SnapshotId {
        SnapshotId(state.id)
    }

    fn execute(
        &self,
        state: &Self::State,
        tx: &RecoveredTx,
        env: &BlockEnv,
    ) -> Result<Executed<Self::State>, ExecutionFailure> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if self.fail_internal.load(Ordering::SeqCst) {
            return Err(ExecutionFailure::Internal("backend unavailable".into()));
        }

        let sender = tx.signer();
        let account = state.accounts.get(&sender).copied().unwrap_or_default();
        if tx.nonce() != account.nonce {
            return Err(ExecutionFailure::InvalidNonce { got: tx.nonce(), expected: account.nonce });
        }
        if tx.max_fee_per_gas() < env.base_fee as u128 {
            return Err(ExecutionFailure::FeeCapTooLow { max_fee: tx.max_fee_per_gas(), base_fee: env.base_fee });
        }
        let max_cost = U256::from(tx.gas_limit()) * U256::from(tx.max_fee_per_gas()) + tx.value();
        if account.balance < max_cost {
            return Err(ExecutionFailure::InsufficientFunds(sender));
        }

        let success = match tx.input().first() {
            Some(&REVERT_MARKER) => false,
            Some(&CLAIM_MARKER) => tx.to().is_none_or(|to| state.balance(to).is_zero()),
            _ => true,
        };
        let gas_used = if success { MIN_TRANSACTION_GAS } else { tx.gas_limit() };
        let tip = tx.effective_tip_per_gas(env.base_fee).unwrap_or_default();
        let price = env.base_fee as u128 + tip;

        let mut next = state.clone();
        {
            let sender_account = next.accounts.entry(sender).or_default();
            sender_account.nonce += 1;
            sender_account.balance -= U256::from(gas_used) * U256::from(price);
            if success {
                sender_account.balance -= tx.value();
            }
        }
        if success {
            if let Some(to) = tx.to() {
                next.accounts.entry(to).or_default().balance += tx.value();
            }
        }
        next.accounts.entry(env.coinbase).or_default().balance += U256::from(gas_used) * U256::from(tip);

        let mut preimage = state.id.to_vec();
        preimage.extend_from_slice(tx.inner().tx_hash().as_slice());
        next.id = keccak256(preimage);

        Ok(Executed { state: next, success, gas_used })
    }

    fn state_root(&self, state: &Self::State) -> Result<B256, ExecutionFailure> {
        Ok(keccak256(state.id))
    }
}

pub(crate) fn mock_executor(funded: u8) -> Arc<MockExecutor> {
    Arc::new(MockExecutor::new(funded))
}

pub(crate) fn signer(i: u8) -> PrivateKeySigner {
    PrivateKeySigner::from_bytes(&B256::with_last_byte(i)).unwrap()
}

fn sign(signer: &PrivateKeySigner, tx: TxEip1559) -> RecoveredTx {
    let signature = signer.sign_hash_sync(&tx.signature_hash()).unwrap();
    Recovered::new_unchecked(TxEnvelope::from(tx.into_signed(signature)), signer.address())
}

fn eip1559(nonce: u64, tip_gwei: u128, gas_limit: u64, input: Bytes) -> TxEip1559 {
    TxEip1559 {
        chain_id: 1,
        nonce,
        gas_limit,
        max_fee_per_gas: BASE_FEE as u128 + tip_gwei * ONE_GWEI,
        max_priority_fee_per_gas: tip_gwei * ONE_GWEI,
        to: TxKind::Call(Address::repeat_byte(0xaa)),
        value: U256::from(1u64),
        access_list: Default::default(),
        input,
    }
}

/// A plain transfer paying `tip_gwei` per gas.
pub(crate) fn transfer(signer: &PrivateKeySigner, nonce: u64, tip_gwei: u128) -> RecoveredTx {
    sign(signer, eip1559(nonce, tip_gwei, MIN_TRANSACTION_GAS, Bytes::new()))
}

/// A transaction that reverts and burns its whole gas limit.
pub(crate) fn reverting(signer: &PrivateKeySigner, nonce: u64, tip_gwei: u128) -> RecoveredTx {
    sign(signer, eip1559(nonce, tip_gwei, 50_000, Bytes::from(vec![REVERT_MARKER])))
}

/// A transaction that succeeds only if no one has paid its recipient yet, and otherwise
/// reverts and burns its whole gas limit.
pub(crate) fn claim(signer: &PrivateKeySigner, nonce: u64, tip_gwei: u128) -> RecoveredTx {
    sign(signer, eip1559(nonce, tip_gwei, 50_000, Bytes::from(vec![CLAIM_MARKER])))
}

/// A transfer with a custom gas limit.
pub(crate) fn with_gas_limit(signer: &PrivateKeySigner, nonce: u64, tip_gwei: u128, gas_limit: u64) -> RecoveredTx {
    sign(signer, eip1559(nonce, tip_gwei, gas_limit, Bytes::new()))
}

pub(crate) fn encode(tx: &RecoveredTx) -> Bytes {
    tx.inner().encoded_2718().into()
}
