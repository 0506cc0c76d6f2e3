//! A tiny account ledger used as the reference transaction executor.
//!
//! Balances live in the `Account` store as big-endian `u64`s; contract calls
//! write into `ContractStorage` under `contract ++ key`.

use agora_common::collaborators::{ExecutionError, StateAccess, TransactionExecutor};
use agora_common::{Receipt, StoreKind, Transaction, TxKind};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum LedgerOp {
    #[n(0)]
    Mint {
        #[n(0)]
        to: Vec<u8>,
        #[n(1)]
        amount: u64,
    },
    #[n(1)]
    Transfer {
        #[n(0)]
        from: Vec<u8>,
        #[n(1)]
        to: Vec<u8>,
        #[n(2)]
        amount: u64,
    },
    #[n(2)]
    Store {
        #[n(0)]
        contract: Vec<u8>,
        #[n(1)]
        key: Vec<u8>,
        #[n(2)]
        value: Vec<u8>,
    },
    /// A contract call that always reverts
    #[n(3)]
    Revert,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
struct LedgerTx {
    #[n(0)]
    nonce: u64,
    #[n(1)]
    op: LedgerOp,
}

impl LedgerOp {
    pub fn kind(&self) -> TxKind {
        match self {
            LedgerOp::Mint { .. } | LedgerOp::Transfer { .. } => TxKind::Transfer,
            LedgerOp::Store { .. } | LedgerOp::Revert => TxKind::ContractCall,
        }
    }

    /// Wrap into a transaction; the nonce keeps otherwise equal operations
    /// distinct
    pub fn into_tx(self, nonce: u64) -> Transaction {
        let kind = self.kind();
        let payload = minicbor::to_vec(LedgerTx { nonce, op: self }).expect("infallible");
        Transaction::new(kind, payload)
    }
}

pub fn mint(to: &str, amount: u64, nonce: u64) -> Transaction {
    LedgerOp::Mint {
        to: to.as_bytes().to_vec(),
        amount,
    }
    .into_tx(nonce)
}

pub fn transfer(from: &str, to: &str, amount: u64, nonce: u64) -> Transaction {
    LedgerOp::Transfer {
        from: from.as_bytes().to_vec(),
        to: to.as_bytes().to_vec(),
        amount,
    }
    .into_tx(nonce)
}

pub fn store_call(contract: &str, key: &str, value: &str, nonce: u64) -> Transaction {
    LedgerOp::Store {
        contract: contract.as_bytes().to_vec(),
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
    }
    .into_tx(nonce)
}

pub fn reverting_call(nonce: u64) -> Transaction {
    LedgerOp::Revert.into_tx(nonce)
}

/// Decode a stored balance; absent accounts hold zero
pub fn decode_balance(bytes: Option<Vec<u8>>) -> u64 {
    bytes
        .and_then(|b| <[u8; 8]>::try_from(b.as_slice()).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}

pub fn contract_key(contract: &str, key: &str) -> Vec<u8> {
    [contract.as_bytes(), key.as_bytes()].concat()
}

#[derive(Debug, Default, Clone)]
pub struct LedgerExecutor;

impl LedgerExecutor {
    pub fn new() -> Self {
        Self
    }

    fn balance(state: &dyn StateAccess, account: &[u8]) -> Result<u64, ExecutionError> {
        Ok(decode_balance(state.get(StoreKind::Account, account)?))
    }

    fn set_balance(
        state: &mut dyn StateAccess,
        account: &[u8],
        balance: u64,
    ) -> Result<(), ExecutionError> {
        if balance == 0 {
            state.delete(StoreKind::Account, account.to_vec())?;
        } else {
            state.put(
                StoreKind::Account,
                account.to_vec(),
                balance.to_be_bytes().to_vec(),
            )?;
        }
        Ok(())
    }
}

impl TransactionExecutor for LedgerExecutor {
    fn execute(
        &self,
        tx: &Transaction,
        state: &mut dyn StateAccess,
    ) -> Result<Receipt, ExecutionError> {
        let decoded: LedgerTx = minicbor::decode(&tx.payload)
            .map_err(|e| ExecutionError::Malformed(e.to_string()))?;
        if decoded.op.kind() != tx.kind {
            return Err(ExecutionError::Malformed("kind does not match operation".into()));
        }
        trace!(tx = %tx.id().short(), op = ?decoded.op, "Executing");

        let cost = match decoded.op {
            LedgerOp::Mint { to, amount } => {
                let balance = Self::balance(state, &to)?;
                let credited = balance
                    .checked_add(amount)
                    .ok_or_else(|| ExecutionError::Rejected("balance overflow".into()))?;
                Self::set_balance(state, &to, credited)?;
                1
            }
            LedgerOp::Transfer { from, to, amount } => {
                let from_balance = Self::balance(state, &from)?;
                if from_balance < amount {
                    return Err(ExecutionError::Rejected(format!(
                        "insufficient funds: {from_balance} < {amount}"
                    )));
                }
                Self::set_balance(state, &from, from_balance - amount)?;
                let to_balance = Self::balance(state, &to)?;
                let credited = to_balance
                    .checked_add(amount)
                    .ok_or_else(|| ExecutionError::Rejected("balance overflow".into()))?;
                Self::set_balance(state, &to, credited)?;
                1
            }
            LedgerOp::Store {
                contract,
                key,
                value,
            } => {
                if contract.is_empty() {
                    return Err(ExecutionError::Rejected("no contract address".into()));
                }
                state.put(StoreKind::ContractStorage, [contract, key].concat(), value)?;
                10
            }
            LedgerOp::Revert => return Err(ExecutionError::Rejected("reverted".into())),
        };

        Ok(Receipt {
            tx: tx.id(),
            cost,
        })
    }
}
