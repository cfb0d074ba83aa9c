use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::address::Address;

pub type Amount = u128;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger already initialized")]
    AlreadyInitialized,
    #[error("minting {amount} would exceed cap {cap} (supply {total_supply})")]
    CapExceeded {
        cap: Amount,
        total_supply: Amount,
        amount: Amount,
    },
    #[error("insufficient balance in {account}: have {available}, need {requested}")]
    InsufficientBalance {
        account: Address,
        available: Amount,
        requested: Amount,
    },
    #[error("insufficient allowance {owner} -> {spender}: have {available}, need {requested}")]
    InsufficientAllowance {
        owner: Address,
        spender: Address,
        available: Amount,
        requested: Amount,
    },
    #[error("caller {caller} may not mint")]
    Unauthorized { caller: Address },
}

/// Shape of the ledger fields as allocated by the shell. A backend may only
/// be installed if it declares the same shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageLayout {
    pub version: u16,
    pub fields: &'static [&'static str],
}

impl StorageLayout {
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"upt-layout");
        hasher.update(self.version.to_le_bytes());
        for field in self.fields {
            hasher.update((field.len() as u32).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.finalize().into()
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint())
    }

    pub fn is_compatible_with(&self, other: &StorageLayout) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Initialized {
        #[serde(with = "serde_amount")]
        cap: Amount,
    },
    Minted {
        to: Address,
        #[serde(with = "serde_amount")]
        amount: Amount,
    },
    Transfer {
        from: Address,
        to: Address,
        #[serde(with = "serde_amount")]
        amount: Amount,
    },
    Approval {
        owner: Address,
        spender: Address,
        #[serde(with = "serde_amount")]
        amount: Amount,
    },
    PayloadTransfer {
        from: Address,
        to: Address,
        #[serde(with = "serde_amount")]
        amount: Amount,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
}

/// Ledger fields owned by the shell. Backends read and write these through
/// the execution context; they never hold a copy of their own.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerState {
    pub cap: Amount,
    pub total_supply: Amount,
    pub initialized: bool,
    pub balances: BTreeMap<Address, Amount>,
    pub allowances: BTreeMap<Address, BTreeMap<Address, Amount>>,
}

impl LedgerState {
    pub const LAYOUT: StorageLayout = StorageLayout {
        version: 1,
        fields: &[
            "cap:u128",
            "total_supply:u128",
            "initialized:bool",
            "balances:map<address,u128>",
            "allowances:map<address,map<address,u128>>",
        ],
    };

    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance_of(&self, account: &Address) -> Amount {
        self.balances.get(account).copied().unwrap_or(0)
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> Amount {
        self.allowances
            .get(owner)
            .and_then(|spenders| spenders.get(spender))
            .copied()
            .unwrap_or(0)
    }

    pub fn credit_account(&mut self, account: &Address, amount: Amount) {
        if amount == 0 {
            return;
        }
        let balance = self.balances.entry(*account).or_insert(0);
        *balance += amount;
    }

    pub fn debit_account(&mut self, account: &Address, amount: Amount) -> Result<(), LedgerError> {
        let available = self.balance_of(account);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                account: *account,
                available,
                requested: amount,
            });
        }
        let remaining = available - amount;
        if remaining == 0 {
            self.balances.remove(account);
        } else {
            self.balances.insert(*account, remaining);
        }
        Ok(())
    }

    /// Overwrites the allowance; zero removes the entry.
    pub fn set_allowance(&mut self, owner: &Address, spender: &Address, amount: Amount) {
        if amount == 0 {
            if let Some(spenders) = self.allowances.get_mut(owner) {
                spenders.remove(spender);
                if spenders.is_empty() {
                    self.allowances.remove(owner);
                }
            }
            return;
        }
        self.allowances
            .entry(*owner)
            .or_default()
            .insert(*spender, amount);
    }

    pub fn balance_sum(&self) -> Amount {
        self.balances.values().sum()
    }

    /// Supply equals the sum of balances and stays within the cap.
    pub fn is_consistent(&self) -> bool {
        let sum = self
            .balances
            .values()
            .try_fold(0, |acc: Amount, v| acc.checked_add(*v));
        sum == Some(self.total_supply) && self.total_supply <= self.cap
    }

    /// Deterministic root over every ledger field.
    pub fn state_root(&self) -> [u8; 32] {
        let mut leaves: Vec<[u8; 32]> = Vec::new();
        let mut hasher = Sha256::new();
        hasher.update(b"meta");
        hasher.update(self.cap.to_le_bytes());
        hasher.update(self.total_supply.to_le_bytes());
        hasher.update([self.initialized as u8]);
        leaves.push(hasher.finalize().into());
        for (account, amount) in &self.balances {
            let mut hasher = Sha256::new();
            hasher.update(b"bal");
            hasher.update(account.as_bytes());
            hasher.update(amount.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        for (owner, spenders) in &self.allowances {
            for (spender, amount) in spenders {
                let mut hasher = Sha256::new();
                hasher.update(b"alw");
                hasher.update(owner.as_bytes());
                hasher.update(spender.as_bytes());
                hasher.update(amount.to_le_bytes());
                leaves.push(hasher.finalize().into());
            }
        }
        build_merkle(leaves)
    }
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"upt-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity(leaves.len().div_ceil(2));
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            if chunk.len() == 2 {
                hasher.update(chunk[1]);
            } else {
                hasher.update(chunk[0]);
            }
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

/// Decimal-string encoding for amounts inside tagged enums, which serde
/// buffers without 128-bit integer support.
pub(crate) mod serde_amount {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use super::Amount;

    pub fn serialize<S>(value: &Amount, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Amount, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(D::Error::custom)
    }
}

pub(crate) mod serde_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(D::Error::custom)
    }
}
