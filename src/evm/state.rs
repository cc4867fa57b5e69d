use std::collections::HashMap;

use crate::types::{EVMAddress, EVMU256};

#[derive(Debug, Clone, Default)]
pub struct Account {
    pub balance: EVMU256,
    pub nonce: u64,
    pub code: Vec<u8>,
    pub storage: HashMap<EVMU256, EVMU256>,
}

/// In-memory world state. Snapshots are whole-state copies kept in a LIFO
/// stack; `revert_to` pops every snapshot above the requested one.
#[derive(Debug, Default)]
pub struct StateDB {
    accounts: HashMap<EVMAddress, Account>,
    snapshots: Vec<HashMap<EVMAddress, Account>>,
}

impl StateDB {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, address: EVMAddress) -> bool {
        self.accounts.contains_key(&address)
    }

    pub fn create_account(&mut self, address: EVMAddress) {
        self.accounts.entry(address).or_default();
    }

    fn account_mut(&mut self, address: EVMAddress) -> &mut Account {
        self.accounts.entry(address).or_default()
    }

    pub fn balance(&self, address: EVMAddress) -> EVMU256 {
        self.accounts
            .get(&address)
            .map(|a| a.balance)
            .unwrap_or_default()
    }

    pub fn add_balance(&mut self, address: EVMAddress, amount: EVMU256) {
        let acc = self.account_mut(address);
        acc.balance = acc.balance.overflowing_add(amount).0;
    }

    pub fn nonce(&self, address: EVMAddress) -> u64 {
        self.accounts
            .get(&address)
            .map(|a| a.nonce)
            .unwrap_or_default()
    }

    pub fn set_nonce(&mut self, address: EVMAddress, nonce: u64) {
        self.account_mut(address).nonce = nonce;
    }

    pub fn code(&self, address: EVMAddress) -> &[u8] {
        self.accounts
            .get(&address)
            .map(|a| a.code.as_slice())
            .unwrap_or_default()
    }

    pub fn set_code(&mut self, address: EVMAddress, code: Vec<u8>) {
        self.account_mut(address).code = code;
    }

    pub fn storage(&self, address: EVMAddress, key: EVMU256) -> EVMU256 {
        self.accounts
            .get(&address)
            .and_then(|a| a.storage.get(&key).copied())
            .unwrap_or_default()
    }

    pub fn set_storage(&mut self, address: EVMAddress, key: EVMU256, value: EVMU256) {
        self.account_mut(address).storage.insert(key, value);
    }

    /// `true` when the sender can cover the transfer.
    pub fn can_transfer(&self, from: EVMAddress, amount: EVMU256) -> bool {
        self.balance(from) >= amount
    }

    pub fn transfer(&mut self, from: EVMAddress, to: EVMAddress, amount: EVMU256) {
        let facc = self.account_mut(from);
        facc.balance = facc.balance.overflowing_sub(amount).0;
        self.add_balance(to, amount);
    }

    pub fn snapshot(&mut self) -> usize {
        self.snapshots.push(self.accounts.clone());
        self.snapshots.len() - 1
    }

    pub fn revert_to(&mut self, id: usize) {
        if id < self.snapshots.len() {
            self.accounts = self.snapshots[id].clone();
            self.snapshots.truncate(id);
        }
    }

    /// Drop snapshots above `id` without restoring them.
    pub fn commit_to(&mut self, id: usize) {
        if id < self.snapshots.len() {
            self.snapshots.truncate(id);
        }
    }
}
