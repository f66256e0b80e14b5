use crate::types::normalize_address;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Contract address to owning principal. The first registration sticks.
#[derive(Debug, Default)]
pub struct OwnershipRegistry {
    owners: RwLock<HashMap<String, String>>,
}

impl OwnershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the contract already had an owner.
    pub async fn set_owner(&self, contract_address: &str, principal: &str) -> bool {
        let contract = normalize_address(contract_address);
        let mut owners = self.owners.write().await;
        if owners.contains_key(&contract) {
            return false;
        }

        owners.insert(contract, normalize_address(principal));
        true
    }

    pub async fn get_owner(&self, contract_address: &str) -> Option<String> {
        let contract = normalize_address(contract_address);
        self.owners.read().await.get(&contract).cloned()
    }

    /// Recorded owner of `contract_address`, or `fallback` (the event's sender).
    pub async fn resolve(&self, contract_address: &str, fallback: &str) -> String {
        match self.get_owner(contract_address).await {
            Some(owner) => owner,
            None => normalize_address(fallback),
        }
    }

    pub async fn len(&self) -> usize {
        self.owners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.owners.read().await.is_empty()
    }
}
