use std::sync::Arc;

use anyhow::anyhow;

use super::key::Key;
use super::license::License;
use crate::utils::timestamp_secs;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractState {
    Allowed,
    /// Rejected for billing reasons.
    Refused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub id: u32,
    pub master: u16,
    pub signature: u32,
    pub state: ContractState,
}

impl Contract {
    /// A key belongs to the contract when master, contract and signature
    /// match, and only an allowed contract accepts keys.
    #[inline]
    pub fn validate(&self, key: &Key) -> bool {
        self.state == ContractState::Allowed
            && key.master() == self.master
            && key.contract() == self.id
            && key.signature() == self.signature
    }
}

pub trait ContractProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn get(&self, id: u32) -> Option<Contract>;
}

/// Serves the one contract carried by the license.
pub struct SingleContractProvider {
    license: License,
}

impl SingleContractProvider {
    pub fn new(license: License) -> Self {
        Self { license }
    }
}

impl ContractProvider for SingleContractProvider {
    fn name(&self) -> &'static str {
        "single"
    }

    fn get(&self, id: u32) -> Option<Contract> {
        if id != self.license.contract {
            return None;
        }
        let state = if self.license.is_expired(timestamp_secs()) {
            ContractState::Refused
        } else {
            ContractState::Allowed
        };
        Some(Contract { id, master: self.license.master, signature: self.license.signature, state })
    }
}

/// Picks the contract provider configured by name.
pub fn new_contract_provider(name: &str, license: &License) -> Result<Arc<dyn ContractProvider>> {
    match name {
        "" | "single" => Ok(Arc::new(SingleContractProvider::new(license.clone()))),
        _ => Err(anyhow!("unsupported contract provider {:?}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::key::Permissions;

    #[test]
    fn single_contract() {
        let license = License::generate();
        let provider = new_contract_provider("single", &license).unwrap();
        assert_eq!(provider.name(), "single");
        assert!(provider.get(license.contract.wrapping_add(1)).is_none());

        let contract = provider.get(license.contract).unwrap();
        assert_eq!(contract.state, ContractState::Allowed);

        let key = license.cipher().decrypt_key(&license.new_master_key()).unwrap();
        assert!(contract.validate(&key));

        let mut forged = key;
        forged.set_signature(key.signature() ^ 1);
        assert!(!contract.validate(&forged));

        let mut other_master = key;
        other_master.set_master(key.master() + 1);
        other_master.set_permissions(Permissions::READ);
        assert!(!contract.validate(&other_master));
    }

    #[test]
    fn expired_license_refuses() {
        let mut license = License::generate();
        license.expires = 1;
        let provider = SingleContractProvider::new(license.clone());
        let contract = provider.get(license.contract).unwrap();
        assert_eq!(contract.state, ContractState::Refused);
        let key = license.cipher().decrypt_key(&license.new_master_key()).unwrap();
        assert!(!contract.validate(&key));
    }

    #[test]
    fn unknown_provider() {
        assert!(new_contract_provider("http", &License::generate()).is_err());
    }
}
