//! Channel keys, licenses and contracts.

pub mod channel;
pub mod cipher;
pub mod contract;
pub mod key;
pub mod license;
pub mod secret;

pub use channel::{hash_part, parse_channel, Channel, ChannelKind};
pub use cipher::{Cipher, KeyError};
pub use contract::{new_contract_provider, Contract, ContractProvider, ContractState};
pub use key::{Key, Permissions};
pub use license::License;
pub use secret::{new_secret_store, SecretStore};
