//! Decentralized link formation for multi-zone virtual application
//! networks, coordinated through a Vault KV v2 store.

pub mod client;
pub mod error;
pub mod retry;
pub mod van;

#[cfg(test)]
mod testing;

pub use error::{Result, StoreError, VanFormError};
pub use van::{VanConfig, VanForm, VanFormRunner};
