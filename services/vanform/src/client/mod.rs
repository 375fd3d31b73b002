//! Shared store client: AppRole session, lease renewal and token exchange

pub mod approle;
pub mod exchange;
pub mod lease;
pub mod store;
pub mod vault;

pub use approle::{AppRoleCredentials, AppRoleSession, RenewalOutcome};
pub use exchange::TokenExchange;
pub use lease::{LeaseWatcher, WatcherEvent};
pub use store::{KvStore, StoreConnection, StoreConnector};
pub use vault::{AuthBackend, AuthLease, VaultClient, VaultConnector, VaultKv};
