//! Upgradeable fungible-value ledger.
//!
//! A [`DelegatingShell`] holds every piece of persistent state (the address
//! registry and the ledger fields) and forwards ledger operations to a
//! swappable backend. Swapping the `controller` entry changes the code that
//! runs without touching balances or allowances.
//!
//! * [`address`]: account and deployment identities, registry roles.
//! * [`registry`]: owner-gated role → address table.
//! * [`journal`]: hash-chained log of committed registry changes.
//! * [`backend`]: the call surface and the [`LedgerBackend`] trait.
//! * [`shell`]: dispatch, staged execution and reentrancy control.
//! * [`logic`]: the capped token backend shipped with this crate.
//! * [`store`]: JSON snapshots of a whole shell.

pub mod address;
pub mod backend;
pub mod config;
pub mod journal;
pub mod ledger;
pub mod logic;
pub mod registry;
pub mod shell;
pub mod store;

pub use address::{Address, Role};
pub use backend::{Call, LedgerBackend, Output};
pub use config::{MintPolicy, ReentrancyPolicy, ShellConfig};
pub use ledger::{Amount, LedgerError, LedgerEvent, LedgerState};
pub use logic::LedgerLogic;
pub use registry::RegistryError;
pub use shell::{DelegatingShell, ExecutionContext, ShellError};
pub use store::StoreError;
