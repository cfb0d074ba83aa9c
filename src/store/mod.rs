use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    address::{Address, Role},
    backend::{builtin_module, BackendCatalog},
    config::ShellConfig,
    journal::{AdminJournal, JournalError},
    ledger::{Amount, LedgerEvent, LedgerState},
    registry::AddressRegistry,
    shell::{check_controller, DelegatingShell, ShellError, ShellStorage},
};

pub const SNAPSHOT_VERSION: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("snapshot encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported snapshot version {0}")]
    Version(u8),
    #[error("snapshot layout {found} does not match this build ({expected})")]
    LayoutMismatch { expected: String, found: String },
    #[error("backend at {address} names unknown module {module:?}")]
    UnknownModule { address: Address, module: String },
    #[error("admin journal failed verification: {0}")]
    Journal(#[from] JournalError),
    #[error("registry does not match the admin journal")]
    RegistryMismatch,
    #[error("shell address {address} was not derived from owner {owner}")]
    OwnerMismatch { address: Address, owner: Address },
    #[error("stored controller is unusable: {0}")]
    Controller(#[source] ShellError),
    #[error("ledger totals are inconsistent (supply {total_supply}, cap {cap})")]
    LedgerInconsistent { total_supply: Amount, cap: Amount },
}

/// On-disk form of a shell.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShellSnapshot {
    pub version: u8,
    pub address: Address,
    pub nonce: u64,
    pub layout: String,
    pub config: ShellConfig,
    pub storage: ShellStorage,
    pub deployments: BTreeMap<Address, String>,
    pub journal: AdminJournal,
    pub events: Vec<LedgerEvent>,
}

impl ShellSnapshot {
    pub fn capture(shell: &DelegatingShell) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            address: shell.address(),
            nonce: shell.nonce(),
            layout: LedgerState::LAYOUT.fingerprint_hex(),
            config: shell.config().clone(),
            storage: shell.storage().clone(),
            deployments: shell.catalog().deployments(),
            journal: shell.journal().clone(),
            events: shell.events().to_vec(),
        }
    }

    pub fn into_shell(self) -> Result<DelegatingShell, StoreError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(StoreError::Version(self.version));
        }
        let expected = LedgerState::LAYOUT.fingerprint_hex();
        if self.layout != expected {
            return Err(StoreError::LayoutMismatch {
                expected,
                found: self.layout,
            });
        }
        self.journal.verify()?;
        replay_registry(&self.storage.registry, &self.journal)?;
        let owner = self.storage.registry.owner();
        if Address::derive_deployment(&owner, 0) != self.address {
            return Err(StoreError::OwnerMismatch {
                address: self.address,
                owner,
            });
        }

        let mut catalog = BackendCatalog::new();
        for (address, module) in self.deployments {
            let code = builtin_module(&module)
                .ok_or_else(|| StoreError::UnknownModule { address, module })?;
            catalog.install(address, code);
        }
        let controller = self.storage.registry.addresses(Role::Controller);
        if !controller.is_zero() {
            check_controller(&catalog, controller).map_err(StoreError::Controller)?;
        }

        let ledger = &self.storage.ledger;
        if !ledger.is_consistent() {
            return Err(StoreError::LedgerInconsistent {
                total_supply: ledger.total_supply,
                cap: ledger.cap,
            });
        }
        Ok(DelegatingShell::restore(
            self.address,
            self.nonce,
            self.storage,
            catalog,
            self.config,
            self.journal,
            self.events,
        ))
    }
}

/// Rebuild the registry from the journal alone; it must land exactly on the
/// stored one.
fn replay_registry(stored: &AddressRegistry, journal: &AdminJournal) -> Result<(), StoreError> {
    let mut replayed = AddressRegistry::new(stored.owner());
    for entry in journal.entries() {
        let change = &entry.change;
        let applied = replayed
            .set_key_holder(&change.caller, change.role, change.holder)
            .map_err(|_| StoreError::RegistryMismatch)?;
        if applied != *change {
            return Err(StoreError::RegistryMismatch);
        }
    }
    if replayed != *stored {
        return Err(StoreError::RegistryMismatch);
    }
    Ok(())
}

pub fn save(shell: &DelegatingShell, path: &Path) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(&ShellSnapshot::capture(shell))?;
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    // write-then-rename so a crash never leaves a half-written state file
    let tmp = path.with_extension("tmp");
    let mut f = fs::File::create(&tmp).map_err(io_err)?;
    f.write_all(&json).map_err(io_err)?;
    f.sync_all().map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    tracing::debug!(path = %path.display(), bytes = json.len(), "shell saved");
    Ok(())
}

pub fn load(path: &Path) -> Result<DelegatingShell, StoreError> {
    let bytes = fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot: ShellSnapshot = serde_json::from_slice(&bytes)?;
    let shell = snapshot.into_shell()?;
    tracing::debug!(path = %path.display(), shell = %shell.address(), "shell loaded");
    Ok(shell)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::{
        address::ADDRESS_LEN,
        backend::Call,
        logic::LedgerLogic,
    };

    const OWNER: Address = Address::from_bytes([0x11; ADDRESS_LEN]);
    const HOLDER: Address = Address::from_bytes([0x22; ADDRESS_LEN]);

    fn populated_shell() -> DelegatingShell {
        let mut shell = DelegatingShell::new(OWNER, ShellConfig::default());
        let logic = shell.deploy(OWNER, Arc::new(LedgerLogic::new()));
        shell
            .set_key_holder(OWNER, Role::Controller, logic)
            .unwrap();
        shell
            .invoke(
                OWNER,
                &Call::Initialize {
                    cap: 100_000 * 10u128.pow(18),
                },
            )
            .unwrap();
        shell
            .invoke(
                OWNER,
                &Call::Mint {
                    to: OWNER,
                    amount: 90_000 * 10u128.pow(18),
                },
            )
            .unwrap();
        shell
            .invoke(
                OWNER,
                &Call::Approve {
                    spender: HOLDER,
                    amount: 7,
                },
            )
            .unwrap();
        shell
    }

    #[test]
    fn saved_shell_reloads_with_state_and_backends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shell.json");
        let shell = populated_shell();
        save(&shell, &path).unwrap();

        let mut loaded = load(&path).unwrap();
        assert_eq!(loaded.address(), shell.address());
        assert_eq!(loaded.nonce(), shell.nonce());
        assert_eq!(loaded.storage(), shell.storage());
        assert_eq!(loaded.events(), shell.events());
        assert_eq!(loaded.journal(), shell.journal());
        let supply = loaded.invoke(HOLDER, &Call::TotalSupply).unwrap();
        assert_eq!(supply.amount(), Some(90_000 * 10u128.pow(18)));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn rejects_foreign_layout() {
        let mut snapshot = ShellSnapshot::capture(&populated_shell());
        snapshot.layout = "00".repeat(32);
        let err = snapshot.into_shell().unwrap_err();
        assert!(matches!(err, StoreError::LayoutMismatch { .. }));
    }

    #[test]
    fn rejects_unknown_module() {
        let mut snapshot = ShellSnapshot::capture(&populated_shell());
        snapshot.deployments.insert(HOLDER, "mystery/v9".into());
        let err = snapshot.into_shell().unwrap_err();
        assert!(matches!(
            err,
            StoreError::UnknownModule { address, .. } if address == HOLDER
        ));
    }

    #[test]
    fn rejects_tampered_journal() {
        let shell = populated_shell();
        let logic = shell.addresses(Role::Controller);
        let json = serde_json::to_string(&ShellSnapshot::capture(&shell))
            .unwrap()
            .replace(&logic.to_string(), &HOLDER.to_string());
        let snapshot: ShellSnapshot = serde_json::from_str(&json).unwrap();
        let err = snapshot.into_shell().unwrap_err();
        assert!(matches!(err, StoreError::Journal(_)));
    }

    #[test]
    fn rejects_registry_edited_outside_journal() {
        let mut shell = populated_shell();
        let other = shell.deploy(OWNER, Arc::new(LedgerLogic::new()));
        let mut snapshot = ShellSnapshot::capture(&shell);
        snapshot
            .storage
            .registry
            .set_key_holder(&OWNER, Role::Controller, other)
            .unwrap();
        let err = snapshot.into_shell().unwrap_err();
        assert!(matches!(err, StoreError::RegistryMismatch));
    }

    #[test]
    fn rejects_entry_missing_from_registry() {
        let mut snapshot = ShellSnapshot::capture(&populated_shell());
        snapshot.storage.registry = AddressRegistry::new(OWNER);
        let err = snapshot.into_shell().unwrap_err();
        assert!(matches!(err, StoreError::RegistryMismatch));
    }

    #[test]
    fn rejects_swapped_owner() {
        let mut snapshot = ShellSnapshot::capture(&DelegatingShell::new(
            OWNER,
            ShellConfig::default(),
        ));
        snapshot.storage.registry = AddressRegistry::new(HOLDER);
        let err = snapshot.into_shell().unwrap_err();
        assert!(matches!(err, StoreError::OwnerMismatch { owner, .. } if owner == HOLDER));
    }

    #[test]
    fn rejects_controller_without_deployment() {
        let shell = populated_shell();
        let mut snapshot = ShellSnapshot::capture(&shell);
        snapshot
            .deployments
            .remove(&shell.addresses(Role::Controller));
        let err = snapshot.into_shell().unwrap_err();
        assert!(matches!(
            err,
            StoreError::Controller(ShellError::NotDeployed(_))
        ));
    }

    #[test]
    fn rejects_balance_minted_outside_ledger() {
        let mut snapshot = ShellSnapshot::capture(&populated_shell());
        snapshot.storage.ledger.balances.insert(HOLDER, 5);
        let err = snapshot.into_shell().unwrap_err();
        assert!(matches!(err, StoreError::LedgerInconsistent { .. }));
    }

    #[test]
    fn rejects_supply_above_cap() {
        let mut snapshot = ShellSnapshot::capture(&populated_shell());
        snapshot.storage.ledger.cap = 1;
        let err = snapshot.into_shell().unwrap_err();
        assert!(matches!(err, StoreError::LedgerInconsistent { .. }));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
