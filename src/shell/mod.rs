//! The persistent half of the ledger.
//!
//! [`DelegatingShell`] owns every durable field: the address registry and the
//! ledger state. It answers registry operations itself and forwards all other
//! calls to whichever backend the registry names as `controller`, handing the
//! backend an [`ExecutionContext`] over the shell's own storage.
//!
//! Each invocation runs against a staged copy of that storage. Nothing the
//! backend writes (balances, events, registry changes made through the
//! context) becomes visible unless the whole call succeeds.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    address::{Address, Role},
    backend::{BackendCatalog, Call, LedgerBackend, Output},
    config::{ReentrancyPolicy, ShellConfig},
    journal::AdminJournal,
    ledger::{LedgerError, LedgerEvent, LedgerState},
    registry::{AddressRegistry, RegistryChange, RegistryError},
};


#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DispatchFailure {
    #[error("no controller configured")]
    NoController,
    #[error("no backend deployed at {0}")]
    UnknownBackend(Address),
    #[error("backend does not implement {0}")]
    Unsupported(&'static str),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ShellError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchFailure),
    #[error("cannot register {0} as controller: nothing is deployed there")]
    NotDeployed(Address),
    #[error("backend {module} at {address} declares an incompatible storage layout")]
    IncompatibleLayout {
        address: Address,
        module: &'static str,
    },
    #[error("reentrant {operation} rejected at depth {depth}")]
    Reentrancy {
        operation: &'static str,
        depth: usize,
    },
}

impl ShellError {
    /// True for any caller-permission failure, registry or ledger side.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            ShellError::Registry(RegistryError::Unauthorized { .. })
                | ShellError::Ledger(LedgerError::Unauthorized { .. })
        )
    }
}

/// Everything the shell persists on behalf of its backends.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShellStorage {
    pub registry: AddressRegistry,
    pub ledger: LedgerState,
}

impl ShellStorage {
    pub fn new(owner: Address) -> Self {
        Self {
            registry: AddressRegistry::new(owner),
            ledger: LedgerState::new(),
        }
    }
}

/// Authorize, validate and apply a registry write. Shared by the shell's own
/// entry point and by writes issued from delegated code.
fn write_registry(
    storage: &mut ShellStorage,
    catalog: &BackendCatalog,
    caller: &Address,
    role: Role,
    holder: Address,
) -> Result<RegistryChange, ShellError> {
    storage.registry.ensure_owner(caller)?;
    if role == Role::Controller && !holder.is_zero() {
        check_controller(catalog, holder)?;
    }
    Ok(storage.registry.set_key_holder(caller, role, holder)?)
}

/// A controller must be deployed and must address the shell's storage with
/// the same layout.
pub(crate) fn check_controller(
    catalog: &BackendCatalog,
    holder: Address,
) -> Result<(), ShellError> {
    let backend = catalog.get(&holder).ok_or(ShellError::NotDeployed(holder))?;
    if !backend.layout().is_compatible_with(&LedgerState::LAYOUT) {
        return Err(ShellError::IncompatibleLayout {
            address: holder,
            module: backend.module_id(),
        });
    }
    Ok(())
}

/// What a backend sees while it runs: the shell's identity and storage, the
/// original caller, and a way back into the shell.
pub struct ExecutionContext<'a> {
    shell: Address,
    caller: Address,
    depth: usize,
    storage: &'a mut ShellStorage,
    catalog: &'a BackendCatalog,
    config: &'a ShellConfig,
    events: &'a mut Vec<LedgerEvent>,
    changes: &'a mut Vec<RegistryChange>,
}

impl<'a> ExecutionContext<'a> {
    pub fn caller(&self) -> Address {
        self.caller
    }

    pub fn shell_address(&self) -> Address {
        self.shell
    }

    /// Nesting level; the outermost dispatch runs at 0.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn config(&self) -> &ShellConfig {
        self.config
    }

    pub fn ledger(&self) -> &LedgerState {
        &self.storage.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut LedgerState {
        &mut self.storage.ledger
    }

    /// Registry read from inside delegated code. Same answer as
    /// [`DelegatingShell::addresses`] for the same storage.
    pub fn check_address(&self, role: Role) -> Address {
        self.storage.registry.addresses(role)
    }

    pub fn emit(&mut self, event: LedgerEvent) {
        self.events.push(event);
    }

    /// Call back into the shell from delegated code. The caller identity is
    /// carried through unchanged, and forwarded calls resolve `controller`
    /// from the current staged registry, not the one seen at entry.
    pub fn invoke(&mut self, call: &Call) -> Result<Output, ShellError> {
        self.guard(call.name())?;
        self.depth += 1;
        let result = match call {
            Call::SetKeyHolder { role, holder } => {
                self.apply_registry_write(*role, *holder).map(|_| Output::Unit)
            }
            Call::Addresses { role } | Call::CheckAddress { role } => {
                Ok(Output::Address(self.check_address(*role)))
            }
            _ => self.dispatch(call),
        };
        self.depth -= 1;
        result
    }

    /// Registry write from delegated code, authorized against the original
    /// caller.
    pub fn set_key_holder(&mut self, role: Role, holder: Address) -> Result<(), ShellError> {
        self.guard("setKeyHolder")?;
        self.apply_registry_write(role, holder)
    }

    fn apply_registry_write(&mut self, role: Role, holder: Address) -> Result<(), ShellError> {
        let change = write_registry(self.storage, self.catalog, &self.caller, role, holder)?;
        self.changes.push(change);
        Ok(())
    }

    fn guard(&self, operation: &'static str) -> Result<(), ShellError> {
        let allowed = match self.config.reentrancy {
            ReentrancyPolicy::Guarded => false,
            ReentrancyPolicy::Unguarded { max_depth } => self.depth < max_depth,
        };
        if !allowed {
            tracing::warn!(operation, depth = self.depth, "reentrant call rejected");
            return Err(ShellError::Reentrancy {
                operation,
                depth: self.depth,
            });
        }
        Ok(())
    }

    fn dispatch(&mut self, call: &Call) -> Result<Output, ShellError> {
        let controller = self.check_address(Role::Controller);
        if controller.is_zero() {
            return Err(DispatchFailure::NoController.into());
        }
        let backend = self
            .catalog
            .get(&controller)
            .ok_or(DispatchFailure::UnknownBackend(controller))?;
        tracing::trace!(
            op = call.name(),
            %controller,
            module = backend.module_id(),
            depth = self.depth,
            "delegating"
        );
        backend.execute(self, call)
    }
}

/// The stateful unit clients talk to.
#[derive(Debug)]
pub struct DelegatingShell {
    address: Address,
    nonce: u64,
    storage: ShellStorage,
    catalog: BackendCatalog,
    config: ShellConfig,
    journal: AdminJournal,
    events: Vec<LedgerEvent>,
}

impl DelegatingShell {
    /// Create a shell whose `owner` is `owner`. The shell's own address is
    /// derived from the owner with nonce 0.
    pub fn new(owner: Address, config: ShellConfig) -> Self {
        let address = Address::derive_deployment(&owner, 0);
        tracing::info!(%address, %owner, "shell created");
        Self {
            address,
            nonce: 1,
            storage: ShellStorage::new(owner),
            catalog: BackendCatalog::new(),
            config,
            journal: AdminJournal::new(),
            events: Vec::new(),
        }
    }

    pub(crate) fn restore(
        address: Address,
        nonce: u64,
        storage: ShellStorage,
        catalog: BackendCatalog,
        config: ShellConfig,
        journal: AdminJournal,
        events: Vec<LedgerEvent>,
    ) -> Self {
        Self {
            address,
            nonce,
            storage,
            catalog,
            config,
            journal,
            events,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn storage(&self) -> &ShellStorage {
        &self.storage
    }

    pub fn ledger(&self) -> &LedgerState {
        &self.storage.ledger
    }

    pub fn catalog(&self) -> &BackendCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn journal(&self) -> &AdminJournal {
        &self.journal
    }

    /// Committed events, oldest first, capped at `config.event_retention`.
    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    /// Place backend code at a fresh address. Deploying does not activate
    /// it; that takes a `controller` registry write.
    pub fn deploy(&mut self, deployer: Address, module: Arc<dyn LedgerBackend>) -> Address {
        let address = Address::derive_deployment(&deployer, self.nonce);
        self.nonce += 1;
        tracing::info!(%address, %deployer, module = module.module_id(), "backend deployed");
        self.catalog.install(address, module);
        address
    }

    pub fn addresses(&self, role: Role) -> Address {
        self.storage.registry.addresses(role)
    }

    pub fn set_key_holder(
        &mut self,
        caller: Address,
        role: Role,
        holder: Address,
    ) -> Result<(), ShellError> {
        match write_registry(&mut self.storage, &self.catalog, &caller, role, holder) {
            Ok(change) => {
                tracing::info!(%caller, %role, previous = %change.previous, %holder, "key holder set");
                self.journal.record(change);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%caller, %role, %holder, error = %err, "key holder update rejected");
                Err(err)
            }
        }
    }

    /// Entry point for every client operation.
    pub fn invoke(&mut self, caller: Address, call: &Call) -> Result<Output, ShellError> {
        match call {
            Call::SetKeyHolder { role, holder } => self
                .set_key_holder(caller, *role, *holder)
                .map(|_| Output::Unit),
            Call::Addresses { role } | Call::CheckAddress { role } => {
                Ok(Output::Address(self.addresses(*role)))
            }
            _ => self.delegate(caller, call),
        }
    }

    fn record_events(&mut self, events: Vec<LedgerEvent>) {
        self.events.extend(events);
        let keep = self.config.event_retention;
        if self.events.len() > keep {
            let excess = self.events.len() - keep;
            self.events.drain(..excess);
            tracing::trace!(dropped = excess, kept = keep, "old events pruned");
        }
    }

    fn delegate(&mut self, caller: Address, call: &Call) -> Result<Output, ShellError> {
        let mut staged = self.storage.clone();
        let mut events = Vec::new();
        let mut changes = Vec::new();
        let result = ExecutionContext {
            shell: self.address,
            caller,
            depth: 0,
            storage: &mut staged,
            catalog: &self.catalog,
            config: &self.config,
            events: &mut events,
            changes: &mut changes,
        }
        .dispatch(call);

        match result {
            Ok(output) => {
                self.storage = staged;
                self.record_events(events);
                for change in changes {
                    tracing::info!(%caller, role = %change.role, holder = %change.holder, "key holder set from delegated code");
                    self.journal.record(change);
                }
                tracing::debug!(op = call.name(), %caller, "committed");
                Ok(output)
            }
            Err(err) => {
                tracing::debug!(op = call.name(), %caller, error = %err, "rolled back");
                Err(err)
            }
        }
    }
}
