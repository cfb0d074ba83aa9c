use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    address::{Address, Role},
    ledger::{Amount, StorageLayout},
    logic::LedgerLogic,
    shell::{ExecutionContext, ShellError},
};

/// Every operation a client can send to the shell. `SetKeyHolder`,
/// `Addresses` and `CheckAddress` are served by the shell itself; everything
/// else is forwarded to the active controller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Call {
    SetKeyHolder {
        role: Role,
        holder: Address,
    },
    Addresses {
        role: Role,
    },
    CheckAddress {
        role: Role,
    },
    Name,
    Symbol,
    Initialize {
        #[serde(with = "crate::ledger::serde_amount")]
        cap: Amount,
    },
    Mint {
        to: Address,
        #[serde(with = "crate::ledger::serde_amount")]
        amount: Amount,
    },
    Transfer {
        to: Address,
        #[serde(with = "crate::ledger::serde_amount")]
        amount: Amount,
    },
    Approve {
        spender: Address,
        #[serde(with = "crate::ledger::serde_amount")]
        amount: Amount,
    },
    TransferFrom {
        from: Address,
        to: Address,
        #[serde(with = "crate::ledger::serde_amount")]
        amount: Amount,
    },
    TransferWithPayload {
        to: Address,
        #[serde(with = "crate::ledger::serde_amount")]
        amount: Amount,
        #[serde(with = "crate::ledger::serde_bytes")]
        data: Vec<u8>,
    },
    BalanceOf {
        owner: Address,
    },
    TotalSupply,
    Allowance {
        owner: Address,
        spender: Address,
    },
    Cap,
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::SetKeyHolder { .. } => "setKeyHolder",
            Call::Addresses { .. } => "addresses",
            Call::CheckAddress { .. } => "checkAddress",
            Call::Name => "name",
            Call::Symbol => "symbol",
            Call::Initialize { .. } => "initialize",
            Call::Mint { .. } => "mint",
            Call::Transfer { .. } => "transfer",
            Call::Approve { .. } => "approve",
            Call::TransferFrom { .. } => "transferFrom",
            Call::TransferWithPayload { .. } => "transferWithPayload",
            Call::BalanceOf { .. } => "balanceOf",
            Call::TotalSupply => "totalSupply",
            Call::Allowance { .. } => "allowance",
            Call::Cap => "cap",
        }
    }

    pub fn is_shell_native(&self) -> bool {
        matches!(
            self,
            Call::SetKeyHolder { .. } | Call::Addresses { .. } | Call::CheckAddress { .. }
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Output {
    Unit,
    Text(String),
    Amount(#[serde(with = "crate::ledger::serde_amount")] Amount),
    Address(Address),
}

impl Output {
    pub fn amount(&self) -> Option<Amount> {
        match self {
            Output::Amount(v) => Some(*v),
            _ => None,
        }
    }

    pub fn address(&self) -> Option<Address> {
        match self {
            Output::Address(a) => Some(*a),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Output::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Unit => f.write_str("ok"),
            Output::Text(s) => f.write_str(s),
            Output::Amount(v) => write!(f, "{v}"),
            Output::Address(a) => write!(f, "{a}"),
        }
    }
}

/// Swappable ledger code. Implementations hold no state: everything they
/// read or write goes through the context, which wraps the shell's storage.
///
/// Layout contract: `layout()` must describe exactly the fields the module
/// touches. The shell compares it against its own allocation before the
/// module can become `controller`.
pub trait LedgerBackend: Send + Sync {
    fn module_id(&self) -> &'static str;

    fn layout(&self) -> StorageLayout;

    fn execute(&self, ctx: &mut ExecutionContext<'_>, call: &Call) -> Result<Output, ShellError>;
}

/// Code deployed at addresses known to the shell.
#[derive(Clone, Default)]
pub struct BackendCatalog {
    modules: BTreeMap<Address, Arc<dyn LedgerBackend>>,
}

impl BackendCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, address: Address, module: Arc<dyn LedgerBackend>) {
        tracing::debug!(%address, module = module.module_id(), "backend installed");
        self.modules.insert(address, module);
    }

    pub fn get(&self, address: &Address) -> Option<Arc<dyn LedgerBackend>> {
        self.modules.get(address).cloned()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.modules.contains_key(address)
    }

    /// Address → module id, for persistence.
    pub fn deployments(&self) -> BTreeMap<Address, String> {
        self.modules
            .iter()
            .map(|(addr, module)| (*addr, module.module_id().to_string()))
            .collect()
    }
}

impl fmt::Debug for BackendCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.deployments()).finish()
    }
}

/// Modules this build can instantiate from a persisted module id.
pub fn builtin_module(module_id: &str) -> Option<Arc<dyn LedgerBackend>> {
    match module_id {
        LedgerLogic::MODULE_ID => Some(Arc::new(LedgerLogic::new())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::address::ADDRESS_LEN;
    use crate::ledger::LedgerState;

    #[test]
    fn registry_operations_are_shell_native() {
        let role = Role::Controller;
        assert!(Call::Addresses { role }.is_shell_native());
        assert!(Call::SetKeyHolder {
            role,
            holder: Address::ZERO
        }
        .is_shell_native());
        assert!(Call::CheckAddress { role }.is_shell_native());
        assert!(!Call::TotalSupply.is_shell_native());
    }

    #[test]
    fn call_json_uses_op_tag() {
        let call = Call::TransferWithPayload {
            to: Address::from_bytes([2; ADDRESS_LEN]),
            amount: 10,
            data: b"hi".to_vec(),
        };
        let json = serde_json::to_string(&call).unwrap();
        assert!(json.contains("\"op\":\"transfer_with_payload\""));
        assert!(json.contains("\"data\":\"6869\""));
        assert_eq!(serde_json::from_str::<Call>(&json).unwrap(), call);
    }

    #[test]
    fn builtin_modules_resolve_by_id() {
        let module = builtin_module(LedgerLogic::MODULE_ID).expect("ledger logic");
        assert_eq!(module.module_id(), LedgerLogic::MODULE_ID);
        assert!(module.layout().is_compatible_with(&LedgerState::LAYOUT));
        assert!(builtin_module("nope/v0").is_none());
    }

    #[test]
    fn catalog_lists_deployments() {
        let mut catalog = BackendCatalog::new();
        let addr = Address::from_bytes([4; ADDRESS_LEN]);
        assert!(!catalog.contains(&addr));
        catalog.install(addr, Arc::new(LedgerLogic::new()));
        assert!(catalog.contains(&addr));
        assert_eq!(
            catalog.deployments().get(&addr).map(String::as_str),
            Some(LedgerLogic::MODULE_ID)
        );
    }
}
