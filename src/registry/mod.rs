use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::address::{Address, Role};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("caller {caller} is not the registry owner")]
    Unauthorized { caller: Address },
    #[error("the owner entry is fixed at creation")]
    OwnerImmutable,
}

/// A committed (or staged) registry write.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryChange {
    pub caller: Address,
    pub role: Role,
    pub previous: Address,
    pub holder: Address,
}

/// Name-keyed address table used for permissioning and backend discovery.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressRegistry {
    entries: BTreeMap<Role, Address>,
}

impl AddressRegistry {
    pub fn new(owner: Address) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(Role::Owner, owner);
        Self { entries }
    }

    pub fn addresses(&self, role: Role) -> Address {
        self.entries.get(&role).copied().unwrap_or(Address::ZERO)
    }

    pub fn owner(&self) -> Address {
        self.addresses(Role::Owner)
    }

    /// The one capability check gating every administrative write.
    pub fn ensure_owner(&self, caller: &Address) -> Result<(), RegistryError> {
        if self.owner() != *caller {
            return Err(RegistryError::Unauthorized { caller: *caller });
        }
        Ok(())
    }

    pub fn set_key_holder(
        &mut self,
        caller: &Address,
        role: Role,
        holder: Address,
    ) -> Result<RegistryChange, RegistryError> {
        self.ensure_owner(caller)?;
        if role == Role::Owner {
            return Err(RegistryError::OwnerImmutable);
        }
        let previous = self.entries.insert(role, holder).unwrap_or(Address::ZERO);
        tracing::debug!(%role, %previous, %holder, "registry entry updated");
        Ok(RegistryChange {
            caller: *caller,
            role,
            previous,
            holder,
        })
    }

    pub fn entries(&self) -> impl Iterator<Item = (Role, Address)> + '_ {
        self.entries.iter().map(|(role, addr)| (*role, *addr))
    }
}
