use std::{fmt, str::FromStr};

use ed25519_dalek::VerifyingKey;
use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub const ADDRESS_LEN: usize = 20;

/// 20-byte identity of an account, a shell, or a deployed backend module.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// The empty address, returned for registry names with no holder.
    pub const ZERO: Address = Address([0u8; ADDRESS_LEN]);

    pub const fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Account address for an Ed25519 key: last 20 bytes of sha256(pk).
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let digest: [u8; 32] = Sha256::digest(key.as_bytes()).into();
        Self::tail(digest)
    }

    /// Address of a unit deployed by `deployer` with the given nonce.
    pub fn derive_deployment(deployer: &Address, nonce: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"upt-deploy");
        hasher.update(deployer.0);
        hasher.update(nonce.to_le_bytes());
        Self::tail(hasher.finalize().into())
    }

    fn tail(digest: [u8; 32]) -> Self {
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&digest[32 - ADDRESS_LEN..]);
        Self(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("invalid hex in address: {0}")]
    Hex(String),
    #[error("address must be {ADDRESS_LEN} bytes, got {0}")]
    Length(usize),
    #[error("unknown registry name {0:?}")]
    UnknownRole(String),
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bytes = hex::decode(body).map_err(|e| AddressParseError::Hex(e.to_string()))?;
        if bytes.len() != ADDRESS_LEN {
            return Err(AddressParseError::Length(bytes.len()));
        }
        let mut out = [0u8; ADDRESS_LEN];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

// Hex strings rather than byte arrays so addresses work as JSON map keys.
impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(D::Error::custom)
    }
}

/// Registry names. Closed set: the registry is both the permission store
/// and the backend lookup table, so free-form keys are not accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Controller,
    Minter,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Owner, Role::Controller, Role::Minter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Controller => "controller",
            Role::Minter => "minter",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| AddressParseError::UnknownRole(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn display_and_parse_agree() {
        let addr = Address::derive_deployment(&Address::ZERO, 7);
        let text = addr.to_string();
        assert!(text.starts_with("0x"));
        assert_eq!(text.len(), 2 + 2 * ADDRESS_LEN);
        assert_eq!(text.parse::<Address>().unwrap(), addr);
        assert_eq!(text.trim_start_matches("0x").parse::<Address>().unwrap(), addr);
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(
            "0xdeadbeef".parse::<Address>().unwrap_err(),
            AddressParseError::Length(4)
        );
        assert!(matches!(
            "0xzz".parse::<Address>().unwrap_err(),
            AddressParseError::Hex(_)
        ));
    }

    #[test]
    fn deployment_addresses_depend_on_nonce_and_deployer() {
        let deployer = Address::from_bytes([9u8; ADDRESS_LEN]);
        let a = Address::derive_deployment(&deployer, 0);
        let b = Address::derive_deployment(&deployer, 1);
        let c = Address::derive_deployment(&Address::ZERO, 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, Address::derive_deployment(&deployer, 0));
    }

    #[test]
    fn key_addresses_are_stable() {
        let sk = SigningKey::generate(&mut OsRng);
        let pk = sk.verifying_key();
        assert_eq!(
            Address::from_verifying_key(&pk),
            Address::from_verifying_key(&pk)
        );
        assert!(!Address::from_verifying_key(&pk).is_zero());
    }

    #[test]
    fn roles_parse_from_registry_names() {
        assert_eq!("owner".parse::<Role>().unwrap(), Role::Owner);
        assert_eq!("controller".parse::<Role>().unwrap(), Role::Controller);
        assert_eq!("minter".parse::<Role>().unwrap(), Role::Minter);
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn address_serializes_as_hex_string() {
        let addr = Address::from_bytes([0xab; ADDRESS_LEN]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, format!("\"0x{}\"", "ab".repeat(ADDRESS_LEN)));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
