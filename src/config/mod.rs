use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("reentrancy max_depth must be at least 1")]
    ZeroDepth,
}

/// Who may call `mint`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MintPolicy {
    /// Any caller may mint (up to the cap).
    #[default]
    Open,
    /// Only the registry's `minter` or `owner` may mint.
    Restricted,
}

/// Whether delegated code may call back into the shell.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReentrancyPolicy {
    /// Nested dispatch and registry writes from delegated code are rejected.
    #[default]
    Guarded,
    /// Nested dispatch is allowed up to `max_depth` levels below the
    /// outermost call. Each level resolves `controller` afresh.
    Unguarded { max_depth: usize },
}

pub const DEFAULT_EVENT_RETENTION: usize = 1024;

/// Creation-time settings; fixed into the shell and persisted with it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellConfig {
    pub mint_policy: MintPolicy,
    pub reentrancy: ReentrancyPolicy,
    /// Most recent ledger events kept in the shell; older ones are dropped.
    pub event_retention: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            mint_policy: MintPolicy::default(),
            reentrancy: ReentrancyPolicy::default(),
            event_retention: DEFAULT_EVENT_RETENTION,
        }
    }
}

impl ShellConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: ShellConfig =
            serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let ReentrancyPolicy::Unguarded { max_depth: 0 } = self.reentrancy {
            return Err(ConfigError::ZeroDepth);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn empty_object_yields_defaults() {
        let config: ShellConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ShellConfig::default());
        assert_eq!(config.mint_policy, MintPolicy::Open);
        assert_eq!(config.reentrancy, ReentrancyPolicy::Guarded);
        assert_eq!(config.event_retention, DEFAULT_EVENT_RETENTION);
    }

    #[test]
    fn parses_explicit_policies() {
        let config: ShellConfig = serde_json::from_str(
            r#"{"mint_policy":"restricted","reentrancy":{"mode":"unguarded","max_depth":2}}"#,
        )
        .unwrap();
        assert_eq!(config.mint_policy, MintPolicy::Restricted);
        assert_eq!(
            config.reentrancy,
            ReentrancyPolicy::Unguarded { max_depth: 2 }
        );
    }

    #[test]
    fn event_retention_can_be_lowered() {
        let config: ShellConfig = serde_json::from_str(r#"{"event_retention":16}"#).unwrap();
        assert_eq!(config.event_retention, 16);
        assert_eq!(config.mint_policy, MintPolicy::Open);
    }

    #[test]
    fn load_rejects_zero_depth() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"reentrancy":{"mode":"unguarded","max_depth":0}}"#)
            .unwrap();
        let err = ShellConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroDepth));
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not json").unwrap();
        let err = ShellConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }
}
