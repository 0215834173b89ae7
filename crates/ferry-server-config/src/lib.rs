// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for the ferry server.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub migration: Migration,

    #[serde(default, rename = "pool")]
    pub pools: BTreeMap<String, Pool>,

    #[serde(default, rename = "instance")]
    pub instances: BTreeMap<String, Instance>,
}

/// Deadlines applied by migration sessions. All values are in seconds.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Migration {
    /// Bound on every write to the control connection.
    pub control_write_timeout_secs: u64,

    /// Bound on sending the terminal status to the peer.
    pub final_status_timeout_secs: u64,

    /// Bound on the close handshake of the control connection.
    pub close_timeout_secs: u64,

    /// Every issued connection must be attached within this window.
    pub connect_timeout_secs: u64,

    /// How long teardown waits for transfer workers to wind down.
    pub drain_timeout_secs: u64,
}

impl Default for Migration {
    fn default() -> Self {
        Self {
            control_write_timeout_secs: 30,
            final_status_timeout_secs: 10,
            close_timeout_secs: 1,
            connect_timeout_secs: 60,
            drain_timeout_secs: 30,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum PoolDriver {
    /// Volumes live in a directory tree on the host.
    Dir,
    /// Volumes live in process memory.
    Memory,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Pool {
    pub driver: PoolDriver,

    /// Backing directory, required by the `dir` driver.
    #[serde(default)]
    pub source: Option<PathBuf>,

    /// Whether the pool's backing store is shared by every cluster member.
    #[serde(default)]
    pub remote: bool,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Instance {
    pub pool: String,

    #[serde(default)]
    pub running: bool,

    #[serde(default)]
    pub ephemeral: bool,

    /// Custom volumes attached to the instance, in addition to its root
    /// volume (which shares the instance's name).
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// Errors which may be returned when parsing the server configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pool {0} uses the dir driver but has no source directory")]
    MissingPoolSource(String),

    #[error("instance {0} refers to unknown pool {1}")]
    UnknownPool(String, String),
}

impl Config {
    fn validate(&self) -> Result<(), ParseError> {
        for (name, pool) in &self.pools {
            if pool.driver == PoolDriver::Dir && pool.source.is_none() {
                return Err(ParseError::MissingPoolSource(name.clone()));
            }
        }
        for (name, inst) in &self.instances {
            if !self.pools.contains_key(&inst.pool) {
                return Err(ParseError::UnknownPool(
                    name.clone(),
                    inst.pool.clone(),
                ));
            }
        }
        Ok(())
    }
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_can_be_serialized_as_toml() {
        let mut config = Config::default();
        config.pools.insert(
            "default".to_string(),
            Pool {
                driver: PoolDriver::Dir,
                source: Some("/var/lib/ferry/default".into()),
                remote: false,
            },
        );
        config.instances.insert(
            "web".to_string(),
            Instance {
                pool: "default".to_string(),
                running: true,
                ephemeral: false,
                volumes: vec!["data".to_string()],
            },
        );
        let serialized = toml::ser::to_string(&config).unwrap();
        let deserialized: Config = toml::de::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn missing_migration_table_uses_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [pool.scratch]
            driver = "memory"

            [migration]
            connect_timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.migration.connect_timeout_secs, 5);
        assert_eq!(cfg.migration.control_write_timeout_secs, 30);
        assert_eq!(cfg.pools["scratch"].driver, PoolDriver::Memory);
    }

    #[test]
    fn parse_rejects_dangling_pool_reference() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [instance.web]
            pool = "nowhere"
            "#
        )
        .unwrap();
        assert!(matches!(
            parse(file.path()),
            Err(ParseError::UnknownPool(i, p)) if i == "web" && p == "nowhere"
        ));
    }
}
