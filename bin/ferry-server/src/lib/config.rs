// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes a server config which may be parsed from a TOML file, and builds
//! the server's pools and instances from it.

use std::sync::Arc;

use anyhow::Context;
use slog::{info, Logger};

pub use ferry_server_config::*;

use crate::instance::InstanceStore;
use crate::storage::dir::DirDriver;
use crate::storage::memory::{MemoryDriver, SharedStore};
use crate::storage::{ContentType, Driver, Pools, StorageError, VolumeData};

/// A configured back-end, before it is put behind the [`Driver`] interface.
enum Backend {
    Dir(DirDriver),
    Memory(MemoryDriver),
}

impl Backend {
    fn build(log: &Logger, name: &str, pool: &Pool) -> anyhow::Result<Self> {
        let log = log.new(slog::o!("pool" => name.to_string()));
        let backend = match pool.driver {
            PoolDriver::Dir => {
                let root = pool.source.clone().ok_or_else(|| {
                    anyhow::anyhow!("pool {name} has no source directory")
                })?;
                Backend::Dir(
                    DirDriver::new(log, root)
                        .with_context(|| format!("opening pool {name}"))?,
                )
            }
            PoolDriver::Memory if pool.remote => Backend::Memory(
                MemoryDriver::remote(log, SharedStore::default()),
            ),
            PoolDriver::Memory => Backend::Memory(MemoryDriver::new(log)),
        };
        Ok(backend)
    }

    /// Creates an empty filesystem volume unless one exists already.
    async fn ensure_volume(&self, name: &str) -> Result<(), StorageError> {
        let empty = VolumeData::empty(ContentType::Filesystem);
        match self {
            Backend::Dir(d) => {
                if !d.has_volume(name).await? {
                    d.create_volume(name, empty).await?;
                }
            }
            Backend::Memory(m) => {
                if !m.has_volume(name).await? {
                    m.create_volume(name, empty)?;
                }
            }
        }
        Ok(())
    }

    fn into_driver(self) -> Arc<dyn Driver> {
        match self {
            Backend::Dir(d) => Arc::new(d),
            Backend::Memory(m) => Arc::new(m),
        }
    }
}

/// Builds the configured pools and registers the configured instances,
/// creating any of their volumes that do not exist yet.
pub async fn build_instances(
    log: &Logger,
    config: &Config,
) -> anyhow::Result<Arc<InstanceStore>> {
    let mut backends = Vec::with_capacity(config.pools.len());
    for (name, pool) in &config.pools {
        let backend = Backend::build(log, name, pool)?;
        for (inst_name, inst) in
            config.instances.iter().filter(|(_, i)| &i.pool == name)
        {
            for vol in std::iter::once(inst_name).chain(&inst.volumes) {
                backend
                    .ensure_volume(vol)
                    .await
                    .with_context(|| format!("seeding volume {name}/{vol}"))?;
            }
        }
        info!(log, "pool ready"; "pool" => name, "driver" => ?pool.driver);
        backends.push((name.clone(), backend));
    }

    let mut pools = Pools::new();
    for (name, backend) in backends {
        pools.insert(name, backend.into_driver());
    }

    let store = InstanceStore::new(log.new(slog::o!()), pools);
    for (name, inst) in &config.instances {
        store
            .create(
                name,
                &inst.pool,
                inst.volumes.clone(),
                inst.running,
                inst.ephemeral,
            )
            .with_context(|| format!("registering instance {name}"))?;
    }
    Ok(store)
}
