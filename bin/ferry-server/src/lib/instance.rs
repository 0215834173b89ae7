// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instances and the lifecycle operations migrations need from them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slog::{info, Logger};

use crate::storage::Pools;

/// Lifecycle control over one instance.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstanceLifecycle: Send + Sync {
    fn name(&self) -> String;

    async fn is_running(&self) -> bool;

    async fn is_ephemeral(&self) -> bool;

    /// Sets whether the instance is destroyed when it stops.
    async fn update_ephemeral(&self, ephemeral: bool) -> anyhow::Result<()>;

    /// Stops the instance, waiting at most `timeout` for a clean shutdown
    /// unless `force` is set.
    async fn stop(
        &self,
        timeout: Option<Duration>,
        force: bool,
    ) -> anyhow::Result<()>;

    async fn start(&self) -> anyhow::Result<()>;

    /// Captures the running state of the instance, leaving it stopped.
    async fn checkpoint(&self) -> anyhow::Result<Vec<u8>>;

    /// Resumes the instance from a checkpoint.
    async fn restore(&self, image: Vec<u8>) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointImage {
    instance: String,
    taken_at: DateTime<Utc>,
    boot_count: u64,
}

#[derive(Clone, Debug)]
struct InstanceState {
    running: bool,
    ephemeral: bool,
    boot_count: u64,
}

/// An instance tracked by this server.
pub struct LocalInstance {
    log: Logger,
    name: String,
    pool: String,
    volumes: Mutex<Vec<String>>,
    state: Mutex<InstanceState>,
    table: Weak<InstanceStore>,
}

impl LocalInstance {
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Custom volumes attached in addition to the root volume.
    pub fn volumes(&self) -> Vec<String> {
        self.volumes.lock().unwrap().clone()
    }

    pub fn set_volumes(&self, volumes: Vec<String>) {
        *self.volumes.lock().unwrap() = volumes;
    }

    pub fn view(&self) -> ferry_api_types::Instance {
        let state = self.state.lock().unwrap().clone();
        ferry_api_types::Instance {
            name: self.name.clone(),
            pool: self.pool.clone(),
            running: state.running,
            ephemeral: state.ephemeral,
            volumes: self.volumes(),
        }
    }

    /// Removes an ephemeral instance and its root volume once it stopped.
    async fn destroy(&self) -> anyhow::Result<()> {
        info!(self.log, "destroying stopped ephemeral instance");
        let Some(table) = self.table.upgrade() else {
            return Ok(());
        };
        table.remove(&self.name);
        let driver = table.pools.get(&self.pool)?;
        if driver.has_volume(&self.name).await? {
            driver.delete_volume(&self.name).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceLifecycle for LocalInstance {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    async fn is_ephemeral(&self) -> bool {
        self.state.lock().unwrap().ephemeral
    }

    async fn update_ephemeral(&self, ephemeral: bool) -> anyhow::Result<()> {
        self.state.lock().unwrap().ephemeral = ephemeral;
        Ok(())
    }

    async fn stop(
        &self,
        _timeout: Option<Duration>,
        force: bool,
    ) -> anyhow::Result<()> {
        let ephemeral = {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                bail!("instance {} is not running", self.name);
            }
            state.running = false;
            state.ephemeral
        };
        info!(self.log, "instance stopped"; "force" => force);
        if ephemeral {
            self.destroy().await?;
        }
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.running {
            bail!("instance {} is already running", self.name);
        }
        state.running = true;
        state.boot_count += 1;
        info!(self.log, "instance started"; "boot_count" => state.boot_count);
        Ok(())
    }

    async fn checkpoint(&self) -> anyhow::Result<Vec<u8>> {
        let image = {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                bail!("cannot checkpoint stopped instance {}", self.name);
            }
            state.running = false;
            CheckpointImage {
                instance: self.name.clone(),
                taken_at: Utc::now(),
                boot_count: state.boot_count,
            }
        };
        info!(self.log, "instance checkpointed");
        let s = ron::ser::to_string(&image)?;
        Ok(s.into_bytes())
    }

    async fn restore(&self, image: Vec<u8>) -> anyhow::Result<()> {
        let s = String::from_utf8(image).context("checkpoint is not UTF-8")?;
        let image: CheckpointImage =
            ron::de::from_str(&s).context("malformed checkpoint")?;
        let mut state = self.state.lock().unwrap();
        if state.running {
            bail!("instance {} is already running", self.name);
        }
        state.running = true;
        state.boot_count = image.boot_count;
        info!(self.log, "instance restored from checkpoint";
            "source_instance" => &image.instance,
            "taken_at" => %image.taken_at);
        Ok(())
    }
}

/// Every instance known to this server.
pub struct InstanceStore {
    log: Logger,
    pools: Pools,
    instances: Mutex<BTreeMap<String, Arc<LocalInstance>>>,
}

impl InstanceStore {
    pub fn new(log: Logger, pools: Pools) -> Arc<Self> {
        Arc::new(Self { log, pools, instances: Mutex::new(BTreeMap::new()) })
    }

    pub fn get(&self, name: &str) -> Option<Arc<LocalInstance>> {
        self.instances.lock().unwrap().get(name).cloned()
    }

    /// Registers a new instance whose root volume, named after it, lives in
    /// `pool`.
    pub fn create(
        self: &Arc<Self>,
        name: &str,
        pool: &str,
        volumes: Vec<String>,
        running: bool,
        ephemeral: bool,
    ) -> anyhow::Result<Arc<LocalInstance>> {
        self.pools.get(pool)?;
        let mut instances = self.instances.lock().unwrap();
        if instances.contains_key(name) {
            return Err(anyhow!("instance {name} already exists"));
        }
        let inst = Arc::new(LocalInstance {
            log: self.log.new(slog::o!("instance" => name.to_string())),
            name: name.to_string(),
            pool: pool.to_string(),
            volumes: Mutex::new(volumes),
            state: Mutex::new(InstanceState {
                running,
                ephemeral,
                boot_count: u64::from(running),
            }),
            table: Arc::downgrade(self),
        });
        instances.insert(name.to_string(), inst.clone());
        Ok(inst)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<LocalInstance>> {
        self.instances.lock().unwrap().remove(name)
    }

    pub fn pools(&self) -> &Pools {
        &self.pools
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::memory::MemoryDriver;
    use crate::storage::{ContentType, Driver, VolumeData};

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn store_with_pool() -> (Arc<InstanceStore>, Arc<MemoryDriver>) {
        let driver = Arc::new(MemoryDriver::new(test_logger()));
        let mut pools = Pools::new();
        pools.insert("default", driver.clone());
        (InstanceStore::new(test_logger(), pools), driver)
    }

    #[tokio::test]
    async fn stopping_an_ephemeral_instance_destroys_it() {
        let (store, driver) = store_with_pool();
        driver
            .create_volume("web", VolumeData::empty(ContentType::Filesystem))
            .unwrap();
        let inst = store.create("web", "default", vec![], true, true).unwrap();

        inst.stop(None, true).await.unwrap();
        assert!(store.get("web").is_none());
        assert!(!driver.has_volume("web").await.unwrap());
    }

    #[tokio::test]
    async fn clearing_ephemeral_protects_the_instance() {
        let (store, driver) = store_with_pool();
        driver
            .create_volume("web", VolumeData::empty(ContentType::Filesystem))
            .unwrap();
        let inst = store.create("web", "default", vec![], true, true).unwrap();

        inst.update_ephemeral(false).await.unwrap();
        inst.stop(None, true).await.unwrap();
        inst.start().await.unwrap();
        inst.update_ephemeral(true).await.unwrap();

        let view = store.get("web").unwrap().view();
        assert!(view.running && view.ephemeral);
        assert!(driver.has_volume("web").await.unwrap());
    }

    #[tokio::test]
    async fn checkpoint_round_trip() {
        let (store, _driver) = store_with_pool();
        let src = store.create("a", "default", vec![], true, false).unwrap();
        let dst = store.create("b", "default", vec![], false, false).unwrap();

        let image = src.checkpoint().await.unwrap();
        assert!(!src.is_running().await);
        dst.restore(image).await.unwrap();
        assert!(dst.is_running().await);
        assert!(dst.restore(b"garbage".to_vec()).await.is_err());
    }

    #[test]
    fn unknown_pool_is_rejected() {
        let (store, _driver) = store_with_pool();
        assert!(store.create("a", "nope", vec![], false, false).is_err());
        store.create("a", "default", vec![], false, false).unwrap();
        assert!(store.create("a", "default", vec![], false, false).is_err());
    }
}
