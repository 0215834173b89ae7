// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A storage back-end keeping volumes in process memory.
//!
//! Besides serving scratch pools, this is the back-end with a native
//! transfer format ([`MigrationFsType::Memory`]) that other back-ends do not
//! understand. Two drivers built over the same [`SharedStore`] model a
//! remote pool shared by cluster members.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use slog::{info, warn, Logger};

use super::transfer::{
    encode_data, receive_into, recv_done, send_done, send_item, StagedVolume,
};
use super::{
    ContentType, Driver, ItemHeader, MigrationFsType, MigrationType,
    SnapshotInfo, StorageError, Volume, VolumeData, VolumeFiller,
    VolumePostHook, VolumeRevertHook, VolumeSourceArgs, VolumeStream,
    VolumeTargetArgs, FEATURE_COMPRESS, FEATURE_DELETE,
};

#[derive(Default)]
pub struct MemoryStore {
    volumes: BTreeMap<String, StagedVolume>,
}

pub type SharedStore = Arc<Mutex<MemoryStore>>;

pub struct MemoryDriver {
    log: Logger,
    store: SharedStore,
    remote: bool,
    types_override: Option<Vec<MigrationType>>,
}

impl MemoryDriver {
    pub fn new(log: Logger) -> Self {
        Self {
            log,
            store: SharedStore::default(),
            remote: false,
            types_override: None,
        }
    }

    /// A driver over a store other drivers may also see.
    pub fn remote(log: Logger, store: SharedStore) -> Self {
        Self { log, store, remote: true, types_override: None }
    }

    /// Replaces the advertised transfer formats, regardless of mode.
    pub fn with_migration_types(mut self, types: Vec<MigrationType>) -> Self {
        self.types_override = Some(types);
        self
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    pub fn create_volume(
        &self,
        name: &str,
        data: VolumeData,
    ) -> Result<(), StorageError> {
        let mut store = self.store.lock().unwrap();
        if store.volumes.contains_key(name) {
            return Err(StorageError::AlreadyExists(name.to_string()));
        }
        store.volumes.insert(name.to_string(), StagedVolume::new(data));
        Ok(())
    }

    pub fn create_snapshot(
        &self,
        name: &str,
        snapshot: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut store = self.store.lock().unwrap();
        let vol = store
            .volumes
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        if vol.snapshot(snapshot).is_some() {
            return Err(StorageError::AlreadyExists(format!(
                "{name}/{snapshot}"
            )));
        }
        let info = SnapshotInfo { name: snapshot.to_string(), created_at };
        let data = vol.data.clone();
        vol.put_snapshot(info, data);
        Ok(())
    }

    pub fn delete_snapshot(
        &self,
        name: &str,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let mut store = self.store.lock().unwrap();
        let vol = store
            .volumes
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        vol.remove_snapshots(&[snapshot.to_string()]);
        Ok(())
    }

    pub fn write_volume(
        &self,
        name: &str,
        data: VolumeData,
    ) -> Result<(), StorageError> {
        let mut store = self.store.lock().unwrap();
        let vol = store
            .volumes
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        vol.data = data;
        Ok(())
    }

    fn get(&self, name: &str) -> Result<StagedVolume, StorageError> {
        self.store
            .lock()
            .unwrap()
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    fn migration_types(
        &self,
        content_type: ContentType,
        _refresh: bool,
        _copy_snapshots: bool,
        cluster_move: bool,
        storage_move: bool,
    ) -> Vec<MigrationType> {
        if let Some(types) = &self.types_override {
            return types.clone();
        }

        let mut types = Vec::new();
        if self.remote && cluster_move && !storage_move {
            types.push(MigrationType::new(MigrationFsType::Shared));
        }
        types.push(MigrationType::new(MigrationFsType::Memory));
        types.push(match content_type {
            ContentType::Filesystem => MigrationType::with_features(
                MigrationFsType::Tar,
                &[FEATURE_COMPRESS, FEATURE_DELETE],
            ),
            ContentType::Block => MigrationType::new(MigrationFsType::Raw),
        });
        types
    }

    async fn has_volume(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.store.lock().unwrap().volumes.contains_key(name))
    }

    async fn volume_content_type(
        &self,
        name: &str,
    ) -> Result<ContentType, StorageError> {
        Ok(self.get(name)?.data.content_type())
    }

    async fn volume_snapshots(
        &self,
        name: &str,
    ) -> Result<Vec<SnapshotInfo>, StorageError> {
        Ok(self.get(name)?.snapshots.into_iter().map(|(i, _)| i).collect())
    }

    async fn read_volume(
        &self,
        name: &str,
    ) -> Result<VolumeData, StorageError> {
        Ok(self.get(name)?.data)
    }

    async fn create_volume_from_snapshot(
        &self,
        source: &str,
        snapshot: &str,
        target: &str,
    ) -> Result<(), StorageError> {
        let (_, data) = self
            .get(source)?
            .snapshots
            .into_iter()
            .find(|(i, _)| i.name == snapshot)
            .ok_or_else(|| {
                StorageError::SnapshotNotFound(
                    source.to_string(),
                    snapshot.to_string(),
                )
            })?;
        self.create_volume(target, data)
    }

    async fn delete_volume(&self, name: &str) -> Result<(), StorageError> {
        self.store
            .lock()
            .unwrap()
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn migrate_volume(
        &self,
        vol: &Volume,
        stream: &mut dyn VolumeStream,
        args: &VolumeSourceArgs,
    ) -> Result<(), StorageError> {
        let mt = &args.migration_type;
        if mt.fs_type == MigrationFsType::Shared {
            return send_done(stream).await;
        }

        for snap in &args.snapshots {
            // Look each snapshot up just before sending it; it may have been
            // deleted since the offer was made.
            let found = self.get(&vol.name)?.snapshots.into_iter().find(
                |(i, _)| i.name == *snap,
            );
            let (info, data) = match found {
                Some(item) => item,
                None if args.allow_inconsistent => {
                    warn!(self.log, "skipping vanished snapshot";
                        "volume" => &vol.name, "snapshot" => snap);
                    continue;
                }
                None => {
                    return Err(StorageError::SnapshotNotFound(
                        vol.name.clone(),
                        snap.clone(),
                    ))
                }
            };
            let bytes = encode_data(mt, &data)?;
            send_item(stream, ItemHeader::Snapshot(info), &bytes).await?;
        }

        let bytes = encode_data(mt, &self.get(&vol.name)?.data)?;
        send_item(stream, ItemHeader::Volume, &bytes).await?;
        send_done(stream).await
    }

    async fn create_volume_from_migration(
        &self,
        vol: &Volume,
        stream: &mut dyn VolumeStream,
        args: &VolumeTargetArgs,
        pre_filler: Option<VolumeFiller>,
    ) -> Result<(VolumePostHook, VolumeRevertHook), StorageError> {
        let name = vol.name.clone();
        let mt = &args.migration_type;
        let previous = self.store.lock().unwrap().volumes.get(&name).cloned();

        if mt.fs_type == MigrationFsType::Shared {
            recv_done(stream).await?;
            if previous.is_none() {
                return Err(StorageError::NotFound(name));
            }
            let post: VolumePostHook = Box::new(|| async { Ok(()) }.boxed());
            let revert: VolumeRevertHook =
                Box::new(|| async { Ok(()) }.boxed());
            return Ok((post, revert));
        }

        match (&previous, args.refresh) {
            (Some(_), false) => return Err(StorageError::AlreadyExists(name)),
            (None, true) => return Err(StorageError::NotFound(name)),
            _ => {}
        }

        let mut staged = match &previous {
            Some(prev) => prev.clone(),
            None => match pre_filler {
                Some(filler) => {
                    info!(self.log, "pre-filling volume";
                        "volume" => &name,
                        "fingerprint" => &filler.fingerprint);
                    StagedVolume::new(filler.data)
                }
                None => StagedVolume::new(VolumeData::empty(vol.content_type)),
            },
        };
        receive_into(stream, &name, vol.content_type, args, &mut staged).await?;

        {
            let mut store = self.store.lock().unwrap();
            if !args.refresh && store.volumes.contains_key(&name) {
                return Err(StorageError::AlreadyExists(name));
            }
            store.volumes.insert(name.clone(), staged);
        }

        let store = self.store.clone();
        let post_name = name.clone();
        let delete = args.delete_snapshots.clone();
        let post: VolumePostHook = Box::new(move || {
            async move {
                let mut store = store.lock().unwrap();
                if let Some(vol) = store.volumes.get_mut(&post_name) {
                    vol.remove_snapshots(&delete);
                }
                Ok(())
            }
            .boxed()
        });

        let store = self.store.clone();
        let revert: VolumeRevertHook = Box::new(move || {
            async move {
                let mut store = store.lock().unwrap();
                match previous {
                    Some(prev) => {
                        store.volumes.insert(name, prev);
                    }
                    None => {
                        store.volumes.remove(&name);
                    }
                }
                Ok(())
            }
            .boxed()
        });

        Ok((post, revert))
    }
}

#[cfg(test)]
mod test {
    use super::super::transfer::test_stream::pipe;
    use super::*;
    use chrono::TimeZone;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn block(bytes: &[u8]) -> VolumeData {
        VolumeData::Block(bytes.to_vec())
    }

    fn vol(name: &str) -> Volume {
        Volume {
            pool: "p".to_string(),
            name: name.to_string(),
            content_type: ContentType::Block,
        }
    }

    fn source_args(
        snapshots: &[&str],
        fs_type: MigrationFsType,
    ) -> VolumeSourceArgs {
        VolumeSourceArgs {
            snapshots: snapshots.iter().map(|s| s.to_string()).collect(),
            migration_type: MigrationType::new(fs_type),
            allow_inconsistent: false,
        }
    }

    fn target_args(
        src: &MemoryDriver,
        name: &str,
        fs_type: MigrationFsType,
    ) -> VolumeTargetArgs {
        let snapshots = src.get(name).unwrap().snapshots;
        VolumeTargetArgs {
            snapshots: snapshots.into_iter().map(|(i, _)| i).collect(),
            migration_type: MigrationType::new(fs_type),
            refresh: false,
            delete_snapshots: vec![],
        }
    }

    async fn transfer(
        src: &MemoryDriver,
        dst: &MemoryDriver,
        name: &str,
        sargs: VolumeSourceArgs,
        targs: VolumeTargetArgs,
    ) -> Result<(VolumePostHook, VolumeRevertHook), StorageError> {
        let (mut tx, mut rx) = pipe();
        let v = vol(name);
        let (sent, received) = tokio::join!(
            src.migrate_volume(&v, &mut tx, &sargs),
            dst.create_volume_from_migration(&v, &mut rx, &targs, None),
        );
        sent?;
        received
    }

    #[test]
    fn remote_driver_prefers_shared_only_for_cluster_moves() {
        let log = test_logger();
        let d = MemoryDriver::remote(log, SharedStore::default());
        let types =
            d.migration_types(ContentType::Block, false, true, true, false);
        assert_eq!(types[0].fs_type, MigrationFsType::Shared);
        let types =
            d.migration_types(ContentType::Block, false, true, true, true);
        assert_eq!(types[0].fs_type, MigrationFsType::Memory);
        assert_eq!(types.last().unwrap().fs_type, MigrationFsType::Raw);
    }

    #[tokio::test]
    async fn volume_and_snapshots_arrive_in_order() {
        let src = MemoryDriver::new(test_logger());
        let dst = MemoryDriver::new(test_logger());
        src.create_volume("v", block(b"one")).unwrap();
        src.create_snapshot("v", "s1", at(10)).unwrap();
        src.write_volume("v", block(b"two")).unwrap();
        src.create_snapshot("v", "s2", at(20)).unwrap();
        src.write_volume("v", block(b"three")).unwrap();

        let targs = target_args(&src, "v", MigrationFsType::Memory);
        let sargs = source_args(&["s1", "s2"], MigrationFsType::Memory);
        let (post, _revert) =
            transfer(&src, &dst, "v", sargs, targs).await.unwrap();
        post().await.unwrap();

        assert_eq!(dst.read_volume("v").await.unwrap(), block(b"three"));
        let snaps = dst.get("v").unwrap().snapshots;
        assert_eq!(snaps[0].0.name, "s1");
        assert_eq!(snaps[0].1, block(b"one"));
        assert_eq!(snaps[1].1, block(b"two"));
    }

    #[tokio::test]
    async fn vanished_snapshot_is_skipped_only_when_allowed() {
        let src = MemoryDriver::new(test_logger());
        src.create_volume("v", block(b"x")).unwrap();

        let dst = MemoryDriver::new(test_logger());
        let targs = target_args(&src, "v", MigrationFsType::Raw);
        let sargs = source_args(&["gone"], MigrationFsType::Raw);
        let (mut tx, _rx) = pipe();
        let res = src.migrate_volume(&vol("v"), &mut tx, &sargs).await;
        assert!(matches!(res, Err(StorageError::SnapshotNotFound(_, _))));

        let mut sargs = source_args(&["gone"], MigrationFsType::Raw);
        sargs.allow_inconsistent = true;
        transfer(&src, &dst, "v", sargs, targs).await.unwrap();
        assert_eq!(dst.read_volume("v").await.unwrap(), block(b"x"));
    }

    #[tokio::test]
    async fn revert_restores_refreshed_volume() {
        let src = MemoryDriver::new(test_logger());
        src.create_volume("v", block(b"new")).unwrap();
        let dst = MemoryDriver::new(test_logger());
        dst.create_volume("v", block(b"old")).unwrap();
        dst.create_snapshot("v", "stale", at(5)).unwrap();

        let mut targs = target_args(&src, "v", MigrationFsType::Raw);
        targs.refresh = true;
        targs.delete_snapshots = vec!["stale".to_string()];
        let sargs = source_args(&[], MigrationFsType::Raw);
        let (_post, revert) =
            transfer(&src, &dst, "v", sargs, targs).await.unwrap();
        assert_eq!(dst.read_volume("v").await.unwrap(), block(b"new"));

        revert().await.unwrap();
        assert_eq!(dst.read_volume("v").await.unwrap(), block(b"old"));
        assert_eq!(dst.volume_snapshots("v").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn post_hook_deletes_stale_snapshots() {
        let src = MemoryDriver::new(test_logger());
        src.create_volume("v", block(b"new")).unwrap();
        let dst = MemoryDriver::new(test_logger());
        dst.create_volume("v", block(b"old")).unwrap();
        dst.create_snapshot("v", "stale", at(5)).unwrap();

        let mut targs = target_args(&src, "v", MigrationFsType::Raw);
        targs.refresh = true;
        targs.delete_snapshots = vec!["stale".to_string()];
        let sargs = source_args(&[], MigrationFsType::Raw);
        let (post, _revert) =
            transfer(&src, &dst, "v", sargs, targs).await.unwrap();
        post().await.unwrap();
        assert!(dst.volume_snapshots("v").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn receive_refuses_to_overwrite_without_refresh() {
        let src = MemoryDriver::new(test_logger());
        src.create_volume("v", block(b"new")).unwrap();
        let dst = MemoryDriver::new(test_logger());
        dst.create_volume("v", block(b"old")).unwrap();

        let targs = target_args(&src, "v", MigrationFsType::Raw);
        let (_tx, mut rx) = pipe();
        let v = vol("v");
        let res = dst.create_volume_from_migration(&v, &mut rx, &targs, None);
        assert!(matches!(res.await, Err(StorageError::AlreadyExists(_))));
        assert_eq!(dst.read_volume("v").await.unwrap(), block(b"old"));
    }

    #[tokio::test]
    async fn shared_transfer_moves_nothing() {
        let store = SharedStore::default();
        let src = MemoryDriver::remote(test_logger(), store.clone());
        let dst = MemoryDriver::remote(test_logger(), store);
        src.create_volume("v", block(b"same")).unwrap();

        let targs = target_args(&src, "v", MigrationFsType::Shared);
        let sargs = source_args(&[], MigrationFsType::Shared);
        let (post, _) = transfer(&src, &dst, "v", sargs, targs).await.unwrap();
        post().await.unwrap();
        assert_eq!(dst.read_volume("v").await.unwrap(), block(b"same"));
    }
}
