// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A storage back-end keeping volumes in a directory on the host.
//!
//! Each volume is a directory under the pool root:
//!
//! ```text
//! <root>/<volume>/volume.ron               content type and snapshot list
//! <root>/<volume>/rootfs/...               filesystem volumes
//! <root>/<volume>/root.img                 block volumes
//! <root>/<volume>/snapshots/<snap>/...     same layout, per snapshot
//! ```
//!
//! Received volumes are assembled in a staging directory and renamed into
//! place, so a volume directory only ever holds complete contents.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use slog::{info, warn, Logger};
use uuid::Uuid;

use super::transfer::{
    encode_data, receive_into, send_done, send_item, StagedVolume,
};
use super::{
    check_name, ContentType, Driver, ItemHeader, MigrationFsType, MigrationType,
    SnapshotInfo, StorageError, Volume, VolumeData, VolumeFiller,
    VolumePostHook, VolumeRevertHook, VolumeSourceArgs, VolumeStream,
    VolumeTargetArgs, FEATURE_COMPRESS, FEATURE_DELETE,
};

const META_FILE: &str = "volume.ron";
const ROOTFS_DIR: &str = "rootfs";
const IMAGE_FILE: &str = "root.img";
const SNAPSHOTS_DIR: &str = "snapshots";

#[derive(Debug, Serialize, Deserialize)]
struct VolumeMeta {
    content_type: ContentType,
    snapshots: Vec<SnapshotInfo>,
}

pub struct DirDriver {
    log: Logger,
    root: PathBuf,
}

async fn blocking<T, F>(f: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}

fn read_tree(
    root: &Path,
    dir: &Path,
    out: &mut BTreeMap<String, Vec<u8>>,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            read_tree(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            out.insert(rel.to_string_lossy().into_owned(), fs::read(&path)?);
        }
    }
    Ok(())
}

fn read_data(dir: &Path, content_type: ContentType) -> io::Result<VolumeData> {
    match content_type {
        ContentType::Filesystem => {
            let root = dir.join(ROOTFS_DIR);
            let mut files = BTreeMap::new();
            read_tree(&root, &root, &mut files)?;
            Ok(VolumeData::Filesystem(files))
        }
        ContentType::Block => {
            Ok(VolumeData::Block(fs::read(dir.join(IMAGE_FILE))?))
        }
    }
}

fn write_data(dir: &Path, data: &VolumeData) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    match data {
        VolumeData::Filesystem(files) => {
            let root = dir.join(ROOTFS_DIR);
            fs::create_dir_all(&root)?;
            for (rel, contents) in files {
                let rel = Path::new(rel);
                if !rel
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)))
                {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("path {} leaves the volume", rel.display()),
                    ));
                }
                let path = root.join(rel);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(path, contents)?;
            }
        }
        VolumeData::Block(image) => fs::write(dir.join(IMAGE_FILE), image)?,
    }
    Ok(())
}

fn read_meta(dir: &Path) -> Result<VolumeMeta, StorageError> {
    let s = fs::read_to_string(dir.join(META_FILE))?;
    ron::de::from_str(&s)
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

fn write_meta(dir: &Path, meta: &VolumeMeta) -> Result<(), StorageError> {
    let s = ron::ser::to_string(meta)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    fs::write(dir.join(META_FILE), s)?;
    Ok(())
}

fn load(dir: &Path) -> Result<StagedVolume, StorageError> {
    let meta = read_meta(dir)?;
    let mut vol = StagedVolume::new(read_data(dir, meta.content_type)?);
    for info in meta.snapshots {
        let snap_dir = dir.join(SNAPSHOTS_DIR).join(&info.name);
        let data = read_data(&snap_dir, meta.content_type)?;
        vol.put_snapshot(info, data);
    }
    Ok(vol)
}

fn store(dir: &Path, vol: &StagedVolume) -> Result<(), StorageError> {
    write_data(dir, &vol.data)?;
    for (info, data) in &vol.snapshots {
        check_name(&info.name)?;
        write_data(&dir.join(SNAPSHOTS_DIR).join(&info.name), data)?;
    }
    let meta = VolumeMeta {
        content_type: vol.data.content_type(),
        snapshots: vol.snapshots.iter().map(|(i, _)| i.clone()).collect(),
    };
    write_meta(dir, &meta)
}

fn remove_snapshots(dir: &Path, names: &[String]) -> Result<(), StorageError> {
    let mut meta = read_meta(dir)?;
    for name in names {
        check_name(name)?;
        let path = dir.join(SNAPSHOTS_DIR).join(name);
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
    }
    meta.snapshots.retain(|i| !names.contains(&i.name));
    write_meta(dir, &meta)
}

impl DirDriver {
    pub fn new(
        log: Logger,
        root: impl Into<PathBuf>,
    ) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { log, root })
    }

    fn volume_dir(&self, name: &str) -> Result<PathBuf, StorageError> {
        check_name(name)?;
        Ok(self.root.join(name))
    }

    fn existing_dir(&self, name: &str) -> Result<PathBuf, StorageError> {
        let dir = self.volume_dir(name)?;
        if !dir.join(META_FILE).exists() {
            return Err(StorageError::NotFound(name.to_string()));
        }
        Ok(dir)
    }

    async fn load_volume(
        &self,
        name: &str,
    ) -> Result<StagedVolume, StorageError> {
        let dir = self.existing_dir(name)?;
        blocking(move || load(&dir)).await
    }

    /// Writes `vol` to a fresh staging directory and renames it into place
    /// as `name`, moving any existing volume aside. Returns the path of the
    /// moved-aside volume.
    async fn commit(
        &self,
        name: &str,
        vol: StagedVolume,
        replace: bool,
    ) -> Result<Option<PathBuf>, StorageError> {
        let dir = self.volume_dir(name)?;
        let staging = self.root.join(format!(".staging-{}", Uuid::new_v4()));
        let backup =
            self.root.join(format!(".backup-{}-{}", name, Uuid::new_v4()));
        let name = name.to_string();

        blocking(move || {
            if let Err(e) = store(&staging, &vol) {
                let _ = fs::remove_dir_all(&staging);
                return Err(e);
            }
            let moved_aside = if dir.exists() {
                if !replace {
                    let _ = fs::remove_dir_all(&staging);
                    return Err(StorageError::AlreadyExists(name));
                }
                fs::rename(&dir, &backup)?;
                Some(backup)
            } else {
                None
            };
            fs::rename(&staging, &dir)?;
            Ok(moved_aside)
        })
        .await
    }

    /// Creates a volume directly, for seeding pools.
    pub async fn create_volume(
        &self,
        name: &str,
        data: VolumeData,
    ) -> Result<(), StorageError> {
        self.commit(name, StagedVolume::new(data), false).await.map(|_| ())
    }

    /// Records the current contents of a volume as a snapshot.
    pub async fn create_snapshot(
        &self,
        name: &str,
        snapshot: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        check_name(snapshot)?;
        let mut vol = self.load_volume(name).await?;
        if vol.snapshot(snapshot).is_some() {
            return Err(StorageError::AlreadyExists(format!(
                "{name}/{snapshot}"
            )));
        }
        let info = SnapshotInfo { name: snapshot.to_string(), created_at };
        let data = vol.data.clone();
        vol.put_snapshot(info, data);
        if let Some(backup) = self.commit(name, vol, true).await? {
            blocking(move || Ok(fs::remove_dir_all(backup)?)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for DirDriver {
    fn name(&self) -> &'static str {
        "dir"
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn migration_types(
        &self,
        content_type: ContentType,
        _refresh: bool,
        _copy_snapshots: bool,
        _cluster_move: bool,
        _storage_move: bool,
    ) -> Vec<MigrationType> {
        match content_type {
            ContentType::Filesystem => vec![MigrationType::with_features(
                MigrationFsType::Tar,
                &[FEATURE_COMPRESS, FEATURE_DELETE],
            )],
            ContentType::Block => {
                vec![MigrationType::new(MigrationFsType::Raw)]
            }
        }
    }

    async fn has_volume(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.volume_dir(name)?.join(META_FILE).exists())
    }

    async fn volume_content_type(
        &self,
        name: &str,
    ) -> Result<ContentType, StorageError> {
        let dir = self.existing_dir(name)?;
        Ok(blocking(move || read_meta(&dir)).await?.content_type)
    }

    async fn volume_snapshots(
        &self,
        name: &str,
    ) -> Result<Vec<SnapshotInfo>, StorageError> {
        let dir = self.existing_dir(name)?;
        let mut snapshots = blocking(move || read_meta(&dir)).await?.snapshots;
        snapshots.sort_by_key(|i| i.created_at);
        Ok(snapshots)
    }

    async fn read_volume(
        &self,
        name: &str,
    ) -> Result<VolumeData, StorageError> {
        Ok(self.load_volume(name).await?.data)
    }

    async fn create_volume_from_snapshot(
        &self,
        source: &str,
        snapshot: &str,
        target: &str,
    ) -> Result<(), StorageError> {
        let vol = self.load_volume(source).await?;
        let (_, data) = vol.snapshot(snapshot).cloned().ok_or_else(|| {
            StorageError::SnapshotNotFound(
                source.to_string(),
                snapshot.to_string(),
            )
        })?;
        self.create_volume(target, data).await
    }

    async fn delete_volume(&self, name: &str) -> Result<(), StorageError> {
        let dir = self.existing_dir(name)?;
        blocking(move || Ok(fs::remove_dir_all(dir)?)).await
    }

    async fn migrate_volume(
        &self,
        vol: &Volume,
        stream: &mut dyn VolumeStream,
        args: &VolumeSourceArgs,
    ) -> Result<(), StorageError> {
        let mt = &args.migration_type;
        let dir = self.existing_dir(&vol.name)?;
        let content_type = vol.content_type;

        for snap in &args.snapshots {
            let snap_dir = dir.join(SNAPSHOTS_DIR).join(snap);
            let info = blocking({
                let dir = dir.clone();
                move || read_meta(&dir)
            })
            .await?
            .snapshots
            .into_iter()
            .find(|i| i.name == *snap);

            let info = match info {
                Some(info) if snap_dir.exists() => info,
                _ if args.allow_inconsistent => {
                    warn!(self.log, "skipping vanished snapshot";
                        "volume" => &vol.name, "snapshot" => snap);
                    continue;
                }
                _ => {
                    return Err(StorageError::SnapshotNotFound(
                        vol.name.clone(),
                        snap.clone(),
                    ))
                }
            };
            let data =
                blocking(move || Ok(read_data(&snap_dir, content_type)?))
                    .await?;
            let bytes = encode_data(mt, &data)?;
            send_item(stream, ItemHeader::Snapshot(info), &bytes).await?;
        }

        let data = blocking(move || Ok(read_data(&dir, content_type)?)).await?;
        let bytes = encode_data(mt, &data)?;
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
        let mt = &args.migration_type;
        if mt.fs_type == MigrationFsType::Shared
            || mt.fs_type == MigrationFsType::Memory
        {
            return Err(StorageError::UnsupportedType(
                mt.to_string(),
                vol.content_type,
            ));
        }

        let exists = self.has_volume(&vol.name).await?;
        let mut staged = match (exists, args.refresh) {
            (true, false) => {
                return Err(StorageError::AlreadyExists(vol.name.clone()))
            }
            (false, true) => {
                return Err(StorageError::NotFound(vol.name.clone()))
            }
            (true, true) => self.load_volume(&vol.name).await?,
            (false, false) => match pre_filler {
                Some(filler) => {
                    info!(self.log, "pre-filling volume";
                        "volume" => &vol.name,
                        "fingerprint" => &filler.fingerprint);
                    StagedVolume::new(filler.data)
                }
                None => StagedVolume::new(VolumeData::empty(vol.content_type)),
            },
        };

        receive_into(stream, &vol.name, vol.content_type, args, &mut staged)
            .await?;
        let backup = self.commit(&vol.name, staged, args.refresh).await?;

        let dir = self.volume_dir(&vol.name)?;
        let post_dir = dir.clone();
        let post_backup = backup.clone();
        let delete = args.delete_snapshots.clone();
        let post: VolumePostHook = Box::new(move || {
            blocking(move || {
                if !delete.is_empty() {
                    remove_snapshots(&post_dir, &delete)?;
                }
                if let Some(b) = post_backup {
                    fs::remove_dir_all(b)?;
                }
                Ok(())
            })
            .boxed()
        });

        let revert: VolumeRevertHook = Box::new(move || {
            blocking(move || {
                if dir.exists() {
                    fs::remove_dir_all(&dir)?;
                }
                if let Some(b) = backup.filter(|b| b.exists()) {
                    fs::rename(b, &dir)?;
                }
                Ok(())
            })
            .boxed()
        });

        Ok((post, revert))
    }
}

#[cfg(test)]
mod test {
    use super::super::memory::MemoryDriver;
    use super::super::transfer::test_stream::pipe;
    use super::*;
    use chrono::TimeZone;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn fs_data(entries: &[(&str, &[u8])]) -> VolumeData {
        VolumeData::Filesystem(
            entries.iter().map(|(p, c)| (p.to_string(), c.to_vec())).collect(),
        )
    }

    fn fs_vol(name: &str) -> Volume {
        Volume {
            pool: "p".to_string(),
            name: name.to_string(),
            content_type: ContentType::Filesystem,
        }
    }

    #[tokio::test]
    async fn volumes_persist_with_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let d = DirDriver::new(test_logger(), tmp.path()).unwrap();
        d.create_volume("web", fs_data(&[("etc/hostname", b"web")]))
            .await
            .unwrap();
        d.create_snapshot("web", "snap0", Utc.timestamp_opt(1, 0).unwrap())
            .await
            .unwrap();

        assert!(d.has_volume("web").await.unwrap());
        assert_eq!(
            d.volume_content_type("web").await.unwrap(),
            ContentType::Filesystem
        );
        let snaps = d.volume_snapshots("web").await.unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].name, "snap0");
        assert_eq!(
            d.read_volume("web").await.unwrap(),
            fs_data(&[("etc/hostname", b"web")])
        );
    }

    #[tokio::test]
    async fn rejects_names_escaping_the_pool() {
        let tmp = tempfile::tempdir().unwrap();
        let d = DirDriver::new(test_logger(), tmp.path()).unwrap();
        for name in ["", "../x", ".staging", "a/b"] {
            assert!(matches!(
                d.has_volume(name).await,
                Err(StorageError::InvalidName(_))
            ));
        }
    }

    #[tokio::test]
    async fn receives_tar_stream_from_memory_pool() {
        let tmp = tempfile::tempdir().unwrap();
        let dst = DirDriver::new(test_logger(), tmp.path()).unwrap();
        let src = MemoryDriver::new(test_logger());
        let contents = fs_data(&[("a", b"1"), ("dir/b", b"2")]);
        src.create_volume("v", contents.clone()).unwrap();

        let mt = MigrationType::with_features(
            MigrationFsType::Tar,
            &[FEATURE_COMPRESS],
        );
        let sargs = VolumeSourceArgs {
            snapshots: vec![],
            migration_type: mt.clone(),
            allow_inconsistent: false,
        };
        let targs = VolumeTargetArgs {
            snapshots: vec![],
            migration_type: mt,
            refresh: false,
            delete_snapshots: vec![],
        };
        let (mut tx, mut rx) = pipe();
        let v = fs_vol("v");
        let (sent, received) = tokio::join!(
            src.migrate_volume(&v, &mut tx, &sargs),
            dst.create_volume_from_migration(&v, &mut rx, &targs, None),
        );
        sent.unwrap();
        let (post, _revert) = received.unwrap();
        post().await.unwrap();

        assert_eq!(dst.read_volume("v").await.unwrap(), contents);
    }

    #[tokio::test]
    async fn revert_after_refresh_restores_previous_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let dst = DirDriver::new(test_logger(), tmp.path()).unwrap();
        let old = fs_data(&[("a", b"old")]);
        dst.create_volume("v", old.clone()).await.unwrap();

        let mt = MigrationType::with_features(
            MigrationFsType::Tar,
            &[FEATURE_DELETE],
        );
        let targs = VolumeTargetArgs {
            snapshots: vec![],
            migration_type: mt.clone(),
            refresh: true,
            delete_snapshots: vec![],
        };
        let (mut tx, mut rx) = pipe();
        let bytes = encode_data(&mt, &fs_data(&[("b", b"new")])).unwrap();
        send_item(&mut tx, ItemHeader::Volume, &bytes).await.unwrap();
        send_done(&mut tx).await.unwrap();

        let (_post, revert) = dst
            .create_volume_from_migration(&fs_vol("v"), &mut rx, &targs, None)
            .await
            .unwrap();
        assert_eq!(
            dst.read_volume("v").await.unwrap(),
            fs_data(&[("b", b"new")])
        );

        revert().await.unwrap();
        assert_eq!(dst.read_volume("v").await.unwrap(), old);
    }

    #[tokio::test]
    async fn truncated_stream_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let dst = DirDriver::new(test_logger(), tmp.path()).unwrap();
        let targs = VolumeTargetArgs {
            snapshots: vec![],
            migration_type: MigrationType::new(MigrationFsType::Raw),
            refresh: false,
            delete_snapshots: vec![],
        };
        let (tx, mut rx) = pipe();
        drop(tx);
        let vol = Volume {
            pool: "p".to_string(),
            name: "disk".to_string(),
            content_type: ContentType::Block,
        };
        let res = dst
            .create_volume_from_migration(&vol, &mut rx, &targs, None)
            .await;
        assert!(res.is_err());
        assert!(!dst.has_volume("disk").await.unwrap());
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    fn pool_in(tmp: &tempfile::TempDir) -> DirDriver {
        DirDriver::new(test_logger(), tmp.path().join("pool")).unwrap()
    }

    fn only_the_pool_exists(tmp: &tempfile::TempDir) -> bool {
        let top: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        let pool = fs::read_dir(tmp.path().join("pool")).unwrap().count();
        top == ["pool"] && pool == 0
    }

    #[tokio::test]
    async fn snapshot_names_cannot_escape_the_pool() {
        let tmp = tempfile::tempdir().unwrap();
        let dst = pool_in(&tmp);
        let info = SnapshotInfo {
            name: "../../../escaped".to_string(),
            created_at: Utc.timestamp_opt(1, 0).unwrap(),
        };
        let targs = VolumeTargetArgs {
            snapshots: vec![info.clone()],
            migration_type: MigrationType::new(MigrationFsType::Raw),
            refresh: false,
            delete_snapshots: vec![],
        };
        let (mut tx, mut rx) = pipe();
        send_item(&mut tx, ItemHeader::Snapshot(info), b"snap").await.unwrap();
        send_item(&mut tx, ItemHeader::Volume, b"disk").await.unwrap();
        send_done(&mut tx).await.unwrap();

        let vol = Volume {
            pool: "p".to_string(),
            name: "disk".to_string(),
            content_type: ContentType::Block,
        };
        let res = dst
            .create_volume_from_migration(&vol, &mut rx, &targs, None)
            .await;
        assert!(matches!(res, Err(StorageError::InvalidName(_))));
        assert!(only_the_pool_exists(&tmp));

        dst.create_volume("disk", VolumeData::Block(vec![1])).await.unwrap();
        let at = Utc.timestamp_opt(2, 0).unwrap();
        assert!(matches!(
            dst.create_snapshot("disk", "../up", at).await,
            Err(StorageError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn tar_entries_cannot_escape_the_pool() {
        let tmp = tempfile::tempdir().unwrap();
        let dst = pool_in(&tmp);

        let path = b"../../../pwned";
        let mut header = tar::Header::new_gnu();
        header.as_old_mut().name[..path.len()].copy_from_slice(path);
        header.set_size(4);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        let mut builder = tar::Builder::new(Vec::new());
        builder.append(&header, &b"evil"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        let targs = VolumeTargetArgs {
            snapshots: vec![],
            migration_type: MigrationType::new(MigrationFsType::Tar),
            refresh: false,
            delete_snapshots: vec![],
        };
        let (mut tx, mut rx) = pipe();
        send_item(&mut tx, ItemHeader::Volume, &bytes).await.unwrap();
        send_done(&mut tx).await.unwrap();

        let res = dst
            .create_volume_from_migration(&fs_vol("v"), &mut rx, &targs, None)
            .await;
        assert!(matches!(res, Err(StorageError::Protocol(_))));
        assert!(!tmp.path().join("pwned").exists());
        assert!(only_the_pool_exists(&tmp));
    }

    #[tokio::test]
    async fn unrequested_snapshots_are_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let dst = pool_in(&tmp);
        let mt = MigrationType::new(MigrationFsType::Tar);
        let targs = VolumeTargetArgs {
            snapshots: vec![],
            migration_type: mt.clone(),
            refresh: false,
            delete_snapshots: vec![],
        };
        let bytes = encode_data(&mt, &fs_data(&[("a", b"1")])).unwrap();
        let extra = SnapshotInfo {
            name: "extra".to_string(),
            created_at: Utc.timestamp_opt(1, 0).unwrap(),
        };
        let (mut tx, mut rx) = pipe();
        send_item(&mut tx, ItemHeader::Snapshot(extra), &bytes).await.unwrap();
        send_item(&mut tx, ItemHeader::Volume, &bytes).await.unwrap();
        send_done(&mut tx).await.unwrap();

        let res = dst
            .create_volume_from_migration(&fs_vol("v"), &mut rx, &targs, None)
            .await;
        assert!(matches!(res, Err(StorageError::Protocol(_))));
        assert!(!dst.has_volume("v").await.unwrap());
    }
}
