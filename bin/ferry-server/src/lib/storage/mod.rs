// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The contract between migration sessions and storage back-ends.
//!
//! A back-end advertises the transfer formats it can produce or consume
//! ([`Driver::migration_types`]) and implements the two streaming entry
//! points: [`Driver::migrate_volume`] serializes a volume onto a
//! [`VolumeStream`], and [`Driver::create_volume_from_migration`]
//! materializes one from it. The session layer never looks inside the
//! payload; the negotiated [`MigrationType`] is the only thing the two
//! back-ends have to agree on.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod dir;
pub mod memory;
pub(crate) mod transfer;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    Filesystem,
    Block,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub pool: String,
    pub name: String,
    pub content_type: ContentType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// The contents of a volume or snapshot, independent of how a back-end
/// stores it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeData {
    /// Regular files keyed by their path relative to the volume root.
    Filesystem(BTreeMap<String, Vec<u8>>),
    /// A raw disk image.
    Block(Vec<u8>),
}

impl VolumeData {
    pub fn empty(content_type: ContentType) -> Self {
        match content_type {
            ContentType::Filesystem => VolumeData::Filesystem(BTreeMap::new()),
            ContentType::Block => VolumeData::Block(Vec::new()),
        }
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            VolumeData::Filesystem(_) => ContentType::Filesystem,
            VolumeData::Block(_) => ContentType::Block,
        }
    }
}

/// Transfer formats, from most to least specialized.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum MigrationFsType {
    /// Both ends see the same backing store; nothing is streamed.
    Shared,
    /// Native format of the in-memory back-end.
    Memory,
    /// A tar archive per item. Generic format for filesystem volumes.
    Tar,
    /// A raw image per item. Generic format for block volumes.
    Raw,
}

/// Feature flag of [`MigrationFsType::Tar`]: archives are gzip-compressed.
pub const FEATURE_COMPRESS: &str = "compress";

/// Feature flag of [`MigrationFsType::Tar`]: the stream is authoritative and
/// files it does not mention are removed from a refreshed target.
pub const FEATURE_DELETE: &str = "delete";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationType {
    pub fs_type: MigrationFsType,
    pub features: Vec<String>,
}

impl MigrationType {
    pub fn new(fs_type: MigrationFsType) -> Self {
        Self { fs_type, features: Vec::new() }
    }

    pub fn with_features(fs_type: MigrationFsType, features: &[&str]) -> Self {
        Self {
            fs_type,
            features: features.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.features.is_empty() {
            write!(f, "{}", self.fs_type)
        } else {
            write!(f, "{}({})", self.fs_type, self.features.join(","))
        }
    }
}

/// Arguments for sending one volume.
#[derive(Clone, Debug)]
pub struct VolumeSourceArgs {
    /// Snapshots to send before the volume itself, oldest first.
    pub snapshots: Vec<String>,
    pub migration_type: MigrationType,
    /// Skip snapshots which vanish while the transfer is running instead
    /// of failing.
    pub allow_inconsistent: bool,
}

/// Arguments for receiving one volume.
#[derive(Clone, Debug)]
pub struct VolumeTargetArgs {
    /// Snapshots the source will send, oldest first.
    pub snapshots: Vec<SnapshotInfo>,
    pub migration_type: MigrationType,
    /// Update an existing volume instead of creating one.
    pub refresh: bool,
    /// Snapshots of an existing volume to delete once the migration
    /// succeeds.
    pub delete_snapshots: Vec<String>,
}

/// Initial contents applied to a new volume before any streamed data.
#[derive(Clone, Debug)]
pub struct VolumeFiller {
    /// Identifies where the data came from, for logging.
    pub fingerprint: String,
    pub data: VolumeData,
}

/// Run after the whole migration succeeded to finalize a received volume.
pub type VolumePostHook =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), StorageError>> + Send>;

/// Undoes everything a receive did. Must leave nothing addressable under the
/// volume's name that was not there before.
pub type VolumeRevertHook =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<(), StorageError>> + Send>;

/// Header of one item (a snapshot, the volume itself, or a checkpoint) on a
/// content connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemHeader {
    Snapshot(SnapshotInfo),
    Volume,
    Checkpoint,
}

/// Units exchanged on a content connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Header(ItemHeader),
    Data(Vec<u8>),
    EndItem,
    Done,
}

/// A bidirectional, ordered frame transport owned by one transfer worker.
#[async_trait]
pub trait VolumeStream: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), StorageError>;
    async fn recv_frame(&mut self) -> Result<Frame, StorageError>;
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("volume {0} not found")]
    NotFound(String),

    #[error("volume {0} already exists")]
    AlreadyExists(String),

    #[error("snapshot {1} of volume {0} not found")]
    SnapshotNotFound(String, String),

    #[error("invalid name {0:?}")]
    InvalidName(String),

    #[error("no such storage pool {0}")]
    UnknownPool(String),

    #[error("transfer type {0} is not supported for {1:?} volumes")]
    UnsupportedType(String, ContentType),

    #[error("stream protocol violation: {0}")]
    Protocol(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Checks that a volume or snapshot name is usable as one path component.
pub(crate) fn check_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
    {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Short name of the back-end, e.g. "dir".
    fn name(&self) -> &'static str;

    /// Whether every cluster member sees this pool's backing store.
    fn is_remote(&self) -> bool;

    /// Transfer formats this back-end supports for the given mode, in order
    /// of preference.
    fn migration_types(
        &self,
        content_type: ContentType,
        refresh: bool,
        copy_snapshots: bool,
        cluster_move: bool,
        storage_move: bool,
    ) -> Vec<MigrationType>;

    async fn has_volume(&self, name: &str) -> Result<bool, StorageError>;

    async fn volume_content_type(
        &self,
        name: &str,
    ) -> Result<ContentType, StorageError>;

    /// Snapshots of a volume, oldest first.
    async fn volume_snapshots(
        &self,
        name: &str,
    ) -> Result<Vec<SnapshotInfo>, StorageError>;

    async fn read_volume(&self, name: &str) -> Result<VolumeData, StorageError>;

    /// Creates `target` as a standalone copy of one snapshot of `source`.
    async fn create_volume_from_snapshot(
        &self,
        source: &str,
        snapshot: &str,
        target: &str,
    ) -> Result<(), StorageError>;

    async fn delete_volume(&self, name: &str) -> Result<(), StorageError>;

    /// Sends `vol`, preceded by the requested snapshots, in the negotiated
    /// format, and terminates the stream.
    async fn migrate_volume(
        &self,
        vol: &Volume,
        stream: &mut dyn VolumeStream,
        args: &VolumeSourceArgs,
    ) -> Result<(), StorageError>;

    /// Receives `vol` in the negotiated format. `pre_filler` seeds a new
    /// volume before the first streamed item is applied.
    ///
    /// On error, nothing is left behind. On success the caller owns the
    /// returned hooks: the post hook once the whole migration succeeded, the
    /// revert hook if anything else in the migration failed.
    async fn create_volume_from_migration(
        &self,
        vol: &Volume,
        stream: &mut dyn VolumeStream,
        args: &VolumeTargetArgs,
        pre_filler: Option<VolumeFiller>,
    ) -> Result<(VolumePostHook, VolumeRevertHook), StorageError>;
}

/// The storage pools known to this server.
#[derive(Clone, Default)]
pub struct Pools {
    pools: BTreeMap<String, Arc<dyn Driver>>,
}

impl Pools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, driver: Arc<dyn Driver>) {
        self.pools.insert(name.into(), driver);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>, StorageError> {
        self.pools
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownPool(name.to_string()))
    }
}
