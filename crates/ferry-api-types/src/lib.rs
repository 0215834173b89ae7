// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for types exposed by the ferry-server API

use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the connection carrying negotiation and status messages. Every
/// migration has one, and it is always the first connection issued.
pub const SECRET_NAME_CONTROL: &str = "control";

/// Name of the connection carrying an instance's root filesystem volume.
pub const SECRET_NAME_FILESYSTEM: &str = "fs";

/// Name of the connection carrying a live instance's checkpoint image.
pub const SECRET_NAME_STATE: &str = "criu";

#[derive(Clone, Deserialize, Serialize, JsonSchema)]
pub struct InstancePathParams {
    pub name: String,
}

#[derive(Clone, Deserialize, Serialize, JsonSchema)]
pub struct VolumePathParams {
    pub pool: String,
    pub volume: String,
}

#[derive(Clone, Deserialize, Serialize, JsonSchema)]
pub struct OperationPathParams {
    pub id: Uuid,
}

/// Query parameters presented by a peer dialing one of an operation's
/// migration connections.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct SecretQuery {
    pub secret: Option<String>,
}

/// Where a session should dial: the remote operation and the secrets it
/// handed out, one per connection name.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MigrationDialTarget {
    /// Base URL of the remote operation, e.g.
    /// `ws://host:port/1.0/operations/<id>`.
    pub operation_url: String,

    /// PEM certificate the remote end is expected to present.
    #[serde(default)]
    pub certificate: Option<String>,

    pub secrets: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct InstanceMigrateRequest {
    /// Transfer the running state of the instance as well as its volumes.
    #[serde(default)]
    pub live: bool,

    /// Stop a running instance for the duration of the transfer.
    #[serde(default)]
    pub force: bool,

    /// Do not send the instance's snapshots.
    #[serde(default)]
    pub instance_only: bool,

    /// Skip snapshots which disappear while they are being enumerated.
    #[serde(default)]
    pub allow_inconsistent: bool,

    /// Additional custom volumes attached to the instance to send along.
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Name of the instance on the destination when this is a move inside
    /// a cluster.
    #[serde(default)]
    pub cluster_move_source_name: Option<String>,

    /// Dial the destination (push mode) instead of waiting for it.
    #[serde(default)]
    pub target: Option<MigrationDialTarget>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct InstanceReceiveRequest {
    /// Pool to create the instance's volumes in.
    pub pool: String,

    /// Dial the source (pull mode). Absent for push mode, in which case the
    /// operation's secrets are handed to the source.
    #[serde(default)]
    pub source: Option<MigrationDialTarget>,

    #[serde(default)]
    pub live: bool,

    #[serde(default)]
    pub instance_only: bool,

    /// Update an existing instance instead of creating it.
    #[serde(default)]
    pub refresh: bool,

    /// On refresh, do not transfer source snapshots older than the newest
    /// snapshot already present on the target.
    #[serde(default)]
    pub refresh_exclude_older: bool,

    /// Set when the transfer is part of a move inside a cluster.
    #[serde(default)]
    pub cluster_move_source_name: Option<String>,

    /// Snapshots to request in addition to the ones selected by default.
    #[serde(default)]
    pub snapshots: Vec<String>,

    /// Custom volumes the source sends along with the instance. Only needed
    /// in push mode, where a connection has to be issued for each of them
    /// before the source's offer is known.
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Local volume to pre-populate the new root volume from before the
    /// streamed data is applied.
    #[serde(default)]
    pub template: Option<String>,

    /// Start the instance once it has been received.
    #[serde(default)]
    pub start: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct VolumeMigrateRequest {
    #[serde(default)]
    pub volume_only: bool,

    #[serde(default)]
    pub allow_inconsistent: bool,

    /// Send only this snapshot, as a standalone volume.
    #[serde(default)]
    pub snapshot: Option<String>,

    #[serde(default)]
    pub target: Option<MigrationDialTarget>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct VolumeReceiveRequest {
    #[serde(default)]
    pub source: Option<MigrationDialTarget>,

    #[serde(default)]
    pub volume_only: bool,

    #[serde(default)]
    pub refresh: bool,

    #[serde(default)]
    pub refresh_exclude_older: bool,

    #[serde(default)]
    pub snapshots: Vec<String>,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Created,
    AwaitingConnections,
    Negotiating,
    Transferring,
    Completed,
    Failed,
}

impl MigrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationState::Completed | MigrationState::Failed)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationState::Created => "created",
            MigrationState::AwaitingConnections => "awaiting connections",
            MigrationState::Negotiating => "negotiating",
            MigrationState::Transferring => "transferring",
            MigrationState::Completed => "completed",
            MigrationState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Progress of one migration session, as published through its operation.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MigrationStatus {
    pub state: MigrationState,

    /// Bytes moved so far, keyed by connection name.
    pub transferred: BTreeMap<String, u64>,

    /// Negotiated transfer format, keyed by volume name.
    pub negotiated: BTreeMap<String, String>,

    /// Problems that did not fail the migration, such as an instance that
    /// could not be restarted afterwards.
    pub warnings: Vec<String>,

    pub error: Option<String>,
}

impl Default for MigrationStatus {
    fn default() -> Self {
        Self {
            state: MigrationState::Created,
            transferred: BTreeMap::new(),
            negotiated: BTreeMap::new(),
            warnings: Vec::new(),
            error: None,
        }
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Success,
    Failure,
    Cancelled,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct Operation {
    pub id: Uuid,
    pub description: String,
    pub status: OperationStatus,

    /// Connection secrets, keyed by connection name. Only present on the
    /// side that waits for its peer to dial in.
    pub metadata: BTreeMap<String, String>,

    pub migration: Option<MigrationStatus>,
    pub err: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Instance {
    pub name: String,
    pub pool: String,
    pub running: bool,
    pub ephemeral: bool,
    pub volumes: Vec<String>,
}

#[derive(Clone, Deserialize, Serialize, JsonSchema)]
pub struct InstanceGetResponse {
    pub instance: Instance,
}
