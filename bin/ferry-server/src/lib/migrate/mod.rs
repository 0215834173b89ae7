// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Migration sessions.
//!
//! A migration moves an instance (or a single custom volume) between two
//! hosts over a set of named websocket connections: one "control"
//! connection carrying negotiation and status messages, plus one content
//! connection per volume and, for live migrations, one for the instance's
//! checkpoint. Each connection is authorized by its own random secret.
//!
//! The [`source::MigrationSource`] and [`sink::MigrationSink`] types drive
//! the two ends of a session. Either end may be the one that dials; the
//! other end publishes its secrets through its operation's metadata and
//! waits for the peer to connect.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dropshot::{ClientErrorStatusCode, HttpError};
use ferry_api_types::{MigrationDialTarget, MigrationState, MigrationStatus};
use serde::{Deserialize, Serialize};
use slog::{info, Logger};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_tungstenite::WebSocketStream;

use crate::storage::StorageError;
use conn::{ConnectionSet, Dialer, StreamConn};
use control::ControlChannel;

mod cleanup;
mod codec;
pub mod conn;
mod control;
pub mod negotiate;
pub mod protocol;
pub mod sink;
pub mod source;

pub use ferry_api_types::{
    SECRET_NAME_CONTROL, SECRET_NAME_FILESYSTEM, SECRET_NAME_STATE,
};

/// Trait bounds for connection objects used in migrations.
pub trait MigrateConn: AsyncRead + AsyncWrite + Unpin + Send {}

impl MigrateConn for tokio::net::TcpStream {}
impl MigrateConn for dropshot::WebsocketConnectionRaw {}
impl MigrateConn for tokio::io::DuplexStream {}

/// An established, upgraded migration connection.
pub type MigrateStream = WebSocketStream<Box<dyn MigrateConn>>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MigrateRole {
    Source,
    Sink,
}

#[derive(Debug, PartialEq, Eq)]
enum MigratePhase {
    Connect,
    Negotiate,
    Transfer,
    Finish,
}

impl std::fmt::Display for MigratePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MigratePhase::Connect => "Connect",
            MigratePhase::Negotiate => "Negotiate",
            MigratePhase::Transfer => "Transfer",
            MigratePhase::Finish => "Finish",
        };

        write!(f, "{}", s)
    }
}

/// Errors which may occur during the course of a migration
#[derive(Clone, Debug, Error, Deserialize, PartialEq, Serialize)]
pub enum MigrateError {
    /// An error as a result of some Websocket operation (i.e. establishing
    /// or maintaining one of the session's connections)
    #[error("Websocket error: {0}")]
    Websocket(String),

    /// Could not reach the peer's operation
    #[error("failed to dial {0}: {1}")]
    Dial(String, String),

    /// An incoming connection did not present a secret
    #[error("missing migration secret")]
    MissingSecret,

    /// An incoming connection presented a secret nobody issued
    #[error("invalid migration secret")]
    InvalidSecret,

    #[error("connection {0} is already part of this migration")]
    DuplicateConnectionName(String),

    #[error("no connection named {0} in this migration")]
    UnknownConnection(String),

    #[error("connection {0} is already established")]
    AlreadyConnected(String),

    #[error("connection {0} was closed")]
    ConnectionClosed(String),

    /// Some connections never attached
    #[error("timed out waiting for connections: {}", .0.join(", "))]
    ConnectTimeout(Vec<String>),

    #[error("failed to parse the offered protocol list ({0}): {1}")]
    ProtocolParse(String, String),

    /// The two ends share no wire protocol version
    #[error("the source ({0}) and sink ({1}) have no common protocol")]
    NoMatchingProtocol(String, String),

    /// The two ends' storage drivers share no transfer format
    #[error("no common transfer type for volume {0}")]
    NoCommonMigrationType(String),

    #[error(
        "instance {0} is running; stop it first or migrate it with force"
    )]
    InstanceRunning(String),

    /// The instance lifecycle manager returned an error
    #[error("instance error: {0}")]
    Instance(String),

    /// Encountered an error as part of encoding/decoding migration messages
    #[error("codec error: {0}")]
    Codec(String),

    /// Received a message out of order
    #[error("received unexpected migration message: {0}")]
    UnexpectedMessage(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// A storage driver returned an error
    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid migration request: {0}")]
    InvalidRequest(String),

    #[error("migration was cancelled")]
    Cancelled,

    /// The other end of the migration ran into an error
    #[error("{0:?} migration instance encountered error: {1}")]
    RemoteError(MigrateRole, String),
}

impl From<tokio_tungstenite::tungstenite::Error> for MigrateError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> MigrateError {
        MigrateError::Websocket(err.to_string())
    }
}

impl From<codec::ProtocolError> for MigrateError {
    fn from(err: codec::ProtocolError) -> Self {
        MigrateError::Codec(err.to_string())
    }
}

impl From<StorageError> for MigrateError {
    fn from(err: StorageError) -> Self {
        MigrateError::Storage(err.to_string())
    }
}

impl From<MigrateError> for HttpError {
    fn from(err: MigrateError) -> Self {
        let msg = format!("migration failed: {}", err);
        match &err {
            MigrateError::Websocket(_)
            | MigrateError::Dial(_, _)
            | MigrateError::ConnectionClosed(_)
            | MigrateError::ConnectTimeout(_)
            | MigrateError::ProtocolParse(_, _)
            | MigrateError::NoMatchingProtocol(_, _)
            | MigrateError::NoCommonMigrationType(_)
            | MigrateError::Instance(_)
            | MigrateError::Codec(_)
            | MigrateError::UnexpectedMessage(_)
            | MigrateError::Timeout(_)
            | MigrateError::Storage(_)
            | MigrateError::Cancelled
            | MigrateError::RemoteError(_, _) => {
                HttpError::for_internal_error(msg)
            }
            MigrateError::MissingSecret
            | MigrateError::DuplicateConnectionName(_)
            | MigrateError::UnknownConnection(_)
            | MigrateError::AlreadyConnected(_)
            | MigrateError::InstanceRunning(_)
            | MigrateError::InvalidRequest(_) => {
                HttpError::for_bad_request(None, msg)
            }
            // Rejected secrets are reported as forbidden rather than not
            // found so that a caller cannot probe for operations.
            MigrateError::InvalidSecret => HttpError::for_client_error(
                None,
                ClientErrorStatusCode::FORBIDDEN,
                msg,
            ),
        }
    }
}

/// Deadlines a session applies to its network operations.
#[derive(Clone, Copy, Debug)]
pub struct MigrationTimeouts {
    /// Bound on every control-channel write.
    pub control_write: Duration,
    /// Bound on the terminal status write.
    pub final_status: Duration,
    /// Bound on the close handshake of the control connection.
    pub close: Duration,
    /// Window in which every connection of the session must attach.
    pub connect: Duration,
    /// How long teardown waits for transfer workers to finish.
    pub drain: Duration,
}

impl Default for MigrationTimeouts {
    fn default() -> Self {
        Self {
            control_write: Duration::from_secs(30),
            final_status: Duration::from_secs(10),
            close: Duration::from_secs(1),
            connect: Duration::from_secs(60),
            drain: Duration::from_secs(30),
        }
    }
}

impl From<&ferry_server_config::Migration> for MigrationTimeouts {
    fn from(cfg: &ferry_server_config::Migration) -> Self {
        Self {
            control_write: Duration::from_secs(cfg.control_write_timeout_secs),
            final_status: Duration::from_secs(cfg.final_status_timeout_secs),
            close: Duration::from_secs(cfg.close_timeout_secs),
            connect: Duration::from_secs(cfg.connect_timeout_secs),
            drain: Duration::from_secs(cfg.drain_timeout_secs),
        }
    }
}

/// How a session gets hold of its connections.
#[derive(Clone)]
pub enum ConnectMode {
    /// Issue fresh secrets, publish them through the operation and wait for
    /// the peer to dial in.
    Accept,
    /// Dial the peer's operation using the secrets it issued.
    Dial { dialer: Arc<dyn Dialer>, target: MigrationDialTarget },
}

impl ConnectMode {
    /// Builds the connection set for a session needing `names`.
    fn connections(
        &self,
        log: &Logger,
        names: &[&str],
    ) -> Result<Arc<ConnectionSet>, MigrateError> {
        match self {
            ConnectMode::Accept => ConnectionSet::issued(log.clone(), names),
            ConnectMode::Dial { target, .. } => {
                for name in names {
                    if !target.secrets.contains_key(*name) {
                        return Err(MigrateError::InvalidRequest(format!(
                            "the peer issued no secret for connection {name}"
                        )));
                    }
                }
                ConnectionSet::with_secrets(log.clone(), &target.secrets)
            }
        }
    }
}

/// Publishes the progress of a session.
#[derive(Clone)]
pub(crate) struct StatusHandle(Arc<watch::Sender<MigrationStatus>>);

impl StatusHandle {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(MigrationStatus::default());
        Self(Arc::new(tx))
    }

    pub fn subscribe(&self) -> watch::Receiver<MigrationStatus> {
        self.0.subscribe()
    }

    fn set_state(&self, state: MigrationState) {
        self.0.send_modify(|s| s.state = state);
    }

    fn add_bytes(&self, conn: &str, bytes: u64) {
        self.0.send_modify(|s| {
            *s.transferred.entry(conn.to_string()).or_default() += bytes;
        });
    }

    fn negotiated(&self, volume: &str, mt: &crate::storage::MigrationType) {
        self.0.send_modify(|s| {
            s.negotiated.insert(volume.to_string(), mt.to_string());
        });
    }

    fn finish(&self, res: &Result<(), MigrateError>, warnings: Vec<String>) {
        self.0.send_modify(|s| {
            s.warnings.extend(warnings);
            match res {
                Ok(()) => s.state = MigrationState::Completed,
                Err(e) => {
                    s.state = MigrationState::Failed;
                    s.error = Some(e.to_string());
                }
            }
        });
    }
}

/// State shared by both ends of a session.
pub(crate) struct MigrationFields {
    log: Logger,
    conns: Arc<ConnectionSet>,
    mode: ConnectMode,
    live: bool,
    instance_only: bool,
    volume_only: bool,
    allow_inconsistent: bool,
    storage_pool: String,
    timeouts: MigrationTimeouts,
    status: StatusHandle,
}

/// The control channel and the content streams of a connected session.
type Connected = (Arc<ControlChannel>, BTreeMap<String, StreamConn>);

impl MigrationFields {
    /// Brings up every connection of the session and splits off the control
    /// connection.
    async fn connect(
        &self,
        peer: MigrateRole,
    ) -> Result<Connected, MigrateError> {
        self.status.set_state(MigrationState::AwaitingConnections);
        if let ConnectMode::Dial { dialer, target } = &self.mode {
            info!(self.log, "dialing peer"; "url" => &target.operation_url);
            self.conns.dial_all(dialer.as_ref(), target).await?;
        }
        let mut streams = self.conns.take_all(self.timeouts.connect).await?;
        let control = streams.remove(SECRET_NAME_CONTROL).ok_or_else(|| {
            MigrateError::UnknownConnection(SECRET_NAME_CONTROL.to_string())
        })?;
        info!(self.log, "all connections established";
            "count" => streams.len() + 1);
        let control = ControlChannel::new(
            self.log.clone(),
            control,
            self.conns.clone(),
            peer,
            self.timeouts,
        );
        Ok((control, streams))
    }
}

/// Connections in the order a source and sink of an instance agree on.
fn instance_connection_names<'a>(
    live: bool,
    volumes: &'a [String],
) -> Result<Vec<&'a str>, MigrateError> {
    const RESERVED: [&str; 3] =
        [SECRET_NAME_CONTROL, SECRET_NAME_FILESYSTEM, SECRET_NAME_STATE];

    let mut names = vec![SECRET_NAME_CONTROL, SECRET_NAME_FILESYSTEM];
    if live {
        names.push(SECRET_NAME_STATE);
    }
    for v in volumes {
        if RESERVED.contains(&v.as_str()) {
            return Err(MigrateError::InvalidRequest(format!(
                "volume name {v} clashes with a reserved connection name"
            )));
        }
        if names.contains(&v.as_str()) {
            return Err(MigrateError::DuplicateConnectionName(v.clone()));
        }
        names.push(v);
    }
    Ok(names)
}

#[usdt::provider(provider = "ferry")]
mod probes {
    fn migrate_phase_begin(step_desc: &str) {}
    fn migrate_phase_end(step_desc: &str) {}
    fn migrate_xfer_stream(conn: &str, bytes: u64) {}
}
