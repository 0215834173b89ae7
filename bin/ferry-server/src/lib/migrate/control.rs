// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The control channel: negotiation and status messages on the "control"
//! connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use slog::{debug, error, warn, Logger};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_util::sync::CancellationToken;

use super::codec;
use super::conn::{ConnectionSet, StreamConn};
use super::{MigrateError, MigrateRole, MigrateStream, MigrationTimeouts};
use crate::storage::{ContentType, MigrationType, SnapshotInfo};

/// One volume the source is able to send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeOffer {
    pub name: String,
    /// Connection the volume will travel on.
    pub connection: String,
    pub content_type: ContentType,
    /// Formats the source's driver can produce, most preferred first.
    pub types: Vec<MigrationType>,
    /// Every snapshot of the volume, oldest first.
    pub snapshots: Vec<SnapshotInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationOffer {
    /// Wire protocols the source speaks, as a protocol offer string.
    pub protocols: String,
    pub instance: Option<String>,
    pub live: bool,
    /// Whether a checkpoint will follow on the state connection.
    pub checkpoint: bool,
    pub instance_only: bool,
    pub volume_only: bool,
    pub cluster_move: bool,
    pub source_pool: String,
    pub volumes: Vec<VolumeOffer>,
}

/// The sink's decision for one offered volume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePlan {
    pub connection: String,
    pub migration_type: MigrationType,
    /// Snapshots to send, oldest first.
    pub snapshots: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// The protocol selected from the offer.
    pub protocol: String,
    pub refresh: bool,
    pub volumes: Vec<VolumePlan>,
}

/// Bytes sent on one content connection, reported when it finishes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub connection: String,
    pub bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    Offer(MigrationOffer),
    Plan(MigrationPlan),
    Progress(TransferProgress),
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Offer(_) => "offer",
            ControlMessage::Plan(_) => "plan",
            ControlMessage::Progress(_) => "progress",
        }
    }
}

/// What the peer sent: a control message, or its terminal status.
#[derive(Debug)]
pub enum ControlFrame {
    Message(ControlMessage),
    Status(Result<(), MigrateError>),
}

type Writer = SplitSink<MigrateStream, tungstenite::Message>;
type Reader = SplitStream<MigrateStream>;

pub(crate) struct ControlChannel {
    log: Logger,
    /// Serializes writers. `None` once the channel was disconnected.
    writer: Mutex<Option<Writer>>,
    reader: Arc<Mutex<Reader>>,
    pending_read: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
    conns: Arc<ConnectionSet>,
    peer: MigrateRole,
    timeouts: MigrationTimeouts,
    final_sent: AtomicBool,
}

impl ControlChannel {
    pub fn new(
        log: Logger,
        conn: StreamConn,
        conns: Arc<ConnectionSet>,
        peer: MigrateRole,
        timeouts: MigrationTimeouts,
    ) -> Arc<Self> {
        let (_name, ws, closed) = conn.into_parts();
        let (writer, reader) = ws.split();
        Arc::new(Self {
            log,
            writer: Mutex::new(Some(writer)),
            reader: Arc::new(Mutex::new(reader)),
            pending_read: std::sync::Mutex::new(None),
            closed,
            conns,
            peer,
            timeouts,
            final_sent: AtomicBool::new(false),
        })
    }

    async fn write(
        &self,
        m: codec::Message,
        deadline: Duration,
    ) -> Result<(), MigrateError> {
        let kind = m.kind();
        let m = tungstenite::Message::try_from(m)?;
        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or_else(|| {
            MigrateError::ConnectionClosed(super::SECRET_NAME_CONTROL.into())
        })?;
        tokio::select! {
            _ = self.closed.cancelled() => Err(MigrateError::ConnectionClosed(
                super::SECRET_NAME_CONTROL.into(),
            )),
            res = tokio::time::timeout(deadline, w.send(m)) => match res {
                Ok(res) => Ok(res?),
                Err(_) => Err(MigrateError::Timeout(format!(
                    "sending {kind} on the control connection"
                ))),
            },
        }
    }

    /// Sends one control message.
    pub async fn send(&self, msg: &ControlMessage) -> Result<(), MigrateError> {
        debug!(self.log, "sending control message"; "kind" => msg.kind());
        let s = ron::ser::to_string(msg)
            .map_err(|e| MigrateError::Codec(e.to_string()))?;
        self.write(codec::Message::Serialized(s), self.timeouts.control_write)
            .await
    }

    /// Reads the next frame from the peer. Only one read is ever in flight:
    /// concurrent callers queue up behind the reader lock.
    pub async fn receive(&self) -> Result<ControlFrame, MigrateError> {
        Self::read_frame(&self.reader, &self.closed, self.peer).await
    }

    async fn read_frame(
        reader: &Mutex<Reader>,
        closed: &CancellationToken,
        peer: MigrateRole,
    ) -> Result<ControlFrame, MigrateError> {
        let closed_err = || {
            MigrateError::ConnectionClosed(super::SECRET_NAME_CONTROL.into())
        };
        let mut reader = reader.lock().await;
        loop {
            let next = tokio::select! {
                _ = closed.cancelled() => return Err(closed_err()),
                next = reader.next() => next,
            };
            let m = match next {
                Some(Ok(tungstenite::Message::Ping(_)))
                | Some(Ok(tungstenite::Message::Pong(_))) => continue,
                Some(Ok(tungstenite::Message::Close(_))) | None => {
                    return Err(closed_err())
                }
                Some(Ok(m)) => codec::Message::try_from(m)?,
                Some(Err(e)) => return Err(e.into()),
            };
            return match m {
                codec::Message::Serialized(s) => {
                    let msg: ControlMessage = ron::de::from_str(&s)
                        .map_err(|e| MigrateError::Codec(e.to_string()))?;
                    Ok(ControlFrame::Message(msg))
                }
                codec::Message::Okay => Ok(ControlFrame::Status(Ok(()))),
                codec::Message::Error(e) => Ok(ControlFrame::Status(Err(
                    MigrateError::RemoteError(peer, e.to_string()),
                ))),
                other => Err(MigrateError::UnexpectedMessage(format!(
                    "{} on the control connection",
                    other.kind()
                ))),
            };
        }
    }

    /// Reads the next frame in a background task, so the caller can wait on
    /// it alongside other events.
    pub fn receive_async(
        &self,
    ) -> oneshot::Receiver<Result<ControlFrame, MigrateError>> {
        let (tx, rx) = oneshot::channel();
        let reader = self.reader.clone();
        let closed = self.closed.clone();
        let peer = self.peer;
        let task = tokio::spawn(async move {
            let res = Self::read_frame(&reader, &closed, peer).await;
            let _ = tx.send(res);
        });
        if let Some(prev) = self.pending_read.lock().unwrap().replace(task) {
            // A reader whose result nobody waits for any more.
            prev.abort();
        }
        rx
    }

    /// Sends this end's terminal status, then tears down every connection of
    /// the session. Only the first call sends anything; teardown happens on
    /// every call, whether or not the send went through.
    pub async fn send_final_status(&self, result: &Result<(), MigrateError>) {
        if !self.final_sent.swap(true, Ordering::SeqCst) {
            let m = match result {
                Ok(()) => codec::Message::Okay,
                Err(e) => codec::Message::Error(e.clone()),
            };
            if let Err(e) = self.write(m, self.timeouts.final_status).await {
                warn!(self.log, "failed to send final status"; "error" => %e);
            }
        }
        self.disconnect().await;
    }

    /// Closes the control connection with a close handshake, bounded by the
    /// close timeout, and force-closes everything else.
    pub async fn disconnect(&self) {
        self.conns.close_content();

        if let Some(task) = self.pending_read.lock().unwrap().take() {
            task.abort();
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut w) = writer {
            let close = tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "migration finished".into(),
            }));
            let handshake = async {
                w.send(close).await?;
                let mut reader = self.reader.lock().await;
                // Drain until the peer acknowledges the close.
                while let Some(m) = reader.next().await {
                    if let tungstenite::Message::Close(_) = m? {
                        break;
                    }
                }
                Ok::<(), tungstenite::Error>(())
            };
            match tokio::time::timeout(self.timeouts.close, handshake).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(self.log, "control close handshake failed";
                        "error" => %e)
                }
                Err(_) => {
                    debug!(self.log, "control close handshake timed out")
                }
            }
        }

        self.conns.close_all();
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Some(task) = self.pending_read.get_mut().unwrap().take() {
            task.abort();
        }
        if !self.closed.is_cancelled() {
            error!(self.log, "control channel dropped without teardown");
            self.conns.close_all();
        }
    }
}
