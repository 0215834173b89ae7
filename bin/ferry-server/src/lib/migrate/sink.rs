// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The receiving end of a migration session.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::FutureExt;
use slog::{debug, error, info, warn, Logger};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use ferry_api_types::{MigrationState, MigrationStatus};

use super::cleanup::{Finalizers, RunOn};
use super::conn::{ConnectionSet, StreamConn};
use super::control::{
    ControlChannel, ControlFrame, ControlMessage, MigrationOffer,
    MigrationPlan, VolumeOffer, VolumePlan,
};
use super::negotiate::{negotiate_type, refresh_snapshot_plan};
use super::protocol;
use super::source::next_control;
use super::{
    instance_connection_names, probes, ConnectMode, MigrateError,
    MigratePhase, MigrateRole, MigrationFields, MigrationTimeouts,
    StatusHandle, SECRET_NAME_CONTROL, SECRET_NAME_FILESYSTEM,
    SECRET_NAME_STATE,
};
use crate::instance::{InstanceLifecycle, InstanceStore, LocalInstance};
use crate::storage::transfer::{recv_done, recv_item};
use crate::storage::{
    ContentType, Driver, ItemHeader, MigrationFsType, SnapshotInfo,
    StorageError, Volume, VolumeFiller, VolumePostHook, VolumeRevertHook,
    VolumeTargetArgs,
};

/// What a sink session receives.
pub enum SinkSubject {
    /// An instance, created (or refreshed) under `name` in the sink's pool.
    Instance {
        name: String,
        instances: Arc<InstanceStore>,
        /// Custom volumes expected along with the instance, needed up front
        /// when the source dials in.
        volumes: Vec<String>,
        /// Local volume to seed a new root volume from.
        template: Option<String>,
        /// Start the instance once received, unless it is restored from a
        /// checkpoint anyway.
        start: bool,
    },
    /// A custom volume, created (or refreshed) under `name`.
    Volume { name: String },
}

impl SinkSubject {
    /// Local name of the root volume, or of the custom volume.
    fn primary_name(&self) -> &str {
        match self {
            SinkSubject::Instance { name, .. } => name,
            SinkSubject::Volume { name } => name,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SinkOptions {
    pub live: bool,
    pub instance_only: bool,
    pub volume_only: bool,
    pub refresh: bool,
    pub refresh_exclude_older: bool,
    /// Set when the transfer is part of a move inside a cluster.
    pub cluster_move: bool,
    /// Snapshots to request in addition to the ones selected by default.
    pub snapshots: Vec<String>,
}

/// A volume the sink agreed to receive.
struct PlannedVolume {
    name: String,
    connection: String,
    content_type: ContentType,
    args: VolumeTargetArgs,
    /// Whether this is the instance's root volume (or the custom volume of a
    /// volume migration).
    primary: bool,
}

enum WorkerOutput {
    Volume {
        name: String,
        conn: String,
        bytes: u64,
        post: VolumePostHook,
        revert: VolumeRevertHook,
    },
    Checkpoint {
        conn: String,
        bytes: u64,
        image: Option<Vec<u8>>,
    },
}

type WorkerResult = Result<WorkerOutput, MigrateError>;

pub struct MigrationSink {
    fields: MigrationFields,
    subject: SinkSubject,
    driver: Arc<dyn Driver>,
    refresh: bool,
    refresh_exclude_older: bool,
    cluster_move: bool,
    snapshots: Vec<String>,

    finalizers: Finalizers,
    control: Option<Arc<ControlChannel>>,
    streams: BTreeMap<String, StreamConn>,
    planned: Vec<PlannedVolume>,
    workers: JoinSet<WorkerResult>,
    ctrl_rx: Option<oneshot::Receiver<Result<ControlFrame, MigrateError>>>,
    post_hooks: Vec<(String, VolumePostHook)>,
    checkpoint: Option<Vec<u8>>,
}

impl MigrationSink {
    pub fn new(
        log: &Logger,
        subject: SinkSubject,
        pool: &str,
        driver: Arc<dyn Driver>,
        opts: SinkOptions,
        mode: ConnectMode,
        timeouts: MigrationTimeouts,
    ) -> Result<Self, MigrateError> {
        let (log, names) = match &subject {
            SinkSubject::Instance { name, volumes, .. } => {
                let names = instance_connection_names(opts.live, volumes)?;
                let log = log.new(slog::o!(
                    "migrate_role" => "sink",
                    "instance" => name.clone(),
                ));
                (log, names)
            }
            SinkSubject::Volume { name } => {
                let log = log.new(slog::o!(
                    "migrate_role" => "sink",
                    "volume" => name.clone(),
                ));
                (log, vec![SECRET_NAME_CONTROL, SECRET_NAME_FILESYSTEM])
            }
        };
        let conns = mode.connections(&log, &names)?;

        Ok(Self {
            fields: MigrationFields {
                log,
                conns,
                mode,
                live: opts.live,
                instance_only: opts.instance_only,
                volume_only: opts.volume_only,
                allow_inconsistent: false,
                storage_pool: pool.to_string(),
                timeouts,
                status: StatusHandle::new(),
            },
            subject,
            driver,
            refresh: opts.refresh,
            refresh_exclude_older: opts.refresh_exclude_older,
            cluster_move: opts.cluster_move,
            snapshots: opts.snapshots,
            finalizers: Finalizers::default(),
            control: None,
            streams: BTreeMap::new(),
            planned: Vec::new(),
            workers: JoinSet::new(),
            ctrl_rx: None,
            post_hooks: Vec::new(),
            checkpoint: None,
        })
    }

    pub fn connections(&self) -> Arc<ConnectionSet> {
        self.fields.conns.clone()
    }

    /// Whether the peer is expected to dial in with this session's secrets.
    pub fn publishes_secrets(&self) -> bool {
        matches!(self.fields.mode, ConnectMode::Accept)
    }

    pub fn status(&self) -> watch::Receiver<MigrationStatus> {
        self.fields.status.subscribe()
    }

    fn log(&self) -> &Logger {
        &self.fields.log
    }

    /// Drives the session to completion. Cancelling `cancel` fails the
    /// session, tears it down and reverts whatever was received.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
    ) -> Result<(), MigrateError> {
        info!(self.log(), "starting migration");
        let res = tokio::select! {
            res = self.drive() => res,
            _ = cancel.cancelled() => Err(MigrateError::Cancelled),
        };

        if let Err(e) = &res {
            error!(self.log(), "migration failed"; "error" => %e);
            self.fields.conns.close_content();
            self.drain_workers().await;
        }
        match &self.control {
            Some(control) => control.send_final_status(&res).await,
            None => self.fields.conns.close_all(),
        }

        let finalizers = std::mem::take(&mut self.finalizers);
        let warnings = finalizers.run(&self.fields.log, res.is_ok()).await;
        self.fields.status.finish(&res, warnings);
        if res.is_ok() {
            info!(self.log(), "migration completed");
        }
        res
    }

    /// Waits for workers still running after a failure, so that whatever
    /// they managed to create gets reverted too.
    async fn drain_workers(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        let deadline =
            tokio::time::Instant::now() + self.fields.timeouts.drain;
        loop {
            let next = self.workers.join_next();
            match tokio::time::timeout_at(deadline, next).await {
                Ok(Some(Ok(Ok(WorkerOutput::Volume { name, revert, .. })))) => {
                    self.push_revert(name, revert);
                }
                Ok(Some(Ok(Ok(WorkerOutput::Checkpoint { .. })))) => {}
                Ok(Some(Ok(Err(e)))) => {
                    debug!(self.fields.log, "transfer worker wound down";
                        "error" => %e);
                }
                Ok(Some(Err(e))) => {
                    warn!(self.fields.log, "transfer worker failed";
                        "error" => %e);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(self.fields.log,
                        "transfer workers did not wind down in time");
                    self.workers.abort_all();
                    break;
                }
            }
        }
    }

    fn push_revert(&mut self, name: String, revert: VolumeRevertHook) {
        self.finalizers.push(
            format!("revert volume {name}"),
            RunOn::Failure,
            move || revert().map(|r| r.map_err(anyhow::Error::from)).boxed(),
        );
    }

    async fn drive(&mut self) -> Result<(), MigrateError> {
        self.run_phase(MigratePhase::Connect).await?;
        self.run_phase(MigratePhase::Negotiate).await?;
        self.run_phase(MigratePhase::Transfer).await?;
        self.run_phase(MigratePhase::Finish).await
    }

    async fn run_phase(
        &mut self,
        step: MigratePhase,
    ) -> Result<(), MigrateError> {
        probes::migrate_phase_begin!(|| { step.to_string() });
        debug!(self.log(), "phase begin"; "phase" => %step);

        let res = match step {
            MigratePhase::Connect => self.connect().await,
            MigratePhase::Negotiate => self.negotiate().await,
            MigratePhase::Transfer => self.transfer().await,
            MigratePhase::Finish => self.finish().await,
        };

        probes::migrate_phase_end!(|| { step.to_string() });
        res
    }

    fn control(&self) -> Result<Arc<ControlChannel>, MigrateError> {
        self.control.clone().ok_or_else(|| {
            MigrateError::ConnectionClosed(SECRET_NAME_CONTROL.to_string())
        })
    }

    async fn connect(&mut self) -> Result<(), MigrateError> {
        let (control, streams) =
            self.fields.connect(MigrateRole::Source).await?;
        self.control = Some(control);
        self.streams = streams;
        Ok(())
    }

    fn existing_instance(&self) -> Option<Arc<LocalInstance>> {
        match &self.subject {
            SinkSubject::Instance { name, instances, .. } => {
                instances.get(name)
            }
            SinkSubject::Volume { .. } => None,
        }
    }

    async fn negotiate(&mut self) -> Result<(), MigrateError> {
        self.fields.status.set_state(MigrationState::Negotiating);
        let control = self.control()?;

        let offer = match control.receive().await? {
            ControlFrame::Message(ControlMessage::Offer(offer)) => offer,
            ControlFrame::Status(Err(e)) => return Err(e),
            ControlFrame::Status(Ok(())) => {
                return Err(MigrateError::UnexpectedMessage(
                    "success status in place of an offer".to_string(),
                ))
            }
            ControlFrame::Message(m) => {
                return Err(MigrateError::UnexpectedMessage(format!(
                    "{} in place of an offer",
                    m.kind()
                )))
            }
        };

        let selected =
            protocol::select_protocol_from_offer(&offer.protocols);
        let selected = match selected {
            Ok(Some(p)) => p,
            Ok(None) => {
                return Err(MigrateError::NoMatchingProtocol(
                    offer.protocols.clone(),
                    protocol::make_protocol_offer(),
                ))
            }
            Err(e) => {
                return Err(MigrateError::ProtocolParse(
                    offer.protocols.clone(),
                    e.to_string(),
                ))
            }
        };
        info!(self.log(), "selected protocol"; "protocol" => %selected);

        if offer.checkpoint && !self.streams.contains_key(SECRET_NAME_STATE) {
            return Err(MigrateError::InvalidRequest(
                "the source sends instance state but no live migration was \
                 requested"
                    .to_string(),
            ));
        }
        let existing = self.existing_instance();
        if let Some(inst) = existing {
            if !self.refresh {
                return Err(MigrateError::InvalidRequest(format!(
                    "instance {} already exists",
                    inst.name()
                )));
            }
            if inst.is_running().await {
                return Err(MigrateError::InstanceRunning(inst.name()));
            }
        }

        let storage_move =
            offer.cluster_move && offer.source_pool != self.fields.storage_pool;
        if let Some(vo) = offer
            .volumes
            .iter()
            .find(|vo| !self.streams.contains_key(&vo.connection))
        {
            return Err(MigrateError::UnknownConnection(vo.connection.clone()));
        }
        let planner = VolumePlanner {
            log: &self.fields.log,
            driver: self.driver.as_ref(),
            primary: self.subject.primary_name(),
            refresh: self.refresh,
            exclude_older: self.refresh_exclude_older,
            cluster_move: self.cluster_move,
            requested: &self.snapshots,
        };
        let mut planned = Vec::with_capacity(offer.volumes.len());
        for vo in &offer.volumes {
            planned.push(planner.plan(&offer, vo, storage_move).await?);
        }

        let plan = MigrationPlan {
            protocol: selected.to_string(),
            refresh: self.refresh,
            volumes: planned
                .iter()
                .map(|p| VolumePlan {
                    connection: p.connection.clone(),
                    migration_type: p.args.migration_type.clone(),
                    snapshots: p
                        .args
                        .snapshots
                        .iter()
                        .map(|s| s.name.clone())
                        .collect(),
                })
                .collect(),
        };
        for p in &planned {
            self.fields.status.negotiated(&p.name, &p.args.migration_type);
        }
        control.send(&ControlMessage::Plan(plan)).await?;
        self.planned = planned;
        Ok(())
    }

    async fn transfer(&mut self) -> Result<(), MigrateError> {
        self.fields.status.set_state(MigrationState::Transferring);
        let control = self.control()?;

        let template = match &self.subject {
            SinkSubject::Instance { template, .. } => template.clone(),
            SinkSubject::Volume { .. } => None,
        };
        for planned in std::mem::take(&mut self.planned) {
            let stream = self
                .streams
                .remove(&planned.connection)
                .ok_or_else(|| {
                    MigrateError::UnknownConnection(planned.connection.clone())
                })?;
            let filler = match &template {
                Some(t) if planned.primary && !planned.args.refresh => {
                    let data = self.driver.read_volume(t).await?;
                    Some(VolumeFiller { fingerprint: t.clone(), data })
                }
                _ => None,
            };
            let vol = Volume {
                pool: self.fields.storage_pool.clone(),
                name: planned.name,
                content_type: planned.content_type,
            };
            info!(self.fields.log, "receiving volume";
                "volume" => &vol.name, "type" => %planned.args.migration_type,
                "snapshots" => planned.args.snapshots.len());
            self.workers.spawn(receive_volume(
                self.driver.clone(),
                vol,
                stream,
                planned.args,
                filler,
            ));
        }

        if let Some(stream) = self.streams.remove(SECRET_NAME_STATE) {
            self.workers.spawn(receive_checkpoint(stream));
        }

        for (name, _) in std::mem::take(&mut self.streams) {
            warn!(self.log(), "connection left unused by the plan";
                "conn" => name);
        }

        self.ctrl_rx = Some(control.receive_async());
        while !self.workers.is_empty() {
            tokio::select! {
                joined = self.workers.join_next() => {
                    let output = match joined {
                        Some(Ok(Ok(output))) => output,
                        Some(Ok(Err(e))) => return Err(e),
                        Some(Err(e)) => {
                            return Err(MigrateError::Storage(format!(
                                "transfer worker failed: {e}"
                            )))
                        }
                        None => break,
                    };
                    let (conn, bytes) = match output {
                        WorkerOutput::Volume {
                            name,
                            conn,
                            bytes,
                            post,
                            revert,
                        } => {
                            self.push_revert(name.clone(), revert);
                            self.post_hooks.push((name, post));
                            (conn, bytes)
                        }
                        WorkerOutput::Checkpoint { conn, bytes, image } => {
                            self.checkpoint = image;
                            (conn, bytes)
                        }
                    };
                    info!(self.fields.log, "stream finished";
                        "conn" => &conn, "bytes" => bytes);
                    probes::migrate_xfer_stream!(|| (conn.clone(), bytes));
                    self.fields.status.add_bytes(&conn, bytes);
                }
                frame = next_control(&mut self.ctrl_rx) => match frame? {
                    ControlFrame::Message(ControlMessage::Progress(p)) => {
                        debug!(self.fields.log, "source progress";
                            "conn" => &p.connection, "bytes" => p.bytes);
                        self.ctrl_rx = Some(control.receive_async());
                    }
                    ControlFrame::Status(Err(e)) => return Err(e),
                    ControlFrame::Status(Ok(())) => {
                        return Err(MigrateError::UnexpectedMessage(
                            "source finished before the sink".to_string(),
                        ))
                    }
                    ControlFrame::Message(m) => {
                        return Err(MigrateError::UnexpectedMessage(format!(
                            "{} during transfer",
                            m.kind()
                        )))
                    }
                },
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), MigrateError> {
        let control = self.control()?;

        for (name, post) in std::mem::take(&mut self.post_hooks) {
            debug!(self.log(), "finalizing volume"; "volume" => &name);
            post().await?;
        }

        if let SinkSubject::Instance {
            name, instances, volumes, start, ..
        } = &self.subject
        {
            let instance = match instances.get(name) {
                Some(existing) => {
                    existing.set_volumes(volumes.clone());
                    existing
                }
                None => {
                    let created = instances
                        .create(
                            name,
                            &self.fields.storage_pool,
                            volumes.clone(),
                            false,
                            false,
                        )
                        .map_err(|e| MigrateError::Instance(format!("{e:#}")))?;
                    let (table, victim) = (instances.clone(), name.clone());
                    self.finalizers.push(
                        "forget received instance",
                        RunOn::Failure,
                        move || {
                            async move {
                                table.remove(&victim);
                                Ok(())
                            }
                            .boxed()
                        },
                    );
                    created
                }
            };

            let inst_err =
                |e: anyhow::Error| MigrateError::Instance(format!("{e:#}"));
            if let Some(image) = self.checkpoint.take() {
                info!(self.fields.log, "restoring instance from checkpoint");
                instance.restore(image).await.map_err(inst_err)?;
            } else if *start {
                info!(self.fields.log, "starting received instance");
                instance.start().await.map_err(inst_err)?;
            }
        }

        control.send_final_status(&Ok(())).await;
        Ok(())
    }
}

/// Decides how one offered volume is received.
struct VolumePlanner<'a> {
    log: &'a Logger,
    driver: &'a dyn Driver,
    primary: &'a str,
    refresh: bool,
    exclude_older: bool,
    cluster_move: bool,
    requested: &'a [String],
}

impl VolumePlanner<'_> {
    async fn plan(
        &self,
        offer: &MigrationOffer,
        vo: &VolumeOffer,
        storage_move: bool,
    ) -> Result<PlannedVolume, MigrateError> {
        let primary = vo.connection == SECRET_NAME_FILESYSTEM;
        let name = if primary {
            self.primary.to_string()
        } else {
            vo.name.clone()
        };
        let exists = self.driver.has_volume(&name).await?;
        if exists {
            let local_type = self.driver.volume_content_type(&name).await?;
            if local_type != vo.content_type {
                return Err(MigrateError::InvalidRequest(format!(
                    "volume {name} is {local_type:?} here but {:?} on the \
                     source",
                    vo.content_type
                )));
            }
        }

        let copy_snapshots = !offer.instance_only && !offer.volume_only;
        let supported = self.driver.migration_types(
            vo.content_type,
            self.refresh,
            copy_snapshots,
            self.cluster_move,
            storage_move,
        );
        let migration_type = negotiate_type(&name, &vo.types, &supported)?;
        let shared = migration_type.fs_type == MigrationFsType::Shared;
        if exists && !self.refresh && !shared {
            return Err(MigrateError::InvalidRequest(format!(
                "volume {name} already exists"
            )));
        }

        let (mut transfer, delete) = if shared || !copy_snapshots {
            (Vec::new(), Vec::new())
        } else if self.refresh && exists {
            let local = self.driver.volume_snapshots(&name).await?;
            let plan = refresh_snapshot_plan(
                &vo.snapshots,
                &local,
                self.exclude_older,
            );
            (plan.transfer, plan.delete)
        } else {
            (vo.snapshots.clone(), Vec::new())
        };

        if !shared {
            for wanted in self.requested {
                if transfer.iter().any(|s| &s.name == wanted) {
                    continue;
                }
                let info = vo
                    .snapshots
                    .iter()
                    .find(|s| &s.name == wanted)
                    .ok_or_else(|| {
                        MigrateError::InvalidRequest(format!(
                            "snapshot {wanted} of volume {} was not offered",
                            vo.name
                        ))
                    })?;
                transfer.push(info.clone());
            }
        }
        transfer.sort_by_key(|s: &SnapshotInfo| s.created_at);

        debug!(self.log, "planned volume";
            "volume" => &name, "type" => %migration_type,
            "snapshots" => transfer.len(), "stale" => delete.len());

        Ok(PlannedVolume {
            name,
            connection: vo.connection.clone(),
            content_type: vo.content_type,
            args: VolumeTargetArgs {
                snapshots: transfer,
                migration_type,
                refresh: self.refresh && exists,
                delete_snapshots: delete,
            },
            primary,
        })
    }
}

async fn receive_volume(
    driver: Arc<dyn Driver>,
    vol: Volume,
    mut stream: StreamConn,
    args: VolumeTargetArgs,
    filler: Option<VolumeFiller>,
) -> WorkerResult {
    let (post, revert) = driver
        .create_volume_from_migration(&vol, &mut stream, &args, filler)
        .await?;
    Ok(WorkerOutput::Volume {
        name: vol.name,
        conn: stream.name().to_string(),
        bytes: stream.bytes(),
        post,
        revert,
    })
}

async fn receive_checkpoint(mut stream: StreamConn) -> WorkerResult {
    let image = match recv_item(&mut stream).await? {
        Some((ItemHeader::Checkpoint, image)) => {
            recv_done(&mut stream).await?;
            Some(image)
        }
        Some(_) => {
            return Err(StorageError::Protocol(
                "expected a checkpoint on the state stream".to_string(),
            )
            .into())
        }
        None => None,
    };
    Ok(WorkerOutput::Checkpoint {
        conn: stream.name().to_string(),
        bytes: stream.bytes(),
        image,
    })
}
