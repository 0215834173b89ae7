// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sending end of a migration session.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::FutureExt;
use slog::{debug, error, info, warn, Logger};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ferry_api_types::{MigrationState, MigrationStatus};

use super::cleanup::{Finalizers, RunOn};
use super::conn::{ConnectionSet, StreamConn};
use super::control::{
    ControlChannel, ControlFrame, ControlMessage, MigrationOffer,
    MigrationPlan, TransferProgress, VolumeOffer,
};
use super::protocol;
use super::{
    instance_connection_names, probes, ConnectMode, MigrateError,
    MigratePhase, MigrateRole, MigrationFields, MigrationTimeouts,
    StatusHandle, SECRET_NAME_CONTROL, SECRET_NAME_FILESYSTEM,
    SECRET_NAME_STATE,
};
use crate::instance::InstanceLifecycle;
use crate::storage::transfer::{send_done, send_item};
use crate::storage::{Driver, ItemHeader, Volume, VolumeSourceArgs};

/// What a source session sends.
pub enum SourceSubject {
    /// An instance: its root volume (named after it), the listed custom
    /// volumes from the same pool and, for live migrations, its state.
    Instance { instance: Arc<dyn InstanceLifecycle>, volumes: Vec<String> },
    /// A single custom volume.
    Volume { name: String },
}

#[derive(Clone, Debug, Default)]
pub struct SourceOptions {
    pub live: bool,
    /// Stop a running instance for the transfer, and start it again after.
    pub force: bool,
    pub instance_only: bool,
    pub volume_only: bool,
    pub allow_inconsistent: bool,
    pub cluster_move: bool,
    /// Send this snapshot of a custom volume as a standalone volume.
    pub snapshot: Option<String>,
}

/// A volume as offered, and where its data is actually read from.
struct SourceVolume {
    name: String,
    local: String,
    connection: String,
}

type WorkerResult = Result<(String, u64), MigrateError>;

pub struct MigrationSource {
    fields: MigrationFields,
    subject: SourceSubject,
    driver: Arc<dyn Driver>,
    force: bool,
    cluster_move: bool,
    snapshot: Option<String>,

    finalizers: Finalizers,
    control: Option<Arc<ControlChannel>>,
    streams: BTreeMap<String, StreamConn>,
    volumes: Vec<SourceVolume>,
    offer: Option<MigrationOffer>,
    plan: Option<MigrationPlan>,
    checkpoint: Option<Vec<u8>>,
    workers: JoinSet<WorkerResult>,
    ctrl_rx: Option<oneshot::Receiver<Result<ControlFrame, MigrateError>>>,
    sink_done: bool,
}

impl MigrationSource {
    pub fn new(
        log: &Logger,
        subject: SourceSubject,
        pool: &str,
        driver: Arc<dyn Driver>,
        opts: SourceOptions,
        mode: ConnectMode,
        timeouts: MigrationTimeouts,
    ) -> Result<Self, MigrateError> {
        let (log, names) = match &subject {
            SourceSubject::Instance { instance, volumes } => {
                if opts.snapshot.is_some() {
                    return Err(MigrateError::InvalidRequest(
                        "only custom volumes can be exported from a snapshot"
                            .to_string(),
                    ));
                }
                let names = instance_connection_names(opts.live, volumes)?;
                let log = log.new(slog::o!(
                    "migrate_role" => "source",
                    "instance" => instance.name(),
                ));
                (log, names)
            }
            SourceSubject::Volume { name } => {
                let log = log.new(slog::o!(
                    "migrate_role" => "source",
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
                volume_only: opts.volume_only || opts.snapshot.is_some(),
                allow_inconsistent: opts.allow_inconsistent,
                storage_pool: pool.to_string(),
                timeouts,
                status: StatusHandle::new(),
            },
            subject,
            driver,
            force: opts.force,
            cluster_move: opts.cluster_move,
            snapshot: opts.snapshot,
            finalizers: Finalizers::default(),
            control: None,
            streams: BTreeMap::new(),
            volumes: Vec::new(),
            offer: None,
            plan: None,
            checkpoint: None,
            workers: JoinSet::new(),
            ctrl_rx: None,
            sink_done: false,
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
    /// session and tears it down.
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
        }
        match &self.control {
            Some(control) => control.send_final_status(&res).await,
            None => self.fields.conns.close_all(),
        }
        self.drain_workers().await;

        let finalizers = std::mem::take(&mut self.finalizers);
        let warnings = finalizers.run(&self.fields.log, res.is_ok()).await;
        self.fields.status.finish(&res, warnings);
        if res.is_ok() {
            info!(self.log(), "migration completed");
        }
        res
    }

    async fn drain_workers(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        let log = &self.fields.log;
        let deadline =
            tokio::time::Instant::now() + self.fields.timeouts.drain;
        loop {
            let next = self.workers.join_next();
            match tokio::time::timeout_at(deadline, next).await {
                Ok(Some(Ok(Ok(_)))) => {}
                Ok(Some(Ok(Err(e)))) => {
                    debug!(log, "transfer worker wound down"; "error" => %e);
                }
                Ok(Some(Err(e))) => {
                    warn!(log, "transfer worker failed"; "error" => %e);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(log, "transfer workers did not wind down in time");
                    self.workers.abort_all();
                    break;
                }
            }
        }
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
        let (control, streams) = self.fields.connect(MigrateRole::Sink).await?;
        self.control = Some(control);
        self.streams = streams;
        Ok(())
    }

    /// Stops a running instance for a non-live transfer. Whatever happens
    /// afterwards, the instance is started again and its ephemeral flag
    /// restored on the way out.
    async fn stop_instance(
        &mut self,
        instance: &Arc<dyn InstanceLifecycle>,
    ) -> Result<(), MigrateError> {
        let inst_err =
            |e: anyhow::Error| MigrateError::Instance(format!("{e:#}"));

        if instance.is_ephemeral().await {
            info!(self.log(), "clearing ephemeral flag for the transfer");
            instance.update_ephemeral(false).await.map_err(inst_err)?;
            let inst = instance.clone();
            self.finalizers.push(
                "restore ephemeral flag",
                RunOn::Always,
                move || {
                    async move { inst.update_ephemeral(true).await }.boxed()
                },
            );
        }

        info!(self.log(), "stopping instance for the transfer");
        instance.stop(None, true).await.map_err(inst_err)?;
        let inst = instance.clone();
        self.finalizers.push("restart instance", RunOn::Always, move || {
            async move { inst.start().await }.boxed()
        });
        Ok(())
    }

    async fn negotiate(&mut self) -> Result<(), MigrateError> {
        self.fields.status.set_state(MigrationState::Negotiating);
        let control = self.control()?;

        let mut checkpoint = false;
        let (instance_name, volumes) = match &self.subject {
            SourceSubject::Instance { instance, volumes } => {
                let instance = instance.clone();
                let volumes = volumes.clone();
                let name = instance.name();
                if instance.is_running().await {
                    if self.fields.live {
                        checkpoint = true;
                    } else if !self.force {
                        return Err(MigrateError::InstanceRunning(name));
                    } else {
                        self.stop_instance(&instance).await?;
                    }
                }
                let mut list = vec![SourceVolume {
                    name: name.clone(),
                    local: name.clone(),
                    connection: SECRET_NAME_FILESYSTEM.to_string(),
                }];
                list.extend(volumes.iter().map(|v| SourceVolume {
                    name: v.clone(),
                    local: v.clone(),
                    connection: v.clone(),
                }));
                (Some(name), list)
            }
            SourceSubject::Volume { name } => {
                let name = name.clone();
                let local = match self.snapshot.clone() {
                    Some(snap) => self.export_snapshot(&name, &snap).await?,
                    None => name.clone(),
                };
                let vol = SourceVolume {
                    name: name.clone(),
                    local,
                    connection: SECRET_NAME_FILESYSTEM.to_string(),
                };
                (None, vec![vol])
            }
        };

        let copy_snapshots =
            !self.fields.instance_only && !self.fields.volume_only;
        let mut offers = Vec::with_capacity(volumes.len());
        for v in &volumes {
            let content_type = self.driver.volume_content_type(&v.local).await?;
            let types = self.driver.migration_types(
                content_type,
                false,
                copy_snapshots,
                self.cluster_move,
                false,
            );
            offers.push(VolumeOffer {
                name: v.name.clone(),
                connection: v.connection.clone(),
                content_type,
                types,
                snapshots: self.driver.volume_snapshots(&v.local).await?,
            });
        }

        let offer = MigrationOffer {
            protocols: protocol::make_protocol_offer(),
            instance: instance_name,
            live: self.fields.live,
            checkpoint,
            instance_only: self.fields.instance_only,
            volume_only: self.fields.volume_only,
            cluster_move: self.cluster_move,
            source_pool: self.fields.storage_pool.clone(),
            volumes: offers,
        };
        control.send(&ControlMessage::Offer(offer.clone())).await?;

        let plan = match control.receive().await? {
            ControlFrame::Message(ControlMessage::Plan(plan)) => plan,
            ControlFrame::Status(Err(e)) => return Err(e),
            ControlFrame::Status(Ok(())) => {
                return Err(MigrateError::UnexpectedMessage(
                    "success status in place of a plan".to_string(),
                ))
            }
            ControlFrame::Message(m) => {
                return Err(MigrateError::UnexpectedMessage(format!(
                    "{} in place of a plan",
                    m.kind()
                )))
            }
        };
        Self::validate_plan(&offer, &plan)?;
        info!(self.log(), "sink accepted offer"; "protocol" => &plan.protocol);
        for vp in &plan.volumes {
            let offered =
                offer.volumes.iter().find(|o| o.connection == vp.connection);
            if let Some(vo) = offered {
                self.fields.status.negotiated(&vo.name, &vp.migration_type);
            }
        }

        if checkpoint {
            if let SourceSubject::Instance { instance, .. } = &self.subject {
                let instance = instance.clone();
                info!(self.log(), "checkpointing instance");
                let image = instance
                    .checkpoint()
                    .await
                    .map_err(|e| MigrateError::Instance(format!("{e:#}")))?;
                let resume = image.clone();
                self.finalizers.push(
                    "resume instance",
                    RunOn::Failure,
                    move || {
                        async move { instance.restore(resume).await }.boxed()
                    },
                );
                self.checkpoint = Some(image);
            }
        }

        self.volumes = volumes;
        self.offer = Some(offer);
        self.plan = Some(plan);
        Ok(())
    }

    /// Materializes one snapshot of a custom volume as a temporary volume,
    /// deleted again however the session ends.
    async fn export_snapshot(
        &mut self,
        name: &str,
        snapshot: &str,
    ) -> Result<String, MigrateError> {
        let tmp = format!("{name}-export-{}", Uuid::new_v4().simple());
        info!(self.log(), "exporting snapshot";
            "snapshot" => snapshot, "temporary_volume" => &tmp);
        self.driver.create_volume_from_snapshot(name, snapshot, &tmp).await?;

        let driver = self.driver.clone();
        let victim = tmp.clone();
        self.finalizers.push(
            "delete exported snapshot",
            RunOn::Always,
            move || {
                async move {
                    driver
                        .delete_volume(&victim)
                        .await
                        .map_err(anyhow::Error::from)
                }
                .boxed()
            },
        );
        Ok(tmp)
    }

    fn validate_plan(
        offer: &MigrationOffer,
        plan: &MigrationPlan,
    ) -> Result<(), MigrateError> {
        let bad = |msg: String| MigrateError::UnexpectedMessage(msg);

        let selected = protocol::parse_selection(&plan.protocol).map_err(|e| {
            MigrateError::ProtocolParse(plan.protocol.clone(), e.to_string())
        })?;
        if !offer.protocols.split(',').any(|p| p == selected.to_string()) {
            return Err(MigrateError::NoMatchingProtocol(
                offer.protocols.clone(),
                plan.protocol.clone(),
            ));
        }

        if plan.volumes.len() != offer.volumes.len() {
            return Err(bad(format!(
                "plan covers {} volumes, {} were offered",
                plan.volumes.len(),
                offer.volumes.len()
            )));
        }
        for vp in &plan.volumes {
            let vo = offer
                .volumes
                .iter()
                .find(|o| o.connection == vp.connection)
                .ok_or_else(|| {
                    bad(format!(
                        "plan names unknown connection {}",
                        vp.connection
                    ))
                })?;
            let offered = vo
                .types
                .iter()
                .find(|t| t.fs_type == vp.migration_type.fs_type)
                .ok_or_else(|| {
                    bad(format!(
                        "plan selects {} for {}, which was not offered",
                        vp.migration_type, vo.name
                    ))
                })?;
            if let Some(f) = vp
                .migration_type
                .features
                .iter()
                .find(|f| !offered.features.contains(f))
            {
                return Err(bad(format!("plan enables unoffered feature {f}")));
            }
            if let Some(s) = vp
                .snapshots
                .iter()
                .find(|s| !vo.snapshots.iter().any(|o| &o.name == *s))
            {
                return Err(bad(format!(
                    "plan requests unknown snapshot {s} of {}",
                    vo.name
                )));
            }
        }
        Ok(())
    }

    async fn transfer(&mut self) -> Result<(), MigrateError> {
        self.fields.status.set_state(MigrationState::Transferring);
        let control = self.control()?;
        let plan = self.plan.take().ok_or_else(|| {
            MigrateError::UnexpectedMessage(
                "transfer without a plan".to_string(),
            )
        })?;

        for vp in plan.volumes {
            let unknown =
                || MigrateError::UnknownConnection(vp.connection.clone());
            let v = self
                .volumes
                .iter()
                .find(|v| v.connection == vp.connection)
                .ok_or_else(unknown)?;
            let stream =
                self.streams.remove(&vp.connection).ok_or_else(unknown)?;
            let content_type = self
                .offer
                .as_ref()
                .and_then(|o| {
                    o.volumes.iter().find(|o| o.connection == vp.connection)
                })
                .map(|o| o.content_type)
                .ok_or_else(unknown)?;
            let vol = Volume {
                pool: self.fields.storage_pool.clone(),
                name: v.local.clone(),
                content_type,
            };
            let args = VolumeSourceArgs {
                snapshots: vp.snapshots,
                migration_type: vp.migration_type,
                allow_inconsistent: self.fields.allow_inconsistent,
            };
            info!(self.fields.log, "sending volume";
                "volume" => &vol.name, "type" => %args.migration_type,
                "snapshots" => args.snapshots.len());
            let driver = self.driver.clone();
            self.workers.spawn(send_volume(driver, vol, stream, args));
        }

        if let Some(stream) = self.streams.remove(SECRET_NAME_STATE) {
            self.workers.spawn(send_checkpoint(stream, self.checkpoint.take()));
        }

        for (name, _) in std::mem::take(&mut self.streams) {
            warn!(self.log(), "connection left unused by the plan";
                "conn" => name);
        }

        self.ctrl_rx = Some(control.receive_async());
        while !self.workers.is_empty() {
            tokio::select! {
                joined = self.workers.join_next() => {
                    let (conn, bytes) = match joined {
                        Some(Ok(Ok(done))) => done,
                        Some(Ok(Err(e))) => {
                            self.fields.conns.close_content();
                            return Err(e);
                        }
                        Some(Err(e)) => {
                            self.fields.conns.close_content();
                            return Err(MigrateError::Storage(format!(
                                "transfer worker failed: {e}"
                            )));
                        }
                        None => break,
                    };
                    info!(self.fields.log, "stream finished";
                        "conn" => &conn, "bytes" => bytes);
                    probes::migrate_xfer_stream!(|| (conn.clone(), bytes));
                    self.fields.status.add_bytes(&conn, bytes);
                    let progress = ControlMessage::Progress(TransferProgress {
                        connection: conn,
                        bytes,
                    });
                    if let Err(e) = control.send(&progress).await {
                        warn!(self.fields.log, "failed to report progress";
                            "error" => %e);
                    }
                }
                frame = next_control(&mut self.ctrl_rx) => match frame? {
                    ControlFrame::Status(Ok(())) => {
                        debug!(self.fields.log,
                            "sink finished before the last worker");
                        self.sink_done = true;
                    }
                    ControlFrame::Status(Err(e)) => return Err(e),
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
        if !self.sink_done {
            let frame = match self.ctrl_rx.take() {
                Some(rx) => rx.await.map_err(|_| {
                    MigrateError::ConnectionClosed(
                        SECRET_NAME_CONTROL.to_string(),
                    )
                })??,
                None => control.receive().await?,
            };
            match frame {
                ControlFrame::Status(Ok(())) => {}
                ControlFrame::Status(Err(e)) => return Err(e),
                ControlFrame::Message(m) => {
                    return Err(MigrateError::UnexpectedMessage(format!(
                        "{} in place of the final status",
                        m.kind()
                    )))
                }
            }
        }
        control.send_final_status(&Ok(())).await;
        Ok(())
    }
}

async fn send_volume(
    driver: Arc<dyn Driver>,
    vol: Volume,
    mut stream: StreamConn,
    args: VolumeSourceArgs,
) -> WorkerResult {
    driver.migrate_volume(&vol, &mut stream, &args).await?;
    Ok((stream.name().to_string(), stream.bytes()))
}

/// Sends the instance's checkpoint, or just ends the stream if the instance
/// was not running.
async fn send_checkpoint(
    mut stream: StreamConn,
    image: Option<Vec<u8>>,
) -> WorkerResult {
    if let Some(image) = image {
        send_item(&mut stream, ItemHeader::Checkpoint, &image).await?;
    }
    send_done(&mut stream).await?;
    Ok((stream.name().to_string(), stream.bytes()))
}

/// Waits for the pending control read, if any. Never completes otherwise.
pub(super) async fn next_control(
    rx: &mut Option<oneshot::Receiver<Result<ControlFrame, MigrateError>>>,
) -> Result<ControlFrame, MigrateError> {
    match rx {
        Some(r) => {
            let res = r.await;
            *rx = None;
            res.map_err(|_| {
                MigrateError::ConnectionClosed(SECRET_NAME_CONTROL.to_string())
            })?
        }
        None => futures::future::pending().await,
    }
}
