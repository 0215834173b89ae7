// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP server callback functions.
//!
//! Functions in this module verify parameters and convert between API request
//! types and migration sessions before handing the sessions to the operation
//! registry, which runs them in the background.

use std::sync::Arc;

use dropshot::{
    endpoint, ApiDescription, HttpError, HttpResponseCreated,
    HttpResponseDeleted, HttpResponseOk, Path, Query, RequestContext,
    TypedBody, WebsocketConnection, WebsocketUpgrade,
};
use slog::{info, Logger};

use ferry_api_types as api;

use crate::instance::InstanceStore;
use crate::migrate::conn::{Dialer, WebsocketDialer};
use crate::migrate::sink::{MigrationSink, SinkOptions, SinkSubject};
use crate::migrate::source::{MigrationSource, SourceOptions, SourceSubject};
use crate::migrate::{ConnectMode, MigrationTimeouts};
use crate::operation::{rejected, Operation, Operations};
use crate::storage::{Driver, StorageError};

/// Context accessible from HTTP callbacks.
pub struct ServerContext {
    log: Logger,
    instances: Arc<InstanceStore>,
    operations: Operations,
    timeouts: MigrationTimeouts,
    dialer: Arc<dyn Dialer>,
}

fn not_found(msg: String) -> HttpError {
    HttpError::for_not_found(None, msg)
}

fn storage_error(e: StorageError) -> HttpError {
    match e {
        StorageError::NotFound(_) | StorageError::UnknownPool(_) => {
            not_found(e.to_string())
        }
        e => HttpError::for_internal_error(e.to_string()),
    }
}

impl ServerContext {
    /// Creates a new server context object.
    pub fn new(
        log: Logger,
        instances: Arc<InstanceStore>,
        timeouts: MigrationTimeouts,
    ) -> Self {
        Self {
            operations: Operations::new(log.new(slog::o!())),
            log,
            instances,
            timeouts,
            dialer: Arc::new(WebsocketDialer::default()),
        }
    }

    fn connect_mode(
        &self,
        target: Option<api::MigrationDialTarget>,
    ) -> ConnectMode {
        match target {
            Some(target) => {
                ConnectMode::Dial { dialer: self.dialer.clone(), target }
            }
            None => ConnectMode::Accept,
        }
    }

    fn pool(&self, name: &str) -> Result<Arc<dyn Driver>, HttpError> {
        self.instances.pools().get(name).map_err(storage_error)
    }

    /// Starts sending an instance.
    pub fn migrate_instance(
        &self,
        name: &str,
        req: api::InstanceMigrateRequest,
    ) -> Result<Arc<Operation>, HttpError> {
        let inst = self
            .instances
            .get(name)
            .ok_or_else(|| not_found(format!("no instance named {name}")))?;
        let attached = inst.volumes();
        if let Some(v) = req.volumes.iter().find(|v| !attached.contains(v)) {
            return Err(HttpError::for_bad_request(
                None,
                format!("volume {v} is not attached to instance {name}"),
            ));
        }
        let driver = self.pool(inst.pool())?;
        let pool = inst.pool().to_string();

        let opts = SourceOptions {
            live: req.live,
            force: req.force,
            instance_only: req.instance_only,
            volume_only: false,
            allow_inconsistent: req.allow_inconsistent,
            cluster_move: req.cluster_move_source_name.is_some(),
            snapshot: None,
        };
        let source = MigrationSource::new(
            &self.log,
            SourceSubject::Instance { instance: inst, volumes: req.volumes },
            &pool,
            driver,
            opts,
            self.connect_mode(req.target),
            self.timeouts,
        )?;
        Ok(self.operations.start(format!("Migrating instance {name}"), source))
    }

    /// Starts receiving an instance.
    pub fn receive_instance(
        &self,
        name: &str,
        req: api::InstanceReceiveRequest,
    ) -> Result<Arc<Operation>, HttpError> {
        let driver = self.pool(&req.pool)?;
        let opts = SinkOptions {
            live: req.live,
            instance_only: req.instance_only,
            volume_only: false,
            refresh: req.refresh,
            refresh_exclude_older: req.refresh_exclude_older,
            cluster_move: req.cluster_move_source_name.is_some(),
            snapshots: req.snapshots,
        };
        let sink = MigrationSink::new(
            &self.log,
            SinkSubject::Instance {
                name: name.to_string(),
                instances: self.instances.clone(),
                volumes: req.volumes,
                template: req.template,
                start: req.start,
            },
            &req.pool,
            driver,
            opts,
            self.connect_mode(req.source),
            self.timeouts,
        )?;
        Ok(self.operations.start(format!("Receiving instance {name}"), sink))
    }

    /// Starts sending a custom volume.
    pub async fn migrate_volume(
        &self,
        pool: &str,
        volume: &str,
        req: api::VolumeMigrateRequest,
    ) -> Result<Arc<Operation>, HttpError> {
        let driver = self.pool(pool)?;
        if !driver.has_volume(volume).await.map_err(storage_error)? {
            return Err(not_found(format!("no volume {volume} in pool {pool}")));
        }
        let opts = SourceOptions {
            volume_only: req.volume_only,
            allow_inconsistent: req.allow_inconsistent,
            snapshot: req.snapshot,
            ..Default::default()
        };
        let source = MigrationSource::new(
            &self.log,
            SourceSubject::Volume { name: volume.to_string() },
            pool,
            driver,
            opts,
            self.connect_mode(req.target),
            self.timeouts,
        )?;
        let desc = format!("Migrating volume {pool}/{volume}");
        Ok(self.operations.start(desc, source))
    }

    /// Starts receiving a custom volume.
    pub fn receive_volume(
        &self,
        pool: &str,
        volume: &str,
        req: api::VolumeReceiveRequest,
    ) -> Result<Arc<Operation>, HttpError> {
        let driver = self.pool(pool)?;
        let opts = SinkOptions {
            volume_only: req.volume_only,
            refresh: req.refresh,
            refresh_exclude_older: req.refresh_exclude_older,
            snapshots: req.snapshots,
            ..Default::default()
        };
        let sink = MigrationSink::new(
            &self.log,
            SinkSubject::Volume { name: volume.to_string() },
            pool,
            driver,
            opts,
            self.connect_mode(req.source),
            self.timeouts,
        )?;
        let desc = format!("Receiving volume {pool}/{volume}");
        Ok(self.operations.start(desc, sink))
    }

    fn operation(&self, id: &uuid::Uuid) -> Result<Arc<Operation>, HttpError> {
        self.operations
            .get(id)
            .ok_or_else(|| not_found(format!("no operation {id}")))
    }
}

#[endpoint {
    method = POST,
    path = "/1.0/instances/{name}/migrate",
}]
async fn instance_migrate(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<api::InstancePathParams>,
    request: TypedBody<api::InstanceMigrateRequest>,
) -> Result<HttpResponseCreated<api::Operation>, HttpError> {
    let name = path_params.into_inner().name;
    let op = rqctx.context().migrate_instance(&name, request.into_inner())?;
    Ok(HttpResponseCreated(op.view()))
}

#[endpoint {
    method = POST,
    path = "/1.0/instances/{name}/receive",
}]
async fn instance_receive(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<api::InstancePathParams>,
    request: TypedBody<api::InstanceReceiveRequest>,
) -> Result<HttpResponseCreated<api::Operation>, HttpError> {
    let name = path_params.into_inner().name;
    let op = rqctx.context().receive_instance(&name, request.into_inner())?;
    Ok(HttpResponseCreated(op.view()))
}

#[endpoint {
    method = GET,
    path = "/1.0/instances/{name}",
}]
async fn instance_get(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<api::InstancePathParams>,
) -> Result<HttpResponseOk<api::InstanceGetResponse>, HttpError> {
    let name = path_params.into_inner().name;
    let inst = rqctx
        .context()
        .instances
        .get(&name)
        .ok_or_else(|| not_found(format!("no instance named {name}")))?;
    Ok(HttpResponseOk(api::InstanceGetResponse { instance: inst.view() }))
}

#[endpoint {
    method = POST,
    path = "/1.0/storage-pools/{pool}/volumes/{volume}/migrate",
}]
async fn volume_migrate(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<api::VolumePathParams>,
    request: TypedBody<api::VolumeMigrateRequest>,
) -> Result<HttpResponseCreated<api::Operation>, HttpError> {
    let api::VolumePathParams { pool, volume } = path_params.into_inner();
    let op = rqctx
        .context()
        .migrate_volume(&pool, &volume, request.into_inner())
        .await?;
    Ok(HttpResponseCreated(op.view()))
}

#[endpoint {
    method = POST,
    path = "/1.0/storage-pools/{pool}/volumes/{volume}/receive",
}]
async fn volume_receive(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<api::VolumePathParams>,
    request: TypedBody<api::VolumeReceiveRequest>,
) -> Result<HttpResponseCreated<api::Operation>, HttpError> {
    let api::VolumePathParams { pool, volume } = path_params.into_inner();
    let op =
        rqctx.context().receive_volume(&pool, &volume, request.into_inner())?;
    Ok(HttpResponseCreated(op.view()))
}

#[endpoint {
    method = GET,
    path = "/1.0/operations/{id}",
}]
async fn operation_get(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<api::OperationPathParams>,
) -> Result<HttpResponseOk<api::Operation>, HttpError> {
    let op = rqctx.context().operation(&path_params.into_inner().id)?;
    Ok(HttpResponseOk(op.view()))
}

#[endpoint {
    method = DELETE,
    path = "/1.0/operations/{id}",
}]
async fn operation_cancel(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<api::OperationPathParams>,
) -> Result<HttpResponseDeleted, HttpError> {
    let op = rqctx.context().operation(&path_params.into_inner().id)?;
    info!(rqctx.log, "cancelling operation"; "operation" => %op.id());
    op.cancel();
    Ok(HttpResponseDeleted())
}

// Peers dial this endpoint to attach one of an operation's migration
// connections. The secret is checked before the upgrade so that a rejected
// peer gets a plain HTTP error.
#[endpoint {
    method = GET,
    path = "/1.0/operations/{id}/websocket",
    unpublished = true,
}]
async fn operation_websocket(
    rqctx: RequestContext<Arc<ServerContext>>,
    path_params: Path<api::OperationPathParams>,
    query: Query<api::SecretQuery>,
    websock: WebsocketUpgrade,
) -> dropshot::WebsocketEndpointResult {
    let id = path_params.into_inner().id;
    let secret = query.into_inner().secret;
    // An unknown operation is reported like a secret that matches nothing.
    let incoming = match rqctx.context().operations.get(&id) {
        Some(op) => op.accept_incoming(secret.as_deref())?,
        None => return Err(rejected(secret.as_deref()).into()),
    };
    info!(rqctx.log, "migration connection authorized";
        "operation" => %id, "conn" => incoming.name());

    websock.handle(move |conn: WebsocketConnection| async move {
        let res: dropshot::WebsocketChannelResult = incoming
            .attach(Box::new(conn.into_inner()))
            .await
            .map_err(Into::into);
        res
    })
}

/// Returns a Dropshot [`ApiDescription`] object to launch a server.
pub fn api() -> ApiDescription<Arc<ServerContext>> {
    let mut api = ApiDescription::new();
    api.register(instance_migrate).unwrap();
    api.register(instance_receive).unwrap();
    api.register(instance_get).unwrap();
    api.register(volume_migrate).unwrap();
    api.register(volume_receive).unwrap();
    api.register(operation_get).unwrap();
    api.register(operation_cancel).unwrap();
    api.register(operation_websocket).unwrap();

    api
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryDriver;
    use crate::storage::{Pools, VolumeData};
    use dropshot::{ConfigDropshot, HttpServerStarter};
    use ferry_api_types::{MigrationDialTarget, OperationStatus};

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn host() -> (Arc<ServerContext>, Arc<MemoryDriver>) {
        let driver = Arc::new(MemoryDriver::new(test_logger()));
        let mut pools = Pools::new();
        pools.insert("default", driver.clone());
        let instances = InstanceStore::new(test_logger(), pools);
        let ctx = ServerContext::new(
            test_logger(),
            instances,
            MigrationTimeouts::default(),
        );
        (Arc::new(ctx), driver)
    }

    #[test]
    fn openapi_document_lists_the_migration_routes() {
        let mut buf: Vec<u8> = vec![];
        super::api()
            .openapi("Ferry Server API", semver::Version::new(0, 0, 1))
            .description("API for moving instances and volumes between hosts.")
            .write(&mut buf)
            .unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains("/1.0/instances/{name}/migrate"));
        assert!(output
            .contains("/1.0/storage-pools/{pool}/volumes/{volume}/receive"));
        // Only peers use the websocket endpoint.
        assert!(!output.contains("/1.0/operations/{id}/websocket"));
    }

    #[tokio::test]
    async fn unknown_names_are_not_found() {
        let (ctx, _driver) = host();
        let err = ctx
            .migrate_instance("ghost", Default::default())
            .err()
            .expect("unknown instance accepted");
        assert_eq!(err.status_code.as_u16(), 404);
        let err = ctx
            .migrate_volume("default", "ghost", Default::default())
            .await
            .err()
            .expect("unknown volume accepted");
        assert_eq!(err.status_code.as_u16(), 404);
        let req = api::InstanceReceiveRequest {
            pool: "nowhere".to_string(),
            ..Default::default()
        };
        let err = ctx
            .receive_instance("web", req)
            .err()
            .expect("unknown pool accepted");
        assert_eq!(err.status_code.as_u16(), 404);
    }

    #[tokio::test]
    async fn pull_mode_volume_copy_over_http() {
        let (src_ctx, src_driver) = host();
        let (dst_ctx, dst_driver) = host();
        let data = VolumeData::Block(b"payload".to_vec());
        src_driver.create_volume("data", data.clone()).unwrap();

        let config = ConfigDropshot {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = HttpServerStarter::new(
            &config,
            api(),
            src_ctx.clone(),
            &test_logger(),
        )
        .unwrap()
        .start();
        let addr = server.local_addr();

        let src_op = src_ctx
            .migrate_volume("default", "data", Default::default())
            .await
            .unwrap();
        let secrets = src_op.view().metadata;
        assert!(secrets.contains_key(api::SECRET_NAME_CONTROL));

        let req = api::VolumeReceiveRequest {
            source: Some(MigrationDialTarget {
                operation_url: format!(
                    "ws://{addr}/1.0/operations/{}",
                    src_op.id()
                ),
                certificate: None,
                secrets,
            }),
            ..Default::default()
        };
        let dst_op = dst_ctx.receive_volume("default", "data", req).unwrap();
        // The receiving end dials out, so it has nothing to publish.
        assert!(dst_op.view().metadata.is_empty());

        let (src_res, dst_res) = tokio::join!(src_op.wait(), dst_op.wait());
        src_res.unwrap();
        dst_res.unwrap();
        assert_eq!(src_op.view().status, OperationStatus::Success);
        assert_eq!(dst_driver.read_volume("data").await.unwrap(), data);

        server.close().await.unwrap();
    }
}
