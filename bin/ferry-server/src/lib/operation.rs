// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background operations wrapping migration sessions.
//!
//! Starting a migration through the API creates an operation which runs the
//! session to completion in a task of its own. The side that waits for its
//! peer publishes the session's connection secrets in the operation's
//! metadata, and peers present those secrets on the operation's websocket
//! endpoint.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use slog::{debug, info, warn, Logger};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ferry_api_types::{self as api, MigrationStatus, OperationStatus};

use crate::migrate::conn::{ConnectionSet, IncomingConn};
use crate::migrate::sink::MigrationSink;
use crate::migrate::source::MigrationSource;
use crate::migrate::MigrateError;

/// Either end of a migration, as far as an operation is concerned.
pub trait MigrationSession: Send + 'static {
    fn connections(&self) -> Arc<ConnectionSet>;

    /// Whether the peer dials in with this session's secrets.
    fn publishes_secrets(&self) -> bool;

    fn status(&self) -> watch::Receiver<MigrationStatus>;

    fn run(
        self,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<(), MigrateError>>;
}

impl MigrationSession for MigrationSource {
    fn connections(&self) -> Arc<ConnectionSet> {
        MigrationSource::connections(self)
    }

    fn publishes_secrets(&self) -> bool {
        MigrationSource::publishes_secrets(self)
    }

    fn status(&self) -> watch::Receiver<MigrationStatus> {
        MigrationSource::status(self)
    }

    fn run(
        self,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<(), MigrateError>> {
        MigrationSource::run(self, cancel).boxed()
    }
}

impl MigrationSession for MigrationSink {
    fn connections(&self) -> Arc<ConnectionSet> {
        MigrationSink::connections(self)
    }

    fn publishes_secrets(&self) -> bool {
        MigrationSink::publishes_secrets(self)
    }

    fn status(&self) -> watch::Receiver<MigrationStatus> {
        MigrationSink::status(self)
    }

    fn run(
        self,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<(), MigrateError>> {
        MigrationSink::run(self, cancel).boxed()
    }
}

type Outcome = Option<Result<(), MigrateError>>;

/// The error for a peer whose secret matches nothing we published.
pub fn rejected(secret: Option<&str>) -> MigrateError {
    if secret.map_or(true, str::is_empty) {
        MigrateError::MissingSecret
    } else {
        MigrateError::InvalidSecret
    }
}

pub struct Operation {
    id: Uuid,
    description: String,
    /// Present only when the peer is expected to dial in.
    conns: Option<Arc<ConnectionSet>>,
    status: watch::Receiver<MigrationStatus>,
    outcome: watch::Sender<Outcome>,
    cancel: CancellationToken,
}

impl Operation {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn view(&self) -> api::Operation {
        let (status, err) = match &*self.outcome.borrow() {
            None => (OperationStatus::Running, None),
            Some(Ok(())) => (OperationStatus::Success, None),
            Some(Err(e @ MigrateError::Cancelled)) => {
                (OperationStatus::Cancelled, Some(e.to_string()))
            }
            Some(Err(e)) => (OperationStatus::Failure, Some(e.to_string())),
        };
        api::Operation {
            id: self.id,
            description: self.description.clone(),
            status,
            metadata: self
                .conns
                .as_ref()
                .map(|c| c.metadata())
                .unwrap_or_default(),
            migration: Some(self.status.borrow().clone()),
            err,
        }
    }

    /// Authorizes a peer dialing into this operation's session.
    pub fn accept_incoming(
        &self,
        secret: Option<&str>,
    ) -> Result<IncomingConn, MigrateError> {
        match &self.conns {
            Some(conns) => conns.accept_incoming(secret),
            None => Err(rejected(secret)),
        }
    }

    /// Requests cancellation. The session fails and reverts on its own time;
    /// use [`Operation::wait`] to see it through.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the session to finish and returns its outcome.
    pub async fn wait(&self) -> Result<(), MigrateError> {
        let mut rx = self.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(MigrateError::Cancelled))
    }
}

/// How long a finished operation stays queryable.
pub const OPERATION_RETENTION: Duration = Duration::from_secs(5);

type OperationMap = Arc<Mutex<BTreeMap<Uuid, Arc<Operation>>>>;

/// Every operation started on this server and not yet pruned. Finished
/// operations are forgotten once their retention period has passed.
pub struct Operations {
    log: Logger,
    ops: OperationMap,
    retention: Duration,
}

impl Operations {
    pub fn new(log: Logger) -> Self {
        Self::with_retention(log, OPERATION_RETENTION)
    }

    pub fn with_retention(log: Logger, retention: Duration) -> Self {
        Self { log, ops: Arc::new(Mutex::new(BTreeMap::new())), retention }
    }

    /// Registers an operation for `session` and runs the session in the
    /// background.
    pub fn start<S: MigrationSession>(
        &self,
        description: impl Into<String>,
        session: S,
    ) -> Arc<Operation> {
        let id = Uuid::new_v4();
        let description = description.into();
        let conns = session
            .publishes_secrets()
            .then(|| session.connections());
        let op = Arc::new(Operation {
            id,
            description: description.clone(),
            conns,
            status: session.status(),
            outcome: watch::channel(None).0,
            cancel: CancellationToken::new(),
        });
        self.ops.lock().unwrap().insert(id, op.clone());

        let log = self.log.new(slog::o!("operation" => id.to_string()));
        info!(log, "operation started"; "description" => &description);
        let task_op = op.clone();
        let ops = self.ops.clone();
        let retention = self.retention;
        tokio::spawn(async move {
            let res = session.run(task_op.cancel.clone()).await;
            match &res {
                Ok(()) => info!(log, "operation succeeded"),
                Err(e) => warn!(log, "operation failed"; "error" => %e),
            }
            task_op.outcome.send_replace(Some(res));

            tokio::time::sleep(retention).await;
            ops.lock().unwrap().remove(&id);
            debug!(log, "operation pruned");
        });
        op
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Operation>> {
        self.ops.lock().unwrap().get(id).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::migrate::sink::{SinkOptions, SinkSubject};
    use crate::migrate::{ConnectMode, MigrationTimeouts};
    use crate::storage::memory::MemoryDriver;
    use ferry_api_types::{SECRET_NAME_CONTROL, SECRET_NAME_FILESYSTEM};

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn waiting_sink() -> MigrationSink {
        MigrationSink::new(
            &test_logger(),
            SinkSubject::Volume { name: "data".to_string() },
            "default",
            Arc::new(MemoryDriver::new(test_logger())),
            SinkOptions::default(),
            ConnectMode::Accept,
            MigrationTimeouts::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn waiting_operation_publishes_secrets_until_cancelled() {
        let ops = Operations::new(test_logger());
        let op = ops.start("Receiving volume data", waiting_sink());
        assert!(ops.get(&op.id()).is_some());
        assert!(ops.get(&Uuid::new_v4()).is_none());

        let view = op.view();
        assert_eq!(view.status, OperationStatus::Running);
        let names: Vec<_> = view.metadata.keys().cloned().collect();
        assert_eq!(names, [SECRET_NAME_CONTROL, SECRET_NAME_FILESYSTEM]);
        assert!(matches!(
            op.accept_incoming(Some("nope")),
            Err(MigrateError::InvalidSecret)
        ));
        assert!(matches!(
            op.accept_incoming(None),
            Err(MigrateError::MissingSecret)
        ));

        op.cancel();
        assert_eq!(op.wait().await, Err(MigrateError::Cancelled));
        let view = op.view();
        assert_eq!(view.status, OperationStatus::Cancelled);
        assert_eq!(
            view.migration.unwrap().state,
            ferry_api_types::MigrationState::Failed
        );

        let secret = view.metadata[SECRET_NAME_CONTROL].clone();
        assert!(op.accept_incoming(Some(&secret)).is_err());
    }

    #[tokio::test]
    async fn finished_operations_are_pruned_after_retention() {
        let ops = Operations::with_retention(
            test_logger(),
            Duration::from_millis(10),
        );
        let op = ops.start("Receiving volume data", waiting_sink());
        let id = op.id();
        op.cancel();
        assert_eq!(op.wait().await, Err(MigrateError::Cancelled));

        let pruned = async {
            while ops.get(&id).is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), pruned)
            .await
            .expect("operation still listed");
        assert_eq!(op.view().status, OperationStatus::Cancelled);
    }

    #[test]
    fn rejection_depends_only_on_the_presented_secret() {
        assert_eq!(rejected(None), MigrateError::MissingSecret);
        assert_eq!(rejected(Some("")), MigrateError::MissingSecret);
        assert_eq!(rejected(Some("abc")), MigrateError::InvalidSecret);
    }
}
