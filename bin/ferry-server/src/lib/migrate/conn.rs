// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named, secret-authorized connections of one migration session.
//!
//! A [`ConnectionSet`] is created with one entry per logical connection of a
//! session, "control" first. Each entry starts out pending. It becomes
//! established when a stream is attached, either by an authorized peer
//! dialing in ([`ConnectionSet::accept_incoming`]) or by this end dialing
//! out ([`ConnectionSet::dial_all`]), and it ends up closed once the session
//! tears down. A closed entry never reopens.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use slog::{debug, info, Logger};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::{tungstenite, WebSocketStream};
use tokio_util::sync::CancellationToken;

use ferry_api_types::MigrationDialTarget;

use super::codec;
use super::{MigrateConn, MigrateError, MigrateStream, SECRET_NAME_CONTROL};
use crate::storage::{Frame, ItemHeader, StorageError, VolumeStream};

const SECRET_LEN: usize = 32;

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Compares two secrets without short-circuiting on the first differing
/// byte.
fn secrets_match(presented: &str, issued: &str) -> bool {
    let (a, b) = (presented.as_bytes(), issued.as_bytes());
    a.len() == b.len()
        && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Lifecycle of one named connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Pending,
    Established,
    Closed,
}

struct Slot {
    state: ConnState,
    /// Hands an attached stream to whoever waits in
    /// [`ConnectionSet::take_all`].
    tx: Option<oneshot::Sender<MigrateStream>>,
    rx: Option<oneshot::Receiver<MigrateStream>>,
}

struct MigrationConn {
    name: String,
    secret: String,
    closed: CancellationToken,
    slot: Mutex<Slot>,
}

impl MigrationConn {
    fn new(name: String, secret: String) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            name,
            secret,
            closed: CancellationToken::new(),
            slot: Mutex::new(Slot {
                state: ConnState::Pending,
                tx: Some(tx),
                rx: Some(rx),
            }),
        }
    }

    /// Reserves the pending entry for a stream about to be attached. The
    /// entry stays pending until [`MigrationConn::hand_over`].
    fn claim(&self) -> Result<oneshot::Sender<MigrateStream>, MigrateError> {
        let mut slot = self.slot.lock().unwrap();
        match slot.state {
            ConnState::Closed => {
                Err(MigrateError::ConnectionClosed(self.name.clone()))
            }
            ConnState::Established => {
                Err(MigrateError::AlreadyConnected(self.name.clone()))
            }
            ConnState::Pending => slot.tx.take().ok_or_else(|| {
                MigrateError::AlreadyConnected(self.name.clone())
            }),
        }
    }

    /// Gives the stream to the session and marks the entry established.
    fn hand_over(
        &self,
        tx: oneshot::Sender<MigrateStream>,
        ws: MigrateStream,
    ) -> Result<(), MigrateError> {
        let mut slot = self.slot.lock().unwrap();
        if slot.state == ConnState::Closed || tx.send(ws).is_err() {
            return Err(MigrateError::ConnectionClosed(self.name.clone()));
        }
        slot.state = ConnState::Established;
        Ok(())
    }

    /// Returns a claim that never produced a stream, so the peer may retry.
    fn release(&self, tx: oneshot::Sender<MigrateStream>) {
        let mut slot = self.slot.lock().unwrap();
        if slot.state == ConnState::Pending && slot.tx.is_none() {
            slot.tx = Some(tx);
        }
    }
}

/// The connections of one migration session, in issue order.
pub struct ConnectionSet {
    log: Logger,
    conns: Mutex<Vec<Arc<MigrationConn>>>,
}

impl ConnectionSet {
    /// Creates a set with a fresh random secret per name. "control" is
    /// always issued first, whether or not `names` mentions it.
    pub fn issued(
        log: Logger,
        names: &[&str],
    ) -> Result<Arc<Self>, MigrateError> {
        let set = Self { log, conns: Mutex::new(Vec::new()) };
        set.issue(SECRET_NAME_CONTROL)?;
        for name in names.iter().filter(|n| **n != SECRET_NAME_CONTROL) {
            set.issue(name)?;
        }
        Ok(Arc::new(set))
    }

    /// Creates a set from secrets handed out by the remote end.
    pub fn with_secrets(
        log: Logger,
        secrets: &BTreeMap<String, String>,
    ) -> Result<Arc<Self>, MigrateError> {
        let control = secrets.get(SECRET_NAME_CONTROL).ok_or_else(|| {
            MigrateError::InvalidRequest(format!(
                "no secret for the {SECRET_NAME_CONTROL} connection"
            ))
        })?;
        let mut conns = vec![Arc::new(MigrationConn::new(
            SECRET_NAME_CONTROL.to_string(),
            control.clone(),
        ))];
        conns.extend(
            secrets
                .iter()
                .filter(|(n, _)| n.as_str() != SECRET_NAME_CONTROL)
                .map(|(n, s)| {
                    Arc::new(MigrationConn::new(n.clone(), s.clone()))
                }),
        );
        Ok(Arc::new(Self { log, conns: Mutex::new(conns) }))
    }

    /// Adds a pending connection and returns its secret.
    pub fn issue(&self, name: &str) -> Result<String, MigrateError> {
        let mut conns = self.conns.lock().unwrap();
        if conns.iter().any(|c| c.name == name) {
            return Err(MigrateError::DuplicateConnectionName(name.to_string()));
        }
        let secret = generate_secret();
        let conn = MigrationConn::new(name.to_string(), secret.clone());
        conns.push(Arc::new(conn));
        Ok(secret)
    }

    pub fn names(&self) -> Vec<String> {
        self.conns.lock().unwrap().iter().map(|c| c.name.clone()).collect()
    }

    pub fn state(&self, name: &str) -> Option<ConnState> {
        self.find(name).map(|c| c.slot.lock().unwrap().state)
    }

    /// Secrets by connection name, for the peer that is going to dial in.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        self.conns
            .lock()
            .unwrap()
            .iter()
            .map(|c| (c.name.clone(), c.secret.clone()))
            .collect()
    }

    fn find(&self, name: &str) -> Option<Arc<MigrationConn>> {
        self.conns.lock().unwrap().iter().find(|c| c.name == name).cloned()
    }

    /// Authorizes an incoming connection by the secret it presented.
    ///
    /// Only an exact match authorizes. A secret which matches nothing is
    /// reported as invalid, never as unknown, so connection names stay
    /// hidden from callers.
    pub fn accept_incoming(
        &self,
        presented: Option<&str>,
    ) -> Result<IncomingConn, MigrateError> {
        let presented = match presented {
            Some(s) if !s.is_empty() => s,
            _ => return Err(MigrateError::MissingSecret),
        };

        let conns = self.conns.lock().unwrap().clone();
        let conn = conns
            .iter()
            .find(|c| secrets_match(presented, &c.secret))
            .ok_or(MigrateError::InvalidSecret)?;
        let tx = conn.claim()?;

        info!(self.log, "accepted migration connection"; "conn" => &conn.name);
        Ok(IncomingConn { conn: conn.clone(), tx: Some(tx) })
    }

    /// Attaches an already-upgraded stream to a pending connection.
    pub fn establish(
        &self,
        name: &str,
        ws: MigrateStream,
    ) -> Result<(), MigrateError> {
        let conn = self
            .find(name)
            .ok_or_else(|| MigrateError::UnknownConnection(name.to_string()))?;
        let tx = conn.claim()?;
        conn.hand_over(tx, ws)
    }

    /// Dials every connection of the set, control first.
    pub async fn dial_all(
        &self,
        dialer: &dyn Dialer,
        target: &MigrationDialTarget,
    ) -> Result<(), MigrateError> {
        let conns = self.conns.lock().unwrap().clone();
        for conn in conns {
            debug!(self.log, "dialing"; "conn" => &conn.name);
            let ws = tokio::select! {
                _ = conn.closed.cancelled() => {
                    let name = conn.name.clone();
                    return Err(MigrateError::ConnectionClosed(name));
                }
                res = dialer.dial(target, &conn.name, &conn.secret) => res?,
            };
            self.establish(&conn.name, ws)?;
        }
        Ok(())
    }

    /// Waits until every connection is established and takes ownership of
    /// the streams. Fails with the names of the stragglers if `timeout`
    /// elapses first.
    pub async fn take_all(
        &self,
        timeout: Duration,
    ) -> Result<BTreeMap<String, StreamConn>, MigrateError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let conns = self.conns.lock().unwrap().clone();

        let mut streams = BTreeMap::new();
        let mut missing = Vec::new();
        for conn in conns {
            let rx = conn.slot.lock().unwrap().rx.take();
            let Some(rx) = rx else {
                return Err(MigrateError::ConnectionClosed(conn.name.clone()));
            };
            let ws = tokio::select! {
                _ = conn.closed.cancelled() => {
                    let name = conn.name.clone();
                    return Err(MigrateError::ConnectionClosed(name));
                }
                res = tokio::time::timeout_at(deadline, rx) => res,
            };
            match ws {
                Ok(Ok(ws)) => {
                    streams.insert(
                        conn.name.clone(),
                        StreamConn {
                            name: conn.name.clone(),
                            ws,
                            closed: conn.closed.clone(),
                            bytes: 0,
                        },
                    );
                }
                Ok(Err(_)) => {
                    let name = conn.name.clone();
                    return Err(MigrateError::ConnectionClosed(name));
                }
                Err(_) => missing.push(conn.name.clone()),
            }
        }

        if !missing.is_empty() {
            return Err(MigrateError::ConnectTimeout(missing));
        }
        Ok(streams)
    }

    fn close(&self, conn: &MigrationConn) {
        let mut slot = conn.slot.lock().unwrap();
        if slot.state != ConnState::Closed {
            debug!(self.log, "closing migration connection";
                "conn" => &conn.name);
        }
        slot.state = ConnState::Closed;
        slot.tx = None;
        slot.rx = None;
        conn.closed.cancel();
    }

    /// Closes every connection, whatever its state. Safe to call any number
    /// of times.
    pub fn close_all(&self) {
        let conns = self.conns.lock().unwrap().clone();
        for conn in conns.iter() {
            self.close(conn);
        }
    }

    /// Closes everything but the control connection, unblocking any worker
    /// stuck on a content stream.
    pub fn close_content(&self) {
        let conns = self.conns.lock().unwrap().clone();
        for conn in conns.iter().filter(|c| c.name != SECRET_NAME_CONTROL) {
            self.close(conn);
        }
    }
}

/// An authorized incoming connection waiting for its upgraded transport.
/// Dropping it without attaching a stream leaves the entry pending.
pub struct IncomingConn {
    conn: Arc<MigrationConn>,
    tx: Option<oneshot::Sender<MigrateStream>>,
}

impl IncomingConn {
    pub fn name(&self) -> &str {
        &self.conn.name
    }

    /// Completes the websocket handshake on the raw upgraded transport and
    /// hands the stream to the session.
    pub async fn attach(
        self,
        raw: Box<dyn MigrateConn>,
    ) -> Result<(), MigrateError> {
        let ws =
            WebSocketStream::from_raw_socket(raw, Role::Server, None).await;
        self.attach_stream(ws)
    }

    pub fn attach_stream(
        mut self,
        ws: MigrateStream,
    ) -> Result<(), MigrateError> {
        match self.tx.take() {
            Some(tx) => self.conn.hand_over(tx, ws),
            None => Err(MigrateError::AlreadyConnected(self.conn.name.clone())),
        }
    }
}

impl Drop for IncomingConn {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.conn.release(tx);
        }
    }
}

/// An established connection, owned by exactly one task.
pub struct StreamConn {
    name: String,
    ws: MigrateStream,
    closed: CancellationToken,
    bytes: u64,
}

impl StreamConn {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload bytes sent or received so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(crate) fn into_parts(
        self,
    ) -> (String, MigrateStream, CancellationToken) {
        (self.name, self.ws, self.closed)
    }

    pub(crate) async fn send(
        &mut self,
        m: codec::Message,
    ) -> Result<(), MigrateError> {
        if let codec::Message::Blob(b) = &m {
            self.bytes += b.len() as u64;
        }
        let m = tungstenite::Message::try_from(m)?;
        tokio::select! {
            _ = self.closed.cancelled() => {
                Err(MigrateError::ConnectionClosed(self.name.clone()))
            }
            res = self.ws.send(m) => Ok(res?),
        }
    }

    pub(crate) async fn recv(
        &mut self,
    ) -> Result<codec::Message, MigrateError> {
        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => {
                    let name = self.name.clone();
                    return Err(MigrateError::ConnectionClosed(name));
                }
                next = self.ws.next() => next,
            };
            match next {
                Some(Ok(tungstenite::Message::Ping(_)))
                | Some(Ok(tungstenite::Message::Pong(_))) => continue,
                Some(Ok(tungstenite::Message::Close(_))) | None => {
                    let name = self.name.clone();
                    return Err(MigrateError::ConnectionClosed(name));
                }
                Some(Ok(m)) => {
                    let m = codec::Message::try_from(m)?;
                    if let codec::Message::Blob(b) = &m {
                        self.bytes += b.len() as u64;
                    }
                    return Ok(m);
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl VolumeStream for StreamConn {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), StorageError> {
        let m = match frame {
            Frame::Header(h) => codec::Message::Serialized(
                ron::ser::to_string(&h)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?,
            ),
            Frame::Data(d) => codec::Message::Blob(d),
            Frame::EndItem => codec::Message::End,
            Frame::Done => codec::Message::Done,
        };
        self.send(m).await.map_err(|e| StorageError::Stream(e.to_string()))
    }

    async fn recv_frame(&mut self) -> Result<Frame, StorageError> {
        let m = self
            .recv()
            .await
            .map_err(|e| StorageError::Stream(e.to_string()))?;
        match m {
            codec::Message::Serialized(s) => {
                let h: ItemHeader = ron::de::from_str(&s)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Frame::Header(h))
            }
            codec::Message::Blob(d) => Ok(Frame::Data(d)),
            codec::Message::End => Ok(Frame::EndItem),
            codec::Message::Done => Ok(Frame::Done),
            codec::Message::Error(e) => {
                Err(StorageError::Stream(e.to_string()))
            }
            codec::Message::Okay => Err(StorageError::Protocol(
                "status message on a content stream".to_string(),
            )),
        }
    }
}

/// Opens outgoing migration connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connects to the connection `name` of the remote operation, presenting
    /// `secret`.
    async fn dial(
        &self,
        target: &MigrationDialTarget,
        name: &str,
        secret: &str,
    ) -> Result<MigrateStream, MigrateError>;
}

/// Dials plain `ws://` operation URLs.
pub struct WebsocketDialer {
    pub connect_timeout: Duration,
}

impl Default for WebsocketDialer {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(10) }
    }
}

impl WebsocketDialer {
    /// Builds the URL of one connection, rejecting anything that would need
    /// TLS.
    fn connection_url(
        target: &MigrationDialTarget,
        secret: &str,
    ) -> Result<(String, String), MigrateError> {
        let base = target.operation_url.trim_end_matches('/');
        let dial_err = |msg: &str| {
            MigrateError::Dial(base.to_string(), msg.to_string())
        };
        if target.certificate.is_some() {
            return Err(dial_err("TLS connections are not supported"));
        }
        let rest = if let Some(rest) = base.strip_prefix("ws://") {
            rest
        } else if let Some(rest) = base.strip_prefix("http://") {
            rest
        } else {
            return Err(dial_err("only ws:// and http:// URLs are supported"));
        };
        let host = rest.split('/').next().unwrap_or_default();
        if host.is_empty() {
            return Err(dial_err("URL has no host"));
        }
        let url = format!("ws://{rest}/websocket?secret={secret}");
        Ok((host.to_string(), url))
    }
}

#[async_trait]
impl Dialer for WebsocketDialer {
    async fn dial(
        &self,
        target: &MigrationDialTarget,
        _name: &str,
        secret: &str,
    ) -> Result<MigrateStream, MigrateError> {
        let (host, url) = Self::connection_url(target, secret)?;
        let dial_err =
            |e: String| MigrateError::Dial(target.operation_url.clone(), e);

        let tcp = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(host.as_str()),
        )
        .await
        .map_err(|_| dial_err("connect timed out".to_string()))?
        .map_err(|e| dial_err(e.to_string()))?;

        let conn: Box<dyn MigrateConn> = Box::new(tcp);
        let (ws, _resp) = tokio_tungstenite::client_async(url, conn)
            .await
            .map_err(|e| dial_err(e.to_string()))?;
        Ok(ws)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    async fn ws_pair() -> (MigrateStream, MigrateStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let a: Box<dyn MigrateConn> = Box::new(a);
        let b: Box<dyn MigrateConn> = Box::new(b);
        let (a, b) = tokio::join!(
            WebSocketStream::from_raw_socket(a, Role::Client, None),
            WebSocketStream::from_raw_socket(b, Role::Server, None),
        );
        (a, b)
    }

    #[test]
    fn control_is_issued_first() {
        let set =
            ConnectionSet::issued(test_logger(), &["fs", "data"]).unwrap();
        assert_eq!(set.names(), ["control", "fs", "data"]);
        let meta = set.metadata();
        assert_eq!(meta.len(), 3);
        assert!(meta.values().all(|s| s.len() == SECRET_LEN * 2));
        assert_ne!(meta["control"], meta["fs"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let set = ConnectionSet::issued(test_logger(), &["fs"]).unwrap();
        assert_eq!(
            set.issue("fs"),
            Err(MigrateError::DuplicateConnectionName("fs".to_string()))
        );
        assert!(matches!(
            ConnectionSet::issued(test_logger(), &["fs", "fs"]),
            Err(MigrateError::DuplicateConnectionName(_))
        ));
    }

    #[test]
    fn remote_secrets_require_control() {
        let mut secrets = BTreeMap::new();
        secrets.insert("fs".to_string(), "abc".to_string());
        assert!(matches!(
            ConnectionSet::with_secrets(test_logger(), &secrets),
            Err(MigrateError::InvalidRequest(_))
        ));
        secrets.insert("control".to_string(), "def".to_string());
        let set = ConnectionSet::with_secrets(test_logger(), &secrets).unwrap();
        assert_eq!(set.names(), ["control", "fs"]);
    }

    #[test]
    fn missing_secret_is_distinct_from_invalid() {
        let set = ConnectionSet::issued(test_logger(), &[]).unwrap();
        assert!(matches!(
            set.accept_incoming(None),
            Err(MigrateError::MissingSecret)
        ));
        assert!(matches!(
            set.accept_incoming(Some("")),
            Err(MigrateError::MissingSecret)
        ));
        assert!(matches!(
            set.accept_incoming(Some("nope")),
            Err(MigrateError::InvalidSecret)
        ));
        assert_eq!(set.state("control"), Some(ConnState::Pending));
    }

    #[test]
    fn a_secret_authorizes_once() {
        let set = ConnectionSet::issued(test_logger(), &["fs"]).unwrap();
        let secret = set.metadata()["fs"].clone();
        let incoming = set.accept_incoming(Some(&secret)).unwrap();
        assert_eq!(incoming.name(), "fs");
        assert_eq!(set.state("fs"), Some(ConnState::Pending));
        assert!(matches!(
            set.accept_incoming(Some(&secret)),
            Err(MigrateError::AlreadyConnected(_))
        ));
    }

    #[tokio::test]
    async fn established_only_once_the_stream_is_handed_over() {
        let set = ConnectionSet::issued(test_logger(), &["fs"]).unwrap();
        let secret = set.metadata()["fs"].clone();

        // An upgrade that never completes gives the entry back.
        drop(set.accept_incoming(Some(&secret)).unwrap());
        assert_eq!(set.state("fs"), Some(ConnState::Pending));

        let incoming = set.accept_incoming(Some(&secret)).unwrap();
        let (_peer, ws) = ws_pair().await;
        incoming.attach_stream(ws).unwrap();
        assert_eq!(set.state("fs"), Some(ConnState::Established));
        assert!(matches!(
            set.accept_incoming(Some(&secret)),
            Err(MigrateError::AlreadyConnected(_))
        ));
    }

    #[tokio::test]
    async fn abandoned_upgrade_times_out_as_never_connected() {
        let set = ConnectionSet::issued(test_logger(), &["fs"]).unwrap();
        let (_peer, ws) = ws_pair().await;
        set.establish("control", ws).unwrap();
        let secret = set.metadata()["fs"].clone();
        drop(set.accept_incoming(Some(&secret)).unwrap());

        match set.take_all(Duration::from_millis(20)).await {
            Err(MigrateError::ConnectTimeout(names)) => {
                assert_eq!(names, ["fs"]);
            }
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("take_all succeeded with missing connections"),
        }
    }

    #[test]
    fn close_all_is_idempotent() {
        let set = ConnectionSet::issued(test_logger(), &["fs"]).unwrap();
        let secret = set.metadata()["fs"].clone();
        let _incoming = set.accept_incoming(Some(&secret)).unwrap();

        set.close_all();
        set.close_all();
        for name in set.names() {
            assert_eq!(set.state(&name), Some(ConnState::Closed));
        }
        assert!(matches!(
            set.accept_incoming(Some(&set.metadata()["control"])),
            Err(MigrateError::ConnectionClosed(_))
        ));
    }

    #[test]
    fn close_content_spares_control() {
        let set = ConnectionSet::issued(test_logger(), &["fs"]).unwrap();
        set.close_content();
        assert_eq!(set.state("control"), Some(ConnState::Pending));
        assert_eq!(set.state("fs"), Some(ConnState::Closed));
    }

    #[tokio::test]
    async fn take_all_names_the_stragglers() {
        let set =
            ConnectionSet::issued(test_logger(), &["fs", "data"]).unwrap();
        let (_peer, ws) = ws_pair().await;
        set.establish("fs", ws).unwrap();

        match set.take_all(Duration::from_millis(20)).await {
            Err(MigrateError::ConnectTimeout(names)) => {
                assert_eq!(names, ["control", "data"]);
            }
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("take_all succeeded with missing connections"),
        }
    }

    #[tokio::test]
    async fn take_all_is_unblocked_by_close() {
        let set = ConnectionSet::issued(test_logger(), &[]).unwrap();
        let closer = set.clone();
        let close = async {
            tokio::task::yield_now().await;
            closer.close_all();
        };
        let (res, _) =
            tokio::join!(set.take_all(Duration::from_secs(60)), close);
        assert!(matches!(res, Err(MigrateError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn item_frames_cross_a_websocket() {
        let set = ConnectionSet::issued(test_logger(), &["fs"]).unwrap();
        let (a, b) = ws_pair().await;
        set.establish("control", a).unwrap();
        set.establish("fs", b).unwrap();
        let mut streams = set.take_all(Duration::from_secs(1)).await.unwrap();
        let mut tx = streams.remove("control").unwrap();
        let mut rx = streams.remove("fs").unwrap();

        tx.send_frame(Frame::Header(ItemHeader::Volume)).await.unwrap();
        tx.send_frame(Frame::Data(vec![7; 10])).await.unwrap();
        tx.send_frame(Frame::EndItem).await.unwrap();

        assert_eq!(
            rx.recv_frame().await.unwrap(),
            Frame::Header(ItemHeader::Volume)
        );
        assert_eq!(rx.recv_frame().await.unwrap(), Frame::Data(vec![7; 10]));
        assert_eq!(rx.recv_frame().await.unwrap(), Frame::EndItem);
        assert_eq!(tx.bytes(), 10);
        assert_eq!(rx.bytes(), 10);
    }

    #[test]
    fn tls_targets_are_refused() {
        let mut target = MigrationDialTarget {
            operation_url: "https://peer:8443/1.0/operations/x".to_string(),
            certificate: None,
            secrets: BTreeMap::new(),
        };
        assert!(matches!(
            WebsocketDialer::connection_url(&target, "s"),
            Err(MigrateError::Dial(_, _))
        ));

        target.operation_url = "ws://peer:8443/1.0/operations/x/".to_string();
        let (host, url) =
            WebsocketDialer::connection_url(&target, "s").unwrap();
        assert_eq!(host, "peer:8443");
        assert_eq!(url, "ws://peer:8443/1.0/operations/x/websocket?secret=s");

        target.certificate = Some("PEM".to_string());
        assert!(WebsocketDialer::connection_url(&target, "s").is_err());
    }

    proptest! {
        #[test]
        fn only_the_exact_secret_authorizes(
            other in "[0-9a-f]{0,70}",
            cut in 1usize..64,
        ) {
            let set = ConnectionSet::issued(test_logger(), &["fs"]).unwrap();
            let secret = set.metadata()["fs"].clone();

            let prefix = &secret[..secret.len() - cut];
            let suffixed = format!("{secret}{other}");
            for candidate in [prefix, suffixed.as_str(), other.as_str()] {
                if candidate == secret || candidate.is_empty() {
                    continue;
                }
                prop_assert!(matches!(
                    set.accept_incoming(Some(candidate)),
                    Err(MigrateError::InvalidSecret)
                ));
            }
            prop_assert_eq!(set.state("fs"), Some(ConnState::Pending));
            prop_assert!(set.accept_incoming(Some(&secret)).is_ok());
        }
    }
}
