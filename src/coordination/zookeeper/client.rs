//! ZooKeeper Client
//!
//! One TCP connection at a time per session. A background task owns the
//! socket, the table of in-flight requests and the client-side watch
//! registry; callers talk to it through a channel and wait on a oneshot for
//! their reply. When the socket drops, the task reattaches the same session
//! to the next server for as long as the negotiated timeout allows.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::proto::{
    self, ConnectRequest, ConnectResponse, OpCode, ReplyHeader, Request, WatcherEvent, NO_NODE,
    PING_XID, SET_WATCHES_XID, WATCHER_EVENT_XID,
};
use super::DEFAULT_PORT;
use crate::coordination::{
    register_watcher, Acl, Connector, Coordinator, CreateMode, EventType, SessionState, Stat,
    WatchedEvent, Watcher,
};
use crate::error::{Error, Result};

type Transport = Framed<TcpStream, LengthDelimitedCodec>;

/// Pause between full passes over the server list while reconnecting
const RECONNECT_PAUSE: Duration = Duration::from_millis(100);

/// Reply payloads handed back to callers
#[derive(Debug)]
enum Response {
    Path(String),
    Stat(Option<Stat>),
    Children(Vec<String>),
    Empty,
}

/// A request queued for the connection task
struct Outgoing {
    request: Request,
    watch: Option<Watcher>,
    reply: oneshot::Sender<Result<Response>>,
}

/// A request written to the socket and awaiting its reply
struct Pending {
    op: OpCode,
    path: String,
    watch: Option<Watcher>,
    reply: oneshot::Sender<Result<Response>>,
}

/// Watches the server will notify us about, keyed by path
#[derive(Default)]
struct WatchRegistry {
    data: HashMap<String, Vec<Watcher>>,
    exist: HashMap<String, Vec<Watcher>>,
    child: HashMap<String, Vec<Watcher>>,
}

impl WatchRegistry {
    fn add(table: &mut HashMap<String, Vec<Watcher>>, path: &str, watcher: Watcher) {
        register_watcher(table.entry(path.to_string()).or_default(), watcher);
    }

    fn paths(table: &HashMap<String, Vec<Watcher>>) -> Vec<String> {
        let mut paths: Vec<String> = table.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty() && self.exist.is_empty() && self.child.is_empty()
    }

    /// Remove and return every watcher an event on `path` triggers
    fn materialize(&mut self, event_type: EventType, path: &str) -> Vec<Watcher> {
        let mut triggered = Vec::new();
        let mut take = |table: &mut HashMap<String, Vec<Watcher>>| {
            for watcher in table.remove(path).unwrap_or_default() {
                register_watcher(&mut triggered, watcher);
            }
        };

        match event_type {
            EventType::NodeCreated | EventType::NodeDataChanged => {
                take(&mut self.data);
                take(&mut self.exist);
            }
            EventType::NodeChildrenChanged => take(&mut self.child),
            EventType::NodeDeleted => {
                take(&mut self.data);
                take(&mut self.exist);
                take(&mut self.child);
            }
            EventType::None => {}
        }

        triggered
    }
}

/// Open a socket to `address` and exchange the handshake, all before `deadline`
async fn handshake(
    address: &str,
    request: &ConnectRequest,
    deadline: Instant,
) -> Result<(Transport, ConnectResponse)> {
    let stream = match timeout_at(deadline, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            stream
        }
        Ok(Err(e)) => {
            return Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
    };

    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let mut buf = BytesMut::new();
    request.encode(&mut buf);
    framed.send(buf.freeze()).await?;

    let frame = match timeout_at(deadline, framed.next()).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(e))) => return Err(e.into()),
        Ok(None) => return Err(Error::ConnectionLost(address.to_string())),
        Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
    };
    let response = ConnectResponse::decode(&mut frame.freeze())?;
    Ok((framed, response))
}

fn timeout_ms(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX)
}

/// Background task driving one session
struct Connection {
    servers: Vec<String>,
    current: usize,
    framed: Transport,
    requests: mpsc::UnboundedReceiver<Outgoing>,
    default_watcher: Watcher,
    pending: HashMap<i32, Pending>,
    watches: WatchRegistry,
    next_xid: i32,
    session_id: i64,
    passwd: Vec<u8>,
    requested_timeout: Duration,
    negotiated_timeout: Duration,
    last_zxid: i64,
    ended: Arc<OnceLock<SessionState>>,
}

impl Connection {
    fn address(&self) -> &str {
        &self.servers[self.current]
    }

    async fn run(mut self) {
        let end = loop {
            let lost = match self.serve().await {
                Ok(true) => {
                    tracing::debug!("Session 0x{:x} closed", self.session_id);
                    break SessionState::Closed;
                }
                // Every client handle is gone; the server expires us
                Ok(false) => break SessionState::Closed,
                Err(e) => e,
            };

            tracing::warn!("Connection to {} lost: {}", self.address(), lost);
            let address = self.address().to_string();
            self.fail_pending(|| Error::ConnectionLost(address.clone()));
            self.default_watcher
                .notify(WatchedEvent::session(SessionState::Disconnected));

            match self.reconnect().await {
                Ok(state) => {
                    self.default_watcher.notify(WatchedEvent::session(state));
                }
                Err(Error::AuthFailed) => break SessionState::AuthFailed,
                Err(e) => {
                    tracing::error!("Session 0x{:x} could not be resumed: {}", self.session_id, e);
                    break SessionState::Expired;
                }
            }
        };

        let _ = self.ended.set(end);
        self.fail_pending(|| session_error(end));
        self.requests.close();
        while let Ok(outgoing) = self.requests.try_recv() {
            let _ = outgoing.reply.send(Err(session_error(end)));
        }

        self.default_watcher.notify(WatchedEvent::session(end));
    }

    /// Drive the current socket; Ok(true) once the session is closed,
    /// Ok(false) when no client handle is left
    async fn serve(&mut self) -> Result<bool> {
        let mut ping = tokio::time::interval((self.negotiated_timeout / 3).max(Duration::from_millis(10)));
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;

        // Silence for two thirds of the timeout means the server is gone
        let read_timeout = self.negotiated_timeout * 2 / 3;
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                outgoing = self.requests.recv() => match outgoing {
                    Some(outgoing) => self.send(outgoing).await?,
                    None => return Ok(false),
                },
                frame = self.framed.next() => match frame {
                    Some(Ok(frame)) => {
                        last_heard = Instant::now();
                        if self.handle_frame(frame.freeze())? {
                            return Ok(true);
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(Error::ConnectionLost(self.address().to_string())),
                },
                _ = ping.tick() => {
                    if last_heard.elapsed() > read_timeout {
                        return Err(Error::ConnectionTimeout(self.address().to_string()));
                    }
                    self.send_ping().await?;
                }
            }
        }
    }

    /// Reattach the session to the next reachable server within the timeout
    async fn reconnect(&mut self) -> Result<SessionState> {
        let deadline = Instant::now() + self.negotiated_timeout;

        loop {
            for _ in 0..self.servers.len() {
                if Instant::now() >= deadline {
                    return Err(Error::SessionExpired);
                }
                self.current = (self.current + 1) % self.servers.len();
                let address = self.address().to_string();
                let request = ConnectRequest::resume(
                    timeout_ms(self.requested_timeout),
                    self.session_id,
                    &self.passwd,
                    self.last_zxid,
                );

                let (framed, response) = match handshake(&address, &request, deadline).await {
                    Ok(attached) => attached,
                    Err(e) => {
                        tracing::debug!("Reconnect to {} failed: {}", address, e);
                        continue;
                    }
                };
                if response.timeout_ms <= 0 {
                    return Err(Error::SessionExpired);
                }

                self.framed = framed;
                self.negotiated_timeout = Duration::from_millis(response.timeout_ms as u64);
                if let Err(e) = self.restore_watches().await {
                    tracing::debug!("Restoring watches on {} failed: {}", address, e);
                    continue;
                }

                tracing::info!("Session 0x{:x} resumed on {}", self.session_id, address);
                return Ok(if response.read_only {
                    SessionState::ConnectedReadOnly
                } else {
                    SessionState::SyncConnected
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(remaining.min(RECONNECT_PAUSE)).await;
        }
    }

    /// Tell a new server which watches this session still holds
    async fn restore_watches(&mut self) -> Result<()> {
        if self.watches.is_empty() {
            return Ok(());
        }
        let request = Request::SetWatches {
            relative_zxid: self.last_zxid,
            data: WatchRegistry::paths(&self.watches.data),
            exist: WatchRegistry::paths(&self.watches.exist),
            child: WatchRegistry::paths(&self.watches.child),
        };
        let mut buf = BytesMut::new();
        request.encode(SET_WATCHES_XID, &mut buf);
        self.framed.send(buf.freeze()).await?;
        Ok(())
    }

    fn fail_pending(&mut self, error: impl Fn() -> Error) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(error()));
        }
    }

    fn next_xid(&mut self) -> i32 {
        let xid = self.next_xid;
        // Negative xids are reserved for notifications and pings
        self.next_xid = self.next_xid.checked_add(1).unwrap_or(1);
        xid
    }

    async fn send(&mut self, outgoing: Outgoing) -> Result<()> {
        let xid = self.next_xid();
        let mut buf = BytesMut::new();
        outgoing.request.encode(xid, &mut buf);

        self.pending.insert(
            xid,
            Pending {
                op: outgoing.request.op_code(),
                path: outgoing.request.path().to_string(),
                watch: outgoing.watch,
                reply: outgoing.reply,
            },
        );

        tracing::trace!(
            "Sending {:?} xid={} path={}",
            outgoing.request.op_code(),
            xid,
            outgoing.request.path()
        );
        self.framed.send(buf.freeze()).await?;
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<()> {
        let mut buf = BytesMut::new();
        Request::Ping.encode(PING_XID, &mut buf);
        self.framed.send(buf.freeze()).await?;
        Ok(())
    }

    /// Handle one reply frame; returns true once the session is closed
    fn handle_frame(&mut self, mut frame: Bytes) -> Result<bool> {
        let header = ReplyHeader::decode(&mut frame)?;
        if header.zxid > 0 {
            self.last_zxid = header.zxid;
        }

        match header.xid {
            WATCHER_EVENT_XID => {
                let event = WatcherEvent::decode(&mut frame)?;
                self.dispatch(event);
                Ok(false)
            }
            PING_XID => {
                tracing::trace!("Ping reply from {}", self.address());
                Ok(false)
            }
            SET_WATCHES_XID => {
                if header.err != 0 {
                    tracing::warn!("{} refused watch restore: error {}", self.address(), header.err);
                }
                Ok(false)
            }
            xid => {
                let Some(pending) = self.pending.remove(&xid) else {
                    tracing::warn!("Reply for unknown xid {} from {}", xid, self.address());
                    return Ok(false);
                };
                let Pending {
                    op,
                    path,
                    watch,
                    reply,
                } = pending;

                let result = self.complete(op, &path, watch, header.err, &mut frame);
                let _ = reply.send(result);
                Ok(op == OpCode::CloseSession && header.err == 0)
            }
        }
    }

    /// Decode a reply body and register any watch the request asked for
    fn complete(
        &mut self,
        op: OpCode,
        path: &str,
        watch: Option<Watcher>,
        err: i32,
        frame: &mut Bytes,
    ) -> Result<Response> {
        match (op, err) {
            (OpCode::Exists, 0) => {
                let stat = proto::decode_stat(frame)?;
                if let Some(watcher) = watch {
                    WatchRegistry::add(&mut self.watches.data, path, watcher);
                }
                Ok(Response::Stat(Some(stat)))
            }
            (OpCode::Exists, NO_NODE) => {
                if let Some(watcher) = watch {
                    WatchRegistry::add(&mut self.watches.exist, path, watcher);
                }
                Ok(Response::Stat(None))
            }
            (OpCode::Create, 0) => {
                let created = proto::get_string(frame)?.unwrap_or_default();
                Ok(Response::Path(created))
            }
            (OpCode::GetChildren, 0) => {
                let children = proto::get_string_vec(frame)?;
                if let Some(watcher) = watch {
                    WatchRegistry::add(&mut self.watches.child, path, watcher);
                }
                Ok(Response::Children(children))
            }
            (OpCode::SetData, 0) => Ok(Response::Stat(Some(proto::decode_stat(frame)?))),
            (OpCode::Delete | OpCode::CloseSession, 0) => Ok(Response::Empty),
            (_, code) => Err(Error::from_code(code, path)),
        }
    }

    fn dispatch(&mut self, event: WatcherEvent) {
        if event.event_type == EventType::None {
            tracing::debug!("Session state {} from {}", event.state, self.address());
            self.default_watcher.notify(WatchedEvent::session(event.state));
            return;
        }

        for watcher in self.watches.materialize(event.event_type, &event.path) {
            watcher.notify(WatchedEvent {
                event_type: event.event_type,
                state: event.state,
                path: Some(event.path.clone()),
            });
        }
    }
}

/// Error handed to callers once the session has ended in `state`
fn session_error(state: SessionState) -> Error {
    match state {
        SessionState::Expired => Error::SessionExpired,
        SessionState::AuthFailed => Error::AuthFailed,
        _ => Error::SessionClosed,
    }
}

/// A live ZooKeeper session
#[derive(Debug, Clone)]
pub struct ZkClient {
    session_id: i64,
    requests: mpsc::UnboundedSender<Outgoing>,
    ended: Arc<OnceLock<SessionState>>,
}

impl ZkClient {
    /// Establish a new session on the first server in `servers` that accepts
    /// one. The others are kept for reconnecting.
    pub async fn connect(servers: &[String], session_timeout: Duration, watcher: Watcher) -> Result<Self> {
        let request = ConnectRequest::new(timeout_ms(session_timeout));
        let mut last_error = None;

        for (current, address) in servers.iter().enumerate() {
            let deadline = Instant::now() + session_timeout;
            let (framed, response) = match handshake(address, &request, deadline).await {
                Ok(attached) => attached,
                Err(e) => {
                    tracing::warn!("Could not open session with {}: {}", address, e);
                    last_error = Some(e);
                    continue;
                }
            };
            if response.timeout_ms <= 0 {
                return Err(Error::SessionExpired);
            }

            let negotiated_timeout = Duration::from_millis(response.timeout_ms as u64);
            tracing::info!(
                "Session 0x{:x} established with {} (timeout {:?})",
                response.session_id,
                address,
                negotiated_timeout
            );

            let (tx, rx) = mpsc::unbounded_channel();
            let ended = Arc::new(OnceLock::new());
            let connection = Connection {
                servers: servers.to_vec(),
                current,
                framed,
                requests: rx,
                default_watcher: watcher.clone(),
                pending: HashMap::new(),
                watches: WatchRegistry::default(),
                next_xid: 1,
                session_id: response.session_id,
                passwd: response.passwd.clone(),
                requested_timeout: session_timeout,
                negotiated_timeout,
                last_zxid: 0,
                ended: ended.clone(),
            };
            let state = if response.read_only {
                SessionState::ConnectedReadOnly
            } else {
                SessionState::SyncConnected
            };
            watcher.notify(WatchedEvent::session(state));
            tokio::spawn(connection.run());

            return Ok(Self {
                session_id: response.session_id,
                requests: tx,
                ended,
            });
        }

        Err(last_error
            .unwrap_or_else(|| Error::Config("no coordination servers configured".into())))
    }

    /// Error for a request that can no longer reach the connection task
    fn gone(&self) -> Error {
        session_error(self.ended.get().copied().unwrap_or(SessionState::Closed))
    }

    async fn submit(&self, request: Request, watch: Option<Watcher>) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Outgoing {
                request,
                watch,
                reply,
            })
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    fn unexpected(&self, op: &str, response: Response) -> Error {
        Error::Protocol(format!("unexpected reply to {}: {:?}", op, response))
    }
}

#[async_trait]
impl Coordinator for ZkClient {
    fn session_id(&self) -> i64 {
        self.session_id
    }

    async fn create(&self, path: &str, data: &[u8], acl: &[Acl], mode: CreateMode) -> Result<String> {
        let request = Request::Create {
            path: path.to_string(),
            data: data.to_vec(),
            acl: acl.to_vec(),
            mode,
        };
        match self.submit(request, None).await? {
            Response::Path(created) => Ok(created),
            other => Err(self.unexpected("create", other)),
        }
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        let request = Request::Delete {
            path: path.to_string(),
            version,
        };
        match self.submit(request, None).await? {
            Response::Empty => Ok(()),
            other => Err(self.unexpected("delete", other)),
        }
    }

    async fn exists(&self, path: &str, watch: Option<Watcher>) -> Result<Option<Stat>> {
        let request = Request::Exists {
            path: path.to_string(),
            watch: watch.is_some(),
        };
        match self.submit(request, watch).await? {
            Response::Stat(stat) => Ok(stat),
            other => Err(self.unexpected("exists", other)),
        }
    }

    async fn get_children(&self, path: &str, watch: Option<Watcher>) -> Result<Vec<String>> {
        let request = Request::GetChildren {
            path: path.to_string(),
            watch: watch.is_some(),
        };
        match self.submit(request, watch).await? {
            Response::Children(children) => Ok(children),
            other => Err(self.unexpected("getChildren", other)),
        }
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<Stat> {
        let request = Request::SetData {
            path: path.to_string(),
            data: data.to_vec(),
            version,
        };
        match self.submit(request, None).await? {
            Response::Stat(Some(stat)) => Ok(stat),
            other => Err(self.unexpected("setData", other)),
        }
    }

    async fn close(&self) -> Result<()> {
        match self.submit(Request::CloseSession, None).await? {
            Response::Empty => Ok(()),
            other => Err(self.unexpected("closeSession", other)),
        }
    }
}

/// Opens ZooKeeper sessions against a list of servers
#[derive(Debug, Clone)]
pub struct ZkConnector {
    addresses: Vec<String>,
}

impl ZkConnector {
    /// Parse a comma separated `host[:port]` list
    pub fn new(address: &str) -> Self {
        let addresses = address
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(|a| {
                if a.rsplit_once(':').map_or(false, |(_, port)| port.parse::<u16>().is_ok()) {
                    a.to_string()
                } else {
                    format!("{}:{}", a, DEFAULT_PORT)
                }
            })
            .collect();
        Self { addresses }
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }
}

#[async_trait]
impl Connector for ZkConnector {
    type Session = ZkClient;

    fn address(&self) -> String {
        self.addresses.join(",")
    }

    /// Try each server in order until one accepts a session
    async fn connect(&self, timeout: Duration, watcher: Watcher) -> Result<ZkClient> {
        ZkClient::connect(&self.addresses, timeout, watcher).await
    }
}
