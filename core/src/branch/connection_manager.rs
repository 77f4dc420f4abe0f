//! Peer bookkeeping: discovery, connection establishment and the branch
//! event stream.
//!
//! For every remote UUID there is at most one live connection. Discovery
//! starts an outgoing connect only towards UUIDs strictly greater than our
//! own; lower peers connect to us through the listener, so exactly one
//! direction survives when both sides see each other. Failed or lost peers
//! drop back to undiscovered and the next advertisement retries them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::ops::BitOr;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::net::TcpStream;
use uuid::Uuid;
use yogi_logger::{debug, info as log_info};

use crate::branch::advertising::{AdvertisingReceiver, AdvertisingSender};
use crate::branch::connection::{
    make_password_hash, BranchConnection, BranchConnectionPtr, MessageReceiveFn,
};
use crate::branch::info::LocalBranchInfoPtr;
use crate::constants;
use crate::context::ContextPtr;
use crate::errors::{Error, ErrorKind, Result};
use crate::network::listener::TcpListenerSet;
use crate::network::tcp::make_tcp_transport;

const LOG: &str = "yogi.branch";

// Queued events beyond this are dropped oldest-first.
const MAX_QUEUED_EVENTS: usize = 1024;

/// Bitmask of branch events.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BranchEvents(u32);

impl BranchEvents {
    pub const NONE: BranchEvents = BranchEvents(0);
    pub const BRANCH_DISCOVERED: BranchEvents = BranchEvents(1 << 0);
    pub const BRANCH_QUERIED: BranchEvents = BranchEvents(1 << 1);
    pub const CONNECT_FINISHED: BranchEvents = BranchEvents(1 << 2);
    pub const CONNECTION_LOST: BranchEvents = BranchEvents(1 << 3);
    pub const ALL: BranchEvents = BranchEvents((1 << 4) - 1);

    pub fn intersects(self, other: BranchEvents) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for BranchEvents {
    type Output = BranchEvents;

    fn bitor(self, rhs: BranchEvents) -> BranchEvents {
        BranchEvents(self.0 | rhs.0)
    }
}

/// One delivered branch event.
#[derive(Debug, Clone)]
pub struct BranchEventInfo {
    pub event: BranchEvents,
    pub uuid: Uuid,
    pub json: Value,
    /// Outcome the event reports (e.g. why a connect finished).
    pub result: Result<()>,
}

pub type BranchEventHandler = Box<dyn FnOnce(Result<()>, Option<BranchEventInfo>) + Send + 'static>;

/// Strictly positive identifier of a cancelable broadcast operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct OperationId(pub(crate) u32);

impl OperationId {
    pub fn value(self) -> u32 {
        self.0
    }
}

struct CmState {
    /// UUIDs for which a discovery event has been emitted and that have not
    /// been lost since.
    discovered: HashSet<Uuid>,
    /// Outgoing connects/handshakes in flight.
    connecting: HashSet<Uuid>,
    /// Authenticated sessions.
    sessions: HashMap<Uuid, BranchConnectionPtr>,
    event_handler: Option<(BranchEvents, BranchEventHandler)>,
    event_queue: VecDeque<BranchEventInfo>,
    next_op_id: u32,
}

/// The per-branch peer state machine.
pub struct ConnectionManager {
    weak_self: std::sync::Weak<ConnectionManager>,
    context: ContextPtr,
    listener: TcpListenerSet,
    adv_sender: AdvertisingSender,
    adv_receiver: AdvertisingReceiver,
    password_hash: Vec<u8>,
    local_info: Mutex<Option<LocalBranchInfoPtr>>,
    message_fn: Mutex<Option<MessageReceiveFn>>,
    state: Mutex<CmState>,
}

pub type ConnectionManagerPtr = Arc<ConnectionManager>;

impl ConnectionManager {
    pub fn new(context: ContextPtr, cfg: &Value) -> Result<ConnectionManagerPtr> {
        let address = cfg
            .get("advertising_address")
            .and_then(Value::as_str)
            .unwrap_or(constants::DEFAULT_ADV_ADDRESS);
        let address: std::net::IpAddr = address.parse().map_err(|_| {
            Error::with_details(
                ErrorKind::ConfigNotValid,
                format!("Invalid advertising address \"{address}\""),
            )
        })?;

        let port = cfg
            .get("advertising_port")
            .and_then(Value::as_u64)
            .unwrap_or(u64::from(constants::DEFAULT_ADV_PORT)) as u16;
        let adv_endpoint = SocketAddr::new(address, port);

        let interfaces: Vec<String> = match cfg.get("advertising_interfaces") {
            Some(Value::Array(entries)) => entries
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => constants::DEFAULT_ADV_INTERFACES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };

        let password = cfg
            .get("network_password")
            .or_else(|| cfg.get("password"))
            .and_then(Value::as_str)
            .unwrap_or("");

        let listener =
            TcpListenerSet::new(Arc::clone(&context), &interfaces, address.is_ipv6(), 0)?;
        let adv_sender = AdvertisingSender::new(Arc::clone(&context), adv_endpoint);
        let adv_receiver = AdvertisingReceiver::new(Arc::clone(&context), adv_endpoint)?;

        Ok(Arc::new_cyclic(|weak_self| ConnectionManager {
            weak_self: weak_self.clone(),
            context,
            listener,
            adv_sender,
            adv_receiver,
            password_hash: make_password_hash(password),
            local_info: Mutex::new(None),
            message_fn: Mutex::new(None),
            state: Mutex::new(CmState {
                discovered: HashSet::new(),
                connecting: HashSet::new(),
                sessions: HashMap::new(),
                event_handler: None,
                event_queue: VecDeque::new(),
                next_op_id: 0,
            }),
        }))
    }

    pub fn tcp_server_port(&self) -> u16 {
        self.listener.port()
    }

    /// Starts discovery and session establishment.
    pub fn start(&self, info: LocalBranchInfoPtr, message_fn: MessageReceiveFn) -> Result<()> {
        *self.local_info.lock().expect("Mutex poisoned") = Some(Arc::clone(&info));
        *self.message_fn.lock().expect("Mutex poisoned") = Some(message_fn);

        let ghost_mode = info.info.ghost_mode;

        let weak = self.weak_self.clone();
        self.listener.start(Arc::new(move |stream, addr| {
            if let Some(manager) = weak.upgrade() {
                if ghost_mode {
                    return;
                }
                manager.on_accept(stream, addr);
            }
        }));

        let weak = self.weak_self.clone();
        self.adv_receiver.start(
            Arc::clone(&info),
            Arc::new(move |uuid, endpoint| {
                if let Some(manager) = weak.upgrade() {
                    manager.on_advertisement(uuid, endpoint);
                }
            }),
        )?;

        self.adv_sender.start(info)?;
        Ok(())
    }

    fn local_info(&self) -> LocalBranchInfoPtr {
        self.local_info
            .lock()
            .expect("Mutex poisoned")
            .clone()
            .expect("connection manager not started")
    }

    fn on_advertisement(&self, uuid: Uuid, endpoint: SocketAddr) {
        let local_info = self.local_info();

        let mut state = self.state.lock().expect("Mutex poisoned");

        if state.discovered.insert(uuid) {
            self.emit_event(
                &mut state,
                BranchEventInfo {
                    event: BranchEvents::BRANCH_DISCOVERED,
                    uuid,
                    json: json!({
                        "uuid": uuid.to_string(),
                        "tcp_server_address": endpoint.ip().to_string(),
                        "tcp_server_port": endpoint.port(),
                    }),
                    result: Ok(()),
                },
            );
        }

        if local_info.info.ghost_mode {
            return;
        }

        // Tie-break: only connect out to strictly greater UUIDs; lower peers
        // connect to us through the listener.
        if uuid <= local_info.uuid()
            || state.connecting.contains(&uuid)
            || state.sessions.contains_key(&uuid)
        {
            return;
        }

        state.connecting.insert(uuid);
        drop(state);

        debug!(target: LOG, "Connecting to {uuid} at {endpoint}");

        let manager = self.weak_self.upgrade().expect("self is alive");
        let timeout = local_info.info.timeout;
        let limit = local_info.transceive_byte_limit;
        self.context.spawn(async move {
            let connect = async {
                match timeout.to_std() {
                    None => TcpStream::connect(endpoint).await.map_err(|e| {
                        Error::with_details(ErrorKind::ConnectSocketFailed, e.to_string())
                    }),
                    Some(dur) => match tokio::time::timeout(dur, TcpStream::connect(endpoint)).await
                    {
                        Ok(Ok(stream)) => Ok(stream),
                        Ok(Err(e)) => Err(Error::with_details(
                            ErrorKind::ConnectSocketFailed,
                            e.to_string(),
                        )),
                        Err(_) => Err(Error::new(ErrorKind::Timeout)),
                    },
                }
            };

            match connect.await {
                Ok(stream) => {
                    let transport = make_tcp_transport(
                        Arc::clone(&manager.context),
                        stream,
                        timeout,
                        limit,
                        false,
                    );
                    let conn =
                        BranchConnection::new(transport, endpoint.ip(), manager.local_info());
                    manager.handshake(conn, Some(uuid)).await;
                }
                Err(err) => {
                    manager.on_connect_failed(Some(uuid), err);
                }
            }
        });
    }

    fn on_accept(&self, stream: TcpStream, addr: SocketAddr) {
        let local_info = self.local_info();
        let transport = make_tcp_transport(
            Arc::clone(&self.context),
            stream,
            local_info.info.timeout,
            local_info.transceive_byte_limit,
            true,
        );
        let conn = BranchConnection::new(transport, addr.ip(), local_info);

        let manager = self.weak_self.upgrade().expect("self is alive");
        self.context.spawn(async move {
            manager.handshake(conn, None).await;
        });
    }

    /// Runs the full handshake on `conn` and starts the session on success.
    async fn handshake(&self, conn: BranchConnectionPtr, expected_uuid: Option<Uuid>) {
        match self.handshake_impl(&conn, expected_uuid).await {
            Ok(uuid) => {
                log_info!(target: LOG, "Connection to branch {uuid} established");
                let mut state = self.state.lock().expect("Mutex poisoned");
                self.emit_event(
                    &mut state,
                    BranchEventInfo {
                        event: BranchEvents::CONNECT_FINISHED,
                        uuid,
                        json: json!({ "uuid": uuid.to_string() }),
                        result: Ok(()),
                    },
                );
            }
            Err((uuid, err)) => {
                conn.close();
                self.on_connect_failed(uuid.or(expected_uuid), err);
            }
        }
    }

    async fn handshake_impl(
        &self,
        conn: &BranchConnectionPtr,
        expected_uuid: Option<Uuid>,
    ) -> std::result::Result<Uuid, (Option<Uuid>, Error)> {
        conn.exchange_branch_info()
            .await
            .map_err(|err| (None, err))?;

        let remote = conn.remote_info().expect("info exchange succeeded");
        let uuid = remote.uuid();

        if let Some(expected) = expected_uuid {
            if expected != uuid {
                return Err((
                    Some(expected),
                    Error::with_details(
                        ErrorKind::DeserializeMsgFailed,
                        "Info message UUID does not match the advertisement",
                    ),
                ));
            }
        }

        {
            let mut state = self.state.lock().expect("Mutex poisoned");
            self.emit_event(
                &mut state,
                BranchEventInfo {
                    event: BranchEvents::BRANCH_QUERIED,
                    uuid,
                    json: remote.to_json(),
                    result: Ok(()),
                },
            );
        }

        conn.authenticate(&self.password_hash)
            .await
            .map_err(|err| (Some(uuid), err))?;

        self.validate_and_start_session(conn, uuid)
            .map_err(|err| (Some(uuid), err))?;

        Ok(uuid)
    }

    fn validate_and_start_session(
        &self,
        conn: &BranchConnectionPtr,
        uuid: Uuid,
    ) -> Result<()> {
        let local_info = self.local_info();
        let remote = conn.remote_info().expect("info exchange succeeded");

        let mut state = self.state.lock().expect("Mutex poisoned");

        if remote.info.network_name != local_info.info.network_name {
            return Err(Error::new(ErrorKind::NetNameMismatch));
        }

        // Loser of a concurrent handshake race on the same UUID.
        if state.sessions.contains_key(&uuid) {
            return Err(Error::new(ErrorKind::LoopbackConnection));
        }

        let name_collision = remote.info.name == local_info.info.name
            || state.sessions.values().any(|session| {
                session
                    .remote_info()
                    .is_some_and(|info| info.info.name == remote.info.name)
            });
        if name_collision {
            return Err(Error::new(ErrorKind::DuplicateBranchName));
        }

        let path_collision = remote.info.path == local_info.info.path
            || state.sessions.values().any(|session| {
                session
                    .remote_info()
                    .is_some_and(|info| info.info.path == remote.info.path)
            });
        if path_collision {
            return Err(Error::new(ErrorKind::DuplicateBranchPath));
        }

        let message_fn = self
            .message_fn
            .lock()
            .expect("Mutex poisoned")
            .clone()
            .expect("connection manager not started");

        let manager = self.weak_self.clone();
        conn.run_session(
            message_fn,
            Box::new(move |err| {
                if let Some(manager) = manager.upgrade() {
                    manager.on_connection_lost(uuid, err);
                }
            }),
        )?;

        state.connecting.remove(&uuid);
        state.sessions.insert(uuid, Arc::clone(conn));
        Ok(())
    }

    fn on_connect_failed(&self, uuid: Option<Uuid>, err: Error) {
        debug!(target: LOG, "Connecting to branch failed: {err}");

        let mut state = self.state.lock().expect("Mutex poisoned");

        if let Some(uuid) = uuid {
            state.connecting.remove(&uuid);
            // The next advertisement retries the peer.
            state.discovered.remove(&uuid);

            self.emit_event(
                &mut state,
                BranchEventInfo {
                    event: BranchEvents::CONNECT_FINISHED,
                    uuid,
                    json: json!({ "uuid": uuid.to_string() }),
                    result: Err(err),
                },
            );
        }
    }

    fn on_connection_lost(&self, uuid: Uuid, err: Error) {
        log_info!(target: LOG, "Connection to branch {uuid} lost: {err}");

        let mut state = self.state.lock().expect("Mutex poisoned");
        state.sessions.remove(&uuid);
        state.discovered.remove(&uuid);

        self.emit_event(
            &mut state,
            BranchEventInfo {
                event: BranchEvents::CONNECTION_LOST,
                uuid,
                json: json!({ "uuid": uuid.to_string() }),
                result: Err(err),
            },
        );
    }

    /// Awaits the next event matching `events`.
    ///
    /// At most one await may be outstanding; a new one supersedes the old,
    /// whose handler fires `Canceled`.
    pub fn await_event_async(&self, events: BranchEvents, handler: BranchEventHandler) {
        let mut state = self.state.lock().expect("Mutex poisoned");

        if let Some((_, old)) = state.event_handler.take() {
            self.context
                .post(move || old(Err(Error::new(ErrorKind::Canceled)), None));
        }

        if let Some(pos) = state
            .event_queue
            .iter()
            .position(|event| events.intersects(event.event))
        {
            let event = state.event_queue.remove(pos).expect("position is valid");
            self.context.post(move || handler(Ok(()), Some(event)));
        } else {
            state.event_handler = Some((events, handler));
        }
    }

    /// Cancels an outstanding event await.
    pub fn cancel_await_event(&self) -> Result<()> {
        let mut state = self.state.lock().expect("Mutex poisoned");

        match state.event_handler.take() {
            Some((_, handler)) => {
                self.context
                    .post(move || handler(Err(Error::new(ErrorKind::Canceled)), None));
                Ok(())
            }
            None => Err(Error::new(ErrorKind::OperationNotRunning)),
        }
    }

    fn emit_event(&self, state: &mut CmState, event: BranchEventInfo) {
        let matches = state
            .event_handler
            .as_ref()
            .is_some_and(|(mask, _)| mask.intersects(event.event));

        if matches {
            let (_, handler) = state.event_handler.take().expect("checked above");
            self.context.post(move || handler(Ok(()), Some(event)));
        } else {
            if state.event_queue.len() >= MAX_QUEUED_EVENTS {
                state.event_queue.pop_front();
            }
            state.event_queue.push_back(event);
        }
    }

    /// Calls `f` for every authenticated session.
    pub fn foreach_running_session(&self, mut f: impl FnMut(&BranchConnectionPtr)) {
        let sessions: Vec<BranchConnectionPtr> = {
            let state = self.state.lock().expect("Mutex poisoned");
            state.sessions.values().cloned().collect()
        };

        for session in &sessions {
            f(session);
        }
    }

    /// Hands out the next operation id; never zero.
    pub fn make_operation_id(&self) -> OperationId {
        let mut state = self.state.lock().expect("Mutex poisoned");
        state.next_op_id = state.next_op_id.checked_add(1).unwrap_or(1);
        OperationId(state.next_op_id)
    }

    /// Info JSON of every connected branch, keyed by UUID.
    pub fn connected_branches_json(&self) -> Vec<(Uuid, Value)> {
        let state = self.state.lock().expect("Mutex poisoned");
        state
            .sessions
            .iter()
            .filter_map(|(uuid, conn)| conn.make_info_json().map(|json| (*uuid, json)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_events_mask_operations() {
        let mask = BranchEvents::BRANCH_DISCOVERED | BranchEvents::CONNECT_FINISHED;
        assert!(mask.intersects(BranchEvents::BRANCH_DISCOVERED));
        assert!(!mask.intersects(BranchEvents::CONNECTION_LOST));
        assert!(BranchEvents::ALL.intersects(BranchEvents::BRANCH_QUERIED));
        assert!(!BranchEvents::NONE.intersects(BranchEvents::ALL));
    }
}
