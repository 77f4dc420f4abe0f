//! A single connection to a peer branch.
//!
//! Drives the symmetric handshake (info exchange, acknowledgement, password
//! challenge/response, acknowledgement) over the raw transport and then runs
//! the framed session with its heartbeat timer and receive loop.
//!
//! Protocol violations discovered while acknowledging are deferred into
//! `next_result` so that both sides finish the current exchange in lockstep
//! before either reports the failure.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rand::RngCore;
use sha2::{Digest, Sha256};
use yogi_logger::debug;
use yogi_primitives::{Duration, Timestamp};

use crate::branch::info::{
    deserialize_info_message_body_size, LocalBranchInfoPtr, RemoteBranchInfo, RemoteBranchInfoPtr,
    INFO_MESSAGE_HEADER_SIZE,
};
use crate::constants;
use crate::context::ContextPtr;
use crate::errors::{Error, ErrorKind, Result};
use crate::network::messages::{IncomingMessage, OutgoingMessage};
use crate::network::msg_transport::{
    MessageTransport, MessageTransportPtr, OperationTag, SendHandler,
};
use crate::network::transport::TransportPtr;

const LOG: &str = "yogi.connection";

const CHALLENGE_SIZE: usize = 8;
const SOLUTION_SIZE: usize = 32;

pub type MessageReceiveFn =
    Arc<dyn Fn(IncomingMessage, &BranchConnectionPtr) + Send + Sync + 'static>;
pub type SessionErrorFn = Box<dyn FnOnce(Error) + Send + 'static>;

pub struct BranchConnection {
    weak_self: Weak<BranchConnection>,
    transport: TransportPtr,
    context: ContextPtr,
    local_info: LocalBranchInfoPtr,
    peer_address: IpAddr,
    connected_since: Timestamp,
    remote_info: Mutex<Option<RemoteBranchInfoPtr>>,
    msg_transport: Mutex<Option<MessageTransportPtr>>,
    session_running: AtomicBool,
    next_result: Mutex<Result<()>>,
}

pub type BranchConnectionPtr = Arc<BranchConnection>;

impl BranchConnection {
    pub fn new(
        transport: TransportPtr,
        peer_address: IpAddr,
        local_info: LocalBranchInfoPtr,
    ) -> BranchConnectionPtr {
        let context = transport.context().clone();
        Arc::new_cyclic(|weak_self| BranchConnection {
            weak_self: weak_self.clone(),
            transport,
            context,
            local_info,
            peer_address,
            connected_since: Timestamp::now(),
            remote_info: Mutex::new(None),
            msg_transport: Mutex::new(None),
            session_running: AtomicBool::new(false),
            next_result: Mutex::new(Ok(())),
        })
    }

    pub fn context(&self) -> &ContextPtr {
        &self.context
    }

    pub fn remote_info(&self) -> Option<RemoteBranchInfoPtr> {
        self.remote_info.lock().expect("Mutex poisoned").clone()
    }

    pub fn peer_description(&self) -> &str {
        self.transport.peer_description()
    }

    pub fn created_from_incoming(&self) -> bool {
        self.transport.created_from_incoming()
    }

    pub fn session_running(&self) -> bool {
        self.session_running.load(Ordering::Acquire)
    }

    /// Remote info JSON plus the time this connection was established.
    pub fn make_info_json(&self) -> Option<serde_json::Value> {
        let remote = self.remote_info()?;
        let mut json = remote.to_json();
        json["_connected_since"] =
            serde_json::Value::String(self.connected_since.to_rfc3339_string());
        Some(json)
    }

    pub fn close(&self) {
        self.transport.close();
    }

    /// Exchanges info messages and the first acknowledgement pair.
    ///
    /// After this returns the remote descriptor is known. A bad
    /// acknowledgement is deferred into `next_result`.
    pub async fn exchange_branch_info(&self) -> Result<()> {
        debug_assert!(self.remote_info().is_none());

        self.transport
            .send_all(&self.local_info.info_message())
            .await?;

        let mut header = vec![0u8; INFO_MESSAGE_HEADER_SIZE];
        self.transport.receive_all(&mut header).await?;

        let body_size = deserialize_info_message_body_size(&header)?;
        if body_size > constants::MAX_MESSAGE_PAYLOAD_SIZE {
            return Err(Error::new(ErrorKind::PayloadTooLarge));
        }

        let mut msg = header;
        msg.resize(INFO_MESSAGE_HEADER_SIZE + body_size, 0);
        self.transport
            .receive_all(&mut msg[INFO_MESSAGE_HEADER_SIZE..])
            .await?;

        let remote = RemoteBranchInfo::from_info_message(&msg, self.peer_address)?;
        if remote.uuid() == self.local_info.uuid() {
            return Err(Error::new(ErrorKind::LoopbackConnection));
        }

        debug!(target: LOG, "Exchanged branch info with {}", remote.uuid());
        *self.remote_info.lock().expect("Mutex poisoned") = Some(remote);

        self.exchange_acknowledge().await;
        Ok(())
    }

    /// Runs the password challenge/response.
    ///
    /// Both sides exchange eight random bytes, answer with
    /// `SHA256(challenge || password_hash)` and acknowledge. A wrong answer
    /// fails with `PasswordMismatch`.
    pub async fn authenticate(&self, password_hash: &[u8]) -> Result<()> {
        debug_assert!(self.remote_info().is_some());
        self.check_next_result()?;

        let mut my_challenge = [0u8; CHALLENGE_SIZE];
        rand::thread_rng().fill_bytes(&mut my_challenge);
        self.transport.send_all(&my_challenge).await?;

        let mut remote_challenge = [0u8; CHALLENGE_SIZE];
        self.transport.receive_all(&mut remote_challenge).await?;

        let my_solution = solve_challenge(&my_challenge, password_hash);
        let remote_solution = solve_challenge(&remote_challenge, password_hash);
        self.transport.send_all(&remote_solution).await?;

        let mut received_solution = [0u8; SOLUTION_SIZE];
        self.transport.receive_all(&mut received_solution).await?;
        let solutions_match = received_solution == my_solution;

        self.exchange_acknowledge().await;

        if !solutions_match {
            return Err(Error::new(ErrorKind::PasswordMismatch));
        }

        Ok(())
    }

    /// Starts the framed session: message transport, heartbeats and the
    /// receive loop. `on_session_error` fires once when the session dies.
    pub fn run_session(
        &self,
        receive_fn: MessageReceiveFn,
        on_session_error: SessionErrorFn,
    ) -> Result<()> {
        debug_assert!(!self.session_running());
        self.check_next_result()?;

        let msg_transport = MessageTransport::new(
            Arc::clone(&self.transport),
            self.local_info.tx_queue_size,
            self.local_info.rx_queue_size,
        );
        msg_transport.start();
        *self.msg_transport.lock().expect("Mutex poisoned") = Some(Arc::clone(&msg_transport));
        self.session_running.store(true, Ordering::Release);

        let remote_timeout = self
            .remote_info()
            .map(|info| info.info.timeout)
            .unwrap_or(Duration::inf());

        self.start_heartbeats(remote_timeout);
        self.start_receive_loop(msg_transport, receive_fn, on_session_error);

        Ok(())
    }

    /// Serializes into the session's tx ring if it fits; never blocks.
    pub fn try_send(&self, msg: &OutgoingMessage) -> Result<bool> {
        self.with_msg_transport(|mt| mt.try_send(msg))
    }

    pub fn send_async(&self, msg: &OutgoingMessage, tag: OperationTag, handler: SendHandler) {
        match self.msg_transport.lock().expect("Mutex poisoned").clone() {
            Some(mt) => mt.send_async(msg, tag, handler),
            None => {
                let err = Error::new(ErrorKind::Canceled);
                self.context.post(move || handler(Err(err)));
            }
        }
    }

    pub fn cancel_send(&self, tag: OperationTag) -> bool {
        self.with_msg_transport(|mt| Ok(mt.cancel_send(tag)))
            .unwrap_or(false)
    }

    fn with_msg_transport<R>(
        &self,
        f: impl FnOnce(&MessageTransport) -> Result<R>,
    ) -> Result<R> {
        match self.msg_transport.lock().expect("Mutex poisoned").clone() {
            Some(mt) => f(&mt),
            None => Err(Error::new(ErrorKind::Canceled)),
        }
    }

    /// Sends our acknowledgement and swallows the peer's.
    ///
    /// Transfer failures and bad acknowledgements surface through
    /// `next_result` at the start of the next handshake step, keeping both
    /// sides in lockstep.
    async fn exchange_acknowledge(&self) {
        let ack = OutgoingMessage::acknowledge();

        if let Err(err) = self.transport.send_all(ack.bytes().as_slice()).await {
            self.set_next_result(Err(err));
            return;
        }

        let mut received = vec![0u8; ack.size()];
        match self.transport.receive_all(&mut received).await {
            Err(err) => self.set_next_result(Err(err)),
            Ok(()) if received != ack.bytes()[..] => {
                self.set_next_result(Err(Error::new(ErrorKind::DeserializeMsgFailed)));
            }
            Ok(()) => {}
        }
    }

    fn set_next_result(&self, result: Result<()>) {
        let mut next_result = self.next_result.lock().expect("Mutex poisoned");
        if next_result.is_ok() {
            *next_result = result;
        }
    }

    fn check_next_result(&self) -> Result<()> {
        self.next_result.lock().expect("Mutex poisoned").clone()
    }

    fn start_heartbeats(&self, remote_timeout: Duration) {
        let Some(interval) = remote_timeout.halved().to_std() else {
            return;
        };

        let weak = self.weak_self.clone();
        self.context.spawn(async move {
            let heartbeat = OutgoingMessage::heartbeat();

            loop {
                tokio::time::sleep(interval).await;

                let Some(conn) = weak.upgrade() else { return };
                if !conn.session_running() {
                    return;
                }

                // A full tx ring satisfies liveness by itself.
                if conn.try_send(&heartbeat).is_err() {
                    return;
                }
            }
        });
    }

    fn start_receive_loop(
        &self,
        msg_transport: MessageTransportPtr,
        receive_fn: MessageReceiveFn,
        on_session_error: SessionErrorFn,
    ) {
        let weak = self.weak_self.clone();

        self.context.spawn(async move {
            let mut buffer = vec![0u8; constants::MIN_RX_QUEUE_SIZE];
            let mut on_session_error = Some(on_session_error);

            loop {
                let (result, returned, msg_size) = msg_transport.receive(buffer).await;
                buffer = returned;

                let Some(conn) = weak.upgrade() else { return };

                match result {
                    Ok(()) => match IncomingMessage::deserialize(&buffer[..msg_size]) {
                        Ok(msg) => receive_fn(msg, &conn),
                        Err(err) => {
                            conn.session_running.store(false, Ordering::Release);
                            conn.close();
                            if let Some(handler) = on_session_error.take() {
                                handler(err);
                            }
                            return;
                        }
                    },
                    Err(err) => {
                        conn.session_running.store(false, Ordering::Release);
                        if let Some(handler) = on_session_error.take() {
                            handler(err);
                        }
                        return;
                    }
                }
            }
        });
    }
}

fn solve_challenge(challenge: &[u8], password_hash: &[u8]) -> [u8; SOLUTION_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(challenge);
    hasher.update(password_hash);
    hasher.finalize().into()
}

/// SHA-256 of the network password, as fed into the challenge solutions.
pub fn make_password_hash(password: &str) -> Vec<u8> {
    Sha256::digest(password.as_bytes()).to_vec()
}
