//! The branch: a named endpoint that discovers peers, maintains
//! authenticated sessions with them and exchanges broadcasts.

pub mod advertising;
pub mod broadcast;
pub mod connection;
pub mod connection_manager;
pub mod info;

use std::any::Any;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;
use yogi_logger::{error, trace};

use crate::branch::broadcast::{
    BroadcastManager, BroadcastManagerPtr, ReceiveBroadcastHandler, SendBroadcastHandler,
};
use crate::branch::connection_manager::{
    BranchEventHandler, BranchEvents, ConnectionManager, ConnectionManagerPtr, OperationId,
};
use crate::branch::info::{LocalBranchInfo, LocalBranchInfoPtr};
use crate::context::ContextPtr;
use crate::errors::Result;
use crate::network::messages::IncomingMessage;
use crate::objects::{ExposedObject, ObjectKind};
use crate::payload::{Encoding, Payload};

const LOG: &str = "yogi.branch";

/// A Yogi endpoint: identity, discovery, sessions and the broadcast API.
pub struct Branch {
    context: ContextPtr,
    info: LocalBranchInfoPtr,
    conn_manager: ConnectionManagerPtr,
    broadcast_manager: BroadcastManagerPtr,
}

pub type BranchPtr = Arc<Branch>;

impl Branch {
    /// Creates and starts a branch from a branch configuration section.
    pub fn create(context: ContextPtr, cfg: &Value) -> Result<BranchPtr> {
        yogi_config::schemas::validate(cfg, yogi_config::Schema::BranchConfig)?;

        let conn_manager = ConnectionManager::new(Arc::clone(&context), cfg)?;
        let info = LocalBranchInfo::from_config(cfg, conn_manager.tcp_server_port())?;
        let broadcast_manager =
            BroadcastManager::new(Arc::clone(&context), Arc::clone(&conn_manager));

        let branch = Arc::new(Branch {
            context,
            info,
            conn_manager,
            broadcast_manager,
        });

        branch.start()?;
        Ok(branch)
    }

    /// Creates a branch from a section of a configuration object.
    pub fn create_from_configuration(
        context: ContextPtr,
        configuration: &yogi_config::Configuration,
        section: Option<&str>,
    ) -> Result<BranchPtr> {
        let cfg = configuration.get_json(section)?;
        Branch::create(context, &cfg)
    }

    fn start(&self) -> Result<()> {
        let broadcast_manager = Arc::clone(&self.broadcast_manager);

        self.conn_manager.start(
            Arc::clone(&self.info),
            Arc::new(move |msg, conn| {
                trace!(target: LOG, "Message received from {}", conn.peer_description());

                match msg {
                    IncomingMessage::Heartbeat => {}
                    IncomingMessage::Broadcast(payload) => {
                        if let Some(remote) = conn.remote_info() {
                            broadcast_manager.on_broadcast_received(payload, remote.uuid());
                        }
                    }
                    IncomingMessage::Acknowledge => {
                        error!(target: LOG, "Message of unexpected type received");
                    }
                }
            }),
        )
    }

    pub fn context(&self) -> &ContextPtr {
        &self.context
    }

    pub fn uuid(&self) -> Uuid {
        self.info.uuid()
    }

    /// JSON describing this branch, including local-only properties.
    pub fn info_json(&self) -> Value {
        self.info.to_json()
    }

    /// Info JSON of every currently connected branch.
    pub fn connected_branches(&self) -> Vec<(Uuid, Value)> {
        self.conn_manager.connected_branches_json()
    }

    /// Awaits the next branch event matching `events`.
    pub fn await_event_async(&self, events: BranchEvents, handler: BranchEventHandler) {
        self.conn_manager.await_event_async(events, handler);
    }

    /// Cancels an outstanding event await.
    pub fn cancel_await_event(&self) -> Result<()> {
        self.conn_manager.cancel_await_event()
    }

    /// Synchronously broadcasts `payload` to all connected branches.
    pub fn send_broadcast(&self, payload: &Payload<'_>, block: bool) -> Result<()> {
        self.broadcast_manager.send_broadcast(payload, block)
    }

    /// Asynchronously broadcasts `payload`; see
    /// [`BroadcastManager::send_broadcast_async`].
    pub fn send_broadcast_async(
        &self,
        payload: &Payload<'_>,
        retry: bool,
        handler: SendBroadcastHandler,
    ) -> Result<OperationId> {
        self.broadcast_manager
            .send_broadcast_async(payload, retry, handler)
    }

    /// Cancels a pending broadcast send.
    pub fn cancel_send_broadcast(&self, oid: OperationId) -> Result<bool> {
        self.broadcast_manager.cancel_send_broadcast(oid)
    }

    /// Awaits the next broadcast from any connected branch.
    pub fn receive_broadcast(
        &self,
        encoding: Encoding,
        buffer: Vec<u8>,
        handler: ReceiveBroadcastHandler,
    ) {
        self.broadcast_manager
            .receive_broadcast(encoding, buffer, handler);
    }

    /// Cancels the outstanding broadcast receive.
    pub fn cancel_receive_broadcast(&self) -> bool {
        self.broadcast_manager.cancel_receive_broadcast()
    }
}

impl ExposedObject for Branch {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Branch
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use serde_json::json;

    #[test]
    fn create_validates_the_configuration() {
        let context = Context::create().unwrap();

        let err = Branch::create(context, &json!({"path": "missing-slash"})).unwrap_err();
        assert_eq!(
            err.kind(),
            crate::errors::ErrorKind::ConfigurationValidationFailed
        );
    }

    #[test]
    fn create_exposes_local_info() {
        let context = Context::create().unwrap();
        let branch = Branch::create(
            Arc::clone(&context),
            &json!({
                "name": "info-test",
                "description": "Test branch",
                "network_name": "testnet",
                "advertising_address": "239.255.0.1",
                "advertising_port": 45991,
                "advertising_interval": null,
            }),
        )
        .unwrap();

        let info = branch.info_json();
        assert_eq!(info["name"], json!("info-test"));
        assert_eq!(info["network_name"], json!("testnet"));
        assert_eq!(info["uuid"], json!(branch.uuid().to_string()));
        assert!(info["tcp_server_port"].as_u64().unwrap() > 0);
        assert!(branch.connected_branches().is_empty());
    }

    #[test]
    fn cancel_await_event_without_await_fails() {
        let context = Context::create().unwrap();
        let branch = Branch::create(
            Arc::clone(&context),
            &json!({
                "name": "await-test",
                "advertising_address": "239.255.0.1",
                "advertising_port": 45992,
                "advertising_interval": null,
            }),
        )
        .unwrap();

        assert_eq!(
            branch.cancel_await_event().unwrap_err().kind(),
            crate::errors::ErrorKind::OperationNotRunning
        );

        branch.await_event_async(BranchEvents::ALL, Box::new(|res, event| {
            assert_eq!(
                res.unwrap_err().kind(),
                crate::errors::ErrorKind::Canceled
            );
            assert!(event.is_none());
        }));
        branch.cancel_await_event().unwrap();
        context.poll().unwrap();
    }
}
