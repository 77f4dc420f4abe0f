//! Broadcast fan-out and delivery.
//!
//! Sending walks every authenticated session. Without retry, a single full
//! tx ring fails the whole operation with `TxQueueFull`; with retry, the
//! full peers get pending sends under one operation id and the aggregate
//! handler fires once the last of them settles. Receiving keeps at most one
//! outstanding handler per branch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

use crate::branch::connection_manager::{ConnectionManagerPtr, OperationId};
use crate::context::ContextPtr;
use crate::errors::{Error, ErrorKind, Result};
use crate::network::messages::OutgoingMessage;
use crate::payload::{Encoding, Payload};

/// `(result, operation id)` of a completed broadcast send.
pub type SendBroadcastHandler = Box<dyn FnOnce(Result<()>, OperationId) + Send + 'static>;

/// `(result, source uuid, buffer, bytes)` of a delivered broadcast.
pub type ReceiveBroadcastHandler =
    Box<dyn FnOnce(Result<()>, Option<Uuid>, Vec<u8>, usize) + Send + 'static>;

struct ActiveOperation {
    remaining: usize,
    canceled: bool,
    handler: Option<SendBroadcastHandler>,
}

struct TxState {
    active: HashMap<u32, ActiveOperation>,
}

struct RxState {
    pending: Option<(Encoding, Vec<u8>, ReceiveBroadcastHandler)>,
}

pub struct BroadcastManager {
    weak_self: Weak<BroadcastManager>,
    context: ContextPtr,
    conn_manager: ConnectionManagerPtr,
    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
}

pub type BroadcastManagerPtr = Arc<BroadcastManager>;

impl BroadcastManager {
    pub fn new(context: ContextPtr, conn_manager: ConnectionManagerPtr) -> BroadcastManagerPtr {
        Arc::new_cyclic(|weak_self| BroadcastManager {
            weak_self: weak_self.clone(),
            context,
            conn_manager,
            tx: Mutex::new(TxState {
                active: HashMap::new(),
            }),
            rx: Mutex::new(RxState { pending: None }),
        })
    }

    /// Synchronous broadcast.
    ///
    /// With `block` the call waits until every peer accepted the payload;
    /// without it a single full tx ring fails with `TxQueueFull`. Must not
    /// be called from a handler running on the branch's context.
    pub fn send_broadcast(&self, payload: &Payload<'_>, block: bool) -> Result<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.send_broadcast_async(
            payload,
            block,
            Box::new(move |result, _oid| {
                let _ = tx.send(result);
            }),
        )?;

        rx.recv()
            .unwrap_or_else(|_| Err(Error::new(ErrorKind::Canceled)))
    }

    /// Fans the payload out to every running session.
    ///
    /// Returns the operation id identifying this broadcast. With
    /// `retry=false` the handler fires `TxQueueFull` if any peer's tx ring
    /// is full; with `retry=true` those peers get pending sends and the
    /// handler fires `Ok` only after every per-peer send completed.
    pub fn send_broadcast_async(
        &self,
        payload: &Payload<'_>,
        retry: bool,
        handler: SendBroadcastHandler,
    ) -> Result<OperationId> {
        let msg = OutgoingMessage::broadcast(payload)?;
        let oid = self.conn_manager.make_operation_id();

        if retry {
            self.send_with_retry(&msg, oid, handler);
        } else {
            let mut all_sent = true;
            self.conn_manager.foreach_running_session(|conn| {
                if !matches!(conn.try_send(&msg), Ok(true)) {
                    all_sent = false;
                }
            });

            let result = if all_sent {
                Ok(())
            } else {
                Err(Error::new(ErrorKind::TxQueueFull))
            };
            self.context.post(move || handler(result, oid));
        }

        Ok(oid)
    }

    fn send_with_retry(
        &self,
        msg: &OutgoingMessage,
        oid: OperationId,
        handler: SendBroadcastHandler,
    ) {
        let mut tx = self.tx.lock().expect("Mutex poisoned");

        let mut pending_peers = 0;
        self.conn_manager.foreach_running_session(|conn| {
            if matches!(conn.try_send(msg), Ok(true)) {
                return;
            }

            // Queue on this peer; the completion settles the aggregate.
            pending_peers += 1;
            let weak = self.weak_self.clone();
            conn.send_async(
                msg,
                oid.0,
                Box::new(move |_res| {
                    if let Some(manager) = weak.upgrade() {
                        manager.on_peer_send_settled(oid);
                    }
                }),
            );
        });

        if pending_peers == 0 {
            self.context.post(move || handler(Ok(()), oid));
        } else {
            tx.active.insert(
                oid.0,
                ActiveOperation {
                    remaining: pending_peers,
                    canceled: false,
                    handler: Some(handler),
                },
            );
        }
    }

    fn on_peer_send_settled(&self, oid: OperationId) {
        let finished = {
            let mut tx = self.tx.lock().expect("Mutex poisoned");
            let Some(op) = tx.active.get_mut(&oid.0) else {
                return;
            };

            op.remaining -= 1;
            if op.remaining == 0 {
                tx.active.remove(&oid.0)
            } else {
                None
            }
        };

        if let Some(op) = finished {
            let result = if op.canceled {
                Err(Error::new(ErrorKind::Canceled))
            } else {
                Ok(())
            };

            if let Some(handler) = op.handler {
                handler(result, oid);
            }
        }
    }

    /// Requests cancellation of a pending broadcast.
    ///
    /// Returns whether at least one peer still had the operation queued; the
    /// aggregate handler then fires `Canceled` once everything settled.
    pub fn cancel_send_broadcast(&self, oid: OperationId) -> Result<bool> {
        if oid.0 == 0 {
            return Err(Error::new(ErrorKind::InvalidOperationId));
        }

        {
            let mut tx = self.tx.lock().expect("Mutex poisoned");
            let Some(op) = tx.active.get_mut(&oid.0) else {
                return Ok(false);
            };
            op.canceled = true;
        }

        let mut canceled_any = false;
        self.conn_manager.foreach_running_session(|conn| {
            canceled_any |= conn.cancel_send(oid.0);
        });

        Ok(canceled_any)
    }

    /// Awaits the next broadcast, re-encoded into `encoding`.
    ///
    /// At most one receive may be outstanding; a new one supersedes the old,
    /// whose handler fires `Canceled`.
    pub fn receive_broadcast(
        &self,
        encoding: Encoding,
        buffer: Vec<u8>,
        handler: ReceiveBroadcastHandler,
    ) {
        let mut rx = self.rx.lock().expect("Mutex poisoned");

        if let Some((_, old_buffer, old_handler)) = rx.pending.take() {
            self.context.post(move || {
                old_handler(Err(Error::new(ErrorKind::Canceled)), None, old_buffer, 0)
            });
        }

        rx.pending = Some((encoding, buffer, handler));
    }

    /// Cancels the outstanding receive; its handler fires `Canceled`.
    pub fn cancel_receive_broadcast(&self) -> bool {
        let mut rx = self.rx.lock().expect("Mutex poisoned");

        match rx.pending.take() {
            Some((_, buffer, handler)) => {
                self.context
                    .post(move || handler(Err(Error::new(ErrorKind::Canceled)), None, buffer, 0));
                true
            }
            None => false,
        }
    }

    /// Delivers a received broadcast to the outstanding receive, if any.
    pub fn on_broadcast_received(&self, payload_data: Vec<u8>, source: Uuid) {
        let mut rx = self.rx.lock().expect("Mutex poisoned");

        let Some((encoding, mut buffer, handler)) = rx.pending.take() else {
            return;
        };
        drop(rx);

        self.context.post(move || {
            let payload = Payload::new(&payload_data, Encoding::Msgpack);
            let mut written = 0;
            let result = payload.serialize_to_user_buffer(&mut buffer, encoding, &mut written);
            handler(result, Some(source), buffer, written);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::connection_manager::ConnectionManager;
    use crate::context::Context;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use yogi_primitives::Duration;

    fn manager(context: &ContextPtr) -> BroadcastManagerPtr {
        let cfg = json!({
            "advertising_address": "239.255.0.1",
            "advertising_port": 45990,
        });
        let conn_manager = ConnectionManager::new(Arc::clone(context), &cfg).unwrap();
        BroadcastManager::new(Arc::clone(context), conn_manager)
    }

    fn run_until<F: Fn() -> bool>(context: &ContextPtr, pred: F) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !pred() {
            context.run(Duration::from_millis(10)).unwrap();
            assert!(std::time::Instant::now() < deadline, "test timed out");
        }
    }

    #[test]
    fn broadcast_without_peers_completes_immediately() {
        let context = Context::create().unwrap();
        let bc = manager(&context);

        let completions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completions);
        let oid = bc
            .send_broadcast_async(
                &Payload::from_json_str("[1,2,3]"),
                false,
                Box::new(move |res, _| {
                    res.unwrap();
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert!(oid.value() > 0);
        run_until(&context, || completions.load(Ordering::SeqCst) == 1);
    }

    #[test]
    fn operation_ids_are_unique_and_positive() {
        let context = Context::create().unwrap();
        let bc = manager(&context);

        let first = bc
            .send_broadcast_async(&Payload::from_json_str("[]"), false, Box::new(|_, _| {}))
            .unwrap();
        let second = bc
            .send_broadcast_async(&Payload::from_json_str("[]"), false, Box::new(|_, _| {}))
            .unwrap();

        assert!(first.value() > 0);
        assert!(second.value() > first.value());
    }

    #[test]
    fn invalid_payload_is_rejected_synchronously() {
        let context = Context::create().unwrap();
        let bc = manager(&context);

        let err = bc
            .send_broadcast_async(
                &Payload::from_json_str("{not json"),
                true,
                Box::new(|_, _| panic!("handler must not fire")),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParsingJsonFailed);
    }

    #[test]
    fn cancel_of_unknown_operation_returns_false() {
        let context = Context::create().unwrap();
        let bc = manager(&context);

        assert!(!bc.cancel_send_broadcast(OperationId(9999)).unwrap());
        assert_eq!(
            bc.cancel_send_broadcast(OperationId(0)).unwrap_err().kind(),
            ErrorKind::InvalidOperationId
        );
    }

    #[test]
    fn reissuing_receive_cancels_the_previous_one() {
        let context = Context::create().unwrap();
        let bc = manager(&context);

        let canceled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&canceled);
        bc.receive_broadcast(
            Encoding::Json,
            vec![0u8; 64],
            Box::new(move |res, source, _, _| {
                assert_eq!(res.unwrap_err().kind(), ErrorKind::Canceled);
                assert!(source.is_none());
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bc.receive_broadcast(Encoding::Json, vec![0u8; 64], Box::new(|_, _, _, _| {}));
        run_until(&context, || canceled.load(Ordering::SeqCst) == 1);

        assert!(bc.cancel_receive_broadcast());
        assert!(!bc.cancel_receive_broadcast());
    }

    #[test]
    fn delivered_broadcasts_are_reencoded() {
        let context = Context::create().unwrap();
        let bc = manager(&context);

        let received = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&received);
        bc.receive_broadcast(
            Encoding::Json,
            vec![0u8; 128],
            Box::new(move |res, source, buffer, written| {
                res.unwrap();
                *slot.lock().expect("Mutex poisoned") =
                    Some((source.unwrap(), buffer, written));
            }),
        );

        let mut wire = Vec::new();
        Payload::from_json_str("[1,2,3]").serialize_to(&mut wire).unwrap();
        let source = Uuid::new_v4();
        bc.on_broadcast_received(wire, source);

        run_until(&context, || received.lock().expect("Mutex poisoned").is_some());

        let (uuid, buffer, written) = received.lock().expect("Mutex poisoned").take().unwrap();
        assert_eq!(uuid, source);
        assert_eq!(buffer[written - 1], 0);
        assert_eq!(&buffer[..written - 1], b"[1,2,3]");
    }
}
