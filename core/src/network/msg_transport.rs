//! Framed message layer on top of a transport.
//!
//! Outgoing messages are written as `<varint size><body>` into a lock-free
//! tx ring drained by one writer task; incoming bytes fill an rx ring from
//! which the size field is decoded byte by byte. Messages that do not fit
//! the tx ring become *pending sends*, retried whenever the ring drains, and
//! cancelable by tag until then. Errors are sticky per direction.

use std::sync::{Arc, Mutex, Weak};

use yogi_logger::error;
use yogi_primitives::LockFreeRingBuffer;

use crate::context::ContextPtr;
use crate::errors::{Error, ErrorKind, Result};
use crate::network::messages::OutgoingMessage;
use crate::network::serialize::{
    deserialize_msg_size_field, msg_size_field_length, serialize_msg_size_field,
    MAX_SIZE_FIELD_LENGTH,
};
use crate::network::transport::TransportPtr;

const LOG: &str = "yogi.msg_transport";

/// Tag identifying a cancelable pending send; zero is reserved for
/// non-cancelable operations.
pub type OperationTag = u32;

pub type SendHandler = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Receives `(result, buffer, msg_size)`; on `BufferTooSmall` the buffer
/// holds a truncated message and `msg_size` is the true length.
pub type ReceiveHandler = Box<dyn FnOnce(Result<()>, Vec<u8>, usize) + Send + 'static>;

struct PendingSend {
    tag: OperationTag,
    bytes: Arc<Vec<u8>>,
    handler: SendHandler,
}

struct TxState {
    last_error: Option<Error>,
    send_running: bool,
    pending_sends: Vec<PendingSend>,
}

struct RxState {
    last_error: Option<Error>,
    receive_running: bool,
    size_field_buffer: [u8; MAX_SIZE_FIELD_LENGTH],
    size_field_buffer_size: usize,
    size_field: usize,
    size_field_valid: bool,
    pending_receive: Option<(Vec<u8>, ReceiveHandler)>,
}

struct Inner {
    context: ContextPtr,
    transport: TransportPtr,
    tx_rb: LockFreeRingBuffer,
    rx_rb: LockFreeRingBuffer,
    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
}

/// The framed, back-pressured message channel to one peer.
pub struct MessageTransport {
    inner: Arc<Inner>,
}

pub type MessageTransportPtr = Arc<MessageTransport>;

impl MessageTransport {
    pub fn new(
        transport: TransportPtr,
        tx_queue_size: usize,
        rx_queue_size: usize,
    ) -> MessageTransportPtr {
        Arc::new(MessageTransport {
            inner: Arc::new(Inner {
                context: transport.context().clone(),
                transport,
                tx_rb: LockFreeRingBuffer::new(tx_queue_size),
                rx_rb: LockFreeRingBuffer::new(rx_queue_size),
                tx: Mutex::new(TxState {
                    last_error: None,
                    send_running: false,
                    pending_sends: Vec::new(),
                }),
                rx: Mutex::new(RxState {
                    last_error: None,
                    receive_running: false,
                    size_field_buffer: [0; MAX_SIZE_FIELD_LENGTH],
                    size_field_buffer_size: 0,
                    size_field: 0,
                    size_field_valid: false,
                    pending_receive: None,
                }),
            }),
        })
    }

    pub fn context(&self) -> &ContextPtr {
        &self.inner.context
    }

    /// Begins pulling bytes from the transport.
    pub fn start(&self) {
        let mut rx = self.inner.rx.lock().expect("Mutex poisoned");
        Inner::start_receive_task(&self.inner, &mut rx);
    }

    /// Serializes `msg` into the tx ring if it fully fits. Never blocks.
    ///
    /// Returns `Ok(false)` when the ring is too full right now. Fails with
    /// the sticky tx error once the channel is broken.
    pub fn try_send(&self, msg: &OutgoingMessage) -> Result<bool> {
        let mut tx = self.inner.tx.lock().expect("Mutex poisoned");

        if let Some(err) = &tx.last_error {
            return Err(err.clone());
        }

        if !tx.pending_sends.is_empty() {
            return Ok(false);
        }

        Ok(Inner::try_send_impl(&self.inner, &mut tx, msg.bytes()))
    }

    /// Sends `msg`, enqueueing a pending send if it does not fit right now.
    ///
    /// A non-zero `tag` makes the operation cancelable while still queued.
    pub fn send_async(&self, msg: &OutgoingMessage, tag: OperationTag, handler: SendHandler) {
        let mut tx = self.inner.tx.lock().expect("Mutex poisoned");

        debug_assert!(tag == 0 || tx.pending_sends.iter().all(|ps| ps.tag != tag));

        if let Some(err) = tx.last_error.clone() {
            self.inner.context.post(move || handler(Err(err)));
            return;
        }

        if tx.pending_sends.is_empty() && Inner::try_send_impl(&self.inner, &mut tx, msg.bytes()) {
            self.inner.context.post(move || handler(Ok(())));
        } else {
            tx.pending_sends.push(PendingSend {
                tag,
                bytes: Arc::clone(msg.bytes()),
                handler,
            });
        }
    }

    /// Cancels a pending send; `false` if the bytes already entered the ring.
    pub fn cancel_send(&self, tag: OperationTag) -> bool {
        debug_assert!(tag != 0);

        let mut tx = self.inner.tx.lock().expect("Mutex poisoned");
        let Some(pos) = tx.pending_sends.iter().position(|ps| ps.tag == tag) else {
            return false;
        };

        let pending = tx.pending_sends.remove(pos);
        let handler = pending.handler;
        self.inner
            .context
            .post(move || handler(Err(Error::new(ErrorKind::Canceled))));

        true
    }

    /// Completes with the next full message copied into `buffer`.
    ///
    /// At most one receive may be outstanding. A message longer than the
    /// buffer is truncated, its remainder discarded, and the handler fires
    /// `BufferTooSmall` together with the true message length.
    pub fn receive_async(&self, buffer: Vec<u8>, handler: ReceiveHandler) {
        let mut rx = self.inner.rx.lock().expect("Mutex poisoned");
        debug_assert!(rx.pending_receive.is_none());

        if let Some(err) = rx.last_error.clone() {
            self.inner.context.post(move || handler(Err(err), buffer, 0));
            return;
        }

        rx.pending_receive = Some((buffer, handler));
        Inner::try_deliver_pending_receive(&self.inner, &mut rx);
        Inner::start_receive_task(&self.inner, &mut rx);
    }

    /// Cancels the outstanding receive; its handler fires `Canceled`.
    pub fn cancel_receive(&self) -> bool {
        let mut rx = self.inner.rx.lock().expect("Mutex poisoned");
        let Some((buffer, handler)) = rx.pending_receive.take() else {
            return false;
        };

        self.inner
            .context
            .post(move || handler(Err(Error::new(ErrorKind::Canceled)), buffer, 0));
        true
    }

    /// Awaitable wrapper around [`MessageTransport::receive_async`].
    pub async fn receive(&self, buffer: Vec<u8>) -> (Result<()>, Vec<u8>, usize) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.receive_async(
            buffer,
            Box::new(move |res, buffer, size| {
                let _ = tx.send((res, buffer, size));
            }),
        );

        rx.await
            .unwrap_or_else(|_| (Err(Error::new(ErrorKind::Canceled)), Vec::new(), 0))
    }

    pub fn close(&self) {
        self.inner.transport.close();
    }
}

impl Inner {
    fn can_send(&self, msg_size: usize) -> bool {
        let available = self.tx_rb.available_for_write();
        // Likely case first; the exact field length rarely matters.
        available >= msg_size + MAX_SIZE_FIELD_LENGTH
            || available >= msg_size + msg_size_field_length(msg_size)
    }

    /// Writes the framed message into the tx ring if it fits.
    fn write_message(&self, bytes: &[u8]) -> bool {
        if !self.can_send(bytes.len()) {
            return false;
        }

        let mut size_field = [0u8; MAX_SIZE_FIELD_LENGTH];
        let n = serialize_msg_size_field(bytes.len(), &mut size_field);

        let written = self.tx_rb.write(&size_field[..n]);
        debug_assert_eq!(written, n);
        let written = self.tx_rb.write(bytes);
        debug_assert_eq!(written, bytes.len());

        true
    }

    fn try_send_impl(inner: &Arc<Inner>, tx: &mut TxState, bytes: &Arc<Vec<u8>>) -> bool {
        if !inner.write_message(bytes) {
            return false;
        }

        Self::start_send_task(inner, tx);
        true
    }

    fn start_send_task(inner: &Arc<Inner>, tx: &mut TxState) {
        if tx.send_running {
            return;
        }
        tx.send_running = true;

        let weak = Arc::downgrade(inner);
        inner.context.spawn(send_loop(weak));
    }

    fn retry_pending_sends(inner: &Arc<Inner>, tx: &mut TxState) {
        let mut completed = 0;
        while completed < tx.pending_sends.len() {
            if !inner.write_message(&tx.pending_sends[completed].bytes) {
                break;
            }
            completed += 1;
        }

        for pending in tx.pending_sends.drain(..completed) {
            let handler = pending.handler;
            inner.context.post(move || handler(Ok(())));
        }
    }

    fn handle_send_error(inner: &Arc<Inner>, err: Error) {
        error!(target: LOG, "Sending message to {} failed: {err}",
            inner.transport.peer_description());

        inner.transport.close();

        let mut tx = inner.tx.lock().expect("Mutex poisoned");
        tx.last_error = Some(err.clone());
        tx.send_running = false;

        for pending in tx.pending_sends.drain(..) {
            let handler = pending.handler;
            let err = err.clone();
            inner.context.post(move || handler(Err(err)));
        }
    }

    fn start_receive_task(inner: &Arc<Inner>, rx: &mut RxState) {
        if rx.receive_running || inner.rx_rb.full() {
            return;
        }
        rx.receive_running = true;

        let weak = Arc::downgrade(inner);
        inner.context.spawn(receive_loop(weak));
    }

    /// Decodes the size field from the rx ring, one byte at a time.
    fn try_get_received_size_field(inner: &Arc<Inner>, rx: &mut RxState) -> Option<usize> {
        if rx.size_field_valid {
            return Some(rx.size_field);
        }

        let mut failed = false;
        let rx_capacity = inner.rx_rb.capacity();
        inner.rx_rb.pop_until(|byte| {
            rx.size_field_buffer[rx.size_field_buffer_size] = byte;
            rx.size_field_buffer_size += 1;

            match deserialize_msg_size_field(&rx.size_field_buffer, rx.size_field_buffer_size) {
                Some(size) => {
                    rx.size_field = size;
                    rx.size_field_valid = true;
                    if size > rx_capacity {
                        failed = true;
                    }
                    true
                }
                None if rx.size_field_buffer_size >= MAX_SIZE_FIELD_LENGTH => {
                    failed = true;
                    true
                }
                None => false,
            }
        });

        if failed {
            Self::handle_receive_error_locked(inner, rx, Error::new(ErrorKind::DeserializeMsgFailed));
            return None;
        }

        rx.size_field_valid.then_some(rx.size_field)
    }

    fn try_deliver_pending_receive(inner: &Arc<Inner>, rx: &mut RxState) {
        if rx.pending_receive.is_none() {
            return;
        }

        let Some(size) = Self::try_get_received_size_field(inner, rx) else {
            return;
        };

        if inner.rx_rb.available_for_read() < size {
            return;
        }

        let (mut buffer, handler) = rx.pending_receive.take().expect("checked above");
        rx.size_field_buffer_size = 0;
        rx.size_field_valid = false;

        let n = size.min(buffer.len());
        let read = inner.rx_rb.read(&mut buffer[..n]);
        debug_assert_eq!(read, n);

        if n < size {
            inner.rx_rb.discard(size - n);
            inner.context.post(move || {
                handler(Err(Error::new(ErrorKind::BufferTooSmall)), buffer, size)
            });
        } else {
            inner.context.post(move || handler(Ok(()), buffer, size));
        }
    }

    fn handle_receive_error_locked(inner: &Arc<Inner>, rx: &mut RxState, err: Error) {
        error!(target: LOG, "Receiving message from {} failed: {err}",
            inner.transport.peer_description());

        inner.transport.close();

        rx.last_error = Some(err.clone());
        rx.receive_running = false;

        if let Some((buffer, handler)) = rx.pending_receive.take() {
            inner.context.post(move || handler(Err(err), buffer, 0));
        }
    }
}

async fn send_loop(weak: Weak<Inner>) {
    loop {
        let Some(inner) = weak.upgrade() else { return };

        let slice = inner.tx_rb.first_read_array();
        if slice.is_empty() {
            let mut tx = inner.tx.lock().expect("Mutex poisoned");
            if inner.tx_rb.empty() {
                tx.send_running = false;
                return;
            }
            continue;
        }

        match inner.transport.send_some(slice).await {
            Ok(n) => {
                inner.tx_rb.commit_first_read_array(n);
                let mut tx = inner.tx.lock().expect("Mutex poisoned");
                Inner::retry_pending_sends(&inner, &mut tx);
            }
            Err(err) => {
                Inner::handle_send_error(&inner, err);
                return;
            }
        }
    }
}

async fn receive_loop(weak: Weak<Inner>) {
    loop {
        let Some(inner) = weak.upgrade() else { return };

        let buffer = inner.rx_rb.first_write_array();
        if buffer.is_empty() {
            let mut rx = inner.rx.lock().expect("Mutex poisoned");
            if inner.rx_rb.full() {
                rx.receive_running = false;
                return;
            }
            continue;
        }

        match inner.transport.receive_some(buffer).await {
            Ok(n) => {
                inner.rx_rb.commit_first_write_array(n);
                let mut rx = inner.rx.lock().expect("Mutex poisoned");
                Inner::try_deliver_pending_receive(&inner, &mut rx);
                if inner.rx_rb.full() {
                    rx.receive_running = false;
                    return;
                }
            }
            Err(err) => {
                let mut rx = inner.rx.lock().expect("Mutex poisoned");
                Inner::handle_receive_error_locked(&inner, &mut rx, err);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::network::transport::mock::transport_pair;
    use crate::payload::Payload;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use yogi_primitives::Duration;

    fn run_until<F: Fn() -> bool>(context: &ContextPtr, pred: F) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !pred() {
            context.run(Duration::from_millis(10)).unwrap();
            assert!(std::time::Instant::now() < deadline, "test timed out");
        }
    }

    fn pair(
        context: &ContextPtr,
        queue_size: usize,
        pipe_buffer: usize,
    ) -> (MessageTransportPtr, MessageTransportPtr) {
        let (a, b) = transport_pair(context, Duration::from_secs(5), None, pipe_buffer);
        let a = MessageTransport::new(a, queue_size, queue_size);
        let b = MessageTransport::new(b, queue_size, queue_size);
        a.start();
        b.start();
        (a, b)
    }

    fn broadcast_msg(json: &str) -> OutgoingMessage {
        OutgoingMessage::broadcast(&Payload::from_json_str(json)).unwrap()
    }

    type ReceiveSlot = Arc<Mutex<Option<(Result<()>, Vec<u8>, usize)>>>;

    fn receive_into(slot: &ReceiveSlot, transport: &MessageTransport, capacity: usize) {
        let slot = Arc::clone(slot);
        transport.receive_async(
            vec![0u8; capacity],
            Box::new(move |res, buffer, size| {
                *slot.lock().expect("Mutex poisoned") = Some((res, buffer, size));
            }),
        );
    }

    #[test]
    fn try_send_delivers_a_message() {
        let context = Context::create().unwrap();
        let (a, b) = pair(&context, 1024, 1 << 16);

        let msg = broadcast_msg("[1,2,3]");
        assert!(a.try_send(&msg).unwrap());

        let slot: ReceiveSlot = Arc::new(Mutex::new(None));
        receive_into(&slot, &b, 128);

        run_until(&context, || slot.lock().expect("Mutex poisoned").is_some());

        let (res, buffer, size) = slot.lock().expect("Mutex poisoned").take().unwrap();
        res.unwrap();
        assert_eq!(size, msg.size());
        assert_eq!(&buffer[..size], &msg.bytes()[..]);
    }

    #[test]
    fn heartbeats_are_zero_length_frames() {
        let context = Context::create().unwrap();
        let (a, b) = pair(&context, 1024, 1 << 16);

        assert!(a.try_send(&OutgoingMessage::heartbeat()).unwrap());

        let slot: ReceiveSlot = Arc::new(Mutex::new(None));
        receive_into(&slot, &b, 128);

        run_until(&context, || slot.lock().expect("Mutex poisoned").is_some());

        let (res, _buffer, size) = slot.lock().expect("Mutex poisoned").take().unwrap();
        res.unwrap();
        assert_eq!(size, 0);
    }

    #[test]
    fn messages_arrive_in_send_order() {
        let context = Context::create().unwrap();
        let (a, b) = pair(&context, 4096, 1 << 16);

        for i in 0..10 {
            let msg = broadcast_msg(&format!("[{i}]"));
            assert!(a.try_send(&msg).unwrap());
        }

        for i in 0..10 {
            let slot: ReceiveSlot = Arc::new(Mutex::new(None));
            receive_into(&slot, &b, 128);
            run_until(&context, || slot.lock().expect("Mutex poisoned").is_some());

            let (res, buffer, size) = slot.lock().expect("Mutex poisoned").take().unwrap();
            res.unwrap();
            let expected = broadcast_msg(&format!("[{i}]"));
            assert_eq!(&buffer[..size], &expected.bytes()[..]);
        }
    }

    #[test]
    fn small_buffer_gets_truncated_message_and_true_size() {
        let context = Context::create().unwrap();
        let (a, b) = pair(&context, 1024, 1 << 16);

        let big = broadcast_msg("[1,2,3,4,5,6,7,8,9,10]");
        let small = broadcast_msg("[42]");
        assert!(a.try_send(&big).unwrap());
        assert!(a.try_send(&small).unwrap());

        let slot: ReceiveSlot = Arc::new(Mutex::new(None));
        receive_into(&slot, &b, 4);
        run_until(&context, || slot.lock().expect("Mutex poisoned").is_some());

        let (res, buffer, size) = slot.lock().expect("Mutex poisoned").take().unwrap();
        assert_eq!(res.unwrap_err().kind(), ErrorKind::BufferTooSmall);
        assert_eq!(size, big.size());
        assert_eq!(&buffer[..4], &big.bytes()[..4]);

        // The remainder was discarded; the next message is intact.
        let slot: ReceiveSlot = Arc::new(Mutex::new(None));
        receive_into(&slot, &b, 128);
        run_until(&context, || slot.lock().expect("Mutex poisoned").is_some());

        let (res, buffer, size) = slot.lock().expect("Mutex poisoned").take().unwrap();
        res.unwrap();
        assert_eq!(&buffer[..size], &small.bytes()[..]);
    }

    #[test]
    fn full_ring_turns_sends_into_pending_sends() {
        let context = Context::create().unwrap();
        // Tiny pipe so the tx ring cannot drain while the peer is not read.
        let (a, b) = pair(&context, 40, 4);

        let filler = broadcast_msg("[0,0,0,0,0,0,0]");
        let queued = broadcast_msg("[1]");

        // Fill the ring until try_send reports back-pressure.
        let mut filled = 0;
        while a.try_send(&filler).unwrap() {
            filled += 1;
            assert!(filled < 100, "ring never filled");
        }

        let completions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&completions);
        a.send_async(
            &queued,
            7,
            Box::new(move |res| {
                res.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        context.poll().unwrap();
        assert_eq!(completions.load(Ordering::SeqCst), 0);

        // Drain the peer; the ring empties and the pending send goes out.
        for _ in 0..filled {
            let slot: ReceiveSlot = Arc::new(Mutex::new(None));
            receive_into(&slot, &b, 128);
            run_until(&context, || slot.lock().expect("Mutex poisoned").is_some());
        }

        run_until(&context, || completions.load(Ordering::SeqCst) == 1);

        let slot: ReceiveSlot = Arc::new(Mutex::new(None));
        receive_into(&slot, &b, 128);
        run_until(&context, || slot.lock().expect("Mutex poisoned").is_some());

        let (res, buffer, size) = slot.lock().expect("Mutex poisoned").take().unwrap();
        res.unwrap();
        assert_eq!(&buffer[..size], &queued.bytes()[..]);
    }

    #[test]
    fn cancel_send_removes_a_queued_operation() {
        let context = Context::create().unwrap();
        let (a, _b) = pair(&context, 40, 4);

        let filler = broadcast_msg("[0,0,0,0,0,0,0]");
        while a.try_send(&filler).unwrap() {}

        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        a.send_async(
            &broadcast_msg("[1]"),
            42,
            Box::new(move |res| {
                *slot.lock().expect("Mutex poisoned") = Some(res);
            }),
        );

        assert!(a.cancel_send(42));
        assert!(!a.cancel_send(42));

        run_until(&context, || result.lock().expect("Mutex poisoned").is_some());
        let res = result.lock().expect("Mutex poisoned").take().unwrap();
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Canceled);
    }

    #[test]
    fn cancel_receive_fires_canceled() {
        let context = Context::create().unwrap();
        let (a, _b) = pair(&context, 1024, 1 << 16);

        let slot: ReceiveSlot = Arc::new(Mutex::new(None));
        receive_into(&slot, &a, 64);

        assert!(a.cancel_receive());
        assert!(!a.cancel_receive());

        run_until(&context, || slot.lock().expect("Mutex poisoned").is_some());
        let (res, _, size) = slot.lock().expect("Mutex poisoned").take().unwrap();
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Canceled);
        assert_eq!(size, 0);
    }

    #[test]
    fn rx_errors_are_sticky() {
        let context = Context::create().unwrap();
        let (a, b) = pair(&context, 1024, 1 << 16);

        let slot: ReceiveSlot = Arc::new(Mutex::new(None));
        receive_into(&slot, &b, 64);

        // Closing the peer breaks the channel.
        a.close();
        run_until(&context, || slot.lock().expect("Mutex poisoned").is_some());

        let (res, _, _) = slot.lock().expect("Mutex poisoned").take().unwrap();
        let first_kind = res.unwrap_err().kind();

        let slot: ReceiveSlot = Arc::new(Mutex::new(None));
        receive_into(&slot, &b, 64);
        run_until(&context, || slot.lock().expect("Mutex poisoned").is_some());

        let (res, _, _) = slot.lock().expect("Mutex poisoned").take().unwrap();
        assert_eq!(res.unwrap_err().kind(), first_kind);
    }
}
