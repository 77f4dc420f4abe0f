//! TCP transport.
//!
//! Wraps a connected `tokio` TCP stream behind the [`TransportIo`] seam and
//! provides the asynchronous connect/accept factories. Both factories return
//! a guard; dropping the guard before completion cancels the pending
//! operation and its handler fires with `Canceled`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use yogi_primitives::Duration;

use crate::context::{Context, ContextPtr};
use crate::errors::{Error, ErrorKind, Result};
use crate::network::transport::{Transport, TransportIo, TransportPtr};

struct TcpIo {
    stream: TcpStream,
    closed: AtomicBool,
    closed_notify: tokio::sync::Notify,
}

impl TcpIo {
    fn new(stream: TcpStream) -> TcpIo {
        TcpIo {
            stream,
            closed: AtomicBool::new(false),
            closed_notify: tokio::sync::Notify::new(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn map_io_error(err: std::io::Error) -> Error {
    Error::with_details(ErrorKind::RwSocketFailed, err.to_string())
}

#[async_trait]
impl TransportIo for TcpIo {
    async fn write_some(&self, data: &[u8]) -> Result<usize> {
        loop {
            if self.is_closed() {
                return Err(Error::new(ErrorKind::Canceled));
            }

            tokio::select! {
                _ = self.closed_notify.notified() => {
                    return Err(Error::new(ErrorKind::Canceled));
                }
                ready = self.stream.writable() => {
                    ready.map_err(map_io_error)?;
                    match self.stream.try_write(data) {
                        Ok(n) => return Ok(n),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(map_io_error(e)),
                    }
                }
            }
        }
    }

    async fn read_some(&self, buffer: &mut [u8]) -> Result<usize> {
        loop {
            if self.is_closed() {
                return Err(Error::new(ErrorKind::Canceled));
            }

            tokio::select! {
                _ = self.closed_notify.notified() => {
                    return Err(Error::new(ErrorKind::Canceled));
                }
                ready = self.stream.readable() => {
                    ready.map_err(map_io_error)?;
                    match self.stream.try_read(buffer) {
                        Ok(0) if !buffer.is_empty() => {
                            return Err(Error::new(ErrorKind::RwSocketFailed));
                        }
                        Ok(n) => return Ok(n),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(map_io_error(e)),
                    }
                }
            }
        }
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.closed_notify.notify_waiters();
        let _ = SockRef::from(&self.stream).shutdown(std::net::Shutdown::Both);
    }
}

fn make_peer_description(addr: SocketAddr) -> String {
    addr.to_string()
}

/// Builds a [`Transport`] for an already connected stream.
pub fn make_tcp_transport(
    context: ContextPtr,
    stream: TcpStream,
    timeout: Duration,
    transceive_byte_limit: Option<usize>,
    created_via_accept: bool,
) -> TransportPtr {
    let _ = stream.set_nodelay(true);

    let peer_description = stream
        .peer_addr()
        .map(make_peer_description)
        .unwrap_or_else(|_| "unknown".to_string());

    Transport::new(
        context,
        Box::new(TcpIo::new(stream)),
        timeout,
        created_via_accept,
        peer_description,
        transceive_byte_limit,
    )
}

pub type ConnectHandler = Box<dyn FnOnce(Result<TransportPtr>) + Send + 'static>;
pub type AcceptHandler = Box<dyn FnOnce(Result<TransportPtr>) + Send + 'static>;

/// Cancels its pending connect/accept when dropped before completion.
pub struct AsyncGuard {
    cancel: Option<oneshot::Sender<()>>,
}

impl Drop for AsyncGuard {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

fn post_result(context: &Weak<Context>, handler: ConnectHandler, result: Result<TransportPtr>) {
    if let Some(context) = context.upgrade() {
        context.post(move || handler(result));
    }
}

/// Asynchronously connects to `endpoint`.
///
/// `timeout` bounds the connect itself (independently of the operating
/// system's own limit) and becomes the created transport's inactivity
/// timeout.
pub fn connect_async(
    context: &ContextPtr,
    endpoint: SocketAddr,
    timeout: Duration,
    transceive_byte_limit: Option<usize>,
    handler: ConnectHandler,
) -> AsyncGuard {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let weak_context = Arc::downgrade(context);
    let task_context = Arc::clone(context);

    context.spawn(async move {
        let connect = async {
            match timeout.to_std() {
                None => TcpStream::connect(endpoint).await.map_err(|e| {
                    Error::with_details(ErrorKind::ConnectSocketFailed, e.to_string())
                }),
                Some(limit) => match tokio::time::timeout(limit, TcpStream::connect(endpoint)).await
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

        let result = tokio::select! {
            _ = cancel_rx => Err(Error::new(ErrorKind::Canceled)),
            result = connect => result.map(|stream| {
                make_tcp_transport(task_context, stream, timeout, transceive_byte_limit, false)
            }),
        };

        post_result(&weak_context, handler, result);
    });

    AsyncGuard {
        cancel: Some(cancel_tx),
    }
}

/// Asynchronously accepts one connection from `acceptor`.
pub fn accept_async(
    context: &ContextPtr,
    acceptor: Arc<TcpListener>,
    timeout: Duration,
    transceive_byte_limit: Option<usize>,
    handler: AcceptHandler,
) -> AsyncGuard {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let weak_context = Arc::downgrade(context);
    let task_context = Arc::clone(context);

    context.spawn(async move {
        let result = tokio::select! {
            _ = cancel_rx => Err(Error::new(ErrorKind::Canceled)),
            accepted = acceptor.accept() => accepted
                .map(|(stream, _)| {
                    make_tcp_transport(task_context, stream, timeout, transceive_byte_limit, true)
                })
                .map_err(|e| Error::with_details(ErrorKind::AcceptSocketFailed, e.to_string())),
        };

        post_result(&weak_context, handler, result);
    });

    AsyncGuard {
        cancel: Some(cancel_tx),
    }
}
