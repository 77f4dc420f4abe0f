//! Listening socket set.
//!
//! Binds one acceptor per selected interface address (or a single wildcard
//! acceptor) with SO_REUSEADDR, resolving an ephemeral port once and reusing
//! it for every further acceptor. The accept loops keep going after
//! individual failures.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpStream;
use yogi_logger::{debug, error, info};

use crate::context::{Context, ContextPtr};
use crate::errors::{Error, ErrorKind, Result};
use crate::network::resolve_interface_addresses;

const LOG: &str = "yogi.listener";

pub type AcceptFn = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync + 'static>;

/// A set of TCP acceptors sharing one port.
pub struct TcpListenerSet {
    context: ContextPtr,
    acceptors: Vec<Arc<tokio::net::TcpListener>>,
    addresses: Vec<IpAddr>,
    port: u16,
}

impl TcpListenerSet {
    /// Binds acceptors for `interfaces`; `port` zero picks an ephemeral one.
    pub fn new(context: ContextPtr, interfaces: &[String], ipv6: bool, port: u16) -> Result<Self> {
        let addresses = resolve_interface_addresses(interfaces, ipv6);
        if addresses.is_empty() {
            return Err(Error::with_details(
                ErrorKind::ConfigNotValid,
                "No matching network interfaces found",
            ));
        }

        let mut listener_set = TcpListenerSet {
            context,
            acceptors: Vec::new(),
            addresses: addresses.clone(),
            port,
        };

        for addr in addresses {
            listener_set.add_acceptor(addr)?;
        }

        Ok(listener_set)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    fn add_acceptor(&mut self, addr: IpAddr) -> Result<()> {
        let endpoint = SocketAddr::new(addr, self.port);
        let domain = if endpoint.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::with_details(ErrorKind::OpenSocketFailed, e.to_string()))?;

        if let Err(e) = socket.set_reuse_address(true) {
            error!(target: LOG, "Could not set socket option SO_REUSEADDR: {e}");
        }

        socket
            .bind(&endpoint.into())
            .map_err(|e| {
                Error::with_details(
                    ErrorKind::BindSocketFailed,
                    format!("{}: {e}", endpoint),
                )
            })?;

        socket
            .listen(128)
            .map_err(|e| {
                Error::with_details(
                    ErrorKind::ListenSocketFailed,
                    format!("{}: {e}", endpoint),
                )
            })?;

        socket
            .set_nonblocking(true)
            .map_err(|e| Error::with_details(ErrorKind::SetSocketOptionFailed, e.to_string()))?;

        let _guard = self.context.enter();
        let listener = tokio::net::TcpListener::from_std(socket.into())
            .map_err(|e| Error::with_details(ErrorKind::OpenSocketFailed, e.to_string()))?;

        let local = listener
            .local_addr()
            .map_err(|e| Error::with_details(ErrorKind::OpenSocketFailed, e.to_string()))?;
        self.port = local.port();

        info!(target: LOG, "Listening for connections on {local}");
        self.acceptors.push(Arc::new(listener));
        Ok(())
    }

    /// Starts accepting; each connection is handed to `accept_fn`.
    pub fn start(&self, accept_fn: AcceptFn) {
        for acceptor in &self.acceptors {
            let acceptor = Arc::clone(acceptor);
            let accept_fn = Arc::clone(&accept_fn);
            let weak_context: Weak<Context> = Arc::downgrade(&self.context);

            self.context.spawn(async move {
                loop {
                    match acceptor.accept().await {
                        Ok((stream, addr)) => {
                            if weak_context.upgrade().is_none() {
                                break;
                            }
                            debug!(target: LOG, "Accepted connection from {addr}");
                            accept_fn(stream, addr);
                        }
                        Err(e) => {
                            error!(target: LOG, "Accepting connection failed: {e}");
                        }
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use yogi_primitives::Duration;

    #[test]
    fn binds_an_ephemeral_port() {
        let context = Context::create().unwrap();
        let listener =
            TcpListenerSet::new(context, &["localhost".to_string()], false, 0).unwrap();
        assert_ne!(listener.port(), 0);
        assert_eq!(listener.addresses(), &["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn rejects_unknown_interfaces() {
        let context = Context::create().unwrap();
        let err = TcpListenerSet::new(context, &[], false, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigNotValid);
    }

    #[test]
    fn accepts_connections() {
        let context = Context::create().unwrap();
        let listener =
            TcpListenerSet::new(Arc::clone(&context), &["localhost".to_string()], false, 0)
                .unwrap();
        let port = listener.port();

        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        listener.start(Arc::new(move |_stream, _addr| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while accepted.load(Ordering::SeqCst) == 0 {
            context.run(Duration::from_millis(10)).unwrap();
            assert!(std::time::Instant::now() < deadline, "test timed out");
        }

        drop(client);
    }
}
