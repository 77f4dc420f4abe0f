//! Advertising: periodic UDP multicast beacons and their reception.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use uuid::Uuid;
use yogi_logger::{debug, error, info, warn};
use yogi_primitives::Duration;

use crate::branch::info::{
    deserialize_advertising_message, LocalBranchInfoPtr, ADVERTISING_MESSAGE_SIZE,
};
use crate::context::{Context, ContextPtr};
use crate::errors::{Error, ErrorKind, Result};
use crate::network::resolve_interface_addresses;

const LOG: &str = "yogi.advertising";

fn udp_socket(endpoint: SocketAddr) -> Result<Socket> {
    let domain = if endpoint.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::with_details(ErrorKind::OpenSocketFailed, e.to_string()))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| Error::with_details(ErrorKind::SetSocketOptionFailed, e.to_string()))?;

    Ok(socket)
}

fn into_tokio(context: &ContextPtr, socket: Socket) -> Result<UdpSocket> {
    let _guard = context.enter();
    UdpSocket::from_std(socket.into())
        .map_err(|e| Error::with_details(ErrorKind::OpenSocketFailed, e.to_string()))
}

/// Emits the 25-byte advertising datagram every advertising interval, one
/// socket per selected interface. A failing interface is evicted; running
/// out of interfaces stops advertising but is not fatal.
pub struct AdvertisingSender {
    context: ContextPtr,
    endpoint: SocketAddr,
}

impl AdvertisingSender {
    pub fn new(context: ContextPtr, endpoint: SocketAddr) -> AdvertisingSender {
        AdvertisingSender { context, endpoint }
    }

    pub fn start(&self, info: LocalBranchInfoPtr) -> Result<()> {
        let interval = info.info.advertising_interval;
        if interval.is_inf() {
            return Ok(());
        }

        let sockets = self.setup_sockets(&info)?;
        if sockets.is_empty() {
            error!(
                target: LOG,
                "No network interfaces available for sending advertising messages"
            );
            return Ok(());
        }

        for (addr, _) in &sockets {
            info!(target: LOG, "Using interface {addr} for sending advertising messages");
        }

        let endpoint = self.endpoint;
        // Advertising must stop as soon as the owning branch goes away.
        let weak_info = Arc::downgrade(&info);

        self.context.spawn(async move {
            let mut sockets = sockets;
            let interval = interval.to_std().expect("finite interval checked above");

            loop {
                let Some(info) = weak_info.upgrade() else { break };
                let message = info.advertising_message();

                // One send per interface, all in flight at once.
                let sends = sockets
                    .iter()
                    .map(|(_, socket)| socket.send_to(&message, endpoint));
                let results = futures::future::join_all(sends).await;

                for (idx, result) in results.into_iter().enumerate().rev() {
                    if let Err(e) = result {
                        let (addr, _) = sockets.remove(idx);
                        error!(
                            target: LOG,
                            "Sending advertisement over {addr} failed: {e}. No more \
                             advertising messages will be sent over this interface"
                        );
                    }
                }

                if sockets.is_empty() {
                    break;
                }

                drop(info);
                tokio::time::sleep(interval).await;
            }
        });

        Ok(())
    }

    fn setup_sockets(&self, info: &LocalBranchInfoPtr) -> Result<Vec<(IpAddr, UdpSocket)>> {
        let addresses =
            resolve_interface_addresses(&info.advertising_interfaces, self.endpoint.is_ipv6());

        let mut sockets = Vec::new();
        for addr in addresses {
            let socket = udp_socket(self.endpoint)?;

            if self.endpoint.ip().is_multicast() {
                let result = match (addr, self.endpoint.ip()) {
                    (IpAddr::V4(ifc), IpAddr::V4(_)) => socket
                        .set_multicast_if_v4(&ifc)
                        .and_then(|()| socket.set_multicast_loop_v4(true)),
                    (IpAddr::V6(_), IpAddr::V6(_)) => socket
                        .set_multicast_if_v6(0)
                        .and_then(|()| socket.set_multicast_loop_v6(true)),
                    _ => continue,
                };

                if let Err(e) = result {
                    error!(
                        target: LOG,
                        "Could not set outbound interface for socket using address {addr}: \
                         {e}. This interface will be ignored"
                    );
                    continue;
                }
            }

            let bind_addr: SocketAddr = if self.endpoint.is_ipv6() {
                SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), 0)
            } else {
                SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0)
            };
            socket
                .bind(&bind_addr.into())
                .map_err(|e| Error::with_details(ErrorKind::BindSocketFailed, e.to_string()))?;

            sockets.push((addr, into_tokio(&self.context, socket)?));
        }

        Ok(sockets)
    }
}

pub type ObserverFn = Arc<dyn Fn(Uuid, SocketAddr) + Send + Sync + 'static>;

/// Receives advertising datagrams on the configured group and reports every
/// peer candidate `(uuid, tcp endpoint)` that is not ourselves.
pub struct AdvertisingReceiver {
    context: ContextPtr,
    endpoint: SocketAddr,
    socket: Mutex<Option<UdpSocket>>,
}

impl AdvertisingReceiver {
    pub fn new(context: ContextPtr, endpoint: SocketAddr) -> Result<AdvertisingReceiver> {
        let socket = udp_socket(endpoint)?;

        socket
            .set_reuse_address(true)
            .map_err(|e| Error::with_details(ErrorKind::SetSocketOptionFailed, e.to_string()))?;

        let bind_addr: SocketAddr = if endpoint.is_ipv6() {
            SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), endpoint.port())
        } else {
            SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), endpoint.port())
        };
        socket
            .bind(&bind_addr.into())
            .map_err(|e| Error::with_details(ErrorKind::BindSocketFailed, e.to_string()))?;

        let socket = into_tokio(&context, socket)?;

        Ok(AdvertisingReceiver {
            context,
            endpoint,
            socket: Mutex::new(Some(socket)),
        })
    }

    pub fn start(&self, info: LocalBranchInfoPtr, observer: ObserverFn) -> Result<()> {
        let Some(socket) = self.socket.lock().expect("Mutex poisoned").take() else {
            return Ok(());
        };

        if self.endpoint.ip().is_multicast() && !self.join_multicast_groups(&socket, &info) {
            return Ok(());
        }

        let own_uuid = info.uuid();
        // Reception stops once the owning branch goes away.
        let weak_info = Arc::downgrade(&info);

        self.context.spawn(async move {
            let mut buffer = [0u8; ADVERTISING_MESSAGE_SIZE + 1];

            loop {
                let (received, sender) = match socket.recv_from(&mut buffer).await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(
                            target: LOG,
                            "Failed to receive advertising message: {e}. No more \
                             advertising messages will be received"
                        );
                        break;
                    }
                };

                if weak_info.upgrade().is_none() {
                    break;
                }

                if received != ADVERTISING_MESSAGE_SIZE {
                    warn!(target: LOG, "Unexpected advertising message size received");
                    continue;
                }

                let (uuid, tcp_port) =
                    match deserialize_advertising_message(&buffer[..received]) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            warn!(
                                target: LOG,
                                "Invalid advertising message received from {}: {e}",
                                sender.ip()
                            );
                            continue;
                        }
                    };

                // Ignore advertising messages that we sent ourselves.
                if uuid == own_uuid {
                    continue;
                }

                debug!(target: LOG, "Received advertisement from {uuid} at {}", sender.ip());
                observer(uuid, SocketAddr::new(sender.ip(), tcp_port));
            }
        });

        Ok(())
    }

    fn join_multicast_groups(&self, socket: &UdpSocket, info: &LocalBranchInfoPtr) -> bool {
        let addresses =
            resolve_interface_addresses(&info.advertising_interfaces, self.endpoint.is_ipv6());

        let mut joined_at_least_once = false;
        for addr in addresses {
            let result = match (self.endpoint.ip(), addr) {
                (IpAddr::V4(group), IpAddr::V4(ifc)) => socket.join_multicast_v4(group, ifc),
                (IpAddr::V6(group), IpAddr::V6(_)) => socket.join_multicast_v6(&group, 0),
                _ => continue,
            };

            match result {
                Ok(()) => {
                    info!(
                        target: LOG,
                        "Using interface {addr} for receiving advertising messages"
                    );
                    joined_at_least_once = true;
                }
                Err(e) => {
                    error!(
                        target: LOG,
                        "Could not join advertising multicast group {} for interface \
                         {addr}: {e}. This interface will be ignored",
                        self.endpoint
                    );
                }
            }
        }

        if !joined_at_least_once {
            error!(
                target: LOG,
                "No network interfaces available for receiving advertising messages"
            );
        }

        joined_at_least_once
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::info::LocalBranchInfo;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn run_until<F: Fn() -> bool>(context: &ContextPtr, pred: F) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !pred() {
            context.run(Duration::from_millis(10)).unwrap();
            assert!(std::time::Instant::now() < deadline, "test timed out");
        }
    }

    fn test_endpoint() -> SocketAddr {
        // Loopback multicast; each test binds its own port.
        use std::sync::atomic::AtomicU16;
        static NEXT_PORT: AtomicU16 = AtomicU16::new(0);

        let offset = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        SocketAddr::new("239.255.0.1".parse().unwrap(), 45600 + offset)
    }

    fn local_info(endpoint: SocketAddr, interval: f64) -> LocalBranchInfoPtr {
        LocalBranchInfo::from_config(
            &json!({
                "name": "adv-test",
                "advertising_interfaces": ["localhost"],
                "advertising_address": endpoint.ip().to_string(),
                "advertising_port": endpoint.port(),
                "advertising_interval": interval,
            }),
            33221,
        )
        .unwrap()
    }

    #[test]
    fn sender_datagrams_reach_the_receiver() {
        let context = Context::create().unwrap();
        let endpoint = test_endpoint();

        let sender_info = local_info(endpoint, 0.05);
        let receiver_info = local_info(endpoint, 0.05);

        let receiver = AdvertisingReceiver::new(Arc::clone(&context), endpoint).unwrap();

        let observed = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));
        let slot = Arc::clone(&observed);
        let counter = Arc::clone(&count);
        receiver
            .start(
                Arc::clone(&receiver_info),
                Arc::new(move |uuid, ep| {
                    *slot.lock().expect("Mutex poisoned") = Some((uuid, ep));
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let sender = AdvertisingSender::new(Arc::clone(&context), endpoint);
        sender.start(Arc::clone(&sender_info)).unwrap();

        run_until(&context, || count.load(Ordering::SeqCst) >= 2);

        let (uuid, ep) = observed.lock().expect("Mutex poisoned").take().unwrap();
        assert_eq!(uuid, sender_info.uuid());
        assert_eq!(ep.port(), 33221);
    }

    #[test]
    fn receiver_ignores_its_own_uuid() {
        let context = Context::create().unwrap();
        let endpoint = test_endpoint();

        let info = local_info(endpoint, 0.05);

        let receiver = AdvertisingReceiver::new(Arc::clone(&context), endpoint).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        receiver
            .start(
                Arc::clone(&info),
                Arc::new(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        // The same branch advertises; nothing may be observed.
        let sender = AdvertisingSender::new(Arc::clone(&context), endpoint);
        sender.start(Arc::clone(&info)).unwrap();

        context.run(Duration::from_millis(200)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn infinite_interval_disables_sending() {
        let context = Context::create().unwrap();
        let endpoint = test_endpoint();

        let info = LocalBranchInfo::from_config(
            &json!({
                "advertising_address": endpoint.ip().to_string(),
                "advertising_port": endpoint.port(),
                "advertising_interval": null,
            }),
            1,
        )
        .unwrap();

        let sender = AdvertisingSender::new(Arc::clone(&context), endpoint);
        sender.start(info).unwrap();
        context.poll().unwrap();
    }
}
