//! Networking layers: field serialization, session messages, the transport
//! stack and the framed message transport on top of it.

pub mod listener;
pub mod messages;
pub mod msg_transport;
pub mod serialize;
pub mod tcp;
pub mod transport;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Resolves configured interface names to addresses of the wanted family.
///
/// `"localhost"` maps to the loopback address, `"all"` to the wildcard, and
/// anything else is interpreted as a literal IP address. Entries of the
/// wrong family or that do not parse are ignored.
pub fn resolve_interface_addresses(interfaces: &[String], ipv6: bool) -> Vec<IpAddr> {
    let mut addresses = Vec::new();

    for interface in interfaces {
        let addr = match interface.as_str() {
            "localhost" => Some(if ipv6 {
                IpAddr::V6(Ipv6Addr::LOCALHOST)
            } else {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }),
            "all" => Some(if ipv6 {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            } else {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            }),
            literal => literal
                .parse::<IpAddr>()
                .ok()
                .filter(|addr| addr.is_ipv6() == ipv6),
        };

        if let Some(addr) = addr {
            if !addresses.contains(&addr) {
                addresses.push(addr);
            }
        }
    }

    addresses
}
