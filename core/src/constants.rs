//! Library-wide constants and defaults.

use yogi_primitives::Duration;

/// Version of the library; peers with a different major version are rejected.
pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 1;

/// Default interfaces used for advertising and the TCP server.
pub const DEFAULT_ADV_INTERFACES: &[&str] = &["localhost"];

/// Default multicast address for advertising (IPv6 link-local scope).
pub const DEFAULT_ADV_ADDRESS: &str = "ff02::8000:2439";

/// Default port for advertising.
pub const DEFAULT_ADV_PORT: u16 = 13531;

/// Default time between two advertising messages.
pub const DEFAULT_ADV_INTERVAL: Duration = Duration::from_secs(1);

/// Default connection timeout.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Maximum size of a message payload in bytes.
pub const MAX_MESSAGE_PAYLOAD_SIZE: usize = 32_768;

pub const MIN_TX_QUEUE_SIZE: usize = 35_000;
pub const MAX_TX_QUEUE_SIZE: usize = 10_000_000;
pub const DEFAULT_TX_QUEUE_SIZE: usize = 35_000;

pub const MIN_RX_QUEUE_SIZE: usize = 35_000;
pub const MAX_RX_QUEUE_SIZE: usize = 10_000_000;
pub const DEFAULT_RX_QUEUE_SIZE: usize = 35_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_matches_the_package() {
        assert_eq!(
            env!("CARGO_PKG_VERSION_MAJOR").parse::<u8>().unwrap(),
            VERSION_MAJOR
        );
        assert_eq!(
            env!("CARGO_PKG_VERSION_MINOR").parse::<u8>().unwrap(),
            VERSION_MINOR
        );
    }

    #[test]
    fn queue_limits_fit_a_whole_message() {
        assert!(MIN_RX_QUEUE_SIZE > MAX_MESSAGE_PAYLOAD_SIZE);
        assert!(MIN_TX_QUEUE_SIZE > MAX_MESSAGE_PAYLOAD_SIZE);
    }
}
