//! Branch descriptors and their wire representations.
//!
//! The advertising message is 25 bytes: the magic `"YOGI\0"`, the protocol
//! version pair, the branch UUID and the TCP server port. The info message
//! extends it with a four-byte body length and the serialized descriptor
//! fields.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;
use yogi_primitives::{Duration, Timestamp};

use crate::constants;
use crate::errors::{Error, ErrorKind, Result};
use crate::network::serialize::{FieldReader, SerializeField};

pub const ADVERTISING_MESSAGE_SIZE: usize = 25;
pub const INFO_MESSAGE_HEADER_SIZE: usize = ADVERTISING_MESSAGE_SIZE + 4;

const MAGIC: &[u8; 5] = b"YOGI\0";

/// Descriptor fields common to the local branch and its peers.
#[derive(Debug, Clone)]
pub struct BranchInfo {
    pub uuid: Uuid,
    pub name: String,
    pub description: String,
    pub network_name: String,
    pub path: String,
    pub hostname: String,
    pub pid: i32,
    pub tcp_server_port: u16,
    pub start_time: Timestamp,
    pub timeout: Duration,
    pub advertising_interval: Duration,
    pub ghost_mode: bool,
}

impl BranchInfo {
    fn to_json(&self) -> Value {
        json!({
            "uuid": self.uuid.to_string(),
            "name": self.name,
            "description": self.description,
            "network_name": self.network_name,
            "path": self.path,
            "hostname": self.hostname,
            "pid": self.pid,
            "tcp_server_port": self.tcp_server_port,
            "start_time": self.start_time.to_rfc3339_string(),
            "timeout": duration_to_json(self.timeout),
            "advertising_interval": duration_to_json(self.advertising_interval),
            "ghost_mode": self.ghost_mode,
        })
    }
}

fn duration_to_json(duration: Duration) -> Value {
    match duration.as_nanos() {
        Some(ns) => json!(ns as f64 / 1e9),
        None => Value::Null,
    }
}

fn duration_from_json(cfg: &Value, key: &str, default: Duration) -> Result<Duration> {
    match cfg.get(key) {
        None => Ok(default),
        Some(Value::Null) => Ok(Duration::inf()),
        Some(value) => {
            let seconds = value.as_f64().ok_or_else(|| {
                Error::with_details(
                    ErrorKind::ConfigNotValid,
                    format!("Property \"{key}\" must be a number or null"),
                )
            })?;
            Ok(Duration::from_nanos((seconds * 1e9) as i64))
        }
    }
}

fn size_from_json(cfg: &Value, key: &str, default: usize, min: usize, max: usize) -> Result<usize> {
    match cfg.get(key) {
        None => Ok(default),
        Some(value) => {
            let size = value.as_u64().ok_or_else(|| {
                Error::with_details(
                    ErrorKind::ConfigNotValid,
                    format!("Property \"{key}\" must be an integer"),
                )
            })? as usize;

            if size < min || size > max {
                return Err(Error::with_details(
                    ErrorKind::ConfigNotValid,
                    format!("Property \"{key}\" must be in [{min}, {max}]"),
                ));
            }

            Ok(size)
        }
    }
}

fn string_from_json(cfg: &Value, key: &str, default: &str) -> String {
    cfg.get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

/// The local branch descriptor plus everything derived from it.
#[derive(Debug)]
pub struct LocalBranchInfo {
    pub info: BranchInfo,
    pub advertising_interfaces: Vec<String>,
    pub advertising_endpoint: SocketAddr,
    pub tx_queue_size: usize,
    pub rx_queue_size: usize,
    pub transceive_byte_limit: Option<usize>,
    advertising_message: Arc<Vec<u8>>,
    info_message: Arc<Vec<u8>>,
}

pub type LocalBranchInfoPtr = Arc<LocalBranchInfo>;

impl LocalBranchInfo {
    /// Builds the local descriptor from a branch configuration section.
    pub fn from_config(cfg: &Value, tcp_server_port: u16) -> Result<LocalBranchInfoPtr> {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let pid = std::process::id() as i32;

        let name = string_from_json(cfg, "name", &format!("{pid}@{hostname}"));
        let path = string_from_json(cfg, "path", &format!("/{name}"));
        if !path.starts_with('/') || path.len() < 2 {
            return Err(Error::with_details(
                ErrorKind::ConfigNotValid,
                "Property \"path\" must be non-empty and start with '/'",
            ));
        }

        let advertising_address = string_from_json(
            cfg,
            "advertising_address",
            constants::DEFAULT_ADV_ADDRESS,
        );
        let advertising_address: IpAddr = advertising_address.parse().map_err(|_| {
            Error::with_details(
                ErrorKind::ConfigNotValid,
                format!("Invalid advertising address \"{advertising_address}\""),
            )
        })?;

        let advertising_port = cfg
            .get("advertising_port")
            .and_then(Value::as_u64)
            .unwrap_or(u64::from(constants::DEFAULT_ADV_PORT)) as u16;

        let advertising_interfaces = match cfg.get("advertising_interfaces") {
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

        // The command line writes the short keys "network"/"password".
        let network_name = cfg
            .get("network_name")
            .or_else(|| cfg.get("network"))
            .and_then(Value::as_str)
            .unwrap_or(&hostname)
            .to_string();

        let info = BranchInfo {
            uuid: Uuid::new_v4(),
            name,
            description: string_from_json(cfg, "description", ""),
            network_name,
            path,
            hostname,
            pid,
            tcp_server_port,
            start_time: Timestamp::now(),
            timeout: duration_from_json(cfg, "timeout", constants::DEFAULT_CONNECTION_TIMEOUT)?,
            advertising_interval: duration_from_json(
                cfg,
                "advertising_interval",
                constants::DEFAULT_ADV_INTERVAL,
            )?,
            ghost_mode: cfg.get("ghost_mode").and_then(Value::as_bool).unwrap_or(false),
        };

        let advertising_message = Arc::new(make_advertising_message(&info));
        let info_message = Arc::new(make_info_message(&info));

        Ok(Arc::new(LocalBranchInfo {
            info,
            advertising_interfaces,
            advertising_endpoint: SocketAddr::new(advertising_address, advertising_port),
            tx_queue_size: size_from_json(
                cfg,
                "tx_queue_size",
                constants::DEFAULT_TX_QUEUE_SIZE,
                constants::MIN_TX_QUEUE_SIZE,
                constants::MAX_TX_QUEUE_SIZE,
            )?,
            rx_queue_size: size_from_json(
                cfg,
                "rx_queue_size",
                constants::DEFAULT_RX_QUEUE_SIZE,
                constants::MIN_RX_QUEUE_SIZE,
                constants::MAX_RX_QUEUE_SIZE,
            )?,
            transceive_byte_limit: cfg
                .get("_transceive_byte_limit")
                .and_then(Value::as_u64)
                .map(|limit| limit as usize),
            advertising_message,
            info_message,
        }))
    }

    pub fn uuid(&self) -> Uuid {
        self.info.uuid
    }

    pub fn advertising_message(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.advertising_message)
    }

    pub fn info_message(&self) -> Arc<Vec<u8>> {
        Arc::clone(&self.info_message)
    }

    /// JSON projection including the local-only properties.
    pub fn to_json(&self) -> Value {
        let mut json = self.info.to_json();
        json["advertising_interfaces"] = json!(self.advertising_interfaces);
        json["advertising_address"] = json!(self.advertising_endpoint.ip().to_string());
        json["advertising_port"] = json!(self.advertising_endpoint.port());
        json["tx_queue_size"] = json!(self.tx_queue_size);
        json["rx_queue_size"] = json!(self.rx_queue_size);
        json
    }
}

/// A peer's descriptor as learned from its info message.
#[derive(Debug, Clone)]
pub struct RemoteBranchInfo {
    pub info: BranchInfo,
    pub tcp_server_address: IpAddr,
}

pub type RemoteBranchInfoPtr = Arc<RemoteBranchInfo>;

impl RemoteBranchInfo {
    /// Parses a full info message received during the handshake.
    pub fn from_info_message(msg: &[u8], peer_address: IpAddr) -> Result<RemoteBranchInfoPtr> {
        let (uuid, tcp_server_port) = deserialize_advertising_message(msg)?;

        let mut reader = FieldReader::at(msg, INFO_MESSAGE_HEADER_SIZE);
        let name = reader.read_string()?;
        let description = reader.read_string()?;
        let network_name = reader.read_string()?;
        let path = reader.read_string()?;
        let hostname = reader.read_string()?;
        let pid = reader.read_i32()?;
        let start_time = reader.read_timestamp()?;
        let timeout = reader.read_duration()?;
        let advertising_interval = reader.read_duration()?;
        let ghost_mode = reader.read_bool()?;

        Ok(Arc::new(RemoteBranchInfo {
            info: BranchInfo {
                uuid,
                name,
                description,
                network_name,
                path,
                hostname,
                pid,
                tcp_server_port,
                start_time,
                timeout,
                advertising_interval,
                ghost_mode,
            },
            tcp_server_address: peer_address,
        }))
    }

    pub fn uuid(&self) -> Uuid {
        self.info.uuid
    }

    /// JSON projection including the observed peer address.
    pub fn to_json(&self) -> Value {
        let mut json = self.info.to_json();
        json["tcp_server_address"] = json!(self.tcp_server_address.to_string());
        json
    }
}

fn make_advertising_message(info: &BranchInfo) -> Vec<u8> {
    let mut msg = Vec::with_capacity(ADVERTISING_MESSAGE_SIZE);
    msg.extend_from_slice(MAGIC);
    msg.push(constants::VERSION_MAJOR);
    msg.push(constants::VERSION_MINOR);
    info.uuid.serialize_to(&mut msg);
    info.tcp_server_port.serialize_to(&mut msg);

    debug_assert_eq!(msg.len(), ADVERTISING_MESSAGE_SIZE);
    msg
}

fn make_info_message(info: &BranchInfo) -> Vec<u8> {
    let mut body = Vec::new();
    info.name.serialize_to(&mut body);
    info.description.serialize_to(&mut body);
    info.network_name.serialize_to(&mut body);
    info.path.serialize_to(&mut body);
    info.hostname.serialize_to(&mut body);
    info.pid.serialize_to(&mut body);
    info.start_time.serialize_to(&mut body);
    info.timeout.serialize_to(&mut body);
    info.advertising_interval.serialize_to(&mut body);
    info.ghost_mode.serialize_to(&mut body);

    let mut msg = make_advertising_message(info);
    body.len().serialize_to(&mut msg);
    msg.extend_from_slice(&body);

    debug_assert!(msg.len() >= INFO_MESSAGE_HEADER_SIZE);
    msg
}

fn check_magic_and_version(msg: &[u8]) -> Result<()> {
    if msg.len() < ADVERTISING_MESSAGE_SIZE {
        return Err(Error::new(ErrorKind::DeserializeMsgFailed));
    }

    if &msg[..MAGIC.len()] != MAGIC {
        return Err(Error::new(ErrorKind::InvalidMagicPrefix));
    }

    if msg[5] != constants::VERSION_MAJOR {
        return Err(Error::with_details(
            ErrorKind::IncompatibleVersion,
            format!("Peer version {}.{} is incompatible", msg[5], msg[6]),
        ));
    }

    Ok(())
}

/// Extracts `(uuid, tcp_server_port)` from an advertising message prefix.
pub fn deserialize_advertising_message(msg: &[u8]) -> Result<(Uuid, u16)> {
    check_magic_and_version(msg)?;

    let mut reader = FieldReader::at(msg, 7);
    let uuid = reader.read_uuid()?;
    let port = reader.read_u16()?;
    Ok((uuid, port))
}

/// Extracts the body size from an info message header.
pub fn deserialize_info_message_body_size(header: &[u8]) -> Result<usize> {
    check_magic_and_version(header)?;

    if header.len() < INFO_MESSAGE_HEADER_SIZE {
        return Err(Error::new(ErrorKind::DeserializeMsgFailed));
    }

    FieldReader::at(header, ADVERTISING_MESSAGE_SIZE).read_size()
}
