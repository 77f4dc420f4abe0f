//! Messages exchanged over an established session.
//!
//! A serialized message is a type tag byte followed by type-specific data,
//! except for heartbeats which are the empty message (the framing layer's
//! zero-length frame).

use std::fmt;
use std::sync::Arc;

use crate::errors::{Error, ErrorKind, Result};
use crate::payload::Payload;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MessageType {
    Heartbeat = 0,
    Acknowledge = 1,
    Broadcast = 2,
}

/// A message serialized for sending; the bytes are shared so that broadcasts
/// can be fanned out without copying per peer.
#[derive(Clone)]
pub struct OutgoingMessage {
    msg_type: MessageType,
    bytes: Arc<Vec<u8>>,
}

impl OutgoingMessage {
    pub fn heartbeat() -> OutgoingMessage {
        OutgoingMessage {
            msg_type: MessageType::Heartbeat,
            bytes: Arc::new(Vec::new()),
        }
    }

    pub fn acknowledge() -> OutgoingMessage {
        OutgoingMessage {
            msg_type: MessageType::Acknowledge,
            bytes: Arc::new(vec![MessageType::Acknowledge as u8]),
        }
    }

    pub fn broadcast(payload: &Payload<'_>) -> Result<OutgoingMessage> {
        let mut bytes = vec![MessageType::Broadcast as u8];
        payload.serialize_to(&mut bytes)?;

        Ok(OutgoingMessage {
            msg_type: MessageType::Broadcast,
            bytes: Arc::new(bytes),
        })
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &Arc<Vec<u8>> {
        &self.bytes
    }
}

impl fmt::Display for OutgoingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg_type {
            MessageType::Heartbeat => write!(f, "Heartbeat"),
            MessageType::Acknowledge => write!(f, "Acknowledge"),
            MessageType::Broadcast => {
                write!(f, "Broadcast, {} bytes user data", self.size().saturating_sub(1))
            }
        }
    }
}

/// A message received from a peer.
#[derive(Debug, PartialEq, Eq)]
pub enum IncomingMessage {
    Heartbeat,
    Acknowledge,
    /// MessagePack-encoded user data.
    Broadcast(Vec<u8>),
}

impl IncomingMessage {
    /// Deserializes a complete frame; the empty frame is a heartbeat.
    pub fn deserialize(serialized: &[u8]) -> Result<IncomingMessage> {
        let Some((&tag, body)) = serialized.split_first() else {
            return Ok(IncomingMessage::Heartbeat);
        };

        match tag {
            tag if tag == MessageType::Acknowledge as u8 => Ok(IncomingMessage::Acknowledge),
            tag if tag == MessageType::Broadcast as u8 => {
                Ok(IncomingMessage::Broadcast(body.to_vec()))
            }
            tag => Err(Error::with_details(
                ErrorKind::DeserializeMsgFailed,
                format!("Unknown message type {tag}"),
            )),
        }
    }
}
