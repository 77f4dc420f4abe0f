//! User payloads.
//!
//! A payload is user data in JSON or MessagePack form. The wire encoding is
//! always MessagePack; JSON input is converted on send and the receive side
//! re-encodes into whatever the receiver asked for.

use serde::de::IgnoredAny;
use serde_json::Value;

use crate::errors::{Error, ErrorKind, Result};

/// Encoding of user payload data.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Encoding {
    Json,
    Msgpack,
}

/// A borrowed user payload plus its encoding.
#[derive(Clone, Copy, Debug)]
pub struct Payload<'a> {
    data: &'a [u8],
    encoding: Encoding,
}

impl<'a> Payload<'a> {
    pub fn new(data: &'a [u8], encoding: Encoding) -> Payload<'a> {
        Payload { data, encoding }
    }

    /// Payload for a JSON value.
    pub fn from_json_str(json: &'a str) -> Payload<'a> {
        Payload {
            data: json.as_bytes(),
            encoding: Encoding::Json,
        }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Validates the payload and appends its MessagePack form to `buffer`.
    pub fn serialize_to(&self, buffer: &mut Vec<u8>) -> Result<()> {
        if self.data.is_empty() {
            return Ok(());
        }

        match self.encoding {
            Encoding::Json => {
                let msgpack = json_to_msgpack(self.data)?;
                buffer.extend_from_slice(&msgpack);
            }
            Encoding::Msgpack => {
                check_valid_msgpack(self.data)?;
                buffer.extend_from_slice(self.data);
            }
        }

        Ok(())
    }

    /// Re-encodes the payload into `buffer` using the requested encoding.
    ///
    /// `bytes_written` receives the number of bytes copied. If the buffer is
    /// too small the data is truncated (JSON keeps a terminating NUL in the
    /// last byte) and `BufferTooSmall` is returned.
    pub fn serialize_to_user_buffer(
        &self,
        buffer: &mut [u8],
        encoding: Encoding,
        bytes_written: &mut usize,
    ) -> Result<()> {
        let converted;
        let src: &[u8] = if encoding == self.encoding {
            self.data
        } else {
            match encoding {
                Encoding::Json => {
                    let json = msgpack_to_json(self.data)?;
                    let mut text = json.to_string().into_bytes();
                    text.push(0);
                    converted = text;
                    &converted
                }
                Encoding::Msgpack => {
                    converted = json_to_msgpack(self.data)?;
                    &converted
                }
            }
        };

        let n = src.len().min(buffer.len());
        buffer[..n].copy_from_slice(&src[..n]);
        *bytes_written = n;

        if n < src.len() {
            if encoding == Encoding::Json && !buffer.is_empty() {
                buffer[n - 1] = 0;
            }
            return Err(Error::with_details(
                ErrorKind::BufferTooSmall,
                format!("Payload is {} bytes", src.len()),
            ));
        }

        Ok(())
    }
}

/// Parses JSON (an optional trailing NUL is tolerated) and re-encodes it as
/// MessagePack.
fn json_to_msgpack(data: &[u8]) -> Result<Vec<u8>> {
    let data = match data.split_last() {
        Some((0, rest)) => rest,
        _ => data,
    };

    let json: Value = serde_json::from_slice(data)
        .map_err(|e| Error::with_details(ErrorKind::ParsingJsonFailed, e.to_string()))?;

    rmp_serde::to_vec(&json)
        .map_err(|e| Error::with_details(ErrorKind::ParsingJsonFailed, e.to_string()))
}

fn msgpack_to_json(data: &[u8]) -> Result<Value> {
    rmp_serde::from_slice(data)
        .map_err(|e| Error::with_details(ErrorKind::InvalidUserMsgpack, e.to_string()))
}

fn check_valid_msgpack(data: &[u8]) -> Result<()> {
    rmp_serde::from_slice::<IgnoredAny>(data)
        .map(|_| ())
        .map_err(|e| Error::with_details(ErrorKind::InvalidUserMsgpack, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgpack_of(json: &str) -> Vec<u8> {
        let value: Value = serde_json::from_str(json).unwrap();
        rmp_serde::to_vec(&value).unwrap()
    }

    #[test]
    fn json_payload_serializes_as_msgpack() {
        let payload = Payload::from_json_str("[1,2,3]");
        let mut buffer = vec![0x02];
        payload.serialize_to(&mut buffer).unwrap();
        assert_eq!(&buffer[1..], msgpack_of("[1,2,3]"));
    }

    #[test]
    fn json_with_trailing_nul_is_accepted() {
        let payload = Payload::new(b"[1,2,3]\0", Encoding::Json);
        let mut buffer = Vec::new();
        payload.serialize_to(&mut buffer).unwrap();
        assert_eq!(buffer, msgpack_of("[1,2,3]"));
    }

    #[test]
    fn invalid_json_is_rejected() {
        let payload = Payload::from_json_str("[1,2");
        let mut buffer = Vec::new();
        let err = payload.serialize_to(&mut buffer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParsingJsonFailed);
    }

    #[test]
    fn invalid_msgpack_is_rejected() {
        let payload = Payload::new(&[0x91], Encoding::Msgpack);
        let mut buffer = Vec::new();
        let err = payload.serialize_to(&mut buffer).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidUserMsgpack);
    }

    #[test]
    fn round_trip_json_to_msgpack_to_json() {
        let original = r#"{"x":[1,2.5,"three"],"y":null,"z":true}"#;
        let wire = msgpack_of(original);

        let payload = Payload::new(&wire, Encoding::Msgpack);
        let mut buffer = vec![0u8; 256];
        let mut written = 0;
        payload
            .serialize_to_user_buffer(&mut buffer, Encoding::Json, &mut written)
            .unwrap();

        // JSON output carries a trailing NUL.
        assert_eq!(buffer[written - 1], 0);
        let json: Value = serde_json::from_slice(&buffer[..written - 1]).unwrap();
        assert_eq!(json, serde_json::from_str::<Value>(original).unwrap());
    }

    #[test]
    fn same_encoding_is_copied_verbatim() {
        let wire = msgpack_of("[1,2,3]");
        let payload = Payload::new(&wire, Encoding::Msgpack);

        let mut buffer = vec![0u8; 64];
        let mut written = 0;
        payload
            .serialize_to_user_buffer(&mut buffer, Encoding::Msgpack, &mut written)
            .unwrap();
        assert_eq!(&buffer[..written], &wire[..]);
    }

    #[test]
    fn truncated_json_keeps_terminating_nul() {
        let wire = msgpack_of(r#"{"key":"a rather long value"}"#);
        let payload = Payload::new(&wire, Encoding::Msgpack);

        let mut buffer = vec![0u8; 8];
        let mut written = 0;
        let err = payload
            .serialize_to_user_buffer(&mut buffer, Encoding::Json, &mut written)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::BufferTooSmall);
        assert_eq!(written, 8);
        assert_eq!(buffer[7], 0);
    }

    #[test]
    fn truncated_msgpack_reports_buffer_too_small() {
        let wire = msgpack_of("[1,2,3,4,5,6,7,8,9]");
        let payload = Payload::new(&wire, Encoding::Msgpack);

        let mut buffer = vec![0u8; 4];
        let mut written = 0;
        let err = payload
            .serialize_to_user_buffer(&mut buffer, Encoding::Msgpack, &mut written)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BufferTooSmall);
        assert_eq!(written, 4);
        assert_eq!(&buffer[..], &wire[..4]);
    }
}
