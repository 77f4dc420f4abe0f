//! Length-preserving asynchronous byte transport.
//!
//! [`TransportIo`] is the seam between the generic transport logic and the
//! actual byte source (a TCP socket in production, an in-memory pipe in
//! tests). [`Transport`] layers the per-direction inactivity timeout, the
//! transceive byte limit and the close cascade on top: any error or timeout
//! shuts the underlying socket down exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use yogi_logger::debug;
use yogi_primitives::Duration;

use crate::context::ContextPtr;
use crate::errors::{Error, ErrorKind, Result};

/// The byte-level capabilities a concrete transport must provide.
#[async_trait]
pub trait TransportIo: Send + Sync + 'static {
    /// Writes some prefix of `data`; returns the number of bytes written.
    async fn write_some(&self, data: &[u8]) -> Result<usize>;

    /// Reads some bytes into `buffer`; returns the number of bytes read.
    async fn read_some(&self, buffer: &mut [u8]) -> Result<usize>;

    /// Shuts the byte source down, waking pending operations.
    fn shutdown(&self);
}

/// A connected transport with timeout and chunking semantics.
pub struct Transport {
    context: ContextPtr,
    io: Box<dyn TransportIo>,
    timeout: Duration,
    created_from_incoming: bool,
    peer_description: String,
    transceive_byte_limit: usize,
    closed: AtomicBool,
}

pub type TransportPtr = Arc<Transport>;

impl Transport {
    pub fn new(
        context: ContextPtr,
        io: Box<dyn TransportIo>,
        timeout: Duration,
        created_from_incoming: bool,
        peer_description: String,
        transceive_byte_limit: Option<usize>,
    ) -> TransportPtr {
        Arc::new(Transport {
            context,
            io,
            timeout,
            created_from_incoming,
            peer_description,
            transceive_byte_limit: transceive_byte_limit.unwrap_or(usize::MAX),
            closed: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &ContextPtr {
        &self.context
    }

    pub fn peer_description(&self) -> &str {
        &self.peer_description
    }

    pub fn created_from_incoming(&self) -> bool {
        self.created_from_incoming
    }

    /// Sends some prefix of `data`, at most the transceive byte limit.
    pub async fn send_some(&self, data: &[u8]) -> Result<usize> {
        debug_assert!(!data.is_empty());
        let chunk = &data[..data.len().min(self.transceive_byte_limit)];
        self.transfer(self.io.write_some(chunk)).await
    }

    /// Sends all of `data`.
    pub async fn send_all(&self, data: &[u8]) -> Result<()> {
        let mut sent = 0;
        while sent < data.len() {
            sent += self.send_some(&data[sent..]).await?;
        }
        Ok(())
    }

    /// Receives some bytes, at most the transceive byte limit.
    pub async fn receive_some(&self, buffer: &mut [u8]) -> Result<usize> {
        debug_assert!(!buffer.is_empty());
        let limit = buffer.len().min(self.transceive_byte_limit);
        self.transfer(self.io.read_some(&mut buffer[..limit])).await
    }

    /// Fills all of `buffer`.
    pub async fn receive_all(&self, buffer: &mut [u8]) -> Result<()> {
        let mut received = 0;
        while received < buffer.len() {
            received += self.receive_some(&mut buffer[received..]).await?;
        }
        Ok(())
    }

    /// Applies the inactivity timeout and the close cascade to one transfer.
    async fn transfer<F>(&self, op: F) -> Result<usize>
    where
        F: std::future::Future<Output = Result<usize>>,
    {
        let result = match self.timeout.to_std() {
            None => op.await,
            Some(timeout) => match tokio::time::timeout(timeout, op).await {
                Ok(result) => result,
                Err(_) => {
                    self.close();
                    return Err(Error::new(ErrorKind::Timeout));
                }
            },
        };

        if let Err(err) = &result {
            debug!(
                target: "yogi.transport",
                "Transfer to/from {} failed: {err}", self.peer_description
            );
            self.close();
        }

        result
    }

    /// Shuts the transport down; idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.io.shutdown();
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}
