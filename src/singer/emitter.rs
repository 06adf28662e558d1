use chrono::Utc;
use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::message::Message;
use crate::catalog::{Record, StreamDescriptor};
use crate::sync::StateDocument;
use crate::{Error, Result};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct Inner {
    writer: Writer,
    schemas_sent: HashSet<String>,
    records_written: u64,
}

/// Writes Singer messages through a single lock, in protocol order.
///
/// A RECORD for a stream whose SCHEMA was not written yet is rejected with
/// [`Error::Protocol`] and nothing is written. Every STATE is preceded by a
/// flush, so it never refers to records still sitting in a buffer.
pub struct Emitter {
    inner: Mutex<Inner>,
}

impl Emitter {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner {
                writer: Box::new(writer),
                schemas_sent: HashSet::new(),
                records_written: 0,
            }),
        }
    }

    /// Buffered stdout, the usual destination.
    pub fn stdout() -> Self {
        Self::new(tokio::io::BufWriter::new(tokio::io::stdout()))
    }

    pub async fn schema(&self, descriptor: &StreamDescriptor, bookmark_properties: Vec<String>) -> Result<()> {
        let message = Message::Schema {
            stream: &descriptor.name,
            schema: descriptor.json_schema(),
            key_properties: &descriptor.primary_key,
            bookmark_properties,
        };
        let mut inner = self.inner.lock().await;
        inner.write(&message).await?;
        inner.schemas_sent.insert(descriptor.name.clone());
        debug!("Sent SCHEMA for {}", descriptor.name);
        Ok(())
    }

    pub async fn record(&self, stream: &str, record: &Record, version: Option<u64>) -> Result<()> {
        let message = Message::Record {
            stream,
            record,
            version,
            time_extracted: Utc::now(),
        };
        let mut inner = self.inner.lock().await;
        inner.require_schema(stream, "RECORD")?;
        inner.write(&message).await?;
        inner.records_written += 1;
        Ok(())
    }

    pub async fn activate_version(&self, stream: &str, version: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.require_schema(stream, "ACTIVATE_VERSION")?;
        inner
            .write(&Message::ActivateVersion { stream, version })
            .await?;
        debug!("Sent ACTIVATE_VERSION {} for {}", version, stream);
        Ok(())
    }

    pub async fn state(&self, state: &StateDocument) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.writer.flush().await?;
        inner.write(&Message::State { value: state }).await?;
        inner.writer.flush().await?;
        trace!("Sent STATE after {} records", inner.records_written);
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.inner.lock().await.writer.flush().await?;
        Ok(())
    }

    pub async fn records_written(&self) -> u64 {
        self.inner.lock().await.records_written
    }
}

impl Inner {
    fn require_schema(&self, stream: &str, kind: &str) -> Result<()> {
        if self.schemas_sent.contains(stream) {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "{} for stream '{}' before its SCHEMA",
                kind, stream
            )))
        }
    }

    async fn write(&mut self, message: &Message<'_>) -> Result<()> {
        let line = message.to_line()?;
        self.writer.write_all(&line).await?;
        Ok(())
    }
}

/// In-memory sink whose contents stay readable while an [`Emitter`] owns
/// a handle to it.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<StdMutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        match self.bytes.lock() {
            Ok(bytes) => bytes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Parsed JSON lines written so far.
    pub fn messages(&self) -> serde_json::Result<Vec<serde_json::Value>> {
        self.contents()
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(serde_json::from_slice)
            .collect()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut bytes = self
            .bytes
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "buffer lock poisoned"))?;
        bytes.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
