//! Access-log streams.
//!
//! A stream is the pluggable sink AccessRecords are emitted to before the
//! decision returns to the caller. Implementations must tolerate
//! concurrent `send`; send failures are logged by the engine and never
//! influence the decision.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::record::AccessRecord;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream closed")]
    Closed,

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait AccessLogStream: Send + Sync {
    async fn send(&self, record: &AccessRecord) -> Result<(), StreamError>;

    async fn close(&self);
}

/// Constructs streams for the engine.
pub trait StreamFactory: Send + Sync {
    fn new_stream(&self) -> Arc<dyn AccessLogStream>;
}

impl<F> StreamFactory for F
where
    F: Fn() -> Arc<dyn AccessLogStream> + Send + Sync,
{
    fn new_stream(&self) -> Arc<dyn AccessLogStream> {
        self()
    }
}

/// One JSON line per record on stdout.
pub struct StdoutStream {
    out: Mutex<tokio::io::Stdout>,
}

impl StdoutStream {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutStream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccessLogStream for StdoutStream {
    async fn send(&self, record: &AccessRecord) -> Result<(), StreamError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        if let Ok(mut out) = self.out.try_lock() {
            let _ = out.flush().await;
        }
    }
}

#[derive(Default)]
pub struct StdoutStreamFactory;

impl StreamFactory for StdoutStreamFactory {
    fn new_stream(&self) -> Arc<dyn AccessLogStream> {
        Arc::new(StdoutStream::new())
    }
}

/// Discards every record.
#[derive(Default)]
pub struct NullStream;

#[async_trait]
impl AccessLogStream for NullStream {
    async fn send(&self, _record: &AccessRecord) -> Result<(), StreamError> {
        Ok(())
    }

    async fn close(&self) {}
}

#[derive(Default)]
pub struct NullStreamFactory;

impl StreamFactory for NullStreamFactory {
    fn new_stream(&self) -> Arc<dyn AccessLogStream> {
        Arc::new(NullStream)
    }
}

/// Forwards records over a bounded channel, e.g. to a batching exporter or
/// a test harness.
pub struct ChannelStream {
    tx: mpsc::Sender<AccessRecord>,
}

#[async_trait]
impl AccessLogStream for ChannelStream {
    async fn send(&self, record: &AccessRecord) -> Result<(), StreamError> {
        self.tx
            .send(record.clone())
            .await
            .map_err(|_| StreamError::Closed)
    }

    async fn close(&self) {
        debug!("Channel stream closed");
    }
}

pub struct ChannelStreamFactory {
    tx: mpsc::Sender<AccessRecord>,
}

impl ChannelStreamFactory {
    /// The receiver half is handed to the consumer; every stream built by
    /// this factory feeds the same channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AccessRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl StreamFactory for ChannelStreamFactory {
    fn new_stream(&self) -> Arc<dyn AccessLogStream> {
        Arc::new(ChannelStream {
            tx: self.tx.clone(),
        })
    }
}
