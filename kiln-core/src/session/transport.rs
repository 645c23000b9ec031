//! Newline-delimited JSON RPC substrate.
//!
//! The session layer only sees the `RpcChannel` / `RpcHandler` seams; the
//! wire format below them is an implementation detail. One frame per line:
//! requests carry `{"id", "method", "args"}`, responses `{"id", "result"}`
//! or `{"id", "error"}`.

use crate::error::{KilnError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

/// An established bidirectional RPC handle.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Invoke a named remote procedure and await its acknowledgement.
    ///
    /// There is no built-in deadline; transport teardown is the only thing
    /// that unblocks a caller whose peer vanished, resolving the call with
    /// `ConnectionClosed`.
    async fn call(&self, method: &str, args: Value) -> Result<Value>;

    /// Close the transport. Idempotent: a second close is a no-op. Every
    /// call pending at close time resolves with `ConnectionClosed`.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Handler for calls arriving from the remote peer.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, method: &str, args: Value) -> Result<Value>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Frame {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        args: Value,
    },
    Response {
        id: u64,
        result: Value,
    },
    Error {
        id: u64,
        error: String,
    },
}

struct ChannelInner {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl ChannelInner {
    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(KilnError::ConnectionClosed);
        };
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| KilnError::Transport(e.to_string()))?;
        Ok(())
    }

    fn complete(&self, id: u64, result: Result<Value>) {
        let sender = self.pending.lock().unwrap().remove(&id);
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }

    /// Mark the channel closed and fail every pending call. Safe to call
    /// more than once.
    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let pending: Vec<_> = {
            let mut map = self.pending.lock().unwrap();
            map.drain().collect()
        };
        for (_, sender) in pending {
            let _ = sender.send(Err(KilnError::ConnectionClosed));
        }
        self.closed_notify.notify_waiters();
    }
}

/// `RpcChannel` over a TCP stream with line-delimited JSON frames.
pub struct JsonChannel {
    inner: Arc<ChannelInner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl JsonChannel {
    /// Wrap an accepted or dialed stream, dispatching inbound calls to
    /// `handler`.
    pub fn from_stream(stream: TcpStream, handler: Arc<dyn RpcHandler>) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let inner = Arc::new(ChannelInner {
            writer: tokio::sync::Mutex::new(Some(write_half)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        });
        let reader = tokio::spawn(reader_loop(read_half, inner.clone(), handler));
        Arc::new(Self {
            inner,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub async fn connect(addr: &str, handler: Arc<dyn RpcHandler>) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| KilnError::Transport(format!("connect {}: {}", addr, e)))?;
        Ok(Self::from_stream(stream, handler))
    }

    /// Resolve once the channel has closed, whichever side initiated it.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.inner.closed_notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent close
            // cannot slip between the check and the await.
            notified.as_mut().enable();
            if self.inner.closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl RpcChannel for JsonChannel {
    async fn call(&self, method: &str, args: Value) -> Result<Value> {
        if self.is_closed() {
            return Err(KilnError::ConnectionClosed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id, tx);

        let frame = Frame::Request {
            id,
            method: method.to_string(),
            args,
        };
        if let Err(e) = self.inner.write_frame(&frame).await {
            self.inner.pending.lock().unwrap().remove(&id);
            return Err(e);
        }

        // A dropped sender means the pending map was drained at teardown.
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(KilnError::ConnectionClosed),
        }
    }

    async fn close(&self) {
        self.inner.shutdown().await;
        let reader = self.reader.lock().unwrap().take();
        if let Some(reader) = reader {
            reader.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

async fn reader_loop(
    read_half: OwnedReadHalf,
    inner: Arc<ChannelInner>,
    handler: Arc<dyn RpcHandler>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Frame>(&line) {
                    Ok(Frame::Request { id, method, args }) => {
                        let inner = inner.clone();
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            let frame = match handler.handle(&method, args).await {
                                Ok(result) => Frame::Response { id, result },
                                Err(e) => Frame::Error {
                                    id,
                                    error: e.to_string(),
                                },
                            };
                            if let Err(e) = inner.write_frame(&frame).await {
                                tracing::debug!("dropping response for call {}: {}", id, e);
                            }
                        });
                    }
                    Ok(Frame::Response { id, result }) => inner.complete(id, Ok(result)),
                    Ok(Frame::Error { id, error }) => {
                        inner.complete(id, Err(KilnError::Transport(error)));
                    }
                    Err(e) => {
                        tracing::warn!("ignoring malformed frame: {}", e);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("transport read failed: {}", e);
                break;
            }
        }
    }
    inner.shutdown().await;
}
