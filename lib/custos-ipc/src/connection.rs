use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use custos_core::{collections::FastHashMap, task::spawn_traced_named};
use futures::{SinkExt, StreamExt as _};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    sync::{mpsc, oneshot},
};
use tokio_util::{
    codec::{BytesCodec, FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, trace, warn};

use crate::{FrameDecoder, IpcError, Message, MessageCodec, MessageKind};

type PendingCalls = Arc<Mutex<FastHashMap<u64, oneshot::Sender<Message>>>>;

fn lock_pending(pending: &PendingCalls) -> MutexGuard<'_, FastHashMap<u64, oneshot::Sender<Message>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A multiplexed message connection.
///
/// Outgoing calls are matched to their replies by correlation identifier, so any number of calls can be outstanding at
/// once, and replies may arrive in any order. Calls and casts sent by the peer are delivered through the [`Incoming`]
/// half returned alongside the connection.
///
/// Messages are encoded before they are queued for writing, so a message that cannot be encoded, or that exceeds the
/// maximum frame length, fails only the call or cast that sent it. Likewise, a received frame that cannot be decoded is
/// dropped, and the connection keeps reading.
///
/// Cloning a `Connection` yields another handle to the same underlying stream. The connection closes once the peer
/// closes its end, an I/O error occurs, the peer sends a frame over the maximum frame length, or
/// [`close`][Connection::close] is called.
#[derive(Clone)]
pub struct Connection {
    name: Arc<str>,
    codec: MessageCodec,
    outbound: mpsc::UnboundedSender<Bytes>,
    pending: PendingCalls,
    next_correlation_id: Arc<AtomicU64>,
    closed: CancellationToken,
}

/// Calls and casts received from the peer of a [`Connection`].
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Incoming {
    /// Receives the next call or cast sent by the peer.
    ///
    /// Returns `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Connection {
    /// Creates a connection over the given stream halves, using the default codec.
    ///
    /// Must be called from within a Tokio runtime, as the reader and writer run as background tasks.
    pub fn spawn<R, W>(name: &str, reader: R, writer: W) -> (Self, Incoming)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn_with_codec(name, reader, writer, MessageCodec::new())
    }

    /// Creates a connection over the given stream halves, using the given codec.
    ///
    /// Must be called from within a Tokio runtime, as the reader and writer run as background tasks.
    pub fn spawn_with_codec<R, W>(name: &str, reader: R, writer: W, codec: MessageCodec) -> (Self, Incoming)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let pending = PendingCalls::default();
        let closed = CancellationToken::new();

        let framed_read = FramedRead::new(reader, FrameDecoder::new(codec.clone()));
        let framed_write = FramedWrite::new(writer, BytesCodec::new());

        spawn_traced_named(
            format!("ipc-reader-{}", name),
            run_reader(framed_read, incoming_tx, Arc::clone(&pending), closed.clone()),
        );
        spawn_traced_named(
            format!("ipc-writer-{}", name),
            run_writer(framed_write, outbound_rx, closed.clone()),
        );

        let connection = Self {
            name: name.into(),
            codec,
            outbound: outbound_tx,
            pending,
            next_correlation_id: Arc::new(AtomicU64::new(1)),
            closed,
        };
        (connection, Incoming { rx: incoming_rx })
    }

    /// Returns the name of the connection.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends a call and waits up to `timeout` for its reply.
    ///
    /// # Errors
    ///
    /// If the call cannot be encoded, the connection is closed before the reply arrives, no reply arrives within
    /// `timeout`, or the peer replies with an error, an error is returned.
    pub async fn call(&self, payload: Value, timeout: Duration) -> Result<Value, IpcError> {
        if self.is_closed() {
            return Err(IpcError::ConnectionClosed);
        }

        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let frame = self.codec.encode_frame(&Message::call(correlation_id, payload))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        lock_pending(&self.pending).insert(correlation_id, reply_tx);

        if self.outbound.send(frame).is_err() {
            lock_pending(&self.pending).remove(&correlation_id);
            return Err(IpcError::ConnectionClosed);
        }
        trace!(connection = %self.name, correlation_id, "Sent call.");

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => match reply.kind {
                MessageKind::Error => Err(IpcError::Remote {
                    message: match reply.payload {
                        Value::String(message) => message,
                        other => other.to_string(),
                    },
                }),
                _ => Ok(reply.payload),
            },
            Ok(Err(_)) => Err(IpcError::ConnectionClosed),
            Err(_) => {
                // A late reply for this identifier is dropped by the reader.
                lock_pending(&self.pending).remove(&correlation_id);
                debug!(connection = %self.name, correlation_id, ?timeout, "Call timed out.");
                Err(IpcError::Timeout { timeout })
            }
        }
    }

    /// Sends a cast.
    ///
    /// # Errors
    ///
    /// If the cast cannot be encoded, or the connection is closed, an error is returned.
    pub fn cast(&self, payload: Value) -> Result<(), IpcError> {
        self.send(Message::cast(payload))
    }

    /// Answers a call received from the peer.
    ///
    /// # Errors
    ///
    /// If the reply cannot be encoded, or the connection is closed, an error is returned.
    pub fn reply(&self, correlation_id: u64, result: Result<Value, String>) -> Result<(), IpcError> {
        self.send(match result {
            Ok(payload) => Message::response(correlation_id, payload),
            Err(message) => Message::error(correlation_id, message),
        })
    }

    fn send(&self, message: Message) -> Result<(), IpcError> {
        if self.is_closed() {
            return Err(IpcError::ConnectionClosed);
        }

        let frame = self.codec.encode_frame(&message)?;
        self.outbound.send(frame).map_err(|_| IpcError::ConnectionClosed)
    }

    /// Returns the number of calls awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Returns `true` if the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Waits until the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Closes the connection.
    ///
    /// Messages already handed to the connection are still written before the stream is shut down. Calls awaiting a
    /// reply fail.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

async fn run_reader<R>(
    mut framed: FramedRead<R, FrameDecoder>, incoming_tx: mpsc::UnboundedSender<Message>, pending: PendingCalls,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = select! {
            _ = closed.cancelled() => break,
            next = framed.next() => next,
        };

        match next {
            Some(Ok(Ok(message))) if message.is_reply() => {
                let reply_tx = lock_pending(&pending).remove(&message.correlation_id);
                match reply_tx {
                    Some(reply_tx) => {
                        let _ = reply_tx.send(message);
                    }
                    None => {
                        warn!(correlation_id = message.correlation_id, "Received reply with unknown correlation ID. Dropping.")
                    }
                }
            }
            Some(Ok(Ok(message))) => {
                // Nobody is listening for incoming messages, which is fine for connections that only make calls.
                let _ = incoming_tx.send(message);
            }
            Some(Ok(Err(e))) => {
                // The frame was consumed whole, so the next one can still be read. A call waiting on a reply that was
                // dropped here fails with a timeout.
                warn!(error = %e, "Dropping malformed frame.");
            }
            Some(Err(e)) => {
                warn!(error = %e, "Failed to read from connection. Closing.");
                break;
            }
            None => {
                debug!("Peer closed connection.");
                break;
            }
        }
    }

    closed.cancel();

    // Dropping the reply senders fails every outstanding call.
    lock_pending(&pending).clear();
}

async fn run_writer<W>(
    mut framed: FramedWrite<W, BytesCodec>, mut outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = select! {
            biased;

            frame = outbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = closed.cancelled() => {
                // Flush whatever was queued before the connection was closed.
                while let Ok(frame) = outbound_rx.try_recv() {
                    if framed.feed(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };

        if let Err(e) = framed.send(frame).await {
            warn!(error = %e, "Failed to write to connection. Closing.");
            closed.cancel();
            break;
        }
    }

    let _ = SinkExt::<Bytes>::flush(&mut framed).await;
    let _ = SinkExt::<Bytes>::close(&mut framed).await;
}
