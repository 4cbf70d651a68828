//! One peer's duplex stream, adapted into the hub's message protocol.
//!
//! Reads happen only in [`read_pump`] and writes only in [`write_pump`], so a
//! connection never has more than one read and one write in flight. The hub
//! talks to the writer exclusively through the bounded [`Outbound`] queue.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{config::ConnectionConfig, hub::HubHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A signaling message as received from a peer. The relay never looks inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(Arc<str>),
    Binary(Bytes),
}

impl Payload {
    pub fn text(text: impl Into<Arc<str>>) -> Self {
        Payload::Text(text.into())
    }

    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Payload::Binary(bytes.into())
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }
}

/// Transport-level frame exchanged with the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Payload),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("outbound queue full")]
    Full,
    #[error("outbound queue closed")]
    Closed,
}

/// Producer side of a connection's outbound queue. Held only by the hub;
/// dropping it closes the queue and tells the writer to finish.
#[derive(Debug)]
pub struct Outbound {
    tx: mpsc::Sender<Payload>,
}

impl Outbound {
    /// Never waits: a full queue is reported instead of applying backpressure
    /// to the caller.
    pub fn try_enqueue(&self, payload: Payload) -> Result<(), EnqueueError> {
        self.tx.try_send(payload).map_err(|err| match err {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

/// Consumer side of the outbound queue, drained by the connection's writer.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Payload>,
    capacity: usize,
}

impl OutboundQueue {
    /// Waits for one payload, then takes whatever else is already queued
    /// without waiting. `None` once the queue is closed and drained.
    ///
    /// Cancel safe: the only await happens before anything is dequeued.
    pub async fn recv_batch(&mut self) -> Option<Vec<Payload>> {
        let first = self.rx.recv().await?;
        let mut batch = vec![first];
        while batch.len() < self.capacity {
            match self.rx.try_recv() {
                Ok(payload) => batch.push(payload),
                Err(_) => break,
            }
        }
        Some(batch)
    }
}

pub fn outbound_queue(capacity: usize) -> (Outbound, OutboundQueue) {
    let (tx, rx) = mpsc::channel(capacity);
    (Outbound { tx }, OutboundQueue { rx, capacity })
}

#[derive(Debug)]
pub enum PumpExit {
    /// The peer sent a close frame or the stream ended.
    Closed,
    Failed(TransportError),
}

/// Drives one connection until either pump stops.
///
/// Registers with the hub, spawns the writer, and reads in the current task.
/// When the reader stops first it evicts the connection; the writer then
/// drains whatever the hub already queued, sends a close frame, and stops.
/// When the writer stops first (write failure, or the hub evicted the
/// connection) reading stops too and both halves of the transport are
/// dropped.
pub async fn run<R, W>(
    id: ConnectionId,
    reader: R,
    writer: W,
    hub: HubHandle,
    config: ConnectionConfig,
) -> PumpExit
where
    R: Stream<Item = Result<Frame, TransportError>> + Unpin,
    W: Sink<Frame, Error = TransportError> + Unpin + Send + 'static,
{
    let (outbound, queue) = outbound_queue(config.outbound_capacity);
    hub.admit(id, outbound).await;

    let writer_config = config.clone();
    let mut writer_task =
        tokio::spawn(async move { write_pump(id, writer, queue, &writer_config).await });

    let reading = read_pump(id, reader, &hub, &config);
    tokio::pin!(reading);

    tokio::select! {
        exit = &mut reading => {
            match timeout(config.write_wait, &mut writer_task).await {
                Ok(Ok(Ok(()))) => debug!(connection_id = %id, "writer finished"),
                Ok(Ok(Err(err))) => debug!(connection_id = %id, error = %err, "writer stopped"),
                Ok(Err(err)) => warn!(connection_id = %id, error = %err, "writer task failed"),
                Err(_) => {
                    writer_task.abort();
                    debug!(connection_id = %id, "writer still busy after reader exit; aborted");
                }
            }
            exit
        }
        joined = &mut writer_task => {
            // The reader never finished, so it has not evicted. Evict is a
            // no-op when the hub already dropped the connection.
            hub.evict(id).await;
            match joined {
                Ok(Ok(())) => {
                    debug!(connection_id = %id, "evicted by hub; reader stopped");
                    PumpExit::Closed
                }
                Ok(Err(err)) => {
                    debug!(connection_id = %id, error = %err, "writer failed; reader stopped");
                    PumpExit::Failed(err)
                }
                Err(err) => {
                    warn!(connection_id = %id, error = %err, "writer task failed");
                    PumpExit::Failed(TransportError::Write(err.to_string()))
                }
            }
        }
    }
}

/// Forwards every data frame to the hub, unmodified and in arrival order.
///
/// Any frame (data, ping or pong) resets the read deadline. Oversized
/// payloads, stream errors and deadline expiry end the pump; in every case
/// the connection is evicted exactly once before returning.
pub async fn read_pump<R>(
    id: ConnectionId,
    mut reader: R,
    hub: &HubHandle,
    config: &ConnectionConfig,
) -> PumpExit
where
    R: Stream<Item = Result<Frame, TransportError>> + Unpin,
{
    let exit = loop {
        let frame = match timeout(config.pong_wait, reader.next()).await {
            Err(_) => break PumpExit::Failed(TransportError::ReadTimeout(config.pong_wait)),
            Ok(None) => break PumpExit::Closed,
            Ok(Some(Err(err))) => break PumpExit::Failed(err),
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Frame::Data(payload) => {
                if payload.len() > config.max_message_bytes {
                    break PumpExit::Failed(TransportError::PayloadTooLarge {
                        size: payload.len(),
                        limit: config.max_message_bytes,
                    });
                }
                trace!(connection_id = %id, bytes = payload.len(), "payload received");
                hub.dispatch(payload).await;
            }
            Frame::Ping(_) | Frame::Pong(_) => {
                trace!(connection_id = %id, "liveness frame received");
            }
            Frame::Close => {
                debug!(connection_id = %id, "peer sent close frame");
                break PumpExit::Closed;
            }
        }
    };

    match &exit {
        PumpExit::Closed => debug!(connection_id = %id, "reader finished"),
        PumpExit::Failed(err) => debug!(connection_id = %id, error = %err, "reader stopped"),
    }
    hub.evict(id).await;
    exit
}

/// Drains the outbound queue to the peer and sends heartbeats.
///
/// Payloads already waiting are fed together and flushed once; each one is
/// still its own frame on the wire. Every write is bounded by the write
/// deadline and any failure ends the pump. When the hub closes the queue a
/// final close frame is attempted once.
pub async fn write_pump<W>(
    id: ConnectionId,
    mut writer: W,
    mut queue: OutboundQueue,
    config: &ConnectionConfig,
) -> Result<(), TransportError>
where
    W: Sink<Frame, Error = TransportError> + Unpin,
{
    let period = config.ping_period();
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            batch = queue.recv_batch() => match batch {
                Some(batch) => {
                    trace!(connection_id = %id, payloads = batch.len(), "writing batch");
                    bounded(config.write_wait, write_batch(&mut writer, batch)).await?;
                }
                None => {
                    if let Err(err) = bounded(config.write_wait, writer.send(Frame::Close)).await {
                        trace!(connection_id = %id, error = %err, "close frame not delivered");
                    }
                    return Ok(());
                }
            },
            _ = heartbeat.tick() => {
                trace!(connection_id = %id, "sending heartbeat");
                bounded(config.write_wait, writer.send(Frame::Ping(Bytes::new()))).await?;
            }
        }
    }
}

async fn write_batch<W>(writer: &mut W, batch: Vec<Payload>) -> Result<(), TransportError>
where
    W: Sink<Frame, Error = TransportError> + Unpin,
{
    for payload in batch {
        writer.feed(Frame::Data(payload)).await?;
    }
    writer.flush().await
}

async fn bounded<F>(deadline: Duration, write: F) -> Result<(), TransportError>
where
    F: std::future::Future<Output = Result<(), TransportError>>,
{
    timeout(deadline, write)
        .await
        .map_err(|_| TransportError::WriteTimeout(deadline))?
}
