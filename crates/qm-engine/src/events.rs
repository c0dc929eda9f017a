//! Allocation events and the outbound event sink
//!
//! Events are:
//! - Immutable records of a single request/grant transition
//! - Buffered locally and forwarded best-effort; the engine keeps no history
//! - Never allowed to block an allocation decision

use crate::model::{GrantId, PoolId, RejectReason, RequestId, RequesterId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Transition recorded by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Admitted,
    Queued,
    Rejected,
    Released,
    Expired,
}

/// A single allocation event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub request_id: RequestId,
    pub grant_id: Option<GrantId>,
    pub pool: PoolId,
    pub requester: RequesterId,
    pub amount: u64,
    /// Set for `Rejected`
    pub reason: Option<RejectReason>,
}

impl AllocationEvent {
    pub fn new(
        kind: EventKind,
        request_id: RequestId,
        pool: &PoolId,
        requester: &RequesterId,
        amount: u64,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            request_id,
            grant_id: None,
            pool: pool.clone(),
            requester: requester.clone(),
            amount,
            reason: None,
        }
    }

    pub fn with_grant(mut self, grant_id: GrantId) -> Self {
        self.grant_id = Some(grant_id);
        self
    }

    pub fn with_reason(mut self, reason: RejectReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn event_type(&self) -> &'static str {
        match self.kind {
            EventKind::Admitted => "allocation.admitted",
            EventKind::Queued => "allocation.queued",
            EventKind::Rejected => "allocation.rejected",
            EventKind::Released => "allocation.released",
            EventKind::Expired => "allocation.expired",
        }
    }
}

/// Sink delivery errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,
    #[error("sink backpressure")]
    Backpressure,
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Outbound consumer of allocation events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: AllocationEvent) -> Result<(), SinkError>;
}

/// Logs every event as a structured tracing record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn deliver(&self, event: AllocationEvent) -> Result<(), SinkError> {
        tracing::info!(
            target: "quartermaster::events",
            event = event.event_type(),
            request = %event.request_id,
            pool = %event.pool,
            requester = %event.requester,
            amount = event.amount,
            reason = ?event.reason,
            "allocation event"
        );
        Ok(())
    }
}

/// Forwards events into a bounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<AllocationEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AllocationEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&self, event: AllocationEvent) -> Result<(), SinkError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub buffered: usize,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Bounded drop-oldest buffer between the engine and its sink.
///
/// `emit` never blocks and never fails. A forwarder task (or an explicit
/// `flush`) hands buffered events to the sink; sink errors are logged and
/// counted, nothing more.
pub struct EventDispatcher {
    sink: Arc<dyn EventSink>,
    buffer: Mutex<VecDeque<AllocationEvent>>,
    capacity: usize,
    notify: Notify,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl EventDispatcher {
    pub fn new(sink: Arc<dyn EventSink>, capacity: usize) -> Self {
        Self {
            sink,
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Buffer an event, evicting the oldest one when full
    pub fn emit(&self, event: AllocationEvent) {
        {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= self.capacity {
                buffer.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(dropped, "event buffer full; dropping oldest events");
                }
            }
            buffer.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Deliver everything currently buffered. Returns the number of events
    /// handed to the sink (successfully or not).
    pub async fn flush(&self) -> usize {
        let batch: Vec<_> = self.buffer.lock().drain(..).collect();
        let count = batch.len();
        for event in batch {
            let event_type = event.event_type();
            match self.sink.deliver(event).await {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, event = event_type, "event sink delivery failed");
                }
            }
        }
        count
    }

    /// Forward events until `shutdown` flips to true, then flush once more
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.notify.notified() => {
                    self.flush().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.flush().await;
    }

    /// Spawn the forwarder on the current tokio runtime
    pub fn spawn(self: &Arc<Self>) -> ForwarderHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(self).run(rx));
        ForwarderHandle { shutdown, task }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            buffered: self.buffer.lock().len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Running forwarder task
pub struct ForwarderHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ForwarderHandle {
    /// Stop the forwarder after a final flush
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "event forwarder task failed");
        }
    }
}

/// In-memory sink for tests
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<AllocationEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn events(&self) -> Vec<AllocationEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventSink for RecordingSink {
    async fn deliver(&self, event: AllocationEvent) -> Result<(), SinkError> {
        self.events.lock().push(event);
        Ok(())
    }
}
