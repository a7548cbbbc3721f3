// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Queue Implementation - Agent Progress Multiplexing
//
// Every agent in one composition writes progress events into a single
// shared queue. The coordinator drains it on a fixed polling interval,
// stamps each event with a sequence number and forwards it to the
// request's EventSink.
//
// Ordering: one emitter's events are dequeued in emission order; events of
// different emitters interleave freely. Consumers group by the envelope's
// instrument / section_id, never by arrival order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::events::{CompositionEvent, EventEnvelope, StepStatus};

/// An event as emitted by an agent, before the coordinator sequences it.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub timestamp: DateTime<Utc>,
    pub instrument: Option<String>,
    pub section_id: Option<String>,
    pub event: CompositionEvent,
}

/// Receiving half, owned by the coordinator.
pub struct EventQueue {
    receiver: mpsc::UnboundedReceiver<QueuedEvent>,
    sender: mpsc::UnboundedSender<QueuedEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self { receiver, sender }
    }

    /// Root emitter with no correlation fields.
    pub fn emitter(&self) -> EventEmitter {
        EventEmitter {
            sender: self.sender.clone(),
            instrument: None,
            section_id: None,
        }
    }

    /// Everything queued right now, without waiting.
    pub fn drain(&mut self) -> Vec<QueuedEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable sending half carrying correlation fields. Emitting never blocks
/// and never fails the caller: once the coordinator is gone, events are
/// dropped.
#[derive(Clone)]
pub struct EventEmitter {
    sender: mpsc::UnboundedSender<QueuedEvent>,
    instrument: Option<String>,
    section_id: Option<String>,
}

impl EventEmitter {
    pub fn for_instrument(&self, instrument: impl Into<String>) -> Self {
        Self {
            sender: self.sender.clone(),
            instrument: Some(instrument.into()),
            section_id: None,
        }
    }

    pub fn for_section(&self, section_id: impl Into<String>) -> Self {
        Self {
            sender: self.sender.clone(),
            instrument: self.instrument.clone(),
            section_id: Some(section_id.into()),
        }
    }

    pub fn emit(&self, event: CompositionEvent) {
        let queued = QueuedEvent {
            timestamp: Utc::now(),
            instrument: self.instrument.clone(),
            section_id: self.section_id.clone(),
            event,
        };
        if self.sender.send(queued).is_err() {
            debug!("Event queue closed, dropping event");
        }
    }

    pub fn status(&self, message: impl Into<String>) {
        self.emit(CompositionEvent::status(message));
    }

    pub fn step(&self, step_id: &str, label: &str, status: StepStatus) {
        self.emit(CompositionEvent::step(step_id, label, status));
    }

    pub fn step_with_detail(&self, step_id: &str, label: &str, status: StepStatus, detail: impl Into<String>) {
        self.emit(CompositionEvent::step_with_detail(step_id, label, status, detail));
    }
}

/// Errors that can occur when pushing events to a client
#[derive(Debug, thiserror::Error)]
pub enum EventSinkError {
    #[error("Event sink is closed")]
    Closed,

    #[error("Event sink error: {0}")]
    Other(String),
}

/// Ordered push channel to one client.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, envelope: EventEnvelope) -> Result<(), EventSinkError>;

    /// True once the client has gone away.
    fn is_closed(&self) -> bool;
}

/// Sink backed by a bounded mpsc channel. Dropping the receiver is treated as
/// a client disconnect.
#[derive(Clone)]
pub struct ChannelEventSink {
    sender: mpsc::Sender<EventEnvelope>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EventEnvelope>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, envelope: EventEnvelope) -> Result<(), EventSinkError> {
        self.sender
            .send(envelope)
            .await
            .map_err(|_| EventSinkError::Closed)
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
