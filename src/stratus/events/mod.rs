/*
 * Copyright (C) 2025 The Stratus Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::stratus::logger::log_warn;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub mod in_memory;

pub use in_memory::InMemoryEventBus;

const COMPONENT: &str = "events";

pub type PublishFuture<'a, E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send + 'a>>;
pub type EventStream<E> = BoxStream<'static, Result<EventEnvelope, E>>;

/// Reference to the object an event is about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectReference {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// The human-readable event kinds the instance reconciler emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventReason {
    Start,
    Stop,
    FailedStarting,
    FailedStopping,
}

impl EventReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EventReason::Start => "Start",
            EventReason::Stop => "Stop",
            EventReason::FailedStarting => "FailedStarting",
            EventReason::FailedStopping => "FailedStopping",
        }
    }
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct EventEnvelope {
    pub object: ObjectReference,
    pub event_type: EventType,
    pub reason: EventReason,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(
        object: ObjectReference,
        event_type: EventType,
        reason: EventReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            object,
            event_type,
            reason,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

pub trait EventPublisher {
    type Error;

    fn publish<'a>(&'a self, event: EventEnvelope) -> PublishFuture<'a, Self::Error>;
}

#[derive(Clone, Debug, Default)]
pub struct SubscriptionOptions;

pub struct Subscription<E> {
    pub stream: EventStream<E>,
}

pub trait EventSubscriber {
    type Error;

    fn subscribe(
        &self,
        kind: &str,
        options: SubscriptionOptions,
    ) -> Result<Subscription<Self::Error>, Self::Error>;
}

/// Emits reconciler lifecycle events. Publishing is best effort: a full or
/// closed bus is logged, never surfaced to the reconcile path.
#[derive(Clone)]
pub struct EventRecorder {
    bus: Arc<InMemoryEventBus>,
}

impl EventRecorder {
    pub fn new(bus: Arc<InMemoryEventBus>) -> Self {
        Self { bus }
    }

    pub async fn normal(&self, object: ObjectReference, reason: EventReason, message: String) {
        self.record(EventEnvelope::new(object, EventType::Normal, reason, message))
            .await;
    }

    pub async fn warning(&self, object: ObjectReference, reason: EventReason, message: String) {
        self.record(EventEnvelope::new(
            object,
            EventType::Warning,
            reason,
            message,
        ))
        .await;
    }

    async fn record(&self, event: EventEnvelope) {
        let reason = event.reason;
        let name = event.object.name.clone();
        if let Err(err) = self.bus.publish(event).await {
            log_warn(
                COMPONENT,
                "failed to record event",
                &[
                    ("reason", reason.as_str()),
                    ("object", name.as_str()),
                    ("error", err.to_string().as_str()),
                ],
            );
        }
    }
}
