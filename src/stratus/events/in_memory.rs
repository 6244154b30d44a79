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

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::{
    EventEnvelope, EventPublisher, EventSubscriber, PublishFuture, Subscription,
    SubscriptionOptions,
};

#[derive(Debug)]
pub enum InMemoryBusError {
    ChannelClosed,
    Lagged(u64),
}

impl fmt::Display for InMemoryBusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InMemoryBusError::ChannelClosed => write!(f, "event channel closed"),
            InMemoryBusError::Lagged(count) => {
                write!(f, "subscriber lagged by {count} messages")
            }
        }
    }
}

impl std::error::Error for InMemoryBusError {}

/// Broadcast-backed event bus, one channel per resource kind.
pub struct InMemoryEventBus {
    kinds: Mutex<HashMap<String, broadcast::Sender<EventEnvelope>>>,
    capacity: usize,
}

impl InMemoryEventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            kinds: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn global() -> Arc<Self> {
        static INSTANCE: OnceLock<Arc<InMemoryEventBus>> = OnceLock::new();
        INSTANCE
            .get_or_init(|| Arc::new(InMemoryEventBus::new(1024)))
            .clone()
    }

    fn sender_for(&self, kind: &str) -> broadcast::Sender<EventEnvelope> {
        let mut kinds = self.kinds.lock().expect("event bus kinds lock poisoned");
        kinds
            .entry(kind.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl EventPublisher for InMemoryEventBus {
    type Error = InMemoryBusError;

    fn publish<'a>(&'a self, event: EventEnvelope) -> PublishFuture<'a, Self::Error> {
        let sender = self.sender_for(&event.object.kind);
        Box::pin(async move {
            // A send only fails when no subscriber exists, which is fine for
            // fire-and-forget recording.
            let _ = sender.send(event);
            Ok(())
        })
    }
}

impl EventSubscriber for InMemoryEventBus {
    type Error = InMemoryBusError;

    fn subscribe(
        &self,
        kind: &str,
        _options: SubscriptionOptions,
    ) -> Result<Subscription<Self::Error>, Self::Error> {
        let sender = self.sender_for(kind);
        let receiver = sender.subscribe();

        let stream = BroadcastStream::new(receiver).map(|result| match result {
            Ok(envelope) => Ok(envelope),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                Err(InMemoryBusError::Lagged(skipped))
            }
        });

        Ok(Subscription {
            stream: Box::pin(stream),
        })
    }
}
