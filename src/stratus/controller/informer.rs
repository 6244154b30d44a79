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

use crate::stratus::controller::Resource;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Deleted-object envelope. A delete notification normally carries the
/// object itself; when the watch missed the final state it carries a
/// tombstone holding the last known copy, which handlers must unwrap before
/// extracting the key.
#[derive(Clone, Debug)]
pub enum DeletedObject<T> {
    Object(T),
    Tombstone { key: String, object: T },
}

impl<T: Resource> DeletedObject<T> {
    pub fn key(&self) -> String {
        match self {
            DeletedObject::Object(obj) => obj.key(),
            DeletedObject::Tombstone { key, .. } => key.clone(),
        }
    }

    /// Unwraps the envelope to the last known object.
    pub fn into_object(self) -> T {
        match self {
            DeletedObject::Object(obj) => obj,
            DeletedObject::Tombstone { object, .. } => object,
        }
    }
}

/// Callbacks a consumer registers against the informer. Every field is
/// optional; unset callbacks ignore the corresponding notification.
pub struct ResourceEventHandler<T> {
    pub on_add: Option<Box<dyn Fn(&T) + Send + Sync>>,
    pub on_update: Option<Box<dyn Fn(&T, &T) + Send + Sync>>,
    pub on_delete: Option<Box<dyn Fn(&DeletedObject<T>) + Send + Sync>>,
}

impl<T> Default for ResourceEventHandler<T> {
    fn default() -> Self {
        Self {
            on_add: None,
            on_update: None,
            on_delete: None,
        }
    }
}

/// Keyed snapshot cache plus change notifications for one resource kind.
///
/// The feeding side (a store watch, or a test) publishes adds, updates, and
/// deletes; the cache always reflects the latest published object before
/// handlers run, so a handler looking up its key observes current state.
pub struct Informer<T> {
    inner: Arc<InformerInner<T>>,
}

impl<T> Clone for Informer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct InformerInner<T> {
    cache: RwLock<HashMap<String, T>>,
    handlers: RwLock<Vec<ResourceEventHandler<T>>>,
    synced: AtomicBool,
}

impl<T: Resource> Informer<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InformerInner {
                cache: RwLock::new(HashMap::new()),
                handlers: RwLock::new(Vec::new()),
                synced: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the cached object for the key, if any.
    pub fn get_by_key(&self, key: &str) -> Option<T> {
        let cache = self.inner.cache.read().expect("informer cache poisoned");
        cache.get(key).cloned()
    }

    /// True once the initial listing has been replayed into the cache.
    pub fn has_synced(&self) -> bool {
        self.inner.synced.load(Ordering::Acquire)
    }

    /// Marks the initial sync complete.
    pub fn mark_synced(&self) {
        self.inner.synced.store(true, Ordering::Release);
    }

    pub fn add_event_handler(&self, handler: ResourceEventHandler<T>) {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .expect("informer handlers poisoned");
        handlers.push(handler);
    }

    pub fn publish_add(&self, obj: T) {
        {
            let mut cache = self.inner.cache.write().expect("informer cache poisoned");
            cache.insert(obj.key(), obj.clone());
        }
        let handlers = self
            .inner
            .handlers
            .read()
            .expect("informer handlers poisoned");
        for handler in handlers.iter() {
            if let Some(on_add) = handler.on_add.as_ref() {
                on_add(&obj);
            }
        }
    }

    pub fn publish_update(&self, old: T, new: T) {
        {
            let mut cache = self.inner.cache.write().expect("informer cache poisoned");
            cache.insert(new.key(), new.clone());
        }
        let handlers = self
            .inner
            .handlers
            .read()
            .expect("informer handlers poisoned");
        for handler in handlers.iter() {
            if let Some(on_update) = handler.on_update.as_ref() {
                on_update(&old, &new);
            }
        }
    }

    pub fn publish_delete(&self, deleted: DeletedObject<T>) {
        {
            let mut cache = self.inner.cache.write().expect("informer cache poisoned");
            cache.remove(&deleted.key());
        }
        let handlers = self
            .inner
            .handlers
            .read()
            .expect("informer handlers poisoned");
        for handler in handlers.iter() {
            if let Some(on_delete) = handler.on_delete.as_ref() {
                on_delete(&deleted);
            }
        }
    }

    /// Replays a full listing into the cache and flips the synced flag.
    pub fn replay(&self, objects: Vec<T>) {
        for obj in objects {
            self.publish_add(obj);
        }
        self.mark_synced();
    }
}

impl<T: Resource> Default for Informer<T> {
    fn default() -> Self {
        Self::new()
    }
}
