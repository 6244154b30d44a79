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

//! Generic reconciliation engine: work queue, informer cache, and the
//! controller runtime that multiplexes worker tasks across them.

pub mod informer;
pub mod queue;
pub mod runtime;

pub use informer::{DeletedObject, Informer, ResourceEventHandler};
pub use queue::{default_rate_limiter, RateLimiter, WorkQueue};
pub use runtime::{
    noop_start_cache, Controller, ControllerError, ControllerHandler, ControllerOptions,
    HandlerFuture, StartCacheFuture, CONFLICT_RETRY_MESSAGE,
};

/// Access to the declarative metadata the engine needs from any resource it
/// reconciles.
pub trait Resource: Clone + Send + Sync + 'static {
    fn name(&self) -> &str;
    fn namespace(&self) -> Option<&str>;
    fn resource_version(&self) -> &str;

    /// Canonical work-queue key: `namespace/name`, or `name` when the
    /// resource is unnamespaced.
    fn key(&self) -> String {
        resource_key(self.namespace(), self.name())
    }
}

pub fn resource_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name.to_string(),
    }
}

/// Splits a work-queue key back into `(namespace, name)`.
pub fn split_key(key: &str) -> (Option<&str>, &str) {
    match key.split_once('/') {
        Some((namespace, name)) => (Some(namespace), name),
        None => (None, key),
    }
}
