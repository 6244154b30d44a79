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

use crate::stratus::controller::informer::{DeletedObject, Informer, ResourceEventHandler};
use crate::stratus::controller::queue::{default_rate_limiter, RateLimiter, WorkQueue};
use crate::stratus::controller::{resource_key, Resource};
use crate::stratus::logger::{log_error, log_info};
use crate::stratus::util::error::{new_error, BoxedError};
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "controller";

const CACHE_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Store conflicts carry this phrase; reconciles failing with it are retried
/// without logging to keep optimistic-concurrency churn out of the logs.
pub const CONFLICT_RETRY_MESSAGE: &str =
    "please apply your changes to the latest version and try again";

#[derive(Debug)]
pub enum ControllerError {
    /// The cache did not sync before the start context was cancelled. The
    /// controller does not start.
    CacheSync(String),
    /// Deliberate re-check after a delay, bypassing the rate limiter.
    RetryAfter { delay: Duration, source: BoxedError },
    /// Any other reconcile failure; re-enqueued with back-off.
    Failed(BoxedError),
}

impl ControllerError {
    pub fn failed(source: impl Into<BoxedError>) -> Self {
        ControllerError::Failed(source.into())
    }

    pub fn retry_after(delay: Duration, source: impl Into<BoxedError>) -> Self {
        ControllerError::RetryAfter {
            delay,
            source: source.into(),
        }
    }
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::CacheSync(name) => {
                write!(f, "failed to wait for {} caches to sync", name)
            }
            ControllerError::RetryAfter { source, .. } => write!(f, "{}", source),
            ControllerError::Failed(source) => write!(f, "{}", source),
        }
    }
}

impl Error for ControllerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ControllerError::CacheSync(_) => None,
            ControllerError::RetryAfter { source, .. } => Some(source.as_ref()),
            ControllerError::Failed(source) => Some(source.as_ref()),
        }
    }
}

impl From<BoxedError> for ControllerError {
    fn from(source: BoxedError) -> Self {
        ControllerError::Failed(source)
    }
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ControllerError>> + Send + 'a>>;

/// Reconcile callback invoked by the workers. `obj` is the cached object for
/// the key, or `None` when it no longer exists.
pub trait ControllerHandler<T>: Send + Sync {
    fn on_change<'a>(&'a self, key: &'a str, obj: Option<T>) -> HandlerFuture<'a>;
}

pub type StartCacheFuture = Pin<Box<dyn Future<Output = Result<(), BoxedError>> + Send>>;
type StartCacheFn = dyn Fn(CancellationToken) -> StartCacheFuture + Send + Sync;

#[derive(Default)]
pub struct ControllerOptions {
    /// Overrides the default two-limiter maximum.
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    /// Suppresses enqueues for resync updates whose resource version is
    /// unchanged.
    pub sync_only_changed_objects: bool,
}

/// One controller per resource kind: binds informer notifications into a
/// rate-limited work queue and multiplexes worker tasks across it.
///
/// Enqueues arriving before [`Controller::start`] are buffered and flushed,
/// in insertion order, once the queue exists. After cancellation the
/// controller drains its workers and can be started again.
pub struct Controller<T: Resource> {
    inner: Arc<ControllerInner<T>>,
}

impl<T: Resource> Clone for Controller<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ControllerInner<T: Resource> {
    name: String,
    informer: Informer<T>,
    start_cache: Box<StartCacheFn>,
    handler: Box<dyn ControllerHandler<T>>,
    rate_limiter: Arc<dyn RateLimiter>,
    lifecycle: Mutex<Lifecycle>,
}

struct Lifecycle {
    queue: Option<WorkQueue>,
    start_keys: Vec<StartKey>,
    started: bool,
}

struct StartKey {
    key: String,
    after: Duration,
}

impl<T: Resource> Controller<T> {
    pub fn new<S, H>(
        name: impl Into<String>,
        informer: Informer<T>,
        start_cache: S,
        handler: H,
        options: ControllerOptions,
    ) -> Self
    where
        S: Fn(CancellationToken) -> StartCacheFuture + Send + Sync + 'static,
        H: ControllerHandler<T> + 'static,
    {
        let inner = Arc::new(ControllerInner {
            name: name.into(),
            informer,
            start_cache: Box::new(start_cache),
            handler: Box::new(handler),
            rate_limiter: options
                .rate_limiter
                .unwrap_or_else(default_rate_limiter),
            lifecycle: Mutex::new(Lifecycle {
                queue: None,
                start_keys: Vec::new(),
                started: false,
            }),
        });

        let controller = Self { inner };
        controller.register_event_handlers(options.sync_only_changed_objects);
        controller
    }

    fn register_event_handlers(&self, sync_only_changed_objects: bool) {
        let on_add = {
            let weak = Arc::downgrade(&self.inner);
            move |obj: &T| {
                if let Some(inner) = weak.upgrade() {
                    inner.add_key(obj.key(), Duration::ZERO);
                }
            }
        };
        let on_update = {
            let weak = Arc::downgrade(&self.inner);
            move |old: &T, new: &T| {
                if sync_only_changed_objects && old.resource_version() == new.resource_version() {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    inner.add_key(new.key(), Duration::ZERO);
                }
            }
        };
        let on_delete = {
            let weak = Arc::downgrade(&self.inner);
            move |deleted: &DeletedObject<T>| {
                if let Some(inner) = weak.upgrade() {
                    inner.add_key(deleted.key(), Duration::ZERO);
                }
            }
        };

        self.inner.informer.add_event_handler(ResourceEventHandler {
            on_add: Some(Box::new(on_add)),
            on_update: Some(Box::new(on_update)),
            on_delete: Some(Box::new(on_delete)),
        });
    }

    pub fn informer(&self) -> Informer<T> {
        self.inner.informer.clone()
    }

    /// Enqueues the object, charging its per-key failure budget when the
    /// controller is running.
    pub fn enqueue(&self, namespace: Option<&str>, name: &str) {
        let key = resource_key(namespace, name);
        let mut lifecycle = self.inner.lifecycle.lock().expect("lifecycle poisoned");
        match lifecycle.queue.as_ref() {
            Some(queue) => queue.add_rate_limited(&key),
            None => lifecycle.start_keys.push(StartKey {
                key,
                after: Duration::ZERO,
            }),
        }
    }

    pub fn enqueue_after(&self, namespace: Option<&str>, name: &str, delay: Duration) {
        let key = resource_key(namespace, name);
        let mut lifecycle = self.inner.lifecycle.lock().expect("lifecycle poisoned");
        match lifecycle.queue.as_ref() {
            Some(queue) => queue.add_after(&key, delay),
            None => lifecycle.start_keys.push(StartKey { key, after: delay }),
        }
    }

    pub fn enqueue_key(&self, key: &str) {
        self.inner.add_key(key.to_string(), Duration::ZERO);
    }

    /// Runs the cache start procedure, waits for the initial sync, then
    /// spawns `workers` tasks. Returns once the workers are running; they
    /// stop when `ctx` is cancelled, after which the controller is
    /// restartable.
    pub async fn start(&self, ctx: CancellationToken, workers: usize) -> Result<(), ControllerError> {
        {
            let lifecycle = self.inner.lifecycle.lock().expect("lifecycle poisoned");
            if lifecycle.started {
                return Ok(());
            }
        }

        (self.inner.start_cache)(ctx.clone())
            .await
            .map_err(ControllerError::Failed)?;
        self.wait_for_cache_sync(&ctx).await?;

        let queue = WorkQueue::new(
            self.inner.name.clone(),
            Arc::clone(&self.inner.rate_limiter),
        );
        {
            let mut lifecycle = self.inner.lifecycle.lock().expect("lifecycle poisoned");
            if lifecycle.started {
                return Ok(());
            }
            for start in lifecycle.start_keys.drain(..) {
                if start.after.is_zero() {
                    queue.add(&start.key);
                } else {
                    queue.add_after(&start.key, start.after);
                }
            }
            lifecycle.queue = Some(queue.clone());
            lifecycle.started = true;
        }

        log_info(
            COMPONENT,
            "starting controller",
            &[
                ("controller", self.inner.name.as_str()),
                ("workers", workers.to_string().as_str()),
            ],
        );

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let inner = Arc::clone(&self.inner);
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                ControllerInner::run_worker(inner, queue).await;
            }));
        }

        {
            let queue = queue.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.cancelled().await;
                queue.shut_down();
            });
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
            let mut lifecycle = inner.lifecycle.lock().expect("lifecycle poisoned");
            lifecycle.started = false;
            lifecycle.queue = None;
            log_info(
                COMPONENT,
                "controller workers stopped",
                &[("controller", inner.name.as_str())],
            );
        });

        Ok(())
    }

    async fn wait_for_cache_sync(&self, ctx: &CancellationToken) -> Result<(), ControllerError> {
        loop {
            if self.inner.informer.has_synced() {
                return Ok(());
            }
            if ctx.is_cancelled() {
                return Err(ControllerError::CacheSync(self.inner.name.clone()));
            }
            tokio::select! {
                _ = ctx.cancelled() => {}
                _ = sleep(CACHE_SYNC_POLL_INTERVAL) => {}
            }
        }
    }
}

impl<T: Resource> ControllerInner<T> {
    fn add_key(&self, key: String, after: Duration) {
        let mut lifecycle = self.lifecycle.lock().expect("lifecycle poisoned");
        match lifecycle.queue.as_ref() {
            Some(queue) => {
                if after.is_zero() {
                    queue.add(&key);
                } else {
                    queue.add_after(&key, after);
                }
            }
            None => lifecycle.start_keys.push(StartKey { key, after }),
        }
    }

    async fn run_worker(inner: Arc<Self>, queue: WorkQueue) {
        while let Some(key) = queue.get().await {
            if let Err(err) = Self::process_one(&inner, &queue, &key).await {
                let message = err.to_string();
                if !message.contains(CONFLICT_RETRY_MESSAGE) {
                    log_error(
                        COMPONENT,
                        "reconcile failed",
                        &[
                            ("controller", inner.name.as_str()),
                            ("key", key.as_str()),
                            ("error", message.as_str()),
                        ],
                    );
                }
            }
        }
    }

    async fn process_one(
        inner: &Arc<Self>,
        queue: &WorkQueue,
        key: &str,
    ) -> Result<(), ControllerError> {
        let obj = inner.informer.get_by_key(key);
        match inner.handler.on_change(key, obj).await {
            Ok(()) => {
                queue.forget(key);
                queue.done(key);
                Ok(())
            }
            Err(ControllerError::RetryAfter { delay, source }) => {
                queue.add_after(key, delay);
                queue.done(key);
                Err(ControllerError::Failed(source))
            }
            Err(err) => {
                queue.add_rate_limited(key);
                queue.done(key);
                Err(ControllerError::Failed(new_error(format!(
                    "error syncing '{}': {}, requeuing",
                    key, err
                ))))
            }
        }
    }
}

/// Start-cache procedure for informers fed out-of-band (tests, in-process
/// stores): marks the cache synced immediately.
pub fn noop_start_cache<T: Resource>(informer: Informer<T>) -> impl Fn(CancellationToken) -> StartCacheFuture {
    move |_ctx| {
        let informer = informer.clone();
        Box::pin(async move {
            informer.mark_synced();
            Ok(())
        })
    }
}
