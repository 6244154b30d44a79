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

//! Adapter over the remote instance-manager RPC surface. One implementation
//! exists per resource kind; the reconciler only sees this trait.

use crate::stratus::instance::types::InstanceProcess;
use crate::stratus::util::error::BoxedError;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum InstanceManagerError {
    /// No process with that name exists on the manager.
    NotFound(String),
    /// A create raced an existing process; callers treat this as success.
    AlreadyExists(String),
    /// The process exists but is stopped. V2 engines report this where V1
    /// would report `NotFound`; both mean "no process present".
    Stopped(String),
    Other(BoxedError),
}

impl InstanceManagerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, InstanceManagerError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, InstanceManagerError::AlreadyExists(_))
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, InstanceManagerError::Stopped(_))
    }
}

impl fmt::Display for InstanceManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceManagerError::NotFound(name) => write!(f, "{} was not found", name),
            InstanceManagerError::AlreadyExists(name) => write!(f, "{} already exists", name),
            InstanceManagerError::Stopped(name) => write!(f, "{} is stopped", name),
            InstanceManagerError::Other(err) => write!(f, "{}", err),
        }
    }
}

impl Error for InstanceManagerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            InstanceManagerError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<BoxedError> for InstanceManagerError {
    fn from(err: BoxedError) -> Self {
        InstanceManagerError::Other(err)
    }
}

pub type InstanceProcessFuture<'a> =
    Pin<Box<dyn Future<Output = Result<InstanceProcess, InstanceManagerError>> + Send + 'a>>;
pub type InstanceUnitFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), InstanceManagerError>> + Send + 'a>>;
pub type InstanceLogFuture<'a> =
    Pin<Box<dyn Future<Output = Result<InstanceLogs, InstanceManagerError>> + Send + 'a>>;
pub type CloseFuture = Pin<Box<dyn Future<Output = Result<(), InstanceManagerError>> + Send>>;

/// Finite stream of log lines; it ends when the remote side reaches
/// end-of-stream or the bounding token is cancelled.
pub type LogStream = ReceiverStream<String>;

/// Connection handle backing a log stream; must be released on every exit
/// path.
pub trait InstanceLogClient: Send {
    fn close(self: Box<Self>) -> CloseFuture;
}

pub struct InstanceLogs {
    pub client: Box<dyn InstanceLogClient>,
    pub stream: LogStream,
}

impl InstanceLogs {
    pub fn new(client: Box<dyn InstanceLogClient>, stream: LogStream) -> Self {
        Self { client, stream }
    }

    /// Builds a stream over a fixed set of lines with a no-op closer. Useful
    /// for adapters that buffer, and for tests.
    pub fn from_lines(lines: Vec<String>) -> Self {
        let (sender, receiver) = mpsc::channel(lines.len().max(1));
        for line in lines {
            // Capacity matches the line count, the sends cannot fail.
            let _ = sender.try_send(line);
        }
        drop(sender);
        Self {
            client: Box::new(NoopLogClient),
            stream: ReceiverStream::new(receiver),
        }
    }
}

struct NoopLogClient;

impl InstanceLogClient for NoopLogClient {
    fn close(self: Box<Self>) -> CloseFuture {
        Box::pin(async { Ok(()) })
    }
}

/// The capability set the reconciler needs from a node's instance manager:
/// fetch, idempotent create and delete, and log streaming.
pub trait InstanceManagerHandler<R>: Send + Sync {
    fn get_instance<'a>(&'a self, obj: &'a R) -> InstanceProcessFuture<'a>;

    /// Idempotent creation request; `AlreadyExists` is success.
    fn create_instance<'a>(&'a self, obj: &'a R) -> InstanceProcessFuture<'a>;

    /// Idempotent deletion request.
    fn delete_instance<'a>(&'a self, obj: &'a R) -> InstanceUnitFuture<'a>;

    /// Opens the process log. Cancelling `ctx` terminates the stream.
    fn log_instance<'a>(&'a self, ctx: CancellationToken, obj: &'a R) -> InstanceLogFuture<'a>;
}
