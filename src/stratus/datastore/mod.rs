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

//! Read-only view of the declarative store the reconciler depends on. The
//! store itself lives outside this crate; callers hand in an implementation
//! backed by their caches.

use crate::stratus::controller::CONFLICT_RETRY_MESSAGE;
use crate::stratus::instance::types::{DataEngine, InstanceManager};
use crate::stratus::util::error::BoxedError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Minimal view of an instance-manager pod, enough to resolve the addresses
/// an instance advertises.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub ip: String,
    /// Address on the dedicated storage network, when one is attached.
    #[serde(rename = "storageIP", skip_serializing_if = "Option::is_none")]
    pub storage_ip: Option<String>,
}

#[derive(Debug)]
pub enum DataStoreError {
    /// The named object does not exist. Reconciles treat this as empty state.
    NotFound(String),
    /// Optimistic-concurrency clash on update; retried silently.
    Conflict(String),
    Internal(BoxedError),
}

impl DataStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DataStoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DataStoreError::Conflict(_))
    }
}

impl fmt::Display for DataStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataStoreError::NotFound(name) => write!(f, "{} was not found", name),
            DataStoreError::Conflict(name) => {
                write!(f, "unable to update {}: {}", name, CONFLICT_RETRY_MESSAGE)
            }
            DataStoreError::Internal(err) => write!(f, "{}", err),
        }
    }
}

impl Error for DataStoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DataStoreError::Internal(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Store reads the instance reconciler needs. `R` is the owning resource
/// kind (engine or replica object).
pub trait DataStore<R>: Send + Sync {
    /// Fetches an instance manager by name; `NotFound` when absent.
    fn instance_manager_ro(&self, name: &str) -> Result<InstanceManager, DataStoreError>;

    /// Locates the manager that should host the object's instance on its
    /// assigned node.
    fn instance_manager_by_instance_ro(&self, obj: &R) -> Result<InstanceManager, DataStoreError>;

    /// Whether the cluster considers the node unresponsive for this volume,
    /// independent of the node-down signal.
    fn is_node_delinquent(&self, node_id: &str, volume_name: &str)
        -> Result<bool, DataStoreError>;

    fn is_node_down_or_deleted_or_delinquent(
        &self,
        node_id: &str,
        volume_name: &str,
    ) -> Result<bool, DataStoreError>;

    fn is_data_engine_enabled(&self, data_engine: DataEngine) -> Result<bool, DataStoreError>;

    /// Fetches the manager's pod; `Ok(None)` when it is gone.
    fn pod_ro(&self, namespace: Option<&str>, name: &str) -> Result<Option<Pod>, DataStoreError>;

    /// Resolves the address instances should advertise for storage traffic.
    fn storage_ip_from_pod(&self, pod: &Pod) -> String {
        pod.storage_ip.clone().unwrap_or_else(|| pod.ip.clone())
    }
}
