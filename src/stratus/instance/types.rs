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
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

pub const CONDITION_TYPE_INSTANCE_CREATION: &str = "InstanceCreation";
pub const CONDITION_REASON_INSTANCE_CREATION_FAILURE: &str = "InstanceCreationFailure";
pub const CONDITION_TYPE_FILESYSTEM_READ_ONLY: &str = "FilesystemReadOnly";

/// Minimal declarative object metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "resourceVersion", default)]
    pub resource_version: String,
    #[serde(rename = "deletionTimestamp", skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// Lifecycle state shared by instance processes and the declarative
/// desire/current state fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Unknown,
}

impl InstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Stopped => "stopped",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Error => "error",
            InstanceState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage backend variant. V2 replicas keep their logical volume addressable
/// while stopped, which changes deletion and log policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataEngine {
    #[default]
    #[serde(rename = "v1")]
    V1,
    #[serde(rename = "v2")]
    V2,
}

impl DataEngine {
    pub fn is_v1(self) -> bool {
        self == DataEngine::V1
    }

    pub fn is_v2(self) -> bool {
        self == DataEngine::V2
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataEngine::V1 => "v1",
            DataEngine::V2 => "v2",
        }
    }
}

impl fmt::Display for DataEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired shape of one instance process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceSpec {
    #[serde(rename = "nodeID", default)]
    pub node_id: String,
    #[serde(rename = "volumeName", default)]
    pub volume_name: String,
    #[serde(default)]
    pub image: String,
    #[serde(rename = "dataEngine", default)]
    pub data_engine: DataEngine,
    #[serde(rename = "desireState", default)]
    pub desire_state: InstanceState,
    #[serde(rename = "logRequested", default)]
    pub log_requested: bool,
    #[serde(rename = "salvageRequested", default)]
    pub salvage_requested: bool,
}

/// Observed state of one instance process as reported by its manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceStatus {
    #[serde(rename = "currentState", default)]
    pub current_state: InstanceState,
    #[serde(rename = "currentImage", default)]
    pub current_image: String,
    #[serde(rename = "instanceManagerName", default)]
    pub instance_manager_name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(rename = "storageIP", default)]
    pub storage_ip: String,
    #[serde(default)]
    pub port: i32,
    #[serde(rename = "ublkID", default)]
    pub ublk_id: i32,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub started: bool,
    #[serde(rename = "logFetched", default)]
    pub log_fetched: bool,
    #[serde(rename = "salvageExecuted", default)]
    pub salvage_executed: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conditions: Conditions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Condition set keyed by condition type; updates happen in place.
pub type Conditions = BTreeMap<String, Condition>;

/// Updates the condition in place. The transition timestamp only moves when
/// the status flips.
pub fn set_condition(
    conditions: &mut Conditions,
    condition_type: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    let entry = conditions.entry(condition_type.to_string()).or_default();
    if entry.status != status || entry.last_transition_time.is_none() {
        entry.last_transition_time = Some(Utc::now());
    }
    entry.status = status;
    entry.reason = reason.to_string();
    entry.message = message.to_string();
}

/// Lifecycle state of a per-node instance manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceManagerState {
    Starting,
    Running,
    Stopped,
    Error,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceManagerSpec {
    #[serde(rename = "nodeID", default)]
    pub node_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceManagerStatus {
    #[serde(rename = "currentState", default)]
    pub current_state: InstanceManagerState,
    #[serde(default)]
    pub ip: String,
    #[serde(rename = "instanceEngines", default, skip_serializing_if = "HashMap::is_empty")]
    pub instance_engines: HashMap<String, InstanceProcess>,
    #[serde(rename = "instanceReplicas", default, skip_serializing_if = "HashMap::is_empty")]
    pub instance_replicas: HashMap<String, InstanceProcess>,
    /// Legacy combined process map kept for managers predating the split
    /// engine/replica fields.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub instances: HashMap<String, InstanceProcess>,
}

/// One node's process-hosting runtime. Its lifecycle is observed, never
/// driven, by this crate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceManager {
    pub metadata: ObjectMeta,
    pub spec: InstanceManagerSpec,
    pub status: InstanceManagerStatus,
}

impl InstanceManager {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceProcessSpec {
    #[serde(rename = "dataEngine", default)]
    pub data_engine: DataEngine,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceProcessStatus {
    #[serde(default)]
    pub state: InstanceState,
    #[serde(rename = "portStart", default)]
    pub port_start: i32,
    #[serde(rename = "ublkID", default)]
    pub ublk_id: i32,
    #[serde(default)]
    pub uuid: String,
    #[serde(rename = "errorMsg", default)]
    pub error_msg: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub conditions: HashMap<String, bool>,
}

/// Process descriptor reported by an instance manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceProcess {
    pub spec: InstanceProcessSpec,
    pub status: InstanceProcessStatus,
}

/// The two resource kinds whose instances this crate reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceKind {
    Engine,
    Replica,
}

impl InstanceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceKind::Engine => "engine",
            InstanceKind::Replica => "replica",
        }
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine-vs-replica polymorphism needed by the reconciler: the instance
/// process carries the owning object's name, and the kind selects which
/// manager-side process map to consult.
pub trait InstanceOwner: Send + Sync {
    fn instance_name(&self) -> &str;
    fn instance_namespace(&self) -> Option<&str>;
    fn kind(&self) -> InstanceKind;
}

/// Engine resource: the per-volume frontend process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Engine {
    pub metadata: ObjectMeta,
    pub spec: InstanceSpec,
    pub status: InstanceStatus,
}

/// Replica resource: one copy of a volume's data on one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Replica {
    pub metadata: ObjectMeta,
    pub spec: InstanceSpec,
    pub status: InstanceStatus,
}

macro_rules! impl_instance_resource {
    ($type:ty, $kind:expr) => {
        impl Resource for $type {
            fn name(&self) -> &str {
                &self.metadata.name
            }

            fn namespace(&self) -> Option<&str> {
                self.metadata.namespace.as_deref()
            }

            fn resource_version(&self) -> &str {
                &self.metadata.resource_version
            }
        }

        impl InstanceOwner for $type {
            fn instance_name(&self) -> &str {
                &self.metadata.name
            }

            fn instance_namespace(&self) -> Option<&str> {
                self.metadata.namespace.as_deref()
            }

            fn kind(&self) -> InstanceKind {
                $kind
            }
        }
    };
}

impl_instance_resource!(Engine, InstanceKind::Engine);
impl_instance_resource!(Replica, InstanceKind::Replica);

/// Returns the manager's process map for the kind, overlaying the typed map
/// on the legacy combined one (typed entries win).
pub fn instances_for(kind: InstanceKind, im: &InstanceManager) -> HashMap<String, InstanceProcess> {
    let typed = match kind {
        InstanceKind::Engine => &im.status.instance_engines,
        InstanceKind::Replica => &im.status.instance_replicas,
    };
    let mut consolidated = im.status.instances.clone();
    for (name, process) in typed {
        consolidated.insert(name.clone(), process.clone());
    }
    consolidated
}
