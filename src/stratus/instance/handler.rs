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

use crate::stratus::datastore::{DataStore, DataStoreError};
use crate::stratus::events::{EventReason, EventRecorder, ObjectReference};
use crate::stratus::instance::manager::{
    InstanceLogs, InstanceManagerError, InstanceManagerHandler,
};
use crate::stratus::instance::types::{
    instances_for, set_condition, ConditionStatus, DataEngine, InstanceManager,
    InstanceManagerState, InstanceOwner, InstanceProcess, InstanceSpec, InstanceState,
    InstanceStatus, CONDITION_REASON_INSTANCE_CREATION_FAILURE, CONDITION_TYPE_FILESYSTEM_READ_ONLY,
    CONDITION_TYPE_INSTANCE_CREATION,
};
use crate::stratus::logger::{log_error, log_info, log_warn};
use crate::stratus::util::error::{with_context, BoxedError};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "instance-handler";

#[derive(Debug)]
pub enum InstanceError {
    /// `DesireState` other than running/stopped is a programming error in
    /// the caller.
    BadDesireState(InstanceState),
    /// A running instance landed on a manager whose node differs from the
    /// spec's assignment.
    NodeMismatch {
        instance: String,
        spec_node_id: String,
        instance_manager: String,
        manager_node_id: String,
    },
    DataStore(DataStoreError),
    InstanceManager(InstanceManagerError),
    Internal(BoxedError),
}

impl fmt::Display for InstanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceError::BadDesireState(state) => {
                write!(f, "unknown instance desire state: desire {}", state)
            }
            InstanceError::NodeMismatch {
                instance,
                spec_node_id,
                instance_manager,
                manager_node_id,
            } => write!(
                f,
                "instance {} NodeID {} is not the same as the instance manager {} NodeID {}",
                instance, spec_node_id, instance_manager, manager_node_id
            ),
            InstanceError::DataStore(err) => write!(f, "{}", err),
            InstanceError::InstanceManager(err) => write!(f, "{}", err),
            InstanceError::Internal(err) => write!(f, "{}", err),
        }
    }
}

impl Error for InstanceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            InstanceError::DataStore(err) => Some(err),
            InstanceError::InstanceManager(err) => Some(err),
            InstanceError::Internal(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<DataStoreError> for InstanceError {
    fn from(err: DataStoreError) -> Self {
        InstanceError::DataStore(err)
    }
}

impl From<InstanceManagerError> for InstanceError {
    fn from(err: InstanceManagerError) -> Self {
        InstanceError::InstanceManager(err)
    }
}

/// Drives the state transition of one instance and its engine/replica
/// object. The instance process is assumed to use the same name as the
/// owning object.
pub struct InstanceHandler<R> {
    ds: Arc<dyn DataStore<R>>,
    instance_manager_handler: Arc<dyn InstanceManagerHandler<R>>,
    event_recorder: EventRecorder,
}

impl<R: InstanceOwner> InstanceHandler<R> {
    pub fn new(
        ds: Arc<dyn DataStore<R>>,
        instance_manager_handler: Arc<dyn InstanceManagerHandler<R>>,
        event_recorder: EventRecorder,
    ) -> Self {
        Self {
            ds,
            instance_manager_handler,
            event_recorder,
        }
    }

    /// Converges the instance toward `spec.desire_state`, synthesizing
    /// `status` from the instance manager's latest snapshot. Mutates `status`
    /// in place; the caller persists the object afterwards. Safe to invoke
    /// repeatedly between instance-manager updates.
    pub async fn reconcile_instance_state(
        &self,
        obj: &R,
        spec: &InstanceSpec,
        status: &mut InstanceStatus,
    ) -> Result<(), InstanceError> {
        let instance_name = obj.instance_name().to_string();
        let state_before = status.current_state;

        let result = self.reconcile(obj, &instance_name, spec, status).await;

        if state_before != status.current_state {
            log_info(
                COMPONENT,
                "instance state updated",
                &[
                    ("instance", instance_name.as_str()),
                    ("volume", spec.volume_name.as_str()),
                    ("dataEngine", spec.data_engine.as_str()),
                    ("from", state_before.as_str()),
                    ("to", status.current_state.as_str()),
                ],
            );
        }
        result
    }

    async fn reconcile(
        &self,
        obj: &R,
        instance_name: &str,
        spec: &InstanceSpec,
        status: &mut InstanceStatus,
    ) -> Result<(), InstanceError> {
        // Resolve the governing instance manager. A recorded name wins; a
        // missing record is tolerated and re-resolved below.
        let mut im: Option<InstanceManager> = None;
        if !status.instance_manager_name.is_empty() {
            match self.ds.instance_manager_ro(&status.instance_manager_name) {
                Ok(found) => im = Some(found),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        // A scheduled instance with a chosen image should have a manager,
        // unless its node is gone or its data engine is disabled.
        if im.is_none() && !spec.image.is_empty() && !spec.node_id.is_empty() {
            if !self.ds.is_data_engine_enabled(spec.data_engine)? {
                return Ok(());
            }
            let node_down = self
                .ds
                .is_node_down_or_deleted_or_delinquent(&spec.node_id, &spec.volume_name)?;
            if !node_down {
                match self.ds.instance_manager_by_instance_ro(obj) {
                    Ok(found) => im = Some(found),
                    Err(err) => {
                        return Err(InstanceError::Internal(with_context(
                            err,
                            format!("failed to get instance manager for instance {}", instance_name),
                        )))
                    }
                }
            }
        }

        if spec.log_requested {
            if !status.log_fetched {
                // V2 data engines expose no per-process log stream.
                if spec.data_engine.is_v1() {
                    log_warn(
                        COMPONENT,
                        "getting requested log",
                        &[
                            ("instance", instance_name),
                            ("instanceManager", status.instance_manager_name.as_str()),
                        ],
                    );
                    match im.as_ref() {
                        None => log_warn(
                            COMPONENT,
                            "failed to get log: instance manager is already gone",
                            &[("instance", instance_name)],
                        ),
                        Some(im_ref) => {
                            if let Err(err) = self.print_instance_logs(instance_name, obj).await {
                                log_warn(
                                    COMPONENT,
                                    "failed to get requested log",
                                    &[
                                        ("instance", instance_name),
                                        ("node", im_ref.spec.node_id.as_str()),
                                        ("error", err.to_string().as_str()),
                                    ],
                                );
                            }
                        }
                    }
                }
                status.log_fetched = true;
            }
        } else {
            status.log_fetched = false;
        }

        if status.salvage_executed && !spec.salvage_requested {
            status.salvage_executed = false;
        }

        set_condition(
            &mut status.conditions,
            CONDITION_TYPE_INSTANCE_CREATION,
            ConditionStatus::True,
            "",
            "",
        );

        let instances = match im.as_ref() {
            Some(im_ref) => instances_for(obj.kind(), im_ref),
            None => HashMap::new(),
        };

        match spec.desire_state {
            InstanceState::Running => {
                if im.is_some() {
                    let running = instances
                        .get(instance_name)
                        .map(|process| process.status.state == InstanceState::Running)
                        .unwrap_or(false);
                    if running {
                        status.started = true;
                    } else if status.current_state == InstanceState::Stopped {
                        // There is a delay between a create call and the
                        // manager reporting the process, so any other current
                        // state means a create may already be in flight.
                        self.create_instance(instance_name, spec.data_engine, obj)
                            .await?;
                        if spec.salvage_requested {
                            status.salvage_executed = true;
                        }
                    }
                }
            }
            InstanceState::Stopped => {
                if let Some(im_ref) = im.as_ref() {
                    if !im_ref.is_deleting() {
                        // Deletes may also be reported late; re-issuing is
                        // harmless.
                        if let Some(process) = instances.get(instance_name) {
                            if should_delete_instance(process) {
                                self.delete_instance(instance_name, obj).await?;
                            }
                        }
                    }
                }
                status.started = false;
            }
            other => return Err(InstanceError::BadDesireState(other)),
        }

        self.sync_status_with_instance_manager(im.as_ref(), instance_name, spec, status, &instances);

        match status.current_state {
            InstanceState::Running => {
                // A stop request unsets the node assignment first, so only a
                // running desire pins the instance to its manager's node.
                if spec.desire_state != InstanceState::Stopped {
                    if let Some(im_ref) = im.as_ref() {
                        if spec.node_id != im_ref.spec.node_id {
                            status.current_state = InstanceState::Error;
                            status.ip.clear();
                            status.storage_ip.clear();
                            return Err(InstanceError::NodeMismatch {
                                instance: instance_name.to_string(),
                                spec_node_id: spec.node_id.clone(),
                                instance_manager: im_ref.name().to_string(),
                                manager_node_id: im_ref.spec.node_id.clone(),
                            });
                        }
                    }
                }
            }
            InstanceState::Error => {
                if let Some(im_ref) = im.as_ref() {
                    if let Some(process) = instances.get(instance_name) {
                        if spec.desire_state == InstanceState::Running {
                            set_condition(
                                &mut status.conditions,
                                CONDITION_TYPE_INSTANCE_CREATION,
                                ConditionStatus::False,
                                CONDITION_REASON_INSTANCE_CREATION_FAILURE,
                                &process.status.error_msg,
                            );
                        }

                        if process.spec.data_engine.is_v1() {
                            log_warn(
                                COMPONENT,
                                "instance crashed, getting log",
                                &[
                                    ("instance", instance_name),
                                    ("instanceManager", im_ref.name()),
                                    ("node", im_ref.spec.node_id.as_str()),
                                ],
                            );
                            if let Err(err) = self.print_instance_logs(instance_name, obj).await {
                                log_warn(
                                    COMPONENT,
                                    "failed to get crash log",
                                    &[
                                        ("instance", instance_name),
                                        ("instanceManager", im_ref.name()),
                                        ("error", err.to_string().as_str()),
                                    ],
                                );
                            }
                        }
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn sync_status_with_instance_manager(
        &self,
        im: Option<&InstanceManager>,
        instance_name: &str,
        spec: &InstanceSpec,
        status: &mut InstanceStatus,
        instances: &HashMap<String, InstanceProcess>,
    ) {
        self.sync_status(im, instance_name, spec, status, instances);
        // A stopped instance belongs to no manager; every exit path above
        // honors this.
        if status.current_state == InstanceState::Stopped {
            status.instance_manager_name.clear();
        }
    }

    fn sync_status(
        &self,
        im: Option<&InstanceManager>,
        instance_name: &str,
        spec: &InstanceSpec,
        status: &mut InstanceStatus,
        instances: &HashMap<String, InstanceProcess>,
    ) {
        let is_delinquent = im
            .map(|im_ref| {
                self.ds
                    .is_node_delinquent(&im_ref.spec.node_id, &spec.volume_name)
                    .unwrap_or(false)
            })
            .unwrap_or(false);

        let im_unavailable = match im {
            None => true,
            Some(im_ref) => im_ref.status.current_state == InstanceManagerState::Unknown,
        };
        if im_unavailable || is_delinquent {
            if status.started {
                if status.current_state != InstanceState::Unknown {
                    log_warn(
                        COMPONENT,
                        "marking instance unknown: its node is down or deleted",
                        &[("instance", instance_name), ("node", spec.node_id.as_str())],
                    );
                }
                status.current_state = InstanceState::Unknown;
            } else {
                status.current_state = InstanceState::Stopped;
                status.current_image.clear();
            }
            clear_runtime_fields(status);
            reset_filesystem_read_only_condition(status);
            return;
        }

        let Some(im_ref) = im else {
            return;
        };

        if im_ref.status.current_state == InstanceManagerState::Stopped
            || im_ref.status.current_state == InstanceManagerState::Error
            || im_ref.is_deleting()
        {
            if status.started {
                if status.current_state != InstanceState::Error {
                    log_warn(
                        COMPONENT,
                        "marking instance error: no instance manager for the running instance",
                        &[("instance", instance_name)],
                    );
                }
                status.current_state = InstanceState::Error;
            } else {
                status.current_state = InstanceState::Stopped;
            }
            status.current_image.clear();
            clear_runtime_fields(status);
            reset_filesystem_read_only_condition(status);
            return;
        }

        if im_ref.status.current_state == InstanceManagerState::Starting {
            if status.started {
                if status.current_state != InstanceState::Error {
                    log_warn(
                        COMPONENT,
                        "marking instance error: a starting instance manager cannot hold a running instance",
                        &[
                            ("instance", instance_name),
                            ("instanceManager", im_ref.name()),
                        ],
                    );
                }
                status.current_state = InstanceState::Error;
                status.current_image.clear();
                clear_runtime_fields(status);
                reset_filesystem_read_only_condition(status);
            }
            return;
        }

        let Some(process) = instances.get(instance_name) else {
            if status.started {
                if status.current_state != InstanceState::Error {
                    log_warn(
                        COMPONENT,
                        "marking instance error: process missing from its instance manager",
                        &[
                            ("instance", instance_name),
                            ("instanceManager", im_ref.name()),
                        ],
                    );
                }
                status.current_state = InstanceState::Error;
            } else {
                status.current_state = InstanceState::Stopped;
            }
            status.current_image.clear();
            clear_runtime_fields(status);
            reset_filesystem_read_only_condition(status);
            return;
        };

        if !status.instance_manager_name.is_empty() && status.instance_manager_name != im_ref.name()
        {
            log_error(
                COMPONENT,
                "instance manager name changed; it should only change for cleanup",
                &[
                    ("instance", instance_name),
                    ("instanceManager", im_ref.name()),
                    ("recorded", status.instance_manager_name.as_str()),
                ],
            );
        }
        // Recorded whenever the process exists so cleanup and log fetching
        // stay addressable after the instance errors or stops.
        status.instance_manager_name = im_ref.name().to_string();

        match process.status.state {
            InstanceState::Starting => {
                status.current_state = InstanceState::Starting;
                status.current_image.clear();
                clear_runtime_fields(status);
                reset_filesystem_read_only_condition(status);
            }
            InstanceState::Running => {
                status.current_state = InstanceState::Running;

                let pod = match self
                    .ds
                    .pod_ro(im_ref.metadata.namespace.as_deref(), im_ref.name())
                {
                    Ok(pod) => pod,
                    Err(err) => {
                        log_error(
                            COMPONENT,
                            "failed to get instance manager pod",
                            &[
                                ("instanceManager", im_ref.name()),
                                ("error", err.to_string().as_str()),
                            ],
                        );
                        return;
                    }
                };
                let Some(pod) = pod else {
                    log_warn(
                        COMPONENT,
                        "instance manager pod not found in datastore",
                        &[("instanceManager", im_ref.name())],
                    );
                    return;
                };

                let storage_ip = self.ds.storage_ip_from_pod(&pod);
                if status.storage_ip != storage_ip {
                    if !status.storage_ip.is_empty() {
                        log_warn(
                            COMPONENT,
                            "storage IP changed for running instance",
                            &[
                                ("instance", instance_name),
                                ("recorded", status.storage_ip.as_str()),
                                ("current", storage_ip.as_str()),
                            ],
                        );
                    }
                    status.storage_ip = storage_ip;
                }

                if status.ip != im_ref.status.ip {
                    if !status.ip.is_empty() {
                        log_warn(
                            COMPONENT,
                            "IP changed for running instance",
                            &[
                                ("instance", instance_name),
                                ("recorded", status.ip.as_str()),
                                ("current", im_ref.status.ip.as_str()),
                            ],
                        );
                    }
                    status.ip = im_ref.status.ip.clone();
                }

                if status.port != process.status.port_start {
                    if status.port != 0 {
                        log_warn(
                            COMPONENT,
                            "port changed for running instance",
                            &[
                                ("instance", instance_name),
                                ("recorded", status.port.to_string().as_str()),
                                ("current", process.status.port_start.to_string().as_str()),
                            ],
                        );
                    }
                    status.port = process.status.port_start;
                }

                if status.ublk_id != process.status.ublk_id {
                    status.ublk_id = process.status.ublk_id;
                }

                // Set once on the first observed run; spec.image may move
                // ahead of it during an upgrade.
                if status.current_image.is_empty() {
                    status.current_image = spec.image.clone();
                }

                if status.uuid != process.status.uuid {
                    status.uuid = process.status.uuid.clone();
                }

                sync_instance_conditions(process, status);
            }
            InstanceState::Stopping => {
                if status.started {
                    status.current_state = InstanceState::Error;
                } else {
                    status.current_state = InstanceState::Stopping;
                }
                status.current_image.clear();
                clear_runtime_fields(status);
                reset_filesystem_read_only_condition(status);
            }
            InstanceState::Stopped => {
                if status.started {
                    status.current_state = InstanceState::Error;
                } else {
                    status.current_state = InstanceState::Stopped;
                }
                status.current_image.clear();
                clear_runtime_fields(status);
                reset_filesystem_read_only_condition(status);
            }
            other => {
                if status.current_state != InstanceState::Error {
                    log_warn(
                        COMPONENT,
                        "instance entered an unexpected state",
                        &[
                            ("instance", instance_name),
                            ("state", other.as_str()),
                            ("errorMsg", process.status.error_msg.as_str()),
                        ],
                    );
                }
                status.current_state = InstanceState::Error;
                status.current_image.clear();
                clear_runtime_fields(status);
                reset_filesystem_read_only_condition(status);
            }
        }
    }

    async fn create_instance(
        &self,
        instance_name: &str,
        data_engine: DataEngine,
        obj: &R,
    ) -> Result<(), InstanceError> {
        match self.instance_manager_handler.get_instance(obj).await {
            Ok(_) => return Ok(()),
            Err(err) => {
                let stopped_v2_engine = data_engine.is_v2() && err.is_stopped();
                if !err.is_not_found() && !stopped_v2_engine {
                    return Err(InstanceError::Internal(with_context(
                        err,
                        format!("failed to get instance process {}", instance_name),
                    )));
                }
            }
        }

        log_info(
            COMPONENT,
            "creating instance",
            &[("instance", instance_name)],
        );
        if let Err(err) = self.instance_manager_handler.create_instance(obj).await {
            if !err.is_already_exists() {
                self.event_recorder
                    .warning(
                        object_reference(obj),
                        EventReason::FailedStarting,
                        format!("Error starting {}: {}", instance_name, err),
                    )
                    .await;
                return Err(err.into());
            }
            // Already exists: we lost track of it, likely after a datastore
            // conflict.
            return Ok(());
        }
        self.event_recorder
            .normal(
                object_reference(obj),
                EventReason::Start,
                format!("Starts {}", instance_name),
            )
            .await;

        Ok(())
    }

    async fn delete_instance(&self, instance_name: &str, obj: &R) -> Result<(), InstanceError> {
        // May be force-deleting an instance on a lost node, so the process is
        // not re-checked here.
        log_info(
            COMPONENT,
            "deleting instance",
            &[("instance", instance_name)],
        );
        if let Err(err) = self.instance_manager_handler.delete_instance(obj).await {
            self.event_recorder
                .warning(
                    object_reference(obj),
                    EventReason::FailedStopping,
                    format!("Error stopping {}: {}", instance_name, err),
                )
                .await;
            return Err(err.into());
        }
        self.event_recorder
            .normal(
                object_reference(obj),
                EventReason::Stop,
                format!("Stops {}", instance_name),
            )
            .await;

        Ok(())
    }

    async fn print_instance_logs(
        &self,
        instance_name: &str,
        obj: &R,
    ) -> Result<(), InstanceManagerError> {
        let ctx = CancellationToken::new();
        let _cancel_on_return = ctx.clone().drop_guard();

        let InstanceLogs { client, mut stream } =
            self.instance_manager_handler.log_instance(ctx, obj).await?;
        while let Some(line) = stream.next().await {
            log_warn(
                COMPONENT,
                "instance log",
                &[("instance", instance_name), ("line", line.as_str())],
            );
        }
        if let Err(err) = client.close().await {
            log_warn(
                COMPONENT,
                "failed to close instance manager client",
                &[("error", err.to_string().as_str())],
            );
        }
        Ok(())
    }
}

fn object_reference<R: InstanceOwner>(obj: &R) -> ObjectReference {
    ObjectReference::new(
        obj.kind().as_str(),
        obj.instance_namespace(),
        obj.instance_name(),
    )
}

/// Stopped V2 replicas keep their logical volume around; deleting the
/// process would drop it, so they are preserved.
fn should_delete_instance(process: &InstanceProcess) -> bool {
    if process.spec.data_engine.is_v2() && process.status.state == InstanceState::Stopped {
        return false;
    }
    true
}

fn clear_runtime_fields(status: &mut InstanceStatus) {
    status.ip.clear();
    status.storage_ip.clear();
    status.port = 0;
    status.ublk_id = 0;
    status.uuid.clear();
}

fn reset_filesystem_read_only_condition(status: &mut InstanceStatus) {
    set_condition(
        &mut status.conditions,
        CONDITION_TYPE_FILESYSTEM_READ_ONLY,
        ConditionStatus::False,
        "",
        "",
    );
}

fn sync_instance_conditions(process: &InstanceProcess, status: &mut InstanceStatus) {
    for (condition, flag) in &process.status.conditions {
        let condition_status = if *flag {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        set_condition(&mut status.conditions, condition, condition_status, "", "");
    }
}
