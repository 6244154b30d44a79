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

#![allow(dead_code)]

//! Shared fakes for the datastore and the instance-manager adapter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use stratus::stratus::datastore::{DataStore, DataStoreError, Pod};
use stratus::stratus::events::{EventRecorder, InMemoryEventBus};
use stratus::stratus::instance::manager::{
    InstanceLogFuture, InstanceLogs, InstanceManagerError, InstanceManagerHandler,
    InstanceProcessFuture, InstanceUnitFuture,
};
use stratus::stratus::instance::types::{
    InstanceManager, InstanceManagerSpec, InstanceManagerState, InstanceManagerStatus,
    InstanceOwner, InstanceProcess, InstanceProcessSpec, InstanceProcessStatus, InstanceState,
    ObjectMeta,
};
use stratus::stratus::instance::InstanceHandler;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct StoreState {
    pub managers: HashMap<String, InstanceManager>,
    pub default_manager: Option<String>,
    pub engine_enabled: bool,
    pub node_down: bool,
    pub delinquent: bool,
    pub pods: HashMap<String, Pod>,
}

/// Mutable fake datastore; tests flip its state between reconciles.
#[derive(Clone, Default)]
pub struct FakeStore {
    pub state: Arc<Mutex<StoreState>>,
}

impl FakeStore {
    pub fn new() -> Self {
        let store = Self::default();
        store.state.lock().unwrap().engine_enabled = true;
        store
    }

    pub fn put_manager(&self, im: InstanceManager) {
        let mut state = self.state.lock().unwrap();
        state.default_manager = Some(im.metadata.name.clone());
        state.pods.insert(
            im.metadata.name.clone(),
            Pod {
                name: im.metadata.name.clone(),
                namespace: im.metadata.namespace.clone(),
                ip: im.status.ip.clone(),
                storage_ip: None,
            },
        );
        state.managers.insert(im.metadata.name.clone(), im);
    }

    pub fn update_manager<F: FnOnce(&mut InstanceManager)>(&self, name: &str, update: F) {
        let mut state = self.state.lock().unwrap();
        let im = state
            .managers
            .get_mut(name)
            .expect("manager must exist to update");
        update(im);
    }
}

impl<R: InstanceOwner> DataStore<R> for FakeStore {
    fn instance_manager_ro(&self, name: &str) -> Result<InstanceManager, DataStoreError> {
        self.state
            .lock()
            .unwrap()
            .managers
            .get(name)
            .cloned()
            .ok_or_else(|| DataStoreError::NotFound(name.to_string()))
    }

    fn instance_manager_by_instance_ro(&self, _obj: &R) -> Result<InstanceManager, DataStoreError> {
        let state = self.state.lock().unwrap();
        state
            .default_manager
            .as_ref()
            .and_then(|name| state.managers.get(name))
            .cloned()
            .ok_or_else(|| DataStoreError::NotFound("instance manager".to_string()))
    }

    fn is_node_delinquent(&self, _: &str, _: &str) -> Result<bool, DataStoreError> {
        Ok(self.state.lock().unwrap().delinquent)
    }

    fn is_node_down_or_deleted_or_delinquent(&self, _: &str, _: &str) -> Result<bool, DataStoreError> {
        Ok(self.state.lock().unwrap().node_down)
    }

    fn is_data_engine_enabled(
        &self,
        _: stratus::stratus::instance::types::DataEngine,
    ) -> Result<bool, DataStoreError> {
        Ok(self.state.lock().unwrap().engine_enabled)
    }

    fn pod_ro(&self, _: Option<&str>, name: &str) -> Result<Option<Pod>, DataStoreError> {
        Ok(self.state.lock().unwrap().pods.get(name).cloned())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GetBehavior {
    NotFound,
    Stopped,
    Fail,
}

#[derive(Default)]
pub struct AdapterCalls {
    pub creates: Vec<String>,
    pub deletes: Vec<String>,
    pub log_streams: u32,
}

/// Fake instance-manager adapter recording every call.
#[derive(Clone)]
pub struct FakeAdapter {
    pub get: Arc<Mutex<GetBehavior>>,
    pub calls: Arc<Mutex<AdapterCalls>>,
    pub create_fails: Arc<Mutex<bool>>,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self {
            get: Arc::new(Mutex::new(GetBehavior::NotFound)),
            calls: Arc::new(Mutex::new(AdapterCalls::default())),
            create_fails: Arc::new(Mutex::new(false)),
        }
    }

    pub fn creates(&self) -> usize {
        self.calls.lock().unwrap().creates.len()
    }

    pub fn deletes(&self) -> usize {
        self.calls.lock().unwrap().deletes.len()
    }
}

impl Default for FakeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: InstanceOwner> InstanceManagerHandler<R> for FakeAdapter {
    fn get_instance<'a>(&'a self, obj: &'a R) -> InstanceProcessFuture<'a> {
        let name = obj.instance_name().to_string();
        Box::pin(async move {
            match *self.get.lock().unwrap() {
                GetBehavior::NotFound => Err(InstanceManagerError::NotFound(name)),
                GetBehavior::Stopped => Err(InstanceManagerError::Stopped(name)),
                GetBehavior::Fail => Err(InstanceManagerError::Other("dial tcp: timeout".into())),
            }
        })
    }

    fn create_instance<'a>(&'a self, obj: &'a R) -> InstanceProcessFuture<'a> {
        let name = obj.instance_name().to_string();
        Box::pin(async move {
            self.calls.lock().unwrap().creates.push(name);
            if *self.create_fails.lock().unwrap() {
                return Err(InstanceManagerError::Other("create failed".into()));
            }
            Ok(InstanceProcess::default())
        })
    }

    fn delete_instance<'a>(&'a self, obj: &'a R) -> InstanceUnitFuture<'a> {
        let name = obj.instance_name().to_string();
        Box::pin(async move {
            self.calls.lock().unwrap().deletes.push(name);
            Ok(())
        })
    }

    fn log_instance<'a>(&'a self, _ctx: CancellationToken, _obj: &'a R) -> InstanceLogFuture<'a> {
        Box::pin(async move {
            self.calls.lock().unwrap().log_streams += 1;
            Ok(InstanceLogs::from_lines(vec!["fixture log line".to_string()]))
        })
    }
}

pub fn running_manager(name: &str, node: &str, ip: &str) -> InstanceManager {
    InstanceManager {
        metadata: ObjectMeta {
            name: name.to_string(),
            ..Default::default()
        },
        spec: InstanceManagerSpec {
            node_id: node.to_string(),
        },
        status: InstanceManagerStatus {
            current_state: InstanceManagerState::Running,
            ip: ip.to_string(),
            ..Default::default()
        },
    }
}

pub fn running_process(port_start: i32, uuid: &str) -> InstanceProcess {
    InstanceProcess {
        spec: InstanceProcessSpec::default(),
        status: InstanceProcessStatus {
            state: InstanceState::Running,
            port_start,
            uuid: uuid.to_string(),
            ..Default::default()
        },
    }
}

pub fn instance_handler<R: InstanceOwner>(
    store: &FakeStore,
    adapter: &FakeAdapter,
    bus: Arc<InMemoryEventBus>,
) -> InstanceHandler<R> {
    InstanceHandler::new(
        Arc::new(store.clone()),
        Arc::new(adapter.clone()),
        EventRecorder::new(bus),
    )
}
