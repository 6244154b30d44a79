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

use crate::support::{
    instance_handler, running_manager, running_process, FakeAdapter, FakeStore,
};
use std::sync::Arc;
use stratus::stratus::events::{
    EventReason, EventSubscriber, EventType, InMemoryEventBus, SubscriptionOptions,
};
use stratus::stratus::instance::types::{
    DataEngine, Engine, InstanceManagerState, InstanceProcessSpec, InstanceSpec, InstanceState,
    InstanceStatus, ObjectMeta, Replica,
};
use stratus::stratus::instance::{InstanceError, InstanceHandler};
use tokio::time::{timeout, Duration};
use tokio_stream::StreamExt;

fn engine(name: &str) -> Engine {
    Engine {
        metadata: ObjectMeta {
            name: name.to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn replica(name: &str) -> Replica {
    Replica {
        metadata: ObjectMeta {
            name: name.to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn running_spec(node: &str, image: &str) -> InstanceSpec {
    InstanceSpec {
        node_id: node.to_string(),
        volume_name: "vol-1".to_string(),
        image: image.to_string(),
        desire_state: InstanceState::Running,
        ..Default::default()
    }
}

fn assert_stopped_invariant(status: &InstanceStatus) {
    assert_eq!(status.current_state, InstanceState::Stopped);
    assert_eq!(status.instance_manager_name, "");
    assert_eq!(status.ip, "");
    assert_eq!(status.storage_ip, "");
    assert_eq!(status.port, 0);
    assert_eq!(status.ublk_id, 0);
    assert_eq!(status.uuid, "");
}

async fn next_event(
    bus: &InMemoryEventBus,
    kind: &str,
) -> stratus::stratus::events::EventEnvelope {
    let mut subscription = bus
        .subscribe(kind, SubscriptionOptions)
        .expect("subscribe to events");
    timeout(Duration::from_secs(1), subscription.stream.next())
        .await
        .expect("event timeout")
        .expect("stream open")
        .expect("event")
}

#[tokio::test]
async fn cold_start_creates_the_process_and_emits_start() {
    let store = FakeStore::new();
    store.put_manager(running_manager("im-1", "node-1", "10.0.0.5"));
    let adapter = FakeAdapter::new();
    let bus = Arc::new(InMemoryEventBus::new(64));
    let handler: InstanceHandler<Engine> = instance_handler(&store, &adapter, Arc::clone(&bus));

    let mut events = bus
        .subscribe("engine", SubscriptionOptions)
        .expect("subscribe");

    let obj = engine("vol-1-e");
    let spec = running_spec("node-1", "img:v1");
    let mut status = InstanceStatus::default();

    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("reconcile");

    assert_eq!(adapter.creates(), 1);
    assert!(!status.log_fetched);
    // The manager has not registered the process yet, so the synthesized
    // state stays stopped until the next pass observes it.
    assert_stopped_invariant(&status);

    let event = timeout(Duration::from_secs(1), events.stream.next())
        .await
        .expect("event timeout")
        .expect("stream open")
        .expect("event");
    assert_eq!(event.reason, EventReason::Start);
    assert_eq!(event.event_type, EventType::Normal);
    assert_eq!(event.object.name, "vol-1-e");
}

#[tokio::test]
async fn create_is_not_repeated_while_the_manager_catches_up() {
    let store = FakeStore::new();
    store.put_manager(running_manager("im-1", "node-1", "10.0.0.5"));
    let adapter = FakeAdapter::new();
    let bus = Arc::new(InMemoryEventBus::new(64));
    let handler: InstanceHandler<Engine> = instance_handler(&store, &adapter, bus);

    let obj = engine("vol-1-e");
    let spec = running_spec("node-1", "img:v1");
    let mut status = InstanceStatus::default();

    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("first reconcile");
    assert_eq!(adapter.creates(), 1);

    // The process now exists remotely but the manager snapshot still lacks
    // it: the next reconcile probes instead of re-creating.
    store.update_manager("im-1", |im| {
        im.status
            .instance_engines
            .insert("vol-1-e".to_string(), running_process(10001, "u1"));
    });
    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("second reconcile");
    assert_eq!(adapter.creates(), 1);
    assert_eq!(status.current_state, InstanceState::Running);
}

#[tokio::test]
async fn observed_running_process_fills_runtime_fields() {
    let store = FakeStore::new();
    let mut im = running_manager("im-1", "node-1", "10.0.0.5");
    im.status
        .instance_engines
        .insert("vol-1-e".to_string(), running_process(10001, "u1"));
    store.put_manager(im);
    let adapter = FakeAdapter::new();
    let bus = Arc::new(InMemoryEventBus::new(64));
    let handler: InstanceHandler<Engine> = instance_handler(&store, &adapter, bus);

    let obj = engine("vol-1-e");
    let spec = running_spec("node-1", "img:v1");
    let mut status = InstanceStatus::default();

    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("reconcile");

    assert_eq!(status.current_state, InstanceState::Running);
    assert_eq!(status.ip, "10.0.0.5");
    assert_eq!(status.storage_ip, "10.0.0.5");
    assert_eq!(status.port, 10001);
    assert_eq!(status.uuid, "u1");
    assert_eq!(status.current_image, "img:v1");
    assert!(status.started);
    assert_eq!(status.instance_manager_name, "im-1");
}

#[tokio::test]
async fn reconcile_is_idempotent_without_external_changes() {
    let store = FakeStore::new();
    let mut im = running_manager("im-1", "node-1", "10.0.0.5");
    im.status
        .instance_engines
        .insert("vol-1-e".to_string(), running_process(10001, "u1"));
    store.put_manager(im);
    let adapter = FakeAdapter::new();
    let bus = Arc::new(InMemoryEventBus::new(64));
    let handler: InstanceHandler<Engine> = instance_handler(&store, &adapter, bus);

    let obj = engine("vol-1-e");
    let spec = running_spec("node-1", "img:v1");
    let mut status = InstanceStatus::default();

    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("first reconcile");
    let first = serde_json::to_value(&status).expect("serialize status");

    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("second reconcile");
    let second = serde_json::to_value(&status).expect("serialize status");

    assert_eq!(first, second);
}

#[tokio::test]
async fn node_down_marks_started_instance_unknown() {
    let store = FakeStore::new();
    let mut im = running_manager("im-1", "node-1", "10.0.0.5");
    im.status.current_state = InstanceManagerState::Unknown;
    store.put_manager(im);
    let adapter = FakeAdapter::new();
    let bus = Arc::new(InMemoryEventBus::new(64));
    let handler: InstanceHandler<Engine> = instance_handler(&store, &adapter, bus);

    let obj = engine("vol-1-e");
    let spec = running_spec("node-1", "img:v1");
    let mut status = InstanceStatus {
        current_state: InstanceState::Running,
        instance_manager_name: "im-1".to_string(),
        started: true,
        ip: "10.0.0.5".to_string(),
        port: 10001,
        ..Default::default()
    };

    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("reconcile");

    assert_eq!(status.current_state, InstanceState::Unknown);
    assert_eq!(status.ip, "");
    assert_eq!(status.port, 0);
}

#[tokio::test]
async fn delinquent_node_counts_as_unavailable() {
    let store = FakeStore::new();
    store.put_manager(running_manager("im-1", "node-1", "10.0.0.5"));
    store.state.lock().unwrap().delinquent = true;
    let adapter = FakeAdapter::new();
    let bus = Arc::new(InMemoryEventBus::new(64));
    let handler: InstanceHandler<Engine> = instance_handler(&store, &adapter, bus);

    let obj = engine("vol-1-e");
    let spec = running_spec("node-1", "img:v1");
    let mut status = InstanceStatus {
        current_state: InstanceState::Running,
        instance_manager_name: "im-1".to_string(),
        started: true,
        ..Default::default()
    };

    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("reconcile");
    assert_eq!(status.current_state, InstanceState::Unknown);
}

#[tokio::test]
async fn image_upgrade_preserves_current_image() {
    let store = FakeStore::new();
    let mut im = running_manager("im-1", "node-1", "10.0.0.5");
    im.status
        .instance_engines
        .insert("vol-1-e".to_string(), running_process(10001, "u1"));
    store.put_manager(im);
    let adapter = FakeAdapter::new();
    let bus = Arc::new(InMemoryEventBus::new(64));
    let handler: InstanceHandler<Engine> = instance_handler(&store, &adapter, bus);

    let obj = engine("vol-1-e");
    let spec = running_spec("node-1", "img:v2");
    let mut status = InstanceStatus {
        current_state: InstanceState::Running,
        current_image: "img:v1".to_string(),
        instance_manager_name: "im-1".to_string(),
        started: true,
        ..Default::default()
    };

    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("reconcile");

    assert_eq!(status.current_state, InstanceState::Running);
    assert_eq!(status.current_image, "img:v1");
}

#[tokio::test]
async fn stop_request_deletes_the_process_and_emits_stop() {
    let store = FakeStore::new();
    let mut im = running_manager("im-1", "node-1", "10.0.0.5");
    im.status
        .instance_engines
        .insert("vol-1-e".to_string(), running_process(10001, "u1"));
    store.put_manager(im);
    let adapter = FakeAdapter::new();
    let bus = Arc::new(InMemoryEventBus::new(64));
    let handler: InstanceHandler<Engine> = instance_handler(&store, &adapter, Arc::clone(&bus));

    let mut events = bus
        .subscribe("engine", SubscriptionOptions)
        .expect("subscribe");

    let obj = engine("vol-1-e");
    let spec = InstanceSpec {
        volume_name: "vol-1".to_string(),
        desire_state: InstanceState::Stopped,
        ..Default::default()
    };
    let mut status = InstanceStatus {
        current_state: InstanceState::Running,
        instance_manager_name: "im-1".to_string(),
        started: true,
        ..Default::default()
    };

    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("reconcile");

    assert_eq!(adapter.deletes(), 1);
    assert!(!status.started);

    let event = timeout(Duration::from_secs(1), events.stream.next())
        .await
        .expect("event timeout")
        .expect("stream open")
        .expect("event");
    assert_eq!(event.reason, EventReason::Stop);
    assert_eq!(event.event_type, EventType::Normal);
}

#[tokio::test]
async fn stopped_v2_replica_process_is_preserved() {
    let store = FakeStore::new();
    let mut im = running_manager("im-1", "node-1", "10.0.0.5");
    let mut process = running_process(0, "");
    process.spec = InstanceProcessSpec {
        data_engine: DataEngine::V2,
    };
    process.status.state = InstanceState::Stopped;
    im.status
        .instance_replicas
        .insert("vol-1-r".to_string(), process);
    store.put_manager(im);
    let adapter = FakeAdapter::new();
    let bus = Arc::new(InMemoryEventBus::new(64));
    let handler: InstanceHandler<Replica> = instance_handler(&store, &adapter, bus);

    let obj = replica("vol-1-r");
    let spec = InstanceSpec {
        volume_name: "vol-1".to_string(),
        data_engine: DataEngine::V2,
        desire_state: InstanceState::Stopped,
        ..Default::default()
    };
    let mut status = InstanceStatus {
        instance_manager_name: "im-1".to_string(),
        ..Default::default()
    };

    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("reconcile");

    assert_eq!(adapter.deletes(), 0);
    assert_stopped_invariant(&status);
}

#[tokio::test]
async fn node_mismatch_degrades_to_error_and_surfaces() {
    let store = FakeStore::new();
    let mut im = running_manager("im-1", "node-1", "10.0.0.5");
    im.status
        .instance_engines
        .insert("vol-1-e".to_string(), running_process(10001, "u1"));
    store.put_manager(im);
    let adapter = FakeAdapter::new();
    let bus = Arc::new(InMemoryEventBus::new(64));
    let handler: InstanceHandler<Engine> = instance_handler(&store, &adapter, bus);

    let obj = engine("vol-1-e");
    // Scheduled to node-2, but the governing manager lives on node-1.
    let spec = running_spec("node-2", "img:v1");
    let mut status = InstanceStatus {
        instance_manager_name: "im-1".to_string(),
        ..Default::default()
    };

    let err = handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect_err("node mismatch must surface");
    assert!(matches!(err, InstanceError::NodeMismatch { .. }));
    assert_eq!(status.current_state, InstanceState::Error);
    assert_eq!(status.ip, "");
    assert_eq!(status.storage_ip, "");
}

#[tokio::test]
async fn started_instance_missing_from_manager_is_an_error() {
    let store = FakeStore::new();
    store.put_manager(running_manager("im-1", "node-1", "10.0.0.5"));
    let adapter = FakeAdapter::new();
    let bus = Arc::new(InMemoryEventBus::new(64));
    let handler: InstanceHandler<Engine> = instance_handler(&store, &adapter, bus);

    let obj = engine("vol-1-e");
    let spec = running_spec("node-1", "img:v1");
    let mut status = InstanceStatus {
        current_state: InstanceState::Running,
        instance_manager_name: "im-1".to_string(),
        started: true,
        ..Default::default()
    };

    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("reconcile");
    assert_eq!(status.current_state, InstanceState::Error);
}

#[tokio::test]
async fn failed_create_emits_failed_starting() {
    let store = FakeStore::new();
    store.put_manager(running_manager("im-1", "node-1", "10.0.0.5"));
    let adapter = FakeAdapter::new();
    *adapter.create_fails.lock().unwrap() = true;
    let bus = Arc::new(InMemoryEventBus::new(64));
    let handler: InstanceHandler<Engine> = instance_handler(&store, &adapter, Arc::clone(&bus));

    let mut events = bus
        .subscribe("engine", SubscriptionOptions)
        .expect("subscribe");

    let obj = engine("vol-1-e");
    let spec = running_spec("node-1", "img:v1");
    let mut status = InstanceStatus::default();

    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect_err("create failure surfaces");

    let event = timeout(Duration::from_secs(1), events.stream.next())
        .await
        .expect("event timeout")
        .expect("stream open")
        .expect("event");
    assert_eq!(event.reason, EventReason::FailedStarting);
    assert_eq!(event.event_type, EventType::Warning);
}

#[tokio::test]
async fn salvage_executed_latches_until_request_clears() {
    let store = FakeStore::new();
    store.put_manager(running_manager("im-1", "node-1", "10.0.0.5"));
    let adapter = FakeAdapter::new();
    let bus = Arc::new(InMemoryEventBus::new(64));
    let handler: InstanceHandler<Engine> = instance_handler(&store, &adapter, bus);

    let obj = engine("vol-1-e");
    let mut spec = running_spec("node-1", "img:v1");
    spec.salvage_requested = true;
    let mut status = InstanceStatus::default();

    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("reconcile");
    assert!(status.salvage_executed);

    spec.salvage_requested = false;
    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("reconcile cleared");
    assert!(!status.salvage_executed);
}

#[tokio::test]
async fn disabled_data_engine_leaves_the_instance_alone() {
    let store = FakeStore::new();
    store.put_manager(running_manager("im-1", "node-1", "10.0.0.5"));
    store.state.lock().unwrap().engine_enabled = false;
    let adapter = FakeAdapter::new();
    let bus = Arc::new(InMemoryEventBus::new(64));
    let handler: InstanceHandler<Engine> = instance_handler(&store, &adapter, bus);

    let obj = engine("vol-1-e");
    let spec = running_spec("node-1", "img:v1");
    let mut status = InstanceStatus::default();

    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("reconcile");
    assert_eq!(adapter.creates(), 0);
    assert_eq!(status.current_state, InstanceState::Stopped);
}

#[tokio::test]
async fn events_carry_the_object_reference() {
    let store = FakeStore::new();
    store.put_manager(running_manager("im-1", "node-1", "10.0.0.5"));
    let adapter = FakeAdapter::new();
    let bus = Arc::new(InMemoryEventBus::new(64));
    let handler: InstanceHandler<Engine> = instance_handler(&store, &adapter, Arc::clone(&bus));

    let event_task = {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move { next_event(&bus, "engine").await })
    };
    // Give the subscriber a beat to attach before publishing.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let obj = engine("vol-1-e");
    let spec = running_spec("node-1", "img:v1");
    let mut status = InstanceStatus::default();
    handler
        .reconcile_instance_state(&obj, &spec, &mut status)
        .await
        .expect("reconcile");

    let event = event_task.await.expect("join");
    assert_eq!(event.object.kind, "engine");
    assert_eq!(event.object.name, "vol-1-e");
    assert!(event.message.contains("vol-1-e"));
}
