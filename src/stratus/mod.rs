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

//! Control-plane core for the stratus block-storage system.
//!
//! The crate is split into the generic reconciliation engine
//! ([`controller`]: work queue, informer cache, controller runtime) and the
//! instance state machine ([`instance`]) that drives engine/replica processes
//! on remote nodes toward their declared desired state. The data store and
//! the per-node instance manager are external collaborators reached through
//! the traits in [`datastore`] and [`instance::manager`].

pub mod config;
pub mod controller;
pub mod datastore;
pub mod events;
pub mod instance;
pub mod logger;
pub mod util;

pub use config::Config;
