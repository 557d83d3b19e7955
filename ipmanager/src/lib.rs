// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! # IP manager
//!
//! Hands out IPv4 addresses from subnet pools to requesters.
//!
//! Pools and their reservations live in one manager state object per namespace. Requesters
//! are separate objects that ask for addresses through an annotation and receive their
//! assignment through another one ([codec]). Many requesters compete for the same manager
//! state; [reconciler] serializes them with conditional writes and a two-step
//! propose/commit cycle. [controller] runs the reconciler on store change notifications.
//!
//! [runtime::IpManagerRuntimeBuilder] wires everything up against in-memory stores, or
//! against any other [store::Store] implementation.

pub mod cli;
pub mod codec;
pub mod config;
pub mod controller;
pub mod metrics;
pub mod model;
pub mod reconciler;
pub mod runtime;
pub mod snapshot;
pub mod status_api;
pub mod store;
pub mod tasks;
