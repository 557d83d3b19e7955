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
//! # Address Manager
//!
//! Allocate IPv4 addresses from subnet pools.
//!
//! [allocator::allocate] picks the lowest free address of an [pool::AddressPool], or
//! checks a requested fixed address. It does not touch the pool; the caller decides
//! whether to keep the result.
//!
//! [manager::ManagerState] holds the pools of one scope, records reservations per
//! requester and keeps a working and a published view of them, separated by the
//! `UpdateInProgress` condition.
//!
//! [manager::dto] contains the persisted form of the state.

pub mod allocator;
pub mod condition;
pub mod manager;
pub mod pool;
