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
//! Objects the IP manager reads and writes.

use address_manager::{condition::Conditions, manager::dto::ManagerStateDto};
use serde::{Deserialize, Serialize};

use crate::store::{Object, ObjectKey};

/// Default name of the manager state object in every namespace.
pub const DEFAULT_MANAGER_NAME: &str = "ipmanager";

/// Condition set on a requester whose request cannot be satisfied.
pub const RESERVATION_FAILED: &str = "ReservationFailed";

const FINALIZER_PREFIX: &str = "ipmanager.network/reservation-";

/// The stored manager state.
pub type ManagerObject = Object<ManagerStateDto>;

/// A stored requester.
pub type RequesterObject = Object<Requester>;

/// A client asking for addresses.
///
/// What it asks for lives in its annotations; see [crate::codec].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    #[serde(default)]
    pub spec: RequesterSpec,
    #[serde(default)]
    pub status: RequesterStatus,
}

/// Requester properties owned by its creator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Requester properties owned by the IP manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterStatus {
    /// True once every requested network has an address.
    #[serde(default)]
    pub allocated: bool,
    #[serde(default)]
    pub conditions: Conditions,
}

/// Key of the manager state object of `namespace`.
pub fn manager_key(namespace: &str, manager_name: &str) -> ObjectKey {
    ObjectKey::new(namespace, manager_name)
}

/// Cleanup marker placed on the manager state for each requester holding reservations.
pub fn reservation_finalizer(requester: &str) -> String {
    format!("{FINALIZER_PREFIX}{requester}")
}

/// The requester named by a finalizer created with [reservation_finalizer].
pub fn finalizer_owner(finalizer: &str) -> Option<&str> {
    finalizer.strip_prefix(FINALIZER_PREFIX)
}
