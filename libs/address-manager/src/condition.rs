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
//! Status conditions.

use serde::{Deserialize, Serialize};

/// A named boolean status with a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition type, e.g. `UpdateInProgress`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Whether the condition holds.
    pub status: bool,
    /// Human-readable detail.
    #[serde(default)]
    pub message: String,
}

/// A list of conditions with at most one entry per type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    /// The condition of the given type.
    pub fn get(&self, kind: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.kind == kind)
    }

    /// Returns true if the condition exists and holds.
    pub fn is_true(&self, kind: &str) -> bool {
        self.get(kind).is_some_and(|c| c.status)
    }

    /// Sets a condition, replacing an existing entry of the same type.
    ///
    /// Returns true if anything changed.
    pub fn set(&mut self, kind: &str, status: bool, message: impl Into<String>) -> bool {
        let message = message.into();
        match self.0.iter_mut().find(|c| c.kind == kind) {
            Some(existing) if existing.status == status && existing.message == message => false,
            Some(existing) => {
                existing.status = status;
                existing.message = message;
                true
            }
            None => {
                self.0.push(Condition {
                    kind: kind.to_string(),
                    status,
                    message,
                });
                true
            }
        }
    }

    /// Removes the condition of the given type. Returns true if it existed.
    pub fn remove(&mut self, kind: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|c| c.kind != kind);
        before != self.0.len()
    }

    /// Iterates over all conditions.
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_keep_one_entry_per_type() {
        let mut conditions = Conditions::default();
        assert!(conditions.set("UpdateInProgress", true, "reserving"));
        assert!(!conditions.set("UpdateInProgress", true, "reserving"));
        assert!(conditions.set("UpdateInProgress", false, "done"));

        assert_eq!(conditions.iter().count(), 1);
        assert!(!conditions.is_true("UpdateInProgress"));
        assert_eq!(conditions.get("UpdateInProgress").unwrap().message, "done");

        assert!(conditions.remove("UpdateInProgress"));
        assert!(!conditions.remove("UpdateInProgress"));
    }

    #[test]
    fn should_serialize_as_list() {
        let mut conditions = Conditions::default();
        conditions.set("UpdateInProgress", true, "reserving");
        let json = serde_json::to_value(&conditions).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{"type": "UpdateInProgress", "status": true, "message": "reserving"}])
        );
    }
}
