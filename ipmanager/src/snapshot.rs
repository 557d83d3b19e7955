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
//! Persisted contents of the in-memory stores.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::model::{ManagerObject, RequesterObject};

/// All objects of both stores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub managers: Vec<ManagerObject>,
    #[serde(default)]
    pub requesters: Vec<RequesterObject>,
}

impl StateSnapshot {
    /// Reads a snapshot written by [StateSnapshot::save].
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let buf = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read state file {}", path.display()))?;
        serde_json::from_slice(&buf)
            .with_context(|| format!("failed to parse state file {}", path.display()))
    }

    /// Writes the snapshot to `path`, replacing the file only once it is complete.
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let buf = serde_json::to_vec_pretty(self).context("failed to encode state")?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, buf)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed to replace state file {}", path.display()))
    }
}
