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
//! IP manager configuration.

use std::{collections::BTreeMap, path::Path, time::Duration};

use address_manager::{
    manager::dto::{NetworkDto, networks_from_dto},
    pool::Network,
};
use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::{codec::DEFAULT_ANNOTATION_PREFIX, model::DEFAULT_MANAGER_NAME};

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Backoff for triggers that failed with a transient error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Attempts after which a trigger is left to the periodic resync.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            max_attempts: 20,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (starting at 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Validated IP manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Name of the manager state object in each namespace.
    pub manager_name: String,
    pub annotation_prefix: String,
    /// Number of concurrent reconcile workers.
    pub workers: usize,
    pub resync_interval: Duration,
    pub retry: RetryPolicy,
    /// Pool definitions by namespace and network name.
    pub namespaces: BTreeMap<String, BTreeMap<String, Network>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manager_name: DEFAULT_MANAGER_NAME.to_string(),
            annotation_prefix: DEFAULT_ANNOTATION_PREFIX.to_string(),
            workers: DEFAULT_WORKERS,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            retry: RetryPolicy::default(),
            namespaces: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let dto: ConfigDto = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        dto.try_into()
            .with_context(|| format!("invalid config {}", path.display()))
    }
}

/// Configuration file format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDto {
    #[serde(default = "default_manager_name")]
    pub manager_name: String,
    #[serde(default = "default_annotation_prefix")]
    pub annotation_prefix: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_resync_interval", with = "humantime_serde")]
    pub resync_interval: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub namespaces: BTreeMap<String, NamespaceDto>,
}

/// Pools of one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceDto {
    pub networks: BTreeMap<String, NetworkDto>,
}

fn default_manager_name() -> String {
    DEFAULT_MANAGER_NAME.to_string()
}

fn default_annotation_prefix() -> String {
    DEFAULT_ANNOTATION_PREFIX.to_string()
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_resync_interval() -> Duration {
    DEFAULT_RESYNC_INTERVAL
}

impl TryFrom<ConfigDto> for Config {
    type Error = anyhow::Error;

    fn try_from(value: ConfigDto) -> Result<Self, Self::Error> {
        if value.workers == 0 {
            bail!("workers must be greater than 0");
        }
        if value.resync_interval.is_zero() {
            bail!("resyncInterval must be greater than 0");
        }
        if value.manager_name.is_empty() {
            bail!("managerName must not be empty");
        }
        if value.retry.max_attempts == 0 {
            bail!("retry.maxAttempts must be greater than 0");
        }

        let namespaces = value
            .namespaces
            .into_iter()
            .map(|(namespace, ns)| {
                let networks = networks_from_dto(ns.networks)
                    .with_context(|| format!("invalid networks in namespace {namespace}"))?;
                Ok((namespace, networks))
            })
            .collect::<Result<_, Self::Error>>()?;

        Ok(Self {
            manager_name: value.manager_name,
            annotation_prefix: value.annotation_prefix,
            workers: value.workers,
            resync_interval: value.resync_interval,
            retry: value.retry,
            namespaces,
        })
    }
}
