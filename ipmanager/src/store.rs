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
//! Versioned object store.
//!
//! The IP manager keeps all of its state in an external store. The store holds
//! objects identified by an [ObjectKey], each carrying a version token that
//! changes on every write. [Store::update] is a conditional write: it only
//! succeeds if the stored version still matches the version the caller read.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub mod memory;

/// Identifies an object within a store.
#[derive(
    Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[display("{namespace}/{name}")]
pub struct ObjectKey {
    /// Scope of the object.
    pub namespace: String,
    /// Name of the object within its namespace.
    pub name: String,
}

impl ObjectKey {
    /// Creates a new key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// Metadata shared by all stored objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: ObjectKey,
    /// Version token, assigned by the store.
    #[serde(default)]
    pub version: u64,
    /// String-keyed metadata.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Cleanup markers.
    #[serde(default)]
    pub finalizers: BTreeSet<String>,
}

/// A stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object<T> {
    pub meta: ObjectMeta,
    pub body: T,
}

impl<T> Object<T> {
    /// Creates an object that has not been stored yet.
    pub fn new(key: ObjectKey, body: T) -> Self {
        Self {
            meta: ObjectMeta {
                key,
                version: 0,
                annotations: BTreeMap::new(),
                finalizers: BTreeSet::new(),
            },
            body,
        }
    }

    /// Adds an annotation.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.annotations.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> &ObjectKey {
        &self.meta.key
    }

    pub fn version(&self) -> u64 {
        self.meta.version
    }

    /// The annotation stored under `key`.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.meta.annotations.get(key).map(String::as_str)
    }
}

/// Kind of change reported by [Store::watch].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub key: ObjectKey,
}

/// Store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No object with this key.
    #[error("object {0} not found")]
    NotFound(ObjectKey),
    /// Create of an existing key.
    #[error("object {0} already exists")]
    AlreadyExists(ObjectKey),
    /// The object changed since it was read.
    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },
    /// The store could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Access to a collection of versioned objects.
#[async_trait]
pub trait Store<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Returns the object stored under `key`.
    async fn get(&self, key: &ObjectKey) -> Result<Object<T>, StoreError>;

    /// Returns all objects of `namespace`, ordered by name.
    async fn list(&self, namespace: &str) -> Result<Vec<Object<T>>, StoreError>;

    /// Stores a new object. The version of `object` is ignored.
    async fn create(&self, object: Object<T>) -> Result<Object<T>, StoreError>;

    /// Replaces the object if its stored version equals `expected_version`.
    ///
    /// Returns the stored object with its new version.
    async fn update(&self, object: Object<T>, expected_version: u64)
    -> Result<Object<T>, StoreError>;

    /// Sets (or with `None` removes) a single annotation, regardless of the version.
    async fn patch_annotation(
        &self,
        key: &ObjectKey,
        annotation: &str,
        value: Option<String>,
    ) -> Result<Object<T>, StoreError>;

    /// Removes the object.
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Subscribes to change notifications.
    fn watch(&self) -> broadcast::Receiver<ChangeEvent>;
}
