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
//! In-memory store.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{ChangeEvent, ChangeKind, Object, ObjectKey, Store, StoreError};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Inner<T> {
    objects: BTreeMap<ObjectKey, Object<T>>,
    /// Last version handed out. Versions are unique across the store.
    version: u64,
}

/// A [Store] that keeps all objects in memory.
#[derive(Debug, Clone)]
pub struct InMemoryStore<T> {
    inner: Arc<RwLock<Inner<T>>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl<T> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> InMemoryStore<T> {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(Inner {
                objects: BTreeMap::new(),
                version: 0,
            })),
            events,
        }
    }

    /// Creates a store holding `objects`, keeping their versions.
    pub fn from_objects(objects: impl IntoIterator<Item = Object<T>>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.write().unwrap();
            for object in objects {
                inner.version = inner.version.max(object.meta.version);
                inner.objects.insert(object.meta.key.clone(), object);
            }
        }
        store
    }

    fn notify(&self, kind: ChangeKind, key: ObjectKey) {
        // No receivers is fine.
        let _ = self.events.send(ChangeEvent { kind, key });
    }
}

impl<T: Clone> InMemoryStore<T> {
    /// Returns all stored objects.
    pub fn snapshot(&self) -> Vec<Object<T>> {
        self.inner.read().unwrap().objects.values().cloned().collect()
    }
}

#[async_trait]
impl<T> Store<T> for InMemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<Object<T>, StoreError> {
        self.inner
            .read()
            .unwrap()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Object<T>>, StoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .objects
            .values()
            .filter(|o| o.meta.key.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn create(&self, mut object: Object<T>) -> Result<Object<T>, StoreError> {
        let key = object.meta.key.clone();
        {
            let mut inner = self.inner.write().unwrap();
            if inner.objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists(key));
            }
            inner.version += 1;
            object.meta.version = inner.version;
            inner.objects.insert(key.clone(), object.clone());
        }
        self.notify(ChangeKind::Created, key);
        Ok(object)
    }

    async fn update(
        &self,
        mut object: Object<T>,
        expected_version: u64,
    ) -> Result<Object<T>, StoreError> {
        let key = object.meta.key.clone();
        {
            let mut inner = self.inner.write().unwrap();
            let actual = match inner.objects.get(&key) {
                Some(stored) => stored.meta.version,
                None => return Err(StoreError::NotFound(key)),
            };
            if actual != expected_version {
                return Err(StoreError::VersionConflict {
                    key,
                    expected: expected_version,
                    actual,
                });
            }
            inner.version += 1;
            object.meta.version = inner.version;
            inner.objects.insert(key.clone(), object.clone());
        }
        self.notify(ChangeKind::Updated, key);
        Ok(object)
    }

    async fn patch_annotation(
        &self,
        key: &ObjectKey,
        annotation: &str,
        value: Option<String>,
    ) -> Result<Object<T>, StoreError> {
        let object = {
            let mut inner = self.inner.write().unwrap();
            if !inner.objects.contains_key(key) {
                return Err(StoreError::NotFound(key.clone()));
            }
            inner.version += 1;
            let version = inner.version;
            let object = inner
                .objects
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            match value {
                Some(value) => object.meta.annotations.insert(annotation.to_string(), value),
                None => object.meta.annotations.remove(annotation),
            };
            object.meta.version = version;
            object.clone()
        };
        self.notify(ChangeKind::Updated, key.clone());
        Ok(object)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.inner
            .write()
            .unwrap()
            .objects
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        self.notify(ChangeKind::Deleted, key.clone());
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}
