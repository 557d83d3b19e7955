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
//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use address_manager::{
    manager::{ManagerState, dto::ManagerStateDto},
    pool::{AddressPool, AllocationRange, Network},
};
use async_trait::async_trait;
use ipam_observability::metrics::MetricsRegistry;
use ipmanager::{
    codec::{AnnotationCodec, NetworkRequest, Results},
    config::{Config, RetryPolicy},
    metrics::Metrics,
    model::{DEFAULT_MANAGER_NAME, Requester, RequesterObject, manager_key},
    reconciler::Reconciler,
    store::{ChangeEvent, Object, ObjectKey, Store, StoreError, memory::InMemoryStore},
};
use tokio::sync::broadcast;

pub const NAMESPACE: &str = "openstack";

/// Network `net1` with the single subnet `sub1`.
pub fn networks(cidr: &str, start: &str, end: &str, gateway: &str) -> BTreeMap<String, Network> {
    let pool = AddressPool::new(
        "sub1",
        cidr.parse().unwrap(),
        AllocationRange {
            start: start.parse().unwrap(),
            end: end.parse().unwrap(),
        },
    )
    .with_gateway(gateway.parse().unwrap());

    BTreeMap::from([(
        "net1".to_string(),
        Network {
            subnets: vec![pool],
            mtu: 1500,
            domain_name: "net1.example.com".to_string(),
        },
    )])
}

/// `10.0.0.0/29`, allocating `10.0.0.2` to `10.0.0.5`.
pub fn small_networks() -> BTreeMap<String, Network> {
    networks("10.0.0.0/29", "10.0.0.2", "10.0.0.5", "10.0.0.1")
}

/// Config managing [NAMESPACE] with `networks` and fast retries.
pub fn config(networks: BTreeMap<String, Network>) -> Config {
    Config {
        workers: 4,
        resync_interval: Duration::from_millis(500),
        retry: RetryPolicy {
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(50),
            max_attempts: 100,
        },
        namespaces: BTreeMap::from([(NAMESPACE.to_string(), networks)]),
        ..Config::default()
    }
}

pub fn addr(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn requester_key(name: &str) -> ObjectKey {
    ObjectKey::new(NAMESPACE, name)
}

/// Reconciler over in-memory stores with a bootstrapped manager state.
pub struct Fixture {
    pub managers: Arc<dyn Store<ManagerStateDto>>,
    pub requesters: Arc<dyn Store<Requester>>,
    pub reconciler: Reconciler,
    pub codec: AnnotationCodec,
    pub registry: MetricsRegistry,
}

impl Fixture {
    pub async fn new(networks: BTreeMap<String, Network>) -> Self {
        Self::with_stores(
            networks,
            Arc::new(InMemoryStore::<ManagerStateDto>::new()),
            Arc::new(InMemoryStore::<Requester>::new()),
        )
        .await
    }

    pub async fn with_stores(
        networks: BTreeMap<String, Network>,
        managers: Arc<dyn Store<ManagerStateDto>>,
        requesters: Arc<dyn Store<Requester>>,
    ) -> Self {
        let registry = MetricsRegistry::new();
        let codec = AnnotationCodec::default();
        let reconciler = Reconciler::new(
            managers.clone(),
            requesters.clone(),
            codec.clone(),
            DEFAULT_MANAGER_NAME,
            Metrics::new(&registry),
        );
        reconciler
            .bootstrap_manager(NAMESPACE, &networks)
            .await
            .expect("bootstrap manager");
        Self {
            managers,
            requesters,
            reconciler,
            codec,
            registry,
        }
    }

    /// Creates a requester asking for `requests`.
    pub async fn add_requester(&self, name: &str, requests: &[NetworkRequest]) -> RequesterObject {
        add_requester(self.requesters.as_ref(), &self.codec, name, requests).await
    }

    pub async fn requester(&self, name: &str) -> RequesterObject {
        self.requesters.get(&requester_key(name)).await.unwrap()
    }

    pub async fn results(&self, name: &str) -> Results {
        let requester = self.requester(name).await;
        self.codec
            .decode_results(&requester.meta.annotations)
            .unwrap()
    }

    pub async fn manager(&self) -> Object<ManagerStateDto> {
        self.managers
            .get(&manager_key(NAMESPACE, DEFAULT_MANAGER_NAME))
            .await
            .unwrap()
    }

    pub async fn state(&self) -> ManagerState {
        self.manager().await.body.try_into().unwrap()
    }

    pub fn metrics_text(&self) -> String {
        String::from_utf8(self.registry.render()).unwrap()
    }
}

pub async fn add_requester(
    store: &dyn Store<Requester>,
    codec: &AnnotationCodec,
    name: &str,
    requests: &[NetworkRequest],
) -> RequesterObject {
    let object = Object::new(requester_key(name), Requester::default()).with_annotation(
        codec.request_key(),
        codec.encode_requests(requests).unwrap(),
    );
    store.create(object).await.unwrap()
}

/// Polls `check` until it holds, panicking after a few seconds.
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Store wrapper that fails writes on demand.
pub struct FlakyStore<T> {
    inner: InMemoryStore<T>,
    /// The next this many updates fail with [StoreError::Unavailable].
    fail_next: AtomicU32,
    /// The next this many updates fail with [StoreError::VersionConflict].
    conflict_next: AtomicU32,
    /// Every n-th update fails with [StoreError::Unavailable]; 0 disables.
    fail_every: u32,
    updates: AtomicU32,
}

impl<T> FlakyStore<T> {
    pub fn new(inner: InMemoryStore<T>) -> Self {
        Self {
            inner,
            fail_next: AtomicU32::new(0),
            conflict_next: AtomicU32::new(0),
            fail_every: 0,
            updates: AtomicU32::new(0),
        }
    }

    pub fn failing_every(mut self, n: u32) -> Self {
        self.fail_every = n;
        self
    }

    pub fn fail_next_updates(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn conflict_next_updates(&self, n: u32) {
        self.conflict_next.store(n, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl<T> Store<T> for FlakyStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<Object<T>, StoreError> {
        self.inner.get(key).await
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Object<T>>, StoreError> {
        self.inner.list(namespace).await
    }

    async fn create(&self, object: Object<T>) -> Result<Object<T>, StoreError> {
        self.inner.create(object).await
    }

    async fn update(
        &self,
        object: Object<T>,
        expected_version: u64,
    ) -> Result<Object<T>, StoreError> {
        let n = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
        if Self::take(&self.fail_next) || (self.fail_every > 0 && n % self.fail_every == 0) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        if Self::take(&self.conflict_next) {
            return Err(StoreError::VersionConflict {
                key: object.meta.key,
                expected: expected_version,
                actual: expected_version + 1,
            });
        }
        self.inner.update(object, expected_version).await
    }

    async fn patch_annotation(
        &self,
        key: &ObjectKey,
        annotation: &str,
        value: Option<String>,
    ) -> Result<Object<T>, StoreError> {
        self.inner.patch_annotation(key, annotation, value).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.watch()
    }
}
