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
//! IP manager runtime.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use address_manager::{manager::dto::ManagerStateDto, pool::Network};
use anyhow::Context;
use ipam_observability::metrics::MetricsRegistry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    codec::AnnotationCodec,
    config::{Config, RetryPolicy},
    controller::Controller,
    metrics::Metrics,
    model::Requester,
    reconciler::Reconciler,
    snapshot::StateSnapshot,
    status_api::{self, StatusApiState},
    store::{Store, memory::InMemoryStore},
    tasks::TaskSet,
};

enum PathOrObject<T> {
    Unspecified,
    Path(PathBuf),
    Object(T),
}

impl PathOrObject<StateSnapshot> {
    async fn load(self) -> anyhow::Result<StateSnapshot> {
        match self {
            PathOrObject::Unspecified => Ok(StateSnapshot::default()),
            PathOrObject::Path(path) if !path.exists() => {
                info!(path=%path.display(), "State file does not exist yet, starting empty");
                Ok(StateSnapshot::default())
            }
            PathOrObject::Path(path) => StateSnapshot::load(path).await,
            PathOrObject::Object(snapshot) => Ok(snapshot),
        }
    }
}

type Stores = (Arc<dyn Store<ManagerStateDto>>, Arc<dyn Store<Requester>>);

/// Builder for an IP manager runtime.
pub struct IpManagerRuntimeBuilder {
    config: Config,
    snapshot: PathOrObject<StateSnapshot>,
    state_file: Option<PathBuf>,
    status_addr: Option<SocketAddr>,
    metrics_registry: Option<MetricsRegistry>,
    stores: Option<Stores>,
}

impl IpManagerRuntimeBuilder {
    /// Create a new runtime builder for `config`.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            snapshot: PathOrObject::Unspecified,
            state_file: None,
            status_addr: None,
            metrics_registry: None,
            stores: None,
        }
    }

    /// Load the in-memory stores from `path` (if it exists) and write them back to it on
    /// shutdown.
    pub fn with_state_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.snapshot = PathOrObject::Path(path.as_ref().into());
        self.state_file = Some(path.as_ref().into());
        self
    }

    /// Seed the in-memory stores with `snapshot`.
    pub fn with_snapshot(mut self, snapshot: StateSnapshot) -> Self {
        self.snapshot = PathOrObject::Object(snapshot);
        self
    }

    /// Run against the given stores instead of in-memory ones.
    pub fn with_stores(
        mut self,
        managers: Arc<dyn Store<ManagerStateDto>>,
        requesters: Arc<dyn Store<Requester>>,
    ) -> Self {
        self.stores = Some((managers, requesters));
        self
    }

    /// Serve the status API on `addr`.
    pub fn with_status_addr(mut self, addr: SocketAddr) -> Self {
        self.status_addr = Some(addr);
        self
    }

    /// Register metrics on `registry` instead of a fresh one.
    pub fn with_metrics_registry(mut self, registry: MetricsRegistry) -> Self {
        self.metrics_registry = Some(registry);
        self
    }

    /// Start the runtime.
    pub async fn start(self) -> anyhow::Result<IpManagerRuntime> {
        self.start_with_task_set(TaskSet::new()).await
    }

    /// Start the runtime on `tasks`.
    pub async fn start_with_task_set(self, mut tasks: TaskSet) -> anyhow::Result<IpManagerRuntime> {
        let registry = self.metrics_registry.unwrap_or_default();
        let config = self.config;

        let mut memory = None;
        let (managers, requesters): Stores = match self.stores {
            Some(stores) => stores,
            None => {
                let snapshot = self.snapshot.load().await?;
                let managers = InMemoryStore::from_objects(snapshot.managers);
                let requesters = InMemoryStore::from_objects(snapshot.requesters);
                memory = Some((managers.clone(), requesters.clone()));
                let managers: Arc<dyn Store<ManagerStateDto>> = Arc::new(managers);
                let requesters: Arc<dyn Store<Requester>> = Arc::new(requesters);
                (managers, requesters)
            }
        };

        let metrics = Metrics::new(&registry);
        let reconciler = Arc::new(Reconciler::new(
            managers.clone(),
            requesters.clone(),
            AnnotationCodec::new(&config.annotation_prefix),
            config.manager_name.clone(),
            metrics.clone(),
        ));

        for (namespace, networks) in &config.namespaces {
            bootstrap(&reconciler, namespace, networks, &config.retry).await?;
        }

        let controller = Arc::new(Controller::new(reconciler, &config, metrics));
        controller.start(&mut tasks);

        let status_addr = match self.status_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind status API to {addr}"))?;
                let local_addr = listener.local_addr()?;
                let state = StatusApiState {
                    managers,
                    requesters,
                    manager_name: config.manager_name.clone(),
                    metrics_registry: registry,
                };
                let token = tasks.cancellation_token();
                tasks.spawn_cancellable(async move {
                    status_api::start(token, listener, state).await?;
                    Ok(())
                });
                Some(local_addr)
            }
            None => None,
        };

        Ok(IpManagerRuntime {
            tasks,
            controller,
            memory,
            state_file: self.state_file,
            status_addr,
        })
    }
}

/// Creates or merges the manager state of `namespace`, retrying transient failures.
async fn bootstrap(
    reconciler: &Reconciler,
    namespace: &str,
    networks: &BTreeMap<String, Network>,
    retry: &RetryPolicy,
) -> anyhow::Result<()> {
    let mut attempt = 0;
    loop {
        match reconciler.bootstrap_manager(namespace, networks).await {
            Ok(dropped) => {
                if !dropped.is_empty() {
                    warn!(%namespace, dropped=dropped.len(), "Pool definitions dropped reservations");
                }
                return Ok(());
            }
            Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                attempt += 1;
                tokio::time::sleep(retry.backoff(attempt)).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to bootstrap namespace {namespace}"));
            }
        }
    }
}

/// A running IP manager.
pub struct IpManagerRuntime {
    tasks: TaskSet,
    controller: Arc<Controller>,
    memory: Option<(InMemoryStore<ManagerStateDto>, InMemoryStore<Requester>)>,
    state_file: Option<PathBuf>,
    status_addr: Option<SocketAddr>,
}

impl IpManagerRuntime {
    /// Address the status API listens on.
    pub fn status_addr(&self) -> Option<SocketAddr> {
        self.status_addr
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    pub fn managers(&self) -> Arc<dyn Store<ManagerStateDto>> {
        self.controller.reconciler().managers().clone()
    }

    pub fn requesters(&self) -> Arc<dyn Store<Requester>> {
        self.controller.reconciler().requesters().clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.tasks.cancellation_token()
    }

    /// Contents of the in-memory stores. `None` when running against external stores.
    pub fn snapshot(&self) -> Option<StateSnapshot> {
        self.memory
            .as_ref()
            .map(|(managers, requesters)| {
                StateSnapshot {
                    managers: managers.snapshot(),
                    requesters: requesters.snapshot(),
                }
            })
    }

    /// Wait for all tasks to stop, then write the state file.
    pub async fn join(&mut self) -> anyhow::Result<()> {
        self.tasks.join_all().await;
        if let (Some(path), Some(snapshot)) = (&self.state_file, self.snapshot()) {
            snapshot.save(path).await?;
            info!(path=%path.display(), "Saved state");
        }
        Ok(())
    }

    /// Stop and join all the tasks.
    pub async fn stop_and_join(&mut self) -> anyhow::Result<()> {
        self.tasks.cancellation_token().cancel();
        self.join().await
    }
}
