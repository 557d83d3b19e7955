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
//! The reservation protocol.
//!
//! Reservations are made in two steps, driven by two kinds of triggers:
//!
//! 1. **Propose** ([Reconciler::reconcile_requester]): if the manager state is idle, the
//!    requester's pending network requests are allocated in the working view, the state is
//!    marked `UpdateInProgress` and written back with a conditional write. Then the results
//!    are written to the requester, again conditionally.
//! 2. **Commit** ([Reconciler::reconcile_manager]): the `UpdateInProgress` condition is
//!    cleared and the working view is published. Reservations of requesters that no longer
//!    exist are released in the same write.
//!
//! The conditional writes are what keeps two proposals from handing out the same address.
//! `UpdateInProgress` only makes concurrent requesters back off ([ReconcileError::Busy])
//! instead of racing each other into version conflicts.
//!
//! A requester is reserved once its result annotation covers every requested network. Its
//! reservation is kept in the pool under the requester's name, so a proposal that was
//! written to the pool but not to the requester is picked up again by the next attempt
//! instead of allocating a second address.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use address_manager::{
    allocator::AllocationError,
    manager::{Dropped, ManagerState, Released, ReserveError, dto::ManagerStateDto},
    pool::{Network, PoolError},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    codec::{AnnotationCodec, CodecError, NetworkRequest, Results},
    metrics::Metrics,
    model::{
        ManagerObject, RESERVATION_FAILED, Requester, RequesterObject, finalizer_owner,
        manager_key, reservation_finalizer,
    },
    store::{Object, ObjectKey, Store, StoreError},
};

/// Reconcile errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A requested fixed address cannot be reserved.
    #[error("network {network}: {source}")]
    AddressConflict {
        network: String,
        source: AllocationError,
    },
    /// The requested subnet has no free address left.
    #[error("network {network}: {source}")]
    PoolExhausted {
        network: String,
        source: AllocationError,
    },
    /// The requested network or subnet does not exist.
    #[error("{0}")]
    UnknownPool(PoolError),
    /// A reservation would have broken the pool. Indicates a bug.
    #[error("{0}")]
    InvariantViolation(PoolError),
    /// The configured pool definitions are not usable.
    #[error("invalid pool definition: {0}")]
    InvalidDefinition(PoolError),
    /// The stored manager state cannot be read.
    #[error("manager state {key} is unusable: {reason}")]
    CorruptState { key: ObjectKey, reason: String },
    /// Another proposal waits to be committed.
    #[error("another reservation is in progress")]
    Busy,
    /// The object changed between read and write.
    #[error("{0} changed since it was read")]
    StaleWrite(ObjectKey),
    /// A request or result annotation cannot be decoded.
    #[error("malformed metadata: {0}")]
    MalformedMetadata(#[from] CodecError),
    /// The namespace has no manager state (yet).
    #[error("manager state {0} not found")]
    ManagerNotFound(ObjectKey),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ReconcileError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionConflict { key, .. } => Self::StaleWrite(key),
            e => Self::Store(e),
        }
    }
}

impl ReconcileError {
    /// Returns true if retrying the same trigger later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Busy | Self::StaleWrite(_) | Self::ManagerNotFound(_) | Self::Store(_)
        )
    }

    /// Short name used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddressConflict { .. } => "address_conflict",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::UnknownPool(_) => "unknown_pool",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::InvalidDefinition(_) => "invalid_definition",
            Self::CorruptState { .. } => "corrupt_state",
            Self::Busy => "busy",
            Self::StaleWrite(_) => "stale_write",
            Self::MalformedMetadata(_) => "malformed_metadata",
            Self::ManagerNotFound(_) => "manager_not_found",
            Self::Store(_) => "store",
        }
    }
}

/// Result of a requester trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequesterOutcome {
    /// The requester no longer exists.
    Gone,
    /// The requester does not ask for anything.
    NoRequest,
    /// Every requested network already has a result.
    AlreadyReserved,
    /// Results were written for these networks.
    Reserved(Vec<String>),
}

/// Result of a manager trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerOutcome {
    /// A pending proposal was committed.
    pub committed: bool,
    /// Reservations of vanished requesters.
    pub released: Vec<Released>,
}

/// Runs the reservation protocol against a manager store and a requester store.
pub struct Reconciler {
    managers: Arc<dyn Store<ManagerStateDto>>,
    requesters: Arc<dyn Store<Requester>>,
    codec: AnnotationCodec,
    manager_name: String,
    metrics: Metrics,
}

impl Reconciler {
    /// Creates a new reconciler.
    pub fn new(
        managers: Arc<dyn Store<ManagerStateDto>>,
        requesters: Arc<dyn Store<Requester>>,
        codec: AnnotationCodec,
        manager_name: impl Into<String>,
        metrics: Metrics,
    ) -> Self {
        Self {
            managers,
            requesters,
            codec,
            manager_name: manager_name.into(),
            metrics,
        }
    }

    pub fn manager_name(&self) -> &str {
        &self.manager_name
    }

    pub fn managers(&self) -> &Arc<dyn Store<ManagerStateDto>> {
        &self.managers
    }

    pub fn requesters(&self) -> &Arc<dyn Store<Requester>> {
        &self.requesters
    }

    /// Handles a trigger for the requester `key`.
    #[instrument(skip(self), fields(requester = %key))]
    pub async fn reconcile_requester(
        &self,
        key: &ObjectKey,
    ) -> Result<RequesterOutcome, ReconcileError> {
        let requester = match self.requesters.get(key).await {
            Ok(requester) => requester,
            Err(StoreError::NotFound(_)) => {
                debug!("Requester no longer exists");
                return Ok(RequesterOutcome::Gone);
            }
            Err(e) => return Err(e.into()),
        };

        let (requests, mut results) = match self.decode(&requester) {
            Ok(decoded) => decoded,
            Err(e) => return Err(self.record_failure(requester, e.into()).await),
        };
        if requests.is_empty() {
            return Ok(RequesterOutcome::NoRequest);
        }

        let pending: Vec<&NetworkRequest> = requests
            .iter()
            .filter(|r| !results.contains_key(&r.network))
            .collect();
        if pending.is_empty() {
            debug!("Requester already reserved");
            return Ok(RequesterOutcome::AlreadyReserved);
        }

        let manager_key = manager_key(&key.namespace, &self.manager_name);
        let manager = match self.managers.get(&manager_key).await {
            Ok(manager) => manager,
            Err(StoreError::NotFound(_)) => return Err(ReconcileError::ManagerNotFound(manager_key)),
            Err(e) => return Err(e.into()),
        };
        let mut state = load_state(&manager)?;
        if state.is_update_in_progress() {
            debug!("Reservation of another requester in progress");
            return Err(ReconcileError::Busy);
        }

        let mut changed = Vec::new();
        for request in &pending {
            let outcome = match state.reserve(
                &request.network,
                &request.subnet_name,
                &key.name,
                request.fixed_ip,
                request.vip,
            ) {
                Ok(outcome) => outcome,
                Err(e) => {
                    let e = classify(&request.network, e, &state);
                    return Err(self.record_failure(requester, e).await);
                }
            };
            debug!(
                network=%request.network, subnet=%request.subnet_name,
                address=%outcome.assignment.address, changed=outcome.changed, "Selected address"
            );
            if outcome.changed {
                changed.push(*request);
            }
            results.insert(request.network.clone(), outcome.assignment);
        }

        // The pool is written first. If the requester write below fails, the next attempt
        // finds the reservation in the pool and only repeats the requester write.
        if !changed.is_empty() {
            state.begin_update(format!("reserving addresses for {}", key.name));
            let mut proposal = manager.clone();
            proposal.body = ManagerStateDto::from(&state);
            proposal
                .meta
                .finalizers
                .insert(reservation_finalizer(&key.name));
            self.managers.update(proposal, manager.version()).await?;

            for request in &changed {
                self.metrics
                    .reservations_total
                    .with_label_values(&[request.network.as_str(), request.subnet_name.as_str()])
                    .inc();
            }
        }

        let mut answered = requester.clone();
        answered.meta.annotations.insert(
            self.codec.result_key().to_string(),
            self.codec.encode_results(&results)?,
        );
        answered.body.status.allocated = true;
        answered.body.status.conditions.remove(RESERVATION_FAILED);
        self.requesters.update(answered, requester.version()).await?;

        let networks: Vec<String> = pending.iter().map(|r| r.network.clone()).collect();
        info!(?networks, "Reserved addresses");
        Ok(RequesterOutcome::Reserved(networks))
    }

    /// Handles a trigger for the manager state of `namespace`.
    #[instrument(skip(self))]
    pub async fn reconcile_manager(
        &self,
        namespace: &str,
    ) -> Result<ManagerOutcome, ReconcileError> {
        let key = manager_key(namespace, &self.manager_name);
        let manager = match self.managers.get(&key).await {
            Ok(manager) => manager,
            Err(StoreError::NotFound(_)) => {
                debug!("No manager state");
                return Ok(ManagerOutcome::default());
            }
            Err(e) => return Err(e.into()),
        };
        let mut state = load_state(&manager)?;
        let committed = state.commit();

        // Listed after reading the manager state: every owner found in the state existed
        // before this list was taken.
        let present: BTreeSet<String> = self
            .requesters
            .list(namespace)
            .await?
            .into_iter()
            .map(|r| r.meta.key.name)
            .collect();
        let orphans: Vec<String> = state.owners().difference(&present).cloned().collect();
        let released: Vec<Released> = orphans
            .iter()
            .flat_map(|owner| state.release(owner))
            .collect();

        let owners = state.owners();
        let mut finalizers = manager.meta.finalizers.clone();
        finalizers.retain(|f| finalizer_owner(f).is_none_or(|owner| owners.contains(owner)));

        if committed || !released.is_empty() || finalizers != manager.meta.finalizers {
            let mut update = manager.clone();
            update.body = ManagerStateDto::from(&state);
            update.meta.finalizers = finalizers;
            self.managers.update(update, manager.version()).await?;
        }

        if committed {
            info!("Committed reservations");
        }
        for r in &released {
            info!(
                requester=%r.requester, network=%r.network, subnet=%r.subnet,
                address=%r.reservation.address, "Released reservation"
            );
        }
        self.metrics.released_total.inc_by(released.len() as u64);
        self.record_free_addresses(namespace, &state);

        Ok(ManagerOutcome {
            committed,
            released,
        })
    }

    /// Creates the manager state of `namespace` from `networks`, or merges `networks` into
    /// the existing state.
    ///
    /// Returns the reservations that did not fit the new definitions.
    #[instrument(skip(self, networks))]
    pub async fn bootstrap_manager(
        &self,
        namespace: &str,
        networks: &BTreeMap<String, Network>,
    ) -> Result<Vec<Dropped>, ReconcileError> {
        let key = manager_key(namespace, &self.manager_name);
        match self.managers.get(&key).await {
            Ok(manager) => {
                let mut state = load_state(&manager)?;
                let dropped = state
                    .merge_definitions(networks.clone())
                    .map_err(ReconcileError::InvalidDefinition)?;
                for d in &dropped {
                    warn!(
                        requester=%d.released.requester, network=%d.released.network,
                        subnet=%d.released.subnet, address=%d.released.reservation.address,
                        reason=%d.reason, "Dropped reservation"
                    );
                    self.forget_result(namespace, &d.released).await?;
                }
                // Requesters are updated first: a retry after a failed manager write sees
                // the same dropped reservations again.
                let mut update = manager.clone();
                update.body = ManagerStateDto::from(&state);
                if update.body != manager.body {
                    self.managers.update(update, manager.version()).await?;
                }
                Ok(dropped)
            }
            Err(StoreError::NotFound(_)) => {
                let state = ManagerState::new(networks.clone())
                    .map_err(ReconcileError::InvalidDefinition)?;
                self.managers
                    .create(Object::new(key, ManagerStateDto::from(&state)))
                    .await?;
                info!("Created manager state");
                self.record_free_addresses(namespace, &state);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the result of a released reservation from its requester, so that the next
    /// requester trigger reserves again.
    async fn forget_result(&self, namespace: &str, released: &Released) -> Result<(), ReconcileError> {
        let key = ObjectKey::new(namespace, released.requester.as_str());
        let requester = match self.requesters.get(&key).await {
            Ok(requester) => requester,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let Ok(mut results) = self.codec.decode_results(&requester.meta.annotations) else {
            // Left to the requester trigger, which reports the malformed annotation.
            return Ok(());
        };
        let Some(assignment) = results.get(&released.network) else {
            return Ok(());
        };
        if assignment.address != released.reservation.address {
            return Ok(());
        }
        results.remove(&released.network);

        let mut update = requester.clone();
        update.meta.annotations.insert(
            self.codec.result_key().to_string(),
            self.codec.encode_results(&results)?,
        );
        update.body.status.allocated = false;
        self.requesters.update(update, requester.version()).await?;
        Ok(())
    }

    fn decode(&self, requester: &RequesterObject) -> Result<(Vec<NetworkRequest>, Results), CodecError> {
        let annotations = &requester.meta.annotations;
        Ok((
            self.codec.decode_requests(annotations)?,
            self.codec.decode_results(annotations)?,
        ))
    }

    /// Records a permanent failure on the requester and hands back the error to report.
    async fn record_failure(
        &self,
        requester: RequesterObject,
        error: ReconcileError,
    ) -> ReconcileError {
        warn!(error=%error, "Reservation failed");

        let mut failed = requester.clone();
        failed.body.status.allocated = false;
        let changed = failed
            .body
            .status
            .conditions
            .set(RESERVATION_FAILED, true, error.to_string());
        if !changed && !requester.body.status.allocated {
            return error;
        }
        match self.requesters.update(failed, requester.version()).await {
            Ok(_) => error,
            Err(e) => {
                debug!(error=%e, "Failed to record reservation failure");
                e.into()
            }
        }
    }

    fn record_free_addresses(&self, namespace: &str, state: &ManagerState) {
        for (network, definition) in state.networks() {
            for pool in &definition.subnets {
                if let Ok(free) = state.available(network, &pool.name) {
                    self.metrics
                        .pool_free_addresses
                        .with_label_values(&[namespace, network.as_str(), pool.name.as_str()])
                        .set(free as i64);
                }
            }
        }
    }
}

fn load_state(manager: &ManagerObject) -> Result<ManagerState, ReconcileError> {
    ManagerState::try_from(manager.body.clone()).map_err(|e| {
        ReconcileError::CorruptState {
            key: manager.key().clone(),
            reason: format!("{e:#}"),
        }
    })
}

fn classify(network: &str, error: ReserveError, state: &ManagerState) -> ReconcileError {
    let network = network.to_string();
    match error {
        ReserveError::Allocation(source @ AllocationError::AddressConflict { .. }) => {
            ReconcileError::AddressConflict { network, source }
        }
        ReserveError::Allocation(source @ AllocationError::PoolExhausted { .. }) => {
            ReconcileError::PoolExhausted { network, source }
        }
        ReserveError::Pool(e @ PoolError::InvariantViolation { .. }) => {
            error!(error=%e, state=?ManagerStateDto::from(state), "Pool invariant violated");
            ReconcileError::InvariantViolation(e)
        }
        ReserveError::Pool(e) => ReconcileError::UnknownPool(e),
    }
}
