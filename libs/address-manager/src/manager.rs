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
//! Pool state of one IP manager.
//!
//! [ManagerState] holds every network and subnet pool of a scope together with the
//! reservations made from them. It keeps two views of the pools:
//!
//! * the **working** view, which new reservations are written to, and
//! * the **published** view, which is what lookups outside of a reservation cycle see.
//!
//! A proposal mutates the working view and marks the state with the `UpdateInProgress`
//! condition. [ManagerState::commit] clears the condition and publishes the working view.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
};

use thiserror::Error;

use crate::{
    allocator::{self, AllocationError},
    condition::Conditions,
    pool::{AddressPool, Assignment, Network, PoolError, Reservation},
};

pub mod dto;

/// Condition type signalling that a proposal is waiting to be committed.
pub const UPDATE_IN_PROGRESS: &str = "UpdateInProgress";

/// Reservation errors.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ReserveError {
    /// The allocator refused the request.
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    /// The pool does not exist or the result would corrupt it.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Result of [ManagerState::reserve].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveOutcome {
    /// What the requester should be told.
    pub assignment: Assignment,
    /// False if the requester already held a matching reservation.
    pub changed: bool,
}

/// A reservation removed from the pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    /// Network name.
    pub network: String,
    /// Subnet name.
    pub subnet: String,
    /// Former owner.
    pub requester: String,
    /// The removed reservation.
    pub reservation: Reservation,
}

/// A reservation that did not survive a definition merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dropped {
    /// The removed reservation.
    pub released: Released,
    /// Why it was dropped.
    pub reason: String,
}

/// Networks, subnets and reservations of one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerState {
    working: BTreeMap<String, Network>,
    published: BTreeMap<String, Network>,
    conditions: Conditions,
}

impl ManagerState {
    /// Creates a state where both views hold `networks`.
    pub fn new(networks: BTreeMap<String, Network>) -> Result<Self, PoolError> {
        Self::from_parts(networks.clone(), networks, Conditions::default())
    }

    pub(crate) fn from_parts(
        working: BTreeMap<String, Network>,
        published: BTreeMap<String, Network>,
        conditions: Conditions,
    ) -> Result<Self, PoolError> {
        let state = Self {
            working,
            published,
            conditions,
        };
        for networks in [&state.working, &state.published] {
            for network in networks.values() {
                network.validate()?;
            }
        }
        state.check_invariants()?;
        Ok(state)
    }

    /// The working view.
    pub fn networks(&self) -> &BTreeMap<String, Network> {
        &self.working
    }

    /// The published view.
    pub fn published(&self) -> &BTreeMap<String, Network> {
        &self.published
    }

    /// Status conditions.
    pub fn conditions(&self) -> &Conditions {
        &self.conditions
    }

    /// The working pool of `network`/`subnet`.
    pub fn pool(&self, network: &str, subnet: &str) -> Result<&AddressPool, PoolError> {
        self.working
            .get(network)
            .ok_or_else(|| PoolError::UnknownNetwork(network.to_string()))?
            .subnet(subnet)
            .ok_or_else(|| {
                PoolError::UnknownSubnet {
                    network: network.to_string(),
                    subnet: subnet.to_string(),
                }
            })
    }

    fn pool_mut(&mut self, network: &str, subnet: &str) -> Result<&mut AddressPool, PoolError> {
        self.working
            .get_mut(network)
            .ok_or_else(|| PoolError::UnknownNetwork(network.to_string()))?
            .subnet_mut(subnet)
            .ok_or_else(|| {
                PoolError::UnknownSubnet {
                    network: network.to_string(),
                    subnet: subnet.to_string(),
                }
            })
    }

    /// The addresses reserved in the working pool of `network`/`subnet`.
    pub fn reservations_for(
        &self,
        network: &str,
        subnet: &str,
    ) -> Result<BTreeSet<Ipv4Addr>, PoolError> {
        Ok(self.pool(network, subnet)?.exclusions())
    }

    /// Number of addresses still free in the working pool of `network`/`subnet`.
    pub fn available(&self, network: &str, subnet: &str) -> Result<u64, PoolError> {
        let pool = self.pool(network, subnet)?;
        Ok(allocator::available(pool, &pool.exclusions()))
    }

    /// Stores `reservation` for `requester` in the working view.
    ///
    /// Fails with [PoolError::InvariantViolation] if the address is held by someone else or
    /// lies outside the pool. Returns the reservation it replaced.
    pub fn apply(
        &mut self,
        network: &str,
        subnet: &str,
        requester: &str,
        reservation: Reservation,
    ) -> Result<Option<Reservation>, PoolError> {
        self.pool_mut(network, subnet)?
            .insert(requester, reservation)
    }

    /// Reserves an address for `requester` in the working view.
    ///
    /// If the requester already holds a reservation in the pool that satisfies the request
    /// (same fixed address, or any address when none is requested), that reservation is
    /// returned unchanged. Otherwise a new address is allocated and replaces the old one.
    pub fn reserve(
        &mut self,
        network: &str,
        subnet: &str,
        requester: &str,
        fixed: Option<Ipv4Addr>,
        vip: bool,
    ) -> Result<ReserveOutcome, ReserveError> {
        let pool = self.pool(network, subnet)?;

        if let Some(existing) = pool.reservation_of(requester)
            && existing.vip == vip
            && fixed.is_none_or(|address| address == existing.address)
        {
            return Ok(ReserveOutcome {
                assignment: pool.assignment(existing),
                changed: false,
            });
        }

        let mut reservation = allocator::allocate(pool, &pool.exclusions(), fixed)?;
        reservation.vip = vip;
        let assignment = pool.assignment(&reservation);

        if let Some(replaced) = self.apply(network, subnet, requester, reservation)? {
            tracing::info!(
                %network, %subnet, %requester, old=%replaced.address, new=%assignment.address,
                "Replaced existing reservation"
            );
        }

        Ok(ReserveOutcome {
            assignment,
            changed: true,
        })
    }

    /// Removes every reservation of `requester` from both views.
    ///
    /// Returns what was removed from the working view.
    pub fn release(&mut self, requester: &str) -> Vec<Released> {
        for network in self.published.values_mut() {
            for pool in network.subnets.iter_mut() {
                pool.remove(requester);
            }
        }

        let mut released = Vec::new();
        for (name, network) in self.working.iter_mut() {
            for pool in network.subnets.iter_mut() {
                if let Some(reservation) = pool.remove(requester) {
                    released.push(Released {
                        network: name.clone(),
                        subnet: pool.name.clone(),
                        requester: requester.to_string(),
                        reservation,
                    });
                }
            }
        }
        released
    }

    /// Every requester holding a reservation in the working view.
    pub fn owners(&self) -> BTreeSet<String> {
        self.working
            .values()
            .flat_map(|n| n.subnets.iter())
            .flat_map(|p| p.reservations.keys().cloned())
            .collect()
    }

    /// Returns true while a proposal waits to be committed.
    pub fn is_update_in_progress(&self) -> bool {
        self.conditions.is_true(UPDATE_IN_PROGRESS)
    }

    /// Marks the state as having an uncommitted proposal.
    pub fn begin_update(&mut self, message: impl Into<String>) {
        self.conditions.set(UPDATE_IN_PROGRESS, true, message);
    }

    /// Completes a pending proposal: clears `UpdateInProgress` and publishes the working
    /// view.
    ///
    /// Returns false if no proposal was pending.
    pub fn commit(&mut self) -> bool {
        if !self.is_update_in_progress() {
            return false;
        }
        self.published = self.working.clone();
        self.conditions
            .set(UPDATE_IN_PROGRESS, false, "reservations committed");
        true
    }

    /// Replaces the pool definitions with `definitions`, keeping the reservations of the
    /// current views that remain valid in the new pools.
    ///
    /// Reservations whose network or subnet no longer exists, or whose address is no longer
    /// usable, are dropped and reported.
    pub fn merge_definitions(
        &mut self,
        definitions: BTreeMap<String, Network>,
    ) -> Result<Vec<Dropped>, PoolError> {
        for network in definitions.values() {
            network.validate()?;
        }
        let (working, dropped) = merge_view(&self.working, &definitions);
        let (published, _) = merge_view(&self.published, &definitions);
        self.working = working;
        self.published = published;
        self.check_invariants()?;
        Ok(dropped)
    }

    /// Checks uniqueness and range membership in both views.
    pub fn check_invariants(&self) -> Result<(), PoolError> {
        for networks in [&self.working, &self.published] {
            for pool in networks.values().flat_map(|n| n.subnets.iter()) {
                pool.check_invariants()?;
            }
        }
        Ok(())
    }
}

fn merge_view(
    current: &BTreeMap<String, Network>,
    definitions: &BTreeMap<String, Network>,
) -> (BTreeMap<String, Network>, Vec<Dropped>) {
    let mut merged = definitions.clone();
    let mut dropped = Vec::new();

    for (network_name, network) in current {
        for old_pool in &network.subnets {
            for (requester, reservation) in &old_pool.reservations {
                let released = || {
                    Released {
                        network: network_name.clone(),
                        subnet: old_pool.name.clone(),
                        requester: requester.clone(),
                        reservation: reservation.clone(),
                    }
                };
                let Some(pool) = merged
                    .get_mut(network_name)
                    .and_then(|n| n.subnet_mut(&old_pool.name))
                else {
                    dropped.push(Dropped {
                        released: released(),
                        reason: "subnet no longer defined".to_string(),
                    });
                    continue;
                };
                if let Err(reason) = pool.check_usable(reservation.address) {
                    dropped.push(Dropped {
                        released: released(),
                        reason: format!("address is {reason}"),
                    });
                    continue;
                }
                if let Some(pinned) = pool.reservation_of(requester) {
                    // The definition pins this requester, possibly to another address.
                    if pinned.address != reservation.address {
                        dropped.push(Dropped {
                            released: released(),
                            reason: format!("replaced by pinned address {}", pinned.address),
                        });
                    }
                    continue;
                }
                if let Err(e) = pool.insert(requester, reservation.clone()) {
                    dropped.push(Dropped {
                        released: released(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
    (merged, dropped)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::pool::AllocationRange;

    pub(crate) fn networks() -> BTreeMap<String, Network> {
        let pool = AddressPool::new(
            "sub1",
            "10.0.0.0/29".parse().unwrap(),
            AllocationRange {
                start: "10.0.0.2".parse().unwrap(),
                end: "10.0.0.5".parse().unwrap(),
            },
        )
        .with_gateway("10.0.0.1".parse().unwrap());

        BTreeMap::from([(
            "net1".to_string(),
            Network {
                subnets: vec![pool],
                mtu: 1500,
                domain_name: "net1.example.com".to_string(),
            },
        )])
    }

    fn addr(s: &str) -> Ipv4Addr {
        Ipv4Addr::from_str(s).unwrap()
    }

    #[test]
    fn should_fail_on_unknown_pool() {
        let mut state = ManagerState::new(networks()).unwrap();
        assert_eq!(
            state.reserve("net2", "sub1", "a", None, false),
            Err(ReserveError::Pool(PoolError::UnknownNetwork("net2".into())))
        );
        assert_eq!(
            state.reservations_for("net1", "sub2"),
            Err(PoolError::UnknownSubnet {
                network: "net1".into(),
                subnet: "sub2".into()
            })
        );
    }

    #[test]
    fn should_reserve_in_order_until_exhausted() {
        let mut state = ManagerState::new(networks()).unwrap();

        for (requester, expected) in [
            ("a", "10.0.0.2"),
            ("b", "10.0.0.3"),
            ("c", "10.0.0.4"),
            ("d", "10.0.0.5"),
        ] {
            let outcome = state
                .reserve("net1", "sub1", requester, None, false)
                .expect("Should succeed");
            assert!(outcome.changed);
            assert_eq!(outcome.assignment.address, addr(expected));
            assert_eq!(outcome.assignment.gateway, Some(addr("10.0.0.1")));
        }

        let result = state.reserve("net1", "sub1", "e", None, false);
        assert!(
            matches!(
                result,
                Err(ReserveError::Allocation(AllocationError::PoolExhausted { .. }))
            ),
            "got {result:?}"
        );
        assert_eq!(state.available("net1", "sub1").unwrap(), 0);
        state.check_invariants().unwrap();
    }

    #[test]
    fn should_return_existing_reservation_on_re_request() {
        let mut state = ManagerState::new(networks()).unwrap();
        let fixed = Some(addr("10.0.0.4"));

        let first = state.reserve("net1", "sub1", "a", fixed, false).unwrap();
        assert!(first.changed);

        let second = state.reserve("net1", "sub1", "a", fixed, false).unwrap();
        assert!(!second.changed, "same fixed address must be a no-op");
        assert_eq!(first.assignment, second.assignment);

        let any = state.reserve("net1", "sub1", "a", None, false).unwrap();
        assert!(!any.changed);
        assert_eq!(any.assignment.address, addr("10.0.0.4"));
    }

    #[test]
    fn should_conflict_on_fixed_address_of_other_requester() {
        let mut state = ManagerState::new(networks()).unwrap();
        state
            .reserve("net1", "sub1", "a", Some(addr("10.0.0.3")), false)
            .unwrap();

        let result = state.reserve("net1", "sub1", "b", Some(addr("10.0.0.3")), false);
        assert!(
            matches!(
                result,
                Err(ReserveError::Allocation(AllocationError::AddressConflict { .. }))
            ),
            "got {result:?}"
        );
    }

    #[test]
    fn should_replace_reservation_on_new_fixed_address() {
        let mut state = ManagerState::new(networks()).unwrap();
        state.reserve("net1", "sub1", "a", None, false).unwrap();

        let moved = state
            .reserve("net1", "sub1", "a", Some(addr("10.0.0.5")), false)
            .unwrap();
        assert!(moved.changed);
        assert_eq!(
            state.reservations_for("net1", "sub1").unwrap(),
            BTreeSet::from([addr("10.0.0.5")])
        );
    }

    #[test]
    fn should_reject_duplicate_apply() {
        let mut state = ManagerState::new(networks()).unwrap();
        state
            .apply("net1", "sub1", "a", Reservation::new(addr("10.0.0.2")))
            .unwrap();
        let result = state.apply("net1", "sub1", "b", Reservation::new(addr("10.0.0.2")));
        assert!(
            matches!(result, Err(PoolError::InvariantViolation { .. })),
            "got {result:?}"
        );
    }

    #[test]
    fn should_publish_working_view_on_commit() {
        let mut state = ManagerState::new(networks()).unwrap();
        assert!(!state.commit(), "nothing to commit");

        state.reserve("net1", "sub1", "a", None, false).unwrap();
        state.begin_update("reserving for a");
        assert!(state.is_update_in_progress());
        assert!(
            state.published()["net1"].subnets[0]
                .reservations()
                .is_empty(),
            "published view must not see uncommitted reservations"
        );

        assert!(state.commit());
        assert!(!state.is_update_in_progress());
        assert_eq!(state.published(), state.networks());
    }

    #[test]
    fn should_release_from_both_views() {
        let mut state = ManagerState::new(networks()).unwrap();
        state.reserve("net1", "sub1", "a", None, false).unwrap();
        state.reserve("net1", "sub1", "b", None, false).unwrap();
        state.begin_update("reserving");
        state.commit();

        let released = state.release("a");
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].reservation.address, addr("10.0.0.2"));
        assert_eq!(state.owners(), BTreeSet::from(["b".to_string()]));
        assert_eq!(state.published(), state.networks());

        // The released address is the next one handed out.
        let outcome = state.reserve("net1", "sub1", "c", None, false).unwrap();
        assert_eq!(outcome.assignment.address, addr("10.0.0.2"));
    }

    #[test]
    fn should_keep_valid_reservations_on_merge() {
        let mut state = ManagerState::new(networks()).unwrap();
        state.reserve("net1", "sub1", "a", None, false).unwrap();
        state.reserve("net1", "sub1", "b", None, false).unwrap();

        // Shrink the range so that 10.0.0.2 falls out of it.
        let mut definitions = networks();
        definitions.get_mut("net1").unwrap().subnets[0].range.start = addr("10.0.0.3");

        let dropped = state.merge_definitions(definitions).unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].released.requester, "a");
        assert_eq!(state.owners(), BTreeSet::from(["b".to_string()]));
        assert_eq!(state.pool("net1", "sub1").unwrap().range.start, addr("10.0.0.3"));

        let dropped = state.merge_definitions(BTreeMap::new()).unwrap();
        assert_eq!(dropped.len(), 1, "network removed");
        assert!(state.owners().is_empty());
    }

    #[test]
    fn should_report_reservation_replaced_by_pinned_address() {
        let mut state = ManagerState::new(networks()).unwrap();
        state.reserve("net1", "sub1", "a", None, false).unwrap();
        state.commit();

        let mut definitions = networks();
        definitions.get_mut("net1").unwrap().subnets[0]
            .insert("a", Reservation::new(addr("10.0.0.4")))
            .unwrap();

        let dropped = state.merge_definitions(definitions).unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].released.requester, "a");
        assert_eq!(dropped[0].released.reservation.address, addr("10.0.0.2"));
        assert!(dropped[0].reason.contains("10.0.0.4"), "{}", dropped[0].reason);

        let kept = state.reserve("net1", "sub1", "a", None, false).unwrap();
        assert_eq!(kept.assignment.address, addr("10.0.0.4"));
        assert!(!kept.changed);

        let next = state.reserve("net1", "sub1", "b", None, false).unwrap();
        assert_eq!(next.assignment.address, addr("10.0.0.2"));
    }
}
