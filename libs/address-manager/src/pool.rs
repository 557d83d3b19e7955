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
//! Subnet pools and the reservations they hold.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
};

use ipnet::Ipv4Net;
use thiserror::Error;

/// Pool state errors.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum PoolError {
    /// No network with this name.
    #[error("unknown network {0}")]
    UnknownNetwork(String),
    /// No subnet with this name in the network.
    #[error("unknown subnet {subnet} in network {network}")]
    UnknownSubnet {
        /// Network name.
        network: String,
        /// Subnet name.
        subnet: String,
    },
    /// The pool definition itself is not usable.
    #[error("invalid pool {subnet}: {reason}")]
    InvalidPool {
        /// Subnet name.
        subnet: String,
        /// What is wrong with it.
        reason: String,
    },
    /// Applying the change would break the uniqueness or range invariant.
    #[error("invariant violation in subnet {subnet}: {reason}")]
    InvariantViolation {
        /// Subnet name.
        subnet: String,
        /// What would have been violated.
        reason: String,
    },
}

/// Why an address cannot be handed out by a pool.
#[derive(Debug, PartialEq, Eq, Clone, Copy, derive_more::Display)]
pub enum ConflictReason {
    /// Address not in the pool's CIDR.
    #[display("outside of the subnet prefix")]
    OutsidePrefix,
    /// Address not within the allocation range.
    #[display("outside of the allocation range")]
    OutsideRange,
    /// Address is the network address of the CIDR.
    #[display("network address")]
    NetworkAddress,
    /// Address is the broadcast address of the CIDR.
    #[display("broadcast address")]
    BroadcastAddress,
    /// Address is held by another reservation.
    #[display("already reserved")]
    AlreadyReserved,
}

/// Inclusive bounds of the addresses a pool may hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRange {
    /// First address of the range.
    pub start: Ipv4Addr,
    /// Last address of the range.
    pub end: Ipv4Addr,
}

impl AllocationRange {
    /// Returns true if `address` lies within `start..=end`.
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.start <= address && address <= self.end
    }
}

/// A static route handed to requesters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination prefix.
    pub destination: Ipv4Net,
    /// Next hop for the destination.
    pub nexthop: Ipv4Addr,
}

/// A committed address assignment owned by one requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// The reserved address.
    pub address: Ipv4Addr,
    /// Virtual (floating) address. A VIP does not inherit the pool's gateway and routes.
    pub vip: bool,
    /// Gateway that overrides the pool's default.
    pub gateway: Option<Ipv4Addr>,
    /// Routes that override the pool's defaults.
    pub routes: Option<Vec<Route>>,
}

impl Reservation {
    /// A plain reservation of `address` without overrides.
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            address,
            vip: false,
            gateway: None,
            routes: None,
        }
    }

    /// A virtual address reservation.
    pub fn vip(address: Ipv4Addr) -> Self {
        Self {
            vip: true,
            ..Self::new(address)
        }
    }
}

/// What a requester needs to configure an interface: the reservation with the pool's
/// defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Assigned address.
    pub address: Ipv4Addr,
    /// Virtual (floating) address.
    pub vip: bool,
    /// Effective gateway.
    pub gateway: Option<Ipv4Addr>,
    /// Effective routes.
    pub routes: Vec<Route>,
}

/// An address pool, one per subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPool {
    /// Subnet name, unique within its network.
    pub name: String,
    /// Subnet prefix.
    pub cidr: Ipv4Net,
    /// Optional VLAN tag.
    pub vlan: Option<u16>,
    /// Addresses the pool may hand out.
    pub range: AllocationRange,
    /// Default gateway.
    pub gateway: Option<Ipv4Addr>,
    /// Default routes.
    pub routes: Vec<Route>,
    /// Reservations by requester identity.
    pub(crate) reservations: BTreeMap<String, Reservation>,
}

impl AddressPool {
    /// Creates an empty pool. Call [Self::validate] before handing it to a
    /// [crate::manager::ManagerState].
    pub fn new(name: impl Into<String>, cidr: Ipv4Net, range: AllocationRange) -> Self {
        Self {
            name: name.into(),
            cidr,
            vlan: None,
            range,
            gateway: None,
            routes: Vec::new(),
            reservations: BTreeMap::new(),
        }
    }

    /// Set the default gateway.
    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the default routes.
    pub fn with_routes(mut self, routes: Vec<Route>) -> Self {
        self.routes = routes;
        self
    }

    /// Checks that the allocation range is well formed and inside the CIDR.
    pub fn validate(&self) -> Result<(), PoolError> {
        let invalid = |reason: String| {
            PoolError::InvalidPool {
                subnet: self.name.clone(),
                reason,
            }
        };
        if self.range.start > self.range.end {
            return Err(invalid(format!(
                "allocation start {} is after allocation end {}",
                self.range.start, self.range.end
            )));
        }
        for bound in [self.range.start, self.range.end] {
            if !self.cidr.contains(&bound) {
                return Err(invalid(format!(
                    "allocation bound {bound} is outside of {}",
                    self.cidr
                )));
            }
        }
        Ok(())
    }

    /// Returns the reason `address` can never be handed out by this pool, regardless of
    /// existing reservations.
    pub fn check_usable(&self, address: Ipv4Addr) -> Result<(), ConflictReason> {
        if !self.cidr.contains(&address) {
            Err(ConflictReason::OutsidePrefix)
        } else if !self.range.contains(address) {
            Err(ConflictReason::OutsideRange)
        } else if address == self.cidr.network() {
            Err(ConflictReason::NetworkAddress)
        } else if address == self.cidr.broadcast() {
            Err(ConflictReason::BroadcastAddress)
        } else {
            Ok(())
        }
    }

    /// All reservations, by requester identity.
    pub fn reservations(&self) -> &BTreeMap<String, Reservation> {
        &self.reservations
    }

    /// The reservation held by `requester`, if any.
    pub fn reservation_of(&self, requester: &str) -> Option<&Reservation> {
        self.reservations.get(requester)
    }

    /// The addresses already reserved in this pool.
    pub fn exclusions(&self) -> BTreeSet<Ipv4Addr> {
        self.reservations.values().map(|r| r.address).collect()
    }

    /// Applies the pool's defaults to a reservation.
    pub fn assignment(&self, reservation: &Reservation) -> Assignment {
        let (gateway, routes) = if reservation.vip {
            (
                reservation.gateway,
                reservation.routes.clone().unwrap_or_default(),
            )
        } else {
            (
                reservation.gateway.or(self.gateway),
                reservation
                    .routes
                    .clone()
                    .unwrap_or_else(|| self.routes.clone()),
            )
        };
        Assignment {
            address: reservation.address,
            vip: reservation.vip,
            gateway,
            routes,
        }
    }

    /// Inserts or replaces the reservation of `requester`.
    ///
    /// Fails without modifying the pool if the address is not usable or is held by a
    /// different requester. Returns the replaced reservation.
    pub(crate) fn insert(
        &mut self,
        requester: &str,
        reservation: Reservation,
    ) -> Result<Option<Reservation>, PoolError> {
        let violation = |reason: String| {
            PoolError::InvariantViolation {
                subnet: self.name.clone(),
                reason,
            }
        };
        if let Err(reason) = self.check_usable(reservation.address) {
            return Err(violation(format!(
                "address {} for {requester} is {reason}",
                reservation.address
            )));
        }
        if let Some((owner, _)) = self
            .reservations
            .iter()
            .find(|(owner, r)| r.address == reservation.address && owner.as_str() != requester)
        {
            return Err(violation(format!(
                "address {} for {requester} is already reserved by {owner}",
                reservation.address
            )));
        }
        Ok(self.reservations.insert(requester.to_string(), reservation))
    }

    pub(crate) fn remove(&mut self, requester: &str) -> Option<Reservation> {
        self.reservations.remove(requester)
    }

    /// Checks uniqueness and range membership of every reservation.
    pub fn check_invariants(&self) -> Result<(), PoolError> {
        let mut seen: BTreeMap<Ipv4Addr, &str> = BTreeMap::new();
        for (owner, reservation) in &self.reservations {
            if let Err(reason) = self.check_usable(reservation.address) {
                return Err(PoolError::InvariantViolation {
                    subnet: self.name.clone(),
                    reason: format!("address {} of {owner} is {reason}", reservation.address),
                });
            }
            if let Some(other) = seen.insert(reservation.address, owner) {
                return Err(PoolError::InvariantViolation {
                    subnet: self.name.clone(),
                    reason: format!(
                        "address {} is reserved by both {other} and {owner}",
                        reservation.address
                    ),
                });
            }
        }
        Ok(())
    }
}

/// A named network: a set of subnets sharing MTU and DNS domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    /// Subnets of the network.
    pub subnets: Vec<AddressPool>,
    /// MTU of the network.
    pub mtu: u16,
    /// DNS domain name.
    pub domain_name: String,
}

impl Network {
    /// The subnet with the given name.
    pub fn subnet(&self, name: &str) -> Option<&AddressPool> {
        self.subnets.iter().find(|s| s.name == name)
    }

    pub(crate) fn subnet_mut(&mut self, name: &str) -> Option<&mut AddressPool> {
        self.subnets.iter_mut().find(|s| s.name == name)
    }

    /// Validates every subnet and checks that subnet names are unique.
    pub fn validate(&self) -> Result<(), PoolError> {
        let mut names = BTreeSet::new();
        for subnet in &self.subnets {
            if !names.insert(subnet.name.as_str()) {
                return Err(PoolError::InvalidPool {
                    subnet: subnet.name.clone(),
                    reason: "duplicate subnet name".to_string(),
                });
            }
            subnet.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn pool(cidr: &str, start: &str, end: &str) -> AddressPool {
        AddressPool::new(
            "sub1",
            cidr.parse().unwrap(),
            AllocationRange {
                start: start.parse().unwrap(),
                end: end.parse().unwrap(),
            },
        )
    }

    #[test]
    fn should_reject_range_outside_cidr() {
        let result = pool("10.0.0.0/29", "10.0.0.2", "10.0.0.9").validate();
        assert!(
            matches!(result, Err(PoolError::InvalidPool { .. })),
            "got {result:?}"
        );

        let result = pool("10.0.0.0/29", "10.0.0.5", "10.0.0.2").validate();
        assert!(
            matches!(result, Err(PoolError::InvalidPool { .. })),
            "got {result:?}"
        );

        pool("10.0.0.0/29", "10.0.0.0", "10.0.0.7")
            .validate()
            .expect("range may include network and broadcast");
    }

    #[test]
    fn should_classify_unusable_addresses() {
        let pool = pool("10.0.0.0/29", "10.0.0.0", "10.0.0.7");
        let check = |s: &str| pool.check_usable(s.parse().unwrap());

        assert_eq!(check("10.0.1.1"), Err(ConflictReason::OutsidePrefix));
        assert_eq!(check("10.0.0.7"), Err(ConflictReason::BroadcastAddress));
        assert_eq!(check("10.0.0.0"), Err(ConflictReason::NetworkAddress));
        assert_eq!(check("10.0.0.3"), Ok(()));

        let narrow = self::pool("10.0.0.0/29", "10.0.0.2", "10.0.0.5");
        assert_eq!(
            narrow.check_usable("10.0.0.6".parse().unwrap()),
            Err(ConflictReason::OutsideRange)
        );
    }

    #[test]
    fn should_refuse_duplicate_address() {
        let mut pool = pool("10.0.0.0/29", "10.0.0.2", "10.0.0.5");
        let addr: Ipv4Addr = "10.0.0.3".parse().unwrap();

        pool.insert("a", Reservation::new(addr)).unwrap();
        // Same owner may re-insert.
        assert_eq!(
            pool.insert("a", Reservation::new(addr)).unwrap(),
            Some(Reservation::new(addr))
        );

        let result = pool.insert("b", Reservation::new(addr));
        assert!(
            matches!(result, Err(PoolError::InvariantViolation { .. })),
            "got {result:?}"
        );
        assert_eq!(pool.reservations().len(), 1);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn should_apply_pool_defaults_except_for_vips() {
        let gateway: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let route = Route {
            destination: "172.16.0.0/16".parse().unwrap(),
            nexthop: gateway,
        };
        let pool = pool("10.0.0.0/29", "10.0.0.2", "10.0.0.5")
            .with_gateway(gateway)
            .with_routes(vec![route.clone()]);

        let plain = pool.assignment(&Reservation::new("10.0.0.2".parse().unwrap()));
        assert_eq!(plain.gateway, Some(gateway));
        assert_eq!(plain.routes, vec![route]);

        let vip = pool.assignment(&Reservation::vip("10.0.0.3".parse().unwrap()));
        assert_eq!(vip.gateway, None);
        assert!(vip.routes.is_empty());
        assert!(vip.vip);

        let overridden = pool.assignment(&Reservation {
            gateway: Some("10.0.0.6".parse().unwrap()),
            routes: Some(vec![]),
            ..Reservation::new("10.0.0.4".parse().unwrap())
        });
        assert_eq!(overridden.gateway, Some("10.0.0.6".parse().unwrap()));
        assert!(overridden.routes.is_empty());
    }
}
