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
//! Data transfer objects (DTOs) for the persisted manager state.
//!
//! The same [ReservationDto] shape is used inside the pools and for the result
//! metadata handed to requesters.

use std::collections::BTreeMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    condition::Conditions,
    manager::ManagerState,
    pool::{AddressPool, AllocationRange, Assignment, Network, Reservation, Route},
};

/// The persisted manager state.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ManagerStateDto {
    /// Working view, written by proposals.
    pub spec: ManagerSpecDto,
    /// Published view plus conditions.
    #[serde(default)]
    pub status: ManagerStatusDto,
}

/// Working view of a manager.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ManagerSpecDto {
    /// Networks by name.
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkDto>,
}

/// Published view of a manager.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ManagerStatusDto {
    /// Networks by name.
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkDto>,
    /// Status conditions, `UpdateInProgress` among them.
    #[serde(default)]
    pub conditions: Conditions,
}

/// A network and its subnets.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDto {
    pub subnets: Vec<SubnetDto>,
    pub mtu: u16,
    #[serde(default)]
    pub domain_name: String,
}

/// A subnet pool.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubnetDto {
    pub name: String,
    /// CIDR, e.g. `10.0.0.0/24`.
    pub cidr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    pub allocation_range: AllocationRangeDto,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<RouteDto>>,
    /// Reservations by requester.
    #[serde(default)]
    pub reservations: BTreeMap<String, ReservationDto>,
}

/// Inclusive allocation bounds.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AllocationRangeDto {
    pub start: String,
    pub end: String,
}

/// A static route.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RouteDto {
    pub destination: String,
    pub nexthop: String,
}

/// A reservation, or the assignment reported to a requester.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReservationDto {
    pub ip: String,
    #[serde(default)]
    pub vip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<RouteDto>>,
}

impl From<&ManagerState> for ManagerStateDto {
    fn from(state: &ManagerState) -> Self {
        ManagerStateDto {
            spec: ManagerSpecDto {
                networks: networks_to_dto(state.networks()),
            },
            status: ManagerStatusDto {
                networks: networks_to_dto(state.published()),
                conditions: state.conditions().clone(),
            },
        }
    }
}

impl TryFrom<ManagerStateDto> for ManagerState {
    type Error = anyhow::Error;

    fn try_from(value: ManagerStateDto) -> Result<Self, Self::Error> {
        let working = networks_from_dto(value.spec.networks).context("invalid spec networks")?;
        let published =
            networks_from_dto(value.status.networks).context("invalid status networks")?;
        ManagerState::from_parts(working, published, value.status.conditions)
            .context("inconsistent manager state")
    }
}

/// Converts a network map to its DTO form.
pub fn networks_to_dto(networks: &BTreeMap<String, Network>) -> BTreeMap<String, NetworkDto> {
    networks
        .iter()
        .map(|(name, network)| (name.clone(), network.into()))
        .collect()
}

/// Parses a network map from its DTO form.
pub fn networks_from_dto(
    networks: BTreeMap<String, NetworkDto>,
) -> anyhow::Result<BTreeMap<String, Network>> {
    networks
        .into_iter()
        .map(|(name, network)| {
            let network =
                Network::try_from(network).with_context(|| format!("invalid network {name}"))?;
            Ok((name, network))
        })
        .collect()
}

impl From<&Network> for NetworkDto {
    fn from(network: &Network) -> Self {
        NetworkDto {
            subnets: network.subnets.iter().map(Into::into).collect(),
            mtu: network.mtu,
            domain_name: network.domain_name.clone(),
        }
    }
}

impl TryFrom<NetworkDto> for Network {
    type Error = anyhow::Error;

    fn try_from(value: NetworkDto) -> Result<Self, Self::Error> {
        let network = Network {
            subnets: value
                .subnets
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, Self::Error>>()?,
            mtu: value.mtu,
            domain_name: value.domain_name,
        };
        network.validate()?;
        Ok(network)
    }
}

impl From<&AddressPool> for SubnetDto {
    fn from(pool: &AddressPool) -> Self {
        SubnetDto {
            name: pool.name.clone(),
            cidr: pool.cidr.to_string(),
            vlan: pool.vlan,
            allocation_range: AllocationRangeDto {
                start: pool.range.start.to_string(),
                end: pool.range.end.to_string(),
            },
            gateway: pool.gateway.map(|g| g.to_string()),
            routes: (!pool.routes.is_empty()).then(|| pool.routes.iter().map(Into::into).collect()),
            reservations: pool
                .reservations()
                .iter()
                .map(|(requester, r)| (requester.clone(), r.into()))
                .collect(),
        }
    }
}

impl TryFrom<SubnetDto> for AddressPool {
    type Error = anyhow::Error;

    fn try_from(value: SubnetDto) -> Result<Self, Self::Error> {
        let subnet = value.name;
        let range = AllocationRange {
            start: value
                .allocation_range
                .start
                .parse()
                .with_context(|| format!("invalid range start in subnet {subnet}"))?,
            end: value
                .allocation_range
                .end
                .parse()
                .with_context(|| format!("invalid range end in subnet {subnet}"))?,
        };
        let cidr = value
            .cidr
            .parse()
            .with_context(|| format!("invalid cidr in subnet {subnet}"))?;

        let mut pool = AddressPool::new(subnet.clone(), cidr, range);
        pool.vlan = value.vlan;
        pool.gateway = value
            .gateway
            .map(|g| g.parse())
            .transpose()
            .with_context(|| format!("invalid gateway in subnet {subnet}"))?;
        pool.routes = value
            .routes
            .unwrap_or_default()
            .into_iter()
            .map(TryInto::try_into)
            .collect::<Result<_, Self::Error>>()?;
        pool.validate()?;

        for (requester, reservation) in value.reservations {
            let reservation = Reservation::try_from(reservation)
                .with_context(|| format!("invalid reservation of {requester}"))?;
            pool.insert(&requester, reservation)?;
        }
        Ok(pool)
    }
}

impl From<&Route> for RouteDto {
    fn from(route: &Route) -> Self {
        RouteDto {
            destination: route.destination.to_string(),
            nexthop: route.nexthop.to_string(),
        }
    }
}

impl TryFrom<RouteDto> for Route {
    type Error = anyhow::Error;

    fn try_from(value: RouteDto) -> Result<Self, Self::Error> {
        Ok(Route {
            destination: value
                .destination
                .parse()
                .context("invalid route destination")?,
            nexthop: value.nexthop.parse().context("invalid route nexthop")?,
        })
    }
}

impl From<&Reservation> for ReservationDto {
    fn from(r: &Reservation) -> Self {
        ReservationDto {
            ip: r.address.to_string(),
            vip: r.vip,
            gateway: r.gateway.map(|g| g.to_string()),
            routes: r.routes.as_ref().map(|rs| rs.iter().map(Into::into).collect()),
        }
    }
}

impl From<&Assignment> for ReservationDto {
    fn from(a: &Assignment) -> Self {
        ReservationDto {
            ip: a.address.to_string(),
            vip: a.vip,
            gateway: a.gateway.map(|g| g.to_string()),
            routes: (!a.routes.is_empty()).then(|| a.routes.iter().map(Into::into).collect()),
        }
    }
}

impl TryFrom<ReservationDto> for Reservation {
    type Error = anyhow::Error;

    fn try_from(value: ReservationDto) -> Result<Self, Self::Error> {
        Ok(Reservation {
            address: value.ip.parse().context("invalid ip")?,
            vip: value.vip,
            gateway: value
                .gateway
                .map(|g| g.parse())
                .transpose()
                .context("invalid gateway")?,
            routes: value
                .routes
                .map(|rs| {
                    rs.into_iter()
                        .map(TryInto::try_into)
                        .collect::<Result<Vec<_>, anyhow::Error>>()
                })
                .transpose()?,
        })
    }
}

impl TryFrom<ReservationDto> for Assignment {
    type Error = anyhow::Error;

    fn try_from(value: ReservationDto) -> Result<Self, Self::Error> {
        let reservation = Reservation::try_from(value)?;
        Ok(Assignment {
            address: reservation.address,
            vip: reservation.vip,
            gateway: reservation.gateway,
            routes: reservation.routes.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::networks;

    #[test]
    fn should_read_persisted_shape() {
        let json = r#"{
            "spec": {
                "networks": {
                    "net1": {
                        "subnets": [{
                            "name": "sub1",
                            "cidr": "10.0.0.0/29",
                            "vlan": 20,
                            "allocationRange": {"start": "10.0.0.2", "end": "10.0.0.5"},
                            "gateway": "10.0.0.1",
                            "routes": [{"destination": "0.0.0.0/0", "nexthop": "10.0.0.1"}],
                            "reservations": {"a": {"ip": "10.0.0.2", "vip": false}}
                        }],
                        "mtu": 1500,
                        "domainName": "net1.example.com"
                    }
                }
            },
            "status": {
                "conditions": [{"type": "UpdateInProgress", "status": true, "message": "x"}]
            }
        }"#;

        let dto: ManagerStateDto = serde_json::from_str(json).expect("Should parse");
        let state = ManagerState::try_from(dto).expect("Should convert");

        assert!(state.is_update_in_progress());
        assert!(state.published().is_empty());
        let pool = state.pool("net1", "sub1").unwrap();
        assert_eq!(pool.vlan, Some(20));
        assert_eq!(pool.routes.len(), 1);
        assert_eq!(
            pool.reservation_of("a").map(|r| r.address.to_string()),
            Some("10.0.0.2".to_string())
        );
    }

    #[test]
    fn should_preserve_state_through_dto() {
        let mut state = ManagerState::new(networks()).unwrap();
        state.reserve("net1", "sub1", "a", None, false).unwrap();
        state
            .reserve("net1", "sub1", "vip", Some("10.0.0.5".parse().unwrap()), true)
            .unwrap();
        state.begin_update("reserving");

        let json = serde_json::to_string(&ManagerStateDto::from(&state)).unwrap();
        let back: ManagerState = serde_json::from_str::<ManagerStateDto>(&json)
            .unwrap()
            .try_into()
            .unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn should_reject_duplicate_reserved_address() {
        let mut dto = ManagerStateDto::from(&ManagerState::new(networks()).unwrap());
        let subnet = &mut dto.spec.networks.get_mut("net1").unwrap().subnets[0];
        for requester in ["a", "b"] {
            subnet.reservations.insert(
                requester.to_string(),
                ReservationDto {
                    ip: "10.0.0.3".to_string(),
                    vip: false,
                    gateway: None,
                    routes: None,
                },
            );
        }

        ManagerState::try_from(dto).expect_err("Should not accept duplicate addresses");
    }

    #[test]
    fn should_reject_bad_cidr() {
        let mut dto = ManagerStateDto::from(&ManagerState::new(networks()).unwrap());
        dto.spec.networks.get_mut("net1").unwrap().subnets[0].cidr = "10.0.0.0/33".to_string();

        let err = ManagerState::try_from(dto).expect_err("Should not accept bad cidr");
        assert!(format!("{err:#}").contains("invalid cidr"), "{err:#}");
    }
}
