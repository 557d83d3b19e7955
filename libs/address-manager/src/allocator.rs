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
//! Deterministic IPv4 address allocator.
//!
//! [allocate] picks the lowest free address of a pool's allocation range, or validates a
//! fixed address requested by the caller. It is a pure function: the pool and the exclusion
//! set are only read, committing the result is up to the caller.

use std::{collections::BTreeSet, net::Ipv4Addr};

use ipnet::Ipv4Net;
use thiserror::Error;

use crate::{
    allocator::free_set::FreeSet,
    pool::{AddressPool, AllocationRange, ConflictReason, Reservation},
};

mod free_set;

/// Address allocation errors.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum AllocationError {
    /// The requested fixed address cannot be handed out.
    #[error("requested address {address} is not available: {reason}")]
    AddressConflict {
        /// The requested address.
        address: Ipv4Addr,
        /// Why it is not available.
        reason: ConflictReason,
    },
    /// Every address of the allocation range is taken.
    #[error("no free address in {start}-{end} of {cidr}")]
    PoolExhausted {
        /// Pool prefix.
        cidr: Ipv4Net,
        /// First address of the allocation range.
        start: Ipv4Addr,
        /// Last address of the allocation range.
        end: Ipv4Addr,
    },
}

/// Allocates one address from `pool`.
///
/// * With a `fixed` address, the address is returned if it lies in the pool's CIDR and
///   allocation range, is neither the network nor the broadcast address, and is not in
///   `exclusions`. Otherwise [AllocationError::AddressConflict] is returned.
/// * Without, the lowest eligible address of the allocation range is returned, or
///   [AllocationError::PoolExhausted] if there is none.
///
/// The same pool and exclusions always produce the same address.
pub fn allocate(
    pool: &AddressPool,
    exclusions: &BTreeSet<Ipv4Addr>,
    fixed: Option<Ipv4Addr>,
) -> Result<Reservation, AllocationError> {
    match fixed {
        Some(address) => {
            pool.check_usable(address)
                .map_err(|reason| AllocationError::AddressConflict { address, reason })?;
            if exclusions.contains(&address) {
                return Err(AllocationError::AddressConflict {
                    address,
                    reason: ConflictReason::AlreadyReserved,
                });
            }
            Ok(Reservation::new(address))
        }
        None => {
            free_addresses(pool, exclusions)
                .first()
                .map(Reservation::new)
                .ok_or(AllocationError::PoolExhausted {
                    cidr: pool.cidr,
                    start: pool.range.start,
                    end: pool.range.end,
                })
        }
    }
}

/// Number of addresses `pool` could still hand out given `exclusions`.
pub fn available(pool: &AddressPool, exclusions: &BTreeSet<Ipv4Addr>) -> u64 {
    free_addresses(pool, exclusions).len()
}

fn free_addresses(pool: &AddressPool, exclusions: &BTreeSet<Ipv4Addr>) -> FreeSet {
    let AllocationRange { start, end } = pool.range;
    let mut free = FreeSet::new(start, end);
    free.remove(pool.cidr.network());
    free.remove(pool.cidr.broadcast());
    for address in exclusions {
        free.remove(*address);
    }
    tracing::trace!(pool=%pool.name, %free, "computed free addresses");
    free
}
