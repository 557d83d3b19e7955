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
//! Free IPv4 addresses of a pool, kept as sorted half-open ranges.

use std::{fmt, net::Ipv4Addr};

/// A half-open range `[start, end)` of IPv4 addresses in their integer form.
///
/// Stored as `u64` so that a range ending at `255.255.255.255` can be represented.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub(crate) struct Span {
    pub(crate) start: u64,
    pub(crate) end: u64,
}

impl Span {
    fn len(&self) -> u64 {
        self.end - self.start
    }

    fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn contains(&self, value: u64) -> bool {
        self.start <= value && value < self.end
    }
}

/// The set of free addresses of one pool.
// Impl Note:
// Starts as the single allocation range and shrinks as addresses are removed.
// Spans are sorted by start, non-overlapping and never empty.
#[derive(Debug, Eq, PartialEq, Clone)]
pub(crate) struct FreeSet {
    spans: Vec<Span>,
}

impl FreeSet {
    /// Creates a set holding every address of the inclusive range `first..=last`.
    ///
    /// The set is empty if `first > last`.
    pub(crate) fn new(first: Ipv4Addr, last: Ipv4Addr) -> Self {
        let start = u64::from(first.to_bits());
        let end = u64::from(last.to_bits()) + 1;
        let spans = if start < end {
            vec![Span { start, end }]
        } else {
            Vec::new()
        };
        Self { spans }
    }

    fn search(&self, value: u64) -> Result<usize, usize> {
        self.spans.binary_search_by(|span| {
            if span.contains(value) {
                std::cmp::Ordering::Equal
            } else if span.start > value {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Less
            }
        })
    }

    /// Returns true if the address is free.
    #[cfg(test)]
    pub(crate) fn contains(&self, address: Ipv4Addr) -> bool {
        self.search(u64::from(address.to_bits())).is_ok()
    }

    /// Removes an address from the set.
    ///
    /// Returns `false` if the address was not free.
    pub(crate) fn remove(&mut self, address: Ipv4Addr) -> bool {
        let value = u64::from(address.to_bits());
        let Ok(i) = self.search(value) else {
            return false;
        };

        let span = self.spans[i];
        if span.start == value {
            self.spans[i].start += 1;
        } else if span.end - 1 == value {
            self.spans[i].end -= 1;
        } else {
            // Split the span around the removed address.
            self.spans[i].start = value + 1;
            self.spans.insert(
                i,
                Span {
                    start: span.start,
                    end: value,
                },
            );
            return true;
        }

        if self.spans[i].is_empty() {
            self.spans.remove(i);
        }
        true
    }

    /// Returns the lowest free address.
    pub(crate) fn first(&self) -> Option<Ipv4Addr> {
        self.spans
            .first()
            .map(|span| Ipv4Addr::from_bits(span.start as u32))
    }

    /// Returns the number of free addresses.
    pub(crate) fn len(&self) -> u64 {
        self.spans.iter().map(Span::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn spans(&self) -> &[Span] {
        &self.spans
    }
}

impl fmt::Display for FreeSet {
    // Format the set as [from_address-to_address, from_address-to_address, ...]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, span) in self.spans.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(
                f,
                "{}-{}",
                Ipv4Addr::from_bits(span.start as u32),
                Ipv4Addr::from_bits((span.end - 1) as u32)
            )?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_invariants(set: &FreeSet) {
        for span in set.spans() {
            assert!(span.start < span.end, "Empty span: {span:?}");
        }
        for pair in set.spans().windows(2) {
            assert!(
                pair[0].end < pair[1].start,
                "Spans not ordered or not disjoint: {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn should_hold_inclusive_range() {
        let set = FreeSet::new(addr("10.0.0.2"), addr("10.0.0.5"));
        assert_eq!(set.len(), 4);
        assert!(set.contains(addr("10.0.0.2")));
        assert!(set.contains(addr("10.0.0.5")));
        assert!(!set.contains(addr("10.0.0.1")));
        assert!(!set.contains(addr("10.0.0.6")));
        assert_eq!(set.first(), Some(addr("10.0.0.2")));
    }

    #[test]
    fn should_be_empty_for_reversed_bounds() {
        let set = FreeSet::new(addr("10.0.0.5"), addr("10.0.0.2"));
        assert_eq!(set.len(), 0);
        assert_eq!(set.first(), None);
    }

    #[test]
    fn should_cover_top_of_address_space() {
        let mut set = FreeSet::new(addr("255.255.255.254"), addr("255.255.255.255"));
        assert_eq!(set.len(), 2);
        assert!(set.remove(addr("255.255.255.255")));
        assert_eq!(set.first(), Some(addr("255.255.255.254")));
        check_invariants(&set);
    }

    #[test]
    fn should_split_and_shrink_spans() {
        let mut set = FreeSet::new(addr("10.0.0.1"), addr("10.0.0.9"));

        assert!(set.remove(addr("10.0.0.5")));
        check_invariants(&set);
        assert_eq!(set.spans().len(), 2);
        assert_eq!(set.to_string(), "[10.0.0.1-10.0.0.4, 10.0.0.6-10.0.0.9]");

        assert!(set.remove(addr("10.0.0.1")));
        assert!(set.remove(addr("10.0.0.9")));
        check_invariants(&set);
        assert_eq!(set.to_string(), "[10.0.0.2-10.0.0.4, 10.0.0.6-10.0.0.8]");
        assert_eq!(set.len(), 6);

        assert!(!set.remove(addr("10.0.0.5")), "already removed");
        assert!(!set.remove(addr("10.0.1.0")), "outside the range");
    }

    #[test]
    fn should_drain_to_empty() {
        let mut set = FreeSet::new(addr("192.168.0.1"), addr("192.168.0.3"));
        for last in 1..=3 {
            let first = set.first().expect("set not empty yet");
            assert_eq!(first, Ipv4Addr::new(192, 168, 0, last));
            assert!(set.remove(first));
            check_invariants(&set);
        }
        assert_eq!(set.first(), None);
        assert_eq!(set.len(), 0);
    }
}
