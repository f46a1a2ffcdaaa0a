//! IPv4 address ranges
//!
//! Addresses are unsigned 32-bit big-endian integers and ranges are inclusive
//! on both ends. A CIDR's network and broadcast addresses are part of its
//! range; pools that must not hand them out reserve them explicitly.

use crate::error::IpamError;
use ipnetwork::Ipv4Network;
use std::fmt;
use std::net::Ipv4Addr;

/// Inclusive range of IPv4 addresses, `start <= end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressRange {
    start: u32,
    end: u32,
}

impl AddressRange {
    /// Build a range, failing with `RangeOrder` if `start > end`
    pub fn new(start: u32, end: u32) -> Result<Self, IpamError> {
        if start > end {
            return Err(IpamError::RangeOrder {
                start: Ipv4Addr::from(start).to_string(),
                end: Ipv4Addr::from(end).to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// Range holding exactly one address
    pub fn single(address: u32) -> Self {
        Self {
            start: address,
            end: address,
        }
    }

    /// Parse a dotted-quad address
    pub fn parse_address(s: &str) -> Result<Ipv4Addr, IpamError> {
        s.trim()
            .parse::<Ipv4Addr>()
            .map_err(|e| IpamError::InvalidAddress(format!("{s}: {e}")))
    }

    /// Parse `a.b.c.d/n` into the range it covers.
    ///
    /// Host bits must be zero, so `10.0.0.1/24` is rejected rather than
    /// silently widened.
    pub fn parse_cidr(s: &str) -> Result<Self, IpamError> {
        let trimmed = s.trim();
        if !trimmed.contains('/') {
            return Err(IpamError::InvalidAddress(format!("{s}: missing prefix length")));
        }
        let network: Ipv4Network = trimmed
            .parse()
            .map_err(|e: ipnetwork::IpNetworkError| IpamError::InvalidAddress(format!("{s}: {e}")))?;
        if network.ip() != network.network() {
            return Err(IpamError::InvalidAddress(format!(
                "{s}: host bits set (network address is {})",
                network.network()
            )));
        }
        Self::new(u32::from(network.network()), u32::from(network.broadcast()))
    }

    /// Parse a pair of dotted-quad addresses into a range
    pub fn parse_range(start: &str, end: &str) -> Result<Self, IpamError> {
        let first = Self::parse_address(start)?;
        let last = Self::parse_address(end)?;
        Self::new(u32::from(first), u32::from(last))
    }

    /// First address as an integer
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Last address as an integer
    pub fn end(&self) -> u32 {
        self.end
    }

    /// First address
    pub fn start_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.start)
    }

    /// Last address
    pub fn end_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.end)
    }

    /// Number of addresses (a /0 holds 2^32, hence u64)
    pub fn len(&self) -> u64 {
        u64::from(self.end) - u64::from(self.start) + 1
    }

    /// Ranges are never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    /// `other ⊆ self`
    pub fn contains(&self, other: &AddressRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Whether `address` falls inside the range
    pub fn contains_addr(&self, address: u32) -> bool {
        self.start <= address && address <= self.end
    }

    /// `self ∩ other ≠ ∅`
    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Disjoint and touching, so their union is contiguous
    pub fn is_adjacent(&self, other: &AddressRange) -> bool {
        (self.end < other.start && self.end + 1 == other.start)
            || (other.end < self.start && other.end + 1 == self.start)
    }

    /// Union of two overlapping or adjacent ranges
    pub fn merge(&self, other: &AddressRange) -> Option<AddressRange> {
        (self.overlaps(other) || self.is_adjacent(other)).then(|| AddressRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        })
    }

    /// Common part of two ranges
    pub fn intersect(&self, other: &AddressRange) -> Option<AddressRange> {
        self.overlaps(other).then(|| AddressRange {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }

    /// `self \ other` as (part below `other`, part above `other`)
    pub fn subtract(&self, other: &AddressRange) -> (Option<AddressRange>, Option<AddressRange>) {
        if !self.overlaps(other) {
            return (Some(*self), None);
        }
        let below = (self.start < other.start).then(|| AddressRange {
            start: self.start,
            end: other.start - 1,
        });
        let above = (other.end < self.end).then(|| AddressRange {
            start: other.end + 1,
            end: self.end,
        });
        (below, above)
    }

    /// The first `count` addresses, if the range is long enough
    pub fn take_first(&self, count: u64) -> Option<AddressRange> {
        if count == 0 || count > self.len() {
            return None;
        }
        // count <= len <= 2^32, and start + count - 1 <= end
        let end = u64::from(self.start) + count - 1;
        u32::try_from(end).ok().map(|end| AddressRange { start: self.start, end })
    }

    /// CIDR notation when the range is one power-of-two block aligned to its size
    pub fn to_cidr(&self) -> Option<String> {
        let len = self.len();
        if !len.is_power_of_two() || u64::from(self.start) % len != 0 {
            return None;
        }
        let prefix = 32 - len.trailing_zeros();
        Some(format!("{}/{}", self.start_addr(), prefix))
    }

    /// Every address in the range
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        (self.start..=self.end).map(Ipv4Addr::from)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start_addr())
        } else {
            write!(f, "{}-{}", self.start_addr(), self.end_addr())
        }
    }
}

/// Collapse addresses into sorted, merged ranges
pub fn coalesce<I>(addresses: I) -> Vec<AddressRange>
where
    I: IntoIterator<Item = Ipv4Addr>,
{
    let mut sorted: Vec<u32> = addresses.into_iter().map(u32::from).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<AddressRange> = Vec::new();
    for address in sorted {
        match ranges.last_mut() {
            Some(last) if last.end.checked_add(1) == Some(address) => last.end = address,
            _ => ranges.push(AddressRange::single(address)),
        }
    }
    ranges
}

/// Sort ranges and merge the ones that overlap or touch
pub fn normalize(mut ranges: Vec<AddressRange>) -> Vec<AddressRange> {
    ranges.sort();
    let mut merged: Vec<AddressRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) => match last.merge(&range) {
                Some(union) => *last = union,
                None => merged.push(range),
            },
            None => merged.push(range),
        }
    }
    merged
}

/// Total number of addresses across disjoint ranges
pub fn total_len(ranges: &[AddressRange]) -> u64 {
    ranges.iter().map(AddressRange::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> u32 {
        u32::from(s.parse::<Ipv4Addr>().unwrap())
    }

    #[test]
    fn test_parse_cidr_includes_network_and_broadcast() {
        let range = AddressRange::parse_cidr("10.50.0.0/24").unwrap();
        assert_eq!(range.start_addr().to_string(), "10.50.0.0");
        assert_eq!(range.end_addr().to_string(), "10.50.0.255");
        assert_eq!(range.len(), 256);

        let whole = AddressRange::parse_cidr("0.0.0.0/0").unwrap();
        assert_eq!(whole.len(), 1 << 32);
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        for bad in ["10.50.0/24", "10.50.0.0", "10.50.0.0/33", "10.50.0.1/24", "banana/8"] {
            assert!(
                matches!(AddressRange::parse_cidr(bad), Err(IpamError::InvalidAddress(_))),
                "{bad} should be rejected"
            );
        }
        assert!(matches!(
            AddressRange::parse_address("10.0.0.256"),
            Err(IpamError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        assert!(matches!(
            AddressRange::parse_range("10.0.0.10", "10.0.0.5"),
            Err(IpamError::RangeOrder { .. })
        ));
    }

    #[test]
    fn test_containment_overlap_and_adjacency() {
        let a = AddressRange::new(ip("10.0.0.0"), ip("10.0.0.9")).unwrap();
        let b = AddressRange::new(ip("10.0.0.10"), ip("10.0.0.19")).unwrap();
        let c = AddressRange::new(ip("10.0.0.5"), ip("10.0.0.12")).unwrap();

        assert!(!a.overlaps(&b));
        assert!(a.is_adjacent(&b) && b.is_adjacent(&a));
        assert!(a.overlaps(&c) && c.overlaps(&b));
        assert!(!a.is_adjacent(&c));
        assert_eq!(a.merge(&b), AddressRange::new(ip("10.0.0.0"), ip("10.0.0.19")).ok());
        assert!(a.merge(&AddressRange::single(ip("10.0.0.11"))).is_none());
        assert!(a.merge(&b).unwrap().contains(&c));
        assert_eq!(a.intersect(&c), AddressRange::new(ip("10.0.0.5"), ip("10.0.0.9")).ok());
    }

    #[test]
    fn test_subtract_splits_around_hole() {
        let outer = AddressRange::new(0, 99).unwrap();
        let (below, above) = outer.subtract(&AddressRange::new(10, 19).unwrap());
        assert_eq!(below, AddressRange::new(0, 9).ok());
        assert_eq!(above, AddressRange::new(20, 99).ok());

        let (below, above) = outer.subtract(&AddressRange::new(0, 200).unwrap());
        assert_eq!((below, above), (None, None));
    }

    #[test]
    fn test_to_cidr_only_for_aligned_blocks() {
        let aligned = AddressRange::new(ip("10.0.0.16"), ip("10.0.0.31")).unwrap();
        assert_eq!(aligned.to_cidr().as_deref(), Some("10.0.0.16/28"));
        assert_eq!(AddressRange::single(ip("10.0.0.7")).to_cidr().as_deref(), Some("10.0.0.7/32"));

        let unaligned = AddressRange::new(ip("10.0.0.8"), ip("10.0.0.23")).unwrap();
        assert_eq!(unaligned.to_cidr(), None);
        let odd = AddressRange::new(ip("10.0.0.16"), ip("10.0.0.20")).unwrap();
        assert_eq!(odd.to_cidr(), None);
    }

    #[test]
    fn test_coalesce_merges_consecutive_addresses() {
        let addresses = ["10.0.0.3", "10.0.0.1", "10.0.0.2", "10.0.0.9", "10.0.0.2"]
            .iter()
            .map(|s| s.parse::<Ipv4Addr>().unwrap());
        let ranges = coalesce(addresses);
        assert_eq!(
            ranges,
            vec![
                AddressRange::new(ip("10.0.0.1"), ip("10.0.0.3")).unwrap(),
                AddressRange::single(ip("10.0.0.9")),
            ]
        );
        assert_eq!(total_len(&ranges), 4);
    }

    #[test]
    fn test_take_first_at_top_of_address_space() {
        let top = AddressRange::new(u32::MAX - 3, u32::MAX).unwrap();
        assert_eq!(top.take_first(4), Some(top));
        assert_eq!(top.take_first(5), None);
        assert_eq!(top.take_first(0), None);
    }
}
