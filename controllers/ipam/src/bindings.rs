//! Load-balancer address usage read from the allocation's annotations.
//!
//! The tenant load-balancer addon records the addresses it has bound to
//! services as a comma-separated list on the IPAllocation it consumes.

use async_trait::async_trait;
use crds::{BOUND_ADDRESSES_ANNOTATION, IPAllocation};
use ipam::{AddressRange, ServiceBindingTracker, StoreError};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// `ServiceBindingTracker` over [`BOUND_ADDRESSES_ANNOTATION`]
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnotationBindingTracker;

#[async_trait]
impl ServiceBindingTracker for AnnotationBindingTracker {
    async fn bound_addresses(&self, allocation: &IPAllocation) -> Result<Option<BTreeSet<Ipv4Addr>>, StoreError> {
        let Some(raw) = allocation
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(BOUND_ADDRESSES_ANNOTATION))
        else {
            return Ok(None);
        };
        parse_bound_addresses(raw)
            .map(Some)
            .map_err(|e| StoreError::Backend(format!("{}: {BOUND_ADDRESSES_ANNOTATION}: {e}", allocation.key())))
    }
}

/// Parse a comma-separated address list; blank entries are ignored
pub fn parse_bound_addresses(raw: &str) -> Result<BTreeSet<Ipv4Addr>, ipam::IpamError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(AddressRange::parse_address)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_allocation;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_addresses() {
        let parsed = parse_bound_addresses("10.0.0.3, 10.0.0.1,,10.0.0.3").unwrap();
        let expected: BTreeSet<Ipv4Addr> = ["10.0.0.1", "10.0.0.3"].iter().map(|a| a.parse().unwrap()).collect();
        assert_eq!(parsed, expected);
        assert!(parse_bound_addresses("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_bound_addresses("10.0.0.1,lb-1").is_err());
    }

    #[tokio::test]
    async fn test_missing_annotation_gives_no_signal() {
        let allocation = create_test_allocation("lb", "team-a");
        assert_eq!(AnnotationBindingTracker.bound_addresses(&allocation).await, Ok(None));
    }

    #[tokio::test]
    async fn test_annotation_is_read() {
        let mut allocation = create_test_allocation("lb", "team-a");
        allocation.metadata.annotations = Some(BTreeMap::from([(
            BOUND_ADDRESSES_ANNOTATION.to_string(),
            "10.0.0.4".to_string(),
        )]));
        let bound = AnnotationBindingTracker.bound_addresses(&allocation).await.unwrap().unwrap();
        assert!(bound.contains(&Ipv4Addr::new(10, 0, 0, 4)));

        allocation.metadata.annotations = Some(BTreeMap::from([(
            BOUND_ADDRESSES_ANNOTATION.to_string(),
            "10.0.0.400".to_string(),
        )]));
        assert!(matches!(
            AnnotationBindingTracker.bound_addresses(&allocation).await,
            Err(StoreError::Backend(_))
        ));
    }
}
