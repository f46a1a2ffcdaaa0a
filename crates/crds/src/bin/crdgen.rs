//! Prints the CustomResourceDefinitions owned by the IPAM controller as a
//! multi-document YAML stream, for `kubectl apply -f -`.
//!
//! ProviderConfig is not emitted: the platform owns that CRD and this crate
//! only models its network section.

use crds::{IPAllocation, NetworkPool};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    for crd in [NetworkPool::crd(), IPAllocation::crd()] {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
