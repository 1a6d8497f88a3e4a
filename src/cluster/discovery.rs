//! iSCSI Discovery Classification
//!
//! A host that already has the storage system's portal configured for
//! send-target (dynamic) discovery sees new LUNs after a rescan. Every other
//! host needs an explicit static target, added before use and removed at
//! teardown.

use crate::domain::model::IscsiAdapter;
use crate::domain::ports::HostHandle;
use crate::error::{Error, Result};
use futures::future::try_join_all;
use tracing::debug;

/// A host paired with its software iSCSI adapter
#[derive(Clone)]
pub struct DiscoveredHost {
    pub host: HostHandle,
    pub adapter: IscsiAdapter,
}

/// Hosts partitioned by how they reach a storage address
#[derive(Clone, Default)]
pub struct DiscoveryPlan {
    pub dynamic: Vec<DiscoveredHost>,
    pub statics: Vec<DiscoveredHost>,
}

impl DiscoveryPlan {
    pub fn static_hosts(&self) -> Vec<HostHandle> {
        self.statics.iter().map(|d| d.host.clone()).collect()
    }

    pub fn dynamic_hosts(&self) -> Vec<HostHandle> {
        self.dynamic.iter().map(|d| d.host.clone()).collect()
    }

    /// Adapter device of a statically discovered host
    pub fn adapter_of(&self, host: &str) -> Option<&str> {
        self.statics
            .iter()
            .chain(self.dynamic.iter())
            .find(|d| d.host.name() == host)
            .map(|d| d.adapter.device.as_str())
    }
}

/// Partition hosts by whether `storage_address` (`host:port`) is already
/// configured for dynamic discovery on their iSCSI adapter.
pub async fn classify_discovery(hosts: &[HostHandle], storage_address: &str) -> Result<DiscoveryPlan> {
    let adapters = try_join_all(hosts.iter().map(|h| h.iscsi_adapter())).await?;

    let mut plan = DiscoveryPlan::default();
    for (host, adapter) in hosts.iter().zip(adapters) {
        let adapter = adapter.ok_or_else(|| {
            Error::Configuration(format!("host {} has no software iSCSI adapter", host.name()))
        })?;

        let entry = DiscoveredHost {
            host: host.clone(),
            adapter,
        };
        if entry.adapter.discovers_dynamically(storage_address) {
            debug!("Host {} discovers {} dynamically", host.name(), storage_address);
            plan.dynamic.push(entry);
        } else {
            plan.statics.push(entry);
        }
    }
    Ok(plan)
}
