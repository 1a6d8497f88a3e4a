//! Simulated Hypervisor Cluster
//!
//! An in-memory implementation of every hypervisor port: hosts with
//! software iSCSI adapters, LUNs and VMFS signatures, NFS exports, datastore
//! file trees, and VMs whose disks carry real backing chains. OVF export and
//! import go through real local directories.
//!
//! Every mutating call is appended to an ordered event log, and faults can
//! be injected per operation name (the same names the log uses, e.g.
//! `host.rescan_hba` or `vm.clone`).

mod files;
mod host;
mod state;
mod vms;

pub use host::SimHost;

use crate::domain::model::{
    Datastore, DatastoreBacking, DatastoreKind, HostMount, IscsiAdapter, PowerState,
};
use crate::domain::path::DatastorePath;
use crate::domain::ports::{
    ClusterInventory, DatastoreBrowser, HostHandle, HypervisorSession, SessionConnector,
    SessionRef, VmManager,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use state::{DatastoreState, FileTree, HostState, LunState, SimFile, SimState, VolumeImage, VMFS_RESERVED};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Device name of every simulated host's software iSCSI adapter
pub const SOFTWARE_ADAPTER: &str = "vmhba64";

// =============================================================================
// Faults and Events
// =============================================================================

/// Failure injected into the next call of an operation
#[derive(Debug, Clone)]
pub enum SimFault {
    /// The management session expired
    SessionExpired,
    Busy,
    Failure(String),
}

impl SimFault {
    fn into_error(self, op: &str) -> Error {
        match self {
            SimFault::SessionExpired => Error::RemoteSessionFault(format!("session expired during {}", op)),
            SimFault::Busy => Error::ResourceBusy {
                resource: op.to_string(),
                reason: "injected".into(),
            },
            SimFault::Failure(msg) => Error::Internal(format!("{}: {}", op, msg)),
        }
    }
}

/// One mutating call observed by the simulator
#[derive(Debug, Clone)]
pub struct SimEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub op: String,
    pub detail: String,
}

impl std::fmt::Display for SimEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.op, self.detail)
    }
}

// =============================================================================
// Builder
// =============================================================================

#[derive(Default)]
pub struct SimulatedClusterBuilder {
    clusters: Vec<(String, usize)>,
    local_datastores: Vec<(String, String, u64)>,
}

impl SimulatedClusterBuilder {
    /// Add a cluster of `hosts` hosts named `<cluster>-host-<n>`
    pub fn cluster(mut self, name: &str, hosts: usize) -> Self {
        self.clusters.push((name.to_string(), hosts));
        self
    }

    /// Add a datastore mounted on every host of a cluster
    pub fn local_datastore(mut self, name: &str, cluster: &str, capacity_bytes: u64) -> Self {
        self.local_datastores
            .push((name.to_string(), cluster.to_string(), capacity_bytes));
        self
    }

    pub fn build(self) -> SimulatedCluster {
        let mut state = SimState::default();

        for (cluster, count) in &self.clusters {
            let names: Vec<String> = (0..*count).map(|i| format!("{}-host-{}", cluster, i)).collect();
            for name in &names {
                state.hosts.insert(
                    name.clone(),
                    HostState {
                        cluster: cluster.clone(),
                        adapter: Some(IscsiAdapter {
                            device: SOFTWARE_ADAPTER.to_string(),
                            send_targets: Vec::new(),
                            static_targets: Vec::new(),
                        }),
                        visible_luns: BTreeSet::new(),
                    },
                );
            }
            state.clusters.insert(cluster.clone(), names);
        }

        for (name, cluster, capacity) in self.local_datastores {
            let mounts = state
                .cluster_hosts(&cluster)
                .into_iter()
                .map(|h| (h, HostMount::ready()))
                .collect();
            state.datastores.insert(
                name.clone(),
                DatastoreState {
                    info: Datastore {
                        name,
                        kind: DatastoreKind::Vmfs,
                        backing: DatastoreBacking::Local,
                        cluster: Some(cluster),
                        capacity_bytes: capacity,
                        mounts,
                    },
                    lun: None,
                    tree: FileTree::default(),
                },
            );
        }

        SimulatedCluster {
            state: Arc::new(RwLock::new(state)),
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }
}

// =============================================================================
// Simulated Cluster
// =============================================================================

/// Handle to the shared simulated inventory. Clones share state.
#[derive(Clone)]
pub struct SimulatedCluster {
    state: Arc<RwLock<SimState>>,
    connections: Arc<AtomicUsize>,
}

impl SimulatedCluster {
    pub fn builder() -> SimulatedClusterBuilder {
        SimulatedClusterBuilder::default()
    }

    pub(crate) fn state(&self) -> &RwLock<SimState> {
        &self.state
    }

    /// A session without going through a connector
    pub fn session(&self) -> SessionRef {
        Arc::new(SimSession {
            endpoint: "sim".to_string(),
            cluster: self.clone(),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn inject_fault(&self, op: &str, fault: SimFault) {
        self.state.write().faults.push((op.to_string(), fault));
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.state.read().events.clone()
    }

    /// Events rendered as `"<op> <detail>"`, oldest first
    pub fn event_log(&self) -> Vec<String> {
        self.state.read().events.iter().map(ToString::to_string).collect()
    }

    // =========================================================================
    // Storage Array
    // =========================================================================

    /// Expose a new LUN behind a portal. Returns its device id.
    pub fn add_lun(&self, iqn: &str, address: &str, capacity_bytes: u64) -> String {
        let mut state = self.state.write();
        state.next_lun += 1;
        let device_id = format!("naa.6000c29{:09x}", state.next_lun);
        state.luns.insert(
            device_id.clone(),
            LunState {
                device_id: device_id.clone(),
                iqn: iqn.to_string(),
                address: address.to_string(),
                capacity_bytes,
                formatted: None,
                image: None,
            },
        );
        device_id
    }

    /// Byte-for-byte copy of a formatted LUN under a new IQN, as a storage
    /// array clone would produce. The copy carries the source's VMFS
    /// signature and shows up as an unresolved volume. Returns its device id.
    pub fn clone_lun(&self, source_iqn: &str, new_iqn: &str) -> String {
        let (address, capacity, image) = {
            let state = self.state.read();
            let source = state.lun_by_iqn(source_iqn);
            let address = source.map(|l| l.address.clone()).unwrap_or_default();
            let capacity = source.map(|l| l.capacity_bytes).unwrap_or(0);
            let image = source
                .and_then(|l| l.formatted.as_ref())
                .and_then(|ds| state.datastores.get(ds))
                .map(|ds| VolumeImage {
                    label: ds.info.name.clone(),
                    tree: ds.tree.clone(),
                    capacity_bytes: ds.info.capacity_bytes,
                });
            (address, capacity, image)
        };

        let device_id = self.add_lun(new_iqn, &address, capacity);
        if let Some(lun) = self.state.write().luns.get_mut(&device_id) {
            lun.image = image;
        }
        device_id
    }

    pub fn add_send_target(&self, host: &str, address: &str) {
        if let Some(adapter) = self
            .state
            .write()
            .hosts
            .get_mut(host)
            .and_then(|h| h.adapter.as_mut())
        {
            adapter.send_targets.push(address.to_string());
        }
    }

    pub fn remove_iscsi_adapter(&self, host: &str) {
        if let Some(h) = self.state.write().hosts.get_mut(host) {
            h.adapter = None;
        }
    }

    /// IQNs statically configured on a host's adapter
    pub fn static_targets(&self, host: &str) -> Vec<String> {
        self.state
            .read()
            .hosts
            .get(host)
            .and_then(|h| h.adapter.as_ref())
            .map(|a| a.static_targets.iter().map(|t| t.iqn.clone()).collect())
            .unwrap_or_default()
    }

    // =========================================================================
    // Inventory Views
    // =========================================================================

    pub fn host_names(&self, cluster: &str) -> Vec<String> {
        self.state.read().cluster_hosts(cluster)
    }

    pub fn datastore_count(&self) -> usize {
        self.state.read().datastores.len()
    }

    pub fn is_mounted(&self, host: &str, datastore: &str) -> bool {
        self.state
            .read()
            .datastores
            .get(datastore)
            .and_then(|ds| ds.info.mounts.get(host))
            .map(|m| m.mounted)
            .unwrap_or(false)
    }

    pub fn vm_names(&self) -> Vec<String> {
        self.state.read().vms.keys().cloned().collect()
    }

    pub fn set_power(&self, vm: &str, power: PowerState) {
        if let Some(vm) = self.state.write().vms.get_mut(vm) {
            vm.power = power;
        }
    }

    /// Drop a VM's snapshot records while keeping their delta disks, as
    /// happens when snapshot metadata is lost
    pub fn forget_snapshots(&self, vm: &str) {
        if let Some(vm) = self.state.write().vms.get_mut(vm) {
            vm.snapshots.clear();
        }
    }

    // =========================================================================
    // Datastore Files
    // =========================================================================

    /// Place a plain file, creating its folders
    pub fn put_file(&self, path: &DatastorePath, size: u64) {
        let mut state = self.state.write();
        if let Some(ds) = state.datastores.get_mut(path.datastore()) {
            if let Some(parent) = path.parent() {
                ds.tree.ensure_folder(parent.relative());
            }
            ds.tree
                .files
                .insert(path.relative().to_string(), SimFile { size, disk: None });
        }
    }

    /// Relative paths of every file on a datastore, sorted
    pub fn list_files(&self, datastore: &str) -> Vec<String> {
        self.state
            .read()
            .datastores
            .get(datastore)
            .map(|ds| ds.tree.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn host_handle(&self, name: &str) -> HostHandle {
        Arc::new(SimHost::new(name, self.clone()))
    }
}

// =============================================================================
// Inventory Port
// =============================================================================

#[async_trait]
impl ClusterInventory for SimulatedCluster {
    async fn cluster_hosts(&self, cluster: &str) -> Result<Vec<HostHandle>> {
        let names = {
            let mut state = self.state.write();
            state.check("inventory.cluster_hosts")?;
            state
                .clusters
                .get(cluster)
                .cloned()
                .ok_or_else(|| Error::not_found("Cluster", cluster))?
        };
        Ok(names.iter().map(|n| self.host_handle(n)).collect())
    }

    async fn find_datastore(&self, name: &str) -> Result<Option<Datastore>> {
        let mut state = self.state.write();
        state.check("inventory.find_datastore")?;
        Ok(state.datastores.get(name).map(|ds| ds.info.clone()))
    }

    async fn rename_datastore(&self, current: &str, new_name: &str) -> Result<()> {
        let mut state = self.state.write();
        state.check("datastore.rename")?;
        if state.datastores.contains_key(new_name) {
            return Err(Error::already_exists("Datastore", new_name));
        }
        let mut ds = state
            .datastores
            .remove(current)
            .ok_or_else(|| Error::not_found("Datastore", current))?;
        ds.info.name = new_name.to_string();
        if let Some(lun) = ds.lun.as_ref().and_then(|id| state.luns.get_mut(id)) {
            lun.formatted = Some(new_name.to_string());
        }
        state.datastores.insert(new_name.to_string(), ds);
        state.rename_references(current, new_name);
        state.record("datastore.rename", format!("{} {}", current, new_name));
        Ok(())
    }
}

// =============================================================================
// Session
// =============================================================================

pub struct SimSession {
    endpoint: String,
    cluster: SimulatedCluster,
}

impl HypervisorSession for SimSession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn inventory(&self) -> Arc<dyn ClusterInventory> {
        Arc::new(self.cluster.clone())
    }

    fn files(&self) -> Arc<dyn DatastoreBrowser> {
        Arc::new(self.cluster.clone())
    }

    fn vms(&self) -> Arc<dyn VmManager> {
        Arc::new(self.cluster.clone())
    }
}

#[async_trait]
impl SessionConnector for SimulatedCluster {
    async fn connect(&self, endpoint: &str) -> Result<SessionRef> {
        self.state.write().check("session.connect")?;
        let n = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Simulated session #{} to {}", n, endpoint);
        Ok(Arc::new(SimSession {
            endpoint: endpoint.to_string(),
            cluster: self.clone(),
        }))
    }
}

/// Build a resignatured datastore from a LUN image
pub(crate) fn datastore_from_image(name: &str, lun: &LunState, image: VolumeImage, cluster: &str) -> DatastoreState {
    let (storage_host, storage_port) = lun.portal();
    DatastoreState {
        info: Datastore {
            name: name.to_string(),
            kind: DatastoreKind::Vmfs,
            backing: DatastoreBacking::Lun {
                iqn: lun.iqn.clone(),
                storage_host,
                storage_port,
            },
            cluster: Some(cluster.to_string()),
            capacity_bytes: image.capacity_bytes.max(lun.capacity_bytes.saturating_sub(VMFS_RESERVED)),
            mounts: BTreeMap::new(),
        },
        lun: Some(lun.device_id.clone()),
        tree: image.tree,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_builder_mounts_local_datastores() {
        let sim = SimulatedCluster::builder()
            .cluster("c1", 2)
            .local_datastore("ds1", "c1", 1 << 40)
            .build();

        let ds = sim.find_datastore("ds1").await.unwrap().unwrap();
        assert!(ds.is_ready_on(&sim.host_names("c1")));
        assert!(!ds.is_managed());
        assert_eq!(sim.host_names("c1"), vec!["c1-host-0", "c1-host-1"]);
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let sim = SimulatedCluster::builder().cluster("c1", 1).build();
        sim.inject_fault("inventory.cluster_hosts", SimFault::SessionExpired);

        let err = sim.cluster_hosts("c1").await.err().unwrap();
        assert!(err.is_session_fault());
        assert_eq!(sim.cluster_hosts("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rename_datastore_rewrites_paths() {
        let sim = SimulatedCluster::builder()
            .cluster("c1", 1)
            .local_datastore("old", "c1", 1 << 30)
            .build();
        sim.put_file(&"[old] vm/a.vmdk".parse().unwrap(), 1);

        sim.rename_datastore("old", "new").await.unwrap();
        assert!(sim.find_datastore("old").await.unwrap().is_none());
        assert_eq!(sim.list_files("new"), vec!["vm/a.vmdk"]);
        assert_eq!(sim.event_log(), vec!["datastore.rename old new"]);

        assert_matches!(
            sim.rename_datastore("missing", "x").await,
            Err(Error::NotFound { .. })
        );
    }
}
