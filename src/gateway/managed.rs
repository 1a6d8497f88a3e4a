//! Managed Storage Gateway
//!
//! Turns an iSCSI target or an NFS export into a datastore that every host
//! of a cluster has mounted. Block provisioning walks a fixed sequence of
//! cluster-wide steps; a failure at any step aborts and reports the last
//! stage that completed.

use crate::cluster::{classify_discovery, datastore_ready_on, ClusterHostCoordinator};
use crate::domain::model::{nfs_datastore_name, Datastore, ManagedStorageTarget, ScsiDisk, StaticTarget};
use crate::domain::ports::{ClusterInventory, HostHandle, SessionRef};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Provisioning Stages
// =============================================================================

/// Progress of a block datastore through provisioning
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProvisionStage {
    Undiscovered,
    TargetAdded,
    Rescanned,
    DiskVisible,
    DatastoreCreated,
    MountedOnAllHosts,
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionStage::Undiscovered => "undiscovered",
            ProvisionStage::TargetAdded => "target-added",
            ProvisionStage::Rescanned => "rescanned",
            ProvisionStage::DiskVisible => "disk-visible",
            ProvisionStage::DatastoreCreated => "datastore-created",
            ProvisionStage::MountedOnAllHosts => "mounted-on-all-hosts",
        };
        f.write_str(s)
    }
}

struct StageTracker {
    datastore: String,
    stage: ProvisionStage,
}

impl StageTracker {
    fn new(datastore: &str) -> Self {
        Self {
            datastore: datastore.to_string(),
            stage: ProvisionStage::Undiscovered,
        }
    }

    fn advance(&mut self, next: ProvisionStage) {
        debug!("Datastore {}: {} -> {}", self.datastore, self.stage, next);
        self.stage = next;
    }

    fn fail(&self, source: Error) -> Error {
        warn!("Datastore {} failed after {}: {}", self.datastore, self.stage, source);
        Error::Provisioning {
            datastore: self.datastore.clone(),
            stage: self.stage.to_string(),
            source: Box::new(source),
        }
    }
}

// =============================================================================
// Gateway
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct ManagedStorageGateway {
    coordinator: ClusterHostCoordinator,
}

impl ManagedStorageGateway {
    pub fn new(coordinator: ClusterHostCoordinator) -> Self {
        Self { coordinator }
    }

    /// Return the ready datastore for a LUN, creating it when needed
    pub async fn provision_block_datastore(
        &self,
        session: &SessionRef,
        cluster: &str,
        target: &ManagedStorageTarget,
    ) -> Result<Datastore> {
        let name = target.datastore_name();
        let inventory = session.inventory();
        let hosts = cluster_hosts(inventory.as_ref(), cluster).await?;

        info!("Provisioning block datastore {} on cluster {} ({} hosts)", name, cluster, hosts.len());

        let mut tracker = StageTracker::new(&name);
        let result = self
            .run_block_provisioning(inventory.as_ref(), &hosts, target, &name, &mut tracker)
            .await;

        match result {
            Ok(datastore) => {
                info!("Datastore {} ready on all {} hosts", name, hosts.len());
                Ok(datastore)
            }
            Err(e) => Err(tracker.fail(e)),
        }
    }

    async fn run_block_provisioning(
        &self,
        inventory: &dyn ClusterInventory,
        hosts: &[HostHandle],
        target: &ManagedStorageTarget,
        name: &str,
        tracker: &mut StageTracker,
    ) -> Result<Datastore> {
        self.add_static_targets(hosts, target).await?;
        tracker.advance(ProvisionStage::TargetAdded);

        self.rescan(hosts).await?;
        tracker.advance(ProvisionStage::Rescanned);

        match find_target_disk(&hosts[0], &target.iqn).await? {
            Some(disk) => {
                tracker.advance(ProvisionStage::DiskVisible);

                info!("Creating VMFS datastore {} on {}", name, disk.device_path);
                hosts[0].create_vmfs_datastore(name, &disk).await?;
                tracker.advance(ProvisionStage::DatastoreCreated);

                self.rescan_vmfs(hosts).await?;
                self.wait_until_ready(hosts, name).await?;
                hosts[0].expand_datastore(name).await?;
            }
            None => {
                // The LUN is either not visible yet or already claimed by a
                // datastore someone else created.
                debug!("No unclaimed disk for {} yet, rescanning again", target.iqn);
                self.rescan(hosts).await?;

                if inventory.find_datastore(name).await?.is_none() {
                    return Err(Error::not_found("SCSI disk for target", target.iqn.clone()));
                }
                info!("Datastore {} already exists, mounting cluster-wide", name);
                tracker.advance(ProvisionStage::DatastoreCreated);

                self.mount_where_missing(hosts, name).await?;
                self.wait_until_ready(hosts, name).await?;
            }
        }
        tracker.advance(ProvisionStage::MountedOnAllHosts);

        inventory
            .find_datastore(name)
            .await?
            .ok_or_else(|| Error::not_found("Datastore", name))
    }

    /// Create (or reuse) an NFS datastore. NFS mounts propagate to the
    /// cluster on their own, so only one host is asked to create it.
    pub async fn provision_file_datastore(
        &self,
        session: &SessionRef,
        cluster: &str,
        storage_host: &str,
        export_path: &str,
        unique_id: &str,
    ) -> Result<Datastore> {
        let name = nfs_datastore_name(unique_id);
        let inventory = session.inventory();

        if let Some(existing) = inventory.find_datastore(&name).await? {
            debug!("NFS datastore {} already exists", name);
            return Ok(existing);
        }

        let hosts = cluster_hosts(inventory.as_ref(), cluster).await?;
        info!("Creating NFS datastore {} for {}:{}", name, storage_host, export_path);
        hosts[0].create_nfs_datastore(&name, storage_host, export_path).await?;
        self.wait_until_ready(&hosts, &name).await?;

        inventory
            .find_datastore(&name)
            .await?
            .ok_or_else(|| Error::not_found("Datastore", name))
    }

    /// Unmount a managed datastore everywhere and drop its static targets.
    /// Hosts where it is already unmounted are skipped.
    pub async fn teardown(
        &self,
        session: &SessionRef,
        cluster: &str,
        datastore_name: &str,
        target: &ManagedStorageTarget,
    ) -> Result<()> {
        let inventory = session.inventory();
        let hosts = cluster_hosts(inventory.as_ref(), cluster).await?;

        info!("Tearing down datastore {} on cluster {}", datastore_name, cluster);

        let name = datastore_name.to_string();
        self.coordinator
            .fan_out("unmount datastore", &hosts, move |host| {
                let name = name.clone();
                async move {
                    match host.datastore_mount(&name).await? {
                        Some(mount) if mount.mounted => host.unmount_datastore(&name).await,
                        _ => {
                            debug!("Datastore {} not mounted on {}", name, host.name());
                            Ok(())
                        }
                    }
                }
            })
            .await?;

        self.remove_static_targets(&hosts, target).await?;
        self.rescan(&hosts).await
    }

    /// Give a copied LUN a fresh VMFS signature and rename the resulting
    /// datastore to the target's deterministic name.
    pub async fn resignature(
        &self,
        session: &SessionRef,
        cluster: &str,
        scsi_device_id: &str,
        target: &ManagedStorageTarget,
    ) -> Result<Datastore> {
        let name = target.datastore_name();
        let inventory = session.inventory();
        let hosts = cluster_hosts(inventory.as_ref(), cluster).await?;

        let mut tracker = StageTracker::new(&name);
        let result = self
            .run_resignature(inventory.as_ref(), &hosts, scsi_device_id, target, &name, &mut tracker)
            .await;
        result.map_err(|e| tracker.fail(e))
    }

    async fn run_resignature(
        &self,
        inventory: &dyn ClusterInventory,
        hosts: &[HostHandle],
        scsi_device_id: &str,
        target: &ManagedStorageTarget,
        name: &str,
        tracker: &mut StageTracker,
    ) -> Result<Datastore> {
        self.add_static_targets(hosts, target).await?;
        tracker.advance(ProvisionStage::TargetAdded);

        self.rescan(hosts).await?;
        tracker.advance(ProvisionStage::Rescanned);

        let unresolved = hosts[0].unresolved_volumes().await?;
        let volume = unresolved
            .into_iter()
            .find(|v| v.extent_device_paths.iter().any(|p| p.contains(scsi_device_id)))
            .ok_or_else(|| Error::not_found("Unresolved VMFS volume", scsi_device_id))?;
        tracker.advance(ProvisionStage::DiskVisible);

        info!("Resignaturing copy of {} on {}", volume.vmfs_label, scsi_device_id);
        let resignatured = hosts[0].resignature(&volume.extent_device_paths).await?;
        tracker.advance(ProvisionStage::DatastoreCreated);

        self.rescan_vmfs(hosts).await?;
        self.wait_until_ready(hosts, &resignatured).await?;

        info!("Renaming datastore {} to {}", resignatured, name);
        inventory.rename_datastore(&resignatured, name).await?;
        self.wait_until_ready(hosts, name).await?;
        tracker.advance(ProvisionStage::MountedOnAllHosts);

        inventory
            .find_datastore(name)
            .await?
            .ok_or_else(|| Error::not_found("Datastore", name))
    }

    // =========================================================================
    // Cluster Steps
    // =========================================================================

    async fn add_static_targets(&self, hosts: &[HostHandle], target: &ManagedStorageTarget) -> Result<()> {
        let plan = classify_discovery(hosts, &target.address()).await?;
        let adapters = adapter_devices(&plan.statics);
        let static_target = StaticTarget::from(target);

        self.coordinator
            .fan_out("add static target", &plan.static_hosts(), move |host| {
                let adapters = adapters.clone();
                let static_target = static_target.clone();
                async move {
                    let device = adapter_for(&adapters, host.name())?;
                    host.add_static_targets(&device, &[static_target]).await
                }
            })
            .await
    }

    async fn remove_static_targets(&self, hosts: &[HostHandle], target: &ManagedStorageTarget) -> Result<()> {
        let plan = classify_discovery(hosts, &target.address()).await?;
        let adapters = adapter_devices(&plan.statics);
        let static_target = StaticTarget::from(target);

        self.coordinator
            .fan_out("remove static target", &plan.static_hosts(), move |host| {
                let adapters = adapters.clone();
                let static_target = static_target.clone();
                async move {
                    let device = adapter_for(&adapters, host.name())?;
                    host.remove_static_targets(&device, &[static_target]).await
                }
            })
            .await
    }

    /// HBA then VMFS rescan, in that order on each host
    async fn rescan(&self, hosts: &[HostHandle]) -> Result<()> {
        self.coordinator
            .fan_out("rescan storage", hosts, |host| async move {
                host.rescan_all_hba().await?;
                host.rescan_vmfs().await
            })
            .await
    }

    async fn rescan_vmfs(&self, hosts: &[HostHandle]) -> Result<()> {
        self.coordinator
            .fan_out("rescan vmfs", hosts, |host| async move { host.rescan_vmfs().await })
            .await
    }

    async fn mount_where_missing(&self, hosts: &[HostHandle], name: &str) -> Result<()> {
        let name = name.to_string();
        self.coordinator
            .fan_out("mount datastore", hosts, move |host| {
                let name = name.clone();
                async move {
                    match host.datastore_mount(&name).await? {
                        Some(mount) if mount.is_ready() => Ok(()),
                        _ => host.mount_datastore(&name).await,
                    }
                }
            })
            .await
    }

    async fn wait_until_ready(&self, hosts: &[HostHandle], name: &str) -> Result<()> {
        let what = format!("datastore {} mounted on all hosts", name);
        self.coordinator
            .await_convergence(hosts, &what, |hosts| datastore_ready_on(hosts, name.to_string()))
            .await
    }
}

async fn cluster_hosts(inventory: &dyn ClusterInventory, cluster: &str) -> Result<Vec<HostHandle>> {
    let hosts = inventory.cluster_hosts(cluster).await?;
    if hosts.is_empty() {
        return Err(Error::Configuration(format!("cluster {} has no hosts", cluster)));
    }
    Ok(hosts)
}

/// First unclaimed disk reachable through the given IQN
async fn find_target_disk(host: &HostHandle, iqn: &str) -> Result<Option<ScsiDisk>> {
    let disks = host.scsi_disks().await?;
    Ok(disks
        .into_iter()
        .find(|d| !d.claimed && d.target_iqns.iter().any(|t| t == iqn)))
}

fn adapter_devices(hosts: &[crate::cluster::DiscoveredHost]) -> Arc<HashMap<String, String>> {
    Arc::new(
        hosts
            .iter()
            .map(|d| (d.host.name().to_string(), d.adapter.device.clone()))
            .collect(),
    )
}

fn adapter_for(adapters: &HashMap<String, String>, host: &str) -> Result<String> {
    adapters
        .get(host)
        .cloned()
        .ok_or_else(|| Error::Configuration(format!("host {} has no software iSCSI adapter", host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::sim::SimulatedCluster;
    use assert_matches::assert_matches;

    const GIB: u64 = 1 << 30;

    fn gateway() -> ManagedStorageGateway {
        ManagedStorageGateway::new(ClusterHostCoordinator::new(CoordinatorConfig {
            poll_interval_ms: 20,
            deadline_ms: 500,
        }))
    }

    fn target() -> ManagedStorageTarget {
        ManagedStorageTarget::new("iqn.2010-01.com.san:vol-42", "10.0.0.5", 3260)
    }

    fn setup(hosts: usize) -> (SimulatedCluster, SessionRef) {
        let sim = SimulatedCluster::builder().cluster("c1", hosts).build();
        sim.add_lun(&target().iqn, "10.0.0.5:3260", 20 * GIB);
        let session = sim.session();
        (sim, session)
    }

    #[tokio::test]
    async fn test_provision_block_datastore_mounts_everywhere() {
        let (sim, session) = setup(3);
        let hosts = session.inventory().cluster_hosts("c1").await.unwrap();
        sim.add_send_target(hosts[2].name(), "10.0.0.5:3260");

        let ds = gateway()
            .provision_block_datastore(&session, "c1", &target())
            .await
            .unwrap();

        assert_eq!(ds.name, target().datastore_name());
        assert!(ds.is_ready_on(&sim.host_names("c1")));
        assert!(ds.is_managed());
        assert_eq!(ds.capacity_bytes, 20 * GIB);
        // Dynamically discovering host needs no static target
        assert!(sim.static_targets(hosts[0].name()).contains(&target().iqn));
        assert!(sim.static_targets(hosts[2].name()).is_empty());
    }

    #[tokio::test]
    async fn test_provision_reuses_existing_datastore() {
        let (sim, session) = setup(2);
        let first = gateway()
            .provision_block_datastore(&session, "c1", &target())
            .await
            .unwrap();

        let hosts = session.inventory().cluster_hosts("c1").await.unwrap();
        hosts[1].unmount_datastore(&first.name).await.unwrap();

        let second = gateway()
            .provision_block_datastore(&session, "c1", &target())
            .await
            .unwrap();
        assert_eq!(first.name, second.name);
        assert!(second.is_ready_on(&sim.host_names("c1")));
        assert_eq!(sim.datastore_count(), 1);
    }

    #[tokio::test]
    async fn test_provision_fails_with_stage_when_lun_missing() {
        let sim = SimulatedCluster::builder().cluster("c1", 2).build();
        let session = sim.session();

        let err = gateway()
            .provision_block_datastore(&session, "c1", &target())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Provisioning { ref stage, .. } if stage == "rescanned");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_provision_without_adapter_is_configuration_error() {
        let (sim, session) = setup(2);
        sim.remove_iscsi_adapter("c1-host-1");

        let err = gateway()
            .provision_block_datastore(&session, "c1", &target())
            .await
            .unwrap_err();
        assert_matches!(err.root_cause(), Error::Configuration(_));
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent_per_host() {
        let (sim, session) = setup(3);
        let gw = gateway();
        let ds = gw.provision_block_datastore(&session, "c1", &target()).await.unwrap();

        let hosts = session.inventory().cluster_hosts("c1").await.unwrap();
        hosts[0].unmount_datastore(&ds.name).await.unwrap();

        gw.teardown(&session, "c1", &ds.name, &target()).await.unwrap();
        for host in sim.host_names("c1") {
            assert!(sim.static_targets(&host).is_empty());
            assert!(!sim.is_mounted(&host, &ds.name));
        }

        gw.teardown(&session, "c1", &ds.name, &target()).await.unwrap();
    }

    #[tokio::test]
    async fn test_provision_file_datastore() {
        let sim = SimulatedCluster::builder().cluster("c1", 2).build();
        let session = sim.session();

        let ds = gateway()
            .provision_file_datastore(&session, "c1", "nfs.example.com", "/export/primary", "5f3e-11aa")
            .await
            .unwrap();
        assert_eq!(ds.name, "5f3e11aa");
        assert!(ds.is_ready_on(&sim.host_names("c1")));

        let again = gateway()
            .provision_file_datastore(&session, "c1", "nfs.example.com", "/export/primary", "5f3e-11aa")
            .await
            .unwrap();
        assert_eq!(again.name, ds.name);
        assert_eq!(sim.datastore_count(), 1);
    }

    #[tokio::test]
    async fn test_resignature_then_rename() {
        let (sim, session) = setup(2);
        let gw = gateway();
        let source = gw.provision_block_datastore(&session, "c1", &target()).await.unwrap();
        sim.put_file(&format!("[{}] vol/vol.vmdk", source.name).parse().unwrap(), 1);

        let copy = ManagedStorageTarget::new("iqn.2010-01.com.san:vol-42-copy", "10.0.0.5", 3260);
        let device_id = sim.clone_lun(&target().iqn, &copy.iqn);

        let ds = gw.resignature(&session, "c1", &device_id, &copy).await.unwrap();
        assert_eq!(ds.name, copy.datastore_name());
        assert!(ds.is_ready_on(&sim.host_names("c1")));
        assert!(sim.list_files(&ds.name).contains(&"vol/vol.vmdk".to_string()));

        let log = sim.event_log();
        let resig = log.iter().position(|e| e.starts_with("host.resignature")).unwrap();
        let rename = log.iter().position(|e| e.starts_with("datastore.rename")).unwrap();
        assert!(resig < rename);
    }
}
