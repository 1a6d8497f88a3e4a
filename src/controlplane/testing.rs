//! Shared fixture for orchestrator tests

use crate::config::{CoordinatorConfig, OrchestratorConfig};
use crate::controlplane::command::{ObjectDescriptor, ObjectType, PrimaryStore, StoreRef};
use crate::controlplane::StorageOrchestrator;
use crate::domain::model::ManagedStorageTarget;
use crate::domain::path::DatastorePath;
use crate::session::{OrchestratorContext, SessionPool};
use crate::sim::SimulatedCluster;
use std::sync::Arc;
use tempfile::TempDir;

pub const GIB: u64 = 1 << 30;
pub const PORTAL: &str = "10.0.0.5";

pub struct Fixture {
    pub sim: SimulatedCluster,
    pub pool: Arc<SessionPool>,
    pub orchestrator: StorageOrchestrator,
    pub secondary_dir: TempDir,
}

impl Fixture {
    pub async fn new(hosts: usize) -> Self {
        let sim = SimulatedCluster::builder()
            .cluster("c1", hosts)
            .local_datastore("ds1", "c1", 1 << 40)
            .build();
        let pool = Arc::new(SessionPool::new(Arc::new(sim.clone())));
        pool.open();

        let config = OrchestratorConfig {
            coordinator: CoordinatorConfig {
                poll_interval_ms: 10,
                deadline_ms: 500,
            },
            ..Default::default()
        };
        let context = OrchestratorContext::new(config.endpoint.clone(), pool.clone());
        let orchestrator = StorageOrchestrator::new(config, context).unwrap();

        Self {
            sim,
            pool,
            orchestrator,
            secondary_dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn primary(&self) -> PrimaryStore {
        PrimaryStore {
            datastore: "ds1".into(),
            cluster: "c1".into(),
            managed: None,
            nfs: None,
        }
    }

    /// A managed store on a freshly added LUN
    pub fn managed_primary(&self, iqn: &str, capacity_bytes: u64) -> PrimaryStore {
        self.sim.add_lun(iqn, &format!("{}:3260", PORTAL), capacity_bytes);
        PrimaryStore {
            datastore: String::new(),
            cluster: "c1".into(),
            managed: Some(ManagedStorageTarget::new(iqn, PORTAL, 3260)),
            nfs: None,
        }
    }

    pub fn secondary(&self) -> StoreRef {
        StoreRef::Secondary {
            url: "nfs://10.0.0.9/export".into(),
            mount_point: self.secondary_dir.path().to_path_buf(),
        }
    }

    pub fn volume(&self, path: &str, size: u64) -> ObjectDescriptor {
        ObjectDescriptor::new(ObjectType::Volume, path, StoreRef::Primary(self.primary())).with_size(size)
    }
}

pub fn p(s: &str) -> DatastorePath {
    s.parse().unwrap()
}
