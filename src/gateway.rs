//! Composition root
//!
//! [`Gateway`] owns one instance of every component and wires them together. Runner
//! membership operations are composed here so the registry never holds a lock across a
//! call to a runner.

use crate::aggregate::{self, AppListing, SystemOverview};
use crate::client::{AppSummary, RunnerClient};
use crate::cluster::ClusterRegistry;
use crate::config::ClusterConfig;
use crate::directory::Directory;
use crate::error::GatewayError;
use crate::placement::{CreationRequest, CreationResult, PlacementOrchestrator};
use crate::router::Router;
use crate::runner::{Runner, RunnerDescriptor, RunnerRecord};
use crate::sync::{RefreshReport, Synchronizer};
use crate::telemetry::TelemetrySink;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Gateway {
    directory: Arc<Directory>,
    registry: Arc<ClusterRegistry>,
    synchronizer: Synchronizer,
    placement: PlacementOrchestrator,
    router: Arc<Router>,
    aggregate_timeout: Duration,
}

impl Gateway {
    /// Load cluster state and build every component. Runners are not contacted yet.
    pub fn open(
        config: &ClusterConfig,
        telemetry: Option<Arc<dyn TelemetrySink>>,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(ClusterRegistry::open(&config.state_file)?);
        let directory = Arc::new(Directory::new());
        let synchronizer = Synchronizer::new(Arc::clone(&directory), RunnerClient::new()?)
            .with_timeouts(config.refresh_timeout(), config.system_timeout());
        let placement = PlacementOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            synchronizer.clone(),
        )
        .with_create_timeout(config.create_timeout());

        let mut router = Router::new(Arc::clone(&directory), Arc::clone(&registry));
        if let Some(sink) = telemetry {
            router = router.with_telemetry(sink);
        }

        Ok(Self {
            directory,
            registry,
            synchronizer,
            placement,
            router: Arc::new(router),
            aggregate_timeout: config.aggregate_timeout(),
        })
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Rebuild the directory from every registered runner
    pub async fn synchronize(&self) -> Result<RefreshReport, GatewayError> {
        let report = self.synchronizer.refresh_all(&self.registry.list()).await?;
        self.registry.recount(&self.directory.snapshot());
        info!(
            runners = self.registry.len(),
            apps = self.directory.len(),
            failed = report.errors.len(),
            "Directory synchronized"
        );
        Ok(report)
    }

    /// Register and persist a runner, then learn what it already hosts.
    ///
    /// An unreachable runner is still registered; its applications show up on the next
    /// refresh.
    pub async fn register_runner(
        &self,
        record: RunnerRecord,
    ) -> Result<RunnerDescriptor, GatewayError> {
        let runner = self.registry.add(Runner::from_record(&record)?)?;
        if let Err(e) = self.synchronizer.refresh_one(&runner).await {
            warn!(runner_id = runner.id(), error = %e, "Registered runner did not answer");
        }
        self.registry.recount(&self.directory.snapshot());
        Ok(runner.descriptor())
    }

    /// Remove a runner and forget its applications
    pub fn deregister_runner(&self, id: &str) -> Result<RunnerDescriptor, GatewayError> {
        let runner = self.registry.remove(id)?;
        self.purge_if_orphaned(&runner);
        self.registry.recount(&self.directory.snapshot());
        Ok(runner.descriptor())
    }

    /// Replace a runner's url and capacity, keeping its id
    pub async fn update_runner(
        &self,
        id: &str,
        url: &str,
        max_apps: usize,
    ) -> Result<RunnerDescriptor, GatewayError> {
        let (old, runner) = self.registry.replace(Runner::new(id, url, max_apps)?)?;
        if old.authority() != runner.authority() {
            self.purge_if_orphaned(&old);
        }
        if let Err(e) = self.synchronizer.refresh_one(&runner).await {
            warn!(runner_id = runner.id(), error = %e, "Updated runner did not answer");
        }
        self.registry.recount(&self.directory.snapshot());
        Ok(runner.descriptor())
    }

    /// Entries at an authority stay while another registered runner still serves it
    fn purge_if_orphaned(&self, runner: &Runner) {
        if self.registry.lookup_by_authority(runner.authority()).is_some() {
            return;
        }
        self.synchronizer.purge(runner);
    }

    pub fn list_runners(&self) -> Vec<RunnerDescriptor> {
        self.registry.list().iter().map(|r| r.descriptor()).collect()
    }

    pub fn get_runner(&self, id: &str) -> Result<RunnerDescriptor, GatewayError> {
        self.registry
            .lookup(id)
            .map(|r| r.descriptor())
            .ok_or_else(|| GatewayError::RunnerNotFound(id.to_string()))
    }

    /// Refresh one runner and return exactly what it reported
    pub async fn runner_apps(&self, id: &str) -> Result<Vec<AppSummary>, GatewayError> {
        let runner = self
            .registry
            .lookup(id)
            .ok_or_else(|| GatewayError::RunnerNotFound(id.to_string()))?;
        let apps = self
            .synchronizer
            .refresh_one(&runner)
            .await
            .map_err(|e| e.into_gateway_error(runner.id()))?;
        self.registry.recount(&self.directory.snapshot());
        Ok(apps)
    }

    pub async fn create_application(
        &self,
        request: CreationRequest,
    ) -> Result<CreationResult, GatewayError> {
        self.placement.create_application(request).await
    }

    pub async fn list_applications(&self) -> Result<AppListing, GatewayError> {
        aggregate::list_applications(&self.registry, &self.synchronizer).await
    }

    pub async fn system_overview(&self) -> Result<SystemOverview, GatewayError> {
        aggregate::system_overview(&self.registry, &self.synchronizer, self.aggregate_timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> ClusterConfig {
        ClusterConfig {
            state_file: tmp.path().join("cluster.json"),
            refresh_timeout_secs: 1,
            system_timeout_secs: 1,
            aggregate_timeout_secs: 2,
            create_timeout_secs: 1,
        }
    }

    fn record(id: &str, url: &str) -> RunnerRecord {
        RunnerRecord {
            id: id.to_string(),
            url: url.to_string(),
            max_apps: 3,
        }
    }

    #[tokio::test]
    async fn test_unreachable_runner_is_still_registered() {
        let tmp = TempDir::new().unwrap();
        let gateway = Gateway::open(&config(&tmp), None).unwrap();

        let descriptor = gateway
            .register_runner(record("r1", "http://127.0.0.1:1"))
            .await
            .unwrap();
        assert_eq!(descriptor.id, "r1");
        assert_eq!(descriptor.observed_app_count, 0);
        assert_eq!(gateway.list_runners().len(), 1);

        let reopened = Gateway::open(&config(&tmp), None).unwrap();
        assert_eq!(reopened.get_runner("r1").unwrap().url, "http://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let tmp = TempDir::new().unwrap();
        let gateway = Gateway::open(&config(&tmp), None).unwrap();
        gateway
            .register_runner(record("r1", "http://127.0.0.1:1"))
            .await
            .unwrap();

        let err = gateway
            .register_runner(record("r1", "http://127.0.0.1:2"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateRunner(ref id) if id == "r1"));
    }

    #[test]
    fn test_deregister_purges_apps_of_orphaned_authority() {
        let tmp = TempDir::new().unwrap();
        let gateway = Gateway::open(&config(&tmp), None).unwrap();
        gateway
            .registry()
            .add(Runner::new("a", "http://10.0.0.1:80", 2).unwrap())
            .unwrap();
        gateway
            .registry()
            .add(Runner::new("b", "http://10.0.0.2:80", 2).unwrap())
            .unwrap();
        gateway.directory().add("shop", "http://10.0.0.1:80/shop");
        gateway.directory().add("blog", "http://10.0.0.2:80/blog");

        let removed = gateway.deregister_runner("a").unwrap();
        assert_eq!(removed.id, "a");
        assert!(gateway.directory().get("shop").is_none());
        assert!(gateway.directory().get("blog").is_some());
        assert!(matches!(
            gateway.deregister_runner("a"),
            Err(GatewayError::RunnerNotFound(_))
        ));
    }

    #[test]
    fn test_deregister_keeps_apps_of_shared_authority() {
        let tmp = TempDir::new().unwrap();
        let gateway = Gateway::open(&config(&tmp), None).unwrap();
        gateway
            .registry()
            .add(Runner::new("a", "http://10.0.0.1:80", 2).unwrap())
            .unwrap();
        gateway
            .registry()
            .add(Runner::new("a-alias", "http://10.0.0.1:80/", 2).unwrap())
            .unwrap();
        gateway.directory().add("shop", "http://10.0.0.1:80/shop");

        gateway.deregister_runner("a").unwrap();
        assert!(gateway.directory().get("shop").is_some());
    }

    #[tokio::test]
    async fn test_update_moves_runner_and_purges_old_authority() {
        let tmp = TempDir::new().unwrap();
        let gateway = Gateway::open(&config(&tmp), None).unwrap();
        gateway
            .registry()
            .add(Runner::new("a", "http://127.0.0.1:1", 2).unwrap())
            .unwrap();
        gateway.directory().add("shop", "http://127.0.0.1:1/shop");

        let updated = gateway.update_runner("a", "http://127.0.0.1:2", 7).await.unwrap();
        assert_eq!(updated.url, "http://127.0.0.1:2");
        assert_eq!(updated.max_apps, 7);
        assert!(gateway.directory().is_empty());

        let err = gateway.update_runner("zzz", "http://127.0.0.1:3", 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::RunnerNotFound(_)));
    }

    #[tokio::test]
    async fn test_runner_apps_for_unknown_runner() {
        let tmp = TempDir::new().unwrap();
        let gateway = Gateway::open(&config(&tmp), None).unwrap();
        assert!(matches!(
            gateway.runner_apps("nope").await,
            Err(GatewayError::RunnerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_system_overview_of_empty_cluster() {
        let tmp = TempDir::new().unwrap();
        let gateway = Gateway::open(&config(&tmp), None).unwrap();
        let overview = gateway.system_overview().await.unwrap();
        assert!(overview.all_started);
        assert!(overview.runners.is_empty());
    }
}
