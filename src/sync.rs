//! Directory synchronization against live runners
//!
//! The synchronizer asks runners what they host and reconciles the [`Directory`] with the
//! answers. Each runner is queried in its own task with its own timeout; a failing runner
//! is reported as data and leaves the directory entries of the others untouched.

use crate::client::{AppSummary, RunnerClient, RunnerError, SystemInfo};
use crate::directory::Directory;
use crate::error::GatewayError;
use crate::runner::Runner;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default per-runner timeout for application listings
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);
/// Default per-runner timeout for system info
pub const DEFAULT_SYSTEM_TIMEOUT: Duration = Duration::from_secs(5);

/// Applications reported by one runner during a refresh
#[derive(Debug, Clone)]
pub struct RunnerApps {
    pub runner_id: String,
    pub apps: Vec<AppSummary>,
}

/// Outcome of a cluster-wide refresh
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    /// Listings of the runners that answered, in registration order
    pub listings: Vec<RunnerApps>,
    /// `runnerId: message` for every runner that did not
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Synchronizer {
    directory: Arc<Directory>,
    client: RunnerClient,
    refresh_timeout: Duration,
    system_timeout: Duration,
}

impl Synchronizer {
    pub fn new(directory: Arc<Directory>, client: RunnerClient) -> Self {
        Self {
            directory,
            client,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            system_timeout: DEFAULT_SYSTEM_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, refresh_timeout: Duration, system_timeout: Duration) -> Self {
        self.refresh_timeout = refresh_timeout;
        self.system_timeout = system_timeout;
        self
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn client(&self) -> &RunnerClient {
        &self.client
    }

    /// Refresh the directory from every runner in parallel.
    ///
    /// Per-runner failures end up in [`RefreshReport::errors`]. Only a task that
    /// could not be joined fails the whole call.
    pub async fn refresh_all(&self, runners: &[Arc<Runner>]) -> Result<RefreshReport, GatewayError> {
        let tasks = runners.iter().map(|runner| {
            let this = self.clone();
            let runner = Arc::clone(runner);
            tokio::spawn(async move {
                let result = this.refresh_one(&runner).await;
                (runner, result)
            })
        });

        let mut report = RefreshReport::default();
        for joined in join_all(tasks).await {
            let (runner, result) =
                joined.map_err(|e| GatewayError::Interrupted(e.to_string()))?;
            match result {
                Ok(apps) => report.listings.push(RunnerApps {
                    runner_id: runner.id().to_string(),
                    apps,
                }),
                Err(e) => report.errors.push(format!("{}: {}", runner.id(), e)),
            }
        }

        debug!(
            runners = runners.len(),
            answered = report.listings.len(),
            failed = report.errors.len(),
            "Cluster refresh complete"
        );
        Ok(report)
    }

    /// Refresh the directory from a single runner and return its raw listing.
    ///
    /// On success every reported application points at this runner, and entries at the
    /// runner's authority that were not reported are dropped. Entries added while the
    /// listing was in flight are left for the next refresh. On failure the directory is
    /// left as it was.
    pub async fn refresh_one(&self, runner: &Runner) -> Result<Vec<AppSummary>, RunnerError> {
        let known = self.directory.names_at_authority(runner.authority());
        let apps = match self.client.list_apps(runner, self.refresh_timeout).await {
            Ok(apps) => apps,
            Err(e) => {
                warn!(runner_id = runner.id(), error = %e, "Failed to refresh runner");
                return Err(e);
            }
        };

        let reported: HashSet<&str> = apps.iter().map(|app| app.name.as_str()).collect();
        for name in &reported {
            self.directory.add(name, &runner.app_location(name));
        }
        let removed = self
            .directory
            .retain_at_authority(runner.authority(), |name| {
                reported.contains(name) || !known.contains(name)
            });
        if !removed.is_empty() {
            info!(
                runner_id = runner.id(),
                removed = ?removed,
                "Dropped applications no longer reported by runner"
            );
        }

        debug!(runner_id = runner.id(), apps = apps.len(), "Runner refreshed");
        Ok(apps)
    }

    /// Drop every directory entry served from the runner's authority, without calling it
    pub fn purge(&self, runner: &Runner) -> Vec<String> {
        let removed = self
            .directory
            .retain_at_authority(runner.authority(), |_| false);
        if !removed.is_empty() {
            info!(runner_id = runner.id(), removed = removed.len(), "Purged runner applications");
        }
        removed
    }

    /// Fetch a runner's system info with the system timeout
    pub async fn fetch_system_info(&self, runner: &Runner) -> Result<SystemInfo, RunnerError> {
        self.client.system_info(runner, self.system_timeout).await
    }
}
