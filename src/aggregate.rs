//! Cluster-wide read queries
//!
//! Both queries fan out to every registered runner and merge what comes back. Runners
//! that fail are reported in an error list; they are never dropped from the result
//! silently.

use crate::client::{AppSummary, RunnerError, Sample, SystemInfo};
use crate::cluster::ClusterRegistry;
use crate::error::GatewayError;
use crate::runner::Runner;
use crate::sync::{RefreshReport, Synchronizer};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Default ceiling on the whole system-info fan-out
pub const DEFAULT_AGGREGATE_TIMEOUT: Duration = Duration::from_secs(45);

/// An application together with the runner hosting it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedApp {
    pub runner_id: String,
    #[serde(flatten)]
    pub app: AppSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppListing {
    pub apps: Vec<ListedApp>,
    pub errors: Vec<String>,
    pub count: usize,
}

/// One runner's entry in the system overview
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSystem {
    pub runner_id: String,
    pub url: String,
    pub started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<SystemInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemOverview {
    /// True when every registered runner reports itself started
    pub all_started: bool,
    pub runners: Vec<RunnerSystem>,
    /// Samples across the cluster, de-duplicated by id (or name), first seen wins
    pub samples: Vec<Sample>,
    pub errors: Vec<String>,
}

/// Refresh the directory from every runner and list all applications by name
pub async fn list_applications(
    registry: &ClusterRegistry,
    synchronizer: &Synchronizer,
) -> Result<AppListing, GatewayError> {
    let runners = registry.list();
    let report = synchronizer.refresh_all(&runners).await?;
    registry.recount(&synchronizer.directory().snapshot());

    let listing = merge_listings(report);
    if !listing.errors.is_empty() {
        warn!(errors = ?listing.errors, "Application listing is partial");
    }
    Ok(listing)
}

/// Flatten per-runner listings and sort them by name, ignoring case
pub fn merge_listings(report: RefreshReport) -> AppListing {
    let mut apps: Vec<ListedApp> = report
        .listings
        .into_iter()
        .flat_map(|listing| {
            let runner_id = listing.runner_id;
            listing.apps.into_iter().map(move |app| ListedApp {
                runner_id: runner_id.clone(),
                app,
            })
        })
        .collect();
    apps.sort_by_cached_key(|listed| listed.app.name.to_lowercase());

    AppListing {
        count: apps.len(),
        apps,
        errors: report.errors,
    }
}

/// Ask every runner for its system info, bounded per runner and overall by `ceiling`
pub async fn system_overview(
    registry: &ClusterRegistry,
    synchronizer: &Synchronizer,
    ceiling: Duration,
) -> Result<SystemOverview, GatewayError> {
    let runners = registry.list();
    let handles: Vec<_> = runners
        .iter()
        .map(|runner| {
            let synchronizer = synchronizer.clone();
            let runner = Arc::clone(runner);
            tokio::spawn(async move { synchronizer.fetch_system_info(&runner).await })
        })
        .collect();
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

    let joined = match tokio::time::timeout(ceiling, join_all(handles)).await {
        Ok(joined) => joined,
        Err(_) => {
            for abort in aborts {
                abort.abort();
            }
            warn!(
                ceiling_secs = ceiling.as_secs(),
                runners = runners.len(),
                "System overview exceeded its ceiling"
            );
            return Err(GatewayError::AggregateTimeout(ceiling));
        }
    };

    let mut results = Vec::with_capacity(joined.len());
    for result in joined {
        results.push(result.map_err(|e| GatewayError::Interrupted(e.to_string()))?);
    }

    let overview = merge_system(&runners, results);
    info!(
        runners = overview.runners.len(),
        all_started = overview.all_started,
        errors = overview.errors.len(),
        "System overview assembled"
    );
    Ok(overview)
}

/// Merge per-runner system results, in registration order.
///
/// `results` must be parallel to `runners`.
pub fn merge_system(
    runners: &[Arc<Runner>],
    results: Vec<Result<SystemInfo, RunnerError>>,
) -> SystemOverview {
    let mut entries = Vec::with_capacity(runners.len());
    let mut samples = Vec::new();
    let mut seen = HashSet::new();
    let mut errors = Vec::new();

    for (runner, result) in runners.iter().zip(results) {
        match result {
            Ok(info) => {
                for sample in &info.samples {
                    let fresh = match sample.dedup_key() {
                        Some(key) => seen.insert(key.to_string()),
                        None => true,
                    };
                    if fresh {
                        samples.push(sample.clone());
                    }
                }
                entries.push(RunnerSystem {
                    runner_id: runner.id().to_string(),
                    url: runner.url().to_string(),
                    started: info.started,
                    info: Some(info),
                    error: None,
                });
            }
            Err(e) => {
                let message = format!("{}: {}", runner.id(), e);
                errors.push(message.clone());
                entries.push(RunnerSystem {
                    runner_id: runner.id().to_string(),
                    url: runner.url().to_string(),
                    started: false,
                    info: None,
                    error: Some(message),
                });
            }
        }
    }

    SystemOverview {
        all_started: entries.iter().all(|entry| entry.started),
        runners: entries,
        samples,
        errors,
    }
}
