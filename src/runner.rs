//! Runner identity, descriptors and the persisted membership format

use crate::directory::authority_of;
use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Path of a runner's application endpoint
pub const APPS_PATH: &str = "/api/v1/apps";
/// Path of a runner's system endpoint
pub const SYSTEM_PATH: &str = "/api/v1/system";

/// A registered backend node.
///
/// Equality and hashing use `id` only. `observed_app_count` is a cached projection of the
/// directory and is never persisted.
#[derive(Debug)]
pub struct Runner {
    id: String,
    url: String,
    authority: String,
    max_apps: usize,
    observed_app_count: AtomicUsize,
}

impl Runner {
    /// Create a runner, validating that `url` is an absolute http(s) URL
    pub fn new(id: &str, url: &str, max_apps: usize) -> Result<Self, GatewayError> {
        let id = id.trim();
        if id.is_empty() || id.contains('/') {
            return Err(GatewayError::InvalidRunner(format!(
                "runner id must be non-empty and contain no '/': {:?}",
                id
            )));
        }

        let url = url.trim().trim_end_matches('/');
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(GatewayError::InvalidRunner(format!(
                "runner url must be absolute http(s): {}",
                url
            )));
        }
        let authority = authority_of(url).ok_or_else(|| {
            GatewayError::InvalidRunner(format!("runner url has no authority: {}", url))
        })?;

        Ok(Self {
            id: id.to_string(),
            url: url.to_string(),
            authority,
            max_apps,
            observed_app_count: AtomicUsize::new(0),
        })
    }

    pub fn from_record(record: &RunnerRecord) -> Result<Self, GatewayError> {
        Self::new(&record.id, &record.url, record.max_apps)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Base URL without a trailing slash
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Lowercased `host:port` of the base URL
    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn max_apps(&self) -> usize {
        self.max_apps
    }

    pub fn observed_app_count(&self) -> usize {
        self.observed_app_count.load(Ordering::SeqCst)
    }

    pub(crate) fn set_observed_app_count(&self, count: usize) {
        self.observed_app_count.store(count, Ordering::SeqCst);
    }

    pub fn has_capacity(&self) -> bool {
        self.observed_app_count() < self.max_apps
    }

    pub fn apps_url(&self) -> String {
        format!("{}{}", self.url, APPS_PATH)
    }

    pub fn system_url(&self) -> String {
        format!("{}{}", self.url, SYSTEM_PATH)
    }

    /// Location at which an application hosted on this runner is served
    pub fn app_location(&self, name: &str) -> String {
        format!("{}/{}", self.url, name)
    }

    pub fn record(&self) -> RunnerRecord {
        RunnerRecord {
            id: self.id.clone(),
            url: self.url.clone(),
            max_apps: self.max_apps,
        }
    }

    pub fn descriptor(&self) -> RunnerDescriptor {
        RunnerDescriptor {
            id: self.id.clone(),
            url: self.url.clone(),
            apps_url: self.apps_url(),
            system_url: self.system_url(),
            max_apps: self.max_apps,
            observed_app_count: self.observed_app_count(),
        }
    }
}

impl PartialEq for Runner {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Runner {}

impl Hash for Runner {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Runner as returned by the management API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerDescriptor {
    pub id: String,
    pub url: String,
    pub apps_url: String,
    pub system_url: String,
    pub max_apps: usize,
    pub observed_app_count: usize,
}

/// Runner as persisted in the cluster snapshot and accepted on registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerRecord {
    pub id: String,
    pub url: String,
    pub max_apps: usize,
}

/// On-disk cluster membership
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    #[serde(default)]
    pub runners: Vec<RunnerRecord>,
}
