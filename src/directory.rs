//! Application directory
//!
//! Maps application names to the absolute URL prefix at which each application is
//! currently served. It knows nothing about runners: capacity accounting is derived from
//! it by matching URL authorities.

use dashmap::DashMap;
use hyper::Uri;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Point-in-time copy of the directory, independent of later writes
pub type DirectorySnapshot = HashMap<String, String>;

/// Concurrent name → backend location map
#[derive(Debug, Default)]
pub struct Directory {
    entries: DashMap<String, String>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `name` to `url`, replacing any previous mapping
    pub fn add(&self, name: &str, url: &str) {
        if let Some(previous) = self.entries.insert(name.to_string(), url.to_string()) {
            if previous != url {
                debug!(app = name, previous = %previous, url, "Directory entry replaced");
            }
        }
    }

    /// Remove the mapping for `name`, returning its target if there was one
    pub fn remove(&self, name: &str) -> Option<String> {
        self.entries.remove(name).map(|(_, url)| url)
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy every entry out of the map.
    ///
    /// Each entry is read under its shard lock, so no entry is ever torn; the copy as a
    /// whole is not atomic with respect to concurrent writers.
    pub fn snapshot(&self) -> DirectorySnapshot {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Names currently mapped to `authority`
    pub fn names_at_authority(&self, authority: &str) -> HashSet<String> {
        self.entries
            .iter()
            .filter(|entry| authority_of(entry.value()).as_deref() == Some(authority))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove every entry whose target authority equals `authority` and whose name does
    /// not satisfy `keep`. Returns the removed names.
    pub fn retain_at_authority<F>(&self, authority: &str, keep: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| {
                authority_of(entry.value()).as_deref() == Some(authority) && !keep(entry.key())
            })
            .map(|entry| entry.key().clone())
            .collect();

        for name in &stale {
            // Only drop the entry if it still points at the same authority
            self.entries
                .remove_if(name, |_, url| authority_of(url).as_deref() == Some(authority));
        }
        stale
    }
}

/// Extract the lowercased `host:port` authority of an absolute URL
pub fn authority_of(url: &str) -> Option<String> {
    let uri: Uri = url.parse().ok()?;
    uri.authority().map(|a| a.as_str().to_ascii_lowercase())
}

/// Count the entries of `snapshot` whose target authority equals `authority`
pub fn count_at_authority(snapshot: &DirectorySnapshot, authority: &str) -> usize {
    snapshot
        .values()
        .filter(|url| authority_of(url).as_deref() == Some(authority))
        .count()
}
