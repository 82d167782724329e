//! Cluster registry: runner membership, persistence and placement
//!
//! Membership changes are serialized and every change rewrites the whole snapshot file
//! before it becomes visible. If the write fails the change is discarded.
//!
//! Allocation picks the least-loaded runner with free capacity. A runner's load is the
//! number of directory entries at its authority plus the placements currently reserved
//! against that authority. [`ClusterRegistry::allocate`] hands out a [`Reservation`] that
//! is given back through [`ClusterRegistry::release`] once the placement either landed in
//! the directory or failed. A reservation dropped without being released (the placement
//! was cancelled mid-call) gives its slot back on drop.

use crate::directory::{authority_of, count_at_authority, Directory, DirectorySnapshot};
use crate::error::GatewayError;
use crate::runner::{ClusterSnapshot, Runner};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ClusterRegistry {
    /// Location of the membership snapshot
    state_file: PathBuf,
    /// Runners in registration order
    runners: RwLock<Vec<Arc<Runner>>>,
    /// Held for the whole of a membership change, including the snapshot write
    mutation: Mutex<()>,
    /// Outstanding placements per authority; also serializes allocation
    reservations: Arc<Mutex<HashMap<String, usize>>>,
}

/// A slot held against a runner's authority for one in-flight placement
#[derive(Debug)]
pub struct Reservation {
    runner: Arc<Runner>,
    reservations: Arc<Mutex<HashMap<String, usize>>>,
    released: bool,
}

impl Reservation {
    pub fn runner(&self) -> &Arc<Runner> {
        &self.runner
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Counts catch up on the next recount
        give_back(&mut self.reservations.lock(), self.runner.authority());
        debug!(runner_id = self.runner.id(), "Abandoned reservation returned");
    }
}

impl ClusterRegistry {
    /// Load membership from `state_file`, creating an empty snapshot if it is absent
    pub fn open<P: AsRef<Path>>(state_file: P) -> Result<Self, GatewayError> {
        let state_file = state_file.as_ref().to_path_buf();

        let runners = if state_file.exists() {
            let snapshot = read_snapshot(&state_file)?;
            let mut seen = HashSet::new();
            let mut runners = Vec::with_capacity(snapshot.runners.len());
            for record in &snapshot.runners {
                if !seen.insert(record.id.clone()) {
                    warn!(runner_id = record.id, "Skipping duplicate runner in cluster state");
                    continue;
                }
                runners.push(Arc::new(Runner::from_record(record)?));
            }
            info!(
                path = %state_file.display(),
                runners = runners.len(),
                "Cluster state loaded"
            );
            runners
        } else {
            write_snapshot(&state_file, &[])?;
            info!(path = %state_file.display(), "Initialized empty cluster state");
            Vec::new()
        };

        Ok(Self {
            state_file,
            runners: RwLock::new(runners),
            mutation: Mutex::new(()),
            reservations: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// All runners in registration order
    pub fn list(&self) -> Vec<Arc<Runner>> {
        self.runners.read().clone()
    }

    /// The earliest registered runner
    pub fn first(&self) -> Option<Arc<Runner>> {
        self.runners.read().first().cloned()
    }

    pub fn len(&self) -> usize {
        self.runners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.read().is_empty()
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Runner>> {
        self.runners.read().iter().find(|r| r.id() == id).cloned()
    }

    /// First runner, in registration order, serving the authority of `url`.
    ///
    /// `url` may be an absolute URL or a bare `host:port`.
    pub fn lookup_by_authority(&self, url: &str) -> Option<Arc<Runner>> {
        let authority = authority_of(url).unwrap_or_else(|| url.to_ascii_lowercase());
        self.runners
            .read()
            .iter()
            .find(|r| r.authority() == authority)
            .cloned()
    }

    /// Append a runner and persist. Fails without any change if the id is taken.
    pub fn add(&self, runner: Runner) -> Result<Arc<Runner>, GatewayError> {
        let _guard = self.mutation.lock();

        let current = self.list();
        if current.iter().any(|r| r.id() == runner.id()) {
            return Err(GatewayError::DuplicateRunner(runner.id().to_string()));
        }

        let runner = Arc::new(runner);
        let mut next = current;
        next.push(Arc::clone(&runner));
        self.commit(next)?;

        info!(
            runner_id = runner.id(),
            url = runner.url(),
            max_apps = runner.max_apps(),
            "Runner registered"
        );
        Ok(runner)
    }

    /// Remove a runner by id and persist
    pub fn remove(&self, id: &str) -> Result<Arc<Runner>, GatewayError> {
        let _guard = self.mutation.lock();

        let mut next = self.list();
        let pos = next
            .iter()
            .position(|r| r.id() == id)
            .ok_or_else(|| GatewayError::RunnerNotFound(id.to_string()))?;
        let removed = next.remove(pos);
        self.commit(next)?;

        info!(runner_id = id, url = removed.url(), "Runner deregistered");
        Ok(removed)
    }

    /// Delete-then-recreate a runner under its own id in a single persisted change.
    ///
    /// Returns the old and the new runner.
    pub fn replace(&self, runner: Runner) -> Result<(Arc<Runner>, Arc<Runner>), GatewayError> {
        let _guard = self.mutation.lock();

        let mut next = self.list();
        let pos = next
            .iter()
            .position(|r| r.id() == runner.id())
            .ok_or_else(|| GatewayError::RunnerNotFound(runner.id().to_string()))?;
        let old = next.remove(pos);
        let runner = Arc::new(runner);
        next.push(Arc::clone(&runner));
        self.commit(next)?;

        info!(
            runner_id = runner.id(),
            old_url = old.url(),
            url = runner.url(),
            max_apps = runner.max_apps(),
            "Runner updated"
        );
        Ok((old, runner))
    }

    /// Write `next` to disk, then make it the live membership
    fn commit(&self, next: Vec<Arc<Runner>>) -> Result<(), GatewayError> {
        write_snapshot(&self.state_file, &next)?;
        *self.runners.write() = next;
        Ok(())
    }

    /// Pick the least-loaded runner with free capacity, skipping `excluded` ids.
    ///
    /// Every runner's count is re-projected from a directory snapshot taken while the
    /// reservations are locked, so a placement that lands and releases concurrently is
    /// seen either as an entry or as a reservation. Ties go to the earliest registered
    /// runner.
    pub fn allocate(
        &self,
        directory: &Directory,
        excluded: &HashSet<String>,
    ) -> Option<Reservation> {
        let mut reservations = self.reservations.lock();
        let snapshot = &directory.snapshot();
        let runners = self.list();

        let mut selected: Option<(&Arc<Runner>, usize)> = None;
        for runner in &runners {
            let count = project(snapshot, &reservations, runner.authority());
            runner.set_observed_app_count(count);

            if excluded.contains(runner.id()) || count >= runner.max_apps() {
                continue;
            }
            match selected {
                Some((_, best)) if count >= best => {}
                _ => selected = Some((runner, count)),
            }
        }

        let (runner, _) = selected?;
        *reservations
            .entry(runner.authority().to_string())
            .or_insert(0) += 1;
        let count = project(snapshot, &reservations, runner.authority());
        for peer in runners.iter().filter(|r| r.authority() == runner.authority()) {
            peer.set_observed_app_count(count);
        }

        debug!(
            runner_id = runner.id(),
            observed_app_count = count,
            max_apps = runner.max_apps(),
            excluded = excluded.len(),
            "Runner allocated"
        );
        Some(Reservation {
            runner: Arc::clone(runner),
            reservations: Arc::clone(&self.reservations),
            released: false,
        })
    }

    /// Hand back `reservation` and re-project every count.
    ///
    /// Call this once the placement has either been recorded in the directory or failed.
    pub fn release(&self, mut reservation: Reservation, directory: &Directory) {
        let mut reservations = self.reservations.lock();
        give_back(&mut reservations, reservation.runner.authority());
        reservation.released = true;
        self.project_all(&directory.snapshot(), &reservations);
    }

    /// Re-project every runner's count from `snapshot`
    pub fn recount(&self, snapshot: &DirectorySnapshot) {
        let reservations = self.reservations.lock();
        self.project_all(snapshot, &reservations);
    }

    fn project_all(&self, snapshot: &DirectorySnapshot, reservations: &HashMap<String, usize>) {
        for runner in self.runners.read().iter() {
            runner.set_observed_app_count(project(snapshot, reservations, runner.authority()));
        }
    }
}

fn give_back(reservations: &mut HashMap<String, usize>, authority: &str) {
    if let Some(pending) = reservations.get_mut(authority) {
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            reservations.remove(authority);
        }
    }
}

fn project(
    snapshot: &DirectorySnapshot,
    reservations: &HashMap<String, usize>,
    authority: &str,
) -> usize {
    count_at_authority(snapshot, authority) + reservations.get(authority).copied().unwrap_or(0)
}

fn read_snapshot(path: &Path) -> Result<ClusterSnapshot, GatewayError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::Persistence(format!("failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        GatewayError::Persistence(format!("failed to parse {}: {}", path.display(), e))
    })
}

/// Rewrite the snapshot atomically: write a sibling temp file, then rename it over `path`
fn write_snapshot(path: &Path, runners: &[Arc<Runner>]) -> Result<(), GatewayError> {
    let snapshot = ClusterSnapshot {
        runners: runners.iter().map(|r| r.record()).collect(),
    };
    let json = serde_json::to_vec_pretty(&snapshot)
        .map_err(|e| GatewayError::Persistence(format!("failed to serialize: {}", e)))?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| {
        GatewayError::Persistence(format!("failed to create {}: {}", dir.display(), e))
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .map_err(|e| GatewayError::Persistence(format!("failed to create temp file: {}", e)))?;
    tmp.write_all(&json)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| GatewayError::Persistence(format!("failed to write snapshot: {}", e)))?;
    tmp.persist(path).map_err(|e| {
        GatewayError::Persistence(format!("failed to replace {}: {}", path.display(), e))
    })?;

    debug!(path = %path.display(), runners = runners.len(), "Cluster state persisted");
    Ok(())
}
