use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ExecutorConfig;

use super::VmRole;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct FilesystemId(pub Uuid);

impl fmt::Display for FilesystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Claim on one staged root filesystem; hand it back with `FilesystemPooler::release`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemLease {
    id: FilesystemId,
    role: VmRole,
    from_cache: bool,
}

impl FilesystemLease {
    pub fn id(&self) -> FilesystemId {
        self.id
    }

    pub fn role(&self) -> VmRole {
        self.role
    }

    pub fn from_cache(&self) -> bool {
        self.from_cache
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    #[error("filesystem {0} is not leased, it was already released")]
    AlreadyReleased(FilesystemId),
}

/// Creates and destroys bootable root filesystems
#[async_trait]
pub trait FilesystemProvisioner: Send + Sync {
    async fn create(&self, role: VmRole) -> Result<FilesystemId>;

    /// Must succeed for a filesystem that is already gone
    async fn remove(&self, id: FilesystemId) -> Result<()>;
}

/// Stages filesystems by copying `rootfs-<role>.ext4` from a base directory
pub struct ImageCopyProvisioner {
    base_images_dir: PathBuf,
    filesystems_dir: PathBuf,
}

impl ImageCopyProvisioner {
    pub fn build(base_images_dir: impl AsRef<Path>, filesystems_dir: impl AsRef<Path>) -> Result<Self> {
        let filesystems_dir = filesystems_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&filesystems_dir).with_context(|| {
            format!("Failed to create filesystems dir at {}", filesystems_dir.display())
        })?;

        Ok(Self {
            base_images_dir: base_images_dir.as_ref().to_path_buf(),
            filesystems_dir,
        })
    }

    pub fn image_path(&self, id: FilesystemId) -> PathBuf {
        self.filesystems_dir.join(format!("{id}.ext4"))
    }
}

#[async_trait]
impl FilesystemProvisioner for ImageCopyProvisioner {
    async fn create(&self, role: VmRole) -> Result<FilesystemId> {
        let started = Instant::now();
        let id = FilesystemId(Uuid::new_v4());
        let base = self.base_images_dir.join(format!("rootfs-{role}.ext4"));

        let path = self.image_path(id);
        if let Err(e) = tokio::fs::copy(&base, &path).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e)
                .with_context(|| format!("Failed to copy base image {}", base.display()));
        }

        log::debug!(
            "Filesystem creation completed for {role}: id={id}, elapsed={}ms",
            started.elapsed().as_millis()
        );
        Ok(id)
    }

    async fn remove(&self, id: FilesystemId) -> Result<()> {
        match tokio::fs::remove_file(self.image_path(id)).await {
            Ok(()) => {
                log::debug!("Removed filesystem {id}");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("Filesystem {id} already removed or does not exist");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to remove filesystem {id}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheTarget {
    min: usize,
    current: usize,
    max: usize,
}

#[derive(Debug, Clone, Copy)]
struct RequestRecord {
    at: Instant,
    cached: bool,
}

#[derive(Default)]
struct PoolState {
    ready: HashMap<VmRole, VecDeque<FilesystemId>>,
    outstanding: HashMap<FilesystemId, VmRole>,
    targets: HashMap<VmRole, CacheTarget>,
    history: HashMap<VmRole, VecDeque<RequestRecord>>,
    acquired: u64,
    released: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolerStats {
    pub acquired: u64,
    pub released: u64,
    pub outstanding: usize,
    pub ready: HashMap<VmRole, usize>,
    pub targets: HashMap<VmRole, usize>,
}

/// Keeps a stock of staged filesystems per role so VM boot skips the copy
pub struct FilesystemPooler {
    provisioner: Arc<dyn FilesystemProvisioner>,
    state: Mutex<PoolState>,
    lease_slots: Semaphore,
    tracking_period: Duration,
    polling_frequency: Duration,
}

impl FilesystemPooler {
    pub fn new(provisioner: Arc<dyn FilesystemProvisioner>, config: &ExecutorConfig) -> Self {
        let mut state = PoolState::default();
        for role in VmRole::ALL {
            let min = config.cache_target(role);
            state.targets.insert(
                role,
                CacheTarget {
                    min,
                    current: min,
                    max: config.pool.max_filesystem_cache_target.max(min),
                },
            );
            state.ready.insert(role, VecDeque::new());
            state.history.insert(role, VecDeque::new());
        }

        Self {
            provisioner,
            state: Mutex::new(state),
            lease_slots: Semaphore::new(config.pool.max_outstanding_leases.max(1)),
            tracking_period: config.pool.tracking_period.as_duration(),
            polling_frequency: config.pool.polling_frequency.as_duration(),
        }
    }

    /// Leases a staged filesystem, provisioning one inline when the stock is empty.
    /// Waits while the outstanding-lease ceiling is reached.
    pub async fn acquire(&self, role: VmRole) -> Result<FilesystemLease> {
        let permit = self
            .lease_slots
            .acquire()
            .await
            .context("Filesystem pooler is shut down")?;

        let started = Instant::now();
        let staged = self
            .state
            .lock()
            .ready
            .get_mut(&role)
            .and_then(|queue| queue.pop_front());

        let (id, from_cache) = match staged {
            Some(id) => (id, true),
            None => {
                log::debug!("Cache miss for {role}, creating new filesystem on-demand");
                (self.create_detached(role).await?, false)
            }
        };

        // released again in `release`
        permit.forget();

        {
            let mut state = self.state.lock();
            state.outstanding.insert(id, role);
            state.acquired += 1;
            if let Some(history) = state.history.get_mut(&role) {
                history.push_back(RequestRecord {
                    at: started,
                    cached: from_cache,
                });
            }
        }

        log::info!(
            "Filesystem request fulfilled for {role}: id={id}, cached={from_cache}, elapsed={}ms",
            started.elapsed().as_millis()
        );

        Ok(FilesystemLease {
            id,
            role,
            from_cache,
        })
    }

    /// Provisions in a task of its own. A filesystem that finishes after its
    /// requester gave up is removed rather than left on disk untracked.
    async fn create_detached(&self, role: VmRole) -> Result<FilesystemId> {
        let (tx, rx) = oneshot::channel();
        let provisioner = self.provisioner.clone();
        tokio::spawn(async move {
            let created = provisioner.create(role).await;
            if let Err(Ok(id)) = tx.send(created) {
                log::debug!("Filesystem {id} is no longer wanted, removing it");
                if let Err(e) = provisioner.remove(id).await {
                    log::warn!("Failed to remove abandoned filesystem {id}: {e:#}");
                }
            }
        });
        rx.await.context("Filesystem provisioning task failed")?
    }

    /// Returns a lease and destroys its filesystem. A lease can be released once.
    pub async fn release(&self, lease: &FilesystemLease) -> Result<(), LeaseError> {
        {
            let mut state = self.state.lock();
            if state.outstanding.remove(&lease.id).is_none() {
                log::warn!("Double release of filesystem {}", lease.id);
                return Err(LeaseError::AlreadyReleased(lease.id));
            }
            state.released += 1;
        }
        self.lease_slots.add_permits(1);

        if let Err(e) = self.provisioner.remove(lease.id).await {
            log::warn!("Failed to remove filesystem {}: {e:#}", lease.id);
        }
        Ok(())
    }

    /// Recomputes cache targets and tops every role's stock up to its target
    pub async fn maintain(&self) -> Result<()> {
        let mut deficits = Vec::new();
        {
            let mut state = self.state.lock();
            for role in VmRole::ALL {
                let target = self.recalculate_target(&mut state, role);
                let stocked = state.ready.get(&role).map_or(0, VecDeque::len);
                if target > stocked {
                    deficits.push((role, target - stocked));
                }
            }
        }

        let mut creations = JoinSet::new();
        for (role, deficit) in deficits {
            log::debug!("Replenishing {deficit} {role} filesystem(s)");
            for _ in 0..deficit {
                let provisioner = self.provisioner.clone();
                creations.spawn(async move { (role, provisioner.create(role).await) });
            }
        }

        let mut failures = 0;
        while let Some(joined) = creations.join_next().await {
            match joined {
                Ok((role, Ok(id))) => {
                    self.state
                        .lock()
                        .ready
                        .entry(role)
                        .or_default()
                        .push_back(id);
                }
                Ok((role, Err(e))) => {
                    failures += 1;
                    log::error!("Failed to create cached filesystem for {role}: {e:#}");
                }
                Err(e) => {
                    failures += 1;
                    log::error!("Filesystem creation task failed: {e}");
                }
            }
        }

        if failures > 0 {
            anyhow::bail!("{failures} filesystem(s) could not be staged");
        }
        Ok(())
    }

    fn recalculate_target(&self, state: &mut PoolState, role: VmRole) -> usize {
        let Some(target) = state.targets.get(&role).copied() else {
            return 0;
        };
        let Some(history) = state.history.get_mut(&role) else {
            return target.current;
        };

        if let Some(cutoff) = Instant::now().checked_sub(self.tracking_period) {
            let before = history.len();
            while history.front().is_some_and(|r| r.at < cutoff) {
                history.pop_front();
            }
            if before != history.len() {
                log::debug!(
                    "Pruned {} expired request records for {role}",
                    before - history.len()
                );
            }
        }

        if history.is_empty() {
            return target.current;
        }

        let minutes = (self.tracking_period.as_secs_f64() / 60.0).max(f64::EPSILON);
        let requests_per_minute = history.len() as f64 / minutes;
        let hit_ratio = history.iter().filter(|r| r.cached).count() as f64 / history.len() as f64;
        let wanted = (requests_per_minute * safety_buffer(hit_ratio)).ceil() as usize;
        let current = wanted.clamp(target.min, target.max);

        if let Some(t) = state.targets.get_mut(&role) {
            t.current = current;
        }
        current
    }

    /// Background maintenance loop, stopped by `token`
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        log::info!(
            "Cache maintenance daemon started with polling frequency of {}ms",
            self.polling_frequency.as_millis()
        );
        let mut ticker = tokio::time::interval(self.polling_frequency);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    log::info!("Cache maintenance daemon received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    log::debug!("Running scheduled cache maintenance");
                    if let Err(e) = self.maintain().await {
                        log::error!("Error during cache maintenance cycle: {e:#}");
                    }
                }
            }
        }

        log::info!("Cache maintenance daemon stopped");
    }

    pub fn stats(&self) -> PoolerStats {
        let state = self.state.lock();
        PoolerStats {
            acquired: state.acquired,
            released: state.released,
            outstanding: state.outstanding.len(),
            ready: state.ready.iter().map(|(r, q)| (*r, q.len())).collect(),
            targets: state.targets.iter().map(|(r, t)| (*r, t.current)).collect(),
        }
    }

    /// Stops handing out leases and deletes the staged stock
    pub async fn shutdown(&self) {
        self.lease_slots.close();
        let staged: Vec<FilesystemId> = {
            let mut state = self.state.lock();
            state.ready.values_mut().flat_map(|q| q.drain(..)).collect()
        };
        for id in staged {
            if let Err(e) = self.provisioner.remove(id).await {
                log::warn!("Failed to remove staged filesystem {id}: {e:#}");
            }
        }
        log::info!("FilesystemPooler disposal completed");
    }
}

/// Headroom multiplier: a low cache hit ratio means demand outruns the stock
fn safety_buffer(hit_ratio: f64) -> f64 {
    (1.5 / (hit_ratio * 1.1).max(0.8)).clamp(1.2, 2.0)
}
