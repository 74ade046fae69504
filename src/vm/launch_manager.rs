use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, broadcast, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorConfig;
use crate::error::{JobError, Phase};
use crate::protocol::{HealthCheckPayload, HealthCheckResponse, JobId, VmPayload};

use super::{
    ChannelError, ClusterBudget, FilesystemLease, FilesystemPooler, LaunchSpec, Reservation,
    TerminationReason, VmBackend, VmId, VmInstance, VmRole, VmState, VmTerminationEvent,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const FIRST_GUEST_CID: u32 = 3;

struct VmRecord {
    id: VmId,
    role: VmRole,
    reservation: Reservation,
    state: VmState,
    lease: Option<FilesystemLease>,
    instance: Option<VmInstance>,
    launched_at: Instant,
    last_used_at: Instant,
    last_health_check_at: Option<Instant>,
    serviced_jobs: Vec<JobId>,
    baseline_hashes: BTreeMap<String, String>,
    teardown_started: bool,
}

impl VmRecord {
    fn is_available(&self) -> bool {
        self.state == VmState::Idle && !self.teardown_started
    }
}

/// Budget and VM table share one lock so admission and state transitions
/// are observed in a single order
struct PoolState {
    budget: ClusterBudget,
    vms: HashMap<VmId, VmRecord>,
    shutting_down: bool,
}

enum Admission {
    Reused(VmId),
    Admitted(VmId),
    Denied { evicted: Option<VmId> },
    ShuttingDown,
}

/// Exclusive claim on a `Busy` VM.
///
/// Give it back with `VmLaunchManager::release_vm`. A handle dropped without
/// being released tears its VM down as orphaned.
#[derive(Debug)]
pub struct VmHandle {
    id: VmId,
    role: VmRole,
    manager: Weak<VmLaunchManager>,
    armed: bool,
}

impl VmHandle {
    pub fn id(&self) -> VmId {
        self.id
    }

    pub fn role(&self) -> VmRole {
        self.role
    }
}

impl Drop for VmHandle {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                log::warn!("VM {id} handle dropped while busy, tearing it down");
                runtime.spawn(async move {
                    manager.teardown(id, TerminationReason::Orphaned).await;
                });
            }
            Err(_) => log::error!("VM {id} orphaned outside of a runtime, it leaks until shutdown"),
        }
    }
}

/// How a job left the VM it ran on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmOutcome {
    Clean,
    Teardown(TerminationReason),
}

impl VmOutcome {
    pub fn of<T>(result: &Result<T, JobError>) -> Self {
        match result {
            Ok(_) => Self::Clean,
            Err(e) => e.teardown_reason().map_or(Self::Clean, Self::Teardown),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VmSnapshot {
    pub vm_id: VmId,
    pub role: VmRole,
    pub state: VmState,
    pub reservation: Reservation,
    pub age_ms: u64,
    pub serviced_jobs: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterSnapshot {
    pub committed: Reservation,
    pub vcpu_capacity: u32,
    pub memory_capacity_mb: u32,
    pub vms: Vec<VmSnapshot>,
}

/// Sole owner of the VM pool and the cluster budget
pub struct VmLaunchManager {
    config: Arc<ExecutorConfig>,
    backend: Arc<dyn VmBackend>,
    pooler: Arc<FilesystemPooler>,
    pool: Mutex<PoolState>,
    capacity_freed: Notify,
    events: broadcast::Sender<VmTerminationEvent>,
    next_guest_cid: AtomicU32,
    launches: AtomicU64,
}

impl VmLaunchManager {
    pub fn new(
        config: Arc<ExecutorConfig>,
        backend: Arc<dyn VmBackend>,
        pooler: Arc<FilesystemPooler>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            pool: Mutex::new(PoolState {
                budget: ClusterBudget::new(config.cluster.clone()),
                vms: HashMap::new(),
                shutting_down: false,
            }),
            config,
            backend,
            pooler,
            capacity_freed: Notify::new(),
            events,
            next_guest_cid: AtomicU32::new(FIRST_GUEST_CID),
            launches: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Hands out a `Busy` VM of `role`, reusing an idle one when possible.
    ///
    /// Waits at most `resource_request_timeout` for budget and fails with
    /// `SERVICE_OVERLOADED` without committing anything when none frees up.
    pub async fn request_vm(
        self: &Arc<Self>,
        role: VmRole,
        reservation: Reservation,
        ct: &CancellationToken,
    ) -> Result<VmHandle, JobError> {
        if ct.is_cancelled() {
            return Err(JobError::cancelled());
        }

        let wait_limit = self.config.timeouts.resource_request_timeout.as_duration();
        let deadline = tokio::time::Instant::now() + wait_limit;

        let vm_id = loop {
            let notified = self.capacity_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_admit(role, reservation, true) {
                Admission::Reused(id) => {
                    log::debug!("Reusing idle {role} VM {id}");
                    return Ok(self.handle(id, role));
                }
                Admission::Admitted(id) => break id,
                Admission::ShuttingDown => {
                    return Err(JobError::overloaded("VM pool is shutting down"));
                }
                Admission::Denied { evicted } => {
                    if let Some(victim) = evicted {
                        log::info!("Evicting idle VM {victim} to make room for a {role} VM");
                        self.spawn_teardown(victim, TerminationReason::ClusterPressure);
                    }
                }
            }

            tokio::select! {
                _ = ct.cancelled() => return Err(JobError::cancelled()),
                _ = tokio::time::sleep_until(deadline) => {
                    log::warn!("Resource exhaustion prevented {role} VM spawn");
                    return Err(JobError::overloaded(format!(
                        "Insufficient resources to spawn {role} VM"
                    )));
                }
                _ = &mut notified => {}
            }
        };

        // Provisioning runs detached: a caller that goes away mid-boot must
        // not strand a half-built VM holding budget and a lease.
        let (tx, rx) = oneshot::channel();
        let manager = self.clone();
        tokio::spawn(async move {
            let result = manager
                .provision(vm_id, role, reservation, VmState::Busy)
                .await
                .map(|()| manager.handle(vm_id, role));
            // an unclaimed handle is dropped here and orphans its VM
            let _ = tx.send(result);
        });

        tokio::select! {
            _ = ct.cancelled() => Err(JobError::cancelled()),
            res = rx => res.unwrap_or_else(|_| Err(JobError::internal("VM provisioning task vanished"))),
        }
    }

    /// Admission control, the only place the budget grows
    fn try_admit(&self, role: VmRole, reservation: Reservation, allow_reuse: bool) -> Admission {
        let mut pool = self.pool.lock();
        if pool.shutting_down {
            return Admission::ShuttingDown;
        }

        if allow_reuse {
            let reusable = pool
                .vms
                .values_mut()
                .filter(|r| r.role == role && r.reservation == reservation && r.is_available())
                .max_by_key(|r| r.last_used_at);
            if let Some(record) = reusable {
                record.state = VmState::Busy;
                record.last_used_at = Instant::now();
                return Admission::Reused(record.id);
            }
        }

        if pool.budget.try_commit(reservation) {
            let id = VmId::new();
            let now = Instant::now();
            pool.vms.insert(
                id,
                VmRecord {
                    id,
                    role,
                    reservation,
                    state: VmState::Provisioning,
                    lease: None,
                    instance: None,
                    launched_at: now,
                    last_used_at: now,
                    last_health_check_at: None,
                    serviced_jobs: Vec::new(),
                    baseline_hashes: BTreeMap::new(),
                    teardown_started: false,
                },
            );
            return Admission::Admitted(id);
        }

        if !allow_reuse {
            return Admission::Denied { evicted: None };
        }

        // an idle VM whose budget would let this request in is retired
        let PoolState { budget, vms, .. } = &mut *pool;
        let victim = vms
            .values_mut()
            .filter(|r| r.is_available())
            .filter(|r| {
                let mut after = budget.clone();
                after.release(r.reservation);
                after.fits(reservation)
            })
            .min_by_key(|r| r.last_used_at);
        let evicted = victim.map(|record| {
            record.state = VmState::Terminating;
            record.id
        });
        Admission::Denied { evicted }
    }

    fn handle(self: &Arc<Self>, id: VmId, role: VmRole) -> VmHandle {
        VmHandle {
            id,
            role,
            manager: Arc::downgrade(self),
            armed: true,
        }
    }

    /// Leases a filesystem, boots the VM and moves it to `ready_state`.
    /// Any failure tears the half-built VM down with `Reason = Error`.
    async fn provision(
        self: &Arc<Self>,
        id: VmId,
        role: VmRole,
        reservation: Reservation,
        ready_state: VmState,
    ) -> Result<(), JobError> {
        let launch_timeout = self.config.timeouts.vm_launch_timeout.as_duration();
        let started = Instant::now();
        log::debug!("Dispatching {role} VM {id}");

        let lease = match tokio::time::timeout(launch_timeout, self.pooler.acquire(role)).await {
            Ok(Ok(lease)) => lease,
            Ok(Err(e)) => {
                self.teardown(id, TerminationReason::Error).await;
                return Err(JobError::internal(format!("No filesystem for VM {id}: {e:#}")));
            }
            Err(_) => {
                self.teardown(id, TerminationReason::Error).await;
                return Err(JobError::timeout(Phase::VmLaunch, launch_timeout));
            }
        };

        let filesystem = lease.id();
        if !self.attach(id, |record| record.lease = Some(lease.clone())) {
            if let Err(e) = self.pooler.release(&lease).await {
                log::error!("Failed to return lease of abandoned VM {id}: {e}");
            }
            return Err(JobError::cancelled());
        }

        let spec = LaunchSpec {
            vm_id: id,
            role,
            reservation,
            filesystem,
            guest_cid: self.next_guest_cid.fetch_add(1, Ordering::Relaxed),
            user_memory_mb: (role == VmRole::Executor)
                .then_some(self.config.limits.max_user_memory_mb),
        };
        let remaining = launch_timeout.saturating_sub(started.elapsed());
        let instance = match tokio::time::timeout(remaining, self.backend.launch(&spec)).await {
            Ok(Ok(instance)) => instance,
            Ok(Err(e)) => {
                log::error!("VM {id} launch failed: {e:#}");
                self.teardown(id, TerminationReason::Error).await;
                return Err(JobError::internal(format!("VM launch failed: {e:#}")));
            }
            Err(_) => {
                log::error!("VM {id} launch timed out after {}ms", launch_timeout.as_millis());
                self.teardown(id, TerminationReason::Error).await;
                return Err(JobError::timeout(Phase::VmLaunch, launch_timeout));
            }
        };

        if !self.attach(id, |record| record.instance = Some(instance.clone())) {
            if let Err(e) = self.backend.terminate(&instance).await {
                log::warn!("Failed to kill abandoned VM {id}: {e:#}");
            }
            return Err(JobError::cancelled());
        }
        self.launches.fetch_add(1, Ordering::Relaxed);
        log::info!("VM {id} launched in {}ms", started.elapsed().as_millis());

        if role == VmRole::Compiler && !self.config.health_check.files_to_check.is_empty() {
            log::debug!("Extracting file hashes for compiler VM {id}");
            let hashes = match self.query_health(&instance).await {
                Ok(resp) => resp.file_hashes,
                Err(e) => {
                    log::error!("Compiler VM {id} failed its launch health check: {e}");
                    self.teardown(id, TerminationReason::HealthCheckFailed).await;
                    return Err(e);
                }
            };
            let expected = &self.config.health_check.expected_hashes;
            let mismatched = HealthCheckResponse {
                file_hashes: hashes.clone(),
            }
            .mismatches(expected);
            if !mismatched.is_empty() {
                log::error!("Compiler VM {id} toolchain differs from expected: {mismatched:?}");
                self.teardown(id, TerminationReason::HealthCheckFailed).await;
                return Err(JobError::internal("Compiler VM failed toolchain verification"));
            }
            log::debug!("Compiler VM {id} ready with {} file hashes", hashes.len());
            self.attach(id, |record| {
                record.baseline_hashes = hashes;
                record.last_health_check_at = Some(Instant::now());
            });
        }

        let ready = self.attach(id, |record| {
            record.state = ready_state;
            record.last_used_at = Instant::now();
        });
        if ready {
            if ready_state == VmState::Idle {
                self.capacity_freed.notify_waiters();
            }
            Ok(())
        } else {
            Err(JobError::cancelled())
        }
    }

    /// Applies `f` to a VM still being built; false once its teardown began
    fn attach(&self, id: VmId, f: impl FnOnce(&mut VmRecord)) -> bool {
        let mut pool = self.pool.lock();
        match pool.vms.get_mut(&id) {
            Some(record) if !record.teardown_started => {
                f(record);
                true
            }
            _ => false,
        }
    }

    async fn query_health(&self, instance: &VmInstance) -> Result<HealthCheckResponse, JobError> {
        let payload = VmPayload::HealthCheck(HealthCheckPayload {
            files_to_check: self.config.health_check.files_to_check.clone(),
        });
        let limit = self.config.timeouts.query_timeout.as_duration();
        let body = match tokio::time::timeout(limit, self.backend.query(instance, &payload)).await {
            Err(_) => return Err(JobError::timeout(Phase::Query, limit)),
            Ok(Err(e)) => return Err(channel_error(e)),
            Ok(Ok(body)) => body,
        };
        serde_json::from_str(&body)
            .map_err(|e| JobError::output_not_found(format!("Unreadable health check reply: {e}")))
    }

    /// Runs one payload on the VM behind `handle` and parses its reply.
    ///
    /// Timeouts, channel faults, unreadable output and cancellation mark the
    /// VM `Terminating`; release it with `VmOutcome::of(&result)`.
    pub async fn run_job<R: DeserializeOwned>(
        &self,
        handle: &mut VmHandle,
        job_id: JobId,
        payload: &VmPayload,
        ct: &CancellationToken,
    ) -> Result<R, JobError> {
        let (phase, limit) = match payload {
            VmPayload::Compilation(_) => (
                Phase::Compilation,
                self.config.timeouts.compilation_timeout.as_duration(),
            ),
            VmPayload::Execution(_) => (Phase::Execution, self.config.execution_timeout()),
            VmPayload::HealthCheck(_) => {
                (Phase::Query, self.config.timeouts.query_timeout.as_duration())
            }
        };

        let instance = {
            let mut pool = self.pool.lock();
            let record = pool
                .vms
                .get_mut(&handle.id)
                .ok_or_else(|| JobError::internal(format!("VM {} not found in active VMs", handle.id)))?;
            if record.state != VmState::Busy || record.teardown_started {
                return Err(JobError::internal(format!(
                    "VM {} is {:?}, not Busy",
                    handle.id, record.state
                )));
            }
            record.serviced_jobs.push(job_id);
            record
                .instance
                .clone()
                .ok_or_else(|| JobError::internal(format!("VM {} has no instance", handle.id)))?
        };

        let started = Instant::now();
        log::debug!("Job {job_id} sent to VM {}", handle.id);

        let result = tokio::select! {
            _ = ct.cancelled() => Err(JobError::cancelled()),
            res = tokio::time::timeout(limit, self.backend.query(&instance, payload)) => match res {
                Err(_) => Err(JobError::timeout(phase, limit)),
                Ok(Err(e)) => Err(channel_error(e)),
                Ok(Ok(body)) => serde_json::from_str::<R>(&body).map_err(|e| {
                    JobError::output_not_found(format!("Unreadable output from VM {}: {e}", handle.id))
                }),
            },
        };

        let mut pool = self.pool.lock();
        if let Some(record) = pool.vms.get_mut(&handle.id) {
            match &result {
                Err(e) if e.teardown_reason().is_some() => {
                    record.state = VmState::Terminating;
                    if e.is_fault() {
                        log::error!("Job {job_id} on VM {} failed: {e}", handle.id);
                    } else {
                        log::info!("Job {job_id} on VM {} cancelled", handle.id);
                    }
                }
                _ => {
                    record.last_used_at = Instant::now();
                    log::debug!(
                        "Job {job_id} finished on VM {} in {}ms",
                        handle.id,
                        started.elapsed().as_millis()
                    );
                }
            }
        }

        result
    }

    /// Returns a VM to the idle pool or retires it according to `outcome`
    pub async fn release_vm(self: &Arc<Self>, mut handle: VmHandle, outcome: VmOutcome) {
        handle.armed = false;
        let id = handle.id;
        let role = handle.role;

        let teardown = {
            let mut pool = self.pool.lock();
            let idle_of_role = pool
                .vms
                .values()
                .filter(|r| r.role == role && r.is_available())
                .count();
            let shutting_down = pool.shutting_down;
            let Some(record) = pool.vms.get_mut(&id) else {
                log::warn!("VM {id} not found in active VMs during release");
                return;
            };
            if record.teardown_started {
                return;
            }

            match outcome {
                VmOutcome::Teardown(reason) => Some(reason),
                VmOutcome::Clean if record.state == VmState::Terminating => {
                    Some(TerminationReason::Error)
                }
                VmOutcome::Clean
                    if role == VmRole::Executor && !record.serviced_jobs.is_empty() =>
                {
                    Some(TerminationReason::JobFinished)
                }
                VmOutcome::Clean
                    if shutting_down || idle_of_role >= self.config.idle_capacity(role) =>
                {
                    Some(TerminationReason::ClusterPressure)
                }
                VmOutcome::Clean => {
                    record.state = VmState::Idle;
                    record.last_used_at = Instant::now();
                    None
                }
            }
        };

        match teardown {
            Some(reason) => {
                let task = self.spawn_teardown(id, reason);
                if let Err(e) = task.await {
                    log::error!("Teardown task for VM {id} failed: {e}");
                }
                if matches!(reason, TerminationReason::Error | TerminationReason::JobFinished) {
                    // broken and spent VMs are replaced opportunistically
                    let manager = self.clone();
                    tokio::spawn(async move { manager.replenish(role).await });
                }
            }
            None => {
                log::debug!("VM {id} returned to the idle pool");
                self.capacity_freed.notify_waiters();
            }
        }
    }

    /// Teardown must run to completion even if the caller goes away
    fn spawn_teardown(
        self: &Arc<Self>,
        id: VmId,
        reason: TerminationReason,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.teardown(id, reason).await })
    }

    /// Kills the VM, returns its lease and budget, and emits one termination event
    async fn teardown(&self, id: VmId, reason: TerminationReason) {
        let (instance, lease) = {
            let mut pool = self.pool.lock();
            let Some(record) = pool.vms.get_mut(&id) else {
                return;
            };
            if record.teardown_started {
                return;
            }
            record.teardown_started = true;
            record.state = VmState::Terminating;
            (record.instance.clone(), record.lease.clone())
        };

        log::info!("Terminating VM {id}, reason={reason:?}");

        if let Some(instance) = &instance {
            if let Err(e) = self.backend.terminate(instance).await {
                log::warn!("Error killing VM {id}: {e:#}");
            }
        }
        if let Some(lease) = &lease {
            if let Err(e) = self.pooler.release(lease).await {
                log::debug!("VM {id}: {e}");
            }
        }

        let record = {
            let mut pool = self.pool.lock();
            let record = pool.vms.remove(&id);
            if let Some(record) = &record {
                pool.budget.release(record.reservation);
            }
            record
        };
        self.capacity_freed.notify_waiters();

        if let Some(mut record) = record {
            record.state = VmState::Terminated;
            let event = VmTerminationEvent {
                vm_id: record.id,
                role: record.role,
                reason,
                terminated_at: Utc::now(),
                affected_jobs: record.serviced_jobs,
                lifetime_ms: record.launched_at.elapsed().as_millis() as u64,
            };
            // no subscribers is fine
            let _ = self.events.send(event);
        }
    }

    /// Boots up to `count` idle VMs of `role` without evicting anything.
    /// Returns how many came up.
    pub async fn warm_up(self: &Arc<Self>, role: VmRole, count: usize) -> usize {
        let reservation = self.config.reservation(role);
        let mut boots = JoinSet::new();
        for _ in 0..count {
            let Admission::Admitted(id) = self.try_admit(role, reservation, false) else {
                break;
            };
            let manager = self.clone();
            boots.spawn(async move {
                manager
                    .provision(id, role, reservation, VmState::Idle)
                    .await
            });
        }

        let mut warmed = 0;
        while let Some(joined) = boots.join_next().await {
            match joined {
                Ok(Ok(())) => warmed += 1,
                Ok(Err(e)) => log::warn!("Pre-warming a {role} VM failed: {e}"),
                Err(e) => log::error!("Pre-warm task failed: {e}"),
            }
        }
        if warmed > 0 {
            log::info!("Pre-warmed {warmed} {role} VM(s)");
        }
        warmed
    }

    /// Tops the idle pool of `role` up to its cache target
    async fn replenish(self: &Arc<Self>, role: VmRole) {
        let available = {
            let pool = self.pool.lock();
            if pool.shutting_down {
                return;
            }
            pool.vms
                .values()
                .filter(|r| r.role == role)
                .filter(|r| r.is_available() || r.state == VmState::Provisioning)
                .count()
        };
        let deficit = self.config.cache_target(role).saturating_sub(available);
        if deficit > 0 {
            self.warm_up(role, deficit).await;
        }
    }

    /// One pass of the periodic poller
    pub async fn poll_once(self: &Arc<Self>) {
        let tracking_period = self.config.pool.tracking_period.as_duration();

        let retirees: Vec<VmId> = {
            let pool = self.pool.lock();
            let mut retirees = Vec::new();
            for role in VmRole::ALL {
                let mut idle: Vec<&VmRecord> = pool
                    .vms
                    .values()
                    .filter(|r| r.role == role && r.is_available())
                    .collect();
                idle.sort_by_key(|r| r.last_used_at);
                let mut surplus = idle.len().saturating_sub(self.config.cache_target(role));
                for record in idle {
                    if surplus == 0 {
                        break;
                    }
                    if record.launched_at.elapsed() > tracking_period {
                        retirees.push(record.id);
                        surplus -= 1;
                    }
                }
            }
            retirees
        };
        for id in retirees {
            self.teardown(id, TerminationReason::IdleTimeout).await;
        }

        if !self.config.health_check.files_to_check.is_empty() {
            self.check_idle_compilers().await;
        }

        for role in VmRole::ALL {
            self.replenish(role).await;
        }
    }

    /// Re-hashes the toolchain of idle compiler VMs whose last check is stale
    async fn check_idle_compilers(self: &Arc<Self>) {
        let interval = self.config.health_check.interval.as_duration();
        let claimed: Vec<(VmId, VmInstance, BTreeMap<String, String>)> = {
            let mut pool = self.pool.lock();
            pool.vms
                .values_mut()
                .filter(|r| r.role == VmRole::Compiler && r.is_available())
                .filter(|r| r.last_health_check_at.is_none_or(|t| t.elapsed() >= interval))
                .filter_map(|r| {
                    let instance = r.instance.clone()?;
                    r.state = VmState::Busy;
                    Some((r.id, instance, r.baseline_hashes.clone()))
                })
                .collect()
        };

        for (id, instance, baseline) in claimed {
            let expected = if self.config.health_check.expected_hashes.is_empty() {
                &baseline
            } else {
                &self.config.health_check.expected_hashes
            };

            let healthy = match self.query_health(&instance).await {
                Ok(resp) => {
                    let mismatched = resp.mismatches(expected);
                    if !mismatched.is_empty() {
                        log::error!("Compiler VM {id} toolchain changed: {mismatched:?}");
                    }
                    mismatched.is_empty()
                }
                Err(e) => {
                    log::error!("Health check of compiler VM {id} failed: {e}");
                    false
                }
            };

            if healthy {
                self.attach(id, |record| {
                    record.state = VmState::Idle;
                    record.last_health_check_at = Some(Instant::now());
                });
                self.capacity_freed.notify_waiters();
            } else {
                self.teardown(id, TerminationReason::HealthCheckFailed).await;
            }
        }
    }

    /// Periodic poller, stopped by `token`
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let frequency = self.config.pool.polling_frequency.as_duration();
        log::info!(
            "VM poller started with polling frequency of {}ms",
            frequency.as_millis()
        );
        let mut ticker = tokio::time::interval(frequency);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    log::info!("VM poller received shutdown signal");
                    break;
                }
                _ = ticker.tick() => self.poll_once().await,
            }
        }
    }

    /// Tears every VM down; admission refuses new work from here on
    pub async fn shutdown(self: &Arc<Self>) {
        log::info!("Shutting down VmLaunchManager");
        let ids: Vec<VmId> = {
            let mut pool = self.pool.lock();
            pool.shutting_down = true;
            pool.vms.keys().copied().collect()
        };

        let mut teardowns = JoinSet::new();
        for id in ids {
            let manager = self.clone();
            teardowns.spawn(async move { manager.teardown(id, TerminationReason::Shutdown).await });
        }
        while teardowns.join_next().await.is_some() {}
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VmTerminationEvent> {
        self.events.subscribe()
    }

    /// Number of VMs booted so far
    pub fn launch_count(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    /// `None` once the VM is gone; `Terminated` is never re-entered
    pub fn vm_state(&self, id: VmId) -> Option<VmState> {
        self.pool.lock().vms.get(&id).map(|r| r.state)
    }

    pub fn committed(&self) -> Reservation {
        self.pool.lock().budget.committed()
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let pool = self.pool.lock();
        let mut vms: Vec<VmSnapshot> = pool
            .vms
            .values()
            .map(|r| VmSnapshot {
                vm_id: r.id,
                role: r.role,
                state: r.state,
                reservation: r.reservation,
                age_ms: r.launched_at.elapsed().as_millis() as u64,
                serviced_jobs: r.serviced_jobs.len(),
            })
            .collect();
        vms.sort_by_key(|vm| std::cmp::Reverse(vm.age_ms));

        ClusterSnapshot {
            committed: pool.budget.committed(),
            vcpu_capacity: pool.budget.vcpu_capacity(),
            memory_capacity_mb: pool.budget.memory_capacity_mb(),
            vms,
        }
    }

    /// Toolchain digests a compiler VM reported when it booted
    pub fn baseline_hashes(&self, id: VmId) -> BTreeMap<String, String> {
        self.pool
            .lock()
            .vms
            .get(&id)
            .map(|r| r.baseline_hashes.clone())
            .unwrap_or_default()
    }
}

fn channel_error(e: ChannelError) -> JobError {
    match e {
        ChannelError::NoOutput => JobError::output_not_found(e.to_string()),
        ChannelError::Broken(_) | ChannelError::Handshake(_) => JobError::channel_read(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_of_results() {
        let ok: Result<(), JobError> = Ok(());
        assert_eq!(VmOutcome::of(&ok), VmOutcome::Clean);

        let user_error: Result<(), JobError> = Err(JobError::compilation("missing ;"));
        assert_eq!(VmOutcome::of(&user_error), VmOutcome::Clean);

        let timeout: Result<(), JobError> =
            Err(JobError::timeout(Phase::Execution, Duration::from_secs(2)));
        assert_eq!(
            VmOutcome::of(&timeout),
            VmOutcome::Teardown(TerminationReason::Error)
        );
    }

    #[test]
    fn test_no_output_maps_to_execution_error() {
        assert_eq!(
            channel_error(ChannelError::NoOutput).error_code(),
            "EXECUTION_ERROR"
        );
        assert_eq!(
            channel_error(ChannelError::Handshake("ERR".into())).error_code(),
            "SERVICE_UNAVAILABLE"
        );
    }
}
