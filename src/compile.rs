use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorConfig;
use crate::error::JobError;
use crate::protocol::{
    CompilationPayload, CompilationResponse, HealthCheckPayload, HealthCheckResponse, JobId,
    SourceFiles, VmPayload,
};
use crate::vm::{TerminationReason, VmId, VmLaunchManager, VmOutcome, VmRole};

/// Output of one successful compilation, shared by every job with the same sources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub source_hash: String,
    pub files: SourceFiles,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CompileOutcome {
    pub artifact: Arc<CompiledArtifact>,
    /// Compiler VM that produced the artifact, `None` on a cache hit
    pub vm_id: Option<VmId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompilationStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub compiler_acquisitions: u64,
    pub cached_artifacts: usize,
}

/// SHA-256 over the length-prefixed, path-sorted files
pub fn source_hash(files: &SourceFiles) -> String {
    let mut hasher = Sha256::new();
    for (path, content) in files {
        hasher.update((path.len() as u64).to_le_bytes());
        hasher.update(path.as_bytes());
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(content.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

type ArtifactCache = Cache<String, Arc<CompiledArtifact>>;

fn artifact_cache(capacity: usize, max_age: Duration) -> ArtifactCache {
    Cache::builder()
        .max_capacity(capacity as u64)
        .time_to_live(max_age)
        .build()
}

/// Compiles source bundles on compiler VMs behind a content-addressed cache
pub struct CompilationHandler {
    config: Arc<ExecutorConfig>,
    manager: Arc<VmLaunchManager>,
    cache: ArtifactCache,
    hits: AtomicU64,
    misses: AtomicU64,
    acquisitions: AtomicU64,
}

impl CompilationHandler {
    pub fn new(config: Arc<ExecutorConfig>, manager: Arc<VmLaunchManager>) -> Self {
        let cache = artifact_cache(
            config.compilation.artifact_cache_capacity,
            config.compilation.artifact_max_age.as_duration(),
        );
        Self {
            config,
            manager,
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            acquisitions: AtomicU64::new(0),
        }
    }

    /// Boots the configured number of idle compiler VMs
    pub async fn warm_up(&self) -> usize {
        let target = self.config.pool.default_compiler_cache_target;
        log::info!("Pre-warming {target} compiler VM(s)");
        self.manager.warm_up(VmRole::Compiler, target).await
    }

    pub fn validate(&self, files: &SourceFiles) -> Result<(), JobError> {
        if files.is_empty() {
            return Err(JobError::invalid_argument("No source files were provided"));
        }
        let max = self.config.limits.max_file_count;
        if files.len() > max {
            return Err(JobError::invalid_argument(format!(
                "Too many source files: {} (maximum {max})",
                files.len()
            )));
        }
        if let Some(path) = files.keys().find(|p| !is_relative_path(p)) {
            return Err(JobError::invalid_argument(format!(
                "Invalid source file path: {path:?}"
            )));
        }
        Ok(())
    }

    pub async fn compile(
        &self,
        job_id: JobId,
        files: &SourceFiles,
        ct: &CancellationToken,
    ) -> Result<CompileOutcome, JobError> {
        self.validate(files)?;

        let hash = source_hash(files);
        if let Some(artifact) = self.cache.get(&hash) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("Job {job_id} compilation served from cache ({hash})");
            return Ok(CompileOutcome {
                artifact,
                vm_id: None,
            });
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let reservation = self.config.reservation(VmRole::Compiler);
        let mut vm = self
            .manager
            .request_vm(VmRole::Compiler, reservation, ct)
            .await?;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        let vm_id = vm.id();
        log::info!("Compiling job {job_id} on VM {vm_id}");

        let payload = VmPayload::Compilation(CompilationPayload {
            job_id,
            src_files: files.clone(),
        });
        let result = self
            .manager
            .run_job::<CompilationResponse>(&mut vm, job_id, &payload, ct)
            .await;
        self.manager.release_vm(vm, VmOutcome::of(&result)).await;

        match result? {
            CompilationResponse::Success { body } => {
                let artifact = Arc::new(CompiledArtifact {
                    source_hash: hash.clone(),
                    files: body,
                    created_at: Utc::now(),
                });
                self.cache.insert(hash, artifact.clone());
                Ok(CompileOutcome {
                    artifact,
                    vm_id: Some(vm_id),
                })
            }
            CompilationResponse::Failure { body } => {
                log::info!("Job {job_id} failed to compile");
                Err(JobError::compilation(body))
            }
        }
    }

    /// Hashes toolchain files on a compiler VM; a VM whose digests differ
    /// from the expected ones is retired
    pub async fn health_check(
        &self,
        job_id: JobId,
        files_to_check: Vec<String>,
        ct: &CancellationToken,
    ) -> Result<(HealthCheckResponse, VmId), JobError> {
        let files_to_check = if files_to_check.is_empty() {
            self.config.health_check.files_to_check.clone()
        } else {
            files_to_check
        };

        let reservation = self.config.reservation(VmRole::Compiler);
        let mut vm = self
            .manager
            .request_vm(VmRole::Compiler, reservation, ct)
            .await?;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        let vm_id = vm.id();

        let payload = VmPayload::HealthCheck(HealthCheckPayload { files_to_check });
        let result = self
            .manager
            .run_job::<HealthCheckResponse>(&mut vm, job_id, &payload, ct)
            .await;

        let outcome = match &result {
            Ok(resp) => {
                let configured = &self.config.health_check.expected_hashes;
                let expected = if configured.is_empty() {
                    self.manager.baseline_hashes(vm_id)
                } else {
                    configured.clone()
                };
                let mismatched = resp.mismatches(&expected);
                if mismatched.is_empty() {
                    VmOutcome::Clean
                } else {
                    log::warn!("Compiler VM {vm_id} failed health check on {mismatched:?}");
                    VmOutcome::Teardown(TerminationReason::HealthCheckFailed)
                }
            }
            Err(_) => VmOutcome::of(&result),
        };
        self.manager.release_vm(vm, outcome).await;

        result.map(|resp| (resp, vm_id))
    }

    pub fn stats(&self) -> CompilationStats {
        CompilationStats {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            compiler_acquisitions: self.acquisitions.load(Ordering::Relaxed),
            cached_artifacts: self.cache.entry_count() as usize,
        }
    }
}

fn is_relative_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.split(['/', '\\']).any(|part| part == "..")
}
