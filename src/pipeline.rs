use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::compile::CompilationHandler;
use crate::config::ExecutorConfig;
use crate::error::JobError;
use crate::protocol::{
    ExecutionPayload, ExecutionResponse, JobId, JobResult, JobStatus, VmPayload,
};
use crate::vm::{VmId, VmLaunchManager, VmOutcome, VmRole};

/// What running one job produced, before it is framed as a response
#[derive(Debug)]
pub struct JobReport {
    pub vm_id: Option<VmId>,
    pub result: Result<JobResult, JobError>,
}

impl JobReport {
    fn new(vm_id: Option<VmId>, result: Result<JobResult, JobError>) -> Self {
        Self { vm_id, result }
    }
}

/// Drives a payload through compilation and execution.
/// Shared by the queue workers and the HTTP surface.
pub struct JobPipeline {
    config: Arc<ExecutorConfig>,
    manager: Arc<VmLaunchManager>,
    compiler: Arc<CompilationHandler>,
}

impl JobPipeline {
    pub fn new(
        config: Arc<ExecutorConfig>,
        manager: Arc<VmLaunchManager>,
        compiler: Arc<CompilationHandler>,
    ) -> Self {
        Self {
            config,
            manager,
            compiler,
        }
    }

    pub fn manager(&self) -> &Arc<VmLaunchManager> {
        &self.manager
    }

    pub fn compiler(&self) -> &Arc<CompilationHandler> {
        &self.compiler
    }

    pub async fn execute(
        &self,
        job_id: JobId,
        payload: VmPayload,
        progress: Option<&UnboundedSender<JobStatus>>,
        ct: &CancellationToken,
    ) -> JobReport {
        let report_progress = |status: JobStatus| {
            if let Some(tx) = progress {
                let _ = tx.send(status);
            }
        };

        match payload {
            VmPayload::Compilation(p) => {
                report_progress(JobStatus::Compiling);
                match self.compiler.compile(job_id, &p.src_files, ct).await {
                    Ok(outcome) => JobReport::new(
                        outcome.vm_id,
                        Ok(JobResult::Compiled {
                            body: outcome.artifact.files.clone(),
                        }),
                    ),
                    Err(e) => JobReport::new(None, Err(e)),
                }
            }
            VmPayload::Execution(p) => self.run_program(job_id, p, &report_progress, ct).await,
            VmPayload::HealthCheck(p) => {
                match self.compiler.health_check(job_id, p.files_to_check, ct).await {
                    Ok((resp, vm_id)) => {
                        JobReport::new(Some(vm_id), Ok(JobResult::HealthCheck(resp)))
                    }
                    Err(e) => JobReport::new(None, Err(e)),
                }
            }
        }
    }

    /// Compiles the client sources while an executor VM is being acquired,
    /// then runs the entrypoint against the artifact
    async fn run_program(
        &self,
        job_id: JobId,
        payload: ExecutionPayload,
        report_progress: &impl Fn(JobStatus),
        ct: &CancellationToken,
    ) -> JobReport {
        if payload.entrypoint.trim().is_empty() {
            return JobReport::new(None, Err(JobError::invalid_argument("Entrypoint is empty")));
        }
        if let Err(e) = self.compiler.validate(&payload.client_src) {
            return JobReport::new(None, Err(e));
        }

        report_progress(JobStatus::Compiling);
        let vm_ct = ct.child_token();
        let compile = async {
            let compiled = self.compiler.compile(job_id, &payload.client_src, ct).await;
            if compiled.is_err() {
                // nothing left to run, stop waiting for a VM
                vm_ct.cancel();
            }
            compiled
        };
        let reservation = self.config.reservation(VmRole::Executor);
        let (compiled, vm) = tokio::join!(
            compile,
            self.manager.request_vm(VmRole::Executor, reservation, &vm_ct)
        );

        let (artifact, mut vm) = match (compiled, vm) {
            (Ok(outcome), Ok(vm)) => (outcome.artifact, vm),
            (Err(e), Ok(vm)) => {
                self.manager.release_vm(vm, VmOutcome::Clean).await;
                return JobReport::new(None, Err(e));
            }
            (Err(e), Err(_)) | (Ok(_), Err(e)) => return JobReport::new(None, Err(e)),
        };

        report_progress(JobStatus::Executing);
        let vm_id = vm.id();
        log::info!("Executing job {job_id} on VM {vm_id}");

        let exec = VmPayload::Execution(ExecutionPayload {
            entrypoint: payload.entrypoint,
            client_src: artifact.files.clone(),
        });
        let result = self
            .manager
            .run_job::<ExecutionResponse>(&mut vm, job_id, &exec, ct)
            .await;
        self.manager.release_vm(vm, VmOutcome::of(&result)).await;

        JobReport::new(Some(vm_id), result.map(JobResult::Execution))
    }
}
