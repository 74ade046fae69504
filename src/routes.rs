use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, Responder, get, post, web};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::compile::CompilationStats;
use crate::config::ServerConfig;
use crate::create_timestamp;
use crate::error::JobError;
use crate::pipeline::{JobPipeline, JobReport};
use crate::protocol::{
    CompilationPayload, ExecutionPayload, JobId, JobResponseMessage, SourceFiles, VmPayload,
};
use crate::vm::{ClusterSnapshot, FilesystemPooler, PoolerStats};

/// Error body of every failed HTTP request
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorResponse {
    pub trace_id: String,
    pub status_code: u16,
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(err: &JobError, details: Option<String>, production: bool) -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            status_code: err.status_code(),
            error: err.error_code().to_string(),
            message: err.user_message(),
            details: if production { None } else { details },
            timestamp: create_timestamp(),
        }
    }

    fn into_response(self) -> HttpResponse {
        let status =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        HttpResponse::build(status).json(self)
    }
}

fn is_production(req: &HttpRequest) -> bool {
    req.app_data::<web::Data<ServerConfig>>()
        .is_none_or(|config| config.production)
}

pub fn json_error_handler(err: JsonPayloadError, req: &HttpRequest) -> actix_web::Error {
    let job_error = JobError::invalid_argument("Request body is not a valid job payload");
    let response = ErrorResponse::new(&job_error, Some(err.to_string()), is_production(req))
        .into_response();
    InternalError::from_response(err, response).into()
}

fn respond(job_id: JobId, report: JobReport, production: bool) -> HttpResponse {
    match report.result {
        Ok(result) => {
            HttpResponse::Ok().json(JobResponseMessage::terminal(job_id, report.vm_id, Ok(result)))
        }
        Err(err) => {
            if err.is_fault() {
                log::error!("Job {job_id} failed: {err}");
            }
            ErrorResponse::new(&err, Some(err.message.clone()), production).into_response()
        }
    }
}

/// Runs `payload` to completion; a client that disconnects cancels the job
async fn run_sync(
    pipeline: &JobPipeline,
    shutdown: &CancellationToken,
    payload: VmPayload,
) -> (JobId, JobReport) {
    let job_id = Uuid::new_v4();
    let ct = shutdown.child_token();
    let _cancel_on_drop = ct.clone().drop_guard();
    log::info!("Job {job_id} ({:?}) received over HTTP", payload.kind());
    let report = pipeline.execute(job_id, payload, None, &ct).await;
    (job_id, report)
}

#[post("/execute")]
pub async fn execute_handler(
    pipeline: web::Data<JobPipeline>,
    shutdown: web::Data<CancellationToken>,
    config: web::Data<ServerConfig>,
    body: web::Json<ExecutionPayload>,
) -> impl Responder {
    let payload = VmPayload::Execution(body.into_inner());
    let (job_id, report) = run_sync(&pipeline, &shutdown, payload).await;
    respond(job_id, report, config.production)
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct CompileRequest {
    pub src_files: SourceFiles,
}

#[post("/compile")]
pub async fn compile_handler(
    pipeline: web::Data<JobPipeline>,
    shutdown: web::Data<CancellationToken>,
    config: web::Data<ServerConfig>,
    body: web::Json<CompileRequest>,
) -> impl Responder {
    let job_id = Uuid::new_v4();
    let payload = VmPayload::Compilation(CompilationPayload {
        job_id,
        src_files: body.into_inner().src_files,
    });
    let (_, report) = run_sync(&pipeline, &shutdown, payload).await;
    respond(job_id, report, config.production)
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct StatusResponse {
    pub cluster: ClusterSnapshot,
    pub filesystems: PoolerStats,
    pub compilation: CompilationStats,
    pub vm_launches: u64,
    pub timestamp: String,
}

#[get("/status")]
pub async fn status_handler(
    pipeline: web::Data<JobPipeline>,
    pooler: web::Data<FilesystemPooler>,
) -> impl Responder {
    HttpResponse::Ok().json(StatusResponse {
        cluster: pipeline.manager().snapshot(),
        filesystems: pooler.stats(),
        compilation: pipeline.compiler().stats(),
        vm_launches: pipeline.manager().launch_count(),
        timestamp: create_timestamp(),
    })
}
