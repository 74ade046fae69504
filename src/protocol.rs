//! Wire types shared by the queues, the HTTP surface and the guest channel.
//!
//! Field names are PascalCase and polymorphic values carry a `$type`
//! discriminator so that producers written against the platform's web
//! application can talk to the engine unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::vm::VmId;

pub type JobId = Uuid;

/// Map of relative path to file content
pub type SourceFiles = BTreeMap<String, String>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "$type")]
pub enum VmPayload {
    #[serde(rename = "comp")]
    Compilation(CompilationPayload),
    #[serde(rename = "exec")]
    Execution(ExecutionPayload),
    #[serde(rename = "health")]
    HealthCheck(HealthCheckPayload),
}

impl VmPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Compilation(_) => JobKind::Compile,
            Self::Execution(_) => JobKind::Execute,
            Self::HealthCheck(_) => JobKind::HealthCheck,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct CompilationPayload {
    pub job_id: JobId,
    pub src_files: SourceFiles,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionPayload {
    pub entrypoint: String,
    #[serde(default)]
    pub client_src: SourceFiles,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct HealthCheckPayload {
    #[serde(default)]
    pub files_to_check: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Compile,
    Execute,
    HealthCheck,
}

/// A job request as consumed from a request queue
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct JobRequestMessage {
    pub job_id: JobId,
    pub payload: VmPayload,
}

/// Answer of a compiler VM to a `comp` payload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "$type")]
pub enum CompilationResponse {
    #[serde(rename = "ok")]
    Success {
        #[serde(rename = "Body")]
        body: SourceFiles,
    },
    #[serde(rename = "err")]
    Failure {
        #[serde(rename = "Body")]
        body: String,
    },
}

/// Answer of an executor VM; numbers travel as strings to survive any
/// consumer's number parsing
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExecutionResponse {
    pub out: String,
    pub err: String,
    pub exit_code: String,
    pub start_ns: String,
    pub end_ns: String,
    pub max_memory_kb: String,
}

impl ExecutionResponse {
    pub fn exit_code(&self) -> Option<i64> {
        self.exit_code.trim().parse().ok()
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code() == Some(0)
    }

    pub fn wall_time_ns(&self) -> Option<u128> {
        let start: u128 = self.start_ns.trim().parse().ok()?;
        let end: u128 = self.end_ns.trim().parse().ok()?;
        end.checked_sub(start)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase", default)]
pub struct HealthCheckResponse {
    pub file_hashes: BTreeMap<String, String>,
}

impl HealthCheckResponse {
    /// Files whose reported digest is missing or differs from `expected`
    pub fn mismatches(&self, expected: &BTreeMap<String, String>) -> Vec<String> {
        expected
            .iter()
            .filter(|(file, hash)| self.file_hashes.get(*file) != Some(*hash))
            .map(|(file, _)| file.clone())
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Compiling,
    Executing,
    Completed,
    CompilationFailure,
    RuntimeError,
    ServiceFailure,
    Timeout,
    Cancelled,
    Rejected,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Compiling | Self::Executing)
    }

    pub fn for_error(err: &JobError) -> Self {
        use crate::error::Reason;

        match err.reason {
            Reason::Compilation => Self::CompilationFailure,
            Reason::Timeout(_) => Self::Timeout,
            Reason::Cancelled => Self::Cancelled,
            Reason::InvalidArgument => Self::Rejected,
            Reason::ClusterOverloaded
            | Reason::ChannelRead
            | Reason::OutputNotFound
            | Reason::Internal => Self::ServiceFailure,
        }
    }
}

/// Successful outcome carried by a terminal response
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "$type")]
pub enum JobResult {
    #[serde(rename = "ok")]
    Compiled {
        #[serde(rename = "Body")]
        body: SourceFiles,
    },
    #[serde(rename = "exec")]
    Execution(ExecutionResponse),
    #[serde(rename = "health")]
    HealthCheck(HealthCheckResponse),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl From<&JobError> for ErrorBody {
    fn from(err: &JobError) -> Self {
        Self {
            error: err.error_code().to_string(),
            message: err.user_message(),
        }
    }
}

/// What a worker publishes to its response queue
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct JobResponseMessage {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<VmId>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl JobResponseMessage {
    pub fn progress(job_id: JobId, status: JobStatus) -> Self {
        Self {
            job_id,
            vm_id: None,
            status,
            result: None,
            error: None,
        }
    }

    pub fn terminal(job_id: JobId, vm_id: Option<VmId>, outcome: Result<JobResult, JobError>) -> Self {
        match outcome {
            Ok(result) => {
                let status = match &result {
                    JobResult::Execution(exec) if !exec.succeeded() => JobStatus::RuntimeError,
                    _ => JobStatus::Completed,
                };
                Self {
                    job_id,
                    vm_id,
                    status,
                    result: Some(result),
                    error: None,
                }
            }
            Err(err) => Self {
                job_id,
                vm_id,
                status: JobStatus::for_error(&err),
                result: None,
                error: Some(ErrorBody::from(&err)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_payload_discriminators() {
        let payload: VmPayload = serde_json::from_value(json!({
            "$type": "exec",
            "Entrypoint": "Main",
            "ClientSrc": { "Main.class": "AAAA" }
        }))
        .unwrap();
        assert_eq!(payload.kind(), JobKind::Execute);

        let health = VmPayload::HealthCheck(HealthCheckPayload {
            files_to_check: vec!["/usr/bin/javac".to_string()],
        });
        assert_json_eq!(
            serde_json::to_value(&health).unwrap(),
            json!({ "$type": "health", "FilesToCheck": ["/usr/bin/javac"] })
        );
    }

    #[test]
    fn test_compilation_response_tags() {
        let ok: CompilationResponse =
            serde_json::from_value(json!({ "$type": "ok", "Body": { "Main.class": "q" } }))
                .unwrap();
        assert!(matches!(ok, CompilationResponse::Success { .. }));

        let err: CompilationResponse =
            serde_json::from_value(json!({ "$type": "err", "Body": "Main.java:1: error" }))
                .unwrap();
        assert_eq!(
            err,
            CompilationResponse::Failure {
                body: "Main.java:1: error".to_string()
            }
        );
    }

    #[test]
    fn test_execution_response_numbers_are_strings() {
        let resp: ExecutionResponse = serde_json::from_value(json!({
            "Out": "hi\n",
            "Err": "",
            "ExitCode": "0",
            "StartNs": "1000",
            "EndNs": "4500",
            "MaxMemoryKb": "20480"
        }))
        .unwrap();
        assert!(resp.succeeded());
        assert_eq!(resp.wall_time_ns(), Some(3500));
    }

    #[test]
    fn test_health_mismatches() {
        let resp = HealthCheckResponse {
            file_hashes: BTreeMap::from([
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ]),
        };
        let expected = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "X".to_string()),
            ("c".to_string(), "3".to_string()),
        ]);
        assert_eq!(resp.mismatches(&expected), vec!["b", "c"]);
    }

    #[test]
    fn test_terminal_response_for_error() {
        let job_id = Uuid::nil();
        let msg = JobResponseMessage::terminal(job_id, None, Err(JobError::overloaded("full")));
        assert_json_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "JobId": "00000000-0000-0000-0000-000000000000",
                "Status": "ServiceFailure",
                "Error": {
                    "Error": "SERVICE_OVERLOADED",
                    "Message": "Service is busy. Please try again in a moment."
                }
            })
        );
    }

    #[test]
    fn test_nonzero_exit_is_runtime_error() {
        let exec = ExecutionResponse {
            exit_code: "1".to_string(),
            ..Default::default()
        };
        let msg = JobResponseMessage::terminal(Uuid::nil(), None, Ok(JobResult::Execution(exec)));
        assert_eq!(msg.status, JobStatus::RuntimeError);
        assert!(msg.status.is_terminal());
        assert!(!JobStatus::Compiling.is_terminal());
    }
}
