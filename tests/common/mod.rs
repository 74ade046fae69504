#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use vmexec::compile::CompilationHandler;
use vmexec::config::{ExecutorConfig, MilliSecond};
use vmexec::pipeline::JobPipeline;
use vmexec::protocol::{SourceFiles, VmPayload};
use vmexec::vm::{
    ChannelError, FilesystemId, FilesystemPooler, FilesystemProvisioner, LaunchSpec, VmBackend,
    VmId, VmInstance, VmLaunchManager, VmRole, VmTerminationEvent,
};

pub const JAVAC: &str = "/usr/lib/jvm/bin/javac";

/// Scripted guest: behaviour is picked by the entrypoint or source text.
///
/// Entrypoints: `loop` never answers, `crash` breaks the channel, `silent`
/// closes it without output, `garbage` answers with non-JSON, `fail` exits 1.
/// Sources containing `syntax error` fail to compile.
pub struct MockBackend {
    pub launches: AtomicUsize,
    pub terminations: AtomicUsize,
    pub queries: AtomicUsize,
    pub fail_launch: AtomicBool,
    pub launched: Mutex<Vec<LaunchSpec>>,
    launch_delay: Duration,
    toolchain: Mutex<BTreeMap<String, String>>,
    live: Mutex<HashSet<VmId>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_launch_delay(Duration::ZERO)
    }

    pub fn with_launch_delay(launch_delay: Duration) -> Self {
        Self {
            launches: AtomicUsize::new(0),
            terminations: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            fail_launch: AtomicBool::new(false),
            launched: Mutex::new(Vec::new()),
            launch_delay,
            toolchain: Mutex::new(BTreeMap::from([(JAVAC.to_string(), "aaaa".to_string())])),
            live: Mutex::new(HashSet::new()),
        }
    }

    /// Changes the digest every guest reports for `file`
    pub fn set_toolchain_hash(&self, file: &str, hash: &str) {
        self.toolchain.lock().insert(file.to_string(), hash.to_string());
    }

    pub fn live_vms(&self) -> usize {
        self.live.lock().len()
    }

    fn compile(&self, files: &SourceFiles) -> String {
        if files.values().any(|src| src.contains("syntax error")) {
            return json!({ "$type": "err", "Body": "Main.java:1: error: ';' expected" })
                .to_string();
        }
        let classes: BTreeMap<String, String> = files
            .iter()
            .map(|(path, src)| (path.replace(".java", ".class"), format!("bytecode:{src}")))
            .collect();
        json!({ "$type": "ok", "Body": classes }).to_string()
    }
}

#[async_trait]
impl VmBackend for MockBackend {
    async fn launch(&self, spec: &LaunchSpec) -> Result<VmInstance> {
        tokio::time::sleep(self.launch_delay).await;
        if self.fail_launch.load(Ordering::SeqCst) {
            bail!("launch script exited with 1");
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.launched.lock().push(spec.clone());
        self.live.lock().insert(spec.vm_id);
        Ok(VmInstance {
            vm_id: spec.vm_id,
            pid: None,
            channel_path: PathBuf::from(format!("/nonexistent/{}.vsock", spec.vm_id)),
        })
    }

    async fn query(&self, _vm: &VmInstance, payload: &VmPayload) -> Result<String, ChannelError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        match payload {
            VmPayload::Compilation(p) => Ok(self.compile(&p.src_files)),
            VmPayload::Execution(p) => match p.entrypoint.as_str() {
                "loop" => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                "crash" => Err(ChannelError::Broken(std::io::Error::new(
                    ErrorKind::ConnectionReset,
                    "connection reset by guest",
                ))),
                "silent" => Err(ChannelError::NoOutput),
                "garbage" => Ok("Segmentation fault".to_string()),
                entrypoint => {
                    let exit_code = if entrypoint == "fail" { "1" } else { "0" };
                    Ok(json!({
                        "Out": format!("hello from {entrypoint}\n"),
                        "Err": "",
                        "ExitCode": exit_code,
                        "StartNs": "1000",
                        "EndNs": "5000",
                        "MaxMemoryKb": "10240"
                    })
                    .to_string())
                }
            },
            VmPayload::HealthCheck(p) => {
                let toolchain = self.toolchain.lock();
                let hashes: BTreeMap<&String, &String> = toolchain
                    .iter()
                    .filter(|(file, _)| p.files_to_check.is_empty() || p.files_to_check.contains(*file))
                    .collect();
                Ok(json!({ "FileHashes": hashes }).to_string())
            }
        }
    }

    async fn terminate(&self, vm: &VmInstance) -> Result<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.live.lock().remove(&vm.vm_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockProvisioner {
    pub created: AtomicUsize,
    pub removed: AtomicUsize,
    live: Mutex<HashSet<FilesystemId>>,
}

impl MockProvisioner {
    pub fn live(&self) -> usize {
        self.live.lock().len()
    }
}

#[async_trait]
impl FilesystemProvisioner for MockProvisioner {
    async fn create(&self, _role: VmRole) -> Result<FilesystemId> {
        let id = FilesystemId(Uuid::new_v4());
        self.created.fetch_add(1, Ordering::SeqCst);
        self.live.lock().insert(id);
        Ok(id)
    }

    async fn remove(&self, id: FilesystemId) -> Result<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        self.live.lock().remove(&id);
        Ok(())
    }
}

/// Short timeouts and no pre-warming so tests control every VM
pub fn test_config() -> ExecutorConfig {
    let mut config = ExecutorConfig::default();
    config.timeouts.query_timeout = MilliSecond(500);
    config.timeouts.resource_request_timeout = MilliSecond(300);
    config.timeouts.compilation_timeout = MilliSecond(2000);
    config.timeouts.execution_timeout = MilliSecond(300);
    config.timeouts.vm_launch_timeout = MilliSecond(2000);
    config.pool.default_compiler_cache_target = 0;
    config.pool.default_executor_cache_target = 0;
    config.pool.orphan_pool_size = 2;
    config.cluster.total_vcpu_count = 8;
    config.cluster.total_memory_mb = 16384;
    config.cluster.max_vcpu_oversubscription = 1.0;
    config
}

pub struct Harness {
    pub config: Arc<ExecutorConfig>,
    pub backend: Arc<MockBackend>,
    pub provisioner: Arc<MockProvisioner>,
    pub pooler: Arc<FilesystemPooler>,
    pub manager: Arc<VmLaunchManager>,
    pub compiler: Arc<CompilationHandler>,
    pub pipeline: Arc<JobPipeline>,
}

impl Harness {
    pub fn new(config: ExecutorConfig) -> Self {
        Self::with_backend(config, MockBackend::new())
    }

    pub fn with_backend(config: ExecutorConfig, backend: MockBackend) -> Self {
        let config = Arc::new(config);
        let backend = Arc::new(backend);
        let provisioner = Arc::new(MockProvisioner::default());
        let pooler = Arc::new(FilesystemPooler::new(provisioner.clone(), &config));
        let manager = VmLaunchManager::new(config.clone(), backend.clone(), pooler.clone());
        let compiler = Arc::new(CompilationHandler::new(config.clone(), manager.clone()));
        let pipeline = Arc::new(JobPipeline::new(
            config.clone(),
            manager.clone(),
            compiler.clone(),
        ));
        Self {
            config,
            backend,
            provisioner,
            pooler,
            manager,
            compiler,
            pipeline,
        }
    }
}

pub fn java_sources(body: &str) -> SourceFiles {
    SourceFiles::from([(
        "Main.java".to_string(),
        format!("public class Main {{ {body} }}"),
    )])
}

/// Next termination event, failing the test after a second
pub async fn next_event(
    events: &mut broadcast::Receiver<VmTerminationEvent>,
) -> VmTerminationEvent {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("no termination event within 1s")
        .expect("event channel closed")
}
