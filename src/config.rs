use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::vm::{Reservation, VmRole};

#[derive(Parser)]
#[command(name = "vmexec", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file, built-in defaults are used when omitted
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Whether to flush the existing broker database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let Some(path) = &self.config_path else {
            return Ok(Config::default());
        };
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Rejects values the daemons cannot run with
    pub fn validate(&self) -> std::io::Result<()> {
        let invalid = |field: &str| {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{field} must be greater than zero"),
            ))
        };
        if self.executor.pool.polling_frequency.0 == 0 {
            return invalid("executor.pool.polling_frequency");
        }
        if self.broker.poll_interval.is_some_and(|ms| ms.0 == 0) {
            return invalid("broker.poll_interval");
        }
        Ok(())
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub executor: ExecutorConfig,
    pub broker: BrokerConfig,
    pub workers: WorkersConfig,
    pub firecracker: FirecrackerConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
    /// `Details` in error bodies are only rendered outside production
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            bind_port: None,
            production: true,
        }
    }
}

/// Duration in milliseconds as it appears in the config file
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl MilliSecond {
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.0)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(default)]
pub struct ExecutorConfig {
    pub timeouts: VmTimeouts,
    pub resources: VmResources,
    pub pool: PoolConfig,
    pub cluster: ClusterLimits,
    pub limits: ExecutionLimits,
    pub compilation: CompilationConfig,
    pub health_check: HealthCheckConfig,
}

impl ExecutorConfig {
    pub fn reservation(&self, role: VmRole) -> Reservation {
        match role {
            VmRole::Compiler => Reservation {
                vcpu: self.resources.compiler_vcpu_count,
                memory_mb: self.resources.compiler_memory_mb,
            },
            VmRole::Executor => Reservation {
                vcpu: self.resources.executor_vcpu_count,
                memory_mb: self.resources.executor_memory_mb,
            },
        }
    }

    /// How many idle VMs of a role the pool keeps warm
    pub fn cache_target(&self, role: VmRole) -> usize {
        match role {
            VmRole::Compiler => self.pool.default_compiler_cache_target,
            VmRole::Executor => self.pool.default_executor_cache_target,
        }
    }

    /// Idle VMs kept on release before the surplus is retired
    pub fn idle_capacity(&self, role: VmRole) -> usize {
        match role {
            VmRole::Compiler => self.pool.default_compiler_cache_target.max(1),
            VmRole::Executor => self.pool.orphan_pool_size,
        }
    }

    /// Effective execution bound, never above the hard user limit
    pub fn execution_timeout(&self) -> Duration {
        self.timeouts
            .execution_timeout
            .min(self.limits.max_execution_time)
            .as_duration()
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct VmTimeouts {
    pub query_timeout: MilliSecond,
    pub resource_request_timeout: MilliSecond,
    pub compilation_timeout: MilliSecond,
    pub execution_timeout: MilliSecond,
    pub vm_launch_timeout: MilliSecond,
}

impl Default for VmTimeouts {
    fn default() -> Self {
        Self {
            query_timeout: MilliSecond::from_secs(15),
            resource_request_timeout: MilliSecond::from_secs(30),
            compilation_timeout: MilliSecond::from_secs(60),
            execution_timeout: MilliSecond::from_secs(30),
            vm_launch_timeout: MilliSecond::from_secs(60),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct VmResources {
    pub executor_vcpu_count: u32,
    pub executor_memory_mb: u32,
    pub compiler_vcpu_count: u32,
    pub compiler_memory_mb: u32,
}

impl Default for VmResources {
    fn default() -> Self {
        Self {
            executor_vcpu_count: 1,
            executor_memory_mb: 256,
            compiler_vcpu_count: 2,
            compiler_memory_mb: 2048,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PoolConfig {
    pub tracking_period: MilliSecond,
    pub polling_frequency: MilliSecond,
    pub default_compiler_cache_target: usize,
    pub default_executor_cache_target: usize,
    pub orphan_pool_size: usize,
    /// Upper clamp for the adaptive filesystem cache target
    pub max_filesystem_cache_target: usize,
    /// Ceiling on concurrently leased filesystems
    pub max_outstanding_leases: usize,
    pub filesystems_dir: Option<PathBuf>,
    pub base_images_dir: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            tracking_period: MilliSecond::from_secs(600),
            polling_frequency: MilliSecond::from_secs(15),
            default_compiler_cache_target: 1,
            default_executor_cache_target: 5,
            orphan_pool_size: 5,
            max_filesystem_cache_target: 32,
            max_outstanding_leases: 64,
            filesystems_dir: None,
            base_images_dir: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClusterLimits {
    pub total_memory_mb: u32,
    pub total_vcpu_count: u32,
    pub max_vcpu_oversubscription: f64,
}

impl Default for ClusterLimits {
    fn default() -> Self {
        Self {
            total_memory_mb: 8192,
            total_vcpu_count: 8,
            max_vcpu_oversubscription: 1.5,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExecutionLimits {
    pub max_file_count: usize,
    pub max_execution_time: MilliSecond,
    pub max_user_memory_mb: u32,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_file_count: 10,
            max_execution_time: MilliSecond::from_secs(30),
            max_user_memory_mb: 128,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CompilationConfig {
    pub artifact_cache_capacity: usize,
    pub artifact_max_age: MilliSecond,
}

impl Default for CompilationConfig {
    fn default() -> Self {
        Self {
            artifact_cache_capacity: 256,
            artifact_max_age: MilliSecond::from_secs(3600),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub files_to_check: Vec<String>,
    /// Known-good digests; when empty the hashes recorded at launch are used
    pub expected_hashes: BTreeMap<String, String>,
    pub interval: MilliSecond,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            files_to_check: Vec::new(),
            expected_hashes: BTreeMap::new(),
            interval: MilliSecond::from_secs(60),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct BrokerConfig {
    /// SQLite file backing the queues, defaults to the user data directory
    pub database_path: Option<PathBuf>,
    /// How often consumers re-check the table for externally published rows
    pub poll_interval: Option<MilliSecond>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WorkersConfig {
    pub executor: ServiceData,
    pub validator: ServiceData,
    pub max_in_flight: usize,
    pub drain_timeout: MilliSecond,
    pub publish_progress: bool,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            executor: ServiceData {
                service_name: "ExecutorService".to_string(),
                request_queue_name: "code_execution_requests".to_string(),
                response_queue_name: "code_execution_results".to_string(),
            },
            validator: ServiceData {
                service_name: "ValidatorService".to_string(),
                request_queue_name: "problem_validation_requests".to_string(),
                response_queue_name: "problem_validation_results".to_string(),
            },
            max_in_flight: 5,
            drain_timeout: MilliSecond::from_secs(30),
            publish_progress: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceData {
    pub service_name: String,
    pub request_queue_name: String,
    pub response_queue_name: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FirecrackerConfig {
    pub launch_script: PathBuf,
    pub vsock_dir: PathBuf,
    pub guest_port: u32,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            launch_script: PathBuf::from("/app/firecracker/launch-vm.sh"),
            vsock_dir: PathBuf::from("/var/vmexec/vsocks"),
            guest_port: 5050,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ExecutorConfig::default();
        assert_eq!(config.timeouts.query_timeout.as_duration(), Duration::from_secs(15));
        assert_eq!(config.resources.executor_memory_mb, 256);
        assert_eq!(config.cluster.total_vcpu_count, 8);
        assert_eq!(config.cluster.max_vcpu_oversubscription, 1.5);
        assert_eq!(config.pool.orphan_pool_size, 5);
        assert_eq!(config.limits.max_file_count, 10);
    }

    #[test]
    fn test_partial_config_deserialization() {
        let config: Config = serde_json::from_str(
            r#"{
                "server": { "bind_port": 8080, "production": false },
                "executor": {
                    "timeouts": { "execution_timeout": 2000 },
                    "cluster": { "total_vcpu_count": 4, "max_vcpu_oversubscription": 1.0 }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.server.bind_port, Some(8080));
        assert!(!config.server.production);
        assert_eq!(config.executor.timeouts.execution_timeout, MilliSecond(2000));
        assert_eq!(config.executor.timeouts.query_timeout, MilliSecond(15000));
        assert_eq!(config.executor.cluster.total_vcpu_count, 4);
        assert_eq!(config.executor.cluster.total_memory_mb, 8192);
        assert_eq!(
            config.workers.executor.request_queue_name,
            "code_execution_requests"
        );
    }

    #[test]
    fn test_zero_polling_frequency_is_rejected() {
        let config: Config =
            serde_json::from_str(r#"{ "executor": { "pool": { "polling_frequency": 0 } } }"#)
                .unwrap();
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("polling_frequency"));

        let config: Config = serde_json::from_str(r#"{ "broker": { "poll_interval": 0 } }"#).unwrap();
        assert!(config.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_execution_timeout_capped_by_limit() {
        let mut config = ExecutorConfig::default();
        config.timeouts.execution_timeout = MilliSecond::from_secs(90);
        config.limits.max_execution_time = MilliSecond::from_secs(10);
        assert_eq!(config.execution_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_reservation_per_role() {
        let config = ExecutorConfig::default();
        assert_eq!(
            config.reservation(VmRole::Compiler),
            Reservation {
                vcpu: 2,
                memory_mb: 2048
            }
        );
        assert_eq!(config.reservation(VmRole::Executor).vcpu, 1);
    }
}
