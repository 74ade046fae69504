use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;

use crate::config::FirecrackerConfig;
use crate::protocol::VmPayload;

use super::{ChannelError, LaunchSpec, VmBackend, VmInstance};

/// End-of-transmission marker closing a message in either direction
const EOT: u8 = 0x04;
const CONNECT_RETRIES: u32 = 3;

/// Firecracker microVMs behind a launch script and a vsock Unix-socket proxy
///
/// The launch script receives the VM id, guest CID, filesystem id, vCPU
/// count, memory size and SMT flag, boots the machine and prints the
/// hypervisor PID on stdout.
pub struct FirecrackerBackend {
    config: FirecrackerConfig,
}

impl FirecrackerBackend {
    pub fn build(config: FirecrackerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.vsock_dir).with_context(|| {
            format!("Failed to create vsock dir at {}", config.vsock_dir.display())
        })?;
        log::info!(
            "Firecracker backend using launch script {}",
            config.launch_script.display()
        );
        Ok(Self { config })
    }

    /// Opens the guest channel and performs the `CONNECT <port>` handshake
    async fn connect(&self, vm: &VmInstance) -> Result<BufReader<UnixStream>, ChannelError> {
        let stream = UnixStream::connect(&vm.channel_path).await?;
        let mut reader = BufReader::new(stream);

        let connect_message = format!("CONNECT {}\n", self.config.guest_port);
        reader.get_mut().write_all(connect_message.as_bytes()).await?;

        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if !line.starts_with("OK ") {
            return Err(ChannelError::Handshake(line.trim().to_string()));
        }

        log::debug!("Channel to VM {} established: {}", vm.vm_id, line.trim());
        Ok(reader)
    }

    /// Retries only failures that happen before the payload leaves the host,
    /// so a job is never sent to the guest twice
    async fn connect_with_retry(
        &self,
        vm: &VmInstance,
    ) -> Result<BufReader<UnixStream>, ChannelError> {
        let mut attempt = 0;
        loop {
            match self.connect(vm).await {
                Ok(reader) => return Ok(reader),
                Err(e) if attempt < CONNECT_RETRIES => {
                    attempt += 1;
                    let delay = Duration::from_millis(100 * 2u64.pow(attempt));
                    log::warn!(
                        "Retry {attempt} for VM {} after {}ms due to: {e}",
                        vm.vm_id,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Positional arguments of the launch script; a user memory cap of 0 means none
fn launch_args(spec: &LaunchSpec) -> [String; 7] {
    [
        spec.vm_id.to_string(),
        spec.guest_cid.to_string(),
        spec.filesystem.to_string(),
        spec.reservation.vcpu.to_string(),
        spec.reservation.memory_mb.to_string(),
        "false".to_string(), // smt
        spec.user_memory_mb.unwrap_or(0).to_string(),
    ]
}

#[async_trait]
impl VmBackend for FirecrackerBackend {
    async fn launch(&self, spec: &LaunchSpec) -> Result<VmInstance> {
        let output = Command::new("bash")
            .arg(&self.config.launch_script)
            .args(launch_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true) // a timed-out launch must not leave the script running
            .output()
            .await
            .context("Failed to spawn VM launch script")?;

        if !output.status.success() {
            bail!(
                "VM launch script exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let pid: u32 = stdout
            .trim()
            .parse()
            .map_err(|_| anyhow!("Invalid PID from launch script: {:?}", stdout.trim()))?;

        Ok(VmInstance {
            vm_id: spec.vm_id,
            pid: Some(pid),
            channel_path: self.config.vsock_dir.join(format!("{}.vsock", spec.vm_id)),
        })
    }

    async fn query(&self, vm: &VmInstance, payload: &VmPayload) -> Result<String, ChannelError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| ChannelError::Broken(std::io::Error::new(ErrorKind::InvalidData, e)))?;

        let mut reader = self.connect_with_retry(vm).await?;
        reader.get_mut().write_all(&body).await?;
        reader.get_mut().write_all(&[EOT]).await?;

        let mut response = Vec::new();
        reader.read_until(EOT, &mut response).await?;
        if response.last() == Some(&EOT) {
            response.pop();
        }
        if response.is_empty() {
            return Err(ChannelError::NoOutput);
        }

        String::from_utf8(response)
            .map_err(|e| ChannelError::Broken(std::io::Error::new(ErrorKind::InvalidData, e)))
    }

    async fn terminate(&self, vm: &VmInstance) -> Result<()> {
        if let Some(pid) = vm.pid {
            // SAFETY: kill(2) takes plain integers and has no memory effects
            let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    bail!("Failed to kill VM {} process {pid}: {err}", vm.vm_id);
                }
                log::debug!("VM {} process {pid} already exited", vm.vm_id);
            } else {
                log::debug!("Killed VM {} process {pid}", vm.vm_id);
            }
        }

        match tokio::fs::remove_file(&vm.channel_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("Failed to remove vsock socket"),
        }
    }
}
