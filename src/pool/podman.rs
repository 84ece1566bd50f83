//! Rootless Podman sandboxes as pooled resources
//!
//! Each resource is a detached container kept alive by `sleep infinity` and
//! labelled with its pool category. Reset runs a cleanup script inside the
//! container; a non-zero exit fails the reset.

use crate::config::PoolsConfig;
use crate::error::{StrataError, StrataResult};
use crate::pool::provisioner::Provisioner;
use crate::pool::resource::{Health, PooledResource};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Label carrying the pool category
pub const POOL_LABEL: &str = "strata.pool";

/// Clears scratch space and verifies nothing is left behind
const RESET_SCRIPT: &str = "for d in /tmp /var/tmp /root; do \
     [ -d \"$d\" ] && find \"$d\" -mindepth 1 -delete; \
     done; \
     test -z \"$(ls -A /tmp)\"";

/// Provisioner backed by native rootless Podman
pub struct PodmanProvisioner {
    pools: PoolsConfig,
}

impl PodmanProvisioner {
    pub fn new(pools: PoolsConfig) -> Self {
        Self { pools }
    }

    /// Check if Podman is installed
    pub async fn is_available() -> bool {
        Command::new("podman")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Execute a Podman command and return the output
    async fn exec(&self, args: &[&str]) -> StrataResult<std::process::Output> {
        debug!("Executing: podman {:?}", args);

        Command::new("podman")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| StrataError::command_failed(format!("podman {:?}", args), e))
    }
}

#[async_trait]
impl Provisioner for PodmanProvisioner {
    async fn create(&self, category: &str) -> StrataResult<String> {
        let image = self.pools.for_category(category).image;
        let label = format!("{}={}", POOL_LABEL, category);

        let output = self
            .exec(&[
                "run", "-d", "--label", &label, "--network", "none", &image, "sleep", "infinity",
            ])
            .await?;

        if output.status.success() {
            let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
            info!("Provisioned {} sandbox {}", category, &id[..12.min(id.len())]);
            Ok(id)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(StrataError::Provisioning {
                category: category.to_string(),
                reason: stderr.trim().to_string(),
            })
        }
    }

    async fn reset(&self, resource: &PooledResource) -> StrataResult<()> {
        let output = self
            .exec(&["exec", &resource.id, "sh", "-c", RESET_SCRIPT])
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(StrataError::ResetVerification {
                id: resource.id.clone(),
                reason: format!(
                    "cleanup exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }

    async fn destroy(&self, resource: &PooledResource) -> StrataResult<()> {
        debug!("Removing sandbox: {}", resource.id);

        let output = self.exec(&["rm", "-f", &resource.id]).await?;

        if output.status.success() {
            Ok(())
        } else {
            // Ignore error if container doesn't exist
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no such container") {
                Ok(())
            } else {
                Err(StrataError::command_exec("podman rm", stderr))
            }
        }
    }

    async fn health_check(&self, resource: &PooledResource) -> Health {
        match self
            .exec(&["inspect", "-f", "{{.State.Running}}", &resource.id])
            .await
        {
            Ok(output) if output.status.success() => {
                if String::from_utf8_lossy(&output.stdout).trim() == "true" {
                    Health::Healthy
                } else {
                    Health::Unhealthy("container is not running".to_string())
                }
            }
            Ok(output) => Health::Unhealthy(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ),
            Err(e) => Health::Unhealthy(e.to_string()),
        }
    }

    fn name(&self) -> &'static str {
        "podman"
    }
}
