//! The provisioning workflow.
//!
//! Stages run strictly in sequence. Once `qm create` has succeeded, any
//! fatal failure up to and including `qm start` purges the VM and its
//! cloud-init snippet again so a failed run never leaves a half-built VM
//! behind. A readiness timeout is
//! reported but keeps the VM, since it is running and may still finish
//! cloud-init.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::builder;
use crate::cloudinit::{self, snippet};
use crate::config::PlatformConfig;
use crate::error::{ProvisionError, Result};
use crate::hypervisor::{Hypervisor, VmIdLock};
use crate::image::ImageCache;
use crate::lifecycle::{self, ConnectionInfo, Readiness};
use crate::params::ProvisionRequest;
use crate::templates::TemplateEngine;

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct ProvisionOutcome {
    pub vm_id: u32,
    /// Volume attached as the boot disk.
    pub boot_volume: String,
    /// Cloud-init snippet written for the VM.
    pub snippet_path: PathBuf,
    /// Time until SSH answered, or `None` when readiness was not awaited.
    pub ready_after: Option<Duration>,
    pub connection: ConnectionInfo,
}

/// Runs the provisioning stages against a hypervisor.
pub struct Provisioner<'a> {
    hypervisor: &'a dyn Hypervisor,
    config: &'a PlatformConfig,
    engine: &'a TemplateEngine,
    wait_for_ssh: bool,
}

impl<'a> Provisioner<'a> {
    #[must_use]
    pub fn new(
        hypervisor: &'a dyn Hypervisor,
        config: &'a PlatformConfig,
        engine: &'a TemplateEngine,
    ) -> Self {
        Self {
            hypervisor,
            config,
            engine,
            wait_for_ssh: true,
        }
    }

    /// Whether to poll SSH after start.
    #[must_use]
    pub fn wait_for_ssh(mut self, wait: bool) -> Self {
        self.wait_for_ssh = wait;
        self
    }

    /// Provision one VM.
    ///
    /// # Errors
    /// Returns the first fatal error. If the VM had already been created it
    /// has been purged by then, except after a readiness timeout.
    pub async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionOutcome> {
        let image = ImageCache::from_config(self.config).ensure().await?;

        let vm_id = self.allocate_and_create(request).await?;

        let (boot_volume, snippet_path) = match self.configure(vm_id, &image, request).await {
            Ok(built) => built,
            Err(e) => {
                self.teardown(vm_id, request, &e).await;
                return Err(e);
            }
        };

        let connection = ConnectionInfo {
            vm_id,
            vm_name: request.vm_name.clone(),
            user: request.ci_user.clone(),
            ip: request.ip_address,
        };

        let ready_after = if self.wait_for_ssh {
            let readiness =
                Readiness::ssh(self.config.ready_timeout_secs, self.config.ready_poll_secs);
            Some(lifecycle::wait_until_ready(request.ip_address, readiness).await?)
        } else {
            info!(vm_id, "Not waiting for SSH");
            None
        };

        info!(vm_id, name = %request.vm_name, "Provisioning complete");
        Ok(ProvisionOutcome {
            vm_id,
            boot_volume,
            snippet_path,
            ready_after,
            connection,
        })
    }

    /// Pick the VM id and create the shell while holding the allocation lock.
    async fn allocate_and_create(&self, request: &ProvisionRequest) -> Result<u32> {
        let lock_dir = self.config.lock_dir.clone();
        let lock = tokio::task::spawn_blocking(move || VmIdLock::acquire(&lock_dir))
            .await
            .map_err(|e| ProvisionError::LockFailed {
                path: self.config.lock_dir.clone(),
                source: std::io::Error::other(e),
            })??;

        let vm_id = match request.vm_id {
            Some(id) => {
                if self.hypervisor.vm_exists(id).await? {
                    return Err(ProvisionError::invalid(format!("VM id {id} is already in use")));
                }
                id
            }
            None => self.hypervisor.next_vm_id().await?,
        };
        info!(vm_id, "Allocated VM id");

        builder::create(self.hypervisor, &builder::vm_spec(vm_id, request)).await?;
        drop(lock);
        Ok(vm_id)
    }

    /// Everything between create and a running VM.
    async fn configure(
        &self,
        vm_id: u32,
        image: &std::path::Path,
        request: &ProvisionRequest,
    ) -> Result<(String, PathBuf)> {
        let volume = builder::build(self.hypervisor, vm_id, image, request).await?;
        let snippet_path =
            cloudinit::configure(self.hypervisor, vm_id, request, self.config, self.engine).await?;
        lifecycle::start(self.hypervisor, vm_id).await?;
        Ok((volume, snippet_path))
    }

    /// Purge the VM and drop its snippet, which holds the password.
    async fn teardown(&self, vm_id: u32, request: &ProvisionRequest, cause: &ProvisionError) {
        error!(vm_id, error = %cause, "Provisioning failed, purging VM");
        match self.hypervisor.destroy_vm(vm_id).await {
            Ok(()) => info!(vm_id, "Partially built VM purged"),
            Err(e) => warn!(vm_id, error = %e, "Teardown failed, VM must be removed manually"),
        }

        let file_name = request.snippet_file_name();
        if let Err(e) = snippet::remove(&self.config.snippets_dir, &file_name) {
            warn!(vm_id, snippet = %file_name, error = %e, "Snippet must be removed manually");
        }
    }
}
