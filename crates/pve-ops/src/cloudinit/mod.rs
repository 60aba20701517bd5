//! Cloud-init configuration of a freshly built VM.
//!
//! Two layers: the hypervisor's own cloud-init keys (`citype`, `ipconfig0`,
//! credentials) and a per-VM user-data script stored as a snippet and
//! referenced through `cicustom`.

pub mod firewall;
pub mod snippet;

use std::path::PathBuf;

use tracing::info;

use crate::config::PlatformConfig;
use crate::error::Result;
use crate::hypervisor::{Hypervisor, VmOption};
use crate::params::ProvisionRequest;
use crate::templates::TemplateEngine;

pub use firewall::{FirewallPolicy, FirewallRule, PortRange, Protocol};
pub use snippet::SnippetContext;

/// Cloud-init keys set on the VM, in order.
#[must_use]
pub fn cloud_init_options(request: &ProvisionRequest, config: &PlatformConfig) -> Vec<VmOption> {
    let nameservers = config
        .dns_servers
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ");

    vec![
        VmOption::new("citype", "nocloud"),
        VmOption::new("ipconfig0", request.ip_config()),
        VmOption::new("nameserver", nameservers),
        VmOption::new("ciuser", request.ci_user.clone()),
        VmOption::new("cipassword", request.ci_password.clone()),
        VmOption::new("sshkeys", request.ssh_pubkey_path.display().to_string()),
    ]
}

/// Configure cloud-init on VM `vm_id` and return the snippet path.
///
/// # Errors
/// Fails if a hypervisor call fails or the snippet cannot be generated.
pub async fn configure(
    hypervisor: &dyn Hypervisor,
    vm_id: u32,
    request: &ProvisionRequest,
    config: &PlatformConfig,
    engine: &TemplateEngine,
) -> Result<PathBuf> {
    info!(vm_id, ip = %request.cidr(), "Configuring cloud-init");
    hypervisor
        .set_options(vm_id, &cloud_init_options(request, config))
        .await?;

    let script = snippet::render(request, config, engine)?;
    let file_name = request.snippet_file_name();
    let path = snippet::write(&config.snippets_dir, &file_name, &script)?;

    let cicustom = format!(
        "user={}",
        snippet::volume_ref(&config.snippet_storage, &file_name)
    );
    hypervisor
        .set_options(vm_id, &[VmOption::new("cicustom", cicustom)])
        .await?;

    Ok(path)
}
