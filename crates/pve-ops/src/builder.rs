//! VM construction: create the shell, import the base image as its boot
//! disk, size it and attach the cloud-init drive.

use std::path::Path;

use tracing::{info, warn};

use crate::error::Result;
use crate::hypervisor::{
    Hypervisor, VmOption, VmSpec, VolumeLayout, BOOT_SLOT, CLOUDINIT_SLOT,
};
use crate::params::ProvisionRequest;

/// NIC model of `net0`.
pub const NIC_MODEL: &str = "virtio";

/// Index of the disk produced by the first import into a VM.
const IMPORTED_DISK_INDEX: u32 = 0;

/// VM shell arguments for a request.
#[must_use]
pub fn vm_spec(vm_id: u32, request: &ProvisionRequest) -> VmSpec {
    VmSpec {
        id: vm_id,
        name: request.vm_name.clone(),
        memory_mb: request.memory_mb,
        cores: request.cpu_cores,
        bridge: request.bridge.clone(),
        nic_model: NIC_MODEL.to_string(),
    }
}

/// Create the empty VM shell.
///
/// # Errors
/// Fails if `qm create` fails.
pub async fn create(hypervisor: &dyn Hypervisor, spec: &VmSpec) -> Result<()> {
    hypervisor.create_vm(spec).await
}

/// Turn the created shell into a bootable VM.
///
/// Expects the VM from [`create`] to exist. A failed resize only warns; the
/// VM then boots with the image's native disk size.
///
/// # Errors
/// Fails if the import, the disk attach (both layouts), the boot order or
/// the cloud-init drive cannot be set.
pub async fn build(
    hypervisor: &dyn Hypervisor,
    vm_id: u32,
    image: &Path,
    request: &ProvisionRequest,
) -> Result<String> {
    let storage = &request.storage_id;

    hypervisor.import_disk(vm_id, image, storage).await?;
    let volume = attach_boot_disk(hypervisor, vm_id, storage).await?;

    hypervisor
        .set_options(vm_id, &[VmOption::new("boot", format!("order={BOOT_SLOT}"))])
        .await?;

    if let Err(e) = hypervisor
        .resize_disk(vm_id, BOOT_SLOT, request.disk_gb)
        .await
    {
        warn!(
            vm_id,
            size_gb = request.disk_gb,
            error = %e,
            "Disk resize failed, keeping image size"
        );
    }

    hypervisor
        .set_options(
            vm_id,
            &[VmOption::new(CLOUDINIT_SLOT, format!("{storage}:cloudinit"))],
        )
        .await?;

    info!(vm_id, volume = %volume, "VM built");
    Ok(volume)
}

/// Attach the imported disk as the boot disk and return its volume id.
///
/// The volume name follows from the storage type; if the hypervisor rejects
/// it, the other naming scheme is tried once.
async fn attach_boot_disk(hypervisor: &dyn Hypervisor, vm_id: u32, storage: &str) -> Result<String> {
    let kind = hypervisor.describe_storage(storage).await?;
    let layout = VolumeLayout::for_kind(&kind);
    let volume = layout.volume_id(storage, vm_id, IMPORTED_DISK_INDEX);
    info!(vm_id, storage, kind = %kind, volume = %volume, "Attaching boot disk");

    match hypervisor
        .set_options(vm_id, &[VmOption::new(BOOT_SLOT, volume.clone())])
        .await
    {
        Ok(()) => Ok(volume),
        Err(first) => {
            let alternate = layout
                .alternate()
                .volume_id(storage, vm_id, IMPORTED_DISK_INDEX);
            warn!(
                vm_id,
                volume = %volume,
                alternate = %alternate,
                error = %first,
                "Attach failed, retrying with alternate volume name"
            );
            hypervisor
                .set_options(vm_id, &[VmOption::new(BOOT_SLOT, alternate.clone())])
                .await?;
            Ok(alternate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::params::{resolve, RawProvisionArgs};

    #[test]
    fn test_vm_spec_from_request() {
        let key = tempfile::NamedTempFile::new().unwrap();
        let request = resolve(
            &RawProvisionArgs {
                vm_name: Some("db_1".into()),
                ip: Some("192.168.3.60".into()),
                user: Some("ops".into()),
                password: Some("pw".into()),
                memory: Some("4096".into()),
                cpu: Some("4".into()),
                bridge: Some("vmbr1".into()),
                ssh_key: Some(key.path().to_path_buf()),
                ..RawProvisionArgs::default()
            },
            &PlatformConfig::default(),
        )
        .unwrap();

        let spec = vm_spec(120, &request);
        assert_eq!(spec.id, 120);
        assert_eq!(spec.name, "db-1");
        assert_eq!(spec.memory_mb, 4096);
        assert_eq!(spec.cores, 4);
        assert_eq!(spec.net0(), "virtio,bridge=vmbr1");
    }
}
