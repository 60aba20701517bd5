//! Hypervisor trait and the VM/storage types it works with.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Bus slot of the boot disk.
pub const BOOT_SLOT: &str = "scsi0";

/// Bus slot of the cloud-init drive.
pub const CLOUDINIT_SLOT: &str = "ide2";

/// Arguments for creating the empty VM shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    /// Cluster-unique VM id.
    pub id: u32,
    /// VM name (DNS safe).
    pub name: String,
    /// Memory in MB.
    pub memory_mb: u32,
    /// vCPU count.
    pub cores: u32,
    /// Bridge for `net0`.
    pub bridge: String,
    /// NIC model for `net0`.
    pub nic_model: String,
}

impl VmSpec {
    /// `net0` value, e.g. `virtio,bridge=vmbr0`.
    #[must_use]
    pub fn net0(&self) -> String {
        format!("{},bridge={}", self.nic_model, self.bridge)
    }
}

/// A single `qm set` option, rendered as `--<key> <value>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmOption {
    pub key: String,
    pub value: String,
}

impl VmOption {
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Storage backend type as reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    Dir,
    Nfs,
    Cifs,
    Btrfs,
    GlusterFs,
    ZfsPool,
    LvmThin,
    Lvm,
    Rbd,
    Iscsi,
    /// Any backend this tool has no specific knowledge of.
    Other(String),
}

impl StorageKind {
    /// Map the `type` field of a storage description.
    #[must_use]
    pub fn from_type(kind: &str) -> Self {
        match kind.to_ascii_lowercase().as_str() {
            "dir" => Self::Dir,
            "nfs" => Self::Nfs,
            "cifs" => Self::Cifs,
            "btrfs" => Self::Btrfs,
            "glusterfs" => Self::GlusterFs,
            "zfspool" | "zfs" => Self::ZfsPool,
            "lvmthin" => Self::LvmThin,
            "lvm" => Self::Lvm,
            "rbd" => Self::Rbd,
            "iscsi" | "iscsidirect" => Self::Iscsi,
            other => Self::Other(other.to_string()),
        }
    }

    /// Block-backed pools name volumes `vm-<id>-disk-N` without a per-VM
    /// directory or file extension.
    #[must_use]
    pub fn is_block_backed(&self) -> bool {
        matches!(
            self,
            Self::ZfsPool | Self::LvmThin | Self::Lvm | Self::Rbd | Self::Iscsi
        )
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dir => write!(f, "dir"),
            Self::Nfs => write!(f, "nfs"),
            Self::Cifs => write!(f, "cifs"),
            Self::Btrfs => write!(f, "btrfs"),
            Self::GlusterFs => write!(f, "glusterfs"),
            Self::ZfsPool => write!(f, "zfspool"),
            Self::LvmThin => write!(f, "lvmthin"),
            Self::Lvm => write!(f, "lvm"),
            Self::Rbd => write!(f, "rbd"),
            Self::Iscsi => write!(f, "iscsi"),
            Self::Other(kind) => write!(f, "{kind}"),
        }
    }
}

/// Volume naming scheme of an imported disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeLayout {
    /// `<storage>:vm-<id>-disk-<n>`
    Block,
    /// `<storage>:<id>/vm-<id>-disk-<n>.raw`
    File,
}

impl VolumeLayout {
    #[must_use]
    pub fn for_kind(kind: &StorageKind) -> Self {
        if kind.is_block_backed() {
            Self::Block
        } else {
            Self::File
        }
    }

    #[must_use]
    pub fn alternate(self) -> Self {
        match self {
            Self::Block => Self::File,
            Self::File => Self::Block,
        }
    }

    /// Volume id of disk `index` for VM `vm_id` on `storage`.
    #[must_use]
    pub fn volume_id(self, storage: &str, vm_id: u32, index: u32) -> String {
        match self {
            Self::Block => format!("{storage}:vm-{vm_id}-disk-{index}"),
            Self::File => format!("{storage}:{vm_id}/vm-{vm_id}-disk-{index}.raw"),
        }
    }
}

/// Operations the provisioning workflow needs from the hypervisor.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Ask the cluster for the next free VM id.
    async fn next_vm_id(&self) -> Result<u32>;

    /// Whether a VM with this id exists.
    async fn vm_exists(&self, id: u32) -> Result<bool>;

    /// Create an empty VM shell.
    async fn create_vm(&self, spec: &VmSpec) -> Result<()>;

    /// Import a disk image into `storage` as an unused disk of the VM.
    async fn import_disk(&self, id: u32, image: &Path, storage: &str) -> Result<()>;

    /// Look up the backend type of a storage pool.
    async fn describe_storage(&self, storage: &str) -> Result<StorageKind>;

    /// Apply configuration options to the VM (`qm set`).
    async fn set_options(&self, id: u32, options: &[VmOption]) -> Result<()>;

    /// Grow a disk to `size_gb`.
    async fn resize_disk(&self, id: u32, slot: &str, size_gb: u32) -> Result<()>;

    /// Start the VM.
    async fn start_vm(&self, id: u32) -> Result<()>;

    /// Stop the VM immediately.
    async fn stop_vm(&self, id: u32) -> Result<()>;

    /// Destroy the VM and purge it from all configuration.
    async fn destroy_vm(&self, id: u32) -> Result<()>;
}
